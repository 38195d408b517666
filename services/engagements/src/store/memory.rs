use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::RwLock;
use uuid::Uuid;

use skillbridge_common::AppError;

use crate::models::{
    Contract, ContractStatus, MessageCard, PaymentRecord, PaymentRecordStatus, ProcessedEvent,
    ProviderEventKind, Proposal, ScheduledSession, Session,
};

use super::{
    check_contract_invariants, check_proposal_invariants, check_session_invariants, ChangeSet,
    EngagementStore, SessionScan, Versioned, Write,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    proposals: HashMap<Uuid, Proposal>,
    contracts: HashMap<Uuid, Contract>,
    sessions: HashMap<Uuid, Session>,
    scheduled_sessions: HashMap<Uuid, ScheduledSession>,
    payment_records: HashMap<Uuid, PaymentRecord>,
    events: HashMap<String, ProcessedEvent>,
    messages: Vec<MessageCard>,
}

/// In-process store for development and tests. A commit stages its writes on a
/// copy of the tables and swaps it in only when every check passes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply<T: Versioned>(
    table: &mut HashMap<Uuid, T>,
    write: &Write<T>,
    kind: &'static str,
) -> Result<(), AppError> {
    match write {
        Write::Insert(entity) => {
            if table.contains_key(&entity.id()) {
                return Err(AppError::Conflict(format!("{} {} already exists", kind, entity.id())));
            }
            table.insert(entity.id(), entity.clone());
        }
        Write::Update(entity) => {
            let stored = table
                .get(&entity.id())
                .ok_or_else(|| AppError::NotFound(format!("{} {} not found", kind, entity.id())))?;
            if stored.version() != entity.version() - 1 {
                return Err(AppError::Conflict(format!(
                    "{} {} was modified concurrently (stored version {}, expected {})",
                    kind,
                    entity.id(),
                    stored.version(),
                    entity.version() - 1
                )));
            }
            table.insert(entity.id(), entity.clone());
        }
    }
    Ok(())
}

impl Tables {
    fn check_unique_keys(&self, changes: &ChangeSet) -> Result<(), AppError> {
        for write in &changes.contracts {
            let contract = write.entity();
            let clash = self.contracts.values().any(|other| {
                other.id != contract.id
                    && (other.proposal_id == contract.proposal_id
                        || other.contract_number == contract.contract_number)
            });
            if clash {
                return Err(AppError::Conflict(format!(
                    "contract {} collides with an existing proposal or number",
                    contract.contract_number
                )));
            }
        }

        for write in &changes.sessions {
            let session = write.entity();
            let clash = self.sessions.values().any(|other| {
                other.id != session.id
                    && other.proposal_id == session.proposal_id
                    && other.session_number == session.session_number
            });
            if clash {
                return Err(AppError::Conflict(format!(
                    "session #{} already exists for proposal {}",
                    session.session_number, session.proposal_id
                )));
            }
        }

        for write in &changes.payment_records {
            let record = write.entity();
            let clash = self.payment_records.values().any(|other| {
                other.id != record.id
                    && ((record.status == PaymentRecordStatus::Succeeded
                        && other.status == PaymentRecordStatus::Succeeded
                        && other.contract_id == record.contract_id)
                        || (record.external_intent_id.is_some()
                            && other.external_intent_id == record.external_intent_id))
            });
            if clash {
                return Err(AppError::Conflict(format!(
                    "payment record {} collides with an existing record",
                    record.id
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl EngagementStore for MemoryStore {
    async fn proposal(&self, id: Uuid) -> Result<Option<Proposal>, AppError> {
        Ok(self.tables.read().await.proposals.get(&id).cloned())
    }

    async fn contract(&self, id: Uuid) -> Result<Option<Contract>, AppError> {
        Ok(self.tables.read().await.contracts.get(&id).cloned())
    }

    async fn contract_by_proposal(&self, proposal_id: Uuid) -> Result<Option<Contract>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .contracts
            .values()
            .find(|contract| contract.proposal_id == proposal_id)
            .cloned())
    }

    async fn last_contract_sequence(&self, date: NaiveDate) -> Result<u32, AppError> {
        let prefix = crate::contracts::contract_number_prefix(date);
        let tables = self.tables.read().await;
        Ok(tables
            .contracts
            .values()
            .filter_map(|contract| contract.contract_number.strip_prefix(&prefix))
            .filter_map(|sequence| sequence.parse::<u32>().ok())
            .max()
            .unwrap_or(0))
    }

    async fn session(&self, id: Uuid) -> Result<Option<Session>, AppError> {
        Ok(self.tables.read().await.sessions.get(&id).cloned())
    }

    async fn sessions_for_proposal(&self, proposal_id: Uuid) -> Result<Vec<Session>, AppError> {
        let tables = self.tables.read().await;
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|session| session.proposal_id == proposal_id)
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.session_number);
        Ok(sessions)
    }

    async fn scheduled_session(&self, id: Uuid) -> Result<Option<ScheduledSession>, AppError> {
        Ok(self.tables.read().await.scheduled_sessions.get(&id).cloned())
    }

    async fn scheduled_sessions_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ScheduledSession>, AppError> {
        let tables = self.tables.read().await;
        let mut instances: Vec<ScheduledSession> = tables
            .scheduled_sessions
            .values()
            .filter(|instance| instance.session_id == session_id)
            .cloned()
            .collect();
        instances.sort_by_key(|instance| (instance.created_at, instance.id));
        Ok(instances)
    }

    async fn payment_record_by_intent(&self, intent_id: &str) -> Result<Option<PaymentRecord>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .payment_records
            .values()
            .find(|record| record.external_intent_id.as_deref() == Some(intent_id))
            .cloned())
    }

    async fn payment_records_for_contract(&self, contract_id: Uuid) -> Result<Vec<PaymentRecord>, AppError> {
        let tables = self.tables.read().await;
        let mut records: Vec<PaymentRecord> = tables
            .payment_records
            .values()
            .filter(|record| record.contract_id == contract_id)
            .cloned()
            .collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    async fn processed_event(&self, event_id: &str) -> Result<Option<ProcessedEvent>, AppError> {
        Ok(self.tables.read().await.events.get(event_id).cloned())
    }

    async fn processed_event_for(
        &self,
        intent_id: &str,
        kind: ProviderEventKind,
    ) -> Result<Option<ProcessedEvent>, AppError> {
        let tables = self.tables.read().await;
        Ok(tables
            .events
            .values()
            .find(|event| event.external_intent_id == intent_id && event.kind == kind)
            .cloned())
    }

    async fn scan_sessions(&self, scan: &SessionScan) -> Result<Vec<Session>, AppError> {
        let tables = self.tables.read().await;
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|session| scan.matches(session))
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.id);
        sessions.truncate(scan.limit);
        Ok(sessions)
    }

    async fn scan_contracts(
        &self,
        statuses: &[ContractStatus],
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Contract>, AppError> {
        let tables = self.tables.read().await;
        let mut contracts: Vec<Contract> = tables
            .contracts
            .values()
            .filter(|contract| statuses.is_empty() || statuses.contains(&contract.status))
            .filter(|contract| after.map_or(true, |after| contract.id > after))
            .cloned()
            .collect();
        contracts.sort_by_key(|contract| contract.id);
        contracts.truncate(limit);
        Ok(contracts)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), AppError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();

        for write in &changes.proposals {
            check_proposal_invariants(write.entity())?;
            apply(&mut staged.proposals, write, "proposal")?;
        }
        for write in &changes.contracts {
            check_contract_invariants(write.entity())?;
            apply(&mut staged.contracts, write, "contract")?;
        }
        for write in &changes.sessions {
            check_session_invariants(write.entity())?;
            apply(&mut staged.sessions, write, "session")?;
        }
        for write in &changes.scheduled_sessions {
            apply(&mut staged.scheduled_sessions, write, "scheduled session")?;
        }
        for write in &changes.payment_records {
            apply(&mut staged.payment_records, write, "payment record")?;
        }
        staged.check_unique_keys(&changes)?;

        for event in &changes.events {
            let duplicate = staged.events.contains_key(&event.event_id)
                || staged.events.values().any(|existing| {
                    existing.external_intent_id == event.external_intent_id && existing.kind == event.kind
                });
            if duplicate {
                return Err(AppError::Conflict(format!(
                    "provider event {} was already processed",
                    event.event_id
                )));
            }
            staged.events.insert(event.event_id.clone(), event.clone());
        }

        *tables = staged;
        Ok(())
    }

    async fn append_messages(&self, cards: &[MessageCard]) -> Result<(), AppError> {
        self.tables.write().await.messages.extend_from_slice(cards);
        Ok(())
    }

    async fn messages_for(
        &self,
        recipient_id: Uuid,
        before: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<MessageCard>, AppError> {
        let tables = self.tables.read().await;
        let newest_first = tables
            .messages
            .iter()
            .rev()
            .filter(|card| card.recipient_id == recipient_id);
        let cards = match before {
            Some(cursor) => newest_first
                .skip_while(|card| card.id != cursor)
                .skip(1)
                .take(limit)
                .cloned()
                .collect(),
            None => newest_first.take(limit).cloned().collect(),
        };
        Ok(cards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageType, ProposalStatus, SessionStatus};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn proposal() -> Proposal {
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
        Proposal::per_session(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 2, dec!(25), 30, now)
    }

    #[tokio::test]
    async fn stale_update_is_rejected_and_nothing_is_applied() {
        let store = MemoryStore::new();
        let proposal = proposal();
        let mut seed = ChangeSet::new();
        seed.insert_proposal(proposal.clone());
        store.commit(seed).await.unwrap();

        let mut first = proposal.clone();
        first.status = ProposalStatus::Withdrawn;
        let mut winner = ChangeSet::new();
        winner.update_proposal(&mut first);
        store.commit(winner).await.unwrap();

        let mut second = proposal.clone();
        second.status = ProposalStatus::Rejected;
        let mut other = second.clone();
        other.id = Uuid::new_v4();
        let mut loser = ChangeSet::new();
        loser.insert_proposal(other.clone());
        loser.update_proposal(&mut second);
        let err = store.commit(loser).await.unwrap_err();

        assert!(matches!(err, AppError::Conflict(_)));
        let stored = store.proposal(proposal.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ProposalStatus::Withdrawn);
        assert_eq!(stored.version, 2);
        assert!(store.proposal(other.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invariant_violations_are_consistency_errors() {
        let store = MemoryStore::new();
        let mut proposal = proposal();
        proposal.status = ProposalStatus::Accepted;
        let mut changes = ChangeSet::new();
        changes.insert_proposal(proposal);

        let err = store.commit(changes).await.unwrap_err();
        assert!(matches!(err, AppError::Consistency(_)));
    }

    #[tokio::test]
    async fn scan_pages_by_id() {
        let store = MemoryStore::new();
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
        let proposal = proposal();
        let mut changes = ChangeSet::new();
        changes.insert_proposal(proposal.clone());
        for number in 1..=5 {
            changes.insert_session(Session {
                id: Uuid::new_v4(),
                contract_id: Uuid::new_v4(),
                proposal_id: proposal.id,
                session_number: number,
                scheduled_at: None,
                original_scheduled_at: None,
                duration_minutes: 30,
                status: SessionStatus::Unscheduled,
                reschedule_requested: false,
                reschedule_requested_by: None,
                reschedule_reason: None,
                reschedule_proposed_time: None,
                reschedule_deadline: None,
                reschedule_status: None,
                meeting_started_at: None,
                meeting_ended_at: None,
                auto_activated: false,
                ready_notified: false,
                reminder_sent: false,
                reminder_1h_sent: false,
                early_join_enabled: true,
                early_join_window_minutes: 15,
                grace_minutes: 10,
                buffer_minutes: 0,
                cancellation_reason: None,
                created_at: now,
                updated_at: now,
                version: 1,
            });
        }
        store.commit(changes).await.unwrap();

        let mut scan = SessionScan {
            statuses: vec![SessionStatus::Unscheduled],
            limit: 2,
            ..SessionScan::default()
        };
        let mut seen = Vec::new();
        loop {
            let page = store.scan_sessions(&scan).await.unwrap();
            if page.is_empty() {
                break;
            }
            scan.after = page.last().map(|session| session.id);
            seen.extend(page.into_iter().map(|session| session.session_number));
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn messages_page_newest_first() {
        let store = MemoryStore::new();
        let recipient = Uuid::new_v4();
        let start = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
        let cards: Vec<MessageCard> = (0..3)
            .map(|n| MessageCard {
                id: Uuid::new_v4(),
                message_type: MessageType::System,
                payload: serde_json::json!({ "n": n }),
                sender_id: None,
                recipient_id: recipient,
                contract_id: None,
                created_at: start + chrono::Duration::minutes(n),
            })
            .collect();
        store.append_messages(&cards).await.unwrap();

        let first = store.messages_for(recipient, None, 2).await.unwrap();
        assert_eq!(first.iter().map(|card| card.payload["n"].clone()).collect::<Vec<_>>(), vec![2, 1]);

        let cursor = first.last().map(|card| card.id);
        let rest = store.messages_for(recipient, cursor, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload["n"], 0);

        assert!(store.messages_for(Uuid::new_v4(), None, 2).await.unwrap().is_empty());
    }
}
