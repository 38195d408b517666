pub mod memory;
pub mod postgres;

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use skillbridge_common::AppError;

use crate::models::{
    Contract, ContractStatus, MessageCard, PaymentRecord, ProcessedEvent, ProviderEventKind,
    Proposal, ScheduledSession, Session, SessionStatus,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A staged row write. Updates carry the already-bumped version; the store
/// accepts them only when the stored row is exactly one version behind.
#[derive(Debug, Clone)]
pub enum Write<T> {
    Insert(T),
    Update(T),
}

impl<T> Write<T> {
    pub fn entity(&self) -> &T {
        match self {
            Write::Insert(entity) | Write::Update(entity) => entity,
        }
    }
}

pub trait Versioned: Clone {
    fn id(&self) -> Uuid;
    fn version(&self) -> i64;
    fn set_version(&mut self, version: i64);
}

macro_rules! versioned {
    ($($entity:ty),+) => {
        $(impl Versioned for $entity {
            fn id(&self) -> Uuid {
                self.id
            }

            fn version(&self) -> i64 {
                self.version
            }

            fn set_version(&mut self, version: i64) {
                self.version = version;
            }
        })+
    };
}

versioned!(Proposal, Contract, Session, ScheduledSession, PaymentRecord);

/// One logical operation's writes, applied all-or-nothing by [`EngagementStore::commit`].
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub proposals: Vec<Write<Proposal>>,
    pub contracts: Vec<Write<Contract>>,
    pub sessions: Vec<Write<Session>>,
    pub scheduled_sessions: Vec<Write<ScheduledSession>>,
    pub payment_records: Vec<Write<PaymentRecord>>,
    pub events: Vec<ProcessedEvent>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
            && self.contracts.is_empty()
            && self.sessions.is_empty()
            && self.scheduled_sessions.is_empty()
            && self.payment_records.is_empty()
            && self.events.is_empty()
    }

    pub fn insert_proposal(&mut self, proposal: Proposal) {
        self.proposals.push(Write::Insert(proposal));
    }

    pub fn update_proposal(&mut self, proposal: &mut Proposal) {
        stage_update(&mut self.proposals, proposal);
    }

    pub fn insert_contract(&mut self, contract: Contract) {
        self.contracts.push(Write::Insert(contract));
    }

    pub fn update_contract(&mut self, contract: &mut Contract) {
        stage_update(&mut self.contracts, contract);
    }

    pub fn insert_session(&mut self, session: Session) {
        self.sessions.push(Write::Insert(session));
    }

    pub fn update_session(&mut self, session: &mut Session) {
        stage_update(&mut self.sessions, session);
    }

    pub fn insert_scheduled_session(&mut self, scheduled: ScheduledSession) {
        self.scheduled_sessions.push(Write::Insert(scheduled));
    }

    pub fn update_scheduled_session(&mut self, scheduled: &mut ScheduledSession) {
        stage_update(&mut self.scheduled_sessions, scheduled);
    }

    pub fn insert_payment_record(&mut self, record: PaymentRecord) {
        self.payment_records.push(Write::Insert(record));
    }

    pub fn update_payment_record(&mut self, record: &mut PaymentRecord) {
        stage_update(&mut self.payment_records, record);
    }

    pub fn record_event(&mut self, event: ProcessedEvent) {
        self.events.push(event);
    }
}

/// Bumps the entity's version once per change set. Restaging an entity that is
/// already in the set replaces the staged copy without a second bump.
fn stage_update<T: Versioned>(writes: &mut Vec<Write<T>>, entity: &mut T) {
    let id = entity.id();
    if let Some(staged) = writes.iter_mut().find(|write| write.entity().id() == id) {
        match staged {
            Write::Insert(existing) => {
                entity.set_version(existing.version());
                *existing = entity.clone();
            }
            Write::Update(existing) => {
                entity.set_version(existing.version());
                *existing = entity.clone();
            }
        }
        return;
    }

    entity.set_version(entity.version() + 1);
    writes.push(Write::Update(entity.clone()));
}

/// Page request over sessions for tick sweeps. Results are ordered by id and
/// start strictly after `after`.
#[derive(Debug, Clone, Default)]
pub struct SessionScan {
    /// Empty means any status.
    pub statuses: Vec<SessionStatus>,
    /// `scheduled_at >= scheduled_from`
    pub scheduled_from: Option<DateTime<Utc>>,
    /// `scheduled_at < scheduled_before`
    pub scheduled_before: Option<DateTime<Utc>>,
    pub reschedule_pending: bool,
    /// Only rows carrying a reminder or ready flag.
    pub flagged: bool,
    pub after: Option<Uuid>,
    pub limit: usize,
}

impl SessionScan {
    pub fn matches(&self, session: &Session) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&session.status) {
            return false;
        }
        if let Some(after) = self.after {
            if session.id <= after {
                return false;
            }
        }
        if self.scheduled_from.is_some() || self.scheduled_before.is_some() {
            let Some(scheduled_at) = session.scheduled_at else {
                return false;
            };
            if self.scheduled_from.is_some_and(|from| scheduled_at < from) {
                return false;
            }
            if self.scheduled_before.is_some_and(|before| scheduled_at >= before) {
                return false;
            }
        }
        if self.reschedule_pending && !session.reschedule_requested {
            return false;
        }
        if self.flagged && !(session.ready_notified || session.reminder_sent || session.reminder_1h_sent) {
            return false;
        }
        true
    }
}

#[async_trait]
pub trait EngagementStore: Send + Sync {
    async fn proposal(&self, id: Uuid) -> Result<Option<Proposal>, AppError>;

    async fn contract(&self, id: Uuid) -> Result<Option<Contract>, AppError>;

    async fn contract_by_proposal(&self, proposal_id: Uuid) -> Result<Option<Contract>, AppError>;

    /// Highest `NNNN` already issued for `CTR-YYYYMMDD-NNNN` on `date`, or 0.
    async fn last_contract_sequence(&self, date: NaiveDate) -> Result<u32, AppError>;

    async fn session(&self, id: Uuid) -> Result<Option<Session>, AppError>;

    /// Sessions of a proposal ordered by session number.
    async fn sessions_for_proposal(&self, proposal_id: Uuid) -> Result<Vec<Session>, AppError>;

    async fn scheduled_session(&self, id: Uuid) -> Result<Option<ScheduledSession>, AppError>;

    /// Meeting instances of a session, oldest first.
    async fn scheduled_sessions_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ScheduledSession>, AppError>;

    async fn payment_record_by_intent(&self, intent_id: &str) -> Result<Option<PaymentRecord>, AppError>;

    async fn payment_records_for_contract(&self, contract_id: Uuid) -> Result<Vec<PaymentRecord>, AppError>;

    async fn processed_event(&self, event_id: &str) -> Result<Option<ProcessedEvent>, AppError>;

    async fn processed_event_for(
        &self,
        intent_id: &str,
        kind: ProviderEventKind,
    ) -> Result<Option<ProcessedEvent>, AppError>;

    async fn scan_sessions(&self, scan: &SessionScan) -> Result<Vec<Session>, AppError>;

    /// Contracts in `statuses`, ordered by id, strictly after `after`.
    async fn scan_contracts(
        &self,
        statuses: &[ContractStatus],
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Contract>, AppError>;

    /// Applies every write or none. Stale versions and unique-key collisions
    /// fail with [`AppError::Conflict`].
    async fn commit(&self, changes: ChangeSet) -> Result<(), AppError>;

    async fn append_messages(&self, cards: &[MessageCard]) -> Result<(), AppError>;

    /// Cards addressed to `recipient_id`, newest first. `before` pages past
    /// an earlier card id.
    async fn messages_for(
        &self,
        recipient_id: Uuid,
        before: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<MessageCard>, AppError>;

    async fn require_proposal(&self, id: Uuid) -> Result<Proposal, AppError> {
        self.proposal(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Proposal {} not found", id)))
    }

    async fn require_contract(&self, id: Uuid) -> Result<Contract, AppError> {
        self.contract(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Contract {} not found", id)))
    }

    async fn require_session(&self, id: Uuid) -> Result<Session, AppError> {
        self.session(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Session {} not found", id)))
    }

    async fn require_scheduled_session(&self, id: Uuid) -> Result<ScheduledSession, AppError> {
        self.scheduled_session(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Scheduled session {} not found", id)))
    }
}

/// Re-runs a read-modify-write operation while it loses optimistic races.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut operation: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Err(err) if err.is_retryable() && attempt < attempts => {
                tracing::debug!(attempt, error = %err, "Retrying after concurrent update");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Row-level invariants the Postgres schema enforces with CHECK constraints.
pub(crate) fn check_contract_invariants(contract: &Contract) -> Result<(), AppError> {
    use crate::models::PaymentStatus;

    if contract.status == ContractStatus::Active && contract.payment_status != PaymentStatus::Paid {
        return Err(AppError::Consistency(format!(
            "contract {} is active but payment is {}",
            contract.contract_number, contract.payment_status
        )));
    }
    if contract.status == ContractStatus::Completed && contract.completed_sessions != contract.total_sessions {
        return Err(AppError::Consistency(format!(
            "contract {} is completed with {}/{} sessions",
            contract.contract_number, contract.completed_sessions, contract.total_sessions
        )));
    }
    if contract.completed_sessions > contract.total_sessions {
        return Err(AppError::Consistency(format!(
            "contract {} counts more completed sessions than it has",
            contract.contract_number
        )));
    }
    if contract.paid_amount > contract.total_amount {
        return Err(AppError::Consistency(format!(
            "contract {} is overpaid",
            contract.contract_number
        )));
    }
    Ok(())
}

pub(crate) fn check_session_invariants(session: &Session) -> Result<(), AppError> {
    if session.status == SessionStatus::Active && session.meeting_started_at.is_none() {
        return Err(AppError::Consistency(format!("session {} is active without a start time", session.id)));
    }
    if session.status == SessionStatus::Completed {
        match (session.meeting_started_at, session.meeting_ended_at) {
            (Some(started), Some(ended)) if ended >= started => {}
            _ => {
                return Err(AppError::Consistency(format!(
                    "session {} is completed without a valid meeting interval",
                    session.id
                )))
            }
        }
    }
    if session.reschedule_requested
        && (session.reschedule_requested_by.is_none()
            || session.reschedule_status != Some(crate::models::RescheduleStatus::Pending))
    {
        return Err(AppError::Consistency(format!(
            "session {} has a reschedule request without a pending requester",
            session.id
        )));
    }
    Ok(())
}

pub(crate) fn check_proposal_invariants(proposal: &Proposal) -> Result<(), AppError> {
    let accepted = proposal.status == crate::models::ProposalStatus::Accepted;
    if accepted != proposal.accepted_at.is_some() {
        return Err(AppError::Consistency(format!(
            "proposal {} has status {} but accepted_at {:?}",
            proposal.id, proposal.status, proposal.accepted_at
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Proposal;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn proposal() -> Proposal {
        let now = Utc.with_ymd_and_hms(2025, 1, 10, 8, 0, 0).unwrap();
        Proposal::per_session(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 2, dec!(25), 30, now)
    }

    #[test]
    fn restaging_an_entity_bumps_its_version_once() {
        let mut changes = ChangeSet::new();
        let mut proposal = proposal();
        assert_eq!(proposal.version, 1);

        changes.update_proposal(&mut proposal);
        proposal.total_price = dec!(60);
        changes.update_proposal(&mut proposal);

        assert_eq!(proposal.version, 2);
        assert_eq!(changes.proposals.len(), 1);
        assert_eq!(changes.proposals[0].entity().total_price, dec!(60));
    }

    #[test]
    fn updating_a_staged_insert_keeps_it_an_insert() {
        let mut changes = ChangeSet::new();
        let mut proposal = proposal();
        changes.insert_proposal(proposal.clone());
        changes.update_proposal(&mut proposal);

        assert_eq!(proposal.version, 1);
        assert!(matches!(changes.proposals[0], Write::Insert(_)));
    }

    #[tokio::test]
    async fn conflicts_are_retried_up_to_the_limit() {
        let calls = AtomicU32::new(0);
        let result: Result<(), AppError> = retry_on_conflict(3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Conflict("stale".into()))
        })
        .await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), AppError> = retry_on_conflict(3, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Precondition("unpaid".into()))
        })
        .await;

        assert!(matches!(result, Err(AppError::Precondition(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
