use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use skillbridge_common::{AppError, Party};

use crate::config::LifecyclePolicy;
use crate::engine::EngineContext;
use crate::messages::SystemEvent;
use crate::models::{
    Contract, ContractStatus, MessageCard, PaymentStatus, Proposal, ProposalStatus, Session,
    SessionStatus,
};
use crate::store::ChangeSet;

const MAX_DAILY_SEQUENCE: u32 = 9999;

/// Terms the student supplies when accepting a proposal.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ContractTerms {
    pub start_date: NaiveDate,
    #[validate(length(min = 1, max = 64))]
    pub timezone: String,
    #[validate(length(max = 2000))]
    pub cancellation_policy: Option<String>,
    #[validate(length(max = 2000))]
    pub learning_outcomes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContractDetails {
    pub contract: Contract,
    pub sessions: Vec<Session>,
}

pub fn contract_number_prefix(date: NaiveDate) -> String {
    format!("CTR-{}-", date.format("%Y%m%d"))
}

pub fn format_contract_number(date: NaiveDate, sequence: u32) -> Result<String, AppError> {
    if sequence == 0 || sequence > MAX_DAILY_SEQUENCE {
        return Err(AppError::Precondition(format!(
            "no contract numbers left for {}",
            date.format("%Y-%m-%d")
        )));
    }
    Ok(format!("{}{:04}", contract_number_prefix(date), sequence))
}

/// `CTR-YYYYMMDD-NNNN`
pub fn is_contract_number(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 17
        && value.starts_with("CTR-")
        && bytes[12] == b'-'
        && bytes[4..12].iter().all(u8::is_ascii_digit)
        && bytes[13..].iter().all(u8::is_ascii_digit)
}

/// Accepts names from the IANA zone database. Zones are only stored for
/// display; all arithmetic happens in UTC.
pub fn validate_timezone(zone: &str) -> Result<(), AppError> {
    zone.parse::<chrono_tz::Tz>()
        .map(|_| ())
        .map_err(|_| AppError::Validation(format!("'{}' is not an IANA time zone name", zone)))
}

pub fn draft_contract(
    proposal: &Proposal,
    start_date: NaiveDate,
    timezone: &str,
    cancellation_policy: Option<String>,
    learning_outcomes: Option<String>,
    contract_number: String,
    now: DateTime<Utc>,
) -> Result<Contract, AppError> {
    if proposal.session_count == 0 {
        return Err(AppError::Precondition(format!("proposal {} has no sessions", proposal.id)));
    }

    Ok(Contract {
        id: Uuid::new_v4(),
        proposal_id: proposal.id,
        student_id: proposal.student_id,
        coach_id: proposal.coach_id,
        contract_number,
        start_date,
        end_date: None,
        total_sessions: proposal.session_count,
        completed_sessions: 0,
        total_amount: proposal.contract_total()?,
        paid_amount: Decimal::ZERO,
        rate: proposal.contract_rate(),
        duration_minutes: proposal.session_duration_minutes,
        timezone: timezone.to_string(),
        cancellation_policy,
        learning_outcomes,
        status: ContractStatus::Pending,
        payment_status: PaymentStatus::Pending,
        payment_intent_reference: None,
        accepted_at: None,
        declined_at: None,
        payment_completed_at: None,
        created_at: now,
        updated_at: now,
        version: 1,
    })
}

/// Sessions #1..#total_sessions, all unscheduled.
pub fn seed_sessions(contract: &Contract, policy: &LifecyclePolicy, now: DateTime<Utc>) -> Vec<Session> {
    (1..=contract.total_sessions)
        .map(|session_number| Session {
            id: Uuid::new_v4(),
            contract_id: contract.id,
            proposal_id: contract.proposal_id,
            session_number,
            scheduled_at: None,
            original_scheduled_at: None,
            duration_minutes: contract.duration_minutes,
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
            early_join_window_minutes: policy.early_join_minutes,
            grace_minutes: policy.grace_minutes,
            buffer_minutes: 0,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
            version: 1,
        })
        .collect()
}

#[derive(Clone)]
pub struct ContractService {
    ctx: EngineContext,
}

impl ContractService {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Turns a pending proposal into a contract with its unscheduled sessions.
    /// Repeating the call for an already converted proposal returns the
    /// existing contract unchanged.
    pub async fn accept_proposal(
        &self,
        proposal_id: Uuid,
        actor: Uuid,
        terms: ContractTerms,
    ) -> Result<ContractDetails, AppError> {
        terms
            .validate()
            .map_err(|e| AppError::Validation(e.to_string()))?;
        validate_timezone(&terms.timezone)?;

        let (details, created) = self
            .ctx
            .with_retry(|| self.try_accept_proposal(proposal_id, actor, &terms))
            .await?;

        if created {
            tracing::info!(
                proposal_id = %proposal_id,
                contract_id = %details.contract.id,
                contract_number = %details.contract.contract_number,
                sessions = details.sessions.len(),
                "Proposal accepted and contract created"
            );
            self.ctx
                .outbox
                .deliver(vec![MessageCard::contract_offer(&details.contract, self.ctx.now())])
                .await;
        }
        Ok(details)
    }

    async fn try_accept_proposal(
        &self,
        proposal_id: Uuid,
        actor: Uuid,
        terms: &ContractTerms,
    ) -> Result<(ContractDetails, bool), AppError> {
        let store = &self.ctx.store;
        let mut proposal = store.require_proposal(proposal_id).await?;
        if proposal.student_id != actor {
            return Err(AppError::Authorization(
                "Only the student who received the proposal can accept it".to_string(),
            ));
        }

        if let Some(contract) = store.contract_by_proposal(proposal_id).await? {
            let sessions = store.sessions_for_proposal(proposal_id).await?;
            return Ok((ContractDetails { contract, sessions }, false));
        }

        if proposal.status != ProposalStatus::Pending {
            return Err(AppError::Precondition(format!(
                "proposal {} is {} and cannot be accepted",
                proposal.id, proposal.status
            )));
        }

        let now = self.ctx.now();
        let sequence = store.last_contract_sequence(terms.start_date).await? + 1;
        let contract = draft_contract(
            &proposal,
            terms.start_date,
            &terms.timezone,
            terms.cancellation_policy.clone(),
            terms.learning_outcomes.clone(),
            format_contract_number(terms.start_date, sequence)?,
            now,
        )?;
        let sessions = seed_sessions(&contract, &self.ctx.policy, now);

        proposal.status = ProposalStatus::Accepted;
        proposal.accepted_at = Some(now);

        let mut changes = ChangeSet::new();
        changes.update_proposal(&mut proposal);
        changes.insert_contract(contract.clone());
        for session in &sessions {
            changes.insert_session(session.clone());
        }
        store.commit(changes).await?;

        Ok((ContractDetails { contract, sessions }, true))
    }

    /// The coach's answer to a contract offer.
    pub async fn respond_to_offer(
        &self,
        contract_id: Uuid,
        actor: Uuid,
        accept: bool,
    ) -> Result<Contract, AppError> {
        let (contract, cards) = self
            .ctx
            .with_retry(|| self.try_respond_to_offer(contract_id, actor, accept))
            .await?;

        tracing::info!(
            contract_id = %contract.id,
            accepted = accept,
            status = %contract.status,
            "Coach responded to contract offer"
        );
        self.ctx.outbox.deliver(cards).await;
        Ok(contract)
    }

    async fn try_respond_to_offer(
        &self,
        contract_id: Uuid,
        actor: Uuid,
        accept: bool,
    ) -> Result<(Contract, Vec<MessageCard>), AppError> {
        let store = &self.ctx.store;
        let mut contract = store.require_contract(contract_id).await?;
        if contract.require_party(actor)? != Party::Coach {
            return Err(AppError::Authorization("Only the coach can respond to an offer".to_string()));
        }

        let event = if accept { "accept" } else { "decline" };
        match contract.status {
            ContractStatus::Pending => {}
            ContractStatus::Accepted | ContractStatus::Active if accept => {
                return Ok((contract, Vec::new()));
            }
            ContractStatus::Declined if !accept => return Ok((contract, Vec::new())),
            other => return Err(AppError::invalid_transition("contract", other, event)),
        }

        let now = self.ctx.now();
        let mut changes = ChangeSet::new();
        let cards = if accept {
            contract.accepted_at = Some(now);
            contract.status = if contract.payment_status == PaymentStatus::Paid {
                ContractStatus::Active
            } else {
                ContractStatus::Accepted
            };
            vec![MessageCard::system(
                &contract,
                contract.student_id,
                SystemEvent::OfferAccepted,
                format!("Your coach accepted contract {}", contract.contract_number),
                None,
                now,
            )]
        } else {
            if contract.payment_status == PaymentStatus::Paid {
                return Err(AppError::Precondition(
                    "A paid contract must be refunded before it can be declined".to_string(),
                ));
            }
            contract.status = ContractStatus::Declined;
            contract.declined_at = Some(now);
            for mut session in store.sessions_for_proposal(contract.proposal_id).await? {
                if !session.status.is_terminal() {
                    session.cancel(Some("offer declined".to_string()), now)?;
                    changes.update_session(&mut session);
                }
            }
            vec![MessageCard::system(
                &contract,
                contract.student_id,
                SystemEvent::OfferDeclined,
                format!("Your coach declined contract {}", contract.contract_number),
                None,
                now,
            )]
        };

        contract.updated_at = now;
        changes.update_contract(&mut contract);
        store.commit(changes).await?;
        Ok((contract, cards))
    }

    /// Cancels the contract and every session that has not finished yet, in one commit.
    pub async fn cancel_contract(
        &self,
        contract_id: Uuid,
        actor: Uuid,
        reason: Option<String>,
    ) -> Result<ContractDetails, AppError> {
        let (details, cancelled_sessions) = self
            .ctx
            .with_retry(|| self.try_cancel_contract(contract_id, actor, reason.clone()))
            .await?;

        tracing::info!(
            contract_id = %details.contract.id,
            cancelled_sessions,
            "Contract cancelled"
        );
        let text = format!("Contract {} was cancelled", details.contract.contract_number);
        self.ctx
            .outbox
            .deliver(MessageCard::system_to_both(
                &details.contract,
                SystemEvent::ContractCancelled,
                &text,
                None,
                self.ctx.now(),
            ))
            .await;
        Ok(details)
    }

    async fn try_cancel_contract(
        &self,
        contract_id: Uuid,
        actor: Uuid,
        reason: Option<String>,
    ) -> Result<(ContractDetails, usize), AppError> {
        let store = &self.ctx.store;
        let mut contract = store.require_contract(contract_id).await?;
        contract.require_party(actor)?;
        if contract.status.is_terminal() {
            return Err(AppError::invalid_transition("contract", contract.status, "cancel"));
        }

        let now = self.ctx.now();
        let mut changes = ChangeSet::new();
        let mut sessions = store.sessions_for_proposal(contract.proposal_id).await?;
        let mut cancelled = 0;
        for session in sessions.iter_mut().filter(|session| !session.status.is_terminal()) {
            session.cancel(reason.clone().or_else(|| Some("contract cancelled".to_string())), now)?;
            changes.update_session(session);
            cancelled += 1;
        }

        contract.status = ContractStatus::Cancelled;
        contract.updated_at = now;
        changes.update_contract(&mut contract);
        store.commit(changes).await?;

        Ok((ContractDetails { contract, sessions }, cancelled))
    }

    /// Contract with its sessions, visible to either party.
    pub async fn details(&self, contract_id: Uuid, actor: Uuid) -> Result<ContractDetails, AppError> {
        let contract = self.ctx.store.require_contract(contract_id).await?;
        contract.require_party(actor)?;
        let sessions = self.ctx.store.sessions_for_proposal(contract.proposal_id).await?;
        Ok(ContractDetails { contract, sessions })
    }
}
