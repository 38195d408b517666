use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use skillbridge_common::AppError;

use crate::engine::EngineContext;
use crate::messages::SystemEvent;
use crate::models::{Contract, ContractStatus, MessageCard, Session, SessionStatus};
use crate::store::ChangeSet;

/// Result of deriving a contract's progress from its sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressChange {
    pub completed_before: u32,
    pub completed_after: u32,
    pub contract_completed: bool,
}

impl ProgressChange {
    pub fn is_noop(&self) -> bool {
        self.completed_before == self.completed_after && !self.contract_completed
    }
}

/// Recounts completed sessions onto `contract` and closes it when every
/// session is done. The count may only grow; a lower recount means the
/// session rows were changed behind the engine's back.
pub fn recompute(
    contract: &mut Contract,
    sessions: &[Session],
    now: DateTime<Utc>,
) -> Result<ProgressChange, AppError> {
    let completed = sessions
        .iter()
        .filter(|session| session.proposal_id == contract.proposal_id)
        .filter(|session| session.status == SessionStatus::Completed)
        .count();
    let completed = u32::try_from(completed)
        .map_err(|_| AppError::Consistency(format!("contract {} has too many sessions", contract.id)))?;

    if completed < contract.completed_sessions {
        return Err(AppError::Consistency(format!(
            "contract {} would drop from {} to {} completed sessions",
            contract.contract_number, contract.completed_sessions, completed
        )));
    }
    if completed > contract.total_sessions {
        return Err(AppError::Consistency(format!(
            "contract {} has {} completed sessions but only {} in total",
            contract.contract_number, completed, contract.total_sessions
        )));
    }

    let completed_before = contract.completed_sessions;
    contract.completed_sessions = completed;

    let contract_completed =
        completed == contract.total_sessions && contract.status == ContractStatus::Active;
    if contract_completed {
        contract.status = ContractStatus::Completed;
        contract.end_date = Some(now.date_naive());
    }

    let change = ProgressChange {
        completed_before,
        completed_after: completed,
        contract_completed,
    };
    if !change.is_noop() {
        contract.updated_at = now;
    }
    Ok(change)
}

/// Cards announcing a finished contract.
pub fn completion_notices(contract: &Contract, change: &ProgressChange, now: DateTime<Utc>) -> Vec<MessageCard> {
    if !change.contract_completed {
        return Vec::new();
    }
    MessageCard::system_to_both(
        contract,
        SystemEvent::ContractCompleted,
        &format!("All {} sessions of {} are complete", contract.total_sessions, contract.contract_number),
        None,
        now,
    )
}

#[derive(Clone)]
pub struct ProgressAggregator {
    ctx: EngineContext,
}

impl ProgressAggregator {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Recomputes one contract and persists the result when it moved.
    pub async fn refresh(&self, contract_id: Uuid) -> Result<ProgressChange, AppError> {
        let (contract, change) = self.ctx.with_retry(|| self.try_refresh(contract_id)).await?;

        if !change.is_noop() {
            tracing::info!(
                contract_id = %contract.id,
                completed = change.completed_after,
                total = contract.total_sessions,
                contract_completed = change.contract_completed,
                "Contract progress updated"
            );
            self.ctx
                .outbox
                .deliver(completion_notices(&contract, &change, self.ctx.now()))
                .await;
        }
        Ok(change)
    }

    async fn try_refresh(&self, contract_id: Uuid) -> Result<(Contract, ProgressChange), AppError> {
        let store = &self.ctx.store;
        let mut contract = store.require_contract(contract_id).await?;
        let sessions = store.sessions_for_proposal(contract.proposal_id).await?;
        let change = recompute(&mut contract, &sessions, self.ctx.now())?;

        if !change.is_noop() {
            let mut changes = ChangeSet::new();
            changes.update_contract(&mut contract);
            store.commit(changes).await?;
        }
        Ok((contract, change))
    }
}
