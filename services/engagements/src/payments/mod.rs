pub mod provider;
pub mod webhooks;

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use skillbridge_common::{AppError, Party};

use crate::engine::EngineContext;
use crate::messages::SystemEvent;
use crate::models::{
    round_money, Contract, ContractStatus, MessageCard, PaymentRecord, PaymentRecordStatus, PaymentStatus,
    ProcessedEvent, ProviderEventKind, SessionStatus,
};
use crate::store::ChangeSet;

use self::provider::PaymentProvider;
use self::webhooks::ProviderEvent;

/// Platform take rate on every contract payment.
pub const PLATFORM_FEE_RATE: Decimal = Decimal::from_parts(15, 0, 0, false, 2);

pub fn platform_fee(amount: Decimal) -> Decimal {
    round_money(amount * PLATFORM_FEE_RATE)
}

pub fn payout(amount: Decimal) -> Decimal {
    amount - platform_fee(amount)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PayoutPreview {
    pub amount: Decimal,
    pub platform_fee: Decimal,
    pub payout: Decimal,
}

impl PayoutPreview {
    pub fn for_amount(amount: Decimal) -> Self {
        Self {
            amount,
            platform_fee: platform_fee(amount),
            payout: payout(amount),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntentResponse {
    pub intent_id: String,
    pub client_secret: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub payment_record_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Applied,
    /// Already processed under this event id or intent and kind.
    Duplicate,
    /// Arrived after a transition that supersedes it.
    Stale,
    /// No payment record matches the event.
    Ignored,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Duplicate => "duplicate",
            EventOutcome::Stale => "stale",
            EventOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Clone)]
pub struct PaymentCoordinator {
    ctx: EngineContext,
    provider: Arc<dyn PaymentProvider>,
    currency: String,
}

impl PaymentCoordinator {
    pub fn new(ctx: EngineContext, provider: Arc<dyn PaymentProvider>, currency: String) -> Self {
        Self { ctx, provider, currency }
    }

    pub async fn payout_preview(&self, contract_id: Uuid, actor: Uuid) -> Result<PayoutPreview, AppError> {
        let contract = self.ctx.store.require_contract(contract_id).await?;
        contract.require_party(actor)?;
        Ok(PayoutPreview::for_amount(contract.total_amount))
    }

    /// Opens a payment attempt for the contract total.
    ///
    /// The pending record is committed before the provider is called, and the
    /// provider's answer is written back in a second commit.
    pub async fn create_payment_intent(
        &self,
        contract_id: Uuid,
        actor: Uuid,
    ) -> Result<PaymentIntentResponse, AppError> {
        let (contract, record) = self
            .ctx
            .with_retry(|| self.open_attempt(contract_id, actor))
            .await?;

        let metadata = HashMap::from([
            ("contract_id".to_string(), contract.id.to_string()),
            ("contract_number".to_string(), contract.contract_number.clone()),
            ("payment_record_id".to_string(), record.id.to_string()),
        ]);

        let intent = match self
            .provider
            .create_intent(record.amount, &self.currency, &record.id.to_string(), &metadata)
            .await
        {
            Ok(intent) => intent,
            Err(err) => {
                tracing::warn!(contract_id = %contract.id, payment_record_id = %record.id, error = %err, "Payment intent creation failed");
                if let Err(mark_err) = self.ctx.with_retry(|| self.mark_attempt_failed(contract.id, record.id)).await {
                    tracing::error!(payment_record_id = %record.id, error = %mark_err, "Failed to record payment failure");
                }
                return Err(err.into());
            }
        };

        self.ctx
            .with_retry(|| self.attach_intent(contract.id, record.id, &intent.id))
            .await?;

        tracing::info!(
            contract_id = %contract.id,
            payment_record_id = %record.id,
            intent_id = %intent.id,
            amount = %record.amount,
            "Payment intent created"
        );

        Ok(PaymentIntentResponse {
            intent_id: intent.id,
            client_secret: intent.client_secret,
            amount: record.amount,
            currency: self.currency.clone(),
            payment_record_id: record.id,
        })
    }

    async fn open_attempt(&self, contract_id: Uuid, actor: Uuid) -> Result<(Contract, PaymentRecord), AppError> {
        let contract = self.ctx.store.require_contract(contract_id).await?;
        if contract.require_party(actor)? != Party::Student {
            return Err(AppError::Authorization("Only the student can pay for a contract".to_string()));
        }
        if contract.payment_status == PaymentStatus::Paid {
            return Err(AppError::Precondition(format!(
                "contract {} is already paid",
                contract.contract_number
            )));
        }
        if contract.status.is_terminal() || contract.status == ContractStatus::Disputed {
            return Err(AppError::Precondition(format!(
                "contract {} is {} and cannot take payment",
                contract.contract_number, contract.status
            )));
        }

        let record = PaymentRecord {
            id: Uuid::new_v4(),
            contract_id: contract.id,
            amount: contract.total_amount,
            currency: self.currency.clone(),
            status: PaymentRecordStatus::Pending,
            external_intent_id: None,
            created_at: self.ctx.now(),
            settled_at: None,
            version: 1,
        };

        let mut changes = ChangeSet::new();
        changes.insert_payment_record(record.clone());
        self.ctx.store.commit(changes).await?;
        Ok((contract, record))
    }

    async fn attach_intent(&self, contract_id: Uuid, record_id: Uuid, intent_id: &str) -> Result<(), AppError> {
        let Some(mut record) = self.find_record(contract_id, record_id).await? else {
            return Err(AppError::NotFound(format!("payment record {}", record_id)));
        };
        let mut contract = self.ctx.store.require_contract(contract_id).await?;

        record.external_intent_id = Some(intent_id.to_string());
        contract.payment_intent_reference = Some(intent_id.to_string());
        contract.updated_at = self.ctx.now();

        let mut changes = ChangeSet::new();
        changes.update_payment_record(&mut record);
        changes.update_contract(&mut contract);
        self.ctx.store.commit(changes).await
    }

    async fn mark_attempt_failed(&self, contract_id: Uuid, record_id: Uuid) -> Result<(), AppError> {
        let Some(mut record) = self.find_record(contract_id, record_id).await? else {
            return Ok(());
        };
        let mut contract = self.ctx.store.require_contract(contract_id).await?;

        let now = self.ctx.now();
        record.status = PaymentRecordStatus::Failed;
        record.settled_at = Some(now);
        let mut changes = ChangeSet::new();
        changes.update_payment_record(&mut record);
        if contract.payment_status != PaymentStatus::Paid {
            contract.payment_status = PaymentStatus::Failed;
            contract.updated_at = now;
            changes.update_contract(&mut contract);
        }
        self.ctx.store.commit(changes).await
    }

    async fn find_record(&self, contract_id: Uuid, record_id: Uuid) -> Result<Option<PaymentRecord>, AppError> {
        Ok(self
            .ctx
            .store
            .payment_records_for_contract(contract_id)
            .await?
            .into_iter()
            .find(|record| record.id == record_id))
    }

    /// Applies one provider callback. Applied and stale events are written to
    /// the processed-event ledger in the same commit, so redelivery is a no-op.
    pub async fn apply_provider_event(&self, event: &ProviderEvent) -> Result<EventOutcome, AppError> {
        let (outcome, cards) = self.ctx.with_retry(|| self.try_apply(event)).await?;

        tracing::info!(
            event_id = %event.id,
            kind = %event.kind,
            intent_id = %event.intent_id,
            outcome = outcome.as_str(),
            "Provider event processed"
        );
        self.ctx.outbox.deliver(cards).await;
        Ok(outcome)
    }

    async fn try_apply(&self, event: &ProviderEvent) -> Result<(EventOutcome, Vec<MessageCard>), AppError> {
        let store = &self.ctx.store;
        if store.processed_event(&event.id).await?.is_some()
            || store.processed_event_for(&event.intent_id, event.kind).await?.is_some()
        {
            return Ok((EventOutcome::Duplicate, Vec::new()));
        }

        let now = self.ctx.now();
        let mut changes = ChangeSet::new();
        let mut cards = Vec::new();

        let record = match store.payment_record_by_intent(&event.intent_id).await? {
            Some(record) => Some(record),
            None => self.record_from_metadata(event).await?,
        };

        let outcome = match record {
            // Left out of the ledger so a redelivery after the intent id
            // write-back can still apply.
            None => {
                tracing::warn!(event_id = %event.id, intent_id = %event.intent_id, "No payment record for provider event");
                return Ok((EventOutcome::Ignored, Vec::new()));
            }
            Some(mut record) => {
                let mut contract = store.require_contract(record.contract_id).await?;
                let applied = match event.kind {
                    ProviderEventKind::IntentSucceeded => {
                        self.apply_success(event, &mut record, &mut contract, &mut changes, &mut cards)?
                    }
                    ProviderEventKind::IntentFailed => {
                        self.apply_failure(event, &mut record, &mut contract, &mut changes, &mut cards)
                    }
                    ProviderEventKind::RefundCreated => {
                        self.apply_refund(event, &mut record, &mut contract, &mut changes, &mut cards)
                            .await?
                    }
                };
                if applied {
                    EventOutcome::Applied
                } else {
                    EventOutcome::Stale
                }
            }
        };

        changes.record_event(ProcessedEvent {
            event_id: event.id.clone(),
            external_intent_id: event.intent_id.clone(),
            kind: event.kind,
            outcome: outcome.as_str().to_string(),
            received_at: now,
        });
        store.commit(changes).await?;
        Ok((outcome, cards))
    }

    /// Falls back to the record id the intent was created with, for callbacks
    /// that race the intent id write-back.
    async fn record_from_metadata(&self, event: &ProviderEvent) -> Result<Option<PaymentRecord>, AppError> {
        let (Some(contract_id), Some(record_id)) = (event.contract_id, event.payment_record_id) else {
            return Ok(None);
        };
        let record = self
            .ctx
            .store
            .payment_records_for_contract(contract_id)
            .await?
            .into_iter()
            .find(|record| record.id == record_id);
        Ok(record.filter(|record| {
            record
                .external_intent_id
                .as_deref()
                .map_or(true, |intent| intent == event.intent_id)
        }))
    }

    fn apply_success(
        &self,
        event: &ProviderEvent,
        record: &mut PaymentRecord,
        contract: &mut Contract,
        changes: &mut ChangeSet,
        cards: &mut Vec<MessageCard>,
    ) -> Result<bool, AppError> {
        if matches!(record.status, PaymentRecordStatus::Succeeded | PaymentRecordStatus::Refunded)
            || contract.payment_status == PaymentStatus::Paid
        {
            return Ok(false);
        }
        if contract.status.is_terminal() {
            // The capture still happened; the record follows the provider but
            // a closed contract is not reopened.
            tracing::warn!(
                event_id = %event.id,
                contract_id = %contract.id,
                status = %contract.status,
                "Payment captured for a closed contract"
            );
            record.status = PaymentRecordStatus::Succeeded;
            record.settled_at = Some(event.created);
            record.external_intent_id = Some(event.intent_id.clone());
            changes.update_payment_record(record);
            return Ok(true);
        }
        if let Some(amount) = event.amount {
            if amount != record.amount {
                tracing::warn!(
                    event_id = %event.id,
                    expected = %record.amount,
                    received = %amount,
                    "Provider amount differs from payment record"
                );
            }
        }

        let now = self.ctx.now();
        record.status = PaymentRecordStatus::Succeeded;
        record.settled_at = Some(event.created);
        record.external_intent_id = Some(event.intent_id.clone());

        contract.payment_status = PaymentStatus::Paid;
        contract.payment_completed_at = Some(event.created);
        contract.paid_amount = record.amount.min(contract.total_amount);
        contract.payment_intent_reference = Some(event.intent_id.clone());
        if contract.accepted_at.is_some()
            && matches!(contract.status, ContractStatus::Pending | ContractStatus::Accepted)
        {
            contract.status = ContractStatus::Active;
        }
        contract.updated_at = now;

        changes.update_payment_record(record);
        changes.update_contract(contract);
        cards.extend(MessageCard::system_to_both(
            contract,
            SystemEvent::PaymentSucceeded,
            &format!("Payment of {} {} received for {}", record.amount, record.currency, contract.contract_number),
            None,
            now,
        ));
        Ok(true)
    }

    fn apply_failure(
        &self,
        event: &ProviderEvent,
        record: &mut PaymentRecord,
        contract: &mut Contract,
        changes: &mut ChangeSet,
        cards: &mut Vec<MessageCard>,
    ) -> bool {
        // A late failure never overrides a settled payment.
        if record.status != PaymentRecordStatus::Pending || contract.payment_status == PaymentStatus::Paid {
            return false;
        }

        let now = self.ctx.now();
        record.status = PaymentRecordStatus::Failed;
        record.settled_at = Some(event.created);
        record.external_intent_id = Some(event.intent_id.clone());
        contract.payment_status = PaymentStatus::Failed;
        contract.updated_at = now;

        changes.update_payment_record(record);
        changes.update_contract(contract);
        cards.push(MessageCard::system(
            contract,
            contract.student_id,
            SystemEvent::PaymentFailed,
            format!("Payment for {} failed", contract.contract_number),
            None,
            now,
        ));
        true
    }

    async fn apply_refund(
        &self,
        event: &ProviderEvent,
        record: &mut PaymentRecord,
        contract: &mut Contract,
        changes: &mut ChangeSet,
        cards: &mut Vec<MessageCard>,
    ) -> Result<bool, AppError> {
        if record.status != PaymentRecordStatus::Succeeded {
            return Ok(false);
        }

        let now = self.ctx.now();
        record.status = PaymentRecordStatus::Refunded;
        record.settled_at = Some(event.created);
        contract.payment_status = PaymentStatus::Refunded;

        let mut sessions = self.ctx.store.sessions_for_proposal(contract.proposal_id).await?;
        let any_completed = sessions.iter().any(|session| session.status == SessionStatus::Completed);
        if !contract.status.is_terminal() {
            contract.status = if any_completed {
                ContractStatus::Disputed
            } else {
                ContractStatus::Cancelled
            };
            for session in sessions.iter_mut().filter(|session| !session.status.is_terminal()) {
                session.cancel(Some("payment refunded".to_string()), now)?;
                changes.update_session(session);
            }
        }
        contract.updated_at = now;

        changes.update_payment_record(record);
        changes.update_contract(contract);
        cards.extend(MessageCard::system_to_both(
            contract,
            SystemEvent::PaymentRefunded,
            &format!("Payment for {} was refunded", contract.contract_number),
            None,
            now,
        ));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn platform_takes_fifteen_percent() {
        assert_eq!(platform_fee(dec!(150)), dec!(22.50));
        assert_eq!(payout(dec!(150)), dec!(127.50));
    }

    #[test]
    fn fees_round_to_cents() {
        assert_eq!(platform_fee(dec!(33.33)), dec!(5.00));
        assert_eq!(payout(dec!(33.33)), dec!(28.33));
        let preview = PayoutPreview::for_amount(dec!(10.10));
        assert_eq!(preview.platform_fee + preview.payout, preview.amount);
    }
}
