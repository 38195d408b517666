use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Contract, MessageCard, MessageType, Session};
use crate::store::EngagementStore;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractOfferPayload {
    pub contract_id: Uuid,
    pub contract_number: String,
    pub proposal_id: Uuid,
    pub total_sessions: u32,
    pub total_amount: Decimal,
    pub rate: Decimal,
    pub duration_minutes: u32,
    pub start_date: NaiveDate,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionScheduledPayload {
    pub session_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub session_number: u32,
    pub contract_id: Uuid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    FreeConsultation,
    PaidSession,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallScheduledPayload {
    pub call_id: Uuid,
    pub call_type: CallType,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeetingLinkPayload {
    pub session_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub url: String,
    pub duration_minutes: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemEvent {
    OfferAccepted,
    OfferDeclined,
    PaymentSucceeded,
    PaymentFailed,
    PaymentRefunded,
    ContractCancelled,
    ContractCompleted,
    SessionConfirmed,
    SessionCancelled,
    SessionMissed,
    CallReady,
    Reminder24h,
    Reminder1h,
    RescheduleRequested,
    RescheduleApproved,
    RescheduleDeclined,
    RescheduleExpired,
}

/// Payload of a SYSTEM card. `text` is a plain-language fallback for clients
/// that do not render the event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemPayload {
    pub event: SystemEvent,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl MessageCard {
    pub fn new<P: Serialize>(
        message_type: MessageType,
        payload: &P,
        sender_id: Option<Uuid>,
        recipient_id: Uuid,
        contract_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            payload: serde_json::to_value(payload).unwrap_or_default(),
            sender_id,
            recipient_id,
            contract_id,
            created_at: now,
        }
    }

    pub fn contract_offer(contract: &Contract, now: DateTime<Utc>) -> Self {
        let payload = ContractOfferPayload {
            contract_id: contract.id,
            contract_number: contract.contract_number.clone(),
            proposal_id: contract.proposal_id,
            total_sessions: contract.total_sessions,
            total_amount: contract.total_amount,
            rate: contract.rate,
            duration_minutes: contract.duration_minutes,
            start_date: contract.start_date,
            timezone: contract.timezone.clone(),
        };
        Self::new(
            MessageType::ContractOffer,
            &payload,
            Some(contract.student_id),
            contract.coach_id,
            Some(contract.id),
            now,
        )
    }

    pub fn session_scheduled(
        contract: &Contract,
        session: &Session,
        scheduled_at: DateTime<Utc>,
        sender_id: Option<Uuid>,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        let payload = SessionScheduledPayload {
            session_id: session.id,
            scheduled_at,
            duration_minutes: session.duration_minutes,
            session_number: session.session_number,
            contract_id: contract.id,
        };
        Self::new(MessageType::SessionScheduled, &payload, sender_id, recipient_id, Some(contract.id), now)
    }

    pub fn call_scheduled(
        contract: &Contract,
        call_id: Uuid,
        scheduled_at: DateTime<Utc>,
        duration_minutes: u32,
        sender_id: Option<Uuid>,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        let payload = CallScheduledPayload {
            call_id,
            call_type: CallType::PaidSession,
            scheduled_at,
            duration_minutes,
        };
        Self::new(MessageType::CallScheduled, &payload, sender_id, recipient_id, Some(contract.id), now)
    }

    pub fn meeting_link(
        contract: &Contract,
        session: &Session,
        scheduled_at: DateTime<Utc>,
        url: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let payload = MeetingLinkPayload {
            session_id: session.id,
            scheduled_at,
            url: url.to_string(),
            duration_minutes: session.duration_minutes,
        };
        Self::new(
            MessageType::MeetingLink,
            &payload,
            Some(contract.coach_id),
            contract.student_id,
            Some(contract.id),
            now,
        )
    }

    pub fn system(
        contract: &Contract,
        recipient_id: Uuid,
        event: SystemEvent,
        text: impl Into<String>,
        session: Option<&Session>,
        now: DateTime<Utc>,
    ) -> Self {
        let payload = SystemPayload {
            event,
            text: text.into(),
            session_id: session.map(|session| session.id),
            scheduled_at: session.and_then(|session| session.scheduled_at),
        };
        Self::new(MessageType::System, &payload, None, recipient_id, Some(contract.id), now)
    }

    /// The same SYSTEM notice addressed to both parties.
    pub fn system_to_both(
        contract: &Contract,
        event: SystemEvent,
        text: &str,
        session: Option<&Session>,
        now: DateTime<Utc>,
    ) -> Vec<Self> {
        [contract.student_id, contract.coach_id]
            .into_iter()
            .map(|recipient| Self::system(contract, recipient, event, text, session, now))
            .collect()
    }
}

/// Appends cards after the owning commit. Delivery is best effort; the entity
/// store stays the source of truth.
#[derive(Clone)]
pub struct MessageOutbox {
    store: Arc<dyn EngagementStore>,
}

impl MessageOutbox {
    pub fn new(store: Arc<dyn EngagementStore>) -> Self {
        Self { store }
    }

    pub async fn deliver(&self, cards: Vec<MessageCard>) {
        if cards.is_empty() {
            return;
        }

        match self.store.append_messages(&cards).await {
            Ok(()) => {
                tracing::debug!(count = cards.len(), "Message cards delivered");
            }
            Err(err) => {
                tracing::warn!(count = cards.len(), error = %err, "Failed to deliver message cards");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn meeting_link_payload_has_the_documented_shape() {
        let session_id = Uuid::new_v4();
        let at = DateTime::parse_from_rfc3339("2025-02-03T15:00:00Z").unwrap().with_timezone(&Utc);
        let payload = MeetingLinkPayload {
            session_id,
            scheduled_at: at,
            url: "https://meet.example.com/abc".into(),
            duration_minutes: 60,
        };

        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "session_id": session_id,
                "scheduled_at": "2025-02-03T15:00:00Z",
                "url": "https://meet.example.com/abc",
                "duration_minutes": 60,
            })
        );
    }

    #[test]
    fn call_type_is_snake_case() {
        let value = serde_json::to_value(CallType::FreeConsultation).unwrap();
        assert_eq!(value, json!("free_consultation"));
    }

    #[test]
    fn system_payload_omits_missing_session() {
        let payload = SystemPayload {
            event: SystemEvent::PaymentSucceeded,
            text: "Payment received".into(),
            session_id: None,
            scheduled_at: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"event": "payment_succeeded", "text": "Payment received"}));
    }
}
