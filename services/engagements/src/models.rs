use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use skillbridge_common::{AppError, Party};

/// Generates `as_str`, `parse`, `Display` and `FromStr` for enums persisted as short strings.
macro_rules! short_string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn parse(value: &str) -> Result<Self, AppError> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::Consistency(format!(
                        "unknown {} value '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = AppError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                $name::parse(value)
            }
        }
    };
}

// Enums

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    Withdrawn,
}

short_string_enum!(ProposalStatus {
    Pending => "pending",
    Accepted => "accepted",
    Rejected => "rejected",
    Withdrawn => "withdrawn",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentModel {
    PerSession,
    PerHour,
}

short_string_enum!(PaymentModel {
    PerSession => "per_session",
    PerHour => "per_hour",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Pending,
    Accepted,
    Active,
    Completed,
    Cancelled,
    Declined,
    Disputed,
}

short_string_enum!(ContractStatus {
    Pending => "pending",
    Accepted => "accepted",
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
    Declined => "declined",
    Disputed => "disputed",
});

impl ContractStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContractStatus::Completed | ContractStatus::Cancelled | ContractStatus::Declined
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

short_string_enum!(PaymentStatus {
    Pending => "pending",
    Paid => "paid",
    Failed => "failed",
    Refunded => "refunded",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unscheduled,
    Scheduled,
    Confirmed,
    Active,
    Completed,
    Cancelled,
    Missed,
}

short_string_enum!(SessionStatus {
    Unscheduled => "unscheduled",
    Scheduled => "scheduled",
    Confirmed => "confirmed",
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
    Missed => "missed",
});

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Cancelled | SessionStatus::Missed
        )
    }

    /// Booked and waiting to start.
    pub fn is_booked(&self) -> bool {
        matches!(self, SessionStatus::Scheduled | SessionStatus::Confirmed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RescheduleStatus {
    Pending,
    Approved,
    Declined,
}

short_string_enum!(RescheduleStatus {
    Pending => "pending",
    Approved => "approved",
    Declined => "declined",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Pending,
    Ready,
}

short_string_enum!(MeetingStatus {
    Pending => "pending",
    Ready => "ready",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentRecordStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

short_string_enum!(PaymentRecordStatus {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
    Refunded => "refunded",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    ContractOffer,
    CallScheduled,
    SessionScheduled,
    MeetingLink,
    System,
}

short_string_enum!(MessageType {
    Text => "TEXT",
    ContractOffer => "CONTRACT_OFFER",
    CallScheduled => "CALL_SCHEDULED",
    SessionScheduled => "SESSION_SCHEDULED",
    MeetingLink => "MEETING_LINK",
    System => "SYSTEM",
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProviderEventKind {
    #[serde(rename = "intent.succeeded")]
    IntentSucceeded,
    #[serde(rename = "intent.failed")]
    IntentFailed,
    #[serde(rename = "refund.created")]
    RefundCreated,
}

short_string_enum!(ProviderEventKind {
    IntentSucceeded => "intent.succeeded",
    IntentFailed => "intent.failed",
    RefundCreated => "refund.created",
});

// Money

/// Rounds to the two-decimal fixed point every monetary column uses.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

// Entities

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proposal {
    pub id: Uuid,
    pub learning_request_id: Uuid,
    pub student_id: Uuid,
    pub coach_id: Uuid,
    pub session_count: u32,
    pub price_per_session: Decimal,
    pub session_duration_minutes: u32,
    pub total_price: Decimal,
    pub payment_model: PaymentModel,
    pub hourly_rate: Option<Decimal>,
    pub status: ProposalStatus,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl Proposal {
    /// A pending per-session proposal sent by `coach_id` for a student's learning request.
    pub fn per_session(
        learning_request_id: Uuid,
        student_id: Uuid,
        coach_id: Uuid,
        session_count: u32,
        price_per_session: Decimal,
        session_duration_minutes: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            learning_request_id,
            student_id,
            coach_id,
            session_count,
            price_per_session,
            session_duration_minutes,
            total_price: round_money(price_per_session * Decimal::from(session_count)),
            payment_model: PaymentModel::PerSession,
            hourly_rate: None,
            status: ProposalStatus::Pending,
            accepted_at: None,
            created_at: now,
            version: 1,
        }
    }

    pub fn per_hour(
        learning_request_id: Uuid,
        student_id: Uuid,
        coach_id: Uuid,
        session_count: u32,
        hourly_rate: Decimal,
        session_duration_minutes: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let price_per_session =
            round_money(hourly_rate * Decimal::from(session_duration_minutes) / Decimal::from(60));
        let mut proposal = Self::per_session(
            learning_request_id,
            student_id,
            coach_id,
            session_count,
            price_per_session,
            session_duration_minutes,
            now,
        );
        proposal.payment_model = PaymentModel::PerHour;
        proposal.hourly_rate = Some(hourly_rate);
        proposal.total_price = proposal.contract_total().unwrap_or(proposal.total_price);
        proposal
    }

    /// Amount the contract will be priced at, derived from the payment model.
    pub fn contract_total(&self) -> Result<Decimal, AppError> {
        let sessions = Decimal::from(self.session_count);
        match self.payment_model {
            PaymentModel::PerSession => Ok(round_money(sessions * self.price_per_session)),
            PaymentModel::PerHour => {
                let rate = self.hourly_rate.ok_or_else(|| {
                    AppError::Precondition(format!(
                        "proposal {} is billed per hour but has no hourly rate",
                        self.id
                    ))
                })?;
                let hours = Decimal::from(self.session_duration_minutes) / Decimal::from(60);
                Ok(round_money(sessions * hours * rate))
            }
        }
    }

    /// Per-session rate recorded on the contract.
    pub fn contract_rate(&self) -> Decimal {
        match (self.payment_model, self.hourly_rate) {
            (PaymentModel::PerHour, Some(rate)) => rate,
            _ => self.price_per_session,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contract {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub student_id: Uuid,
    pub coach_id: Uuid,
    pub contract_number: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub total_sessions: u32,
    pub completed_sessions: u32,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub rate: Decimal,
    pub duration_minutes: u32,
    pub timezone: String,
    pub cancellation_policy: Option<String>,
    pub learning_outcomes: Option<String>,
    pub status: ContractStatus,
    pub payment_status: PaymentStatus,
    pub payment_intent_reference: Option<String>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub declined_at: Option<DateTime<Utc>>,
    pub payment_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Contract {
    pub fn party_of(&self, user_id: Uuid) -> Option<Party> {
        if user_id == self.student_id {
            Some(Party::Student)
        } else if user_id == self.coach_id {
            Some(Party::Coach)
        } else {
            None
        }
    }

    pub fn require_party(&self, user_id: Uuid) -> Result<Party, AppError> {
        self.party_of(user_id).ok_or_else(|| {
            AppError::Authorization(format!(
                "user {} is not a party to contract {}",
                user_id, self.contract_number
            ))
        })
    }

    pub fn user_for(&self, party: Party) -> Uuid {
        match party {
            Party::Student => self.student_id,
            Party::Coach => self.coach_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub proposal_id: Uuid,
    pub session_number: u32,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// First booked time; reschedules never overwrite it.
    pub original_scheduled_at: Option<DateTime<Utc>>,
    pub duration_minutes: u32,
    pub status: SessionStatus,
    pub reschedule_requested: bool,
    pub reschedule_requested_by: Option<Party>,
    pub reschedule_reason: Option<String>,
    pub reschedule_proposed_time: Option<DateTime<Utc>>,
    pub reschedule_deadline: Option<DateTime<Utc>>,
    pub reschedule_status: Option<RescheduleStatus>,
    pub meeting_started_at: Option<DateTime<Utc>>,
    pub meeting_ended_at: Option<DateTime<Utc>>,
    pub auto_activated: bool,
    pub ready_notified: bool,
    pub reminder_sent: bool,
    pub reminder_1h_sent: bool,
    pub early_join_enabled: bool,
    pub early_join_window_minutes: u32,
    pub grace_minutes: u32,
    pub buffer_minutes: u32,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Session {
    pub fn early_join_window(&self) -> Duration {
        Duration::minutes(i64::from(self.early_join_window_minutes))
    }

    pub fn grace(&self) -> Duration {
        Duration::minutes(i64::from(self.grace_minutes))
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(i64::from(self.duration_minutes))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledSession {
    pub id: Uuid,
    pub session_id: Uuid,
    pub coach_id: Uuid,
    pub student_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub meeting_url: Option<String>,
    pub meeting_status: MeetingStatus,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

impl ScheduledSession {
    pub fn for_session(session: &Session, contract: &Contract, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session.id,
            coach_id: contract.coach_id,
            student_id: contract.student_id,
            scheduled_at,
            meeting_url: None,
            meeting_status: MeetingStatus::Pending,
            created_at: now,
            version: 1,
        }
    }
}

/// The live instance is the most recent one whose time matches the session's current time.
pub fn live_scheduled_session<'a>(
    session: &Session,
    instances: &'a [ScheduledSession],
) -> Option<&'a ScheduledSession> {
    let scheduled_at = session.scheduled_at?;
    instances
        .iter()
        .filter(|instance| instance.session_id == session.id && instance.scheduled_at == scheduled_at)
        .max_by_key(|instance| instance.created_at)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: PaymentRecordStatus,
    pub external_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub version: i64,
}

/// De-duplication ledger entry for provider callbacks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedEvent {
    pub event_id: String,
    pub external_intent_id: String,
    pub kind: ProviderEventKind,
    pub outcome: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageCard {
    pub id: Uuid,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub sender_id: Option<Uuid>,
    pub recipient_id: Uuid,
    pub contract_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 20, 9, 0, 0).unwrap()
    }

    #[test]
    fn per_session_total_is_count_times_price() {
        let proposal = Proposal::per_session(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 3, dec!(50), 60, now());
        assert_eq!(proposal.contract_total().unwrap(), dec!(150.00));
        assert_eq!(proposal.total_price, dec!(150.00));
    }

    #[test]
    fn per_hour_total_scales_with_duration() {
        let proposal = Proposal::per_hour(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 4, dec!(80), 45, now());
        // 4 sessions x 0.75h x 80
        assert_eq!(proposal.contract_total().unwrap(), dec!(240.00));
        assert_eq!(proposal.price_per_session, dec!(60.00));
        assert_eq!(proposal.contract_rate(), dec!(80));
    }

    #[test]
    fn per_hour_without_rate_is_a_precondition_failure() {
        let mut proposal = Proposal::per_session(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 2, dec!(10), 30, now());
        proposal.payment_model = PaymentModel::PerHour;
        assert!(matches!(proposal.contract_total(), Err(AppError::Precondition(_))));
    }

    #[test]
    fn per_hour_total_rounds_to_cents() {
        let proposal = Proposal::per_hour(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 1, dec!(33.33), 50, now());
        // 50/60 * 33.33 = 27.775
        assert_eq!(proposal.contract_total().unwrap(), dec!(27.78));
    }

    #[test]
    fn short_strings_round_trip() {
        for status in [
            SessionStatus::Unscheduled,
            SessionStatus::Scheduled,
            SessionStatus::Confirmed,
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Missed,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert_eq!(MessageType::MeetingLink.as_str(), "MEETING_LINK");
        assert!(matches!(ContractStatus::parse("archived"), Err(AppError::Consistency(_))));
    }

    #[test]
    fn message_type_serializes_in_screaming_case() {
        let json = serde_json::to_string(&MessageType::ContractOffer).unwrap();
        assert_eq!(json, "\"CONTRACT_OFFER\"");
        let kind: ProviderEventKind = serde_json::from_str("\"refund.created\"").unwrap();
        assert_eq!(kind, ProviderEventKind::RefundCreated);
    }
}
