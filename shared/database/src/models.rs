use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// Row shapes for the engagement tables. Enum columns hold short strings;
// money columns are NUMERIC(12,2).

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProposalRow {
    pub id: Uuid,
    pub learning_request_id: Uuid,
    pub student_id: Uuid,
    pub coach_id: Uuid,
    pub session_count: i32,
    pub price_per_session: Decimal,
    pub session_duration_minutes: i32,
    pub total_price: Decimal,
    pub payment_model: String,
    pub hourly_rate: Option<Decimal>,
    pub status: String,
    pub accepted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ContractRow {
    pub id: Uuid,
    pub proposal_id: Uuid,
    pub student_id: Uuid,
    pub coach_id: Uuid,
    pub contract_number: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub total_sessions: i32,
    pub completed_sessions: i32,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub rate: Decimal,
    pub duration_minutes: i32,
    pub timezone: String,
    pub cancellation_policy: Option<String>,
    pub learning_outcomes: Option<String>,
    pub status: String,
    pub payment_status: String,
    pub payment_intent_reference: Option<String>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub declined_at: Option<DateTime<Utc>>,
    pub payment_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub proposal_id: Uuid,
    pub session_number: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub original_scheduled_at: Option<DateTime<Utc>>,
    pub duration_minutes: i32,
    pub status: String,
    pub reschedule_requested: bool,
    pub reschedule_requested_by: Option<String>,
    pub reschedule_reason: Option<String>,
    pub reschedule_proposed_time: Option<DateTime<Utc>>,
    pub reschedule_deadline: Option<DateTime<Utc>>,
    pub reschedule_status: Option<String>,
    pub meeting_started_at: Option<DateTime<Utc>>,
    pub meeting_ended_at: Option<DateTime<Utc>>,
    pub auto_activated: bool,
    pub ready_notified: bool,
    pub reminder_sent: bool,
    pub reminder_1h_sent: bool,
    pub early_join_enabled: bool,
    pub early_join_window_minutes: i32,
    pub grace_minutes: i32,
    pub buffer_minutes: i32,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduledSessionRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub coach_id: Uuid,
    pub student_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub meeting_url: Option<String>,
    pub meeting_status: String,
    pub created_at: DateTime<Utc>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentRecordRow {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub external_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProcessedEventRow {
    pub event_id: String,
    pub external_intent_id: String,
    pub kind: String,
    pub outcome: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub sender_id: Option<Uuid>,
    pub recipient_id: Uuid,
    pub contract_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
