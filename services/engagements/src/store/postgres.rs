use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::PgConnection;
use uuid::Uuid;

use skillbridge_common::{AppError, Party};
use skillbridge_database::{
    ContractRow, DbPool, MessageRow, PaymentRecordRow, ProcessedEventRow, ProposalRow,
    ScheduledSessionRow, SessionRow,
};

use crate::models::{
    Contract, ContractStatus, MeetingStatus, MessageCard, MessageType, PaymentModel,
    PaymentRecord, PaymentRecordStatus, PaymentStatus, ProcessedEvent, ProviderEventKind,
    Proposal, ProposalStatus, RescheduleStatus, ScheduledSession, Session, SessionStatus,
};

use super::{ChangeSet, EngagementStore, SessionScan, Write};

/// Postgres-backed store. Each commit runs in one transaction; updates are
/// guarded by `WHERE version = expected`.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

/// Unique violations become retryable conflicts; CHECK violations mean an
/// invariant was about to be broken.
fn map_db_error(err: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some("23505") => return AppError::Conflict(db_err.message().to_string()),
            Some("23514") => return AppError::Consistency(db_err.message().to_string()),
            _ => {}
        }
    }
    AppError::Database(err)
}

fn to_i32(value: u32, field: &str) -> Result<i32, AppError> {
    i32::try_from(value).map_err(|_| AppError::Validation(format!("{} is out of range", field)))
}

fn to_u32(value: i32, field: &str) -> Result<u32, AppError> {
    u32::try_from(value).map_err(|_| AppError::Consistency(format!("stored {} is negative", field)))
}

fn parse_party(value: Option<String>) -> Result<Option<Party>, AppError> {
    value
        .map(|text| {
            Party::parse(&text)
                .ok_or_else(|| AppError::Consistency(format!("unknown party value '{}'", text)))
        })
        .transpose()
}

impl TryFrom<ProposalRow> for Proposal {
    type Error = AppError;

    fn try_from(row: ProposalRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            learning_request_id: row.learning_request_id,
            student_id: row.student_id,
            coach_id: row.coach_id,
            session_count: to_u32(row.session_count, "session_count")?,
            price_per_session: row.price_per_session,
            session_duration_minutes: to_u32(row.session_duration_minutes, "session_duration_minutes")?,
            total_price: row.total_price,
            payment_model: PaymentModel::parse(&row.payment_model)?,
            hourly_rate: row.hourly_rate,
            status: ProposalStatus::parse(&row.status)?,
            accepted_at: row.accepted_at,
            created_at: row.created_at,
            version: row.version,
        })
    }
}

impl TryFrom<ContractRow> for Contract {
    type Error = AppError;

    fn try_from(row: ContractRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            proposal_id: row.proposal_id,
            student_id: row.student_id,
            coach_id: row.coach_id,
            contract_number: row.contract_number,
            start_date: row.start_date,
            end_date: row.end_date,
            total_sessions: to_u32(row.total_sessions, "total_sessions")?,
            completed_sessions: to_u32(row.completed_sessions, "completed_sessions")?,
            total_amount: row.total_amount,
            paid_amount: row.paid_amount,
            rate: row.rate,
            duration_minutes: to_u32(row.duration_minutes, "duration_minutes")?,
            timezone: row.timezone,
            cancellation_policy: row.cancellation_policy,
            learning_outcomes: row.learning_outcomes,
            status: ContractStatus::parse(&row.status)?,
            payment_status: PaymentStatus::parse(&row.payment_status)?,
            payment_intent_reference: row.payment_intent_reference,
            accepted_at: row.accepted_at,
            declined_at: row.declined_at,
            payment_completed_at: row.payment_completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

impl TryFrom<SessionRow> for Session {
    type Error = AppError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            contract_id: row.contract_id,
            proposal_id: row.proposal_id,
            session_number: to_u32(row.session_number, "session_number")?,
            scheduled_at: row.scheduled_at,
            original_scheduled_at: row.original_scheduled_at,
            duration_minutes: to_u32(row.duration_minutes, "duration_minutes")?,
            status: SessionStatus::parse(&row.status)?,
            reschedule_requested: row.reschedule_requested,
            reschedule_requested_by: parse_party(row.reschedule_requested_by)?,
            reschedule_reason: row.reschedule_reason,
            reschedule_proposed_time: row.reschedule_proposed_time,
            reschedule_deadline: row.reschedule_deadline,
            reschedule_status: row
                .reschedule_status
                .as_deref()
                .map(RescheduleStatus::parse)
                .transpose()?,
            meeting_started_at: row.meeting_started_at,
            meeting_ended_at: row.meeting_ended_at,
            auto_activated: row.auto_activated,
            ready_notified: row.ready_notified,
            reminder_sent: row.reminder_sent,
            reminder_1h_sent: row.reminder_1h_sent,
            early_join_enabled: row.early_join_enabled,
            early_join_window_minutes: to_u32(row.early_join_window_minutes, "early_join_window_minutes")?,
            grace_minutes: to_u32(row.grace_minutes, "grace_minutes")?,
            buffer_minutes: to_u32(row.buffer_minutes, "buffer_minutes")?,
            cancellation_reason: row.cancellation_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

impl TryFrom<ScheduledSessionRow> for ScheduledSession {
    type Error = AppError;

    fn try_from(row: ScheduledSessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            coach_id: row.coach_id,
            student_id: row.student_id,
            scheduled_at: row.scheduled_at,
            meeting_url: row.meeting_url,
            meeting_status: MeetingStatus::parse(&row.meeting_status)?,
            created_at: row.created_at,
            version: row.version,
        })
    }
}

impl TryFrom<PaymentRecordRow> for PaymentRecord {
    type Error = AppError;

    fn try_from(row: PaymentRecordRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            contract_id: row.contract_id,
            amount: row.amount,
            currency: row.currency,
            status: PaymentRecordStatus::parse(&row.status)?,
            external_intent_id: row.external_intent_id,
            created_at: row.created_at,
            settled_at: row.settled_at,
            version: row.version,
        })
    }
}

impl TryFrom<ProcessedEventRow> for ProcessedEvent {
    type Error = AppError;

    fn try_from(row: ProcessedEventRow) -> Result<Self, Self::Error> {
        Ok(Self {
            event_id: row.event_id,
            external_intent_id: row.external_intent_id,
            kind: ProviderEventKind::parse(&row.kind)?,
            outcome: row.outcome,
            received_at: row.received_at,
        })
    }
}

impl TryFrom<MessageRow> for MessageCard {
    type Error = AppError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            message_type: MessageType::parse(&row.message_type)?,
            payload: row.payload,
            sender_id: row.sender_id,
            recipient_id: row.recipient_id,
            contract_id: row.contract_id,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, AppError>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn ensure_updated(rows_affected: u64, kind: &str, id: Uuid, expected_version: i64) -> Result<(), AppError> {
    if rows_affected == 0 {
        return Err(AppError::Conflict(format!(
            "{} {} was modified concurrently (expected version {})",
            kind, id, expected_version
        )));
    }
    Ok(())
}

async fn write_proposal(conn: &mut PgConnection, write: &Write<Proposal>) -> Result<(), AppError> {
    match write {
        Write::Insert(p) => {
            sqlx::query(
                r#"
                INSERT INTO proposals (
                    id, learning_request_id, student_id, coach_id, session_count, price_per_session,
                    session_duration_minutes, total_price, payment_model, hourly_rate, status,
                    accepted_at, created_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(p.id)
            .bind(p.learning_request_id)
            .bind(p.student_id)
            .bind(p.coach_id)
            .bind(to_i32(p.session_count, "session_count")?)
            .bind(p.price_per_session)
            .bind(to_i32(p.session_duration_minutes, "session_duration_minutes")?)
            .bind(p.total_price)
            .bind(p.payment_model.as_str())
            .bind(p.hourly_rate)
            .bind(p.status.as_str())
            .bind(p.accepted_at)
            .bind(p.created_at)
            .bind(p.version)
            .execute(&mut *conn)
            .await
            .map_err(map_db_error)?;
        }
        Write::Update(p) => {
            let result = sqlx::query(
                r#"
                UPDATE proposals
                SET total_price = $2, status = $3, accepted_at = $4, version = $5
                WHERE id = $1 AND version = $5 - 1
                "#,
            )
            .bind(p.id)
            .bind(p.total_price)
            .bind(p.status.as_str())
            .bind(p.accepted_at)
            .bind(p.version)
            .execute(&mut *conn)
            .await
            .map_err(map_db_error)?;
            ensure_updated(result.rows_affected(), "proposal", p.id, p.version - 1)?;
        }
    }
    Ok(())
}

async fn write_contract(conn: &mut PgConnection, write: &Write<Contract>) -> Result<(), AppError> {
    match write {
        Write::Insert(c) => {
            sqlx::query(
                r#"
                INSERT INTO contracts (
                    id, proposal_id, student_id, coach_id, contract_number, start_date, end_date,
                    total_sessions, completed_sessions, total_amount, paid_amount, rate,
                    duration_minutes, timezone, cancellation_policy, learning_outcomes, status,
                    payment_status, payment_intent_reference, accepted_at, declined_at,
                    payment_completed_at, created_at, updated_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                        $17, $18, $19, $20, $21, $22, $23, $24, $25)
                "#,
            )
            .bind(c.id)
            .bind(c.proposal_id)
            .bind(c.student_id)
            .bind(c.coach_id)
            .bind(&c.contract_number)
            .bind(c.start_date)
            .bind(c.end_date)
            .bind(to_i32(c.total_sessions, "total_sessions")?)
            .bind(to_i32(c.completed_sessions, "completed_sessions")?)
            .bind(c.total_amount)
            .bind(c.paid_amount)
            .bind(c.rate)
            .bind(to_i32(c.duration_minutes, "duration_minutes")?)
            .bind(&c.timezone)
            .bind(&c.cancellation_policy)
            .bind(&c.learning_outcomes)
            .bind(c.status.as_str())
            .bind(c.payment_status.as_str())
            .bind(&c.payment_intent_reference)
            .bind(c.accepted_at)
            .bind(c.declined_at)
            .bind(c.payment_completed_at)
            .bind(c.created_at)
            .bind(c.updated_at)
            .bind(c.version)
            .execute(&mut *conn)
            .await
            .map_err(map_db_error)?;
        }
        Write::Update(c) => {
            let result = sqlx::query(
                r#"
                UPDATE contracts
                SET end_date = $2, completed_sessions = $3, paid_amount = $4, status = $5,
                    payment_status = $6, payment_intent_reference = $7, accepted_at = $8,
                    declined_at = $9, payment_completed_at = $10, updated_at = $11, version = $12
                WHERE id = $1 AND version = $12 - 1
                "#,
            )
            .bind(c.id)
            .bind(c.end_date)
            .bind(to_i32(c.completed_sessions, "completed_sessions")?)
            .bind(c.paid_amount)
            .bind(c.status.as_str())
            .bind(c.payment_status.as_str())
            .bind(&c.payment_intent_reference)
            .bind(c.accepted_at)
            .bind(c.declined_at)
            .bind(c.payment_completed_at)
            .bind(c.updated_at)
            .bind(c.version)
            .execute(&mut *conn)
            .await
            .map_err(map_db_error)?;
            ensure_updated(result.rows_affected(), "contract", c.id, c.version - 1)?;
        }
    }
    Ok(())
}

async fn write_session(conn: &mut PgConnection, write: &Write<Session>) -> Result<(), AppError> {
    let s = write.entity();
    let requested_by = s.reschedule_requested_by.map(|party| party.as_str());
    let reschedule_status = s.reschedule_status.map(|status| status.as_str());
    match write {
        Write::Insert(_) => {
            sqlx::query(
                r#"
                INSERT INTO sessions (
                    id, contract_id, proposal_id, session_number, scheduled_at, original_scheduled_at,
                    duration_minutes, status, reschedule_requested, reschedule_requested_by,
                    reschedule_reason, reschedule_proposed_time, reschedule_deadline, reschedule_status,
                    meeting_started_at, meeting_ended_at, auto_activated, ready_notified, reminder_sent,
                    reminder_1h_sent, early_join_enabled, early_join_window_minutes, grace_minutes,
                    buffer_minutes, cancellation_reason, created_at, updated_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                        $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)
                "#,
            )
            .bind(s.id)
            .bind(s.contract_id)
            .bind(s.proposal_id)
            .bind(to_i32(s.session_number, "session_number")?)
            .bind(s.scheduled_at)
            .bind(s.original_scheduled_at)
            .bind(to_i32(s.duration_minutes, "duration_minutes")?)
            .bind(s.status.as_str())
            .bind(s.reschedule_requested)
            .bind(requested_by)
            .bind(&s.reschedule_reason)
            .bind(s.reschedule_proposed_time)
            .bind(s.reschedule_deadline)
            .bind(reschedule_status)
            .bind(s.meeting_started_at)
            .bind(s.meeting_ended_at)
            .bind(s.auto_activated)
            .bind(s.ready_notified)
            .bind(s.reminder_sent)
            .bind(s.reminder_1h_sent)
            .bind(s.early_join_enabled)
            .bind(to_i32(s.early_join_window_minutes, "early_join_window_minutes")?)
            .bind(to_i32(s.grace_minutes, "grace_minutes")?)
            .bind(to_i32(s.buffer_minutes, "buffer_minutes")?)
            .bind(&s.cancellation_reason)
            .bind(s.created_at)
            .bind(s.updated_at)
            .bind(s.version)
            .execute(&mut *conn)
            .await
            .map_err(map_db_error)?;
        }
        Write::Update(_) => {
            let result = sqlx::query(
                r#"
                UPDATE sessions
                SET scheduled_at = $2, original_scheduled_at = $3, status = $4,
                    reschedule_requested = $5, reschedule_requested_by = $6, reschedule_reason = $7,
                    reschedule_proposed_time = $8, reschedule_deadline = $9, reschedule_status = $10,
                    meeting_started_at = $11, meeting_ended_at = $12, auto_activated = $13,
                    ready_notified = $14, reminder_sent = $15, reminder_1h_sent = $16,
                    cancellation_reason = $17, updated_at = $18, version = $19
                WHERE id = $1 AND version = $19 - 1
                "#,
            )
            .bind(s.id)
            .bind(s.scheduled_at)
            .bind(s.original_scheduled_at)
            .bind(s.status.as_str())
            .bind(s.reschedule_requested)
            .bind(requested_by)
            .bind(&s.reschedule_reason)
            .bind(s.reschedule_proposed_time)
            .bind(s.reschedule_deadline)
            .bind(reschedule_status)
            .bind(s.meeting_started_at)
            .bind(s.meeting_ended_at)
            .bind(s.auto_activated)
            .bind(s.ready_notified)
            .bind(s.reminder_sent)
            .bind(s.reminder_1h_sent)
            .bind(&s.cancellation_reason)
            .bind(s.updated_at)
            .bind(s.version)
            .execute(&mut *conn)
            .await
            .map_err(map_db_error)?;
            ensure_updated(result.rows_affected(), "session", s.id, s.version - 1)?;
        }
    }
    Ok(())
}

async fn write_scheduled_session(
    conn: &mut PgConnection,
    write: &Write<ScheduledSession>,
) -> Result<(), AppError> {
    match write {
        Write::Insert(s) => {
            sqlx::query(
                r#"
                INSERT INTO scheduled_sessions (
                    id, session_id, coach_id, student_id, scheduled_at, meeting_url,
                    meeting_status, created_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(s.id)
            .bind(s.session_id)
            .bind(s.coach_id)
            .bind(s.student_id)
            .bind(s.scheduled_at)
            .bind(&s.meeting_url)
            .bind(s.meeting_status.as_str())
            .bind(s.created_at)
            .bind(s.version)
            .execute(&mut *conn)
            .await
            .map_err(map_db_error)?;
        }
        Write::Update(s) => {
            let result = sqlx::query(
                r#"
                UPDATE scheduled_sessions
                SET meeting_url = $2, meeting_status = $3, version = $4
                WHERE id = $1 AND version = $4 - 1
                "#,
            )
            .bind(s.id)
            .bind(&s.meeting_url)
            .bind(s.meeting_status.as_str())
            .bind(s.version)
            .execute(&mut *conn)
            .await
            .map_err(map_db_error)?;
            ensure_updated(result.rows_affected(), "scheduled session", s.id, s.version - 1)?;
        }
    }
    Ok(())
}

async fn write_payment_record(
    conn: &mut PgConnection,
    write: &Write<PaymentRecord>,
) -> Result<(), AppError> {
    match write {
        Write::Insert(r) => {
            sqlx::query(
                r#"
                INSERT INTO payment_records (
                    id, contract_id, amount, currency, status, external_intent_id,
                    created_at, settled_at, version
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(r.id)
            .bind(r.contract_id)
            .bind(r.amount)
            .bind(&r.currency)
            .bind(r.status.as_str())
            .bind(&r.external_intent_id)
            .bind(r.created_at)
            .bind(r.settled_at)
            .bind(r.version)
            .execute(&mut *conn)
            .await
            .map_err(map_db_error)?;
        }
        Write::Update(r) => {
            let result = sqlx::query(
                r#"
                UPDATE payment_records
                SET status = $2, external_intent_id = $3, settled_at = $4, version = $5
                WHERE id = $1 AND version = $5 - 1
                "#,
            )
            .bind(r.id)
            .bind(r.status.as_str())
            .bind(&r.external_intent_id)
            .bind(r.settled_at)
            .bind(r.version)
            .execute(&mut *conn)
            .await
            .map_err(map_db_error)?;
            ensure_updated(result.rows_affected(), "payment record", r.id, r.version - 1)?;
        }
    }
    Ok(())
}

async fn insert_event(conn: &mut PgConnection, event: &ProcessedEvent) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO processed_provider_events (event_id, external_intent_id, kind, outcome, received_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(&event.event_id)
    .bind(&event.external_intent_id)
    .bind(event.kind.as_str())
    .bind(&event.outcome)
    .bind(event.received_at)
    .execute(&mut *conn)
    .await
    .map_err(map_db_error)?;
    Ok(())
}

#[async_trait]
impl EngagementStore for PgStore {
    async fn proposal(&self, id: Uuid) -> Result<Option<Proposal>, AppError> {
        sqlx::query_as::<_, ProposalRow>("SELECT * FROM proposals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Proposal::try_from)
            .transpose()
    }

    async fn contract(&self, id: Uuid) -> Result<Option<Contract>, AppError> {
        sqlx::query_as::<_, ContractRow>("SELECT * FROM contracts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Contract::try_from)
            .transpose()
    }

    async fn contract_by_proposal(&self, proposal_id: Uuid) -> Result<Option<Contract>, AppError> {
        sqlx::query_as::<_, ContractRow>("SELECT * FROM contracts WHERE proposal_id = $1")
            .bind(proposal_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Contract::try_from)
            .transpose()
    }

    async fn last_contract_sequence(&self, date: NaiveDate) -> Result<u32, AppError> {
        let prefix = crate::contracts::contract_number_prefix(date);
        let last: i32 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(CAST(SUBSTRING(contract_number FROM 14) AS INTEGER)), 0)
            FROM contracts
            WHERE contract_number LIKE $1
            "#,
        )
        .bind(format!("{}%", prefix))
        .fetch_one(&self.pool)
        .await?;
        to_u32(last, "contract sequence")
    }

    async fn session(&self, id: Uuid) -> Result<Option<Session>, AppError> {
        sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Session::try_from)
            .transpose()
    }

    async fn sessions_for_proposal(&self, proposal_id: Uuid) -> Result<Vec<Session>, AppError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE proposal_id = $1 ORDER BY session_number",
        )
        .bind(proposal_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn scheduled_session(&self, id: Uuid) -> Result<Option<ScheduledSession>, AppError> {
        sqlx::query_as::<_, ScheduledSessionRow>("SELECT * FROM scheduled_sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ScheduledSession::try_from)
            .transpose()
    }

    async fn scheduled_sessions_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Vec<ScheduledSession>, AppError> {
        let rows = sqlx::query_as::<_, ScheduledSessionRow>(
            "SELECT * FROM scheduled_sessions WHERE session_id = $1 ORDER BY created_at, id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn payment_record_by_intent(&self, intent_id: &str) -> Result<Option<PaymentRecord>, AppError> {
        sqlx::query_as::<_, PaymentRecordRow>(
            "SELECT * FROM payment_records WHERE external_intent_id = $1",
        )
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await?
        .map(PaymentRecord::try_from)
        .transpose()
    }

    async fn payment_records_for_contract(&self, contract_id: Uuid) -> Result<Vec<PaymentRecord>, AppError> {
        let rows = sqlx::query_as::<_, PaymentRecordRow>(
            "SELECT * FROM payment_records WHERE contract_id = $1 ORDER BY created_at",
        )
        .bind(contract_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn processed_event(&self, event_id: &str) -> Result<Option<ProcessedEvent>, AppError> {
        sqlx::query_as::<_, ProcessedEventRow>(
            "SELECT * FROM processed_provider_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?
        .map(ProcessedEvent::try_from)
        .transpose()
    }

    async fn processed_event_for(
        &self,
        intent_id: &str,
        kind: ProviderEventKind,
    ) -> Result<Option<ProcessedEvent>, AppError> {
        sqlx::query_as::<_, ProcessedEventRow>(
            "SELECT * FROM processed_provider_events WHERE external_intent_id = $1 AND kind = $2",
        )
        .bind(intent_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(ProcessedEvent::try_from)
        .transpose()
    }

    async fn scan_sessions(&self, scan: &SessionScan) -> Result<Vec<Session>, AppError> {
        let statuses: Vec<String> = scan.statuses.iter().map(|status| status.as_str().to_string()).collect();
        let limit = i64::try_from(scan.limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT * FROM sessions
            WHERE (cardinality($1::text[]) = 0 OR status = ANY($1))
              AND ($2::timestamptz IS NULL OR scheduled_at >= $2)
              AND ($3::timestamptz IS NULL OR scheduled_at < $3)
              AND (NOT $4 OR reschedule_requested)
              AND (NOT $5 OR ready_notified OR reminder_sent OR reminder_1h_sent)
              AND ($6::uuid IS NULL OR id > $6)
            ORDER BY id
            LIMIT $7
            "#,
        )
        .bind(statuses)
        .bind(scan.scheduled_from)
        .bind(scan.scheduled_before)
        .bind(scan.reschedule_pending)
        .bind(scan.flagged)
        .bind(scan.after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn scan_contracts(
        &self,
        statuses: &[ContractStatus],
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Contract>, AppError> {
        let statuses: Vec<String> = statuses.iter().map(|status| status.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, ContractRow>(
            r#"
            SELECT * FROM contracts
            WHERE (cardinality($1::text[]) = 0 OR status = ANY($1))
              AND ($2::uuid IS NULL OR id > $2)
            ORDER BY id
            LIMIT $3
            "#,
        )
        .bind(statuses)
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn commit(&self, changes: ChangeSet) -> Result<(), AppError> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for write in &changes.proposals {
            write_proposal(&mut tx, write).await?;
        }
        for write in &changes.contracts {
            write_contract(&mut tx, write).await?;
        }
        for write in &changes.sessions {
            write_session(&mut tx, write).await?;
        }
        for write in &changes.scheduled_sessions {
            write_scheduled_session(&mut tx, write).await?;
        }
        for write in &changes.payment_records {
            write_payment_record(&mut tx, write).await?;
        }
        for event in &changes.events {
            insert_event(&mut tx, event).await?;
        }

        tx.commit().await.map_err(map_db_error)?;
        Ok(())
    }

    async fn append_messages(&self, cards: &[MessageCard]) -> Result<(), AppError> {
        for card in cards {
            sqlx::query(
                r#"
                INSERT INTO message_cards (id, message_type, payload, sender_id, recipient_id, contract_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(card.id)
            .bind(card.message_type.as_str())
            .bind(&card.payload)
            .bind(card.sender_id)
            .bind(card.recipient_id)
            .bind(card.contract_id)
            .bind(card.created_at)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn messages_for(
        &self,
        recipient_id: Uuid,
        before: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<MessageCard>, AppError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            SELECT * FROM message_cards
            WHERE recipient_id = $1
              AND ($2::uuid IS NULL OR (created_at, id) < (
                  SELECT created_at, id FROM message_cards WHERE id = $2
              ))
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(recipient_id)
        .bind(before)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }
}
