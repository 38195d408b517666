use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use skillbridge_common::{AppError, Party};

use crate::engine::EngineContext;
use crate::messages::SystemEvent;
use crate::models::{
    live_scheduled_session, Contract, ContractStatus, MessageCard, RescheduleStatus,
    ScheduledSession, Session, SessionStatus,
};
use crate::progress::{self, ProgressChange};
use crate::store::ChangeSet;

/// Which upcoming-session reminder is owed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reminder {
    DayBefore,
    HourBefore,
}

// State machine. Every transition checks its guard before touching a field,
// so a rejected call leaves the session unchanged.
impl Session {
    fn require_status(&self, allowed: &[SessionStatus], event: &'static str) -> Result<(), AppError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(AppError::invalid_transition("session", self.status, event))
        }
    }

    fn booked_time(&self) -> Result<DateTime<Utc>, AppError> {
        self.scheduled_at.ok_or_else(|| {
            AppError::Consistency(format!("session {} is {} without a scheduled time", self.id, self.status))
        })
    }

    /// `[scheduled_at - early_join_window, scheduled_at + grace]`
    pub fn activation_window(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.scheduled_at
            .map(|at| (at - self.early_join_window(), at + self.grace()))
    }

    pub fn in_activation_window(&self, now: DateTime<Utc>) -> bool {
        self.activation_window()
            .is_some_and(|(opens, closes)| opens <= now && now <= closes)
    }

    /// Drops a pending reschedule that can no longer apply.
    fn withdraw_pending_reschedule(&mut self) {
        if self.reschedule_requested {
            self.reschedule_requested = false;
            self.reschedule_status = Some(RescheduleStatus::Declined);
            self.reschedule_deadline = None;
        }
    }

    pub(crate) fn reset_notifications(&mut self) {
        self.ready_notified = false;
        self.reminder_sent = false;
        self.reminder_1h_sent = false;
    }

    pub fn book(
        &mut self,
        contract: &Contract,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
        lead: Duration,
    ) -> Result<(), AppError> {
        self.require_status(&[SessionStatus::Unscheduled], "book")?;
        if contract.status != ContractStatus::Active {
            return Err(AppError::Precondition(format!(
                "contract {} is {} (payment {}); sessions can only be booked on active contracts",
                contract.contract_number, contract.status, contract.payment_status
            )));
        }
        if at <= now + lead {
            return Err(AppError::Validation(
                "Session time must be in the future".to_string(),
            ));
        }

        self.scheduled_at = Some(at);
        if self.original_scheduled_at.is_none() {
            self.original_scheduled_at = Some(at);
        }
        self.status = SessionStatus::Scheduled;
        self.reset_notifications();
        self.updated_at = now;
        Ok(())
    }

    pub fn confirm(&mut self, by: Party, now: DateTime<Utc>) -> Result<(), AppError> {
        if by != Party::Coach {
            return Err(AppError::Authorization("Only the coach can confirm a session".to_string()));
        }
        self.require_status(&[SessionStatus::Scheduled], "confirm")?;
        self.status = SessionStatus::Confirmed;
        self.updated_at = now;
        Ok(())
    }

    /// Start the meeting inside the activation window.
    pub fn activate(&mut self, now: DateTime<Utc>, automatic: bool) -> Result<(), AppError> {
        self.require_status(&[SessionStatus::Scheduled, SessionStatus::Confirmed], "activate")?;
        self.booked_time()?;
        if !self.in_activation_window(now) {
            return Err(AppError::Precondition(format!(
                "session {} is outside its activation window",
                self.id
            )));
        }

        self.status = SessionStatus::Active;
        self.meeting_started_at = Some(now);
        self.auto_activated = automatic;
        self.withdraw_pending_reschedule();
        self.updated_at = now;
        Ok(())
    }

    /// The student enters before the start time.
    pub fn join_early(&mut self, now: DateTime<Utc>) -> Result<(), AppError> {
        self.require_status(&[SessionStatus::Scheduled, SessionStatus::Confirmed], "join_early")?;
        if !self.early_join_enabled {
            return Err(AppError::Precondition("Early join is disabled for this session".to_string()));
        }
        let at = self.booked_time()?;
        if now < at - self.early_join_window() || now > at {
            return Err(AppError::Precondition(format!(
                "Early join opens {} minutes before the session",
                self.early_join_window_minutes
            )));
        }

        self.status = SessionStatus::Active;
        self.meeting_started_at = Some(now);
        self.auto_activated = false;
        self.withdraw_pending_reschedule();
        self.updated_at = now;
        Ok(())
    }

    pub fn end(&mut self, now: DateTime<Utc>) -> Result<(), AppError> {
        self.require_status(&[SessionStatus::Active], "end")?;
        let started = self.meeting_started_at.ok_or_else(|| {
            AppError::Consistency(format!("active session {} has no start time", self.id))
        })?;

        self.status = SessionStatus::Completed;
        self.meeting_ended_at = Some(now.max(started));
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_missed(&mut self, now: DateTime<Utc>) -> Result<(), AppError> {
        self.require_status(&[SessionStatus::Scheduled, SessionStatus::Confirmed], "miss")?;
        if !self.miss_due(now) {
            return Err(AppError::Precondition(format!(
                "session {} is still within its grace period",
                self.id
            )));
        }
        self.status = SessionStatus::Missed;
        self.withdraw_pending_reschedule();
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(&mut self, reason: Option<String>, now: DateTime<Utc>) -> Result<(), AppError> {
        if self.status.is_terminal() {
            return Err(AppError::invalid_transition("session", self.status, "cancel"));
        }
        self.status = SessionStatus::Cancelled;
        self.cancellation_reason = reason;
        self.withdraw_pending_reschedule();
        self.updated_at = now;
        Ok(())
    }

    // Tick predicates

    pub fn ready_notice_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_booked() && !self.auto_activated && !self.ready_notified && self.in_activation_window(now)
    }

    /// The tick starts sessions at their start time, never early.
    pub fn auto_activation_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_booked()
            && self
                .scheduled_at
                .is_some_and(|at| at <= now && now <= at + self.grace())
    }

    pub fn auto_complete_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active
            && self
                .meeting_started_at
                .is_some_and(|started| now >= started + self.duration())
    }

    pub fn miss_due(&self, now: DateTime<Utc>) -> bool {
        self.status.is_booked()
            && self.meeting_started_at.is_none()
            && self.scheduled_at.is_some_and(|at| now > at + self.grace())
    }

    pub fn reminder_due(&self, now: DateTime<Utc>) -> Option<Reminder> {
        if !self.status.is_booked() {
            return None;
        }
        let at = self.scheduled_at?;
        if at <= now {
            return None;
        }
        let until = at - now;
        if until <= Duration::hours(1) && !self.reminder_1h_sent {
            Some(Reminder::HourBefore)
        } else if until <= Duration::hours(24) && !self.reminder_sent && !self.reminder_1h_sent {
            Some(Reminder::DayBefore)
        } else {
            None
        }
    }

    /// Records a reminder as sent. The hour reminder supersedes the day reminder.
    pub fn record_reminder(&mut self, reminder: Reminder, now: DateTime<Utc>) {
        match reminder {
            Reminder::DayBefore => self.reminder_sent = true,
            Reminder::HourBefore => {
                self.reminder_sent = true;
                self.reminder_1h_sent = true;
            }
        }
        self.updated_at = now;
    }

    pub fn has_notification_flags(&self) -> bool {
        self.ready_notified || self.reminder_sent || self.reminder_1h_sent
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetails {
    pub session: Session,
    /// Meeting instances, oldest first.
    pub scheduled_sessions: Vec<ScheduledSession>,
    pub live_scheduled_session_id: Option<Uuid>,
}

/// Session completion together with the contract progress it caused.
#[derive(Debug, Clone)]
struct Completion {
    session: Session,
    contract: Contract,
    change: ProgressChange,
}

#[derive(Clone)]
pub struct SessionService {
    ctx: EngineContext,
}

impl SessionService {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    async fn load(&self, session_id: Uuid) -> Result<(Session, Contract), AppError> {
        let session = self.ctx.store.require_session(session_id).await?;
        let contract = self.ctx.store.require_contract(session.contract_id).await?;
        Ok((session, contract))
    }

    pub async fn details(&self, session_id: Uuid, actor: Uuid) -> Result<SessionDetails, AppError> {
        let (session, contract) = self.load(session_id).await?;
        contract.require_party(actor)?;
        let scheduled_sessions = self.ctx.store.scheduled_sessions_for_session(session.id).await?;
        let live_scheduled_session_id =
            live_scheduled_session(&session, &scheduled_sessions).map(|instance| instance.id);
        Ok(SessionDetails {
            session,
            scheduled_sessions,
            live_scheduled_session_id,
        })
    }

    /// Books an unscheduled session and opens its first meeting instance.
    pub async fn book(&self, session_id: Uuid, actor: Uuid, at: DateTime<Utc>) -> Result<Session, AppError> {
        let (session, contract, instance) = self
            .ctx
            .with_retry(|| self.try_book(session_id, actor, at))
            .await?;

        tracing::info!(
            session_id = %session.id,
            scheduled_at = %at,
            scheduled_session_id = %instance.id,
            "Session booked"
        );

        let now = self.ctx.now();
        self.ctx
            .outbox
            .deliver(vec![
                MessageCard::session_scheduled(&contract, &session, at, Some(actor), contract.coach_id, now),
                MessageCard::call_scheduled(
                    &contract,
                    instance.id,
                    at,
                    session.duration_minutes,
                    Some(actor),
                    contract.student_id,
                    now,
                ),
            ])
            .await;
        Ok(session)
    }

    async fn try_book(
        &self,
        session_id: Uuid,
        actor: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(Session, Contract, ScheduledSession), AppError> {
        let (mut session, contract) = self.load(session_id).await?;
        contract.require_party(actor)?;

        let now = self.ctx.now();
        session.book(&contract, at, now, self.ctx.policy.booking_lead())?;
        let instance = ScheduledSession::for_session(&session, &contract, at, now);

        let mut changes = ChangeSet::new();
        changes.update_session(&mut session);
        changes.insert_scheduled_session(instance.clone());
        self.ctx.store.commit(changes).await?;
        Ok((session, contract, instance))
    }

    pub async fn confirm(&self, session_id: Uuid, actor: Uuid) -> Result<Session, AppError> {
        let (session, contract) = self
            .ctx
            .with_retry(|| async {
                let (mut session, contract) = self.load(session_id).await?;
                let party = contract.require_party(actor)?;
                session.confirm(party, self.ctx.now())?;

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                self.ctx.store.commit(changes).await?;
                Ok((session, contract))
            })
            .await?;

        tracing::info!(session_id = %session.id, "Session confirmed by coach");
        self.ctx
            .outbox
            .deliver(vec![MessageCard::system(
                &contract,
                contract.student_id,
                SystemEvent::SessionConfirmed,
                format!("Session {} is confirmed", session.session_number),
                Some(&session),
                self.ctx.now(),
            )])
            .await;
        Ok(session)
    }

    pub async fn join_early(&self, session_id: Uuid, actor: Uuid) -> Result<Session, AppError> {
        let session = self
            .ctx
            .with_retry(|| async {
                let (mut session, contract) = self.load(session_id).await?;
                if contract.require_party(actor)? != Party::Student {
                    return Err(AppError::Authorization("Only the student can join early".to_string()));
                }
                session.join_early(self.ctx.now())?;

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                self.ctx.store.commit(changes).await?;
                Ok(session)
            })
            .await?;

        tracing::info!(session_id = %session.id, "Student joined session early");
        Ok(session)
    }

    /// Either party ends a running session.
    pub async fn end(&self, session_id: Uuid, actor: Uuid) -> Result<Session, AppError> {
        let completion = self
            .ctx
            .with_retry(|| async {
                let (session, contract) = self.load(session_id).await?;
                contract.require_party(actor)?;
                self.try_complete(session, contract).await
            })
            .await?;

        tracing::info!(session_id = %completion.session.id, "Session ended by participant");
        self.announce_completion(&completion).await;
        Ok(completion.session)
    }

    /// Completes the session and recounts the contract in the same commit.
    /// The contract row is always rewritten so concurrent completions of
    /// sibling sessions serialize on its version.
    async fn try_complete(&self, mut session: Session, mut contract: Contract) -> Result<Completion, AppError> {
        let now = self.ctx.now();
        session.end(now)?;

        let mut siblings = self.ctx.store.sessions_for_proposal(contract.proposal_id).await?;
        match siblings.iter_mut().find(|sibling| sibling.id == session.id) {
            Some(sibling) => *sibling = session.clone(),
            None => siblings.push(session.clone()),
        }
        let change = progress::recompute(&mut contract, &siblings, now)?;
        contract.updated_at = now;

        let mut changes = ChangeSet::new();
        changes.update_session(&mut session);
        changes.update_contract(&mut contract);
        self.ctx.store.commit(changes).await?;

        Ok(Completion {
            session,
            contract,
            change,
        })
    }

    async fn announce_completion(&self, completion: &Completion) {
        tracing::info!(
            contract_id = %completion.contract.id,
            completed = completion.change.completed_after,
            total = completion.contract.total_sessions,
            contract_completed = completion.change.contract_completed,
            "Contract progress updated"
        );
        self.ctx
            .outbox
            .deliver(progress::completion_notices(
                &completion.contract,
                &completion.change,
                self.ctx.now(),
            ))
            .await;
    }

    pub async fn cancel(
        &self,
        session_id: Uuid,
        actor: Uuid,
        reason: Option<String>,
    ) -> Result<Session, AppError> {
        let (session, contract, party) = self
            .ctx
            .with_retry(|| async {
                let (mut session, contract) = self.load(session_id).await?;
                let party = contract.require_party(actor)?;
                if contract.status == ContractStatus::Completed {
                    return Err(AppError::Precondition(format!(
                        "contract {} is already completed",
                        contract.contract_number
                    )));
                }
                session.cancel(reason.clone(), self.ctx.now())?;

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                self.ctx.store.commit(changes).await?;
                Ok((session, contract, party))
            })
            .await?;

        tracing::info!(session_id = %session.id, cancelled_by = %party, "Session cancelled");
        self.ctx
            .outbox
            .deliver(vec![MessageCard::system(
                &contract,
                contract.user_for(party.counterpart()),
                SystemEvent::SessionCancelled,
                format!("Session {} was cancelled by the {}", session.session_number, party),
                Some(&session),
                self.ctx.now(),
            )])
            .await;
        Ok(session)
    }

    // Tick entry points. Each reloads the row, re-checks its predicate against
    // the current time and reports whether it changed anything.

    pub async fn mark_ready_if_due(&self, session_id: Uuid) -> Result<bool, AppError> {
        let marked = self
            .ctx
            .with_retry(|| async {
                let (mut session, contract) = self.load(session_id).await?;
                let now = self.ctx.now();
                if !session.ready_notice_due(now) {
                    return Ok(None);
                }
                session.ready_notified = true;
                session.updated_at = now;

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                self.ctx.store.commit(changes).await?;
                Ok(Some((session, contract)))
            })
            .await?;

        let Some((session, contract)) = marked else {
            return Ok(false);
        };
        tracing::debug!(session_id = %session.id, "Call ready notice sent");
        self.ctx
            .outbox
            .deliver(MessageCard::system_to_both(
                &contract,
                SystemEvent::CallReady,
                &format!("Session {} is ready to join", session.session_number),
                Some(&session),
                self.ctx.now(),
            ))
            .await;
        Ok(true)
    }

    pub async fn activate_if_due(&self, session_id: Uuid) -> Result<bool, AppError> {
        let activated = self
            .ctx
            .with_retry(|| async {
                let (mut session, _contract) = self.load(session_id).await?;
                let now = self.ctx.now();
                if !session.auto_activation_due(now) {
                    return Ok(None);
                }
                session.activate(now, true)?;

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                self.ctx.store.commit(changes).await?;
                Ok(Some(session))
            })
            .await?;

        match activated {
            Some(session) => {
                tracing::info!(session_id = %session.id, "Session auto-activated");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn complete_if_due(&self, session_id: Uuid) -> Result<bool, AppError> {
        let completion = self
            .ctx
            .with_retry(|| async {
                let (session, contract) = self.load(session_id).await?;
                if !session.auto_complete_due(self.ctx.now()) {
                    return Ok(None);
                }
                self.try_complete(session, contract).await.map(Some)
            })
            .await?;

        match completion {
            Some(completion) => {
                tracing::info!(session_id = %completion.session.id, "Session auto-completed");
                self.announce_completion(&completion).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn miss_if_due(&self, session_id: Uuid) -> Result<bool, AppError> {
        let missed = self
            .ctx
            .with_retry(|| async {
                let (mut session, contract) = self.load(session_id).await?;
                let now = self.ctx.now();
                if !session.miss_due(now) {
                    return Ok(None);
                }
                session.mark_missed(now)?;

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                self.ctx.store.commit(changes).await?;
                Ok(Some((session, contract)))
            })
            .await?;

        let Some((session, contract)) = missed else {
            return Ok(false);
        };
        tracing::info!(session_id = %session.id, "Session marked missed");
        self.ctx
            .outbox
            .deliver(MessageCard::system_to_both(
                &contract,
                SystemEvent::SessionMissed,
                &format!("Session {} was missed", session.session_number),
                Some(&session),
                self.ctx.now(),
            ))
            .await;
        Ok(true)
    }

    pub async fn send_reminder_if_due(&self, session_id: Uuid) -> Result<bool, AppError> {
        let reminded = self
            .ctx
            .with_retry(|| async {
                let (mut session, contract) = self.load(session_id).await?;
                let now = self.ctx.now();
                let Some(reminder) = session.reminder_due(now) else {
                    return Ok(None);
                };
                session.record_reminder(reminder, now);

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                self.ctx.store.commit(changes).await?;
                Ok(Some((session, contract, reminder)))
            })
            .await?;

        let Some((session, contract, reminder)) = reminded else {
            return Ok(false);
        };
        let (event, text) = match reminder {
            Reminder::DayBefore => (SystemEvent::Reminder24h, "starts within 24 hours"),
            Reminder::HourBefore => (SystemEvent::Reminder1h, "starts within the hour"),
        };
        tracing::debug!(session_id = %session.id, reminder = ?reminder, "Session reminder sent");
        self.ctx
            .outbox
            .deliver(MessageCard::system_to_both(
                &contract,
                event,
                &format!("Session {} {}", session.session_number, text),
                Some(&session),
                self.ctx.now(),
            ))
            .await;
        Ok(true)
    }

    /// Clears notification flags on sessions past the retention horizon.
    pub async fn clear_flags_if_stale(&self, session_id: Uuid, retention: Duration) -> Result<bool, AppError> {
        self.ctx
            .with_retry(|| async {
                let mut session = self.ctx.store.require_session(session_id).await?;
                let now = self.ctx.now();
                let stale = session.scheduled_at.is_some_and(|at| at < now - retention);
                if !stale || !session.has_notification_flags() {
                    return Ok(false);
                }
                session.reset_notifications();
                session.updated_at = now;

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                self.ctx.store.commit(changes).await?;
                Ok(true)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LifecyclePolicy;
    use crate::contracts::{draft_contract, seed_sessions};
    use crate::models::{PaymentStatus, Proposal};
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 3, 15, 0, 0).unwrap()
    }

    fn active_contract() -> (Contract, Session) {
        let proposal = Proposal::per_session(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), 2, dec!(50), 60, t0());
        let mut contract = draft_contract(
            &proposal,
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            "UTC",
            None,
            None,
            "CTR-20250201-0001".into(),
            t0(),
        )
        .unwrap();
        contract.status = ContractStatus::Active;
        contract.payment_status = PaymentStatus::Paid;
        let session = seed_sessions(&contract, &LifecyclePolicy::default(), t0()).remove(0);
        (contract, session)
    }

    fn booked_at(at: DateTime<Utc>) -> (Contract, Session) {
        let (contract, mut session) = active_contract();
        session
            .book(&contract, at, at - Duration::days(2), Duration::minutes(1))
            .unwrap();
        (contract, session)
    }

    #[test]
    fn booking_requires_an_active_contract() {
        let (mut contract, mut session) = active_contract();
        contract.status = ContractStatus::Pending;
        contract.payment_status = PaymentStatus::Pending;

        let err = session
            .book(&contract, t0() + Duration::days(1), t0(), Duration::minutes(1))
            .unwrap_err();
        assert_eq!(err.status_code(), 422);
        assert_eq!(session.status, SessionStatus::Unscheduled);
    }

    #[test]
    fn booking_in_the_past_is_rejected() {
        let (contract, mut session) = active_contract();
        let err = session.book(&contract, t0(), t0(), Duration::minutes(1)).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn booking_twice_is_an_invalid_transition() {
        let (contract, mut session) = booked_at(t0());
        let err = session
            .book(&contract, t0() + Duration::days(1), t0() - Duration::days(1), Duration::minutes(1))
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(session.original_scheduled_at, Some(t0()));
    }

    #[test]
    fn only_the_coach_confirms() {
        let (_, mut session) = booked_at(t0());
        assert!(matches!(
            session.confirm(Party::Student, t0()),
            Err(AppError::Authorization(_))
        ));
        session.confirm(Party::Coach, t0()).unwrap();
        assert_eq!(session.status, SessionStatus::Confirmed);
    }

    #[test]
    fn activation_window_spans_early_join_and_grace() {
        let (_, session) = booked_at(t0());
        assert!(!session.in_activation_window(t0() - Duration::minutes(16)));
        assert!(session.in_activation_window(t0() - Duration::minutes(15)));
        assert!(session.in_activation_window(t0() + Duration::minutes(10)));
        assert!(!session.in_activation_window(t0() + Duration::minutes(11)));
    }

    #[test]
    fn tick_activation_waits_for_start_time() {
        let (_, session) = booked_at(t0());
        assert!(!session.auto_activation_due(t0() - Duration::minutes(5)));
        assert!(session.auto_activation_due(t0()));
        assert!(session.auto_activation_due(t0() + Duration::minutes(10)));
        assert!(!session.auto_activation_due(t0() + Duration::minutes(11)));
    }

    #[test]
    fn activation_sets_start_and_flag() {
        let (_, mut session) = booked_at(t0());
        session.activate(t0() + Duration::minutes(2), true).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.meeting_started_at, Some(t0() + Duration::minutes(2)));
        assert!(session.auto_activated);

        let err = session.activate(t0() + Duration::minutes(3), true).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
    }

    #[test]
    fn early_join_only_before_start() {
        let (_, mut session) = booked_at(t0());
        assert!(session.join_early(t0() - Duration::minutes(20)).is_err());
        assert!(session.join_early(t0() + Duration::minutes(1)).is_err());
        session.join_early(t0() - Duration::minutes(10)).unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert!(!session.auto_activated);
    }

    #[test]
    fn early_join_can_be_disabled() {
        let (_, mut session) = booked_at(t0());
        session.early_join_enabled = false;
        let err = session.join_early(t0() - Duration::minutes(5)).unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[test]
    fn completion_is_due_after_duration() {
        let (_, mut session) = booked_at(t0());
        session.activate(t0(), true).unwrap();
        assert!(!session.auto_complete_due(t0() + Duration::minutes(59)));
        assert!(session.auto_complete_due(t0() + Duration::minutes(60)));

        session.end(t0() + Duration::minutes(61)).unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.meeting_ended_at >= session.meeting_started_at);
    }

    #[test]
    fn terminal_sessions_do_not_reopen() {
        let (_, mut session) = booked_at(t0());
        session.cancel(Some("sick".into()), t0()).unwrap();
        assert!(matches!(session.cancel(None, t0()), Err(AppError::InvalidTransition { .. })));
        assert!(matches!(session.activate(t0(), true), Err(AppError::InvalidTransition { .. })));
        assert!(matches!(session.end(t0()), Err(AppError::InvalidTransition { .. })));
    }

    #[test]
    fn miss_after_grace_without_start() {
        let (_, mut session) = booked_at(t0());
        assert!(!session.miss_due(t0() + Duration::minutes(10)));
        assert!(session.miss_due(t0() + Duration::minutes(11)));
        assert!(session.mark_missed(t0() + Duration::minutes(5)).is_err());
        session.mark_missed(t0() + Duration::minutes(11)).unwrap();
        assert_eq!(session.status, SessionStatus::Missed);
    }

    #[test]
    fn reminders_fire_once_per_horizon() {
        let (_, mut session) = booked_at(t0());
        assert_eq!(session.reminder_due(t0() - Duration::hours(30)), None);

        let day_before = t0() - Duration::hours(20);
        assert_eq!(session.reminder_due(day_before), Some(Reminder::DayBefore));
        session.record_reminder(Reminder::DayBefore, day_before);
        assert_eq!(session.reminder_due(day_before), None);

        let hour_before = t0() - Duration::minutes(45);
        assert_eq!(session.reminder_due(hour_before), Some(Reminder::HourBefore));
        session.record_reminder(Reminder::HourBefore, hour_before);
        assert_eq!(session.reminder_due(hour_before), None);
        assert_eq!(session.reminder_due(t0() + Duration::minutes(1)), None);
    }

    #[test]
    fn late_booking_gets_only_the_hour_reminder() {
        let (_, mut session) = booked_at(t0());
        let now = t0() - Duration::minutes(30);
        assert_eq!(session.reminder_due(now), Some(Reminder::HourBefore));
        session.record_reminder(Reminder::HourBefore, now);
        assert!(session.reminder_sent && session.reminder_1h_sent);
        assert_eq!(session.reminder_due(now), None);
    }
}
