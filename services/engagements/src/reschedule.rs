use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use skillbridge_common::{AppError, Party};

use crate::config::LifecyclePolicy;
use crate::engine::EngineContext;
use crate::messages::SystemEvent;
use crate::models::{Contract, MessageCard, RescheduleStatus, ScheduledSession, Session, SessionStatus};
use crate::store::ChangeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RescheduleOutcome {
    AutoApproved,
    Pending,
}

impl Session {
    fn require_pending_reschedule(&self, event: &'static str) -> Result<Party, AppError> {
        if !self.status.is_booked() || !self.reschedule_requested {
            return Err(AppError::invalid_transition("session", self.status, event));
        }
        self.reschedule_requested_by.ok_or_else(|| {
            AppError::Consistency(format!("session {} has a pending reschedule without a requester", self.id))
        })
    }

    /// Moves the booking to `to`. The first booked time is kept.
    fn move_to(&mut self, to: DateTime<Utc>, now: DateTime<Utc>) {
        self.scheduled_at = Some(to);
        self.status = SessionStatus::Scheduled;
        self.reschedule_requested = false;
        self.reschedule_status = Some(RescheduleStatus::Approved);
        self.reschedule_deadline = None;
        self.reset_notifications();
        self.updated_at = now;
    }

    pub fn request_reschedule(
        &mut self,
        by: Party,
        proposed: DateTime<Utc>,
        reason: Option<String>,
        now: DateTime<Utc>,
        policy: &LifecyclePolicy,
    ) -> Result<RescheduleOutcome, AppError> {
        if !self.status.is_booked() {
            return Err(AppError::invalid_transition("session", self.status, "request_reschedule"));
        }
        if self.reschedule_requested {
            return Err(AppError::Precondition(
                "A reschedule request is already pending for this session".to_string(),
            ));
        }
        let at = self.scheduled_at.ok_or_else(|| {
            AppError::Consistency(format!("session {} is booked without a scheduled time", self.id))
        })?;
        if now >= at {
            return Err(AppError::Precondition("The session has already started".to_string()));
        }
        if proposed <= now + policy.min_notice() {
            return Err(AppError::Precondition(format!(
                "The new time must be at least {} hour(s) from now",
                policy.min_notice_hours
            )));
        }

        let lead = at - now;
        if by == Party::Coach && lead <= policy.coach_cutoff() {
            return Err(AppError::Authorization(format!(
                "Within {} hours of the session only the student can reschedule",
                policy.coach_cutoff_hours
            )));
        }

        self.reschedule_requested_by = Some(by);
        self.reschedule_reason = reason;
        self.reschedule_proposed_time = Some(proposed);

        if lead > policy.auto_approve_after() {
            self.move_to(proposed, now);
            return Ok(RescheduleOutcome::AutoApproved);
        }

        self.reschedule_requested = true;
        self.reschedule_status = Some(RescheduleStatus::Pending);
        self.reschedule_deadline = Some(now + policy.response_window());
        self.updated_at = now;
        Ok(RescheduleOutcome::Pending)
    }

    pub fn approve_reschedule(&mut self, by: Party, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        let requester = self.require_pending_reschedule("approve_reschedule")?;
        if by == requester {
            return Err(AppError::Authorization(
                "The requesting party cannot approve its own reschedule".to_string(),
            ));
        }
        let proposed = self.reschedule_proposed_time.ok_or_else(|| {
            AppError::Consistency(format!("session {} has a pending reschedule without a time", self.id))
        })?;
        if proposed <= now {
            return Err(AppError::Precondition("The proposed time has already passed".to_string()));
        }

        self.move_to(proposed, now);
        Ok(proposed)
    }

    pub fn decline_reschedule(&mut self, by: Party, now: DateTime<Utc>) -> Result<(), AppError> {
        let requester = self.require_pending_reschedule("decline_reschedule")?;
        if by == requester {
            return Err(AppError::Authorization(
                "The requesting party cannot decline its own reschedule".to_string(),
            ));
        }
        self.reschedule_requested = false;
        self.reschedule_status = Some(RescheduleStatus::Declined);
        self.reschedule_deadline = None;
        self.updated_at = now;
        Ok(())
    }

    pub fn reschedule_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_booked()
            && self.reschedule_requested
            && self.reschedule_deadline.is_some_and(|deadline| deadline < now)
    }

    /// Declines an unanswered request once its deadline has passed.
    pub fn expire_reschedule(&mut self, now: DateTime<Utc>) -> bool {
        if !self.reschedule_expired(now) {
            return false;
        }
        self.reschedule_requested = false;
        self.reschedule_status = Some(RescheduleStatus::Declined);
        self.reschedule_deadline = None;
        self.updated_at = now;
        true
    }
}

#[derive(Clone)]
pub struct RescheduleGovernor {
    ctx: EngineContext,
}

impl RescheduleGovernor {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    async fn load(&self, session_id: Uuid) -> Result<(Session, Contract), AppError> {
        let session = self.ctx.store.require_session(session_id).await?;
        let contract = self.ctx.store.require_contract(session.contract_id).await?;
        Ok((session, contract))
    }

    fn instance_for(&self, session: &Session, contract: &Contract, at: DateTime<Utc>) -> ScheduledSession {
        ScheduledSession::for_session(session, contract, at, self.ctx.now())
    }

    pub async fn request(
        &self,
        session_id: Uuid,
        actor: Uuid,
        proposed: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<(Session, RescheduleOutcome), AppError> {
        let (session, contract, party, outcome) = self
            .ctx
            .with_retry(|| async {
                let (mut session, contract) = self.load(session_id).await?;
                let party = contract.require_party(actor)?;
                let outcome = session.request_reschedule(
                    party,
                    proposed,
                    reason.clone(),
                    self.ctx.now(),
                    &self.ctx.policy,
                )?;

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                if outcome == RescheduleOutcome::AutoApproved {
                    changes.insert_scheduled_session(self.instance_for(&session, &contract, proposed));
                }
                self.ctx.store.commit(changes).await?;
                Ok((session, contract, party, outcome))
            })
            .await?;

        tracing::info!(
            session_id = %session.id,
            requested_by = %party,
            proposed_time = %proposed,
            outcome = ?outcome,
            "Reschedule requested"
        );

        let now = self.ctx.now();
        let cards = match outcome {
            RescheduleOutcome::AutoApproved => MessageCard::system_to_both(
                &contract,
                SystemEvent::RescheduleApproved,
                &format!("Session {} moved to {}", session.session_number, proposed.to_rfc3339()),
                Some(&session),
                now,
            ),
            RescheduleOutcome::Pending => vec![MessageCard::system(
                &contract,
                contract.user_for(party.counterpart()),
                SystemEvent::RescheduleRequested,
                format!(
                    "The {} asked to move session {} to {}",
                    party,
                    session.session_number,
                    proposed.to_rfc3339()
                ),
                Some(&session),
                now,
            )],
        };
        self.ctx.outbox.deliver(cards).await;
        Ok((session, outcome))
    }

    pub async fn approve(&self, session_id: Uuid, actor: Uuid) -> Result<Session, AppError> {
        let (session, contract, requester) = self
            .ctx
            .with_retry(|| async {
                let (mut session, contract) = self.load(session_id).await?;
                let party = contract.require_party(actor)?;
                let requester = session.require_pending_reschedule("approve_reschedule")?;
                let moved_to = session.approve_reschedule(party, self.ctx.now())?;

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                changes.insert_scheduled_session(self.instance_for(&session, &contract, moved_to));
                self.ctx.store.commit(changes).await?;
                Ok((session, contract, requester))
            })
            .await?;

        tracing::info!(session_id = %session.id, "Reschedule approved");
        self.ctx
            .outbox
            .deliver(vec![MessageCard::system(
                &contract,
                contract.user_for(requester),
                SystemEvent::RescheduleApproved,
                format!("Your reschedule of session {} was approved", session.session_number),
                Some(&session),
                self.ctx.now(),
            )])
            .await;
        Ok(session)
    }

    pub async fn decline(&self, session_id: Uuid, actor: Uuid) -> Result<Session, AppError> {
        let (session, contract, requester) = self
            .ctx
            .with_retry(|| async {
                let (mut session, contract) = self.load(session_id).await?;
                let party = contract.require_party(actor)?;
                let requester = session.require_pending_reschedule("decline_reschedule")?;
                session.decline_reschedule(party, self.ctx.now())?;

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                self.ctx.store.commit(changes).await?;
                Ok((session, contract, requester))
            })
            .await?;

        tracing::info!(session_id = %session.id, "Reschedule declined");
        self.ctx
            .outbox
            .deliver(vec![MessageCard::system(
                &contract,
                contract.user_for(requester),
                SystemEvent::RescheduleDeclined,
                format!("Your reschedule of session {} was declined", session.session_number),
                Some(&session),
                self.ctx.now(),
            )])
            .await;
        Ok(session)
    }

    pub async fn expire_if_due(&self, session_id: Uuid) -> Result<bool, AppError> {
        let expired = self
            .ctx
            .with_retry(|| async {
                let (mut session, contract) = self.load(session_id).await?;
                let requester = session.reschedule_requested_by;
                if !session.expire_reschedule(self.ctx.now()) {
                    return Ok(None);
                }

                let mut changes = ChangeSet::new();
                changes.update_session(&mut session);
                self.ctx.store.commit(changes).await?;
                Ok(Some((session, contract, requester)))
            })
            .await?;

        let Some((session, contract, requester)) = expired else {
            return Ok(false);
        };
        tracing::info!(session_id = %session.id, "Pending reschedule expired");
        if let Some(requester) = requester {
            self.ctx
                .outbox
                .deliver(vec![MessageCard::system(
                    &contract,
                    contract.user_for(requester),
                    SystemEvent::RescheduleExpired,
                    format!(
                        "Your reschedule of session {} expired without an answer",
                        session.session_number
                    ),
                    Some(&session),
                    self.ctx.now(),
                )])
                .await;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 3, 9, 0, 0).unwrap()
    }

    fn booked(lead: Duration) -> Session {
        Session {
            id: Uuid::new_v4(),
            contract_id: Uuid::new_v4(),
            proposal_id: Uuid::new_v4(),
            session_number: 1,
            scheduled_at: Some(now() + lead),
            original_scheduled_at: Some(now() + lead),
            duration_minutes: 60,
            status: SessionStatus::Scheduled,
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
            reminder_sent: true,
            reminder_1h_sent: false,
            early_join_enabled: true,
            early_join_window_minutes: 15,
            grace_minutes: 10,
            buffer_minutes: 0,
            cancellation_reason: None,
            created_at: now(),
            updated_at: now(),
            version: 1,
        }
    }

    #[test]
    fn far_ahead_requests_are_auto_approved() {
        let policy = LifecyclePolicy::default();
        let mut session = booked(Duration::hours(24));
        let proposed = now() + Duration::hours(48);

        let outcome = session
            .request_reschedule(Party::Student, proposed, None, now(), &policy)
            .unwrap();
        assert_eq!(outcome, RescheduleOutcome::AutoApproved);
        assert_eq!(session.scheduled_at, Some(proposed));
        assert_eq!(session.original_scheduled_at, Some(now() + Duration::hours(24)));
        assert_eq!(session.reschedule_status, Some(RescheduleStatus::Approved));
        assert!(!session.reschedule_requested);
        assert!(!session.reminder_sent);
    }

    #[test]
    fn near_requests_wait_for_the_other_party() {
        let policy = LifecyclePolicy::default();
        let mut session = booked(Duration::hours(3));
        let original = session.scheduled_at;

        let outcome = session
            .request_reschedule(Party::Student, now() + Duration::hours(5), Some("exam".into()), now(), &policy)
            .unwrap();
        assert_eq!(outcome, RescheduleOutcome::Pending);
        assert!(session.reschedule_requested);
        assert_eq!(session.reschedule_status, Some(RescheduleStatus::Pending));
        assert_eq!(session.reschedule_deadline, Some(now() + Duration::hours(24)));
        assert_eq!(session.scheduled_at, original);

        session.decline_reschedule(Party::Coach, now()).unwrap();
        assert_eq!(session.scheduled_at, original);
        assert_eq!(session.reschedule_status, Some(RescheduleStatus::Declined));
    }

    #[test]
    fn exactly_five_hours_is_not_auto_approved() {
        let policy = LifecyclePolicy::default();
        let mut session = booked(Duration::hours(5));
        let outcome = session
            .request_reschedule(Party::Student, now() + Duration::hours(30), None, now(), &policy)
            .unwrap();
        assert_eq!(outcome, RescheduleOutcome::Pending);
    }

    #[test]
    fn coach_cannot_reschedule_inside_cutoff() {
        let policy = LifecyclePolicy::default();
        let mut session = booked(Duration::hours(8));
        let err = session
            .request_reschedule(Party::Coach, now() + Duration::hours(30), None, now(), &policy)
            .unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
        assert!(session.reschedule_requested_by.is_none());

        session
            .request_reschedule(Party::Student, now() + Duration::hours(30), None, now(), &policy)
            .unwrap();
    }

    #[test]
    fn proposed_time_needs_minimum_notice() {
        let policy = LifecyclePolicy::default();
        let mut session = booked(Duration::hours(24));
        let err = session
            .request_reschedule(Party::Student, now() + Duration::minutes(30), None, now(), &policy)
            .unwrap_err();
        assert!(matches!(err, AppError::Precondition(_)));
    }

    #[test]
    fn requester_cannot_answer_own_request() {
        let policy = LifecyclePolicy::default();
        let mut session = booked(Duration::hours(2));
        session
            .request_reschedule(Party::Student, now() + Duration::hours(6), None, now(), &policy)
            .unwrap();

        assert!(matches!(
            session.approve_reschedule(Party::Student, now()),
            Err(AppError::Authorization(_))
        ));
        let moved_to = session.approve_reschedule(Party::Coach, now()).unwrap();
        assert_eq!(session.scheduled_at, Some(moved_to));
        assert_eq!(session.reschedule_status, Some(RescheduleStatus::Approved));
    }

    #[test]
    fn answering_without_a_pending_request_fails() {
        let mut session = booked(Duration::hours(2));
        assert!(matches!(
            session.decline_reschedule(Party::Coach, now()),
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn unanswered_requests_expire_after_deadline() {
        let policy = LifecyclePolicy::default();
        let mut session = booked(Duration::hours(2));
        session
            .request_reschedule(Party::Student, now() + Duration::hours(6), None, now(), &policy)
            .unwrap();

        assert!(!session.expire_reschedule(now() + Duration::hours(24)));
        assert!(session.expire_reschedule(now() + Duration::hours(25)));
        assert_eq!(session.reschedule_status, Some(RescheduleStatus::Declined));
        assert!(!session.expire_reschedule(now() + Duration::hours(26)));
    }
}
