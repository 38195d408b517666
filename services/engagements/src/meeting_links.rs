use url::Url;
use uuid::Uuid;

use skillbridge_common::{AppError, Party};

use crate::engine::EngineContext;
use crate::models::{MeetingStatus, MessageCard, ScheduledSession};
use crate::store::ChangeSet;

/// Accepts absolute http(s) URLs with a host and returns the trimmed form.
pub fn validate_meeting_url(raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    let parsed = Url::parse(trimmed)
        .map_err(|e| AppError::Validation(format!("Invalid meeting URL: {}", e)))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "Meeting URL must use http or https, got {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(AppError::Validation("Meeting URL must include a host".to_string()));
    }
    Ok(trimmed.to_string())
}

#[derive(Clone)]
pub struct MeetingLinkDispatcher {
    ctx: EngineContext,
}

impl MeetingLinkDispatcher {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// Attaches a meeting URL to one scheduled instance, addressed by the
    /// instance id rather than the session id.
    pub async fn attach(
        &self,
        scheduled_session_id: Uuid,
        actor: Uuid,
        url: &str,
    ) -> Result<ScheduledSession, AppError> {
        let url = validate_meeting_url(url)?;

        let (instance, session, contract) = self
            .ctx
            .with_retry(|| async {
                let store = &self.ctx.store;
                let mut instance = store.require_scheduled_session(scheduled_session_id).await?;
                let session = store.require_session(instance.session_id).await?;
                let contract = store.require_contract(session.contract_id).await?;

                if contract.party_of(actor) != Some(Party::Coach) {
                    return Err(AppError::Authorization(
                        "Only the contract's coach can attach a meeting link".to_string(),
                    ));
                }
                if session.status.is_terminal() {
                    return Err(AppError::invalid_transition("session", session.status, "attach_meeting_url"));
                }

                instance.meeting_url = Some(url.clone());
                instance.meeting_status = MeetingStatus::Ready;

                let mut changes = ChangeSet::new();
                changes.update_scheduled_session(&mut instance);
                store.commit(changes).await?;
                Ok((instance, session, contract))
            })
            .await?;

        tracing::info!(
            scheduled_session_id = %instance.id,
            session_id = %session.id,
            "Meeting link attached"
        );

        self.ctx
            .outbox
            .deliver(vec![MessageCard::meeting_link(
                &contract,
                &session,
                instance.scheduled_at,
                &url,
                self.ctx.now(),
            )])
            .await;
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_https_links() {
        let url = validate_meeting_url("  https://meet.example.com/abc-defg  ").unwrap();
        assert_eq!(url, "https://meet.example.com/abc-defg");
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(matches!(
            validate_meeting_url("ftp://files.example.com/x"),
            Err(AppError::Validation(_))
        ));
        assert!(validate_meeting_url("mailto:coach@example.com").is_err());
    }

    #[test]
    fn rejects_relative_links() {
        assert!(validate_meeting_url("/rooms/42").is_err());
        assert!(validate_meeting_url("").is_err());
    }
}
