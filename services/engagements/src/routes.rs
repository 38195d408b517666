use axum::{
    routing::{get, post},
    Router,
};

use crate::{handlers, AppState};

pub fn create_routes() -> Router<AppState> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))

        // Proposal acceptance and contracts
        .route("/proposals/:proposal_id/accept", post(handlers::accept_proposal))
        .route("/contracts/:contract_id", get(handlers::get_contract))
        .route("/contracts/:contract_id/respond", post(handlers::respond_to_offer))
        .route("/contracts/:contract_id/cancel", post(handlers::cancel_contract))

        // Payments
        .route("/contracts/:contract_id/payment-intent", post(handlers::create_payment_intent))
        .route("/contracts/:contract_id/payout", get(handlers::payout_preview))
        .route("/webhooks/payment-provider", post(handlers::payment_webhook))

        // Meeting links are addressed by scheduled-session id
        .route(
            "/scheduled-sessions/:scheduled_session_id/meeting-url",
            post(handlers::attach_meeting_url),
        )

        // Session lifecycle
        .route("/sessions/:session_id", get(handlers::get_session))
        .route("/sessions/:session_id/book", post(handlers::book_session))
        .route("/sessions/:session_id/confirm", post(handlers::confirm_session))
        .route("/sessions/:session_id/join", post(handlers::join_session_early))
        .route("/sessions/:session_id/end", post(handlers::end_session))
        .route("/sessions/:session_id/cancel", post(handlers::cancel_session))
        .route("/sessions/:session_id/reschedule", post(handlers::request_reschedule))
        .route("/sessions/:session_id/reschedule/approve", post(handlers::approve_reschedule))
        .route("/sessions/:session_id/reschedule/decline", post(handlers::decline_reschedule))

        // Message cards for the caller
        .route("/messages", get(handlers::list_messages))

        // External cron trigger (token authenticated)
        .route("/api/scheduler", post(handlers::run_scheduler))
}
