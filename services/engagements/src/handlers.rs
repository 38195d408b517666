use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use skillbridge_auth::{extract_token_from_headers, AuthenticatedUser};
use skillbridge_common::{ApiResponse, AppError};

use crate::{
    clock::TickTask,
    contracts::{ContractDetails, ContractTerms},
    models::{Contract, MessageCard, ScheduledSession, Session},
    payments::{webhooks, EventOutcome, PaymentIntentResponse, PayoutPreview},
    reschedule::RescheduleOutcome,
    sessions::SessionDetails,
    tick::TickReport,
    AppState,
};

fn validate<T: Validate>(request: &T) -> Result<(), AppError> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))
}

// Request bodies

#[derive(Debug, Deserialize)]
pub struct RespondToOfferRequest {
    pub accept: bool,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CancelRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BookSessionRequest {
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RescheduleRequest {
    pub proposed_time: DateTime<Utc>,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MeetingUrlRequest {
    #[validate(url)]
    pub url: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SchedulerRequest {
    #[serde(default)]
    pub task: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub limit: Option<usize>,
    /// Id of the oldest card already seen.
    pub before: Option<Uuid>,
}

// Response bodies

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RescheduleResponse {
    pub session: Session,
    pub outcome: RescheduleOutcome,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub event_id: Option<String>,
    pub outcome: Option<EventOutcome>,
}

pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy",
        service: "engagements",
        timestamp: state.engine.context.now(),
    }))
}

// Contracts

pub async fn accept_proposal(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(proposal_id): Path<Uuid>,
    Json(terms): Json<ContractTerms>,
) -> Result<Json<ApiResponse<ContractDetails>>, AppError> {
    let details = state
        .engine
        .contracts
        .accept_proposal(proposal_id, user.user_id, terms)
        .await?;
    Ok(Json(ApiResponse::success(details)))
}

pub async fn get_contract(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(contract_id): Path<Uuid>,
) -> Result<Json<ApiResponse<ContractDetails>>, AppError> {
    let details = state.engine.contracts.details(contract_id, user.user_id).await?;
    Ok(Json(ApiResponse::success(details)))
}

pub async fn respond_to_offer(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(contract_id): Path<Uuid>,
    Json(request): Json<RespondToOfferRequest>,
) -> Result<Json<ApiResponse<Contract>>, AppError> {
    let contract = state
        .engine
        .contracts
        .respond_to_offer(contract_id, user.user_id, request.accept)
        .await?;
    Ok(Json(ApiResponse::success(contract)))
}

pub async fn cancel_contract(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(contract_id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<ApiResponse<ContractDetails>>, AppError> {
    validate(&request)?;
    let details = state
        .engine
        .contracts
        .cancel_contract(contract_id, user.user_id, request.reason)
        .await?;
    Ok(Json(ApiResponse::success(details)))
}

pub async fn create_payment_intent(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(contract_id): Path<Uuid>,
) -> Result<Json<ApiResponse<PaymentIntentResponse>>, AppError> {
    let intent = state
        .engine
        .payments
        .create_payment_intent(contract_id, user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(intent)))
}

pub async fn payout_preview(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(contract_id): Path<Uuid>,
) -> Result<Json<ApiResponse<PayoutPreview>>, AppError> {
    let preview = state.engine.payments.payout_preview(contract_id, user.user_id).await?;
    Ok(Json(ApiResponse::success(preview)))
}

// Provider webhook (signature authenticated, no user token)

pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<WebhookResponse>>, AppError> {
    let signature = headers
        .get("Stripe-Signature")
        .or_else(|| headers.get("X-Signature"))
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Authentication("Missing webhook signature".to_string()))?;

    webhooks::verify_signature(
        &state.config.payments.webhook_secret,
        &body,
        signature,
        state.engine.context.now(),
    )?;

    let Some(event) = webhooks::parse_event(&body)? else {
        return Ok(Json(ApiResponse::success(WebhookResponse {
            event_id: None,
            outcome: None,
        })));
    };

    let outcome = state.engine.payments.apply_provider_event(&event).await?;
    Ok(Json(ApiResponse::success(WebhookResponse {
        event_id: Some(event.id),
        outcome: Some(outcome),
    })))
}

// Meeting links

pub async fn attach_meeting_url(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(scheduled_session_id): Path<Uuid>,
    Json(request): Json<MeetingUrlRequest>,
) -> Result<Json<ApiResponse<ScheduledSession>>, AppError> {
    validate(&request)?;
    let instance = state
        .engine
        .meeting_links
        .attach(scheduled_session_id, user.user_id, &request.url)
        .await?;
    Ok(Json(ApiResponse::success(instance)))
}

// Sessions

pub async fn get_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<SessionDetails>>, AppError> {
    let details = state.engine.sessions.details(session_id, user.user_id).await?;
    Ok(Json(ApiResponse::success(details)))
}

pub async fn book_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
    Json(request): Json<BookSessionRequest>,
) -> Result<Json<ApiResponse<Session>>, AppError> {
    let session = state
        .engine
        .sessions
        .book(session_id, user.user_id, request.scheduled_at)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn confirm_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Session>>, AppError> {
    let session = state.engine.sessions.confirm(session_id, user.user_id).await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn join_session_early(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Session>>, AppError> {
    let session = state.engine.sessions.join_early(session_id, user.user_id).await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn end_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Session>>, AppError> {
    let session = state.engine.sessions.end(session_id, user.user_id).await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn cancel_session(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<ApiResponse<Session>>, AppError> {
    validate(&request)?;
    let session = state
        .engine
        .sessions
        .cancel(session_id, user.user_id, request.reason)
        .await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn request_reschedule(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
    Json(request): Json<RescheduleRequest>,
) -> Result<Json<ApiResponse<RescheduleResponse>>, AppError> {
    validate(&request)?;
    let (session, outcome) = state
        .engine
        .reschedules
        .request(session_id, user.user_id, request.proposed_time, request.reason)
        .await?;
    Ok(Json(ApiResponse::success(RescheduleResponse { session, outcome })))
}

pub async fn approve_reschedule(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Session>>, AppError> {
    let session = state.engine.reschedules.approve(session_id, user.user_id).await?;
    Ok(Json(ApiResponse::success(session)))
}

pub async fn decline_reschedule(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<Session>>, AppError> {
    let session = state.engine.reschedules.decline(session_id, user.user_id).await?;
    Ok(Json(ApiResponse::success(session)))
}

// Messages

pub async fn list_messages(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<ApiResponse<Vec<MessageCard>>>, AppError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let cards = state
        .engine
        .context
        .store
        .messages_for(user.user_id, query.before, limit)
        .await?;
    Ok(Json(ApiResponse::success(cards)))
}

// Scheduler webhook

fn scheduler_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Scheduler-Token")
        .and_then(|value| value.to_str().ok())
        .map(|token| token.trim().to_string())
        .or_else(|| extract_token_from_headers(headers))
}

pub async fn run_scheduler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<TickReport>>, AppError> {
    let expected = &state.config.scheduler.token;
    let presented = scheduler_token(&headers).unwrap_or_default();
    if !expected.is_empty() && !webhooks::tokens_match(expected, &presented) {
        return Err(AppError::Authentication("Invalid scheduler token".to_string()));
    }

    // The cron caller may post no body at all.
    let request: SchedulerRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SchedulerRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Validation(format!("Invalid scheduler request: {}", e)))?
    };
    let task = TickTask::parse(request.task.as_deref().unwrap_or(""))?;

    let report = state.engine.scheduler.run(task).await?;
    Ok(Json(ApiResponse::success(report)))
}
