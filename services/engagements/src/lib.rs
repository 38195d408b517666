pub mod clock;
pub mod config;
pub mod contracts;
pub mod engine;
pub mod handlers;
pub mod meeting_links;
pub mod messages;
pub mod models;
pub mod payments;
pub mod progress;
pub mod reschedule;
pub mod routes;
pub mod sessions;
pub mod store;
pub mod tick;

use axum::extract::FromRef;

use skillbridge_auth::JwtService;

use crate::config::EngagementsConfig;
use crate::engine::Engine;

#[derive(Clone)]
pub struct AppState {
    pub config: EngagementsConfig,
    pub jwt_service: JwtService,
    pub engine: Engine,
}

impl FromRef<AppState> for JwtService {
    fn from_ref(state: &AppState) -> Self {
        state.jwt_service.clone()
    }
}
