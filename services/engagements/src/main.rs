use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method, StatusCode},
    response::Json,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skillbridge_auth::JwtService;
use skillbridge_common::ApiResponse;
use skillbridge_database::{create_pool, run_migrations};
use skillbridge_engagements::{
    clock::system_clock,
    config::{EngagementsConfig, StoreBackend},
    engine::{Engine, EngineContext},
    payments::provider::StripeProvider,
    routes,
    store::{EngagementStore, MemoryStore, PgStore},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skillbridge_engagements=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = EngagementsConfig::from_env()?;

    let store: Arc<dyn EngagementStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = create_pool(&config.database).await?;
            run_migrations(&pool).await?;
            Arc::new(PgStore::new(pool))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    if config.payments.webhook_secret.is_empty() {
        tracing::warn!("PAYMENT_WEBHOOK_SECRET is empty; provider webhooks will be rejected");
    }

    let context = EngineContext::new(store, system_clock(), config.policy.clone());
    let provider = Arc::new(StripeProvider::new(&config.payments));
    let engine = Engine::new(context, provider, &config.payments, &config.scheduler);

    let app_state = AppState {
        jwt_service: JwtService::new(&config.jwt),
        config: config.clone(),
        engine,
    };

    // Build CORS layer from the configured origins
    let origins: Vec<HeaderValue> = config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(AllowOrigin::list(origins));

    // Build the application
    let app = routes::create_routes()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(app_state)
        .fallback(handler_404);

    // Start the server
    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.server.host, config.server.port)).await?;

    tracing::info!(
        "Engagements service listening on {}:{}",
        config.server.host,
        config.server.port
    );

    axum::serve(listener, app).await?;

    Ok(())
}

async fn handler_404() -> (StatusCode, Json<ApiResponse<()>>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error("Endpoint not found".to_string())),
    )
}
