//! Rendezvous - random chat session server
//!
//! Each session walks a state machine from idle through an optional selfie
//! gate and a peer-vs-bot search into a conversation. Clients drive sessions
//! over HTTP and follow them over SSE.

mod api;
mod assistant;
mod camera;
mod config;
mod llm;
mod runtime;
mod state_machine;

use api::{create_router, AppState};
use assistant::GeminiAssistant;
use config::AppConfig;
use llm::{GeminiService, LlmService, LoggingService};
use runtime::{SessionManager, REAP_INTERVAL};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rendezvous=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = AppConfig::from_env();

    let llm: Arc<dyn LlmService> = if let Some(service) = config.llm.build_service() {
        tracing::info!(
            model = %service.model_id(),
            gateway = config.llm.gateway.is_some(),
            "Gemini service initialized"
        );
        service
    } else {
        // Requests fail with an auth error; sessions still run on their fallbacks
        tracing::warn!("No Gemini API key configured. Set GEMINI_API_KEY or LLM_GATEWAY.");
        let service = GeminiService::new(String::new(), config.llm.model_id(), None);
        Arc::new(LoggingService::new(Arc::new(service)))
    };

    let assistant = GeminiAssistant::new(llm);
    let sessions =
        SessionManager::new(Arc::new(assistant), config.timings).with_idle_timeout(config.session_idle);
    let state = AppState::new(sessions);
    let _reaper = state.sessions.spawn_reaper(REAP_INTERVAL);

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Rendezvous server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
