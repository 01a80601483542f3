//! Configuration read from the environment at startup

use crate::llm::{GeminiService, LlmService, LoggingService};
use crate::runtime::DEFAULT_IDLE_TIMEOUT;
use crate::state_machine::state::SessionTimings;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_PORT: u16 = 8000;

/// Generative backend configuration
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    /// Gateway base URL; requests are routed through it and it authenticates
    pub gateway: Option<String>,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_key: lookup("GEMINI_API_KEY").or_else(|| lookup("API_KEY")),
            gateway: lookup("LLM_GATEWAY").filter(|g| !g.is_empty()),
            model: lookup("GEMINI_MODEL").filter(|m| !m.is_empty()),
        }
    }

    pub fn model_id(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// Build the logged service, or `None` when there is no way to authenticate
    pub fn build_service(&self) -> Option<Arc<dyn LlmService>> {
        // In gateway mode the gateway handles authentication
        let api_key = if self.gateway.is_some() {
            "implicit".to_string()
        } else {
            self.api_key.clone().filter(|k| !k.is_empty())?
        };

        let service = GeminiService::new(api_key, self.model_id(), self.gateway.as_deref());
        Some(Arc::new(LoggingService::new(Arc::new(service))))
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub timings: SessionTimings,
    /// Sessions with no subscriber and no request for this long are evicted
    pub session_idle: Duration,
    pub llm: LlmConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = SessionTimings::default();
        let millis = |name: &str, default: Duration| {
            lookup(name)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map_or(default, Duration::from_millis)
        };

        let timings = SessionTimings {
            bot_fallback: millis("RENDEZVOUS_BOT_FALLBACK_MS", defaults.bot_fallback),
            peer_match: millis("RENDEZVOUS_PEER_MATCH_MS", defaults.peer_match),
            selfie_advance: millis("RENDEZVOUS_SELFIE_ADVANCE_MS", defaults.selfie_advance),
            progress_tick: millis("RENDEZVOUS_PROGRESS_TICK_MS", defaults.progress_tick),
        };

        Self {
            port: lookup("RENDEZVOUS_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            timings,
            session_idle: lookup("RENDEZVOUS_SESSION_IDLE_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map_or(DEFAULT_IDLE_TIMEOUT, Duration::from_secs),
            llm: LlmConfig::from_lookup(&lookup),
        }
    }
}
