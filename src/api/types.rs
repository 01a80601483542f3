//! API request and response types

use crate::state_machine::ChatMode;
use serde::{Deserialize, Serialize};

/// Request to create a new session
#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub mode: ChatMode,
}

/// Request to change the chat mode
#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: ChatMode,
}

/// Request to send a chat message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

/// A preview frame relayed from the browser camera
#[derive(Debug, Deserialize)]
pub struct FrameRequest {
    pub data_uri: String,
}

/// The browser could not get camera access
#[derive(Debug, Default, Deserialize)]
pub struct CameraDeniedRequest {
    pub reason: Option<String>,
}

/// Response with a newly created session
#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub id: String,
    pub state: serde_json::Value,
}

/// Response with a session snapshot
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub state: serde_json::Value,
}

/// Response for queued actions
#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub queued: bool,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
