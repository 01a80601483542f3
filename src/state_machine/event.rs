//! Events that can occur in a session

use super::state::{AttemptId, ChatMode, FaceVerification};
use chrono::{DateTime, Utc};

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum Event {
    // User events
    SelectMode {
        mode: ChatMode,
    },
    Start,
    /// Capture a still from the live preview and verify it
    Capture,
    /// Return to the preview after a failed verification
    RetryCapture,
    /// Leave the selfie gate
    CancelCapture,
    UserMessage {
        text: String,
        message_id: String,
        sent_at: DateTime<Utc>,
    },
    /// Discard the current episode and search again
    Next,
    /// Reset to idle from anywhere
    Stop,

    // Camera events
    CameraReady {
        attempt: AttemptId,
    },
    CameraFailed {
        attempt: AttemptId,
        reason: String,
    },

    // Selfie gate events
    VerifyProgress {
        attempt: AttemptId,
    },
    FaceVerified {
        attempt: AttemptId,
        result: FaceVerification,
    },
    SelfieAccepted {
        attempt: AttemptId,
    },

    // Search events
    AnalysisComplete {
        attempt: AttemptId,
        advice: String,
    },
    AnalysisFailed {
        attempt: AttemptId,
        message: String,
    },
    PeerFound {
        attempt: AttemptId,
    },
    BotFallbackDue {
        attempt: AttemptId,
    },

    // Bot events
    BotGreeting {
        attempt: AttemptId,
        /// `None` when greeting generation failed
        greeting: Option<String>,
        message_id: String,
        sent_at: DateTime<Utc>,
    },
    BotReply {
        attempt: AttemptId,
        /// `Err` carries the failure message; the user sees a fixed fallback
        reply: Result<String, String>,
        message_id: String,
        sent_at: DateTime<Utc>,
    },
}

impl Event {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Event::SelectMode { .. } => "select_mode",
            Event::Start => "start",
            Event::Capture => "capture",
            Event::RetryCapture => "retry_capture",
            Event::CancelCapture => "cancel_capture",
            Event::UserMessage { .. } => "user_message",
            Event::Next => "next",
            Event::Stop => "stop",
            Event::CameraReady { .. } => "camera_ready",
            Event::CameraFailed { .. } => "camera_failed",
            Event::VerifyProgress { .. } => "verify_progress",
            Event::FaceVerified { .. } => "face_verified",
            Event::SelfieAccepted { .. } => "selfie_accepted",
            Event::AnalysisComplete { .. } => "analysis_complete",
            Event::AnalysisFailed { .. } => "analysis_failed",
            Event::PeerFound { .. } => "peer_found",
            Event::BotFallbackDue { .. } => "bot_fallback_due",
            Event::BotGreeting { .. } => "bot_greeting",
            Event::BotReply { .. } => "bot_reply",
        }
    }

    /// Attempt an asynchronous result belongs to; `None` for user events
    pub fn attempt(&self) -> Option<AttemptId> {
        match self {
            Event::CameraReady { attempt }
            | Event::CameraFailed { attempt, .. }
            | Event::VerifyProgress { attempt }
            | Event::FaceVerified { attempt, .. }
            | Event::SelfieAccepted { attempt }
            | Event::AnalysisComplete { attempt, .. }
            | Event::AnalysisFailed { attempt, .. }
            | Event::PeerFound { attempt }
            | Event::BotFallbackDue { attempt }
            | Event::BotGreeting { attempt, .. }
            | Event::BotReply { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }
}
