//! Effects produced by state transitions

use super::state::{AttemptId, ChatMessage};
use std::time::Duration;

/// The two competing search timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchTimer {
    Peer,
    BotFallback,
}

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Invalidate everything owned by the previous attempt and start tracking
    /// this one
    BeginAttempt { attempt: AttemptId },

    /// Invalidate everything owned by the current attempt
    AbortAttempt,

    /// Acquire the camera for the selfie gate, or camera and microphone for a video call
    OpenCamera { attempt: AttemptId },

    /// Stop all camera and microphone tracks
    ReleaseCamera,

    /// Capture a still from the open stream and classify it
    VerifySelfie { attempt: AttemptId },

    /// Emit `VerifyProgress` every tick until the classifier answers
    StartProgressTicker { attempt: AttemptId, every: Duration },

    /// Stop the progress ticker of this attempt
    StopProgressTicker { attempt: AttemptId },

    /// Emit `SelfieAccepted` after the perceptual delay
    ScheduleSelfieAdvance { attempt: AttemptId, delay: Duration },

    /// Ask for the advisory compatibility text
    AnalyzeCompatibility { attempt: AttemptId },

    StartTimer {
        attempt: AttemptId,
        timer: SearchTimer,
        delay: Duration,
    },

    CancelTimer { attempt: AttemptId, timer: SearchTimer },

    /// Generate the one-off bot greeting
    GenerateGreeting { attempt: AttemptId },

    /// Open the bot conversation handle, seeded with the greeting when present
    OpenBotSession {
        attempt: AttemptId,
        greeting: Option<String>,
    },

    /// Drop the bot conversation handle
    DisposeBotSession,

    /// Send a user message through the bot handle
    SendToBot { attempt: AttemptId, text: String },

    /// Publish the new state to connected clients
    PublishState,

    /// Tell connected clients a message was appended
    NotifyMessage { message: ChatMessage },
}

impl Effect {
    pub fn notify_message(message: &ChatMessage) -> Self {
        Effect::NotifyMessage {
            message: message.clone(),
        }
    }

    pub fn start_timer(attempt: AttemptId, timer: SearchTimer, delay: Duration) -> Self {
        Effect::StartTimer {
            attempt,
            timer,
            delay,
        }
    }
}
