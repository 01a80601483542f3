//! Session state types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Greeting shown when the bot greeting could not be generated
pub const FALLBACK_GREETING: &str =
    "Hey! Couldn't find a user right now, but you can chat with me. What's on your mind?";

/// Bot message appended when a reply could not be obtained
pub const REPLY_FALLBACK: &str = "Sorry, I'm having trouble connecting right now.";

/// Shown when the camera could not be acquired
pub const CAMERA_DENIED_REASON: &str =
    "Camera access denied. Please enable it in your browser settings.";

/// Verification progress shown as soon as the still is captured
pub const VERIFY_START_PROGRESS: u8 = 10;
/// Progress added on each tick while the classifier is pending
pub const VERIFY_PROGRESS_STEP: u8 = 5;
/// Progress never passes this value until the classifier answers
pub const VERIFY_PROGRESS_CAP: u8 = 90;
/// Progress shown once a face was detected
pub const VERIFY_DONE_PROGRESS: u8 = 100;

// ============================================================================
// Modes, attempts, messages
// ============================================================================

/// How the user wants to chat. Fixed for the duration of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    #[default]
    Text,
    Audio,
    Video,
}

impl ChatMode {
    /// Video chats must pass the selfie gate before searching
    pub fn requires_selfie(self) -> bool {
        matches!(self, ChatMode::Video)
    }

    /// Only non-text modes race a simulated peer against the bot fallback
    pub fn races_peer(self) -> bool {
        !matches!(self, ChatMode::Text)
    }

    /// Video calls stream the local camera and microphone while connected
    pub fn has_call_media(self) -> bool {
        matches!(self, ChatMode::Video)
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChatMode::Text => "text",
            ChatMode::Audio => "audio",
            ChatMode::Video => "video",
        };
        f.write_str(name)
    }
}

/// Identity of one selfie-gate run or one search attempt.
///
/// Strictly increasing within a session. Every asynchronous result carries the
/// attempt it was started for, so late results from a superseded attempt can
/// be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct AttemptId(pub u64);

impl AttemptId {
    #[must_use]
    pub fn next(self) -> Self {
        AttemptId(self.0 + 1)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who wrote a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Bot,
    Stranger,
}

/// A visible chat message. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(
        id: impl Into<String>,
        sender: Sender,
        text: impl Into<String>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            sender,
            text: text.into(),
            sent_at,
        }
    }
}

/// Outcome of one face classification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaceVerification {
    pub face_detected: bool,
    pub reason: String,
}

impl FaceVerification {
    pub fn detected(reason: impl Into<String>) -> Self {
        Self {
            face_detected: true,
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            face_detected: false,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Session phases
// ============================================================================

/// Sub-state of the selfie verification gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateState {
    /// Camera is being acquired
    Initializing,
    /// Live preview is up, capture is allowed
    Previewing,
    /// Still captured, classifier pending
    Verifying { progress: u8 },
    /// Face detected, waiting out the advance delay. Progress is always
    /// `VERIFY_DONE_PROGRESS`.
    Passed { progress: u8 },
    /// Verification or camera failed; `camera_open` tells whether retry can
    /// reuse the live stream
    Failed { reason: String, camera_open: bool },
}

/// Where a search attempt currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStage {
    /// Compatibility analysis in flight
    Analyzing,
    /// Peer and bot timers racing
    Matching,
    /// Bot timer won, greeting being generated
    StartingBot,
}

/// One continuous connected period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Episode {
    /// Simulated remote human; no chat content is modeled
    Peer,
    /// Conversational fallback
    Bot {
        messages: Vec<ChatMessage>,
        /// A reply is outstanding; input is disabled
        composing: bool,
    },
}

/// Local camera and microphone of a connected video call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallMedia {
    /// Devices being acquired
    Starting,
    Live,
    /// Access refused; the call stays up without local media
    Denied { reason: String },
}

/// Session phase. Data that only makes sense in one phase lives in that variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,

    CapturingSelfie {
        attempt: AttemptId,
        gate: GateState,
    },

    Searching {
        attempt: AttemptId,
        stage: SearchStage,
        /// Advisory compatibility text, shown while matching
        advice: Option<String>,
    },

    Connected {
        attempt: AttemptId,
        episode: Episode,
        /// `None` outside video mode
        media: Option<CallMedia>,
    },

    Error {
        message: String,
    },
}

/// Flat status as observed by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChatStatus {
    Idle,
    CapturingSelfie,
    Searching,
    Connected,
    Error,
}

/// Full state of one random chat session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionState {
    pub mode: ChatMode,
    /// Last attempt id handed out; the next attempt uses `last_attempt.next()`
    pub last_attempt: AttemptId,
    pub phase: SessionPhase,
}

impl SessionState {
    pub fn new(mode: ChatMode) -> Self {
        Self {
            mode,
            last_attempt: AttemptId::default(),
            phase: SessionPhase::Idle,
        }
    }

    pub fn status(&self) -> ChatStatus {
        match self.phase {
            SessionPhase::Idle => ChatStatus::Idle,
            SessionPhase::CapturingSelfie { .. } => ChatStatus::CapturingSelfie,
            SessionPhase::Searching { .. } => ChatStatus::Searching,
            SessionPhase::Connected { .. } => ChatStatus::Connected,
            SessionPhase::Error { .. } => ChatStatus::Error,
        }
    }

    /// Attempt that async results must match to be accepted
    pub fn current_attempt(&self) -> Option<AttemptId> {
        match &self.phase {
            SessionPhase::CapturingSelfie { attempt, .. }
            | SessionPhase::Searching { attempt, .. }
            | SessionPhase::Connected { attempt, .. } => Some(*attempt),
            SessionPhase::Idle | SessionPhase::Error { .. } => None,
        }
    }

    pub fn is_bot_backed(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Connected {
                episode: Episode::Bot { .. },
                ..
            }
        )
    }

    /// Visible messages of the current episode (empty outside a bot episode)
    pub fn messages(&self) -> &[ChatMessage] {
        match &self.phase {
            SessionPhase::Connected {
                episode: Episode::Bot { messages, .. },
                ..
            } => messages,
            _ => &[],
        }
    }

    pub fn is_composing(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Connected {
                episode: Episode::Bot { composing: true, .. },
                ..
            }
        )
    }

    /// True while the camera stream is expected to be held
    pub fn holds_camera(&self) -> bool {
        match &self.phase {
            SessionPhase::CapturingSelfie { gate, .. } => match gate {
                GateState::Previewing | GateState::Verifying { .. } | GateState::Passed { .. } => {
                    true
                }
                GateState::Failed { camera_open, .. } => *camera_open,
                GateState::Initializing => false,
            },
            SessionPhase::Connected { media, .. } => matches!(media, Some(CallMedia::Live)),
            _ => false,
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Delays driving the search race and the selfie gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Bot fallback fires after this long with no peer
    pub bot_fallback: Duration,
    /// Simulated peer is found after this long (non-text modes only)
    pub peer_match: Duration,
    /// Pause between a passed verification and the search
    pub selfie_advance: Duration,
    /// Interval of verification progress ticks
    pub progress_tick: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            bot_fallback: Duration::from_millis(3000),
            peer_match: Duration::from_millis(1500),
            selfie_advance: Duration::from_millis(500),
            progress_tick: Duration::from_millis(100),
        }
    }
}

/// Context for a session (immutable configuration)
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub timings: SessionTimings,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>, timings: SessionTimings) -> Self {
        Self {
            session_id: session_id.into(),
            timings,
        }
    }
}
