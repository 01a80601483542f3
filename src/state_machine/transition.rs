//! Pure state transition function
//!
//! Given the same state, context and event this always produces the same
//! result, with no I/O. Results of asynchronous work are only applied when
//! they belong to the current attempt and the phase still expects them;
//! anything else is a no-op.

use super::effect::SearchTimer;
use super::state::{
    AttemptId, CallMedia, ChatMessage, ChatMode, ChatStatus, Episode, GateState, SearchStage, Sender,
    SessionContext, SessionPhase, SessionState, FALLBACK_GREETING, REPLY_FALLBACK,
    VERIFY_DONE_PROGRESS, VERIFY_PROGRESS_CAP, VERIFY_PROGRESS_STEP, VERIFY_START_PROGRESS,
};
use super::{Effect, Event};
use thiserror::Error;

/// Shown when the compatibility check aborts a search
pub const SEARCH_FAILED_MESSAGE: &str = "Could not connect to a user. Please try again.";

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: SessionState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: SessionState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    /// The event was accepted but changes nothing (stale or duplicate result)
    pub fn unchanged(state: &SessionState) -> Self {
        Self::new(state.clone())
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    #[must_use]
    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition. The state is left untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Chat mode can only be changed while idle")]
    ModeLocked,
    #[error("A chat is already in progress ({0:?})")]
    AlreadyActive(ChatStatus),
    #[error("Camera preview is not ready")]
    CameraNotReady,
    #[error("A capture is already being verified")]
    CaptureInProgress,
    #[error("Nothing to retry")]
    NothingToRetry,
    #[error("Message is empty")]
    EmptyMessage,
    #[error("No bot conversation is active")]
    NoBotSession,
    #[error("Bot is still replying")]
    BotBusy,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
#[allow(clippy::too_many_lines)] // One arm per (phase, event) pair reads best flat
pub fn transition(
    state: &SessionState,
    context: &SessionContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    let current = state.current_attempt();
    let timings = &context.timings;

    match (&state.phase, event) {
        // ============================================================
        // Mode selection and start
        // ============================================================
        (SessionPhase::Idle, Event::SelectMode { mode }) => {
            let new_state = SessionState {
                mode,
                ..state.clone()
            };
            Ok(TransitionResult::new(new_state).with_effect(Effect::PublishState))
        }

        (_, Event::SelectMode { .. }) => Err(TransitionError::ModeLocked),

        // Idle + Start (video) -> CapturingSelfie
        (SessionPhase::Idle, Event::Start) if state.mode.requires_selfie() => {
            let attempt = state.last_attempt.next();
            let new_state = SessionState {
                mode: state.mode,
                last_attempt: attempt,
                phase: SessionPhase::CapturingSelfie {
                    attempt,
                    gate: GateState::Initializing,
                },
            };
            Ok(TransitionResult::new(new_state)
                .with_effect(Effect::BeginAttempt { attempt })
                .with_effect(Effect::OpenCamera { attempt })
                .with_effect(Effect::PublishState))
        }

        // Idle + Start (text/audio) -> Searching
        (SessionPhase::Idle, Event::Start) => Ok(begin_search(state, state.mode)),

        (_, Event::Start) => Err(TransitionError::AlreadyActive(state.status())),

        // ============================================================
        // Selfie gate: camera
        // ============================================================
        (
            SessionPhase::CapturingSelfie {
                attempt,
                gate: GateState::Initializing,
            },
            Event::CameraReady { attempt: ready },
        ) if *attempt == ready => Ok(TransitionResult::new(with_gate(
            state,
            *attempt,
            GateState::Previewing,
        ))
        .with_effect(Effect::PublishState)),

        (
            SessionPhase::CapturingSelfie {
                attempt,
                gate: GateState::Initializing,
            },
            Event::CameraFailed {
                attempt: failed,
                reason,
            },
        ) if *attempt == failed => Ok(TransitionResult::new(with_gate(
            state,
            *attempt,
            GateState::Failed {
                reason,
                camera_open: false,
            },
        ))
        .with_effect(Effect::PublishState)),

        // ============================================================
        // Selfie gate: capture and verification
        // ============================================================
        (
            SessionPhase::CapturingSelfie {
                attempt,
                gate: GateState::Previewing,
            },
            Event::Capture,
        ) => Ok(TransitionResult::new(with_gate(
            state,
            *attempt,
            GateState::Verifying {
                progress: VERIFY_START_PROGRESS,
            },
        ))
        .with_effect(Effect::VerifySelfie { attempt: *attempt })
        .with_effect(Effect::StartProgressTicker {
            attempt: *attempt,
            every: timings.progress_tick,
        })
        .with_effect(Effect::PublishState)),

        (
            SessionPhase::CapturingSelfie {
                gate: GateState::Verifying { .. } | GateState::Passed { .. },
                ..
            },
            Event::Capture,
        ) => Err(TransitionError::CaptureInProgress),

        (SessionPhase::CapturingSelfie { .. }, Event::Capture) => {
            Err(TransitionError::CameraNotReady)
        }

        (
            SessionPhase::CapturingSelfie {
                attempt,
                gate: GateState::Verifying { progress },
            },
            Event::VerifyProgress { attempt: tick },
        ) if *attempt == tick => {
            let progress = progress
                .saturating_add(VERIFY_PROGRESS_STEP)
                .min(VERIFY_PROGRESS_CAP);
            Ok(TransitionResult::new(with_gate(
                state,
                *attempt,
                GateState::Verifying { progress },
            ))
            .with_effect(Effect::PublishState))
        }

        (
            SessionPhase::CapturingSelfie {
                attempt,
                gate: GateState::Verifying { .. },
            },
            Event::FaceVerified {
                attempt: verified,
                result,
            },
        ) if *attempt == verified => {
            let attempt = *attempt;
            if result.face_detected {
                let passed = GateState::Passed {
                    progress: VERIFY_DONE_PROGRESS,
                };
                Ok(TransitionResult::new(with_gate(state, attempt, passed))
                    .with_effect(Effect::StopProgressTicker { attempt })
                    .with_effect(Effect::ScheduleSelfieAdvance {
                        attempt,
                        delay: timings.selfie_advance,
                    })
                    .with_effect(Effect::PublishState))
            } else {
                Ok(TransitionResult::new(with_gate(
                    state,
                    attempt,
                    GateState::Failed {
                        reason: result.reason,
                        camera_open: true,
                    },
                ))
                .with_effect(Effect::StopProgressTicker { attempt })
                .with_effect(Effect::PublishState))
            }
        }

        // Passed + SelfieAccepted -> Searching (the only way forward out of the gate)
        (
            SessionPhase::CapturingSelfie {
                attempt,
                gate: GateState::Passed { .. },
            },
            Event::SelfieAccepted { attempt: accepted },
        ) if *attempt == accepted => {
            let result = begin_search(state, state.mode);
            let mut effects = vec![Effect::ReleaseCamera];
            effects.extend(result.effects);
            Ok(TransitionResult::new(result.new_state).with_effects(effects))
        }

        (
            SessionPhase::CapturingSelfie {
                attempt,
                gate: GateState::Failed { camera_open, .. },
            },
            Event::RetryCapture,
        ) => {
            if *camera_open {
                Ok(
                    TransitionResult::new(with_gate(state, *attempt, GateState::Previewing))
                        .with_effect(Effect::PublishState),
                )
            } else {
                Ok(TransitionResult::new(with_gate(
                    state,
                    *attempt,
                    GateState::Initializing,
                ))
                .with_effect(Effect::OpenCamera { attempt: *attempt })
                .with_effect(Effect::PublishState))
            }
        }

        (_, Event::RetryCapture) => Err(TransitionError::NothingToRetry),

        // CapturingSelfie + Cancel/Stop -> Idle
        (SessionPhase::CapturingSelfie { .. }, Event::CancelCapture | Event::Stop) => {
            Ok(TransitionResult::new(to_idle(state))
                .with_effect(Effect::AbortAttempt)
                .with_effect(Effect::ReleaseCamera)
                .with_effect(Effect::PublishState))
        }

        (_, Event::CancelCapture) => Err(TransitionError::InvalidTransition(
            "Not capturing a selfie".to_string(),
        )),

        // ============================================================
        // Search
        // ============================================================
        (
            SessionPhase::Searching {
                attempt,
                stage: SearchStage::Analyzing,
                ..
            },
            Event::AnalysisComplete {
                attempt: analyzed,
                advice,
            },
        ) if *attempt == analyzed => {
            let attempt = *attempt;
            let new_state = SessionState {
                phase: SessionPhase::Searching {
                    attempt,
                    stage: SearchStage::Matching,
                    advice: Some(advice),
                },
                ..state.clone()
            };
            let mut result = TransitionResult::new(new_state).with_effect(Effect::start_timer(
                attempt,
                SearchTimer::BotFallback,
                timings.bot_fallback,
            ));
            if state.mode.races_peer() {
                result = result.with_effect(Effect::start_timer(
                    attempt,
                    SearchTimer::Peer,
                    timings.peer_match,
                ));
            }
            Ok(result.with_effect(Effect::PublishState))
        }

        (
            SessionPhase::Searching {
                attempt,
                stage: SearchStage::Analyzing,
                ..
            },
            Event::AnalysisFailed {
                attempt: failed, ..
            },
        ) if *attempt == failed => {
            let new_state = SessionState {
                phase: SessionPhase::Error {
                    message: SEARCH_FAILED_MESSAGE.to_string(),
                },
                ..state.clone()
            };
            Ok(TransitionResult::new(new_state)
                .with_effect(Effect::AbortAttempt)
                .with_effect(Effect::PublishState))
        }

        // Peer timer won the race
        (
            SessionPhase::Searching {
                attempt,
                stage: SearchStage::Matching,
                ..
            },
            Event::PeerFound { attempt: found },
        ) if *attempt == found => {
            let attempt = *attempt;
            Ok(connect(state, attempt, Episode::Peer)
                .with_effect(Effect::CancelTimer {
                    attempt,
                    timer: SearchTimer::BotFallback,
                })
                .with_effect(Effect::PublishState))
        }

        // Bot fallback timer won the race
        (
            SessionPhase::Searching {
                attempt,
                stage: SearchStage::Matching,
                advice,
            },
            Event::BotFallbackDue { attempt: due },
        ) if *attempt == due => {
            let attempt = *attempt;
            let new_state = SessionState {
                phase: SessionPhase::Searching {
                    attempt,
                    stage: SearchStage::StartingBot,
                    advice: advice.clone(),
                },
                ..state.clone()
            };
            let mut result = TransitionResult::new(new_state);
            if state.mode.races_peer() {
                result = result.with_effect(Effect::CancelTimer {
                    attempt,
                    timer: SearchTimer::Peer,
                });
            }
            Ok(result
                .with_effect(Effect::GenerateGreeting { attempt })
                .with_effect(Effect::PublishState))
        }

        // Greeting (or its failure) arrives -> Connected with exactly one bot message
        (
            SessionPhase::Searching {
                attempt,
                stage: SearchStage::StartingBot,
                ..
            },
            Event::BotGreeting {
                attempt: greeted,
                greeting,
                message_id,
                sent_at,
            },
        ) if *attempt == greeted => {
            let attempt = *attempt;
            let greeting = greeting.filter(|g| !g.trim().is_empty());
            let text = greeting
                .clone()
                .unwrap_or_else(|| FALLBACK_GREETING.to_string());
            let message = ChatMessage::new(message_id, Sender::Bot, text, sent_at);
            let episode = Episode::Bot {
                messages: vec![message.clone()],
                composing: false,
            };
            Ok(connect(state, attempt, episode)
                .with_effect(Effect::OpenBotSession { attempt, greeting })
                .with_effect(Effect::notify_message(&message))
                .with_effect(Effect::PublishState))
        }

        // ============================================================
        // Bot conversation
        // ============================================================
        (_, Event::UserMessage { text, .. }) if text.trim().is_empty() => {
            Err(TransitionError::EmptyMessage)
        }

        (
            SessionPhase::Connected {
                attempt,
                episode:
                    Episode::Bot {
                        messages,
                        composing,
                    },
                media,
            },
            Event::UserMessage {
                text,
                message_id,
                sent_at,
            },
        ) => {
            if *composing {
                return Err(TransitionError::BotBusy);
            }
            let attempt = *attempt;
            let text = text.trim().to_string();
            let message = ChatMessage::new(message_id, Sender::User, text.clone(), sent_at);
            let mut messages = messages.clone();
            messages.push(message.clone());
            let new_state = SessionState {
                phase: SessionPhase::Connected {
                    attempt,
                    episode: Episode::Bot {
                        messages,
                        composing: true,
                    },
                    media: media.clone(),
                },
                ..state.clone()
            };
            Ok(TransitionResult::new(new_state)
                .with_effect(Effect::notify_message(&message))
                .with_effect(Effect::SendToBot { attempt, text })
                .with_effect(Effect::PublishState))
        }

        (_, Event::UserMessage { .. }) => Err(TransitionError::NoBotSession),

        (
            SessionPhase::Connected {
                attempt,
                episode:
                    Episode::Bot {
                        messages,
                        composing: true,
                    },
                media,
            },
            Event::BotReply {
                attempt: replied,
                reply,
                message_id,
                sent_at,
            },
        ) if *attempt == replied => {
            let attempt = *attempt;
            let text = reply.unwrap_or_else(|_| REPLY_FALLBACK.to_string());
            let message = ChatMessage::new(message_id, Sender::Bot, text, sent_at);
            let mut messages = messages.clone();
            messages.push(message.clone());
            let new_state = SessionState {
                phase: SessionPhase::Connected {
                    attempt,
                    episode: Episode::Bot {
                        messages,
                        composing: false,
                    },
                    media: media.clone(),
                },
                ..state.clone()
            };
            Ok(TransitionResult::new(new_state)
                .with_effect(Effect::notify_message(&message))
                .with_effect(Effect::PublishState))
        }

        // ============================================================
        // Video call media
        // ============================================================
        (
            SessionPhase::Connected {
                attempt,
                media: Some(CallMedia::Starting),
                ..
            },
            Event::CameraReady { attempt: ready },
        ) if *attempt == ready => Ok(TransitionResult::new(with_media(state, CallMedia::Live))
            .with_effect(Effect::PublishState)),

        (
            SessionPhase::Connected {
                attempt,
                media: Some(CallMedia::Starting),
                ..
            },
            Event::CameraFailed {
                attempt: failed,
                reason,
            },
        ) if *attempt == failed => Ok(TransitionResult::new(with_media(
            state,
            CallMedia::Denied { reason },
        ))
        .with_effect(Effect::PublishState)),

        // ============================================================
        // Next / Stop
        // ============================================================
        (SessionPhase::Connected { episode, media, .. }, Event::Next) => {
            let result = begin_search(state, state.mode);
            let mut effects = leave_episode(episode, media.as_ref());
            effects.extend(result.effects);
            Ok(TransitionResult::new(result.new_state).with_effects(effects))
        }

        (_, Event::Next) => Err(TransitionError::InvalidTransition(format!(
            "Cannot search for the next match while {:?}",
            state.status()
        ))),

        (SessionPhase::Idle, Event::Stop) => Ok(TransitionResult::unchanged(state)),

        (SessionPhase::Connected { episode, media, .. }, Event::Stop) => {
            Ok(TransitionResult::new(to_idle(state))
                .with_effect(Effect::AbortAttempt)
                .with_effects(leave_episode(episode, media.as_ref()))
                .with_effect(Effect::PublishState))
        }

        (SessionPhase::Searching { .. } | SessionPhase::Error { .. }, Event::Stop) => {
            Ok(TransitionResult::new(to_idle(state))
                .with_effect(Effect::AbortAttempt)
                .with_effect(Effect::PublishState))
        }

        // ============================================================
        // Stale or duplicate asynchronous results
        // ============================================================
        (_, event) if event.attempt().is_some() => {
            tracing::debug!(
                event = event.name(),
                event_attempt = ?event.attempt(),
                current_attempt = ?current,
                "Discarding stale result"
            );
            Ok(TransitionResult::unchanged(state))
        }

        (_, event) => Err(TransitionError::InvalidTransition(format!(
            "No transition from {:?} with event {}",
            state.status(),
            event.name()
        ))),
    }
}

// Helper functions

/// Start a fresh search attempt
fn begin_search(state: &SessionState, mode: ChatMode) -> TransitionResult {
    let attempt = state.last_attempt.next();
    let new_state = SessionState {
        mode,
        last_attempt: attempt,
        phase: SessionPhase::Searching {
            attempt,
            stage: SearchStage::Analyzing,
            advice: None,
        },
    };
    TransitionResult::new(new_state)
        .with_effect(Effect::BeginAttempt { attempt })
        .with_effect(Effect::AnalyzeCompatibility { attempt })
        .with_effect(Effect::PublishState)
}

/// Enter a connected episode. Video calls acquire the local camera and microphone.
fn connect(state: &SessionState, attempt: AttemptId, episode: Episode) -> TransitionResult {
    let media = state.mode.has_call_media().then_some(CallMedia::Starting);
    let opens_media = media.is_some();
    let new_state = SessionState {
        phase: SessionPhase::Connected {
            attempt,
            episode,
            media,
        },
        ..state.clone()
    };
    let result = TransitionResult::new(new_state);
    if opens_media {
        result.with_effect(Effect::OpenCamera { attempt })
    } else {
        result
    }
}

/// Resources a connected episode holds that must go when it ends
fn leave_episode(episode: &Episode, media: Option<&CallMedia>) -> Vec<Effect> {
    let mut effects = Vec::new();
    if media.is_some() {
        effects.push(Effect::ReleaseCamera);
    }
    if matches!(episode, Episode::Bot { .. }) {
        effects.push(Effect::DisposeBotSession);
    }
    effects
}

fn with_media(state: &SessionState, media: CallMedia) -> SessionState {
    let mut new_state = state.clone();
    if let SessionPhase::Connected { media: current, .. } = &mut new_state.phase {
        *current = Some(media);
    }
    new_state
}

fn with_gate(state: &SessionState, attempt: AttemptId, gate: GateState) -> SessionState {
    SessionState {
        phase: SessionPhase::CapturingSelfie { attempt, gate },
        ..state.clone()
    }
}

fn to_idle(state: &SessionState) -> SessionState {
    SessionState {
        phase: SessionPhase::Idle,
        ..state.clone()
    }
}
