//! Session runtime executor

use super::traits::{Assistant, BotSession, Camera, CameraStream};
use super::{snapshot_json, SessionUpdate};

use crate::camera::DeviceError;
use crate::state_machine::state::CAMERA_DENIED_REASON;
use crate::state_machine::{
    transition, AttemptId, Effect, Event, FaceVerification, SearchTimer, SessionContext,
    SessionState,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

type OpenedCamera = (AttemptId, Result<Box<dyn CameraStream>, DeviceError>);

/// Live camera stream, stopped when dropped
struct CameraGuard {
    attempt: AttemptId,
    stream: Box<dyn CameraStream>,
}

impl Drop for CameraGuard {
    fn drop(&mut self) {
        self.stream.stop();
    }
}

/// Bot conversation owned by one connected episode
struct BotHandle {
    attempt: AttemptId,
    session: Arc<dyn BotSession>,
}

/// Runtime for one session, generic over the camera and the generative backend
pub struct SessionRuntime<C, A>
where
    C: Camera + ?Sized + 'static,
    A: Assistant + ?Sized + 'static,
{
    context: SessionContext,
    state: SessionState,
    camera: Arc<C>,
    assistant: Arc<A>,
    event_rx: mpsc::Receiver<Event>,
    event_tx: mpsc::Sender<Event>,
    broadcast_tx: broadcast::Sender<SessionUpdate>,
    snapshot_tx: watch::Sender<SessionState>,
    /// Current attempt and the token every task of that attempt races against
    attempt: Option<(AttemptId, CancellationToken)>,
    timers: HashMap<SearchTimer, CancellationToken>,
    ticker: Option<CancellationToken>,
    camera_stream: Option<CameraGuard>,
    camera_tx: mpsc::Sender<OpenedCamera>,
    camera_rx: mpsc::Receiver<OpenedCamera>,
    bot: Option<BotHandle>,
    shutdown: CancellationToken,
}

impl<C, A> SessionRuntime<C, A>
where
    C: Camera + ?Sized + 'static,
    A: Assistant + ?Sized + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: SessionContext,
        state: SessionState,
        camera: Arc<C>,
        assistant: Arc<A>,
        event_rx: mpsc::Receiver<Event>,
        event_tx: mpsc::Sender<Event>,
        broadcast_tx: broadcast::Sender<SessionUpdate>,
        snapshot_tx: watch::Sender<SessionState>,
    ) -> Self {
        let (camera_tx, camera_rx) = mpsc::channel(4);
        Self {
            context,
            state,
            camera,
            assistant,
            event_rx,
            event_tx,
            broadcast_tx,
            snapshot_tx,
            attempt: None,
            timers: HashMap::new(),
            ticker: None,
            camera_stream: None,
            camera_tx,
            camera_rx,
            bot: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop the runtime when this token is cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub async fn run(mut self) {
        tracing::info!(session_id = %self.context.session_id, "Starting session runtime");

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,

                Some(event) = self.event_rx.recv() => {
                    self.process_event(event);
                }

                Some((attempt, opened)) = self.camera_rx.recv() => {
                    self.camera_opened(attempt, opened);
                }

                else => break,
            }
        }

        self.teardown();
        tracing::info!(session_id = %self.context.session_id, "Session runtime stopped");
    }

    fn process_event(&mut self, event: Event) {
        // Some effects answer immediately; those events are handled in the same turn
        let mut events_to_process = vec![event];

        while let Some(current_event) = events_to_process.pop() {
            let event_name = current_event.name();

            // Pure state transition
            let result = match transition(&self.state, &self.context, current_event) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(
                        session_id = %self.context.session_id,
                        event = event_name,
                        error = %e,
                        "Rejected event"
                    );
                    let _ = self.broadcast_tx.send(SessionUpdate::Error {
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let old_status = self.state.status();
            self.state = result.new_state;
            if old_status != self.state.status() {
                tracing::info!(
                    session_id = %self.context.session_id,
                    from = ?old_status,
                    to = ?self.state.status(),
                    event = event_name,
                    "Session status changed"
                );
            }

            for effect in result.effects {
                if let Some(generated_event) = self.execute_effect(effect) {
                    events_to_process.push(generated_event);
                }
            }
        }
    }

    /// A camera open finished. Only the attempt that asked for it may keep it.
    fn camera_opened(
        &mut self,
        attempt: AttemptId,
        opened: Result<Box<dyn CameraStream>, DeviceError>,
    ) {
        let event = match opened {
            Ok(stream) => {
                let guard = CameraGuard { attempt, stream };
                if self.is_live(attempt) && self.camera_stream.is_none() {
                    self.camera_stream = Some(guard);
                } else {
                    tracing::debug!(%attempt, "Dropping camera opened for a stale attempt");
                    drop(guard);
                }
                Event::CameraReady { attempt }
            }
            Err(e) => {
                tracing::warn!(%attempt, error = %e, "Camera unavailable");
                let reason = match e {
                    DeviceError::PermissionDenied(reason) if !reason.is_empty() => reason,
                    _ => CAMERA_DENIED_REASON.to_string(),
                };
                Event::CameraFailed { attempt, reason }
            }
        };
        self.process_event(event);
    }

    /// Execute an effect and optionally return an event that is already known
    #[allow(clippy::too_many_lines)] // One arm per effect
    fn execute_effect(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::BeginAttempt { attempt } => {
                self.cancel_attempt();
                self.attempt = Some((attempt, CancellationToken::new()));
                tracing::debug!(session_id = %self.context.session_id, %attempt, "Attempt started");
                None
            }

            Effect::AbortAttempt => {
                self.cancel_attempt();
                None
            }

            Effect::OpenCamera { attempt } => {
                let token = self.attempt_token(attempt)?;
                let camera = Arc::clone(&self.camera);
                let camera_tx = self.camera_tx.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        () = token.cancelled() => {
                            tracing::debug!(%attempt, "Camera open abandoned");
                        }
                        opened = camera.open() => {
                            // Closed receiver drops the stream, which stops it
                            let _ = camera_tx.send((attempt, opened)).await;
                        }
                    }
                });
                None
            }

            Effect::ReleaseCamera => {
                if let Some(guard) = self.camera_stream.take() {
                    tracing::debug!(attempt = %guard.attempt, "Releasing camera");
                }
                None
            }

            Effect::VerifySelfie { attempt } => {
                let token = self.attempt_token(attempt)?;
                let still = match self.camera_stream.as_mut() {
                    Some(guard) => guard.stream.capture_still(),
                    None => Err(DeviceError::NotOpen),
                };
                let image = match still {
                    Ok(image) => image,
                    Err(e) => {
                        tracing::warn!(%attempt, error = %e, "Could not capture a still");
                        return Some(Event::FaceVerified {
                            attempt,
                            result: FaceVerification::rejected(e.to_string()),
                        });
                    }
                };

                let assistant = Arc::clone(&self.assistant);
                self.spawn_guarded(token, async move {
                    let result = assistant.detect_face(&image).await;
                    tracing::info!(
                        %attempt,
                        face_detected = result.face_detected,
                        reason = %result.reason,
                        "Selfie verified"
                    );
                    Event::FaceVerified { attempt, result }
                });
                None
            }

            Effect::StartProgressTicker { attempt, every } => {
                let token = self.attempt_token(attempt)?.child_token();
                if let Some(previous) = self.ticker.replace(token.clone()) {
                    previous.cancel();
                }
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(every);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    // First tick completes immediately
                    interval.tick().await;
                    loop {
                        tokio::select! {
                            biased;
                            () = token.cancelled() => break,
                            _ = interval.tick() => {
                                if event_tx.send(Event::VerifyProgress { attempt }).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
                None
            }

            Effect::StopProgressTicker { attempt } => {
                if let Some(token) = self.ticker.take() {
                    tracing::debug!(%attempt, "Stopping progress ticker");
                    token.cancel();
                }
                None
            }

            Effect::ScheduleSelfieAdvance { attempt, delay } => {
                let token = self.attempt_token(attempt)?;
                self.spawn_guarded(token, async move {
                    tokio::time::sleep(delay).await;
                    Event::SelfieAccepted { attempt }
                });
                None
            }

            Effect::AnalyzeCompatibility { attempt } => {
                let token = self.attempt_token(attempt)?;
                let assistant = Arc::clone(&self.assistant);
                self.spawn_guarded(token, async move {
                    match assistant.analyze_compatibility().await {
                        Ok(advice) => Event::AnalysisComplete { attempt, advice },
                        Err(e) => {
                            tracing::error!(%attempt, error = %e, "Compatibility analysis failed");
                            Event::AnalysisFailed {
                                attempt,
                                message: e.message,
                            }
                        }
                    }
                });
                None
            }

            Effect::StartTimer {
                attempt,
                timer,
                delay,
            } => {
                let token = self.attempt_token(attempt)?.child_token();
                if let Some(previous) = self.timers.insert(timer, token.clone()) {
                    previous.cancel();
                }
                self.spawn_guarded(token, async move {
                    tokio::time::sleep(delay).await;
                    tracing::debug!(%attempt, ?timer, "Search timer fired");
                    match timer {
                        SearchTimer::Peer => Event::PeerFound { attempt },
                        SearchTimer::BotFallback => Event::BotFallbackDue { attempt },
                    }
                });
                None
            }

            Effect::CancelTimer { attempt, timer } => {
                if let Some(token) = self.timers.remove(&timer) {
                    tracing::debug!(%attempt, ?timer, "Cancelling search timer");
                    token.cancel();
                }
                None
            }

            Effect::GenerateGreeting { attempt } => {
                let token = self.attempt_token(attempt)?;
                let assistant = Arc::clone(&self.assistant);
                self.spawn_guarded(token, async move {
                    let greeting = match assistant.generate_greeting().await {
                        Ok(greeting) => Some(greeting),
                        Err(e) => {
                            tracing::warn!(%attempt, error = %e, "Greeting generation failed, using fallback");
                            None
                        }
                    };
                    Event::BotGreeting {
                        attempt,
                        greeting,
                        message_id: uuid::Uuid::new_v4().to_string(),
                        sent_at: Utc::now(),
                    }
                });
                None
            }

            Effect::OpenBotSession { attempt, greeting } => {
                let session = self.assistant.open_session(greeting);
                if self.bot.replace(BotHandle { attempt, session }).is_some() {
                    tracing::warn!(%attempt, "Replaced a bot session that was still open");
                }
                tracing::info!(session_id = %self.context.session_id, %attempt, "Bot session opened");
                None
            }

            Effect::DisposeBotSession => {
                if let Some(bot) = self.bot.take() {
                    tracing::info!(attempt = %bot.attempt, "Bot session disposed");
                }
                None
            }

            Effect::SendToBot { attempt, text } => {
                let session = match &self.bot {
                    Some(bot) if bot.attempt == attempt => Arc::clone(&bot.session),
                    _ => {
                        return Some(Event::BotReply {
                            attempt,
                            reply: Err("No bot session".to_string()),
                            message_id: uuid::Uuid::new_v4().to_string(),
                            sent_at: Utc::now(),
                        });
                    }
                };
                let token = self.attempt_token(attempt)?;
                self.spawn_guarded(token, async move {
                    let reply = session.send(&text).await.map_err(|e| {
                        tracing::warn!(%attempt, error = %e, "Bot reply failed");
                        e.message
                    });
                    Event::BotReply {
                        attempt,
                        reply,
                        message_id: uuid::Uuid::new_v4().to_string(),
                        sent_at: Utc::now(),
                    }
                });
                None
            }

            Effect::PublishState => {
                self.snapshot_tx.send_replace(self.state.clone());
                let _ = self.broadcast_tx.send(SessionUpdate::StateChange {
                    state: snapshot_json(&self.state),
                });
                None
            }

            Effect::NotifyMessage { message } => {
                let message = serde_json::to_value(&message).unwrap_or(Value::Null);
                let _ = self.broadcast_tx.send(SessionUpdate::Message { message });
                None
            }
        }
    }

    /// Run `work` and deliver its event, unless the attempt is cancelled first
    fn spawn_guarded<F>(&self, token: CancellationToken, work: F)
    where
        F: Future<Output = Event> + Send + 'static,
    {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                event = work => {
                    let _ = event_tx.send(event).await;
                }
            }
        });
    }

    /// Token of the live attempt, `None` when `attempt` has been superseded
    fn attempt_token(&self, attempt: AttemptId) -> Option<CancellationToken> {
        match &self.attempt {
            Some((current, token)) if *current == attempt && !token.is_cancelled() => {
                Some(token.clone())
            }
            _ => {
                tracing::debug!(%attempt, "Skipping effect for a superseded attempt");
                None
            }
        }
    }

    fn is_live(&self, attempt: AttemptId) -> bool {
        self.attempt
            .as_ref()
            .is_some_and(|(current, token)| *current == attempt && !token.is_cancelled())
    }

    /// Invalidate all pending work of the current attempt
    fn cancel_attempt(&mut self) {
        if let Some((attempt, token)) = self.attempt.take() {
            tracing::debug!(session_id = %self.context.session_id, %attempt, "Attempt cancelled");
            token.cancel();
        }
        self.timers.clear();
        self.ticker = None;
    }

    fn teardown(&mut self) {
        self.cancel_attempt();
        self.camera_stream = None;
        self.bot = None;
    }
}
