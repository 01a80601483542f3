//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use super::{SessionRuntime, SessionUpdate};
use crate::camera::{DeviceError, StillImage};
use crate::llm::LlmError;
use crate::state_machine::state::SessionTimings;
use crate::state_machine::{
    ChatMode, ChatStatus, Event, FaceVerification, SessionContext, SessionState,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

pub const TEST_FRAME: &str = "data:image/jpeg;base64,/9j/4AAQSkZJRg==";

// ============================================================================
// Mock Assistant
// ============================================================================

/// Mock assistant that returns queued results, each after an optional delay
#[allow(dead_code)]
pub struct MockAssistant {
    faces: Mutex<VecDeque<FaceVerification>>,
    analyses: Mutex<VecDeque<Result<String, LlmError>>>,
    greetings: Mutex<VecDeque<Result<String, LlmError>>>,
    replies: Arc<Mutex<VecDeque<Result<String, LlmError>>>>,
    delay: Duration,
    reply_delay: Duration,
    /// Greetings each opened session was seeded with
    pub opened_sessions: Mutex<Vec<Option<String>>>,
    /// Texts sent through any bot session
    pub sent: Arc<Mutex<Vec<String>>>,
    /// Stills handed to the face detector
    pub seen_images: Mutex<Vec<StillImage>>,
    pub greeting_calls: AtomicUsize,
    pub face_calls: AtomicUsize,
}

#[allow(dead_code)]
impl MockAssistant {
    pub fn new() -> Self {
        Self {
            faces: Mutex::new(VecDeque::new()),
            analyses: Mutex::new(VecDeque::new()),
            greetings: Mutex::new(VecDeque::new()),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            delay: Duration::ZERO,
            reply_delay: Duration::ZERO,
            opened_sessions: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            seen_images: Mutex::new(Vec::new()),
            greeting_calls: AtomicUsize::new(0),
            face_calls: AtomicUsize::new(0),
        }
    }

    /// Delay applied to classifier, analysis and greeting calls
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    pub fn queue_face(&self, result: FaceVerification) {
        self.faces.lock().unwrap().push_back(result);
    }

    pub fn queue_analysis(&self, result: Result<String, LlmError>) {
        self.analyses.lock().unwrap().push_back(result);
    }

    pub fn queue_greeting(&self, result: Result<String, LlmError>) {
        self.greetings.lock().unwrap().push_back(result);
    }

    pub fn queue_reply(&self, result: Result<String, LlmError>) {
        self.replies.lock().unwrap().push_back(result);
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn session_count(&self) -> usize {
        self.opened_sessions.lock().unwrap().len()
    }
}

impl Default for MockAssistant {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FaceDetector for MockAssistant {
    async fn detect_face(&self, image: &StillImage) -> FaceVerification {
        self.face_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_images.lock().unwrap().push(image.clone());
        tokio::time::sleep(self.delay).await;
        self.faces
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| FaceVerification::detected("Face detected."))
    }
}

#[async_trait]
impl CompatibilityAnalyzer for MockAssistant {
    async fn analyze_compatibility(&self) -> Result<String, LlmError> {
        tokio::time::sleep(self.delay).await;
        self.analyses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("You both love art!".to_string()))
    }
}

#[async_trait]
impl ChatBot for MockAssistant {
    async fn generate_greeting(&self) -> Result<String, LlmError> {
        self.greeting_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.greetings
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Hi there! What are you up to?".to_string()))
    }

    fn open_session(&self, greeting: Option<String>) -> Arc<dyn BotSession> {
        self.opened_sessions.lock().unwrap().push(greeting);
        Arc::new(MockBotSession {
            replies: Arc::clone(&self.replies),
            sent: Arc::clone(&self.sent),
            delay: self.reply_delay,
        })
    }
}

struct MockBotSession {
    replies: Arc<Mutex<VecDeque<Result<String, LlmError>>>>,
    sent: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

#[async_trait]
impl BotSession for MockBotSession {
    async fn send(&self, text: &str) -> Result<String, LlmError> {
        self.sent.lock().unwrap().push(text.to_string());
        tokio::time::sleep(self.delay).await;
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::unavailable("No mock reply queued")))
    }
}

// ============================================================================
// Mock Camera
// ============================================================================

/// Mock camera that counts opened and stopped streams
#[allow(dead_code)]
pub struct MockCamera {
    denials: Mutex<VecDeque<DeviceError>>,
    open_delay: Duration,
    pub opens: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl MockCamera {
    pub fn new() -> Self {
        Self {
            denials: Mutex::new(VecDeque::new()),
            open_delay: Duration::ZERO,
            opens: Arc::new(AtomicUsize::new(0)),
            stops: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Fail the next open with this error
    pub fn queue_denial(&self, error: DeviceError) {
        self.denials.lock().unwrap().push_back(error);
    }

    /// Streams opened and not yet stopped
    pub fn live_streams(&self) -> usize {
        self.opens.load(Ordering::SeqCst) - self.stops.load(Ordering::SeqCst)
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn open(&self) -> Result<Box<dyn CameraStream>, DeviceError> {
        tokio::time::sleep(self.open_delay).await;
        if let Some(error) = self.denials.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockStream {
            stops: Arc::clone(&self.stops),
            stopped: false,
        }))
    }
}

struct MockStream {
    stops: Arc<AtomicUsize>,
    stopped: bool,
}

impl CameraStream for MockStream {
    fn capture_still(&mut self) -> Result<StillImage, DeviceError> {
        if self.stopped {
            return Err(DeviceError::NotOpen);
        }
        Ok(StillImage::new(TEST_FRAME))
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Test Runtime Builder
// ============================================================================

/// Helper for building test runtimes with minimal boilerplate
pub struct TestRuntime {
    pub event_tx: mpsc::Sender<Event>,
    pub broadcast_rx: broadcast::Receiver<SessionUpdate>,
    pub snapshot_rx: watch::Receiver<SessionState>,
    pub assistant: Arc<MockAssistant>,
    pub camera: Arc<MockCamera>,
    /// Cancelling this ends the runtime as if the session were removed
    pub shutdown: CancellationToken,
    pub runtime_handle: tokio::task::JoinHandle<()>,
}

pub struct TestRuntimeBuilder {
    mode: ChatMode,
    timings: SessionTimings,
    assistant: Option<MockAssistant>,
    camera: Option<MockCamera>,
}

#[allow(dead_code)]
impl TestRuntimeBuilder {
    pub fn new() -> Self {
        Self {
            mode: ChatMode::Text,
            timings: SessionTimings::default(),
            assistant: None,
            camera: None,
        }
    }

    pub fn mode(mut self, mode: ChatMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timings(mut self, timings: SessionTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn assistant(mut self, assistant: MockAssistant) -> Self {
        self.assistant = Some(assistant);
        self
    }

    pub fn camera(mut self, camera: MockCamera) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn build(self) -> TestRuntime {
        let assistant = Arc::new(self.assistant.unwrap_or_default());
        let camera = Arc::new(self.camera.unwrap_or_default());

        let context = SessionContext::new("test-session", self.timings);
        let state = SessionState::new(self.mode);
        let (event_tx, event_rx) = mpsc::channel(32);
        let (broadcast_tx, broadcast_rx) = broadcast::channel(128);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());
        let shutdown = CancellationToken::new();

        let runtime = SessionRuntime::new(
            context,
            state,
            Arc::clone(&camera),
            Arc::clone(&assistant),
            event_rx,
            event_tx.clone(),
            broadcast_tx,
            snapshot_tx,
        )
        .with_shutdown(shutdown.clone());

        let handle = tokio::spawn(async move {
            runtime.run().await;
        });

        TestRuntime {
            event_tx,
            broadcast_rx,
            snapshot_rx,
            assistant,
            camera,
            shutdown,
            runtime_handle: handle,
        }
    }
}

impl Default for TestRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl TestRuntime {
    pub fn builder() -> TestRuntimeBuilder {
        TestRuntimeBuilder::new()
    }

    pub async fn send(&self, event: Event) {
        self.event_tx
            .send(event)
            .await
            .expect("Failed to send event");
    }

    pub async fn send_message(&self, text: &str) {
        self.send(Event::UserMessage {
            text: text.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            sent_at: Utc::now(),
        })
        .await;
    }

    pub fn state(&self) -> SessionState {
        self.snapshot_rx.borrow().clone()
    }

    /// Wait until the published state satisfies `predicate`
    pub async fn wait_until(
        &mut self,
        timeout: Duration,
        predicate: impl FnMut(&SessionState) -> bool,
    ) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.snapshot_rx.wait_for(predicate)).await,
            Ok(Ok(_))
        )
    }

    pub async fn wait_for_status(&mut self, status: ChatStatus, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.status() == status).await
    }

    /// Wait for the next error broadcast
    pub async fn wait_for_error(&mut self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.broadcast_rx.recv()).await {
                Ok(Ok(SessionUpdate::Error { message })) => return Some(message),
                Ok(Ok(_) | Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
            }
        }
    }
}

// ============================================================================
// Integration Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::state::{
        CAMERA_DENIED_REASON, FALLBACK_GREETING, REPLY_FALLBACK,
    };
    use crate::state_machine::{
        CallMedia, Episode, GateState, SearchStage, Sender, SessionPhase,
    };

    const WAIT: Duration = Duration::from_secs(30);

    fn texts(state: &SessionState) -> Vec<(Sender, String)> {
        state
            .messages()
            .iter()
            .map(|m| (m.sender, m.text.clone()))
            .collect()
    }

    fn gate(state: &SessionState) -> Option<GateState> {
        match &state.phase {
            SessionPhase::CapturingSelfie { gate, .. } => Some(gate.clone()),
            _ => None,
        }
    }

    fn media(state: &SessionState) -> Option<CallMedia> {
        match &state.phase {
            SessionPhase::Connected { media, .. } => media.clone(),
            _ => None,
        }
    }

    /// Walk a video session through the selfie gate into a call with live media
    async fn enter_video_call(rt: &mut TestRuntime) {
        rt.send(Event::Start).await;
        assert!(
            rt.wait_until(WAIT, |s| gate(s) == Some(GateState::Previewing))
                .await
        );
        rt.send(Event::Capture).await;
        assert!(
            rt.wait_until(WAIT, |s| media(s) == Some(CallMedia::Live))
                .await
        );
        assert_eq!(rt.camera.live_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_text_mode_falls_back_to_bot() {
        let mut rt = TestRuntime::builder().mode(ChatMode::Text).build();
        rt.send(Event::Start).await;

        assert!(
            rt.wait_until(WAIT, |s| matches!(
                s.phase,
                SessionPhase::Searching {
                    stage: SearchStage::Matching,
                    ..
                }
            ))
            .await
        );
        match &rt.state().phase {
            SessionPhase::Searching { advice, .. } => {
                assert_eq!(advice.as_deref(), Some("You both love art!"));
            }
            other => panic!("unexpected phase: {other:?}"),
        }

        let started = tokio::time::Instant::now();
        assert!(rt.wait_for_status(ChatStatus::Connected, WAIT).await);
        assert!(started.elapsed() >= Duration::from_millis(3000));

        let state = rt.state();
        assert!(state.is_bot_backed());
        assert_eq!(
            texts(&state),
            vec![(Sender::Bot, "Hi there! What are you up to?".to_string())]
        );
        assert_eq!(
            rt.assistant.opened_sessions.lock().unwrap().clone(),
            vec![Some("Hi there! What are you up to?".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_message_then_reply() {
        let mut rt = TestRuntime::builder()
            .assistant(MockAssistant::new().with_reply_delay(Duration::from_millis(800)))
            .build();
        rt.assistant.queue_reply(Ok("Not much, you?".to_string()));
        rt.send(Event::Start).await;
        assert!(rt.wait_for_status(ChatStatus::Connected, WAIT).await);

        rt.send_message("  hi ").await;
        assert!(rt.wait_until(WAIT, SessionState::is_composing).await);
        assert_eq!(texts(&rt.state()).last().unwrap(), &(Sender::User, "hi".to_string()));

        // Input is disabled while the reply is pending
        rt.send_message("anyone there?").await;
        assert!(rt.wait_for_error(WAIT).await.is_some());

        assert!(rt.wait_until(WAIT, |s| !s.is_composing()).await);
        let state = rt.state();
        assert_eq!(
            texts(&state)[1..],
            [
                (Sender::User, "hi".to_string()),
                (Sender::Bot, "Not much, you?".to_string()),
            ]
        );
        assert_eq!(rt.assistant.sent_texts(), vec!["hi".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reply_appends_fallback() {
        let mut rt = TestRuntime::builder().build();
        rt.assistant.queue_reply(Err(LlmError::unavailable("boom")));
        rt.send(Event::Start).await;
        assert!(rt.wait_for_status(ChatStatus::Connected, WAIT).await);

        rt.send_message("hello?").await;
        assert!(rt.wait_until(WAIT, |s| s.messages().len() == 3).await);

        let state = rt.state();
        assert!(!state.is_composing());
        assert_eq!(
            texts(&state)[2],
            (Sender::Bot, REPLY_FALLBACK.to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_greeting_uses_static_message() {
        let mut rt = TestRuntime::builder().build();
        rt.assistant
            .queue_greeting(Err(LlmError::unavailable("Connection failed")));
        rt.send(Event::Start).await;
        assert!(rt.wait_for_status(ChatStatus::Connected, WAIT).await);

        assert_eq!(
            texts(&rt.state()),
            vec![(Sender::Bot, FALLBACK_GREETING.to_string())]
        );
        assert_eq!(rt.assistant.opened_sessions.lock().unwrap().clone(), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_wins_race_and_bot_timer_is_inert() {
        let mut rt = TestRuntime::builder().mode(ChatMode::Audio).build();
        rt.send(Event::Start).await;
        assert!(rt.wait_for_status(ChatStatus::Connected, WAIT).await);

        let state = rt.state();
        assert!(matches!(
            state.phase,
            SessionPhase::Connected {
                episode: Episode::Peer,
                ..
            }
        ));

        // Well past the bot fallback delay
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rt.state(), state);
        assert_eq!(rt.assistant.greeting_calls.load(Ordering::SeqCst), 0);
        assert_eq!(rt.assistant.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_failure_is_error_until_stop() {
        let mut rt = TestRuntime::builder().build();
        rt.assistant
            .queue_analysis(Err(LlmError::unavailable("Connection failed")));
        rt.send(Event::Start).await;
        assert!(rt.wait_for_status(ChatStatus::Error, WAIT).await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rt.state().status(), ChatStatus::Error);
        assert_eq!(rt.assistant.greeting_calls.load(Ordering::SeqCst), 0);

        rt.send(Event::Stop).await;
        assert!(rt.wait_for_status(ChatStatus::Idle, WAIT).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_searching_discards_timers() {
        let mut rt = TestRuntime::builder().build();
        rt.send(Event::Start).await;
        assert!(
            rt.wait_until(WAIT, |s| matches!(
                s.phase,
                SessionPhase::Searching {
                    stage: SearchStage::Matching,
                    ..
                }
            ))
            .await
        );

        rt.send(Event::Stop).await;
        assert!(rt.wait_for_status(ChatStatus::Idle, WAIT).await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rt.state().status(), ChatStatus::Idle);
        assert_eq!(rt.assistant.greeting_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_discards_pending_reply_and_bot() {
        let mut rt = TestRuntime::builder()
            .assistant(MockAssistant::new().with_reply_delay(Duration::from_secs(5)))
            .build();
        rt.assistant.queue_reply(Ok("too late".to_string()));
        rt.send(Event::Start).await;
        assert!(rt.wait_for_status(ChatStatus::Connected, WAIT).await);
        let first = rt.state().last_attempt;

        rt.send_message("hi").await;
        assert!(rt.wait_until(WAIT, SessionState::is_composing).await);

        rt.send(Event::Next).await;
        assert!(rt.wait_for_status(ChatStatus::Searching, WAIT).await);
        assert!(rt.wait_for_status(ChatStatus::Connected, WAIT).await);

        let state = rt.state();
        assert!(state.last_attempt > first);
        assert_eq!(state.messages().len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rt.state().messages().len(), 1);
        assert_eq!(rt.assistant.session_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_selfie_gate_then_search() {
        let mut rt = TestRuntime::builder()
            .mode(ChatMode::Video)
            .assistant(MockAssistant::new().with_delay(Duration::from_millis(400)))
            .build();
        rt.send(Event::Start).await;
        assert!(
            rt.wait_until(WAIT, |s| gate(s) == Some(GateState::Previewing))
                .await
        );
        assert_eq!(rt.camera.live_streams(), 1);

        rt.send(Event::Capture).await;
        assert!(
            rt.wait_until(WAIT, |s| matches!(
                gate(s),
                Some(GateState::Verifying { progress }) if progress > 10
            ))
            .await
        );

        // Passed, then the advance delay, then the search with the camera released
        assert!(rt.wait_for_status(ChatStatus::Searching, WAIT).await);
        assert_eq!(rt.camera.live_streams(), 0);
        assert_eq!(rt.assistant.face_calls.load(Ordering::SeqCst), 1);

        // Video races a peer, which wins
        assert!(rt.wait_for_status(ChatStatus::Connected, WAIT).await);
        assert!(!rt.state().is_bot_backed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_selfie_keeps_camera_for_retry() {
        let mut rt = TestRuntime::builder().mode(ChatMode::Video).build();
        rt.assistant
            .queue_face(FaceVerification::rejected("Invalid image data."));
        rt.send(Event::Start).await;
        assert!(
            rt.wait_until(WAIT, |s| gate(s) == Some(GateState::Previewing))
                .await
        );

        rt.send(Event::Capture).await;
        assert!(
            rt.wait_until(WAIT, |s| matches!(gate(s), Some(GateState::Failed { .. })))
                .await
        );
        assert_eq!(
            gate(&rt.state()),
            Some(GateState::Failed {
                reason: "Invalid image data.".to_string(),
                camera_open: true,
            })
        );
        assert_eq!(rt.camera.live_streams(), 1);

        rt.send(Event::RetryCapture).await;
        assert!(
            rt.wait_until(WAIT, |s| gate(s) == Some(GateState::Previewing))
                .await
        );
        assert_eq!(rt.camera.opens.load(Ordering::SeqCst), 1);

        rt.send(Event::Capture).await;
        assert!(rt.wait_for_status(ChatStatus::Searching, WAIT).await);
        assert_eq!(rt.assistant.face_calls.load(Ordering::SeqCst), 2);
        assert_eq!(rt.camera.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_capture_verifies_once() {
        let mut rt = TestRuntime::builder()
            .mode(ChatMode::Video)
            .assistant(MockAssistant::new().with_delay(Duration::from_millis(300)))
            .build();
        rt.send(Event::Start).await;
        assert!(
            rt.wait_until(WAIT, |s| gate(s) == Some(GateState::Previewing))
                .await
        );

        rt.send(Event::Capture).await;
        rt.send(Event::Capture).await;
        assert!(rt.wait_for_error(WAIT).await.is_some());
        assert!(rt.wait_for_status(ChatStatus::Searching, WAIT).await);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rt.assistant.face_calls.load(Ordering::SeqCst), 1);
        // One gate attempt, one search attempt
        assert_eq!(rt.state().last_attempt.0, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_denied_then_retry_reopens() {
        let camera = MockCamera::new();
        camera.queue_denial(DeviceError::PermissionDenied(String::new()));
        let mut rt = TestRuntime::builder()
            .mode(ChatMode::Video)
            .camera(camera)
            .build();
        rt.send(Event::Start).await;

        assert!(
            rt.wait_until(WAIT, |s| matches!(gate(s), Some(GateState::Failed { .. })))
                .await
        );
        assert_eq!(
            gate(&rt.state()),
            Some(GateState::Failed {
                reason: CAMERA_DENIED_REASON.to_string(),
                camera_open: false,
            })
        );

        rt.send(Event::RetryCapture).await;
        assert!(
            rt.wait_until(WAIT, |s| gate(s) == Some(GateState::Previewing))
                .await
        );
        assert_eq!(rt.camera.live_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_camera_opening_releases_late_stream() {
        let mut rt = TestRuntime::builder()
            .mode(ChatMode::Video)
            .camera(MockCamera::new().with_open_delay(Duration::from_millis(500)))
            .build();
        rt.send(Event::Start).await;
        assert!(rt.wait_for_status(ChatStatus::CapturingSelfie, WAIT).await);

        rt.send(Event::CancelCapture).await;
        assert!(rt.wait_for_status(ChatStatus::Idle, WAIT).await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rt.camera.live_streams(), 0);
        assert_eq!(rt.state().status(), ChatStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_verification_releases_camera() {
        let mut rt = TestRuntime::builder()
            .mode(ChatMode::Video)
            .assistant(MockAssistant::new().with_delay(Duration::from_secs(2)))
            .build();
        rt.send(Event::Start).await;
        assert!(
            rt.wait_until(WAIT, |s| gate(s) == Some(GateState::Previewing))
                .await
        );
        rt.send(Event::Capture).await;
        assert!(
            rt.wait_until(WAIT, |s| matches!(gate(s), Some(GateState::Verifying { .. })))
                .await
        );

        rt.send(Event::Stop).await;
        assert!(rt.wait_for_status(ChatStatus::Idle, WAIT).await);
        assert_eq!(rt.camera.live_streams(), 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rt.state().status(), ChatStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_releases_call_media_and_reacquires() {
        let mut rt = TestRuntime::builder().mode(ChatMode::Video).build();
        enter_video_call(&mut rt).await;
        let first = rt.state().last_attempt;

        rt.send(Event::Next).await;
        assert!(rt.wait_for_status(ChatStatus::Searching, WAIT).await);
        assert_eq!(rt.camera.live_streams(), 0);

        // The next call acquires its own devices
        assert!(
            rt.wait_until(WAIT, |s| s.last_attempt > first
                && media(s) == Some(CallMedia::Live))
                .await
        );
        assert_eq!(rt.camera.live_streams(), 1);
        // Gate, first call, second call
        assert_eq!(rt.camera.opens.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_call_media() {
        let mut rt = TestRuntime::builder().mode(ChatMode::Video).build();
        enter_video_call(&mut rt).await;

        rt.send(Event::Stop).await;
        assert!(rt.wait_for_status(ChatStatus::Idle, WAIT).await);
        assert_eq!(rt.camera.live_streams(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rt.camera.live_streams(), 0);
        assert_eq!(rt.state().status(), ChatStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_call_media() {
        let mut rt = TestRuntime::builder().mode(ChatMode::Video).build();
        enter_video_call(&mut rt).await;

        rt.shutdown.cancel();
        rt.runtime_handle.await.unwrap();
        assert_eq!(rt.camera.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_call_media_keeps_the_call() {
        let mut rt = TestRuntime::builder().mode(ChatMode::Video).build();
        rt.send(Event::Start).await;
        assert!(
            rt.wait_until(WAIT, |s| gate(s) == Some(GateState::Previewing))
                .await
        );
        rt.send(Event::Capture).await;
        assert!(rt.wait_for_status(ChatStatus::Searching, WAIT).await);
        rt.camera
            .queue_denial(DeviceError::PermissionDenied(String::new()));

        assert!(
            rt.wait_until(WAIT, |s| matches!(media(s), Some(CallMedia::Denied { .. })))
                .await
        );
        assert_eq!(
            media(&rt.state()),
            Some(CallMedia::Denied {
                reason: CAMERA_DENIED_REASON.to_string(),
            })
        );
        assert_eq!(rt.state().status(), ChatStatus::Connected);
        assert_eq!(rt.camera.live_streams(), 0);

        // Nothing to release, and leaving still works
        rt.send(Event::Stop).await;
        assert!(rt.wait_for_status(ChatStatus::Idle, WAIT).await);
        assert_eq!(rt.camera.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_previewing_releases_camera() {
        let mut rt = TestRuntime::builder().mode(ChatMode::Video).build();
        rt.send(Event::Start).await;
        assert!(
            rt.wait_until(WAIT, |s| gate(s) == Some(GateState::Previewing))
                .await
        );
        assert_eq!(rt.camera.live_streams(), 1);

        rt.shutdown.cancel();
        rt.runtime_handle.await.unwrap();
        assert_eq!(rt.camera.live_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_camera_opening_releases_late_stream() {
        let mut rt = TestRuntime::builder()
            .mode(ChatMode::Video)
            .camera(MockCamera::new().with_open_delay(Duration::from_millis(500)))
            .build();
        rt.send(Event::Start).await;
        assert!(rt.wait_for_status(ChatStatus::CapturingSelfie, WAIT).await);

        rt.shutdown.cancel();
        rt.runtime_handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rt.camera.live_streams(), 0);
    }
}
