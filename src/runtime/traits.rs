//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the executor with mock implementations.

use crate::camera::{DeviceError, StillImage};
use crate::llm::LlmError;
use crate::state_machine::FaceVerification;
use async_trait::async_trait;
use std::sync::Arc;

/// Classifies whether a still shows exactly one clear human face.
///
/// Never fails: problems with the image or the classifier come back as a
/// rejection with a human-readable reason.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect_face(&self, image: &StillImage) -> FaceVerification;
}

/// Produces the short advisory text shown while matching
#[async_trait]
pub trait CompatibilityAnalyzer: Send + Sync {
    async fn analyze_compatibility(&self) -> Result<String, LlmError>;
}

/// Conversational fallback partner
#[async_trait]
pub trait ChatBot: Send + Sync {
    /// One-off greeting used to open a bot episode
    async fn generate_greeting(&self) -> Result<String, LlmError>;

    /// Open a conversation, seeded with the greeting as the bot's first turn
    fn open_session(&self, greeting: Option<String>) -> Arc<dyn BotSession>;
}

/// One bot conversation. Keeps its own history.
#[async_trait]
pub trait BotSession: Send + Sync {
    /// Send a user turn and wait for the reply
    async fn send(&self, text: &str) -> Result<String, LlmError>;
}

/// Everything the session needs from the generative backend
pub trait Assistant: FaceDetector + CompatibilityAnalyzer + ChatBot {}
impl<T: FaceDetector + CompatibilityAnalyzer + ChatBot> Assistant for T {}

/// Source of camera streams
#[async_trait]
pub trait Camera: Send + Sync {
    /// Acquire the device. Resolves once a live stream is available.
    async fn open(&self) -> Result<Box<dyn CameraStream>, DeviceError>;
}

/// A live camera stream. Tracks stay running until `stop`.
pub trait CameraStream: Send {
    fn capture_still(&mut self) -> Result<StillImage, DeviceError>;

    /// Stop every track. Idempotent.
    fn stop(&mut self);
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: FaceDetector + ?Sized> FaceDetector for Arc<T> {
    async fn detect_face(&self, image: &StillImage) -> FaceVerification {
        (**self).detect_face(image).await
    }
}

#[async_trait]
impl<T: CompatibilityAnalyzer + ?Sized> CompatibilityAnalyzer for Arc<T> {
    async fn analyze_compatibility(&self) -> Result<String, LlmError> {
        (**self).analyze_compatibility().await
    }
}

#[async_trait]
impl<T: ChatBot + ?Sized> ChatBot for Arc<T> {
    async fn generate_greeting(&self) -> Result<String, LlmError> {
        (**self).generate_greeting().await
    }

    fn open_session(&self, greeting: Option<String>) -> Arc<dyn BotSession> {
        (**self).open_session(greeting)
    }
}

#[async_trait]
impl<T: Camera + ?Sized> Camera for Arc<T> {
    async fn open(&self) -> Result<Box<dyn CameraStream>, DeviceError> {
        (**self).open().await
    }
}
