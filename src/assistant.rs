//! Generative backend for the chat session
//!
//! Face detection, compatibility advice and the fallback chat bot, all served
//! by one `LlmService`.

use crate::camera::StillImage;
use crate::llm::{
    ContentBlock, LlmError, LlmMessage, LlmRequest, LlmResponse, LlmService, ResponseFormat,
};
use crate::runtime::{BotSession, ChatBot, CompatibilityAnalyzer, FaceDetector};
use crate::state_machine::FaceVerification;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

const FACE_PROMPT: &str = "Analyze this image. Does it contain a single, clearly visible human face? Do not consider cartoons or drawings. The face should not be obscured.";

const INVALID_IMAGE_REASON: &str = "Invalid image data.";
const VERIFICATION_UNAVAILABLE_REASON: &str = "Could not connect to the verification service.";

// Placeholder profiles until real user profiles are wired in
const CURRENT_USER_PROFILE: &str = "Loves hiking, technology, and Italian food. Based in New York.";
const OTHER_USER_PROFILE: &str =
    "Art student from San Francisco, enjoys photography and indie music.";

const BOT_SYSTEM_INSTRUCTION: &str = "You are a friendly, witty, and engaging AI assistant in a random chat app. A user could not be matched with a real person, so you are their chat partner. Keep your responses concise and conversational.";

const GREETING_PROMPT: &str = "Generate a friendly, brief, and witty greeting to start a conversation with a user in a random chat app. You are their AI partner because no human was available.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Assistant capabilities backed by a Gemini-style model
pub struct GeminiAssistant {
    llm: Arc<dyn LlmService>,
}

impl GeminiAssistant {
    pub fn new(llm: Arc<dyn LlmService>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl FaceDetector for GeminiAssistant {
    async fn detect_face(&self, image: &StillImage) -> FaceVerification {
        let Some(data) = image.base64_payload() else {
            return FaceVerification::rejected(INVALID_IMAGE_REASON);
        };

        let request = LlmRequest {
            messages: vec![LlmMessage::user(vec![
                ContentBlock::image(image.media_type(), data),
                ContentBlock::text(FACE_PROMPT),
            ])],
            response_format: Some(ResponseFormat::Json {
                schema: face_schema(),
            }),
            ..LlmRequest::default()
        };

        match complete(self.llm.as_ref(), &request).await {
            Ok(response) => parse_verification(&response).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Face detection answer could not be parsed");
                FaceVerification::rejected(VERIFICATION_UNAVAILABLE_REASON)
            }),
            Err(e) => {
                tracing::warn!(error = %e, "Face detection failed");
                FaceVerification::rejected(VERIFICATION_UNAVAILABLE_REASON)
            }
        }
    }
}

#[async_trait]
impl CompatibilityAnalyzer for GeminiAssistant {
    async fn analyze_compatibility(&self) -> Result<String, LlmError> {
        let prompt = format!(
            "Based on these two user profiles, would they be a good match for a random chat? \
             Profile 1: {CURRENT_USER_PROFILE}. Profile 2: {OTHER_USER_PROFILE}. \
             Give a brief, friendly reason for your decision, focusing on potential shared interests. \
             Keep it under 20 words. Example: \"You both love art! This could be a great chat.\""
        );
        let response = complete(self.llm.as_ref(), &LlmRequest::prompt(prompt)).await?;
        non_empty_text(&response)
    }
}

#[async_trait]
impl ChatBot for GeminiAssistant {
    async fn generate_greeting(&self) -> Result<String, LlmError> {
        // Kept out of any conversation so the prompt never shows up as a turn
        let request = LlmRequest::prompt(GREETING_PROMPT).with_system(BOT_SYSTEM_INSTRUCTION);
        let response = complete(self.llm.as_ref(), &request).await?;
        non_empty_text(&response)
    }

    fn open_session(&self, greeting: Option<String>) -> Arc<dyn BotSession> {
        Arc::new(LlmBotSession::new(Arc::clone(&self.llm), greeting))
    }
}

/// Bot conversation that replays its history on every turn
pub struct LlmBotSession {
    llm: Arc<dyn LlmService>,
    history: Mutex<Vec<LlmMessage>>,
}

impl LlmBotSession {
    pub fn new(llm: Arc<dyn LlmService>, greeting: Option<String>) -> Self {
        let history = greeting.map(LlmMessage::assistant).into_iter().collect();
        Self {
            llm,
            history: Mutex::new(history),
        }
    }
}

#[async_trait]
impl BotSession for LlmBotSession {
    async fn send(&self, text: &str) -> Result<String, LlmError> {
        // Held for the whole turn: one send at a time per conversation
        let mut history = self.history.lock().await;
        history.push(LlmMessage::user(vec![ContentBlock::text(text)]));

        let request = LlmRequest {
            system: Some(BOT_SYSTEM_INSTRUCTION.to_string()),
            messages: history.clone(),
            ..LlmRequest::default()
        };

        match complete(self.llm.as_ref(), &request)
            .await
            .and_then(|response| non_empty_text(&response))
        {
            Ok(reply) => {
                history.push(LlmMessage::assistant(reply.clone()));
                Ok(reply)
            }
            Err(e) => {
                // The failed turn never happened as far as the model is concerned
                history.pop();
                Err(e)
            }
        }
    }
}

async fn complete(llm: &dyn LlmService, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
    timeout(REQUEST_TIMEOUT, llm.complete(request))
        .await
        .map_err(|_| LlmError::unavailable("Request timed out"))?
}

fn non_empty_text(response: &LlmResponse) -> Result<String, LlmError> {
    let text = response.text().trim().to_string();
    if text.is_empty() {
        Err(LlmError::malformed("Empty response"))
    } else {
        Ok(text)
    }
}

fn parse_verification(response: &LlmResponse) -> Result<FaceVerification, serde_json::Error> {
    serde_json::from_str(response.text().trim())
}

fn face_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "faceDetected": {
                "type": "BOOLEAN",
                "description": "True if a single, clear human face is detected, otherwise false."
            },
            "reason": {
                "type": "STRING",
                "description": "A brief reason for the detection result."
            }
        },
        "required": ["faceDetected", "reason"]
    })
}
