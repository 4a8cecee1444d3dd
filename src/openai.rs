use log::debug;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use crate::config::OpenAiConfig;

/// Errors from the transcription/text-generation services
#[derive(Debug)]
pub enum ApiError {
    /// No API key available
    MissingKey,
    /// Transport-level failure
    Network(String),
    /// The service answered with a non-success status
    Api { status: u16, body: String },
    /// The response body could not be parsed
    Parse(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::MissingKey => write!(f, "OPENAI_API_KEY not set"),
            ApiError::Network(msg) => write!(f, "API request failed: {}", msg),
            ApiError::Api { status, body } => write!(f, "API error {}: {}", status, body),
            ApiError::Parse(msg) => write!(f, "failed to parse API response: {}", msg),
        }
    }
}

impl StdError for ApiError {}

/// Speech-to-text: submit audio bytes, get text back
pub trait SpeechToText: Send + Sync {
    fn transcribe(
        &self,
        audio: &[u8],
        file_name: &str,
        media_type: &str,
    ) -> Result<String, ApiError>;
}

/// Text generation: system + user prompt in, text out
pub trait ChatModel: Send + Sync {
    fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String, ApiError>;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

/// Client for an OpenAI-compatible API, covering both chat completions and
/// audio transcription.
pub struct OpenAiClient {
    base_url: String,
    api_key: String,
    chat_model: String,
    transcribe_model: String,
    client: Client,
}

impl OpenAiClient {
    /// Build from config; the key comes from the OPENAI_API_KEY environment
    /// variable.
    pub fn from_config(config: &OpenAiConfig) -> Result<Self, ApiError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or(ApiError::MissingKey)?;

        let client = Client::builder()
            // Transcribing long recordings takes a while
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            chat_model: config.chat_model.clone(),
            transcribe_model: config.transcribe_model.clone(),
            client,
        })
    }
}

impl ChatModel for OpenAiClient {
    fn complete(&self, system: &str, user: &str, temperature: f32) -> Result<String, ApiError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: self.chat_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ApiError::Api {
                status: response.status().as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        let text = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        debug!("chat completion returned {} chars", text.len());
        Ok(text)
    }
}

impl SpeechToText for OpenAiClient {
    fn transcribe(
        &self,
        audio: &[u8],
        file_name: &str,
        media_type: &str,
    ) -> Result<String, ApiError> {
        let url = format!("{}/audio/transcriptions", self.base_url);

        let part = Part::bytes(audio.to_vec())
            .file_name(file_name.to_string())
            .mime_str(media_type)
            .map_err(|e| ApiError::Parse(format!("invalid media type '{}': {}", media_type, e)))?;
        let form = Form::new()
            .text("model", self.transcribe_model.clone())
            .text("response_format", "text")
            .part("file", part);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ApiError::Api {
                status: response.status().as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }

        let text = response
            .text()
            .map_err(|e| ApiError::Parse(e.to_string()))?;
        debug!("transcription returned {} chars", text.len());
        Ok(text)
    }
}
