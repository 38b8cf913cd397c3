use thiserror::Error;
use tracing::debug;

use crate::config::GROQ_API_BASE;

#[derive(Debug, Error)]
pub enum TtsError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
}

/// Synthesizes speech through the Groq OpenAI-compatible TTS endpoint.
pub struct SpeechClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    voice: String,
}

impl SpeechClient {
    pub fn new(api_key: String, model: String, voice: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: GROQ_API_BASE.to_string(),
            model,
            voice,
        }
    }

    /// Synthesizes `text` and returns the audio bytes (MP3).
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        #[derive(serde::Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
        }

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: "mp3",
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TtsError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let audio = response.bytes().await?;
        debug!(audio_bytes = audio.len(), "speech synthesis complete");
        Ok(audio.to_vec())
    }
}
