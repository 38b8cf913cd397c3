use thiserror::Error;
use tracing::debug;

use crate::config::GROQ_API_BASE;

#[derive(Debug, Error)]
pub enum SttError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
}

#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Transcribes WAV audio through the Groq Whisper endpoint.
pub struct SttClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl SttClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: GROQ_API_BASE.to_string(),
            model,
        }
    }

    /// Transcribes the given WAV bytes. Temperature is pinned to zero so
    /// repeated passes over the same audio stay stable.
    pub async fn transcribe(&self, audio: Vec<u8>) -> Result<String, SttError> {
        debug!(audio_bytes = audio.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")?,
            )
            .text("model", self.model.clone())
            .text("temperature", "0")
            .text("response_format", "json");

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SttError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let result: TranscriptionResponse = response.json().await?;
        debug!(transcript = %result.text, "transcription complete");
        Ok(result.text.trim().to_string())
    }
}
