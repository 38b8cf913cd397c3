use std::env;

use thiserror::Error;

pub const GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("DISCORD_TOKEN is not set")]
    MissingDiscordToken,
    #[error("{0} is not a valid number")]
    InvalidNumber(&'static str),
}

/// Runtime configuration, read once from the environment at startup.
///
/// `GROQ_API_KEY` is optional: without it the music commands keep working
/// and the chat/assistant commands answer with a notice instead.
#[derive(Debug, Clone)]
pub struct Config {
    pub discord_token: String,
    pub command_prefix: String,
    pub groq_api_key: Option<String>,
    pub chat_model: String,
    pub stt_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub wake_phrase: String,
    pub system_prompt: String,
    pub capture_seconds: u64,
    pub sentence_batch_chars: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let discord_token =
            env::var("DISCORD_TOKEN").map_err(|_| ConfigError::MissingDiscordToken)?;

        let capture_seconds = match env::var("CAPTURE_SECONDS") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("CAPTURE_SECONDS"))?,
            Err(_) => 5,
        };

        let sentence_batch_chars = match env::var("SENTENCE_BATCH_CHARS") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidNumber("SENTENCE_BATCH_CHARS"))?,
            Err(_) => 100,
        };

        Ok(Config {
            discord_token,
            command_prefix: env::var("COMMAND_PREFIX").unwrap_or_else(|_| "!".to_string()),
            groq_api_key: env::var("GROQ_API_KEY").ok().filter(|key| !key.is_empty()),
            chat_model: env::var("CHAT_MODEL")
                .unwrap_or_else(|_| "llama-3.3-70b-versatile".to_string()),
            stt_model: env::var("STT_MODEL").unwrap_or_else(|_| "whisper-large-v3".to_string()),
            tts_model: env::var("TTS_MODEL").unwrap_or_else(|_| "playai-tts".to_string()),
            tts_voice: env::var("TTS_VOICE").unwrap_or_else(|_| "Fritz-PlayAI".to_string()),
            wake_phrase: env::var("WAKE_PHRASE").unwrap_or_else(|_| "jarvis".to_string()),
            system_prompt: env::var("SYSTEM_PROMPT").unwrap_or_else(|_| {
                "You are a helpful assistant in a Discord server. \
                 Keep your answers short and conversational."
                    .to_string()
            }),
            capture_seconds,
            sentence_batch_chars,
        })
    }
}
