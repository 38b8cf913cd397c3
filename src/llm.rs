use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use futures::StreamExt;

use crate::config::GROQ_API_BASE;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Response parsing error: {0}")]
    Parse(String),
    #[error("request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion client for the Groq OpenAI-compatible API.
pub struct ChatClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl ChatClient {
    pub fn new(api_key: String, model: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(60)) // LLM calls can be slow
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            base_url: GROQ_API_BASE.to_string(),
            model,
        }
    }

    /// Single-shot completion, used by the text chat command.
    pub async fn complete(&self, messages: Vec<Message>) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = json!({
            "model": self.model,
            "messages": messages_json(messages),
            "stream": false
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let json: Value = response.json().await?;
        let choices = json["choices"]
            .as_array()
            .ok_or_else(|| LlmError::Parse("Missing 'choices' field".to_string()))?;
        let content = choices
            .first()
            .and_then(|choice| choice["message"]["content"].as_str())
            .ok_or_else(|| LlmError::Parse("Missing message content".to_string()))?;

        Ok(content.trim().to_string())
    }

    /// Streaming completion that groups sentences into batches and sends
    /// them on `batches` as they become ready. Returns the full response
    /// text once the stream ends. Stops early when `cancel` fires or the
    /// receiving side goes away.
    pub async fn stream_sentences(
        &self,
        messages: Vec<Message>,
        batch_chars: usize,
        cancel: CancellationToken,
        batches: mpsc::Sender<String>,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = json!({
            "model": self.model,
            "messages": messages_json(messages),
            "stream": true
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let mut stream = response.bytes_stream();
        let mut batcher = SentenceBatcher::new(batch_chars);
        let mut pending_lines = String::new();
        let mut full_text = String::new();
        let mut done = false;

        while !done {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            pending_lines.push_str(&String::from_utf8_lossy(&chunk?));

            // SSE events can be split across network chunks, so only
            // complete lines are consumed here.
            while let Some(newline) = pending_lines.find('\n') {
                let line = pending_lines[..newline].trim_end_matches('\r').to_string();
                pending_lines.drain(..=newline);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    done = true;
                    break;
                }
                let Ok(json) = serde_json::from_str::<Value>(data) else {
                    continue;
                };
                let Some(content) = json["choices"][0]["delta"]["content"].as_str() else {
                    continue;
                };

                full_text.push_str(content);
                for batch in batcher.push(content) {
                    if batches.send(batch).await.is_err() {
                        return Err(LlmError::Cancelled);
                    }
                }
            }
        }

        if let Some(rest) = batcher.finish() {
            let _ = batches.send(rest).await;
        }

        Ok(full_text)
    }
}

fn messages_json(messages: Vec<Message>) -> Vec<Value> {
    messages
        .into_iter()
        .map(|msg| {
            json!({
                "role": msg.role,
                "content": msg.content
            })
        })
        .collect()
}

fn is_sentence_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// Groups streamed text into sentence batches. A sentence ends at the last
/// terminator of a consecutive run (so "wait..." stays whole), and batches
/// are emitted once their combined length reaches `batch_chars`. Text that
/// never saw a terminator is flushed by `finish`.
pub struct SentenceBatcher {
    batch_chars: usize,
    tail: String,
    pending: Vec<String>,
}

impl SentenceBatcher {
    pub fn new(batch_chars: usize) -> Self {
        Self {
            batch_chars: batch_chars.max(1),
            tail: String::new(),
            pending: Vec::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.tail.push_str(chunk);

        let mut flushed = Vec::new();
        let chars: Vec<(usize, char)> = self.tail.char_indices().collect();
        let mut cut_from = 0usize;

        for (i, &(pos, c)) in chars.iter().enumerate() {
            if !is_sentence_terminator(c) {
                continue;
            }
            // At the end of the buffer more terminators may still arrive,
            // so a run only ends once a non-terminator follows it.
            let run_continues = chars
                .get(i + 1)
                .map_or(true, |&(_, next)| is_sentence_terminator(next));
            if run_continues {
                continue;
            }

            let end = pos + c.len_utf8();
            let sentence = self.tail[cut_from..end].trim();
            if !sentence.is_empty() {
                self.pending.push(sentence.to_string());
                if self.pending_chars() >= self.batch_chars {
                    flushed.push(self.take_pending());
                }
            }
            cut_from = end;
        }

        self.tail.drain(..cut_from);
        flushed
    }

    pub fn finish(mut self) -> Option<String> {
        let rest = self.tail.trim().to_string();
        if !rest.is_empty() {
            self.pending.push(rest);
        }
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_pending())
        }
    }

    fn pending_chars(&self) -> usize {
        let text: usize = self.pending.iter().map(String::len).sum();
        text + self.pending.len().saturating_sub(1)
    }

    fn take_pending(&mut self) -> String {
        self.pending.drain(..).collect::<Vec<_>>().join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(batcher: &mut SentenceBatcher, chunks: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(batcher.push(chunk));
        }
        out
    }

    #[test]
    fn message_constructors_set_roles() {
        let system_msg = Message::system("You are a helpful assistant");
        assert_eq!(system_msg.role, "system");
        assert_eq!(system_msg.content, "You are a helpful assistant");

        let user_msg = Message::user("Hello");
        assert_eq!(user_msg.role, "user");

        let assistant_msg = Message::assistant("Hi there!");
        assert_eq!(assistant_msg.role, "assistant");
    }

    #[test]
    fn batches_flush_once_threshold_is_reached() {
        let mut batcher = SentenceBatcher::new(10);
        let mut out = run(
            &mut batcher,
            &["Hello ther", "e. This is a te", "st. Short."],
        );
        out.extend(batcher.finish());
        assert_eq!(out, vec!["Hello there.", "This is a test.", "Short."]);
    }

    #[test]
    fn short_sentences_accumulate_into_one_batch() {
        let mut batcher = SentenceBatcher::new(100);
        let mut out = run(&mut batcher, &["Hi. Yo. Done now."]);
        out.extend(batcher.finish());
        assert_eq!(out, vec!["Hi. Yo. Done now."]);
    }

    #[test]
    fn terminator_runs_stay_in_one_sentence() {
        let mut batcher = SentenceBatcher::new(5);
        let mut out = run(&mut batcher, &["Wait... what? Ok."]);
        out.extend(batcher.finish());
        assert_eq!(out, vec!["Wait...", "what?", "Ok."]);
    }

    #[test]
    fn batches_concatenate_back_to_the_full_text() {
        let text = "One. Two! Three? Four.";
        let mut batcher = SentenceBatcher::new(1);
        let mut out = run(&mut batcher, &[text]);
        out.extend(batcher.finish());
        assert_eq!(out.join(" "), text);
    }

    #[test]
    fn text_without_terminators_flushes_on_finish() {
        let mut batcher = SentenceBatcher::new(10);
        let out = run(&mut batcher, &["no punctuation here"]);
        assert!(out.is_empty());
        assert_eq!(batcher.finish(), Some("no punctuation here".to_string()));
    }

    #[test]
    fn empty_stream_produces_no_batches() {
        let batcher = SentenceBatcher::new(10);
        assert_eq!(batcher.finish(), None);
    }

    #[test]
    fn every_batch_except_the_last_meets_the_threshold() {
        let text = "Alpha beta gamma. Delta epsilon zeta. Eta theta. Io.";
        let mut batcher = SentenceBatcher::new(20);
        let mut out = run(&mut batcher, &[text]);
        out.extend(batcher.finish());
        assert!(out.len() > 1);
        for batch in &out[..out.len() - 1] {
            assert!(batch.len() >= 20, "undersized batch: {batch}");
        }
    }
}
