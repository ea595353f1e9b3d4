//! LLM provider seam.
//!
//! The core never invokes models directly; workers drive a [`Provider`]
//! implementation. [`HttpProvider`] speaks the OpenAI-compatible chat
//! completions shape (the common denominator of the hosted models in the
//! price table); [`ScriptedProvider`] replays canned responses for tests
//! and dry runs.

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::ResilienceConfig;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider returned an unusable response: {0}")]
    BadResponse(String),
    #[error("provider exhausted retries: {0}")]
    RetriesExhausted(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
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

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub latency_ms: f64,
    pub retries: u32,
}

/// Consumed interface between workers and the model adapters.
///
/// Implementations send text chunks through `chunk_tx` as they arrive (a
/// non-streaming transport may send the whole text as one chunk) and
/// return the final completion with token accounting.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
        chunk_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Completion, ProviderError>;
}

// ── OpenAI-compatible HTTP provider ─────────────────────────────────────

pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    resilience: ResilienceConfig,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, resilience: ResilienceConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            resilience,
        }
    }

    /// Resolve from an agent's `api_key_env` / `base_url_env` entries.
    pub fn from_env(api_key_env: &str, base_url_env: &str, resilience: ResilienceConfig) -> Self {
        let api_key = std::env::var(api_key_env).unwrap_or_default();
        let base_url = std::env::var(base_url_env)
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        Self::new(base_url, api_key, resilience)
    }

    async fn attempt(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": false,
        });
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }

        let started = Instant::now();
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Request(format!(
                "HTTP {status}: {}",
                text.chars().take(300).collect::<String>()
            )));
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::BadResponse(e.to_string()))?;
        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::BadResponse("no choices[0].message.content".into()))?
            .to_string();

        Ok(Completion {
            text,
            prompt_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            retries: 0,
        })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn complete(
        &self,
        request: &CompletionRequest,
        chunk_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Completion, ProviderError> {
        let mut delay = self.resilience.base_delay;
        let mut last_err = String::new();

        for attempt in 0..=self.resilience.max_retries {
            match self.attempt(request).await {
                Ok(mut completion) => {
                    completion.retries = attempt;
                    if let Some(tx) = &chunk_tx {
                        let _ = tx.send(completion.text.clone());
                    }
                    return Ok(completion);
                }
                Err(e) => {
                    last_err = e.to_string();
                    tracing::warn!(attempt, error = %last_err, "provider call failed");
                    if attempt < self.resilience.max_retries {
                        let jitter = if self.resilience.jitter {
                            use rand::Rng as _;
                            rand::thread_rng().gen_range(0.0..delay * 0.25)
                        } else {
                            0.0
                        };
                        tokio::time::sleep(std::time::Duration::from_secs_f64(delay + jitter))
                            .await;
                        delay = (delay * 2.0).min(self.resilience.max_delay);
                    }
                }
            }
        }
        Err(ProviderError::RetriesExhausted(last_err))
    }
}

// ── Scripted provider for tests ─────────────────────────────────────────

/// Replays queued responses in order; repeats the last one when drained.
/// Chunked delivery exercises the streaming path.
pub struct ScriptedProvider {
    responses: Mutex<Vec<String>>,
    chunk_size: usize,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            chunk_size: 16,
        }
    }

    pub fn single(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(
        &self,
        request: &CompletionRequest,
        chunk_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Completion, ProviderError> {
        let text = {
            let mut responses = self.responses.lock().expect("scripted responses lock");
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                responses
                    .first()
                    .cloned()
                    .ok_or_else(|| ProviderError::Request("script exhausted".into()))?
            }
        };

        if let Some(tx) = &chunk_tx {
            let chars: Vec<char> = text.chars().collect();
            for chunk in chars.chunks(self.chunk_size) {
                let _ = tx.send(chunk.iter().collect());
            }
        }

        let prompt_tokens: u64 = request
            .messages
            .iter()
            .map(|m| m.content.split_whitespace().count() as u64)
            .sum();
        Ok(Completion {
            completion_tokens: text.split_whitespace().count() as u64,
            prompt_tokens,
            text,
            latency_ms: 1.0,
            retries: 0,
        })
    }
}
