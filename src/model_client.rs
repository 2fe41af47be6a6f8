//! Model invocation with retry — C3.
//!
//! `ModelClient` is a capability trait selected by per-trader
//! configuration; the set of backends is closed so no runtime registry is
//! needed.

use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ModelErrorKind;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ModelCallOutput {
    pub text: String,
    pub usage: ModelUsage,
    pub latency: Duration,
}

/// The uniform wire contract every backend (DeepSeek, Qwen, OpenAI, Claude,
/// Gemini, Grok, Kimi) implements. A single attempt; retry/backoff lives in
/// `call_with_retry`, not here, so implementors stay simple and testable in
/// isolation.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call_with_messages(
        &self,
        system: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<ModelCallOutput, ModelErrorKind>;
}

/// Reference HTTP implementation against an OpenAI-compatible
/// chat-completions endpoint, with a configurable model id per trader
/// instead of a hardcoded string.
pub struct HttpModelClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
}

impl HttpModelClient {
    pub fn new(http: reqwest::Client, endpoint: String, api_key: String, model: String) -> Self {
        Self {
            http,
            api_key,
            endpoint,
            model,
        }
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Deserialize)]
struct ChatMessageOut {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn call_with_messages(
        &self,
        system: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<ModelCallOutput, ModelErrorKind> {
        let start = Instant::now();
        let req = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .timeout(timeout)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelErrorKind::Timeout
                } else {
                    ModelErrorKind::Transport
                }
            })?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ModelErrorKind::Auth);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ModelErrorKind::RateLimited);
        }
        if status.is_server_error() {
            return Err(ModelErrorKind::Transport);
        }
        if status.is_client_error() {
            return Err(ModelErrorKind::Malformed);
        }

        let body: ChatCompletionResponse = resp.json().await.map_err(|_| ModelErrorKind::Malformed)?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .ok_or(ModelErrorKind::Malformed)?;

        Ok(ModelCallOutput {
            text: content,
            usage: ModelUsage {
                input_tokens: body.usage.as_ref().and_then(|u| u.prompt_tokens),
                output_tokens: body.usage.as_ref().and_then(|u| u.completion_tokens),
                total_tokens: body.usage.as_ref().and_then(|u| u.total_tokens),
            },
            latency: start.elapsed(),
        })
    }
}

/// Retry policy: up to 3 attempts, exponential backoff from 2s doubling,
/// jittered +/-20%. Retries only Transport/Timeout/RateLimited; never
/// Auth/Malformed.
pub async fn call_with_retry(
    client: &dyn ModelClient,
    system: &str,
    user: &str,
    timeout: Duration,
) -> Result<ModelCallOutput, ModelErrorKind> {
    const MAX_ATTEMPTS: u32 = 3;
    let mut backoff = Duration::from_secs(2);

    for attempt in 1..=MAX_ATTEMPTS {
        match client.call_with_messages(system, user, timeout).await {
            Ok(out) => return Ok(out),
            Err(kind) if kind.is_retryable() && attempt < MAX_ATTEMPTS => {
                let jittered = jitter(backoff);
                warn!(attempt, ?kind, delay_ms = jittered.as_millis() as u64, "model call failed, retrying");
                tokio::time::sleep(jittered).await;
                backoff *= 2;
            }
            Err(kind) => {
                debug!(attempt, ?kind, "model call failed, not retrying");
                return Err(kind);
            }
        }
    }
    unreachable!("loop returns on final attempt")
}

fn jitter(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(0.8..1.2);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FlakyClient {
        fail_times: u32,
        calls: Arc<AtomicU32>,
        kind: ModelErrorKind,
    }

    #[async_trait]
    impl ModelClient for FlakyClient {
        async fn call_with_messages(
            &self,
            _system: &str,
            _user: &str,
            _timeout: Duration,
        ) -> Result<ModelCallOutput, ModelErrorKind> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(self.kind);
            }
            Ok(ModelCallOutput {
                text: "ok".into(),
                usage: ModelUsage::default(),
                latency: Duration::from_millis(1),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_and_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = FlakyClient {
            fail_times: 2,
            calls: calls.clone(),
            kind: ModelErrorKind::Transport,
        };
        let out = call_with_retry(&client, "sys", "user", Duration::from_millis(10)).await;
        assert!(out.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_retries_auth_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = FlakyClient {
            fail_times: 99,
            calls: calls.clone(),
            kind: ModelErrorKind::Auth,
        };
        let out = call_with_retry(&client, "sys", "user", Duration::from_millis(10)).await;
        assert!(matches!(out, Err(ModelErrorKind::Auth)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let client = FlakyClient {
            fail_times: 99,
            calls: calls.clone(),
            kind: ModelErrorKind::RateLimited,
        };
        let out = call_with_retry(&client, "sys", "user", Duration::from_millis(10)).await;
        assert!(matches!(out, Err(ModelErrorKind::RateLimited)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
