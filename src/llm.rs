//! LLM integration via OpenRouter
//!
//! The orchestrator depends only on the `CompletionProvider` trait, so the
//! repair algorithm is independent of which backend is active. The shipped
//! implementation calls OpenRouter's chat-completions API with automatic
//! retry and exponential backoff for rate limits.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::util::truncate;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Per-request wall-clock limit. The run-level timeout is enforced by the
/// orchestrator between phases; this bounds a single hung call.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Model {
    /// anthropic/claude-sonnet-4 - for planning and patch generation
    Claude,
    /// deepseek/deepseek-chat - for the cheaper critic pass
    DeepSeek,
}

impl Model {
    pub fn id(&self) -> &'static str {
        match self {
            Model::Claude => "anthropic/claude-sonnet-4",
            Model::DeepSeek => "deepseek/deepseek-chat",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Model::Claude => "Claude Sonnet 4",
            Model::DeepSeek => "DeepSeek",
        }
    }
}

/// One completion request from the orchestrator.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub model: Model,
}

/// The LLM collaborator seam.
pub trait CompletionProvider {
    fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: String,
}

/// Blocking OpenRouter client.
pub struct OpenRouterClient {
    api_key: String,
    client: reqwest::blocking::Client,
}

impl OpenRouterClient {
    pub fn new(api_key: String) -> Result<Self, LlmError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| LlmError::Transient(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { api_key, client })
    }
}

/// Extract retry-after hint from an error response body (if present)
fn parse_retry_after(text: &str) -> Option<u64> {
    // Look for patterns like "retry after X seconds" or "wait X seconds"
    let text_lower = text.to_lowercase();
    if let Some(pos) = text_lower.find("retry") {
        let after_retry = &text_lower[pos..];
        for word in after_retry.split_whitespace().skip(1).take(5) {
            if let Ok(secs) = word.trim_matches(|c: char| !c.is_numeric()).parse::<u64>() {
                if secs > 0 && secs < 300 {
                    return Some(secs);
                }
            }
        }
    }
    None
}

impl CompletionProvider for OpenRouterClient {
    fn complete(&self, request: &CompletionRequest) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: request.model.id().to_string(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: request.system.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: request.user.clone(),
                },
            ],
            max_tokens: request.max_tokens,
            stream: false,
        };

        let mut retry_count = 0;

        loop {
            let response = self
                .client
                .post(OPENROUTER_URL)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("X-Title", "mend")
                .json(&body)
                .send()
                .map_err(|e| LlmError::Transient(format!("request failed: {}", e)))?;

            if response.status().is_success() {
                let chat_response: ChatResponse = response
                    .json()
                    .map_err(|e| LlmError::Malformed(format!("unparseable response: {}", e)))?;

                let content = chat_response
                    .choices
                    .first()
                    .map(|c| c.message.content.clone())
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| LlmError::Malformed("empty completion".to_string()))?;

                return Ok(content);
            }

            let status = response.status();
            let text = response.text().unwrap_or_default();

            // Rate limits and server hiccups get a bounded retry here;
            // anything surviving it surfaces as Transient for the
            // orchestrator's own retry policy.
            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && retry_count < MAX_RETRIES {
                retry_count += 1;
                let backoff_secs = parse_retry_after(&text).unwrap_or_else(|| {
                    INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1) / 1000
                });
                thread::sleep(Duration::from_secs(backoff_secs));
                continue;
            }

            return Err(match status.as_u16() {
                401 | 403 => LlmError::Auth(format!("API rejected credentials ({})", status)),
                429 => LlmError::Transient(format!("rate limited after {} retries", retry_count)),
                500..=599 => LlmError::Transient(format!("server error {}", status)),
                _ => LlmError::Transient(format!("API error {}: {}", status, truncate(&text, 200))),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("please retry after 30 seconds"), Some(30));
        assert_eq!(parse_retry_after("retry in 5s"), Some(5));
        assert_eq!(parse_retry_after("no hint here"), None);
        // Absurd values are ignored
        assert_eq!(parse_retry_after("retry after 9999 seconds"), None);
    }

    #[test]
    fn test_model_ids() {
        assert_eq!(Model::Claude.id(), "anthropic/claude-sonnet-4");
        assert_eq!(Model::DeepSeek.id(), "deepseek/deepseek-chat");
    }
}
