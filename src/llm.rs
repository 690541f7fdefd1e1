//! Model call boundary.
//!
//! The pipeline only needs `call(prompt, max_output_tokens, temperature) -> text`.
//! [`LanguageModel`] is that seam; [`HttpModel`] implements it against an
//! OpenAI-compatible chat completions endpoint, and [`RetryPolicy`] wraps any
//! implementation with bounded retries.

use crate::config::LlmConfig;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Rate-limited attempts wait this many times longer than other failures.
const RATE_LIMIT_DELAY_FACTOR: u32 = 4;

/// Errors that can occur during a model call.
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    /// Provider refused the call because of rate limits or quota
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// Provider answered with a non-success status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Network or client failure before a response arrived
    #[error("Communication error: {0}")]
    Communication(String),

    /// Response could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Model returned nothing usable
    #[error("Empty response from model")]
    EmptyResponse,
}

impl LlmError {
    /// Returns true for rate-limit-class failures.
    ///
    /// Some providers report throttling as a generic error, so the message is
    /// inspected as well as the variant.
    #[must_use]
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited(_) => true,
            Self::Http { status, message } => {
                *status == 429 || *status == 529 || mentions_rate_limit(message)
            }
            Self::Communication(message) | Self::InvalidResponse(message) => {
                mentions_rate_limit(message)
            }
            Self::EmptyResponse => false,
        }
    }
}

fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["rate limit", "rate_limit", "ratelimit", "too many requests", "quota", "overloaded"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// A text-in, text-out model.
///
/// Implementations must be callable from many worker threads at once.
pub trait LanguageModel: Send + Sync {
    /// Sends one prompt and returns the model's text.
    ///
    /// # Errors
    ///
    /// Returns an [`LlmError`] when the call fails; callers decide whether to retry.
    fn call(&self, prompt: &str, max_output_tokens: u32, temperature: f32)
    -> Result<String, LlmError>;
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,
    /// Delay doubles after every retry
    #[default]
    Exponential,
}

/// Bounded retry of a model call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Delay growth
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Builds the policy from model settings.
    #[must_use]
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_delay_ms),
            backoff: config.backoff,
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32, error: &LlmError) -> Duration {
        let mut delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1))),
        };
        if error.is_rate_limit() {
            delay = delay.saturating_mul(RATE_LIMIT_DELAY_FACTOR);
        }
        delay
    }

    /// Runs `attempt` until it succeeds or the retry budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the last error once `1 + max_retries` attempts have failed.
    pub fn run<F>(&self, mut attempt: F) -> Result<String, LlmError>
    where
        F: FnMut() -> Result<String, LlmError>,
    {
        let mut retry = 0;
        loop {
            let error = match attempt() {
                Ok(text) if text.trim().is_empty() => LlmError::EmptyResponse,
                Ok(text) => return Ok(text),
                Err(e) => e,
            };

            if retry >= self.max_retries {
                return Err(error);
            }
            retry += 1;

            let delay = self.delay_for(retry, &error);
            warn!(
                "Model call failed ({}), retry {}/{} in {:?}",
                error, retry, self.max_retries, delay
            );
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat completions client.
pub struct HttpModel {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpModel {
    /// Creates a client for the configured endpoint.
    ///
    /// The API key is read from the environment variable named by
    /// `config.api_key_env`; local endpoints may run without one.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be initialized.
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!(
                "{} is not set, calling {} without credentials",
                config.api_key_env, config.endpoint
            );
        }

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Communication(e.to_string()))?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            client,
        })
    }
}

impl LanguageModel for HttpModel {
    fn call(
        &self,
        prompt: &str,
        max_output_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: max_output_tokens,
            temperature,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        debug!("POST {} ({} prompt chars)", url, prompt.len());
        let response = request
            .send()
            .map_err(|e| LlmError::Communication(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let message = response.text().unwrap_or_default();
            return Err(LlmError::RateLimited(message));
        }
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(LlmError::EmptyResponse)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            backoff: Backoff::Fixed,
        }
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(LlmError::RateLimited(String::new()).is_rate_limit());
        assert!(
            LlmError::Http {
                status: 429,
                message: String::new()
            }
            .is_rate_limit()
        );
        assert!(
            LlmError::Http {
                status: 400,
                message: "You exceeded your current quota".to_string()
            }
            .is_rate_limit()
        );
        assert!(LlmError::Communication("Overloaded, try later".to_string()).is_rate_limit());
        assert!(!LlmError::Communication("connection reset".to_string()).is_rate_limit());
        assert!(!LlmError::EmptyResponse.is_rate_limit());
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            backoff: Backoff::Exponential,
        };
        let transient = LlmError::Communication("reset".to_string());

        assert_eq!(policy.delay_for(1, &transient), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2, &transient), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3, &transient), Duration::from_millis(400));
        assert_eq!(
            policy.delay_for(1, &LlmError::RateLimited(String::new())),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn test_fixed_delays() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            backoff: Backoff::Fixed,
        };
        let transient = LlmError::Communication("reset".to_string());

        assert_eq!(policy.delay_for(1, &transient), Duration::from_millis(250));
        assert_eq!(policy.delay_for(3, &transient), Duration::from_millis(250));
    }

    #[test]
    fn test_retry_succeeds_after_failures() {
        let attempts = Cell::new(0);
        let result = policy(2).run(|| {
            attempts.set(attempts.get() + 1);
            if attempts.get() < 3 {
                Err(LlmError::Communication("reset".to_string()))
            } else {
                Ok("done".to_string())
            }
        });

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.get(), 3);
    }

    #[test]
    fn test_retry_exhaustion_returns_last_error() {
        let attempts = Cell::new(0);
        let result = policy(2).run(|| {
            attempts.set(attempts.get() + 1);
            Err(LlmError::Http {
                status: 500,
                message: format!("attempt {}", attempts.get()),
            })
        });

        assert_eq!(attempts.get(), 3);
        assert!(result.unwrap_err().to_string().contains("attempt 3"));
    }

    #[test]
    fn test_empty_response_is_retried() {
        let attempts = Cell::new(0);
        let result = policy(1).run(|| {
            attempts.set(attempts.get() + 1);
            Ok("  \n".to_string())
        });

        assert_eq!(attempts.get(), 2);
        assert!(matches!(result, Err(LlmError::EmptyResponse)));
    }

    #[test]
    fn test_http_model_builds_without_key() {
        let config = LlmConfig {
            api_key_env: "LLMDOCS_TEST_UNSET_KEY".to_string(),
            endpoint: "http://localhost:11434/v1/".to_string(),
            ..LlmConfig::default()
        };
        let model = HttpModel::from_config(&config).unwrap();

        assert_eq!(model.endpoint, "http://localhost:11434/v1");
        assert!(model.api_key.is_none());
    }
}
