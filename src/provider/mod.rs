//! Provider clients: the remote model endpoints agents call through.
//!
//! A [`ProviderClient`] answers a prompt either in one piece (`call`) or as a
//! bounded channel of [`ProviderChunk`]s ending in a terminal chunk
//! (`stream`). The invoker always consumes the stream form.

mod error;
mod http;
mod registry;

pub use error::{classify_http_status, ProviderError, ProviderErrorKind};
pub use http::{HttpProviderClient, HttpProviderConfig};
pub use registry::ProviderRegistry;

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Capacity of per-call chunk channels.
pub const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Per-call parameters forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// A complete provider answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub content: String,
    /// Tokens consumed (prompt + completion)
    pub token_cost: u64,
    /// Self-reported severity in `[0.0, 1.0]`, if the answer carried one
    pub severity: Option<f64>,
}

/// One element of a streamed answer. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderChunk {
    Delta { content: String },
    Done { token_cost: u64, severity: Option<f64> },
    Failed(ProviderError),
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn id(&self) -> &str;

    async fn call(
        &self,
        prompt: &str,
        params: &CallParams,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Streamed form of `call`. The default wraps `call` in a single delta.
    async fn stream(
        &self,
        prompt: &str,
        params: &CallParams,
        timeout: Duration,
    ) -> mpsc::Receiver<ProviderChunk> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        match self.call(prompt, params, timeout).await {
            Ok(response) => {
                let _ = tx.try_send(ProviderChunk::Delta {
                    content: response.content,
                });
                let _ = tx.try_send(ProviderChunk::Done {
                    token_cost: response.token_cost,
                    severity: response.severity,
                });
            }
            Err(e) => {
                let _ = tx.try_send(ProviderChunk::Failed(e));
            }
        }
        rx
    }
}

/// Drain a chunk channel into a complete response.
///
/// A channel that closes before a terminal chunk is an invalid response.
pub async fn collect_stream(
    mut rx: mpsc::Receiver<ProviderChunk>,
) -> Result<ProviderResponse, ProviderError> {
    let mut content = String::new();
    while let Some(chunk) = rx.recv().await {
        match chunk {
            ProviderChunk::Delta { content: delta } => content.push_str(&delta),
            ProviderChunk::Done {
                token_cost,
                severity,
            } => {
                let severity = severity.or_else(|| extract_severity(&content));
                return Ok(ProviderResponse {
                    content,
                    token_cost,
                    severity,
                });
            }
            ProviderChunk::Failed(e) => return Err(e),
        }
    }
    Err(ProviderError::InvalidResponse(
        "stream ended without a terminal chunk".to_string(),
    ))
}

/// Pull a severity score out of model output.
///
/// Accepts a JSON object with a numeric `severity` field, or a
/// `severity: 0.8` style line anywhere in the text. Values outside
/// `[0.0, 1.0]` are ignored.
pub fn extract_severity(content: &str) -> Option<f64> {
    static SEVERITY_RE: OnceLock<Option<Regex>> = OnceLock::new();

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(content.trim()) {
        if let Some(s) = value.get("severity").and_then(|v| v.as_f64()) {
            return (0.0..=1.0).contains(&s).then_some(s);
        }
    }

    let re = SEVERITY_RE
        .get_or_init(|| Regex::new(r#"(?i)"?severity"?\s*[:=]\s*([0-9]*\.?[0-9]+)"#).ok())
        .as_ref()?;
    let s: f64 = re.captures(content)?.get(1)?.as_str().parse().ok()?;
    (0.0..=1.0).contains(&s).then_some(s)
}

/// Rough token estimate for a prompt: four characters per token.
pub fn estimate_tokens(prompt: &str, params: &CallParams) -> u64 {
    let prompt_tokens = (prompt.chars().count() as u64).div_ceil(4);
    prompt_tokens + params.max_tokens.unwrap_or(512) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_stream_concatenates_deltas() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(ProviderChunk::Delta {
            content: "hel".to_string(),
        })
        .await
        .unwrap();
        tx.send(ProviderChunk::Delta {
            content: "lo".to_string(),
        })
        .await
        .unwrap();
        tx.send(ProviderChunk::Done {
            token_cost: 7,
            severity: None,
        })
        .await
        .unwrap();

        let response = collect_stream(rx).await.unwrap();
        assert_eq!(response.content, "hello");
        assert_eq!(response.token_cost, 7);
    }

    #[tokio::test]
    async fn test_collect_stream_without_terminal_chunk() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(ProviderChunk::Delta {
            content: "partial".to_string(),
        })
        .await
        .unwrap();
        drop(tx);

        let err = collect_stream(rx).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }

    #[test]
    fn test_extract_severity() {
        assert_eq!(extract_severity(r#"{"severity": 0.9, "answer": "x"}"#), Some(0.9));
        assert_eq!(extract_severity("Looks risky.\nSeverity: 0.75"), Some(0.75));
        assert_eq!(extract_severity("severity = 7"), None);
        assert_eq!(extract_severity("all good"), None);
    }

    #[test]
    fn test_estimate_tokens() {
        let params = CallParams {
            max_tokens: Some(100),
            ..Default::default()
        };
        assert_eq!(estimate_tokens("abcdefgh", &params), 102);
        assert_eq!(estimate_tokens("abc", &CallParams::default()), 513);
    }
}
