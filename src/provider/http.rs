//! OpenAI-compatible chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{
    CallParams, ProviderChunk, ProviderClient, ProviderError, ProviderResponse,
    STREAM_CHANNEL_CAPACITY,
};

/// Connection settings for one OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub id: String,
    /// Base URL up to and including the version segment, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

pub struct HttpProviderClient {
    client: Client,
    config: HttpProviderConfig,
}

impl HttpProviderClient {
    pub fn new(config: HttpProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn request<'a>(&'a self, prompt: &'a str, params: &'a CallParams, stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: params.model.as_deref().unwrap_or(&self.config.model),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    /// Parse Retry-After header if present (seconds form only).
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    fn map_send_error(e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_connect() {
            ProviderError::Transport(format!("Connection failed: {}", e))
        } else {
            ProviderError::Transport(format!("Request failed: {}", e))
        }
    }

    async fn send(
        &self,
        body: &ChatRequest<'_>,
        timeout: Duration,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut builder = self
            .client
            .post(self.endpoint())
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(Self::map_send_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = Self::parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(
            provider = %self.config.id,
            status = %status,
            "Provider returned error status"
        );
        Err(ProviderError::from_status(status.as_u16(), &body, retry_after))
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn call(
        &self,
        prompt: &str,
        params: &CallParams,
        timeout: Duration,
    ) -> Result<ProviderResponse, ProviderError> {
        let request = self.request(prompt, params, false);
        let response = self.send(&request, timeout).await?;
        let body = response.text().await.map_err(Self::map_send_error)?;

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| ProviderError::InvalidResponse("No choices in response".to_string()))?;

        Ok(ProviderResponse {
            token_cost: parsed
                .usage
                .map(|u| u.total_tokens)
                .unwrap_or_else(|| super::estimate_tokens(prompt, params)),
            content,
            severity: None,
        })
    }

    async fn stream(
        &self,
        prompt: &str,
        params: &CallParams,
        timeout: Duration,
    ) -> mpsc::Receiver<ProviderChunk> {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let request = self.request(prompt, params, true);
        let response = match self.send(&request, timeout).await {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.try_send(ProviderChunk::Failed(e));
                return rx;
            }
        };

        let fallback_cost = super::estimate_tokens(prompt, params);
        let provider = self.config.id.clone();
        tokio::spawn(async move {
            let mut bytes = Box::pin(response.bytes_stream());
            // Raw bytes: a multibyte character may straddle two network chunks.
            let mut buf: Vec<u8> = Vec::new();
            let mut token_cost = None;

            while let Some(next) = bytes.next().await {
                let chunk = match next {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(ProviderChunk::Failed(Self::map_send_error(e))).await;
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = buf.drain(..=pos).collect();
                    let line = match std::str::from_utf8(&raw) {
                        Ok(line) => line,
                        Err(e) => {
                            let _ = tx
                                .send(ProviderChunk::Failed(ProviderError::InvalidResponse(
                                    format!("Stream line is not UTF-8: {}", e),
                                )))
                                .await;
                            return;
                        }
                    };

                    let event = match parse_line(line) {
                        Ok(None) => continue,
                        Ok(Some(SseLine::Done)) => {
                            let _ = tx
                                .send(ProviderChunk::Done {
                                    token_cost: token_cost.unwrap_or(fallback_cost),
                                    severity: None,
                                })
                                .await;
                            return;
                        }
                        Ok(Some(SseLine::Event(event))) => event,
                        Err(e) => {
                            tracing::debug!(provider = %provider, error = %e, "Stream reported an error");
                            let _ = tx.send(ProviderChunk::Failed(e)).await;
                            return;
                        }
                    };
                    if let Some(usage) = event.usage {
                        token_cost = Some(usage.total_tokens);
                    }
                    for choice in event.choices {
                        if let Some(content) = choice.delta.and_then(|d| d.content) {
                            if tx.send(ProviderChunk::Delta { content }).await.is_err() {
                                // Receiver gone: the call was cancelled.
                                return;
                            }
                        }
                    }
                }
            }

            tracing::debug!(provider = %provider, "Stream closed without [DONE]");
            let _ = tx
                .send(ProviderChunk::Failed(ProviderError::InvalidResponse(
                    "stream closed without [DONE]".to_string(),
                )))
                .await;
        });

        rx
    }
}

/// One meaningful SSE line.
enum SseLine {
    Event(StreamEvent),
    Done,
}

/// Interpret one line of an SSE body. Blank lines, comments and non-data
/// fields yield `None`; an in-stream error payload becomes an error.
fn parse_line(line: &str) -> Result<Option<SseLine>, ProviderError> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(Some(SseLine::Done));
    }

    let event: StreamEvent = serde_json::from_str(data)
        .map_err(|e| ProviderError::InvalidResponse(format!("Bad stream event: {}", e)))?;
    if let Some(error) = event.error {
        let status = error
            .code
            .as_ref()
            .and_then(|c| c.as_u64().or_else(|| c.as_str().and_then(|s| s.parse().ok())))
            .and_then(|c| u16::try_from(c).ok())
            .filter(|c| (400..=599).contains(c))
            .unwrap_or(502);
        return Err(ProviderError::from_status(status, &error.message, None));
    }
    Ok(Some(SseLine::Event(event)))
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChoiceContent>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<Usage>,
    /// Some providers answer 200 and then report failure as an event
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    message: String,
    code: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<ChoiceContent>,
}

#[derive(Debug, Deserialize)]
struct ChoiceContent {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u64,
}
