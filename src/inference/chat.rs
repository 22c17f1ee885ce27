//! OpenAI 互換 chat-completions トランスポート。

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode, Url, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::InferenceRequest;
use crate::schema::validate_json;

/// レスポンス形式の指定方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseFormat {
    /// `{"type": "json_object"}`
    JsonObject,
    /// `{"type": "json_schema", strict: true}` でスキーマを直接渡す。
    StrictSchema,
}

#[derive(Debug, Clone)]
pub(crate) struct ChatCompletionsClient {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
    format: ResponseFormat,
}

/// HTTP レベルの失敗。分類はプロバイダごとに行う。
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChatFailure {
    Status {
        status: StatusCode,
        retry_after: Option<Duration>,
        body: String,
    },
    Transport(String),
    Malformed(String),
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

const MAX_ERROR_BODY_CHARS: usize = 512;

impl ChatCompletionsClient {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
        temperature: f32,
        max_tokens: u32,
        timeout: Duration,
        format: ResponseFormat,
    ) -> Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|url| url.join("chat/completions"))
            .with_context(|| format!("invalid chat-completions base URL {base_url}"))?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("failed to build chat-completions client")?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            model: model.into(),
            temperature,
            max_tokens,
            timeout,
            format,
        })
    }

    pub(crate) fn model(&self) -> &str {
        &self.model
    }

    fn body(&self, request: &InferenceRequest) -> Value {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let response_format = match self.format {
            ResponseFormat::JsonObject => json!({ "type": "json_object" }),
            ResponseFormat::StrictSchema => json!({
                "type": "json_schema",
                "json_schema": {
                    "name": request.shape.name(),
                    "strict": true,
                    "schema": request.shape.schema(),
                }
            }),
        };

        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "response_format": response_format,
        })
    }

    /// 1 回の chat-completions 呼び出しを行い、スキーマ検証済みの JSON を返す。
    pub(crate) async fn complete(&self, request: &InferenceRequest) -> Result<Value, ChatFailure> {
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .timeout(self.timeout)
            .json(&self.body(request));
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| ChatFailure::Transport(describe_reqwest(&error)))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(ChatFailure::Status {
                status,
                retry_after,
                body: truncate(&body),
            });
        }

        let completion: ChatCompletionResponse = response.json().await.map_err(|error| {
            if error.is_timeout() {
                ChatFailure::Transport(describe_reqwest(&error))
            } else {
                ChatFailure::Malformed(format!("unexpected completion envelope: {error}"))
            }
        })?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| ChatFailure::Malformed("model returned empty content".to_string()))?;

        let parsed = parse_json_content(&content).ok_or_else(|| {
            ChatFailure::Malformed(format!("content is not JSON: {}", truncate(&content)))
        })?;

        let validation = validate_json(request.shape.schema(), &parsed);
        if !validation.valid {
            debug!(errors = ?validation.errors, "completion failed response schema validation");
            return Err(ChatFailure::Malformed(format!(
                "schema validation failed: {}",
                validation.errors.join("; ")
            )));
        }

        Ok(parsed)
    }
}

/// JSON として解析し、失敗したら最初の `{` から最後の `}` までを切り出して再解析する。
pub(crate) fn parse_json_content(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value.is_object().then_some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn parse_retry_after(raw: &str) -> Option<Duration> {
    let seconds = raw.trim().parse::<f64>().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

fn describe_reqwest(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        format!("request timed out: {error}")
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    }
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        body.to_string()
    } else {
        let head: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{head}...")
    }
}
