//! 具体的な推論バックエンド。閉じた列挙型で表現し、実行時の順序は設定で決める。

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use super::chat::{ChatCompletionsClient, ChatFailure, ResponseFormat};
use super::{InferenceError, InferenceRequest};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Groq,
    LmStudio,
    OpenAi,
}

impl ProviderKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Groq => "groq",
            ProviderKind::LmStudio => "lmstudio",
            ProviderKind::OpenAi => "openai",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(ProviderKind::Groq),
            "lmstudio" | "lm-studio" | "lm_studio" => Ok(ProviderKind::LmStudio),
            "openai" => Ok(ProviderKind::OpenAi),
            other => Err(format!("unknown provider `{other}`")),
        }
    }
}

/// 1 プロバイダ分の接続設定。
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    /// チェーン内での名前（`groq`, `groq-fallback` など）。
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// 連続リクエストの最小間隔。`None` なら制限しない。
    pub min_interval: Option<Duration>,
}

/// 全プロバイダ共通の生成パラメータ。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LlmSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 1024,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Groq: API キー必須、無料枠に合わせて最小間隔でスロットリングする。
pub struct GroqProvider {
    name: String,
    chat: ChatCompletionsClient,
    limiter: Option<DirectLimiter>,
}

/// LM Studio: ローカル、キー不要、厳密な JSON Schema を要求する。
pub struct LmStudioProvider {
    name: String,
    chat: ChatCompletionsClient,
}

pub struct OpenAiProvider {
    name: String,
    chat: ChatCompletionsClient,
}

pub enum InferenceProvider {
    Groq(GroqProvider),
    LmStudio(LmStudioProvider),
    OpenAi(OpenAiProvider),
}

impl fmt::Debug for InferenceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceProvider")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("model", &self.chat().model())
            .finish()
    }
}

impl InferenceProvider {
    /// 設定からプロバイダを構築する。
    ///
    /// # Errors
    /// 必須のキーが無い、または URL が不正な場合は `Configuration`。
    pub fn from_settings(
        settings: &ProviderSettings,
        llm: &LlmSettings,
    ) -> Result<Self, InferenceError> {
        let configuration = |detail: String| InferenceError::Configuration {
            provider: settings.name.clone(),
            detail,
        };
        if settings.model.trim().is_empty() {
            return Err(configuration("model identifier is empty".to_string()));
        }
        let api_key = settings
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(ToString::to_string);

        let format = match settings.kind {
            ProviderKind::LmStudio => ResponseFormat::StrictSchema,
            ProviderKind::Groq | ProviderKind::OpenAi => ResponseFormat::JsonObject,
        };
        if settings.kind != ProviderKind::LmStudio && api_key.is_none() {
            return Err(configuration(format!(
                "{} requires an API key",
                settings.kind
            )));
        }

        let chat = ChatCompletionsClient::new(
            &settings.base_url,
            api_key,
            settings.model.clone(),
            llm.temperature,
            llm.max_tokens,
            llm.timeout,
            format,
        )
        .map_err(|error| configuration(format!("{error:#}")))?;

        let name = settings.name.clone();
        Ok(match settings.kind {
            ProviderKind::Groq => InferenceProvider::Groq(GroqProvider {
                name,
                chat,
                limiter: settings
                    .min_interval
                    .and_then(Quota::with_period)
                    .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN))),
            }),
            ProviderKind::LmStudio => InferenceProvider::LmStudio(LmStudioProvider { name, chat }),
            ProviderKind::OpenAi => InferenceProvider::OpenAi(OpenAiProvider { name, chat }),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            InferenceProvider::Groq(provider) => &provider.name,
            InferenceProvider::LmStudio(provider) => &provider.name,
            InferenceProvider::OpenAi(provider) => &provider.name,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        match self {
            InferenceProvider::Groq(_) => ProviderKind::Groq,
            InferenceProvider::LmStudio(_) => ProviderKind::LmStudio,
            InferenceProvider::OpenAi(_) => ProviderKind::OpenAi,
        }
    }

    fn chat(&self) -> &ChatCompletionsClient {
        match self {
            InferenceProvider::Groq(provider) => &provider.chat,
            InferenceProvider::LmStudio(provider) => &provider.chat,
            InferenceProvider::OpenAi(provider) => &provider.chat,
        }
    }

    /// プロンプトを送り、構造化応答か型付きの失敗を返す。
    ///
    /// # Errors
    /// [`InferenceError`] の各分類。
    pub async fn invoke(&self, request: &InferenceRequest) -> Result<Value, InferenceError> {
        if let InferenceProvider::Groq(GroqProvider {
            limiter: Some(limiter),
            ..
        }) = self
        {
            limiter.until_ready().await;
        }

        debug!(
            provider = self.name(),
            model = self.chat().model(),
            shape = ?request.shape,
            "invoking inference provider"
        );
        self.chat()
            .complete(request)
            .await
            .map_err(|failure| self.classify(failure))
    }

    fn classify(&self, failure: ChatFailure) -> InferenceError {
        let provider = self.name().to_string();
        match failure {
            ChatFailure::Transport(detail) => InferenceError::Transport { provider, detail },
            ChatFailure::Malformed(detail) => InferenceError::Malformed { provider, detail },
            ChatFailure::Status {
                status,
                retry_after,
                body,
            } => self.classify_status(provider, status, retry_after, body),
        }
    }

    fn classify_status(
        &self,
        provider: String,
        status: StatusCode,
        retry_after: Option<Duration>,
        body: String,
    ) -> InferenceError {
        let detail = format!("{status}: {body}");
        let lowered = body.to_ascii_lowercase();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                InferenceError::Configuration { provider, detail }
            }
            StatusCode::PAYMENT_REQUIRED => InferenceError::QuotaExceeded { provider, detail },
            StatusCode::TOO_MANY_REQUESTS if self.is_quota_exhaustion(&lowered) => {
                InferenceError::QuotaExceeded { provider, detail }
            }
            StatusCode::TOO_MANY_REQUESTS => InferenceError::RateLimited {
                provider,
                detail,
                retry_after,
            },
            StatusCode::NOT_FOUND if lowered.contains("model") => {
                InferenceError::Configuration { provider, detail }
            }
            status if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT => {
                InferenceError::Transport { provider, detail }
            }
            _ => InferenceError::Malformed { provider, detail },
        }
    }

    /// 429 のうち、同じ実行内で回復しない枯渇を表すもの。
    fn is_quota_exhaustion(&self, lowered_body: &str) -> bool {
        match self {
            InferenceProvider::Groq(_) => {
                lowered_body.contains("per day")
                    || lowered_body.contains("tokens per day")
                    || lowered_body.contains("(rpd)")
                    || lowered_body.contains("(tpd)")
            }
            InferenceProvider::OpenAi(_) => lowered_body.contains("insufficient_quota"),
            InferenceProvider::LmStudio(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::enrichment::ResponseShape;
    use rstest::rstest;
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(kind: ProviderKind, base_url: &str) -> ProviderSettings {
        ProviderSettings {
            kind,
            name: kind.as_str().to_string(),
            base_url: base_url.to_string(),
            model: "m".to_string(),
            api_key: Some("key".to_string()),
            min_interval: None,
        }
    }

    async fn failing(kind: ProviderKind, status: u16, body: &str) -> InferenceError {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&server)
            .await;
        let provider = InferenceProvider::from_settings(
            &settings(kind, &server.uri()),
            &LlmSettings::default(),
        )
        .expect("provider");
        provider
            .invoke(&InferenceRequest::new("x", ResponseShape::Single))
            .await
            .expect_err("failure status")
    }

    #[test]
    fn groq_without_key_is_configuration_error() {
        let mut settings = settings(ProviderKind::Groq, "http://localhost:1");
        settings.api_key = Some("  ".to_string());
        let error = InferenceProvider::from_settings(&settings, &LlmSettings::default())
            .expect_err("missing key");
        assert_eq!(error.kind(), "configuration");
    }

    #[test]
    fn lmstudio_needs_no_key() {
        let mut settings = settings(ProviderKind::LmStudio, "http://localhost:1234/v1");
        settings.api_key = None;
        let provider = InferenceProvider::from_settings(&settings, &LlmSettings::default())
            .expect("lmstudio");
        assert_eq!(provider.kind(), ProviderKind::LmStudio);
    }

    #[rstest]
    #[case(ProviderKind::Groq, 401, "bad key", "configuration")]
    #[case(ProviderKind::OpenAi, 402, "", "quota_exceeded")]
    #[case(ProviderKind::Groq, 429, "Rate limit reached for requests per minute", "rate_limited")]
    #[case(ProviderKind::Groq, 429, "Rate limit reached on tokens per day (TPD)", "quota_exceeded")]
    #[case(ProviderKind::OpenAi, 429, "{\"error\":{\"code\":\"insufficient_quota\"}}", "quota_exceeded")]
    #[case(ProviderKind::LmStudio, 429, "per day", "rate_limited")]
    #[case(ProviderKind::OpenAi, 503, "overloaded", "transport")]
    #[case(ProviderKind::OpenAi, 400, "bad request", "malformed")]
    #[tokio::test]
    async fn status_codes_map_to_taxonomy(
        #[case] kind: ProviderKind,
        #[case] status: u16,
        #[case] body: &str,
        #[case] expected: &str,
    ) {
        assert_eq!(failing(kind, status, body).await.kind(), expected);
    }

    #[tokio::test]
    async fn success_returns_parsed_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "{\"value\": true}" } }]
            })))
            .mount(&server)
            .await;
        let provider = InferenceProvider::from_settings(
            &settings(ProviderKind::OpenAi, &server.uri()),
            &LlmSettings::default(),
        )
        .expect("provider");
        let value = provider
            .invoke(&InferenceRequest::new("vocal?", ResponseShape::Single))
            .await
            .expect("value");
        assert_eq!(value, json!({ "value": true }));
    }

    #[tokio::test]
    async fn connection_refused_is_transport() {
        let provider = InferenceProvider::from_settings(
            &settings(ProviderKind::OpenAi, "http://127.0.0.1:9"),
            &LlmSettings::default(),
        )
        .expect("provider");
        let error = provider
            .invoke(&InferenceRequest::new("x", ResponseShape::Single))
            .await
            .expect_err("refused");
        assert_eq!(error.kind(), "transport");
    }
}
