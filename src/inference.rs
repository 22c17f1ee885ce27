//! Inference providers behind one interface with a uniform error taxonomy.

pub mod chain;
pub(crate) mod chat;
pub mod provider;

use std::time::Duration;

use thiserror::Error;

use crate::schema::enrichment::ResponseShape;

pub use chain::{ChainError, ChainRetryPolicy, Invocation, ProviderChain, ProviderSession};
pub use provider::{InferenceProvider, LlmSettings, ProviderKind, ProviderSettings};

/// プロバイダ 1 回分の呼び出し失敗。
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InferenceError {
    #[error("{provider}: rate limited: {detail}")]
    RateLimited {
        provider: String,
        detail: String,
        retry_after: Option<Duration>,
    },
    #[error("{provider}: quota exceeded: {detail}")]
    QuotaExceeded { provider: String, detail: String },
    #[error("{provider}: configuration error: {detail}")]
    Configuration { provider: String, detail: String },
    #[error("{provider}: transport error: {detail}")]
    Transport { provider: String, detail: String },
    #[error("{provider}: malformed response: {detail}")]
    Malformed { provider: String, detail: String },
}

impl InferenceError {
    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            InferenceError::RateLimited { provider, .. }
            | InferenceError::QuotaExceeded { provider, .. }
            | InferenceError::Configuration { provider, .. }
            | InferenceError::Transport { provider, .. }
            | InferenceError::Malformed { provider, .. } => provider,
        }
    }

    /// メトリクスラベル用の種別名。
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            InferenceError::RateLimited { .. } => "rate_limited",
            InferenceError::QuotaExceeded { .. } => "quota_exceeded",
            InferenceError::Configuration { .. } => "configuration",
            InferenceError::Transport { .. } => "transport",
            InferenceError::Malformed { .. } => "malformed",
        }
    }
}

/// プロンプトと期待する応答形。
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub shape: ResponseShape,
}

impl InferenceRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>, shape: ResponseShape) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            shape,
        }
    }

    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}
