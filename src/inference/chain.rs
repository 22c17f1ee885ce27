//! 優先順位付きプロバイダチェーンと、実行ごとの枯渇状態を持つセッション。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use super::{InferenceError, InferenceProvider, InferenceRequest};
use crate::observability::metrics::Metrics;
use crate::util::retry::RetryConfig;

/// チェーン全体の再試行方針。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainRetryPolicy {
    /// `RateLimited` のバックオフ（同一プロバイダでの試行上限を含む）。
    pub rate_limit: RetryConfig,
    /// `Malformed` / `Transport` の同一プロバイダでの試行上限（初回を含む）。
    pub malformed_max_attempts: usize,
}

impl Default for ChainRetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit: RetryConfig::default(),
            malformed_max_attempts: 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    /// 利用可能なプロバイダが残っていない。レコードは変更しない。
    #[error("all inference providers exhausted (tried: {})", attempted.join(", "))]
    Exhausted { attempted: Vec<String> },
    /// 呼び出しは行われたが使える結果が得られなかった。バッチ内の各レコードは `failed`。
    #[error("inference failed: {source}")]
    Failed {
        #[source]
        source: InferenceError,
    },
}

/// 成功した呼び出しと、それを返したプロバイダ名。
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub provider: String,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct ProviderChain {
    providers: Vec<Arc<InferenceProvider>>,
    policy: ChainRetryPolicy,
    metrics: Arc<Metrics>,
}

impl ProviderChain {
    #[must_use]
    pub fn new(
        providers: Vec<Arc<InferenceProvider>>,
        policy: ChainRetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            providers,
            policy,
            metrics,
        }
    }

    #[must_use]
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// 指定名のプロバイダだけに絞ったチェーンを返す。未知の名前なら `None`。
    #[must_use]
    pub fn restricted_to(&self, name: &str) -> Option<Self> {
        let provider = self
            .providers
            .iter()
            .find(|provider| provider.name().eq_ignore_ascii_case(name.trim()))?;
        Some(Self {
            providers: vec![Arc::clone(provider)],
            policy: self.policy,
            metrics: Arc::clone(&self.metrics),
        })
    }

    /// 実行単位のセッションを開始する。枯渇状態はセッション内だけで保持される。
    #[must_use]
    pub fn session(&self) -> ProviderSession {
        ProviderSession {
            chain: self.clone(),
            exhausted: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSession {
    chain: ProviderChain,
    exhausted: Arc<Mutex<HashSet<String>>>,
}

enum Attempt {
    Success(Invocation),
    Failover,
    Failed(InferenceError),
}

impl ProviderSession {
    #[must_use]
    pub fn exhausted_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .exhausted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        let exhausted = self.exhausted.lock().unwrap_or_else(PoisonError::into_inner);
        self.chain
            .providers
            .iter()
            .all(|provider| exhausted.contains(provider.name()))
    }

    fn is_provider_exhausted(&self, name: &str) -> bool {
        self.exhausted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    fn mark_exhausted(&self, name: &str) {
        self.exhausted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
    }

    /// 優先順にプロバイダを試し、最初の成功を返す。
    ///
    /// # Errors
    /// 全プロバイダ枯渇なら [`ChainError::Exhausted`]、
    /// 不正応答・通信失敗が上限に達したら [`ChainError::Failed`]。
    pub async fn invoke(&self, request: &InferenceRequest) -> Result<Invocation, ChainError> {
        let mut attempted = Vec::new();
        for provider in &self.chain.providers {
            if self.is_provider_exhausted(provider.name()) {
                continue;
            }
            attempted.push(provider.name().to_string());
            match self.invoke_provider(provider, request).await {
                Attempt::Success(invocation) => return Ok(invocation),
                Attempt::Failed(source) => return Err(ChainError::Failed { source }),
                Attempt::Failover => {
                    self.mark_exhausted(provider.name());
                    self.chain
                        .metrics
                        .failovers
                        .with_label_values(&[provider.name()])
                        .inc();
                    info!(provider = provider.name(), "provider exhausted, failing over");
                }
            }
        }
        Err(ChainError::Exhausted { attempted })
    }

    async fn invoke_provider(
        &self,
        provider: &InferenceProvider,
        request: &InferenceRequest,
    ) -> Attempt {
        let policy = self.chain.policy;
        let mut rate_limited_attempts = 0usize;
        let mut malformed_attempts = 0usize;

        loop {
            let result = provider.invoke(request).await;
            let label = match &result {
                Ok(_) => "ok",
                Err(error) => error.kind(),
            };
            self.chain
                .metrics
                .provider_calls
                .with_label_values(&[provider.name(), label])
                .inc();

            let error = match result {
                Ok(value) => {
                    return Attempt::Success(Invocation {
                        provider: provider.name().to_string(),
                        value,
                    });
                }
                Err(error) => error,
            };

            match &error {
                InferenceError::RateLimited { retry_after, .. } => {
                    rate_limited_attempts += 1;
                    if !policy.rate_limit.can_retry(rate_limited_attempts) {
                        warn!(
                            provider = provider.name(),
                            attempt = rate_limited_attempts,
                            "rate limit persisted past retry budget"
                        );
                        return Attempt::Failover;
                    }
                    let delay = policy
                        .rate_limit
                        .delay_with_floor(rate_limited_attempts, *retry_after);
                    warn!(
                        provider = provider.name(),
                        attempt = rate_limited_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "rate limited, backing off"
                    );
                    sleep(delay).await;
                }
                InferenceError::QuotaExceeded { .. } | InferenceError::Configuration { .. } => {
                    warn!(provider = provider.name(), error = %error, "provider unusable for this run");
                    return Attempt::Failover;
                }
                InferenceError::Malformed { .. } | InferenceError::Transport { .. } => {
                    malformed_attempts += 1;
                    if malformed_attempts >= policy.malformed_max_attempts.max(1) {
                        warn!(
                            provider = provider.name(),
                            attempt = malformed_attempts,
                            error = %error,
                            "giving up on unusable response"
                        );
                        return Attempt::Failed(error);
                    }
                    sleep(policy.rate_limit.delay_for_attempt(malformed_attempts)).await;
                }
            }
        }
    }
}
