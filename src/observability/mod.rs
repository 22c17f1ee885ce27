pub mod metrics;
pub(crate) mod tracing;

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{Encoder, Registry, TextEncoder};

use self::metrics::Metrics;

/// Telemetry（メトリクスとトレーシング）を管理する構造体。
#[derive(Debug, Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// トレーシングを初期化し、プロセス専用のレジストリでメトリクスを登録する。
    ///
    /// # Errors
    /// サブスクライバの初期化やメトリクス登録に失敗した場合。
    pub fn new(otel_endpoint: Option<&str>, otel_sampling_ratio: f64) -> Result<Self> {
        tracing::init(otel_endpoint, otel_sampling_ratio)?;
        Self::detached()
    }

    /// グローバルなトレーシングに触れずにメトリクスだけを用意する。
    ///
    /// # Errors
    /// メトリクス登録に失敗した場合。
    pub fn detached() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(
            Metrics::new(Arc::clone(&registry)).context("failed to register metrics")?,
        );
        Ok(Self { registry, metrics })
    }

    #[must_use]
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    #[must_use]
    pub fn metrics_arc(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn record_ready_probe(&self) {
        ::tracing::debug!("service ready probe");
    }

    pub fn record_live_probe(&self) {
        ::tracing::debug!("service live probe");
    }

    /// Prometheusテキスト形式でレンダリングする。
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(error) = encoder.encode(&self.registry.gather(), &mut buffer) {
            ::tracing::warn!(%error, "failed to encode prometheus metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
