/// Prometheusメトリクス定義。
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry,
};
use std::sync::Arc;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    /// ドメインごとの終端遷移数（`normalized` / `not_applicable` / `failed`）。
    pub outcomes: IntCounterVec,
    /// 推論を経ずに解決した件数（`pattern_rule` / `cache` / `routing`）。
    pub short_circuits: IntCounterVec,
    pub provider_calls: IntCounterVec,
    pub failovers: IntCounterVec,
    pub runs_started: IntCounter,
    pub runs_completed: IntCounter,
    pub runs_exhausted: IntCounter,
    pub runs_aborted: IntCounter,
    pub records_imported: IntCounter,

    // ヒストグラム
    pub batch_duration: HistogramVec,

    // ゲージ
    pub active_runs: IntGauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    ///
    /// # Errors
    /// 同じレジストリに同名のメトリクスが既に登録されている場合。
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            outcomes: register_int_counter_vec_with_registry!(
                Opts::new(
                    "enrich_outcomes_total",
                    "Terminal domain transitions by domain and outcome"
                ),
                &["domain", "outcome"],
                registry
            )?,
            short_circuits: register_int_counter_vec_with_registry!(
                Opts::new(
                    "enrich_short_circuits_total",
                    "Records resolved without an inference call"
                ),
                &["domain", "kind"],
                registry
            )?,
            provider_calls: register_int_counter_vec_with_registry!(
                Opts::new(
                    "enrich_provider_calls_total",
                    "Inference provider calls by provider and result"
                ),
                &["provider", "result"],
                registry
            )?,
            failovers: register_int_counter_vec_with_registry!(
                Opts::new(
                    "enrich_provider_failovers_total",
                    "Failovers away from an exhausted provider"
                ),
                &["provider"],
                registry
            )?,
            runs_started: register_int_counter_with_registry!(
                "enrich_runs_started_total",
                "Enrichment runs started",
                registry
            )?,
            runs_completed: register_int_counter_with_registry!(
                "enrich_runs_completed_total",
                "Enrichment runs completed",
                registry
            )?,
            runs_exhausted: register_int_counter_with_registry!(
                "enrich_runs_exhausted_total",
                "Enrichment runs stopped because every provider was exhausted",
                registry
            )?,
            runs_aborted: register_int_counter_with_registry!(
                "enrich_runs_aborted_total",
                "Enrichment runs aborted by an operator",
                registry
            )?,
            records_imported: register_int_counter_with_registry!(
                "enrich_records_imported_total",
                "Catalog records accepted from upstream importers",
                registry
            )?,
            batch_duration: register_histogram_vec_with_registry!(
                HistogramOpts::new(
                    "enrich_batch_duration_seconds",
                    "Wall-clock duration of one inference batch"
                )
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
                &["domain"],
                registry
            )?,
            active_runs: register_int_gauge_with_registry!(
                "enrich_active_runs",
                "Enrichment runs currently in progress",
                registry
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn metrics_register_once_per_registry() {
        let registry = Arc::new(Registry::new());
        let metrics = Metrics::new(Arc::clone(&registry)).expect("first registration");
        metrics
            .outcomes
            .with_label_values(&["genre", "not_applicable"])
            .inc();

        assert!(Metrics::new(Arc::clone(&registry)).is_err());

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .expect("encode");
        let text = String::from_utf8(buffer).expect("utf8");
        assert!(text.contains("enrich_outcomes_total{domain=\"genre\",outcome=\"not_applicable\"} 1"));
    }
}
