use anyhow::{Context, Error, Result};
use once_cell::sync::OnceCell;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    Resource,
    trace::{RandomIdGenerator, Sampler, SdkTracer, SdkTracerProvider},
};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "enrich-worker";

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Tracing サブスクライバを一度だけ初期化する。
///
/// OTLP エンドポイントが与えられた場合はトレースを送信する。
/// エクスポーターの構築に失敗したときは JSON ログのみで続行する。
///
/// # Errors
/// サブスクライバの初期化に失敗した場合はエラーを返す。
pub fn init(otel_endpoint: Option<&str>, sampling_ratio: f64) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(false).json();

        let tracer = otel_endpoint.and_then(|endpoint| {
            match init_tracer(endpoint, sampling_ratio) {
                Ok(tracer) => Some((endpoint, tracer)),
                Err(error) => {
                    eprintln!("OpenTelemetry exporter unavailable, continuing without it: {error:#}");
                    None
                }
            }
        });

        match tracer {
            Some((endpoint, tracer)) => {
                let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(otel_layer)
                    .try_init()
                    .map_err(|e| Error::msg(e.to_string()))?;
                info!(otel_enabled = true, endpoint = %endpoint, "tracing initialized");
            }
            None => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .try_init()
                    .map_err(|e| Error::msg(e.to_string()))?;
                info!(otel_enabled = false, "tracing initialized");
            }
        }

        Ok::<(), Error>(())
    })?;
    Ok(())
}

/// OTLPエクスポーター経由でOpenTelemetryトレーサーを初期化する。
fn init_tracer(endpoint: &str, sampling_ratio: f64) -> Result<SdkTracer> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::TraceIdRatioBased(sampling_ratio.clamp(0.0, 1.0)))
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer(SERVICE_NAME);
    global::set_tracer_provider(tracer_provider);

    Ok(tracer)
}
