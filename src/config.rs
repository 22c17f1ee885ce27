use std::{env, net::SocketAddr, num::NonZeroUsize, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::inference::{ChainRetryPolicy, LlmSettings, ProviderKind, ProviderSettings};
use crate::pipeline::{MAX_BATCH_SIZE, PipelineSettings};
use crate::util::retry::RetryConfig;

const DEFAULT_GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";
const DEFAULT_LMSTUDIO_BASE_URL: &str = "http://localhost:1234/v1";
const DEFAULT_LMSTUDIO_MODEL: &str = "qwen2.5-7b-instruct";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

/// 日次バッチの実行時刻と自動再試行。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSettings {
    pub enabled: bool,
    pub hour: u32,
    pub minute: u32,
    pub utc_offset_hours: i32,
    /// サイクル開始時に `failed` を `pending` に戻す。
    pub auto_retry_failed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    db_dsn: String,
    db_max_connections: u32,
    db_min_connections: u32,
    db_acquire_timeout: Duration,
    providers: Vec<ProviderSettings>,
    llm: LlmSettings,
    pipeline: PipelineSettings,
    retry: ChainRetryPolicy,
    vocabulary_path: Option<PathBuf>,
    schedule: ScheduleSettings,
    otel_exporter_endpoint: Option<String>,
    otel_sampling_ratio: f64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// 環境変数から Enrich Worker の設定値を読み込み、検証する。
    ///
    /// # Errors
    /// `ENRICH_DB_DSN` が未設定、もしくは各種値のパースに失敗した場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(true)
    }

    /// データベースを使わないドライラン用。`ENRICH_DB_DSN` は任意になる。
    ///
    /// # Errors
    /// 各種値のパースに失敗した場合は [`ConfigError`] を返す。
    pub fn from_env_offline() -> Result<Self, ConfigError> {
        Self::load(false)
    }

    fn load(require_database: bool) -> Result<Self, ConfigError> {
        let db_dsn = if require_database {
            env_var("ENRICH_DB_DSN")?
        } else {
            optional_var("ENRICH_DB_DSN").unwrap_or_default()
        };
        let http_bind = parse_socket_addr("ENRICH_HTTP_BIND", "0.0.0.0:9010")?;

        // Connection pool
        let db_max_connections = parse_u32("ENRICH_DB_MAX_CONNECTIONS", 10)?;
        let db_min_connections = parse_u32("ENRICH_DB_MIN_CONNECTIONS", 1)?;
        if db_min_connections > db_max_connections {
            return Err(ConfigError::Invalid {
                name: "ENRICH_DB_MIN_CONNECTIONS",
                source: anyhow::anyhow!("must not exceed ENRICH_DB_MAX_CONNECTIONS"),
            });
        }
        let db_acquire_timeout = parse_duration_secs("ENRICH_DB_ACQUIRE_TIMEOUT_SECS", 10)?;

        let providers = parse_providers()?;

        let llm = LlmSettings {
            temperature: parse_f32("ENRICH_LLM_TEMPERATURE", 0.2)?,
            max_tokens: parse_u32("ENRICH_LLM_MAX_TOKENS", 1024)?,
            timeout: parse_duration_ms("ENRICH_LLM_TIMEOUT_MS", 60_000)?,
        };

        // Batch processing
        let batch_size = parse_non_zero_usize("ENRICH_BATCH_SIZE", MAX_BATCH_SIZE)?
            .get()
            .min(MAX_BATCH_SIZE);
        let pipeline = PipelineSettings {
            batch_size,
            inter_batch_delay: parse_duration_ms("ENRICH_INTER_BATCH_DELAY_MS", 500)?,
            batch_concurrency: parse_non_zero_usize("ENRICH_BATCH_CONCURRENCY", 1)?.get(),
            search_text_min_coverage: parse_bounded_u8("ENRICH_SEARCH_TEXT_MIN_COVERAGE", 1, 1, 2)?,
        };

        // Retry settings (exponential backoff + jitter)
        let retry = ChainRetryPolicy {
            rate_limit: RetryConfig::new(
                parse_non_zero_usize("ENRICH_RATE_LIMIT_MAX_ATTEMPTS", 5)?.get(),
                parse_u64("ENRICH_BACKOFF_BASE_MS", 500)?,
                parse_u64("ENRICH_BACKOFF_CAP_MS", 30_000)?,
            ),
            malformed_max_attempts: parse_non_zero_usize("ENRICH_MALFORMED_MAX_ATTEMPTS", 2)?
                .get(),
        };

        let vocabulary_path = optional_var("ENRICH_VOCABULARY_PATH").map(PathBuf::from);

        let schedule = ScheduleSettings {
            enabled: parse_bool("ENRICH_SCHEDULE_ENABLED", true)?,
            hour: parse_bounded_u32("ENRICH_SCHEDULE_HOUR", 3, 0, 23)?,
            minute: parse_bounded_u32("ENRICH_SCHEDULE_MINUTE", 0, 0, 59)?,
            utc_offset_hours: parse_utc_offset("ENRICH_SCHEDULE_UTC_OFFSET_HOURS", 0)?,
            auto_retry_failed: parse_bool("ENRICH_AUTO_RETRY_FAILED", true)?,
        };

        // OpenTelemetry settings
        let otel_exporter_endpoint = optional_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        let otel_sampling_ratio = parse_f64("OTEL_SAMPLING_RATIO", 1.0)?;

        Ok(Self {
            http_bind,
            db_dsn,
            db_max_connections,
            db_min_connections,
            db_acquire_timeout,
            providers,
            llm,
            pipeline,
            retry,
            vocabulary_path,
            schedule,
            otel_exporter_endpoint,
            otel_sampling_ratio,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn db_dsn(&self) -> &str {
        &self.db_dsn
    }

    #[must_use]
    pub fn db_max_connections(&self) -> u32 {
        self.db_max_connections
    }

    #[must_use]
    pub fn db_min_connections(&self) -> u32 {
        self.db_min_connections
    }

    #[must_use]
    pub fn db_acquire_timeout(&self) -> Duration {
        self.db_acquire_timeout
    }

    /// 優先順位順のプロバイダ設定。
    #[must_use]
    pub fn providers(&self) -> &[ProviderSettings] {
        &self.providers
    }

    #[must_use]
    pub fn llm(&self) -> LlmSettings {
        self.llm
    }

    #[must_use]
    pub fn pipeline(&self) -> PipelineSettings {
        self.pipeline
    }

    #[must_use]
    pub fn retry(&self) -> ChainRetryPolicy {
        self.retry
    }

    #[must_use]
    pub fn vocabulary_path(&self) -> Option<&std::path::Path> {
        self.vocabulary_path.as_deref()
    }

    #[must_use]
    pub fn schedule(&self) -> ScheduleSettings {
        self.schedule
    }

    #[must_use]
    pub fn otel_exporter_endpoint(&self) -> Option<&str> {
        self.otel_exporter_endpoint.as_deref()
    }

    #[must_use]
    pub fn otel_sampling_ratio(&self) -> f64 {
        self.otel_sampling_ratio
    }
}

/// `ENRICH_PROVIDERS` の順にプロバイダ設定を組み立てる。
///
/// `GROQ_FALLBACK_MODEL` があれば `groq` の直後に `groq-fallback` を差し込む。
fn parse_providers() -> Result<Vec<ProviderSettings>, ConfigError> {
    const NAME: &str = "ENRICH_PROVIDERS";
    let order = parse_csv(NAME, "groq,lmstudio");
    if order.is_empty() {
        return Err(ConfigError::Invalid {
            name: NAME,
            source: anyhow::anyhow!("at least one provider is required"),
        });
    }

    let mut providers: Vec<ProviderSettings> = Vec::with_capacity(order.len() + 1);
    for entry in &order {
        let kind: ProviderKind = entry.parse().map_err(|message: String| ConfigError::Invalid {
            name: NAME,
            source: anyhow::anyhow!(message),
        })?;
        if providers.iter().any(|existing| existing.kind == kind) {
            return Err(ConfigError::Invalid {
                name: NAME,
                source: anyhow::anyhow!("provider `{kind}` listed more than once"),
            });
        }
        match kind {
            ProviderKind::Groq => {
                let base_url = var_or("GROQ_BASE_URL", DEFAULT_GROQ_BASE_URL);
                let api_key = optional_var("GROQ_API_KEY");
                let interval_ms = parse_u64("GROQ_MIN_INTERVAL_MS", 2100)?;
                let min_interval = (interval_ms > 0).then(|| Duration::from_millis(interval_ms));
                providers.push(ProviderSettings {
                    kind,
                    name: kind.as_str().to_string(),
                    base_url: base_url.clone(),
                    model: var_or("GROQ_MODEL", DEFAULT_GROQ_MODEL),
                    api_key: api_key.clone(),
                    min_interval,
                });
                if let Some(model) = optional_var("GROQ_FALLBACK_MODEL") {
                    providers.push(ProviderSettings {
                        kind,
                        name: "groq-fallback".to_string(),
                        base_url,
                        model,
                        api_key,
                        min_interval,
                    });
                }
            }
            ProviderKind::LmStudio => providers.push(ProviderSettings {
                kind,
                name: kind.as_str().to_string(),
                base_url: var_or("LMSTUDIO_BASE_URL", DEFAULT_LMSTUDIO_BASE_URL),
                model: var_or("LMSTUDIO_MODEL", DEFAULT_LMSTUDIO_MODEL),
                api_key: None,
                min_interval: None,
            }),
            ProviderKind::OpenAi => providers.push(ProviderSettings {
                kind,
                name: kind.as_str().to_string(),
                base_url: var_or("OPENAI_BASE_URL", DEFAULT_OPENAI_BASE_URL),
                model: var_or("OPENAI_MODEL", DEFAULT_OPENAI_MODEL),
                api_key: optional_var("OPENAI_API_KEY"),
                min_interval: None,
            }),
        }
    }
    Ok(providers)
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

/// 空文字列は未設定として扱う。
fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn var_or(name: &str, default: &str) -> String {
    optional_var(name).unwrap_or_else(|| default.to_string())
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());

    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let parsed = parse_number::<usize>(name, default)?;
    NonZeroUsize::new(parsed).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    parse_u64(name, default_secs).map(Duration::from_secs)
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    parse_u64(name, default_ms).map(Duration::from_millis)
}

fn parse_number<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + ToString,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<T>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    parse_number(name, default)
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    parse_number(name, default)
}

fn parse_f32(name: &'static str, default: f32) -> Result<f32, ConfigError> {
    parse_number(name, default)
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    parse_number(name, default)
}

fn parse_bounded_u32(
    name: &'static str,
    default: u32,
    min: u32,
    max: u32,
) -> Result<u32, ConfigError> {
    let parsed = parse_u32(name, default)?;
    if !(min..=max).contains(&parsed) {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("value must be between {min} and {max}"),
        });
    }
    Ok(parsed)
}

fn parse_bounded_u8(name: &'static str, default: u8, min: u8, max: u8) -> Result<u8, ConfigError> {
    let parsed = parse_bounded_u32(name, u32::from(default), u32::from(min), u32::from(max))?;
    u8::try_from(parsed).map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_utc_offset(name: &'static str, default: i32) -> Result<i32, ConfigError> {
    let parsed = parse_number::<i32>(name, default)?;
    if !(-12..=14).contains(&parsed) {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("UTC offset must be between -12 and 14 hours"),
        });
    }
    Ok(parsed)
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}

fn parse_csv(name: &'static str, default: &str) -> Vec<String> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYS: &[&str] = &[
        "ENRICH_DB_DSN",
        "ENRICH_HTTP_BIND",
        "ENRICH_DB_MAX_CONNECTIONS",
        "ENRICH_DB_MIN_CONNECTIONS",
        "ENRICH_DB_ACQUIRE_TIMEOUT_SECS",
        "ENRICH_PROVIDERS",
        "GROQ_API_KEY",
        "GROQ_MODEL",
        "GROQ_BASE_URL",
        "GROQ_MIN_INTERVAL_MS",
        "GROQ_FALLBACK_MODEL",
        "LMSTUDIO_BASE_URL",
        "LMSTUDIO_MODEL",
        "OPENAI_API_KEY",
        "OPENAI_MODEL",
        "OPENAI_BASE_URL",
        "ENRICH_LLM_TEMPERATURE",
        "ENRICH_LLM_MAX_TOKENS",
        "ENRICH_LLM_TIMEOUT_MS",
        "ENRICH_BATCH_SIZE",
        "ENRICH_INTER_BATCH_DELAY_MS",
        "ENRICH_BATCH_CONCURRENCY",
        "ENRICH_RATE_LIMIT_MAX_ATTEMPTS",
        "ENRICH_MALFORMED_MAX_ATTEMPTS",
        "ENRICH_BACKOFF_BASE_MS",
        "ENRICH_BACKOFF_CAP_MS",
        "ENRICH_SEARCH_TEXT_MIN_COVERAGE",
        "ENRICH_VOCABULARY_PATH",
        "ENRICH_SCHEDULE_ENABLED",
        "ENRICH_SCHEDULE_HOUR",
        "ENRICH_SCHEDULE_MINUTE",
        "ENRICH_SCHEDULE_UTC_OFFSET_HOURS",
        "ENRICH_AUTO_RETRY_FAILED",
        "OTEL_EXPORTER_OTLP_ENDPOINT",
        "OTEL_SAMPLING_RATIO",
    ];

    /// 全キーを未設定にしたうえで `vars` だけを設定して `f` を実行する。
    fn with_env<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let mut all: Vec<(&str, Option<&str>)> = KEYS.iter().map(|key| (*key, None)).collect();
        for &(key, value) in vars {
            all.retain(|(existing, _)| *existing != key);
            all.push((key, Some(value)));
        }
        temp_env::with_vars(all, f)
    }

    #[test]
    fn from_env_uses_defaults_when_optional_missing() {
        let config = with_env(&[("ENRICH_DB_DSN", "postgres://enrich@localhost/enrich")], || {
            Config::from_env().expect("config loads")
        });

        assert_eq!(config.db_dsn(), "postgres://enrich@localhost/enrich");
        assert_eq!(config.http_bind(), "0.0.0.0:9010".parse().expect("addr"));
        assert_eq!(config.db_max_connections(), 10);
        assert_eq!(config.pipeline().batch_size, 100);
        assert_eq!(config.pipeline().batch_concurrency, 1);
        assert_eq!(config.pipeline().inter_batch_delay, Duration::from_millis(500));
        assert_eq!(config.pipeline().search_text_min_coverage, 1);
        assert_eq!(config.retry().rate_limit.max_attempts, 5);
        assert_eq!(config.retry().malformed_max_attempts, 2);
        assert!(config.vocabulary_path().is_none());
        assert!(config.schedule().enabled);
        assert!(config.schedule().auto_retry_failed);
        assert!(config.otel_exporter_endpoint().is_none());

        let names: Vec<&str> = config.providers().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["groq", "lmstudio"]);
        assert_eq!(
            config.providers()[0].min_interval,
            Some(Duration::from_millis(2100))
        );
    }

    #[test]
    fn from_env_overrides_values() {
        let config = with_env(
            &[
                ("ENRICH_DB_DSN", "postgres://db/enrich"),
                ("ENRICH_HTTP_BIND", "127.0.0.1:7000"),
                ("ENRICH_PROVIDERS", "lmstudio, openai"),
                ("OPENAI_API_KEY", "sk-test"),
                ("LMSTUDIO_MODEL", "mistral-7b"),
                ("ENRICH_BATCH_CONCURRENCY", "4"),
                ("ENRICH_INTER_BATCH_DELAY_MS", "0"),
                ("ENRICH_SEARCH_TEXT_MIN_COVERAGE", "2"),
                ("ENRICH_SCHEDULE_UTC_OFFSET_HOURS", "9"),
                ("ENRICH_AUTO_RETRY_FAILED", "off"),
                ("ENRICH_VOCABULARY_PATH", "/etc/enrich/vocabulary.yaml"),
            ],
            || Config::from_env().expect("config loads"),
        );

        assert_eq!(config.http_bind().port(), 7000);
        let names: Vec<&str> = config.providers().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["lmstudio", "openai"]);
        assert_eq!(config.providers()[0].model, "mistral-7b");
        assert_eq!(config.providers()[1].api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.pipeline().batch_concurrency, 4);
        assert_eq!(config.pipeline().inter_batch_delay, Duration::ZERO);
        assert_eq!(config.pipeline().search_text_min_coverage, 2);
        assert_eq!(config.schedule().utc_offset_hours, 9);
        assert!(!config.schedule().auto_retry_failed);
        assert_eq!(
            config.vocabulary_path(),
            Some(std::path::Path::new("/etc/enrich/vocabulary.yaml"))
        );
    }

    #[test]
    fn batch_size_is_capped() {
        let config = with_env(
            &[("ENRICH_DB_DSN", "postgres://db"), ("ENRICH_BATCH_SIZE", "500")],
            || Config::from_env().expect("config loads"),
        );
        assert_eq!(config.pipeline().batch_size, MAX_BATCH_SIZE);
    }

    #[test]
    fn groq_fallback_model_adds_second_entry() {
        let config = with_env(
            &[
                ("ENRICH_DB_DSN", "postgres://db"),
                ("ENRICH_PROVIDERS", "groq,lmstudio"),
                ("GROQ_API_KEY", "gsk-test"),
                ("GROQ_FALLBACK_MODEL", "llama-3.1-8b-instant"),
                ("GROQ_MIN_INTERVAL_MS", "0"),
            ],
            || Config::from_env().expect("config loads"),
        );
        let names: Vec<&str> = config.providers().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["groq", "groq-fallback", "lmstudio"]);
        assert_eq!(config.providers()[1].model, "llama-3.1-8b-instant");
        assert_eq!(config.providers()[1].api_key.as_deref(), Some("gsk-test"));
        assert_eq!(config.providers()[0].min_interval, None);
    }

    #[test]
    fn from_env_errors_when_required_missing() {
        let error = with_env(&[], || Config::from_env().expect_err("dsn is required"));
        assert!(matches!(error, ConfigError::Missing("ENRICH_DB_DSN")));
    }

    #[test]
    fn offline_load_does_not_need_a_dsn() {
        let config = with_env(&[("ENRICH_PROVIDERS", "lmstudio")], || {
            Config::from_env_offline().expect("offline config loads")
        });
        assert_eq!(config.db_dsn(), "");
        assert_eq!(config.providers().len(), 1);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let error = with_env(
            &[("ENRICH_DB_DSN", "postgres://db"), ("ENRICH_PROVIDERS", "groq,ollama")],
            || Config::from_env().expect_err("unknown provider"),
        );
        assert!(matches!(
            error,
            ConfigError::Invalid {
                name: "ENRICH_PROVIDERS",
                ..
            }
        ));
    }

    #[test]
    fn coverage_outside_range_is_rejected() {
        let error = with_env(
            &[
                ("ENRICH_DB_DSN", "postgres://db"),
                ("ENRICH_SEARCH_TEXT_MIN_COVERAGE", "3"),
            ],
            || Config::from_env().expect_err("coverage out of range"),
        );
        assert!(matches!(
            error,
            ConfigError::Invalid {
                name: "ENRICH_SEARCH_TEXT_MIN_COVERAGE",
                ..
            }
        ));
    }

    #[test]
    fn invalid_boolean_is_rejected() {
        let error = with_env(
            &[("ENRICH_DB_DSN", "postgres://db"), ("ENRICH_SCHEDULE_ENABLED", "maybe")],
            || Config::from_env().expect_err("bool"),
        );
        assert!(matches!(
            error,
            ConfigError::Invalid {
                name: "ENRICH_SCHEDULE_ENABLED",
                ..
            }
        ));
    }
}
