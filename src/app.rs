use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::{
    api,
    config::Config,
    inference::{InferenceProvider, ProviderChain},
    observability::Telemetry,
    pipeline::{PipelineDriver, Vocabulary},
    store::{EnrichmentDao, PgEnrichmentDao},
};

#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

pub struct ComponentRegistry {
    telemetry: Telemetry,
    driver: Arc<PipelineDriver>,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn driver(&self) -> &PipelineDriver {
        &self.registry.driver
    }

    pub(crate) fn dao(&self) -> &Arc<dyn EnrichmentDao> {
        self.registry.driver.dao()
    }
}

impl ComponentRegistry {
    /// 構成情報と依存をまとめて初期化し、アプリケーションの共有レジストリを構築する。
    ///
    /// Telemetry の初期化、接続プールの構成、マイグレーション、プロバイダチェーンと
    /// 語彙の読み込みをこの順で行う。
    ///
    /// # Errors
    /// Telemetry の初期化、マイグレーション、語彙ファイルの読み込みが失敗した場合。
    pub async fn build(config: &Config) -> Result<Self> {
        let telemetry = Telemetry::new(
            config.otel_exporter_endpoint(),
            config.otel_sampling_ratio(),
        )?;
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections())
            .min_connections(config.db_min_connections())
            .acquire_timeout(config.db_acquire_timeout())
            .test_before_acquire(true)
            .connect_lazy(config.db_dsn())
            .context("failed to configure enrichment database pool")?;
        let dao = PgEnrichmentDao::new(pool);
        dao.migrate()
            .await
            .context("failed to run enrichment database migrations")?;

        let vocabulary = match config.vocabulary_path() {
            Some(path) => Vocabulary::load(path)?,
            None => Vocabulary::builtin()?,
        };
        info!(
            genres = vocabulary.genre_count(),
            custom = config.vocabulary_path().is_some(),
            "controlled vocabulary loaded"
        );

        let chain = build_chain(config, &telemetry)?;
        let driver = PipelineDriver::new(
            Arc::new(dao),
            chain,
            Arc::new(vocabulary),
            config.pipeline(),
            telemetry.metrics_arc(),
        )?;

        Ok(Self::from_parts(telemetry, Arc::new(driver)))
    }

    /// 組み立て済みの部品からレジストリを作る。テストとリプレイで使う。
    #[must_use]
    pub fn from_parts(telemetry: Telemetry, driver: Arc<PipelineDriver>) -> Self {
        Self { telemetry, driver }
    }

    #[must_use]
    pub fn driver(&self) -> Arc<PipelineDriver> {
        Arc::clone(&self.driver)
    }

    #[must_use]
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }
}

/// 設定順にプロバイダを構築する。
///
/// # Errors
/// いずれかのプロバイダに必須の資格情報やモデルが無い場合。レコードに触れる前に起動を止める。
pub fn build_chain(config: &Config, telemetry: &Telemetry) -> Result<ProviderChain> {
    let llm = config.llm();
    let mut providers = Vec::with_capacity(config.providers().len());
    for settings in config.providers() {
        let provider = InferenceProvider::from_settings(settings, &llm)
            .with_context(|| format!("failed to configure provider {}", settings.name))?;
        info!(
            provider = %settings.name,
            model = %settings.model,
            base_url = %settings.base_url,
            "inference provider configured"
        );
        providers.push(Arc::new(provider));
    }
    Ok(ProviderChain::new(
        providers,
        config.retry(),
        telemetry.metrics_arc(),
    ))
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_config(vars: Vec<(&str, Option<&str>)>) -> Config {
        let mut all = vec![
            ("ENRICH_DB_DSN", Some("postgres://enrich@localhost/enrich")),
            ("GROQ_API_KEY", None),
            ("GROQ_FALLBACK_MODEL", None),
            ("OPENAI_API_KEY", None),
        ];
        all.retain(|(key, _)| vars.iter().all(|(override_key, _)| override_key != key));
        all.extend(vars);
        temp_env::with_vars(all, || Config::from_env().expect("config loads"))
    }

    #[test]
    fn chain_follows_configured_order() {
        let config = load_config(vec![
            ("ENRICH_PROVIDERS", Some("lmstudio,groq")),
            ("GROQ_API_KEY", Some("gsk-test")),
        ]);
        let telemetry = Telemetry::detached().expect("telemetry");
        let chain = build_chain(&config, &telemetry).expect("chain builds");
        assert_eq!(chain.provider_names(), vec!["lmstudio", "groq"]);
    }

    #[test]
    fn missing_credentials_fail_construction() {
        let config = load_config(vec![("ENRICH_PROVIDERS", Some("groq,lmstudio"))]);
        let telemetry = Telemetry::detached().expect("telemetry");
        let error = build_chain(&config, &telemetry).expect_err("groq needs a key");
        assert!(format!("{error:#}").contains("groq"));
    }
}
