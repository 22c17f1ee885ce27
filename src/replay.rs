//! Offline replay helper: load a JSON-lines catalog dataset and run the enrichment
//! pipeline over it, against PostgreSQL or entirely in memory.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::app::build_chain;
use crate::config::Config;
use crate::inference::ProviderChain;
use crate::observability::Telemetry;
use crate::pipeline::{PipelineDriver, PipelineError, PipelineSettings, RunRequest, RunSummary, Vocabulary};
use crate::store::models::{NewCatalogRecord, StatusSummary};
use crate::store::{EnrichmentDao, ImportOutcome, MemoryEnrichmentDao, PgEnrichmentDao};

/// Configuration required by the offline replay helper.
#[derive(Debug, Clone, Default)]
pub struct ReplayConfig {
    pub dataset: PathBuf,
    /// Keep every write in memory instead of PostgreSQL.
    pub dry_run: bool,
    pub request: RunRequest,
}

/// Outcome of a replay, printed as JSON by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub dataset: PathBuf,
    pub dry_run: bool,
    pub imported: ImportOutcome,
    pub summary: RunSummary,
    pub providers_exhausted: bool,
    pub status: StatusSummary,
}

/// Read a JSON-lines dataset. Blank lines are skipped.
///
/// # Errors
/// Returns an error naming the line when a row cannot be parsed.
pub fn load_dataset(path: &Path) -> Result<Vec<NewCatalogRecord>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open dataset at {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.context("failed to read dataset line")?;
        if line.trim().is_empty() {
            continue;
        }
        let record: NewCatalogRecord = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse JSON on line {}", idx + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Replay a dataset using providers and settings from the environment.
///
/// # Errors
/// Fails on dataset, configuration, or store errors. Provider exhaustion is reported in
/// the returned [`ReplayReport`] instead.
pub async fn replay_enrichment(config: &ReplayConfig, app: &Config) -> Result<ReplayReport> {
    let telemetry = Telemetry::detached()?;
    let chain = build_chain(app, &telemetry)?;
    let vocabulary = match app.vocabulary_path() {
        Some(path) => Vocabulary::load(path)?,
        None => Vocabulary::builtin()?,
    };

    let dao: Arc<dyn EnrichmentDao> = if config.dry_run {
        Arc::new(MemoryEnrichmentDao::new())
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(app.db_dsn())
            .context("failed to configure postgres pool")?;
        let dao = PgEnrichmentDao::new(pool);
        dao.migrate().await?;
        Arc::new(dao)
    };

    replay_with(
        config,
        ReplayParts {
            dao,
            chain,
            vocabulary,
            settings: app.pipeline(),
            telemetry,
        },
    )
    .await
}

/// Everything a replay needs besides the dataset.
pub struct ReplayParts {
    pub dao: Arc<dyn EnrichmentDao>,
    pub chain: ProviderChain,
    pub vocabulary: Vocabulary,
    pub settings: PipelineSettings,
    pub telemetry: Telemetry,
}

/// Import the dataset into `parts.dao`, run the pipeline once and collect the report.
///
/// # Errors
/// Fails on dataset or store errors and on invalid run requests.
pub async fn replay_with(config: &ReplayConfig, parts: ReplayParts) -> Result<ReplayReport> {
    let records = load_dataset(&config.dataset)?;
    let imported = parts
        .dao
        .import_records(&records)
        .await
        .context("failed to import dataset")?;
    info!(
        inserted = imported.inserted,
        skipped = imported.skipped,
        "replay dataset imported"
    );

    let driver = PipelineDriver::new(
        Arc::clone(&parts.dao),
        parts.chain,
        Arc::new(parts.vocabulary),
        parts.settings,
        parts.telemetry.metrics_arc(),
    )?;

    let (summary, providers_exhausted) = match driver.run(config.request.clone()).await {
        Ok(summary) => (summary, false),
        Err(PipelineError::ProvidersExhausted { summary }) => (*summary, true),
        Err(error) => return Err(anyhow::Error::new(error).context("replay run failed")),
    };
    let status = driver.stats().await?;

    Ok(ReplayReport {
        dataset: config.dataset.clone(),
        dry_run: config.dry_run,
        imported,
        summary,
        providers_exhausted,
        status,
    })
}
