//! メタデータ補完パイプライン。
//!
//! ステージは依存表の位相順に実行する。各ステージでは `pending` のレコードを ID 順に
//! ページングし、ゲート → 短絡の即時コミット → バッチ推論 → バッチ単位のコミット を繰り返す。

pub(crate) mod batch;
pub(crate) mod cache;
pub mod dependency;
pub(crate) mod gate;
pub(crate) mod prompt;
pub mod rules;
pub(crate) mod search_text;
pub mod vocabulary;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::domain::{Domain, ResetScope};
use crate::inference::{ProviderChain, ProviderSession};
use crate::observability::metrics::Metrics;
use crate::store::dao::EnrichmentDao;
use crate::store::models::{BatchCommit, DomainOutcome, StatusSummary};

pub use batch::ProvidersExhausted;
pub use dependency::{DependencyError, STAGE_DEPENDENCIES, StageDependency, StagePlan};
pub use rules::PatternRules;
pub use vocabulary::Vocabulary;

use batch::{BatchProcessor, WorkItem, group_items};
use cache::MappingCache;
use gate::{StageGate, ShortCircuit};
use search_text::{QualityChecker, SearchTextSynthesizer};

/// 1 バッチに載せる項目数の上限。
pub const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub inter_batch_delay: Duration,
    /// 同時に実行するバッチ数。1 なら逐次実行。
    pub batch_concurrency: usize,
    /// 検索テキスト生成に必要なカバレッジ（1 か 2）。
    pub search_text_min_coverage: u8,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_SIZE,
            inter_batch_delay: Duration::from_millis(500),
            batch_concurrency: 1,
            search_text_min_coverage: 1,
        }
    }
}

/// 実行要求。`domain` 省略時は全ステージを順に実行する。
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub domain: Option<Domain>,
    /// ドメインごとに処理するレコード数の上限。
    #[serde(default)]
    pub limit: Option<usize>,
    /// 指定したプロバイダだけを使う。
    #[serde(default)]
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub normalized: u64,
    pub not_applicable: u64,
    pub failed: u64,
    /// 上記のうち推論を経ずに決着した件数。
    pub short_circuited: u64,
    pub batches: u64,
}

impl OutcomeCounts {
    fn record(&mut self, outcome: &DomainOutcome) {
        match outcome {
            DomainOutcome::Normalized { .. } => self.normalized += 1,
            DomainOutcome::NotApplicable => self.not_applicable += 1,
            DomainOutcome::Failed { .. } => self.failed += 1,
        }
    }

    fn merge(&mut self, other: &OutcomeCounts) {
        self.normalized += other.normalized;
        self.not_applicable += other.not_applicable;
        self.failed += other.failed;
        self.short_circuited += other.short_circuited;
        self.batches += other.batches;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// 全プロバイダが枯渇した。未処理のレコードは `pending` のまま。
    Exhausted,
    /// オペレーターが中断した。コミット済みのバッチはそのまま残る。
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub domains: BTreeMap<Domain, OutcomeCounts>,
    pub exhausted_providers: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    fn start() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            status: RunStatus::Completed,
            domains: BTreeMap::new(),
            exhausted_providers: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    #[must_use]
    pub fn counts(&self, domain: Domain) -> OutcomeCounts {
        self.domains.get(&domain).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn totals(&self) -> OutcomeCounts {
        let mut totals = OutcomeCounts::default();
        for counts in self.domains.values() {
            totals.merge(counts);
        }
        totals
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// 実行レベルの唯一の失敗。ここまでの集計を添えて返す。
    #[error("all inference providers exhausted")]
    ProvidersExhausted { summary: Box<RunSummary> },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("another enrichment run is already in progress")]
    Busy,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

enum StageEnd {
    Drained,
    Exhausted,
    Aborted,
}

/// 実行中フラグと中断トークンを、実行終了時に必ず片付ける。
struct ActiveRun<'a> {
    slot: &'a Mutex<Option<CancellationToken>>,
    metrics: &'a Metrics,
}

impl<'a> ActiveRun<'a> {
    fn begin(
        slot: &'a Mutex<Option<CancellationToken>>,
        metrics: &'a Metrics,
    ) -> (Self, CancellationToken) {
        let token = CancellationToken::new();
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        metrics.active_runs.inc();
        (Self { slot, metrics }, token)
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.metrics.active_runs.dec();
    }
}

pub struct PipelineDriver {
    dao: Arc<dyn EnrichmentDao>,
    chain: ProviderChain,
    vocabulary: Arc<Vocabulary>,
    plan: StagePlan,
    quality: QualityChecker,
    settings: PipelineSettings,
    metrics: Arc<Metrics>,
    run_lock: tokio::sync::Mutex<()>,
    active: Mutex<Option<CancellationToken>>,
}

impl PipelineDriver {
    /// # Errors
    /// 依存表が DAG でない場合や、品質チェック用の照合器が構築できない場合。
    pub fn new(
        dao: Arc<dyn EnrichmentDao>,
        chain: ProviderChain,
        vocabulary: Arc<Vocabulary>,
        settings: PipelineSettings,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        Ok(Self {
            dao,
            chain,
            vocabulary,
            plan: StagePlan::standard()?,
            quality: QualityChecker::new()?,
            settings,
            metrics,
            run_lock: tokio::sync::Mutex::new(()),
            active: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn dao(&self) -> &Arc<dyn EnrichmentDao> {
        &self.dao
    }

    #[must_use]
    pub fn provider_names(&self) -> Vec<&str> {
        self.chain.provider_names()
    }

    #[must_use]
    pub fn plan(&self) -> &StagePlan {
        &self.plan
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// 実行中のランに中断を要求する。次のバッチ境界で停止する。
    pub fn abort(&self) -> bool {
        match self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// オペレーターによるリセット。対象ドメイン以外には触れない。
    ///
    /// 実行中のランのカーソルより手前を `pending` に戻さないよう、ランと排他にする。
    ///
    /// # Errors
    /// - [`PipelineError::Busy`]: ランが実行中
    /// - [`PipelineError::Configuration`]: 推論対象でないドメイン
    /// - [`PipelineError::Store`]: ストアの更新に失敗した場合
    pub async fn reset(&self, domain: Domain, scope: ResetScope) -> Result<u64, PipelineError> {
        if !domain.is_inferred() {
            return Err(PipelineError::Configuration(format!(
                "{domain} is set by the indexer and cannot be reset"
            )));
        }
        let _lock = self.run_lock.try_lock().map_err(|_| PipelineError::Busy)?;
        let reset = self.dao.reset_domain(domain, scope).await?;
        info!(domain = %domain, scope = ?scope, reset, "domain reset to pending");
        Ok(reset)
    }

    /// ドメインのマッピングキャッシュを破棄する。レコードの状態は変えない。
    ///
    /// # Errors
    /// ランが実行中なら [`PipelineError::Busy`]、ストアの更新に失敗した場合は
    /// [`PipelineError::Store`]。
    pub async fn clear_mappings(&self, domain: Domain) -> Result<u64, PipelineError> {
        let _lock = self.run_lock.try_lock().map_err(|_| PipelineError::Busy)?;
        let cleared = self.dao.clear_mappings(domain).await?;
        info!(domain = %domain, cleared, "mapping cache cleared");
        Ok(cleared)
    }

    /// # Errors
    /// ストアの読み出しに失敗した場合。
    pub async fn stats(&self) -> Result<StatusSummary, PipelineError> {
        Ok(self.dao.status_summary().await?)
    }

    /// 1 ドメインまたは全ステージを実行する。
    ///
    /// レコード単位の失敗は集計に含めるだけで、エラーにはならない。
    ///
    /// # Errors
    /// - [`PipelineError::Busy`]: 別のランが実行中
    /// - [`PipelineError::Configuration`]: 未知のプロバイダ、推論対象でないドメイン
    /// - [`PipelineError::ProvidersExhausted`]: 全プロバイダ枯渇
    /// - [`PipelineError::Store`]: 永続化の失敗
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary, PipelineError> {
        let _lock = self.run_lock.try_lock().map_err(|_| PipelineError::Busy)?;
        self.run_locked(request).await
    }

    /// スケジューラからの定期実行。`failed` を自動で `pending` に戻してから全ステージを実行する。
    ///
    /// # Errors
    /// [`PipelineDriver::run`] と同じ。
    pub async fn run_scheduled(&self, retry_failed: bool) -> Result<RunSummary, PipelineError> {
        let _lock = self.run_lock.try_lock().map_err(|_| PipelineError::Busy)?;
        if retry_failed {
            for domain in Domain::inferred() {
                let reset = self.dao.reset_domain(domain, ResetScope::Failed).await?;
                if reset > 0 {
                    info!(domain = %domain, reset, "retrying failed records");
                }
            }
        }
        self.run_locked(RunRequest::default()).await
    }

    async fn run_locked(&self, request: RunRequest) -> Result<RunSummary, PipelineError> {
        let chain = match request.provider.as_deref() {
            Some(name) => self
                .chain
                .restricted_to(name)
                .ok_or_else(|| PipelineError::Configuration(format!("unknown provider: {name}")))?,
            None => self.chain.clone(),
        };
        if chain.is_empty() {
            return Err(PipelineError::Configuration(
                "no inference providers configured".to_string(),
            ));
        }
        let domains: Vec<Domain> = match request.domain {
            Some(domain) if !domain.is_inferred() => {
                return Err(PipelineError::Configuration(format!(
                    "{domain} is set by the indexer and cannot be run"
                )));
            }
            Some(domain) => vec![domain],
            None => self
                .plan
                .order()
                .iter()
                .copied()
                .filter(|domain| domain.is_inferred())
                .collect(),
        };
        let limit = request.limit.unwrap_or(usize::MAX);

        let (_active, token) = ActiveRun::begin(&self.active, &self.metrics);
        let session = chain.session();
        let mut summary = RunSummary::start();
        self.metrics.runs_started.inc();
        info!(
            run_id = %summary.run_id,
            domains = ?domains,
            providers = ?chain.provider_names(),
            limit = request.limit,
            "enrichment run started"
        );

        let run_id = summary.run_id;
        for domain in domains {
            let span = info_span!("stage", run_id = %run_id, domain = %domain);
            let counts = summary.domains.entry(domain).or_default();
            let end = self
                .run_stage(domain, limit, &session, &token, counts)
                .instrument(span)
                .await?;
            match end {
                StageEnd::Drained => {}
                StageEnd::Exhausted => {
                    summary.status = RunStatus::Exhausted;
                    break;
                }
                StageEnd::Aborted => {
                    summary.status = RunStatus::Aborted;
                    break;
                }
            }
        }

        summary.finished_at = Utc::now();
        summary.exhausted_providers = session.exhausted_providers();
        let totals = summary.totals();
        info!(
            run_id = %summary.run_id,
            status = ?summary.status,
            normalized = totals.normalized,
            not_applicable = totals.not_applicable,
            failed = totals.failed,
            short_circuited = totals.short_circuited,
            "enrichment run finished"
        );

        match summary.status {
            RunStatus::Completed => {
                self.metrics.runs_completed.inc();
                Ok(summary)
            }
            RunStatus::Aborted => {
                self.metrics.runs_aborted.inc();
                Ok(summary)
            }
            RunStatus::Exhausted => {
                self.metrics.runs_exhausted.inc();
                Err(PipelineError::ProvidersExhausted {
                    summary: Box::new(summary),
                })
            }
        }
    }

    async fn run_stage(
        &self,
        domain: Domain,
        limit: usize,
        session: &ProviderSession,
        token: &CancellationToken,
        counts: &mut OutcomeCounts,
    ) -> Result<StageEnd, PipelineError> {
        let cache = if domain.is_cacheable() {
            let cache = MappingCache::load(domain, self.dao.as_ref()).await?;
            debug!(domain = %domain, entries = cache.len(), "mapping cache loaded");
            Some(cache)
        } else {
            None
        };
        let gate = StageGate::new(
            &self.plan,
            &self.vocabulary,
            self.settings.search_text_min_coverage,
        );
        let batch_size = if domain == Domain::SearchText {
            1
        } else {
            self.settings.batch_size.clamp(1, MAX_BATCH_SIZE)
        };
        let concurrency = self.settings.batch_concurrency.max(1);

        let mut after_id = 0_i64;
        let mut admitted = 0_usize;
        let mut dispatched_any = false;

        while admitted < limit {
            if token.is_cancelled() {
                return Ok(StageEnd::Aborted);
            }
            let page = self
                .dao
                .pending_records(domain, after_id, batch_size * concurrency)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;

            let outcome = gate.evaluate(domain, page, cache.as_ref(), limit - admitted);
            admitted += outcome.admitted();
            self.commit_short_circuits(domain, outcome.short_circuits, cache.as_ref(), counts)
                .await?;
            if outcome.forward.is_empty() {
                continue;
            }

            let items = group_items(domain, outcome.forward);
            let batches: Vec<&[WorkItem]> = items.chunks(batch_size).collect();
            for wave in batches.chunks(concurrency) {
                if dispatched_any {
                    tokio::select! {
                        () = token.cancelled() => return Ok(StageEnd::Aborted),
                        () = sleep(self.settings.inter_batch_delay) => {}
                    }
                }
                dispatched_any = true;

                // 中断時は処理中のバッチを破棄し、何もコミットしない
                let results = tokio::select! {
                    () = token.cancelled() => return Ok(StageEnd::Aborted),
                    results = join_all(
                        wave.iter().map(|items| self.process_batch(domain, items, session)),
                    ) => results,
                };

                let mut exhausted = false;
                for result in results {
                    match result {
                        Ok(commit) => {
                            counts.batches += 1;
                            self.commit(domain, &commit, cache.as_ref(), counts).await?;
                        }
                        Err(error) => {
                            warn!(domain = %domain, error = %error, "batch left pending");
                            exhausted = true;
                        }
                    }
                }
                if exhausted {
                    return Ok(StageEnd::Exhausted);
                }
            }
        }

        info!(
            domain = %domain,
            normalized = counts.normalized,
            not_applicable = counts.not_applicable,
            failed = counts.failed,
            short_circuited = counts.short_circuited,
            "stage drained"
        );
        Ok(StageEnd::Drained)
    }

    async fn process_batch(
        &self,
        domain: Domain,
        items: &[WorkItem],
        session: &ProviderSession,
    ) -> Result<BatchCommit, ProvidersExhausted> {
        let _timer = self
            .metrics
            .batch_duration
            .with_label_values(&[domain.as_str()])
            .start_timer();
        if domain != Domain::SearchText {
            return BatchProcessor::new(&self.vocabulary)
                .process(domain, items, session)
                .await;
        }

        let synthesizer = SearchTextSynthesizer::new(&self.vocabulary, &self.quality);
        let mut commit = BatchCommit::default();
        for record in items.iter().flat_map(|item| &item.records) {
            let generated = synthesizer.synthesize(record, session).await?;
            commit.transitions.extend(generated.transitions);
        }
        Ok(commit)
    }

    /// 短絡した決着はバッチ呼び出しより先に書き込む。
    async fn commit_short_circuits(
        &self,
        domain: Domain,
        short_circuits: Vec<ShortCircuit>,
        cache: Option<&MappingCache>,
        counts: &mut OutcomeCounts,
    ) -> Result<()> {
        if short_circuits.is_empty() {
            return Ok(());
        }
        let mut commit = BatchCommit::default();
        for short_circuit in short_circuits {
            self.metrics
                .short_circuits
                .with_label_values(&[domain.as_str(), short_circuit.kind.as_str()])
                .inc();
            counts.short_circuited += 1;
            commit.transitions.push(short_circuit.transition);
            commit.mappings.extend(short_circuit.mapping);
        }
        self.commit(domain, &commit, cache, counts).await
    }

    async fn commit(
        &self,
        domain: Domain,
        commit: &BatchCommit,
        cache: Option<&MappingCache>,
        counts: &mut OutcomeCounts,
    ) -> Result<()> {
        if commit.is_empty() {
            return Ok(());
        }
        let applied = self.dao.apply_batch(commit).await?;
        let expected = u64::try_from(commit.transitions.len()).unwrap_or(u64::MAX);
        if applied < expected {
            warn!(
                domain = %domain,
                applied,
                expected,
                "some records were no longer pending and kept their status"
            );
        }
        if let Some(cache) = cache {
            cache.absorb(&commit.mappings);
        }
        for transition in &commit.transitions {
            counts.record(&transition.outcome);
            self.metrics
                .outcomes
                .with_label_values(&[domain.as_str(), transition.outcome.status().as_str()])
                .inc();
        }
        Ok(())
    }
}
