//! 単一ロックのインメモリ実装。リプレイのドライランとテストで使う。

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use super::dao::{EnrichmentDao, ImportOutcome};
use super::models::{
    BatchCommit, CatalogRecord, DomainState, NewCatalogRecord, NormalizationMapping,
    SearchDocument, StatusCounts, StatusSummary,
};
use crate::domain::{Domain, DomainStatus, ResetScope};

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<i64, CatalogRecord>,
    mappings: BTreeMap<(Domain, String), NormalizationMapping>,
}

#[derive(Debug, Default)]
pub struct MemoryEnrichmentDao {
    state: Mutex<MemoryState>,
}

impl MemoryEnrichmentDao {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 全レコードのスナップショット（ID 昇順）。
    #[must_use]
    pub fn records(&self) -> Vec<CatalogRecord> {
        self.lock().records.values().cloned().collect()
    }

    #[must_use]
    pub fn mapping(&self, domain: Domain, raw_value: &str) -> Option<NormalizationMapping> {
        self.lock()
            .mappings
            .get(&(domain, raw_value.to_string()))
            .cloned()
    }

    /// 既存の状態を持つレコードを直接差し込む（テスト用の前提条件づくり）。
    pub fn insert_record(&self, record: CatalogRecord) {
        self.lock().records.insert(record.id, record);
    }

    pub fn insert_mapping(&self, mapping: NormalizationMapping) {
        let mut state = self.lock();
        upsert_mapping(&mut state.mappings, mapping);
    }
}

fn upsert_mapping(
    mappings: &mut BTreeMap<(Domain, String), NormalizationMapping>,
    mapping: NormalizationMapping,
) {
    let key = (mapping.domain, mapping.raw_value.clone());
    match mappings.get(&key) {
        Some(existing) if existing.verified && !mapping.verified => {}
        _ => {
            mappings.insert(key, mapping);
        }
    }
}

#[async_trait]
impl EnrichmentDao for MemoryEnrichmentDao {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn import_records(&self, records: &[NewCatalogRecord]) -> Result<ImportOutcome> {
        let mut state = self.lock();
        let mut outcome = ImportOutcome::default();
        for record in records {
            if state.records.contains_key(&record.id) {
                outcome.skipped += 1;
            } else {
                state
                    .records
                    .insert(record.id, CatalogRecord::from_new(record.clone()));
                outcome.inserted += 1;
            }
        }
        Ok(outcome)
    }

    async fn get_record(&self, id: i64) -> Result<Option<CatalogRecord>> {
        Ok(self.lock().records.get(&id).cloned())
    }

    async fn pending_records(
        &self,
        domain: Domain,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<CatalogRecord>> {
        let state = self.lock();
        Ok(state
            .records
            .range(after_id.saturating_add(1)..)
            .map(|(_, record)| record)
            .filter(|record| record.status(domain) == DomainStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn load_mappings(&self, domain: Domain) -> Result<Vec<NormalizationMapping>> {
        Ok(self
            .lock()
            .mappings
            .values()
            .filter(|mapping| mapping.domain == domain)
            .cloned()
            .collect())
    }

    async fn apply_batch(&self, commit: &BatchCommit) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.lock();
        let mut applied = 0;
        for transition in &commit.transitions {
            let Some(record) = state.records.get_mut(&transition.record_id) else {
                continue;
            };
            let domain_state = record.domains.entry(transition.domain).or_default();
            if transition.apply_to(domain_state, now) {
                applied += 1;
                if transition.invalidates_index() {
                    record
                        .domains
                        .entry(Domain::IndexStatus)
                        .or_default()
                        .reset(now);
                }
            }
        }
        for mapping in &commit.mappings {
            upsert_mapping(&mut state.mappings, mapping.clone());
        }
        Ok(applied)
    }

    async fn reset_domain(&self, domain: Domain, scope: ResetScope) -> Result<u64> {
        let now = Utc::now();
        let statuses = scope.statuses();
        let mut state = self.lock();
        let mut reset = 0;
        for record in state.records.values_mut() {
            let domain_state = record.domains.entry(domain).or_default();
            if statuses.contains(&domain_state.status) {
                domain_state.reset(now);
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn status_summary(&self) -> Result<StatusSummary> {
        let state = self.lock();
        let mut summary: StatusSummary = Domain::ALL
            .into_iter()
            .map(|domain| (domain, StatusCounts::default()))
            .collect();
        for record in state.records.values() {
            for domain in Domain::ALL {
                if let Some(counts) = summary.get_mut(&domain) {
                    counts.add(record.status(domain), 1);
                }
            }
        }
        Ok(summary)
    }

    async fn clear_mappings(&self, domain: Domain) -> Result<u64> {
        let mut state = self.lock();
        let before = state.mappings.len();
        state.mappings.retain(|(mapped, _), _| *mapped != domain);
        Ok(u64::try_from(before - state.mappings.len()).unwrap_or(u64::MAX))
    }

    async fn search_documents(
        &self,
        after_id: i64,
        limit: usize,
        unindexed_only: bool,
    ) -> Result<Vec<SearchDocument>> {
        let state = self.lock();
        Ok(state
            .records
            .range(after_id.saturating_add(1)..)
            .filter_map(|(_, record)| {
                let search = record.domains.get(&Domain::SearchText)?;
                let text = record.normalized_value(Domain::SearchText)?;
                let indexed = record.status(Domain::IndexStatus) == DomainStatus::Normalized;
                if unindexed_only && indexed {
                    return None;
                }
                Some(SearchDocument {
                    record_id: record.id,
                    text: text.to_string(),
                    indexed,
                    updated_at: search.updated_at,
                })
            })
            .take(limit)
            .collect())
    }

    async fn mark_indexed(&self, record_ids: &[i64]) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.lock();
        let mut marked = 0;
        for id in record_ids {
            let Some(record) = state.records.get_mut(id) else {
                continue;
            };
            if record.status(Domain::SearchText) != DomainStatus::Normalized {
                continue;
            }
            record.domains.insert(
                Domain::IndexStatus,
                DomainState {
                    status: DomainStatus::Normalized,
                    resolved_by: Some("indexer".to_string()),
                    updated_at: Some(now),
                    ..DomainState::default()
                },
            );
            marked += 1;
        }
        Ok(marked)
    }
}
