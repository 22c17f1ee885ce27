//! PostgreSQL 実装。
//!
//! ドメイン状態は `record_domains` に (record_id, domain) 単位で保持する。
//! 状態遷移の UPDATE はすべて `status = 'pending'` を条件にしており、
//! 同じレコードに対する二重書き込みはデータベース側で弾かれる。

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::dao::{EnrichmentDao, ImportOutcome};
use super::models::{
    BatchCommit, CatalogRecord, DomainOutcome, DomainState, DomainTransition, MappingSource,
    NewCatalogRecord, NormalizationMapping, ScoreFeatures, SearchDocument, StatusCounts,
    StatusSummary,
};
use crate::domain::{Domain, DomainStatus, ResetScope};

#[derive(Debug, Clone)]
pub struct PgEnrichmentDao {
    pool: PgPool,
}

impl PgEnrichmentDao {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 同梱のマイグレーションを適用する。
    ///
    /// # Errors
    /// マイグレーションの適用に失敗した場合。
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run enrichment migrations")
    }

    async fn attach_domains(&self, mut records: Vec<CatalogRecord>) -> Result<Vec<CatalogRecord>> {
        if records.is_empty() {
            return Ok(records);
        }
        let ids: Vec<i64> = records.iter().map(|record| record.id).collect();
        let rows = sqlx::query(
            r"
            SELECT record_id, domain, status, value, secondary, confidence, resolved_by, updated_at
            FROM record_domains
            WHERE record_id = ANY($1)
            ",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .context("failed to load domain states")?;

        let mut by_record: HashMap<i64, Vec<(Domain, DomainState)>> = HashMap::new();
        for row in rows {
            let record_id: i64 = row.try_get("record_id")?;
            let (domain, state) = domain_state_from_row(&row)?;
            by_record.entry(record_id).or_default().push((domain, state));
        }
        for record in &mut records {
            if let Some(states) = by_record.remove(&record.id) {
                record.domains.extend(states);
            }
        }
        Ok(records)
    }
}

fn record_from_row(row: &PgRow) -> Result<CatalogRecord> {
    let features: Json<ScoreFeatures> = row.try_get("features")?;
    Ok(CatalogRecord {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        raw_composer: row.try_get("raw_composer")?,
        raw_instruments: row.try_get("raw_instruments")?,
        raw_voicing: row.try_get("raw_voicing")?,
        raw_genre: row.try_get("raw_genre")?,
        raw_tags: row.try_get("raw_tags")?,
        source: row.try_get("source")?,
        features: features.0,
        domains: Domain::ALL
            .into_iter()
            .map(|domain| (domain, DomainState::default()))
            .collect(),
    })
}

fn domain_state_from_row(row: &PgRow) -> Result<(Domain, DomainState)> {
    let domain: String = row.try_get("domain")?;
    let status: String = row.try_get("status")?;
    Ok((
        domain.parse()?,
        DomainState {
            status: status.parse()?,
            value: row.try_get("value")?,
            secondary: row.try_get("secondary")?,
            confidence: row.try_get("confidence")?,
            resolved_by: row.try_get("resolved_by")?,
            updated_at: row.try_get("updated_at")?,
        },
    ))
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

async fn apply_transition(
    tx: &mut Transaction<'_, Postgres>,
    transition: &DomainTransition,
) -> Result<bool> {
    let (value, secondary, confidence) = match &transition.outcome {
        DomainOutcome::Normalized {
            value,
            secondary,
            confidence,
        } => (Some(value.as_str()), secondary.as_deref(), *confidence),
        DomainOutcome::NotApplicable | DomainOutcome::Failed { .. } => (None, None, None),
    };
    let result = sqlx::query(
        r"
        UPDATE record_domains
        SET status = $3, value = $4, secondary = $5, confidence = $6,
            resolved_by = $7, updated_at = NOW()
        WHERE record_id = $1 AND domain = $2 AND status = 'pending'
        ",
    )
    .bind(transition.record_id)
    .bind(transition.domain.as_str())
    .bind(transition.outcome.status().as_str())
    .bind(value)
    .bind(secondary)
    .bind(confidence)
    .bind(&transition.resolved_by)
    .execute(&mut **tx)
    .await
    .with_context(|| {
        format!(
            "failed to write {} for record {}",
            transition.domain, transition.record_id
        )
    })?;

    let applied = result.rows_affected() == 1;
    if applied && transition.invalidates_index() {
        sqlx::query(
            r"
            UPDATE record_domains
            SET status = 'pending', value = NULL, secondary = NULL, confidence = NULL,
                resolved_by = NULL, updated_at = NOW()
            WHERE record_id = $1 AND domain = 'index_status'
            ",
        )
        .bind(transition.record_id)
        .execute(&mut **tx)
        .await
        .context("failed to reopen index status")?;
    }
    Ok(applied)
}

async fn upsert_mapping(
    tx: &mut Transaction<'_, Postgres>,
    mapping: &NormalizationMapping,
) -> Result<()> {
    // 検証済みのマッピングは未検証の値で上書きしない
    sqlx::query(
        r"
        INSERT INTO normalization_mappings
            (domain, raw_value, resolved_value, source, verified, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, NOW(), NOW())
        ON CONFLICT (domain, raw_value) DO UPDATE
        SET resolved_value = EXCLUDED.resolved_value,
            source = EXCLUDED.source,
            verified = EXCLUDED.verified,
            updated_at = NOW()
        WHERE NOT normalization_mappings.verified OR EXCLUDED.verified
        ",
    )
    .bind(mapping.domain.as_str())
    .bind(&mapping.raw_value)
    .bind(mapping.resolved_value.as_deref())
    .bind(mapping.source.as_str())
    .bind(mapping.verified)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to upsert mapping for {}", mapping.domain))?;
    Ok(())
}

#[async_trait]
impl EnrichmentDao for PgEnrichmentDao {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }

    async fn import_records(&self, records: &[NewCatalogRecord]) -> Result<ImportOutcome> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let domains: Vec<&str> = Domain::ALL.iter().map(|domain| domain.as_str()).collect();
        let mut outcome = ImportOutcome::default();

        for record in records {
            let inserted = sqlx::query(
                r"
                INSERT INTO catalog_records
                    (id, title, raw_composer, raw_instruments, raw_voicing, raw_genre,
                     raw_tags, source, features)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(record.id)
            .bind(&record.title)
            .bind(record.composer.as_deref())
            .bind(record.instruments.as_deref())
            .bind(record.voicing.as_deref())
            .bind(record.genre.as_deref())
            .bind(record.tags.as_deref())
            .bind(record.source.as_deref())
            .bind(Json(&record.features))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to insert catalog record {}", record.id))?;

            if inserted.rows_affected() == 0 {
                outcome.skipped += 1;
                continue;
            }

            sqlx::query(
                r"
                INSERT INTO record_domains (record_id, domain, status)
                SELECT $1, domain, 'pending' FROM UNNEST($2::TEXT[]) AS domain
                ",
            )
            .bind(record.id)
            .bind(&domains)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to seed domains for record {}", record.id))?;
            outcome.inserted += 1;
        }

        tx.commit().await.context("failed to commit import")?;
        Ok(outcome)
    }

    async fn get_record(&self, id: i64) -> Result<Option<CatalogRecord>> {
        let row = sqlx::query(
            r"
            SELECT id, title, raw_composer, raw_instruments, raw_voicing, raw_genre,
                   raw_tags, source, features
            FROM catalog_records
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch catalog record")?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = record_from_row(&row)?;
        Ok(self.attach_domains(vec![record]).await?.pop())
    }

    async fn pending_records(
        &self,
        domain: Domain,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<CatalogRecord>> {
        let rows = sqlx::query(
            r"
            SELECT r.id, r.title, r.raw_composer, r.raw_instruments, r.raw_voicing,
                   r.raw_genre, r.raw_tags, r.source, r.features
            FROM catalog_records r
            JOIN record_domains d
              ON d.record_id = r.id AND d.domain = $1 AND d.status = 'pending'
            WHERE r.id > $2
            ORDER BY r.id
            LIMIT $3
            ",
        )
        .bind(domain.as_str())
        .bind(after_id)
        .bind(clamp_limit(limit))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to page pending {domain} records"))?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>>>()?;
        self.attach_domains(records).await
    }

    async fn load_mappings(&self, domain: Domain) -> Result<Vec<NormalizationMapping>> {
        let rows = sqlx::query(
            r"
            SELECT raw_value, resolved_value, source, verified
            FROM normalization_mappings
            WHERE domain = $1
            ",
        )
        .bind(domain.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load {domain} mappings"))?;

        rows.iter()
            .map(|row| {
                let source: String = row.try_get("source")?;
                Ok(NormalizationMapping {
                    domain,
                    raw_value: row.try_get("raw_value")?,
                    resolved_value: row.try_get("resolved_value")?,
                    source: MappingSource::from_db(&source),
                    verified: row.try_get("verified")?,
                })
            })
            .collect()
    }

    async fn apply_batch(&self, commit: &BatchCommit) -> Result<u64> {
        if commit.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let mut applied = 0;
        for transition in &commit.transitions {
            if apply_transition(&mut tx, transition).await? {
                applied += 1;
            }
        }
        for mapping in &commit.mappings {
            upsert_mapping(&mut tx, mapping).await?;
        }
        tx.commit().await.context("failed to commit batch")?;
        Ok(applied)
    }

    async fn reset_domain(&self, domain: Domain, scope: ResetScope) -> Result<u64> {
        let statuses: Vec<&str> = scope.statuses().iter().map(|status| status.as_str()).collect();
        let result = sqlx::query(
            r"
            UPDATE record_domains
            SET status = 'pending', value = NULL, secondary = NULL, confidence = NULL,
                resolved_by = NULL, updated_at = NOW()
            WHERE domain = $1 AND status = ANY($2)
            ",
        )
        .bind(domain.as_str())
        .bind(&statuses)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to reset {domain}"))?;
        Ok(result.rows_affected())
    }

    async fn status_summary(&self) -> Result<StatusSummary> {
        let rows = sqlx::query(
            r"
            SELECT domain, status, COUNT(*) AS count
            FROM record_domains
            GROUP BY domain, status
            ",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to summarize domain statuses")?;

        let mut summary: StatusSummary = Domain::ALL
            .into_iter()
            .map(|domain| (domain, StatusCounts::default()))
            .collect();
        for row in rows {
            let domain: String = row.try_get("domain")?;
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let status: DomainStatus = status.parse()?;
            summary
                .entry(domain.parse()?)
                .or_default()
                .add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(summary)
    }

    async fn clear_mappings(&self, domain: Domain) -> Result<u64> {
        let result = sqlx::query("DELETE FROM normalization_mappings WHERE domain = $1")
            .bind(domain.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to clear {domain} mappings"))?;
        Ok(result.rows_affected())
    }

    async fn search_documents(
        &self,
        after_id: i64,
        limit: usize,
        unindexed_only: bool,
    ) -> Result<Vec<SearchDocument>> {
        let rows = sqlx::query(
            r"
            SELECT s.record_id, s.value, s.updated_at, i.status AS index_status
            FROM record_domains s
            JOIN record_domains i
              ON i.record_id = s.record_id AND i.domain = 'index_status'
            WHERE s.domain = 'search_text'
              AND s.status = 'normalized'
              AND s.value IS NOT NULL
              AND s.record_id > $1
              AND (NOT $3 OR i.status <> 'normalized')
            ORDER BY s.record_id
            LIMIT $2
            ",
        )
        .bind(after_id)
        .bind(clamp_limit(limit))
        .bind(unindexed_only)
        .fetch_all(&self.pool)
        .await
        .context("failed to load search documents")?;

        rows.iter()
            .map(|row| {
                let index_status: String = row.try_get("index_status")?;
                let updated_at: Option<DateTime<Utc>> = row.try_get("updated_at")?;
                Ok(SearchDocument {
                    record_id: row.try_get("record_id")?,
                    text: row.try_get("value")?,
                    indexed: index_status == DomainStatus::Normalized.as_str(),
                    updated_at,
                })
            })
            .collect()
    }

    async fn mark_indexed(&self, record_ids: &[i64]) -> Result<u64> {
        if record_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r"
            UPDATE record_domains i
            SET status = 'normalized', value = NULL, secondary = NULL, confidence = NULL,
                resolved_by = 'indexer', updated_at = NOW()
            FROM record_domains s
            WHERE i.record_id = ANY($1)
              AND i.domain = 'index_status'
              AND s.record_id = i.record_id
              AND s.domain = 'search_text'
              AND s.status = 'normalized'
            ",
        )
        .bind(record_ids)
        .execute(&self.pool)
        .await
        .context("failed to acknowledge indexed documents")?;
        Ok(result.rows_affected())
    }
}
