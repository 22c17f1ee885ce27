//! ステージゲート。
//!
//! `pending` のレコードから、依存・入力有無・ルーティング条件を満たすものを選び、
//! パターンルール → マッピングキャッシュの順に推論なしで決着できるものを先に処理する。
//! 残りだけがバッチ処理に回る。

use tracing::debug;

use super::cache::{CachedResolution, MappingCache};
use super::dependency::{StagePlan, applies_to};
use super::vocabulary::Vocabulary;
use crate::domain::{Domain, DomainStatus};
use crate::store::models::{CatalogRecord, DomainOutcome, DomainTransition, NormalizationMapping};
use crate::util::text::cache_key;

/// 推論を経ない決着の種類。メトリクスと `resolved_by` に使う。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShortCircuitKind {
    PatternRule,
    Cache,
    Routing,
}

impl ShortCircuitKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            ShortCircuitKind::PatternRule => "pattern_rule",
            ShortCircuitKind::Cache => "cache",
            ShortCircuitKind::Routing => "routing",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ShortCircuit {
    pub(crate) transition: DomainTransition,
    pub(crate) mapping: Option<NormalizationMapping>,
    pub(crate) kind: ShortCircuitKind,
}

#[derive(Debug, Default)]
pub(crate) struct GateOutcome {
    pub(crate) short_circuits: Vec<ShortCircuit>,
    pub(crate) forward: Vec<CatalogRecord>,
    /// 依存未決着・入力なしで今回は見送ったレコード数。
    pub(crate) deferred: usize,
}

impl GateOutcome {
    pub(crate) fn admitted(&self) -> usize {
        self.short_circuits.len() + self.forward.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StageGate<'a> {
    plan: &'a StagePlan,
    vocabulary: &'a Vocabulary,
    min_coverage: u8,
}

impl<'a> StageGate<'a> {
    pub(crate) fn new(plan: &'a StagePlan, vocabulary: &'a Vocabulary, min_coverage: u8) -> Self {
        Self {
            plan,
            vocabulary,
            min_coverage,
        }
    }

    /// ページ単位でゲートを評価する。`admit_limit` 件を通した時点で打ち切る。
    pub(crate) fn evaluate(
        &self,
        domain: Domain,
        records: Vec<CatalogRecord>,
        cache: Option<&MappingCache>,
        admit_limit: usize,
    ) -> GateOutcome {
        let mut outcome = GateOutcome::default();
        for record in records {
            if outcome.admitted() >= admit_limit {
                break;
            }
            if !self.is_eligible(domain, &record) {
                outcome.deferred += 1;
                continue;
            }
            if !self.routes_to(domain, &record) {
                outcome.short_circuits.push(ShortCircuit {
                    transition: transition(&record, domain, DomainOutcome::NotApplicable, "routing"),
                    mapping: None,
                    kind: ShortCircuitKind::Routing,
                });
                continue;
            }
            match self.short_circuit(domain, &record, cache) {
                Some(short_circuit) => outcome.short_circuits.push(short_circuit),
                None => outcome.forward.push(record),
            }
        }
        debug!(
            domain = %domain,
            short_circuits = outcome.short_circuits.len(),
            forward = outcome.forward.len(),
            deferred = outcome.deferred,
            "stage gate evaluated"
        );
        outcome
    }

    fn is_eligible(&self, domain: Domain, record: &CatalogRecord) -> bool {
        domain.is_inferred()
            && record.status(domain) == DomainStatus::Pending
            && applies_to(domain, record)
            && self.plan.dependencies_satisfied(domain, record)
    }

    /// 決着済みの上流に基づくルーティング。`false` は `not_applicable` で短絡する。
    fn routes_to(&self, domain: Domain, record: &CatalogRecord) -> bool {
        match domain {
            Domain::Voicing => record.vocal_flag() == Some(true),
            Domain::Instruments => record.vocal_flag() != Some(true),
            Domain::SearchText => search_text_coverage(record) >= self.min_coverage,
            _ => true,
        }
    }

    fn short_circuit(
        &self,
        domain: Domain,
        record: &CatalogRecord,
        cache: Option<&MappingCache>,
    ) -> Option<ShortCircuit> {
        if !domain.is_cacheable() {
            return None;
        }
        let raw = record.raw_input(domain)?;

        if self.vocabulary.rules().matches(domain, raw) {
            return Some(ShortCircuit {
                transition: transition(
                    record,
                    domain,
                    DomainOutcome::NotApplicable,
                    ShortCircuitKind::PatternRule.as_str(),
                ),
                mapping: Some(NormalizationMapping::from_pattern_rule(
                    domain,
                    cache_key(raw),
                )),
                kind: ShortCircuitKind::PatternRule,
            });
        }

        let outcome = match cache?.get(raw)? {
            CachedResolution::Unresolved { .. } => DomainOutcome::NotApplicable,
            // 語彙の変更で無効になった値はキャッシュミスとして推論に回す
            CachedResolution::Resolved(value) => DomainOutcome::Normalized {
                value: self.vocabulary.revalidate(domain, &value)?,
                secondary: None,
                confidence: None,
            },
        };
        Some(ShortCircuit {
            transition: transition(record, domain, outcome, ShortCircuitKind::Cache.as_str()),
            mapping: None,
            kind: ShortCircuitKind::Cache,
        })
    }
}

/// {声部または楽器が確定, 作曲者またはジャンルが確定} のうち満たしている数。
pub(crate) fn search_text_coverage(record: &CatalogRecord) -> u8 {
    let normalized = |domain| record.status(domain) == DomainStatus::Normalized;
    u8::from(normalized(Domain::Voicing) || normalized(Domain::Instruments))
        + u8::from(normalized(Domain::Composer) || normalized(Domain::Genre))
}

fn transition(
    record: &CatalogRecord,
    domain: Domain,
    outcome: DomainOutcome,
    resolved_by: &str,
) -> DomainTransition {
    DomainTransition {
        record_id: record.id,
        domain,
        outcome,
        resolved_by: resolved_by.to_string(),
    }
}
