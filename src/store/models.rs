use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Domain, DomainStatus};
use crate::util::text::non_blank;

/// 抽出済みの楽譜特徴量。検索テキスト生成のプロンプト材料になる。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreFeatures {
    pub key_signature: Option<String>,
    pub time_signature: Option<String>,
    pub tempo_bpm: Option<f64>,
    pub duration_seconds: Option<f64>,
    pub measure_count: Option<u32>,
    pub num_parts: Option<u32>,
    pub page_count: Option<u32>,
    pub ambitus_semitones: Option<u32>,
    pub clefs_used: Option<String>,
    pub final_cadence: Option<String>,
    pub texture_type: Option<String>,
    pub melodic_complexity: Option<f64>,
    pub chromatic_complexity: Option<f64>,
    pub syncopation_level: Option<f64>,
    pub rhythmic_variety: Option<f64>,
    pub stepwise_motion_ratio: Option<f64>,
    pub has_dynamics: Option<bool>,
    pub has_accompaniment: Option<bool>,
    pub has_extracted_lyrics: Option<bool>,
}

/// 上流インポーターから受け取るレコード。全ドメインは `pending` で作られる。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCatalogRecord {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub composer: Option<String>,
    #[serde(default)]
    pub instruments: Option<String>,
    #[serde(default)]
    pub voicing: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub features: ScoreFeatures,
}

/// ドメイン 1 つ分の状態。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainState {
    pub status: DomainStatus,
    pub value: Option<String>,
    pub secondary: Option<String>,
    pub confidence: Option<f64>,
    pub resolved_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DomainState {
    pub(crate) fn reset(&mut self, now: DateTime<Utc>) {
        *self = DomainState {
            updated_at: Some(now),
            ..DomainState::default()
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: i64,
    pub title: String,
    pub raw_composer: Option<String>,
    pub raw_instruments: Option<String>,
    pub raw_voicing: Option<String>,
    pub raw_genre: Option<String>,
    pub raw_tags: Option<String>,
    pub source: Option<String>,
    pub features: ScoreFeatures,
    pub domains: BTreeMap<Domain, DomainState>,
}

impl CatalogRecord {
    #[must_use]
    pub fn from_new(record: NewCatalogRecord) -> Self {
        let domains = Domain::ALL
            .into_iter()
            .map(|domain| (domain, DomainState::default()))
            .collect();
        Self {
            id: record.id,
            title: record.title,
            raw_composer: record.composer,
            raw_instruments: record.instruments,
            raw_voicing: record.voicing,
            raw_genre: record.genre,
            raw_tags: record.tags,
            source: record.source,
            features: record.features,
            domains,
        }
    }

    #[must_use]
    pub fn state(&self, domain: Domain) -> DomainState {
        self.domains.get(&domain).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn status(&self, domain: Domain) -> DomainStatus {
        self.domains
            .get(&domain)
            .map_or(DomainStatus::Pending, |state| state.status)
    }

    /// `normalized` のときだけ解決値を返す。
    #[must_use]
    pub fn normalized_value(&self, domain: Domain) -> Option<&str> {
        self.domains
            .get(&domain)
            .filter(|state| state.status == DomainStatus::Normalized)
            .and_then(|state| state.value.as_deref())
    }

    #[must_use]
    pub fn secondary_value(&self, domain: Domain) -> Option<&str> {
        self.domains
            .get(&domain)
            .filter(|state| state.status == DomainStatus::Normalized)
            .and_then(|state| state.secondary.as_deref())
    }

    #[must_use]
    pub fn vocal_flag(&self) -> Option<bool> {
        match self.normalized_value(Domain::VocalFlag) {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        }
    }

    #[must_use]
    pub fn has_title(&self) -> bool {
        !self.title.trim().is_empty()
    }

    /// キャッシュ対象ドメインの生入力値。ジャンルはタグにフォールバックする。
    #[must_use]
    pub fn raw_input(&self, domain: Domain) -> Option<&str> {
        match domain {
            Domain::Composer => non_blank(self.raw_composer.as_deref()),
            Domain::Voicing => non_blank(self.raw_voicing.as_deref()),
            Domain::Instruments => non_blank(self.raw_instruments.as_deref()),
            Domain::Genre => non_blank(self.raw_genre.as_deref())
                .or_else(|| non_blank(self.raw_tags.as_deref())),
            _ => None,
        }
    }
}

/// バッチ処理の結果としてドメインに書き込む終端状態。
#[derive(Debug, Clone, PartialEq)]
pub enum DomainOutcome {
    Normalized {
        value: String,
        secondary: Option<String>,
        confidence: Option<f64>,
    },
    NotApplicable,
    Failed {
        reason: String,
    },
}

impl DomainOutcome {
    #[must_use]
    pub fn status(&self) -> DomainStatus {
        match self {
            DomainOutcome::Normalized { .. } => DomainStatus::Normalized,
            DomainOutcome::NotApplicable => DomainStatus::NotApplicable,
            DomainOutcome::Failed { .. } => DomainStatus::Failed,
        }
    }
}

/// `pending → terminal` 遷移。ドメイン状態を書き換える唯一の経路。
#[derive(Debug, Clone, PartialEq)]
pub struct DomainTransition {
    pub record_id: i64,
    pub domain: Domain,
    pub outcome: DomainOutcome,
    pub resolved_by: String,
}

impl DomainTransition {
    /// 対象が `pending` の場合だけ適用し、適用したかどうかを返す。
    pub(crate) fn apply_to(&self, state: &mut DomainState, now: DateTime<Utc>) -> bool {
        if state.status != DomainStatus::Pending {
            return false;
        }
        let (value, secondary, confidence) = match &self.outcome {
            DomainOutcome::Normalized {
                value,
                secondary,
                confidence,
            } => (Some(value.clone()), secondary.clone(), *confidence),
            DomainOutcome::NotApplicable | DomainOutcome::Failed { .. } => (None, None, None),
        };
        *state = DomainState {
            status: self.outcome.status(),
            value,
            secondary,
            confidence,
            resolved_by: Some(self.resolved_by.clone()),
            updated_at: Some(now),
        };
        true
    }

    /// 新しい検索テキストの書き込みはインデックス状態を `pending` に戻す。
    #[must_use]
    pub fn invalidates_index(&self) -> bool {
        self.domain == Domain::SearchText
            && matches!(self.outcome, DomainOutcome::Normalized { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum MappingSource {
    PatternRule,
    Provider(String),
}

impl MappingSource {
    pub const PATTERN_RULE: &'static str = "pattern_rule";

    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            MappingSource::PatternRule => Self::PATTERN_RULE,
            MappingSource::Provider(name) => name,
        }
    }

    #[must_use]
    pub fn from_db(raw: &str) -> Self {
        if raw == Self::PATTERN_RULE {
            MappingSource::PatternRule
        } else {
            MappingSource::Provider(raw.to_string())
        }
    }
}

/// (domain, raw value) → 解決値 または未解決マーカー（`None`）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationMapping {
    pub domain: Domain,
    pub raw_value: String,
    pub resolved_value: Option<String>,
    pub source: MappingSource,
    pub verified: bool,
}

impl NormalizationMapping {
    #[must_use]
    pub fn from_pattern_rule(domain: Domain, raw_value: impl Into<String>) -> Self {
        Self {
            domain,
            raw_value: raw_value.into(),
            resolved_value: None,
            source: MappingSource::PatternRule,
            verified: true,
        }
    }

    #[must_use]
    pub fn from_provider(
        domain: Domain,
        raw_value: impl Into<String>,
        resolved_value: Option<String>,
        provider: &str,
    ) -> Self {
        Self {
            domain,
            raw_value: raw_value.into(),
            resolved_value,
            source: MappingSource::Provider(provider.to_string()),
            verified: false,
        }
    }
}

/// 1 バッチ分の書き込み単位。遷移とマッピングは同じ作業単位で永続化される。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchCommit {
    pub transitions: Vec<DomainTransition>,
    pub mappings: Vec<NormalizationMapping>,
}

impl BatchCommit {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty() && self.mappings.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub normalized: u64,
    pub not_applicable: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub(crate) fn add(&mut self, status: DomainStatus, count: u64) {
        match status {
            DomainStatus::Pending => self.pending += count,
            DomainStatus::Normalized => self.normalized += count,
            DomainStatus::NotApplicable => self.not_applicable += count,
            DomainStatus::Failed => self.failed += count,
        }
    }
}

pub type StatusSummary = BTreeMap<Domain, StatusCounts>;

/// インデクサ向けフィードの 1 件。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub record_id: i64,
    pub text: String,
    pub indexed: bool,
    pub updated_at: Option<DateTime<Utc>>,
}
