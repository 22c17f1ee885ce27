//! Normalization domains and their per-record status values.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// カタログレコードの正規化対象属性。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Composer,
    Period,
    VocalFlag,
    Voicing,
    Instruments,
    Genre,
    PedagogicalGrade,
    SearchText,
    IndexStatus,
}

impl Domain {
    pub const ALL: [Domain; 9] = [
        Domain::Composer,
        Domain::Period,
        Domain::VocalFlag,
        Domain::Voicing,
        Domain::Instruments,
        Domain::Genre,
        Domain::PedagogicalGrade,
        Domain::SearchText,
        Domain::IndexStatus,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Domain::Composer => "composer",
            Domain::Period => "period",
            Domain::VocalFlag => "vocal_flag",
            Domain::Voicing => "voicing",
            Domain::Instruments => "instruments",
            Domain::Genre => "genre",
            Domain::PedagogicalGrade => "pedagogical_grade",
            Domain::SearchText => "search_text",
            Domain::IndexStatus => "index_status",
        }
    }

    /// 推論プロバイダで解決されるドメインかどうか。
    ///
    /// `index_status` はインデクサからの確認応答でのみ遷移する。
    #[must_use]
    pub const fn is_inferred(self) -> bool {
        !matches!(self, Domain::IndexStatus)
    }

    /// 生フィールド値をキーにマッピングキャッシュを共有できるドメイン。
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        matches!(
            self,
            Domain::Composer | Domain::Voicing | Domain::Instruments | Domain::Genre
        )
    }

    #[must_use]
    pub fn inferred() -> impl Iterator<Item = Domain> {
        Self::ALL.into_iter().filter(|domain| domain.is_inferred())
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseDomainError {
    kind: &'static str,
    value: String,
}

impl FromStr for Domain {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Domain::ALL
            .into_iter()
            .find(|domain| domain.as_str() == normalized)
            .ok_or_else(|| ParseDomainError {
                kind: "domain",
                value: s.to_string(),
            })
    }
}

/// ドメインごとの状態。`pending` 以外は実行単位での終端状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DomainStatus {
    #[default]
    Pending,
    Normalized,
    NotApplicable,
    Failed,
}

impl DomainStatus {
    pub const ALL: [DomainStatus; 4] = [
        DomainStatus::Pending,
        DomainStatus::Normalized,
        DomainStatus::NotApplicable,
        DomainStatus::Failed,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            DomainStatus::Pending => "pending",
            DomainStatus::Normalized => "normalized",
            DomainStatus::NotApplicable => "not_applicable",
            DomainStatus::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, DomainStatus::Pending)
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DomainStatus {
    type Err = ParseDomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        DomainStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| ParseDomainError {
                kind: "domain status",
                value: s.to_string(),
            })
    }
}

/// Operator reset scope, selected by the domain's current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetScope {
    Failed,
    NotApplicable,
    Normalized,
    /// Every non-pending record in the domain.
    All,
}

impl ResetScope {
    #[must_use]
    pub fn statuses(self) -> &'static [DomainStatus] {
        match self {
            ResetScope::Failed => &[DomainStatus::Failed],
            ResetScope::NotApplicable => &[DomainStatus::NotApplicable],
            ResetScope::Normalized => &[DomainStatus::Normalized],
            ResetScope::All => &[
                DomainStatus::Normalized,
                DomainStatus::NotApplicable,
                DomainStatus::Failed,
            ],
        }
    }
}
