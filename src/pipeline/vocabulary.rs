//! Controlled vocabularies and the validator that constrains provider output.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;

use super::rules::PatternRules;
use crate::domain::Domain;

pub const DEFAULT_GENRES: &[&str] = &[
    "Art Song",
    "Ballad",
    "Blues",
    "Chamber Music",
    "Children's",
    "Christmas",
    "Concerto",
    "Dance",
    "Etude",
    "Film Music",
    "Folk",
    "Gospel",
    "Hymn",
    "Jazz",
    "Lullaby",
    "March",
    "Mass",
    "Motet",
    "Musical Theatre",
    "Opera",
    "Oratorio",
    "Patriotic",
    "Pop",
    "Ragtime",
    "Requiem",
    "Rock",
    "Sacred",
    "Sonata",
    "Spiritual",
    "Symphony",
];

pub const DEFAULT_PERIODS: &[&str] = &[
    "Medieval",
    "Renaissance",
    "Baroque",
    "Classical",
    "Romantic",
    "Impressionist",
    "Modern",
    "Contemporary",
];

pub const DEFAULT_VOICINGS: &[&str] = &[
    "SATB",
    "SSATB",
    "SATB divisi",
    "SAB",
    "SSA",
    "SSAA",
    "SA",
    "TTBB",
    "TBB",
    "TB",
    "Two-part",
    "Three-part",
    "Unison",
    "Solo voice",
    "Duet",
];

pub const DEFAULT_INSTRUMENTS: &[&str] = &[
    "Piano",
    "Organ",
    "Harpsichord",
    "Guitar",
    "Harp",
    "Violin",
    "Viola",
    "Cello",
    "Double Bass",
    "Flute",
    "Piccolo",
    "Oboe",
    "Clarinet",
    "Bassoon",
    "Saxophone",
    "Trumpet",
    "Horn",
    "Trombone",
    "Tuba",
    "Euphonium",
    "Percussion",
    "Timpani",
    "Recorder",
    "Ukulele",
    "Accordion",
    "Mandolin",
    "Strings",
    "String Orchestra",
    "Orchestra",
    "Concert Band",
];

pub const DEFAULT_GRADE_PATTERNS: &[&str] = &[r"^Grade [1-9]$", r"^Grade [1-9]-[1-9]$"];

/// 閉じた語彙。照合は大文字小文字を無視し、正規表記を返す。
#[derive(Debug, Clone, Default)]
struct ClosedSet {
    members: Vec<String>,
    index: FxHashMap<String, usize>,
}

impl ClosedSet {
    fn new(members: Vec<String>) -> Self {
        let index = members
            .iter()
            .enumerate()
            .map(|(position, member)| (fold(member), position))
            .collect();
        Self { members, index }
    }

    fn canonical(&self, candidate: &str) -> Option<&str> {
        self.index
            .get(&fold(candidate))
            .map(|&position| self.members[position].as_str())
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

fn fold(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// YAML で上書きできる語彙ファイルの形。省略したキーは既定値を使う。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VocabularyFile {
    pub genres: Option<Vec<String>>,
    pub periods: Option<Vec<String>>,
    pub voicings: Option<Vec<String>>,
    pub instruments: Option<Vec<String>>,
    pub grade_patterns: Option<Vec<String>>,
    pub pattern_rules: Option<BTreeMap<Domain, Vec<String>>>,
}

/// Validator が受理した値。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedValue {
    pub value: String,
    pub secondary: Option<String>,
}

impl AcceptedValue {
    fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            secondary: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Vocabulary {
    genres: ClosedSet,
    periods: ClosedSet,
    voicings: ClosedSet,
    instruments: ClosedSet,
    grade_patterns: Vec<Regex>,
    rules: PatternRules,
}

impl Vocabulary {
    /// 組み込みの既定語彙を構築する。
    ///
    /// # Errors
    /// 既定のパターンがコンパイルできない場合（通常は起きない）。
    pub fn builtin() -> Result<Self> {
        Self::from_file(VocabularyFile::default())
    }

    /// # Errors
    /// ファイルの読み込み・YAML 解析・正規表現コンパイルに失敗した場合。
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read vocabulary file {}", path.display()))?;
        let file: VocabularyFile = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse vocabulary file {}", path.display()))?;
        Self::from_file(file)
    }

    /// # Errors
    /// 語彙が空、または正規表現が不正な場合。
    pub fn from_file(file: VocabularyFile) -> Result<Self> {
        let owned = |defaults: &[&str]| -> Vec<String> {
            defaults.iter().map(ToString::to_string).collect()
        };
        let genres = file.genres.unwrap_or_else(|| owned(DEFAULT_GENRES));
        let periods = file.periods.unwrap_or_else(|| owned(DEFAULT_PERIODS));
        let voicings = file.voicings.unwrap_or_else(|| owned(DEFAULT_VOICINGS));
        let instruments = file.instruments.unwrap_or_else(|| owned(DEFAULT_INSTRUMENTS));
        let grade_patterns: Vec<String> = file
            .grade_patterns
            .unwrap_or_else(|| owned(DEFAULT_GRADE_PATTERNS));

        for (name, list) in [
            ("genres", &genres),
            ("periods", &periods),
            ("voicings", &voicings),
            ("instruments", &instruments),
            ("grade_patterns", &grade_patterns),
        ] {
            anyhow::ensure!(!list.is_empty(), "vocabulary list `{name}` must not be empty");
        }

        let grade_patterns = grade_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).with_context(|| format!("invalid grade pattern {pattern}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let rules =
            PatternRules::compile(&file.pattern_rules.unwrap_or_else(PatternRules::defaults))?;

        Ok(Self {
            genres: ClosedSet::new(genres),
            periods: ClosedSet::new(periods),
            voicings: ClosedSet::new(voicings),
            instruments: ClosedSet::new(instruments),
            grade_patterns,
            rules,
        })
    }

    #[must_use]
    pub fn rules(&self) -> &PatternRules {
        &self.rules
    }

    #[must_use]
    pub fn genre_count(&self) -> usize {
        self.genres.len()
    }

    #[must_use]
    pub fn genres(&self) -> &[String] {
        &self.genres.members
    }

    #[must_use]
    pub fn periods(&self) -> &[String] {
        &self.periods.members
    }

    #[must_use]
    pub fn voicings(&self) -> &[String] {
        &self.voicings.members
    }

    #[must_use]
    pub fn instruments(&self) -> &[String] {
        &self.instruments.members
    }

    /// プロバイダ応答の値をドメインの語彙で検証する。
    ///
    /// 語彙外・空値・型違いはすべて `None`（呼び出し側で `not_applicable`）。
    /// 学年の副ラベルは検証せずそのまま通す。
    #[must_use]
    pub fn validate(
        &self,
        domain: Domain,
        value: &Value,
        secondary: Option<&str>,
    ) -> Option<AcceptedValue> {
        match domain {
            Domain::Composer | Domain::SearchText => text_of(value).map(AcceptedValue::plain),
            Domain::Period => self.closed(&self.periods, value),
            Domain::Genre => self.closed(&self.genres, value),
            Domain::Voicing => self.closed(&self.voicings, value),
            Domain::VocalFlag => {
                vocal_flag_of(value).map(|flag| AcceptedValue::plain(flag.to_string()))
            }
            Domain::Instruments => self.instruments_of(value).map(AcceptedValue::plain),
            Domain::PedagogicalGrade => {
                let grade = self.grade_of(value)?;
                let secondary = secondary
                    .map(str::trim)
                    .filter(|label| !label.is_empty())
                    .map(ToString::to_string);
                Some(AcceptedValue {
                    value: grade,
                    secondary,
                })
            }
            Domain::IndexStatus => None,
        }
    }

    /// キャッシュ済みの解決値が現在の語彙でもまだ有効か。
    #[must_use]
    pub fn revalidate(&self, domain: Domain, cached: &str) -> Option<String> {
        self.validate(domain, &Value::String(cached.to_string()), None)
            .map(|accepted| accepted.value)
    }

    fn closed(&self, set: &ClosedSet, value: &Value) -> Option<AcceptedValue> {
        let text = text_of(value)?;
        set.canonical(&text).map(AcceptedValue::plain)
    }

    fn instruments_of(&self, value: &Value) -> Option<String> {
        let candidates: Vec<String> = match value {
            Value::Array(items) => items.iter().filter_map(text_of).collect(),
            Value::String(raw) => raw.split(',').map(|part| part.trim().to_string()).collect(),
            _ => Vec::new(),
        };
        let mut accepted: Vec<&str> = Vec::new();
        for candidate in &candidates {
            if let Some(canonical) = self.instruments.canonical(candidate) {
                if !accepted.contains(&canonical) {
                    accepted.push(canonical);
                }
            }
        }
        if accepted.is_empty() {
            None
        } else {
            Some(accepted.join(", "))
        }
    }

    fn grade_of(&self, value: &Value) -> Option<String> {
        let text = text_of(value)?;
        let label = match text.get(..6) {
            Some(prefix) if prefix.eq_ignore_ascii_case("grade ") => {
                format!("Grade {}", text[6..].trim())
            }
            _ => text,
        };
        self.grade_patterns
            .iter()
            .any(|pattern| pattern.is_match(&label))
            .then_some(label)
    }
}

fn text_of(value: &Value) -> Option<String> {
    let text = value.as_str()?;
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || collapsed.eq_ignore_ascii_case("null") || collapsed == "NA" {
        None
    } else {
        Some(collapsed)
    }
}

fn vocal_flag_of(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::String(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
