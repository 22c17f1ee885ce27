//! 検索テキスト生成ステージ。
//!
//! 正規化済みフィールドと楽譜特徴量からプロンプトを作り、1 レコードずつ生成する。
//! 出力は語彙ではなく品質チェック（長さ・専門用語・箇条書き・難易度の言及）で検証する。

use std::fmt::Write as _;

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use super::batch::ProvidersExhausted;
use super::prompt::SYSTEM_PROMPT;
use super::vocabulary::Vocabulary;
use crate::domain::Domain;
use crate::inference::{ChainError, InferenceRequest, ProviderSession};
use crate::schema::enrichment::ResponseShape;
use crate::store::models::{
    BatchCommit, CatalogRecord, DomainOutcome, DomainTransition, ScoreFeatures,
};
use crate::util::text::split_sentences;

pub(crate) const MIN_LENGTH: usize = 50;
pub(crate) const MAX_LENGTH: usize = 800;

const JARGON: &[&str] = &[
    "chromatic complexity",
    "polyphonic density",
    "voice independence",
    "ambitus",
];

const BOILERPLATE: &[&str] = &[
    "as an ai",
    "language model",
    "here is a description",
    "here's a description",
    "i hope this helps",
];

const DIFFICULTY_TERMS: &[&str] = &[
    "easy",
    "beginner",
    "simple",
    "intermediate",
    "moderate",
    "advanced",
    "challenging",
    "virtuoso",
    "demanding",
    "expert",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Difficulty {
    Beginner,
    Intermediate,
    Advanced,
    Virtuoso,
}

impl Difficulty {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Difficulty::Beginner => "beginner",
            Difficulty::Intermediate => "intermediate",
            Difficulty::Advanced => "advanced",
            Difficulty::Virtuoso => "virtuoso",
        }
    }

    const fn words(self) -> &'static [&'static str] {
        match self {
            Difficulty::Beginner => &["easy", "beginner", "simple"],
            Difficulty::Intermediate => &["intermediate", "moderate"],
            Difficulty::Advanced => &["advanced", "challenging"],
            Difficulty::Virtuoso => &["virtuoso", "technically demanding", "expert"],
        }
    }

    fn from_grade(grade: &str) -> Option<Self> {
        let level: u32 = grade
            .trim()
            .strip_prefix("Grade ")?
            .chars()
            .next()?
            .to_digit(10)?;
        Some(match level {
            0..=2 => Difficulty::Beginner,
            3..=4 => Difficulty::Intermediate,
            5..=6 => Difficulty::Advanced,
            _ => Difficulty::Virtuoso,
        })
    }

    fn from_complexity(melodic_complexity: f64) -> Self {
        if melodic_complexity < 0.3 {
            Difficulty::Beginner
        } else if melodic_complexity < 0.5 {
            Difficulty::Intermediate
        } else if melodic_complexity < 0.7 {
            Difficulty::Advanced
        } else {
            Difficulty::Virtuoso
        }
    }

    /// 学年を優先し、なければ旋律の複雑さから推定する。
    pub(crate) fn of(record: &CatalogRecord) -> Option<Self> {
        record
            .normalized_value(Domain::PedagogicalGrade)
            .and_then(Self::from_grade)
            .or_else(|| {
                record
                    .features
                    .melodic_complexity
                    .map(Self::from_complexity)
            })
    }
}

/// 品質チェックの指摘。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QualityIssue {
    TooShort,
    TooLong,
    Jargon(String),
    Boilerplate(String),
    BulletList,
    MissingDifficulty,
}

impl QualityIssue {
    fn label(&self) -> String {
        match self {
            QualityIssue::TooShort => "too_short".to_string(),
            QualityIssue::TooLong => "too_long".to_string(),
            QualityIssue::Jargon(term) => format!("jargon:{term}"),
            QualityIssue::Boilerplate(phrase) => format!("boilerplate:{phrase}"),
            QualityIssue::BulletList => "bullet_list".to_string(),
            QualityIssue::MissingDifficulty => "missing_difficulty".to_string(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct QualityChecker {
    banned: AhoCorasick,
    difficulty: AhoCorasick,
}

impl QualityChecker {
    pub(crate) fn new() -> Result<Self> {
        let banned = AhoCorasickBuilder::new()
            .match_kind(MatchKind::LeftmostLongest)
            .ascii_case_insensitive(true)
            .build(JARGON.iter().chain(BOILERPLATE))
            .context("failed to build banned phrase matcher")?;
        let difficulty = AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(DIFFICULTY_TERMS)
            .context("failed to build difficulty term matcher")?;
        Ok(Self { banned, difficulty })
    }

    pub(crate) fn check(&self, text: &str, difficulty_available: bool) -> Vec<QualityIssue> {
        let mut issues = Vec::new();
        let length = text.chars().count();
        if length < MIN_LENGTH {
            issues.push(QualityIssue::TooShort);
        }
        if length > MAX_LENGTH {
            issues.push(QualityIssue::TooLong);
        }

        for found in self.banned.find_iter(text) {
            let index = found.pattern().as_usize();
            let issue = match JARGON.get(index) {
                Some(term) => QualityIssue::Jargon((*term).to_string()),
                None => QualityIssue::Boilerplate(BOILERPLATE[index - JARGON.len()].to_string()),
            };
            if !issues.contains(&issue) {
                issues.push(issue);
            }
        }

        if looks_like_bullet_list(text) {
            issues.push(QualityIssue::BulletList);
        }
        if difficulty_available && !self.difficulty.is_match(text) {
            issues.push(QualityIssue::MissingDifficulty);
        }
        issues
    }
}

fn looks_like_bullet_list(text: &str) -> bool {
    let marked_lines = text
        .lines()
        .map(str::trim_start)
        .filter(|line| ["- ", "* ", "• "].iter().any(|marker| line.starts_with(marker)))
        .count();
    marked_lines >= 2 || (text.matches('-').count() > 3 && split_sentences(text).len() < 2)
}

fn bucket(value: u32, cuts: &[u32], labels: &[&'static str]) -> &'static str {
    cuts.iter()
        .position(|cut| value <= *cut)
        .and_then(|index| labels.get(index))
        .or_else(|| labels.last())
        .copied()
        .unwrap_or("unknown")
}

fn level(value: f64) -> &'static str {
    if value < 0.33 {
        "low"
    } else if value < 0.66 {
        "medium"
    } else {
        "high"
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("na"))
}

fn time_signature_name(raw: &str) -> String {
    match raw {
        "4/4" => "four-four (common time)".to_string(),
        "3/4" => "three-four (waltz time)".to_string(),
        "2/4" => "two-four".to_string(),
        "6/8" => "six-eight".to_string(),
        "2/2" => "cut time".to_string(),
        other => other.to_string(),
    }
}

fn cadence_name(raw: &str) -> String {
    match raw {
        "PAC" => "perfect authentic cadence".to_string(),
        "IAC" => "imperfect authentic cadence".to_string(),
        "HC" => "half cadence".to_string(),
        "plagal" => "plagal cadence".to_string(),
        other => other.replace('_', " "),
    }
}

fn clef_names(raw: &str) -> String {
    let mut names: Vec<&str> = Vec::new();
    for clef in raw.split([',', ' ', ';']).filter(|c| !c.is_empty()) {
        let name = match clef.chars().next().map(|c| c.to_ascii_lowercase()) {
            Some('g') => "treble",
            Some('f') => "bass",
            Some('c') => "alto",
            _ => continue,
        };
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names.join(", ")
}

/// 特徴量をプロンプト向けのカテゴリ表現に変換する。
pub(crate) fn describe_features(features: &ScoreFeatures) -> Vec<(&'static str, String)> {
    let mut lines = Vec::new();
    if let Some(key) = present(features.key_signature.as_deref()) {
        lines.push(("Key", key.to_string()));
    }
    if let Some(time) = present(features.time_signature.as_deref()) {
        lines.push(("Time signature", time_signature_name(time)));
    }
    if let Some(tempo) = features.tempo_bpm.filter(|t| *t > 0.0) {
        lines.push(("Tempo", format!("about {tempo:.0} BPM")));
    }
    if let Some(seconds) = features.duration_seconds.filter(|s| *s > 0.0) {
        let minutes = (seconds / 60.0).round().max(1.0);
        lines.push(("Duration", format!("about {minutes:.0} min")));
    }
    if let Some(measures) = features.measure_count {
        lines.push((
            "Length",
            bucket(measures, &[32, 80, 160], &["short", "medium", "long", "very_long"])
                .to_string(),
        ));
    }
    if let Some(parts) = features.num_parts {
        lines.push((
            "Ensemble",
            bucket(
                parts,
                &[1, 2, 4, 8],
                &["solo", "duo", "small_ensemble", "ensemble", "large_ensemble"],
            )
            .to_string(),
        ));
    }
    if let Some(pages) = features.page_count {
        lines.push((
            "Pages",
            bucket(
                pages,
                &[1, 3, 7, 15],
                &["very_short", "short", "medium", "long", "very_long"],
            )
            .to_string(),
        ));
    }
    if let Some(range) = features.ambitus_semitones {
        lines.push((
            "Range",
            bucket(range, &[12, 24, 36], &["narrow", "moderate", "wide", "very_wide"]).to_string(),
        ));
    }
    if let Some(clefs) = present(features.clefs_used.as_deref()) {
        let names = clef_names(clefs);
        if !names.is_empty() {
            lines.push(("Clefs", names));
        }
    }
    if let Some(cadence) = present(features.final_cadence.as_deref()) {
        lines.push(("Final cadence", cadence_name(cadence)));
    }
    if let Some(texture) = present(features.texture_type.as_deref()) {
        lines.push(("Texture", texture.replace('_', " ")));
    }
    if let Some(complexity) = features.melodic_complexity {
        lines.push(("Melodic complexity", level(complexity).to_string()));
    }
    if let Some(stepwise) = features.stepwise_motion_ratio {
        let motion = if stepwise >= 0.6 {
            "mostly stepwise"
        } else if stepwise >= 0.4 {
            "mixed steps and leaps"
        } else {
            "leapy"
        };
        lines.push(("Melodic motion", motion.to_string()));
    }
    if let Some(accompanied) = features.has_accompaniment {
        lines.push((
            "Accompaniment",
            if accompanied { "yes" } else { "no" }.to_string(),
        ));
    }
    lines
}

pub(crate) fn build_request(record: &CatalogRecord, difficulty: Option<Difficulty>) -> InferenceRequest {
    let mut prompt = String::from(
        "Write a search description for the sheet music below in 3 to 5 sentences of plain \
         prose, for musicians browsing a catalog. Say who the piece suits and what makes it \
         appealing.",
    );
    if let Some(difficulty) = difficulty {
        let _ = write!(
            prompt,
            " Its difficulty is {}; describe it with a word such as {}.",
            difficulty.as_str(),
            difficulty.words().join(" or ")
        );
    }
    prompt.push_str(
        " Do not use analysis terms such as chromatic complexity, polyphonic density or voice \
         independence, and do not use bullet points.\n\nRespond as {\"description\": \"...\"}.\n\n",
    );

    let mut field = |label: &str, value: Option<&str>| {
        if let Some(value) = present(value) {
            let _ = writeln!(prompt, "{label}: {value}");
        }
    };
    field("Title", Some(record.title.as_str()));
    field("Composer", record.normalized_value(Domain::Composer));
    field("Period", record.normalized_value(Domain::Period));
    field("Genre", record.normalized_value(Domain::Genre));
    field("Voicing", record.normalized_value(Domain::Voicing));
    field("Instruments", record.normalized_value(Domain::Instruments));
    field("Grade", record.normalized_value(Domain::PedagogicalGrade));
    field(
        "Regional grade",
        record.secondary_value(Domain::PedagogicalGrade),
    );
    for (label, value) in describe_features(&record.features) {
        field(label, Some(value.as_str()));
    }

    InferenceRequest::new(prompt, ResponseShape::SearchText).with_system(SYSTEM_PROMPT)
}

#[derive(Debug)]
pub(crate) struct SearchTextSynthesizer<'a> {
    vocabulary: &'a Vocabulary,
    quality: &'a QualityChecker,
}

impl<'a> SearchTextSynthesizer<'a> {
    pub(crate) fn new(vocabulary: &'a Vocabulary, quality: &'a QualityChecker) -> Self {
        Self {
            vocabulary,
            quality,
        }
    }

    /// 1 レコード分の検索テキストを生成する。
    ///
    /// # Errors
    /// プロバイダが全て枯渇した場合だけ [`ProvidersExhausted`]。
    pub(crate) async fn synthesize(
        &self,
        record: &CatalogRecord,
        session: &ProviderSession,
    ) -> Result<BatchCommit, ProvidersExhausted> {
        let difficulty = Difficulty::of(record);
        let request = build_request(record, difficulty);

        let (outcome, resolved_by) = match session.invoke(&request).await {
            Ok(invocation) => {
                let description = invocation
                    .value
                    .get("description")
                    .cloned()
                    .unwrap_or(Value::Null);
                let outcome = match self.vocabulary.validate(Domain::SearchText, &description, None) {
                    None => DomainOutcome::Failed {
                        reason: "empty description".to_string(),
                    },
                    Some(accepted) => {
                        let issues = self.quality.check(&accepted.value, difficulty.is_some());
                        if issues.is_empty() {
                            info!(record_id = record.id, chars = accepted.value.chars().count(), "search text accepted");
                            DomainOutcome::Normalized {
                                value: accepted.value,
                                secondary: None,
                                confidence: None,
                            }
                        } else {
                            let labels: Vec<String> = issues.iter().map(QualityIssue::label).collect();
                            warn!(record_id = record.id, issues = ?labels, "search text rejected by quality checks");
                            DomainOutcome::Failed {
                                reason: format!("quality check failed: {}", labels.join(", ")),
                            }
                        }
                    }
                };
                (outcome, invocation.provider)
            }
            Err(ChainError::Failed { source }) => {
                warn!(record_id = record.id, error = %source, "search text inference failed");
                (
                    DomainOutcome::Failed {
                        reason: source.to_string(),
                    },
                    source.provider().to_string(),
                )
            }
            Err(ChainError::Exhausted { attempted }) => {
                return Err(ProvidersExhausted { attempted });
            }
        };

        Ok(BatchCommit {
            transitions: vec![DomainTransition {
                record_id: record.id,
                domain: Domain::SearchText,
                outcome,
                resolved_by,
            }],
            mappings: Vec::new(),
        })
    }
}
