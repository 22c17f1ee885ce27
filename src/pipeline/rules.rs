//! Deterministic pattern rules for raw values known to be unresolvable.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::RegexSet;

use crate::domain::Domain;

pub(crate) const DEFAULT_COMPOSER_RULES: &[&str] = &[
    r"^anon(ymous)?\.?$",
    r"^trad(itional)?\.?$",
    r"^unknown( composer)?$",
    r"^n/?a$",
    r"^various( artists| composers)?$",
    r"^folk[ -]?song$",
    r"^public domain$",
];

pub(crate) const DEFAULT_PLACEHOLDER_RULES: &[&str] = &[r"^n/?a$", r"^none$", r"^unknown$", r"^-+$"];

/// ドメインごとのパターンルール集合（大文字小文字を区別しない）。
#[derive(Debug, Clone)]
pub struct PatternRules {
    sets: BTreeMap<Domain, RegexSet>,
}

impl PatternRules {
    /// # Errors
    /// 正規表現がコンパイルできない場合はエラーを返す。
    pub fn compile(rules: &BTreeMap<Domain, Vec<String>>) -> Result<Self> {
        let mut sets = BTreeMap::new();
        for (domain, patterns) in rules {
            if patterns.is_empty() {
                continue;
            }
            let set = RegexSet::new(patterns.iter().map(|p| format!("(?i){p}")))
                .with_context(|| format!("invalid pattern rule for domain {domain}"))?;
            sets.insert(*domain, set);
        }
        Ok(Self { sets })
    }

    #[must_use]
    pub fn defaults() -> BTreeMap<Domain, Vec<String>> {
        let owned = |patterns: &[&str]| -> Vec<String> {
            patterns.iter().map(ToString::to_string).collect()
        };
        BTreeMap::from([
            (Domain::Composer, owned(DEFAULT_COMPOSER_RULES)),
            (Domain::Genre, owned(DEFAULT_PLACEHOLDER_RULES)),
            (Domain::Voicing, owned(DEFAULT_PLACEHOLDER_RULES)),
            (Domain::Instruments, owned(DEFAULT_PLACEHOLDER_RULES)),
        ])
    }

    /// 生値（前後空白除去済み）がいずれかのルールに一致するか。
    #[must_use]
    pub fn matches(&self, domain: Domain, raw: &str) -> bool {
        self.sets
            .get(&domain)
            .is_some_and(|set| set.is_match(raw.trim()))
    }

    #[must_use]
    pub fn rule_count(&self, domain: Domain) -> usize {
        self.sets.get(&domain).map_or(0, RegexSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn defaults() -> PatternRules {
        PatternRules::compile(&PatternRules::defaults()).expect("default rules compile")
    }

    #[rstest]
    #[case("Traditional")]
    #[case("trad.")]
    #[case("Anonymous")]
    #[case("Anon.")]
    #[case(" UNKNOWN ")]
    #[case("N/A")]
    #[case("Various")]
    #[case("Folk song")]
    #[case("Public Domain")]
    fn composer_placeholders_match(#[case] raw: &str) {
        assert!(defaults().matches(Domain::Composer, raw));
    }

    #[rstest]
    #[case("J.S. Bach")]
    #[case("Traditional Irish, arr. Smith")]
    #[case("Anonymous 4")]
    fn real_composers_do_not_match(#[case] raw: &str) {
        assert!(!defaults().matches(Domain::Composer, raw));
    }

    #[test]
    fn domains_without_rules_never_match() {
        assert!(!defaults().matches(Domain::Period, "unknown"));
        assert_eq!(defaults().rule_count(Domain::Period), 0);
    }

    #[test]
    fn invalid_pattern_is_a_configuration_error() {
        let rules = BTreeMap::from([(Domain::Genre, vec!["(".to_string()])]);
        let error = PatternRules::compile(&rules).expect_err("invalid regex");
        assert!(error.to_string().contains("genre"));
    }
}
