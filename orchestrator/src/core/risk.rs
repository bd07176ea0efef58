//! Risk scoring and the auto-approval gate.
//!
//! Scoring looks only at the description text. Each distinct pattern that
//! matches (case-insensitive, on word boundaries) adds a fixed increment and the
//! total is capped at 1.0.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Permissiveness level. Ordering follows declaration, least permissive first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskMode {
    #[default]
    Conservative,
    Standard,
    Aggressive,
    Autonomous,
}

/// Per-mode execution policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModePolicy {
    pub auto_approve: bool,
    pub risk_threshold: f64,
    pub confirm_destructive: bool,
    pub confirm_production: bool,
    pub max_parallel: usize,
    pub timeout_multiplier: f64,
    pub retry_limit: u32,
}

impl RiskMode {
    pub const ALL: [RiskMode; 4] = [
        RiskMode::Conservative,
        RiskMode::Standard,
        RiskMode::Aggressive,
        RiskMode::Autonomous,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Standard => "standard",
            Self::Aggressive => "aggressive",
            Self::Autonomous => "autonomous",
        }
    }

    pub fn policy(self) -> ModePolicy {
        match self {
            Self::Conservative => ModePolicy {
                auto_approve: false,
                risk_threshold: 0.0,
                confirm_destructive: true,
                confirm_production: true,
                max_parallel: 8,
                timeout_multiplier: 1.0,
                retry_limit: 3,
            },
            Self::Standard => ModePolicy {
                auto_approve: true,
                risk_threshold: 0.3,
                confirm_destructive: true,
                confirm_production: true,
                max_parallel: 10,
                timeout_multiplier: 1.2,
                retry_limit: 2,
            },
            Self::Aggressive => ModePolicy {
                auto_approve: true,
                risk_threshold: 0.7,
                confirm_destructive: true,
                confirm_production: false,
                max_parallel: 15,
                timeout_multiplier: 1.5,
                retry_limit: 1,
            },
            Self::Autonomous => ModePolicy {
                auto_approve: true,
                risk_threshold: 1.0,
                confirm_destructive: false,
                confirm_production: false,
                max_parallel: 20,
                timeout_multiplier: 2.0,
                retry_limit: 1,
            },
        }
    }

    /// The less permissive of two modes.
    pub fn stricter(self, other: RiskMode) -> RiskMode {
        self.min(other)
    }
}

impl fmt::Display for RiskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "standard" => Ok(Self::Standard),
            "aggressive" => Ok(Self::Aggressive),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(format!(
                "unknown risk mode {other:?} (expected conservative|standard|aggressive|autonomous)"
            )),
        }
    }
}

const DESTRUCTIVE_INCREMENT: f64 = 0.15;
const SEVERE_INCREMENT: f64 = 0.3;
const PRODUCTION_INCREMENT: f64 = 0.1;
const COMPLEXITY_INCREMENT: f64 = 0.05;
const SCOPE_INCREMENT: f64 = 0.03;

/// Destructive verbs with their inflections. `cleanup` (the noun) is not a match.
const DESTRUCTIVE_FORMS: &[&str] = &[
    "delet(?:e|es|ed|ing|ion|ions)",
    "del",
    "remov(?:e|es|ed|ing|al)",
    "drop(?:s|ped|ping)?",
    "truncat(?:e|es|ed|ing|ion)",
    "format(?:s|ted|ting)?",
    "destr(?:oy|oys|oyed|oying|uction)",
    "wip(?:e|es|ed|ing)",
    "clear(?:s|ed|ing)?",
    "reset(?:s|ting)?",
    "clean(?:s|ed|ing)?",
    "purg(?:e|es|ed|ing)",
    "eras(?:e|es|ed|ing|ure)",
];
const PRODUCTION_WORDS: &[&str] = &["prod", "production", "main", "master", "release", "deploy"];
const COMPLEXITY_WORDS: &[&str] = &["refactor", "rewrite", "migrate", "architecture", "schema"];
const SCOPE_WORDS: &[&str] = &["all", "entire", "whole", "complete", "full"];

fn bounded_patterns(forms: impl IntoIterator<Item = String>) -> Vec<Regex> {
    forms
        .into_iter()
        .map(|form| Regex::new(&format!(r"(?i)\b(?:{form})\b")).unwrap())
        .collect()
}

fn word_patterns(words: &[&str]) -> Vec<Regex> {
    bounded_patterns(words.iter().map(|word| regex::escape(word)))
}

static DESTRUCTIVE: LazyLock<Vec<Regex>> =
    LazyLock::new(|| bounded_patterns(DESTRUCTIVE_FORMS.iter().map(|form| form.to_string())));
static PRODUCTION: LazyLock<Vec<Regex>> = LazyLock::new(|| word_patterns(PRODUCTION_WORDS));
static COMPLEXITY: LazyLock<Vec<Regex>> = LazyLock::new(|| word_patterns(COMPLEXITY_WORDS));
static SCOPE: LazyLock<Vec<Regex>> = LazyLock::new(|| word_patterns(SCOPE_WORDS));
static SEVERE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\brm\s+-(?:rf|fr)\b",
        r"(?i)\bforce[- ]push(?:ed|es|ing)?\b|\bpush\s+(?:--force|-f)\b",
        r"(?i)\bdrop\s+(?:table|database|schema)\b",
        r"(?i)\boverwrite\s+prod(?:uction)?\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

fn count_matches(patterns: &[Regex], text: &str) -> usize {
    patterns.iter().filter(|re| re.is_match(text)).count()
}

/// Breakdown of one description's score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskAssessment {
    pub score: f64,
    pub destructive: bool,
    pub production: bool,
}

/// Score a description. `None` when there is nothing to assess.
pub fn assess(description: &str) -> Option<RiskAssessment> {
    if description.trim().is_empty() {
        return None;
    }

    let destructive = count_matches(&DESTRUCTIVE, description);
    let severe = count_matches(&SEVERE, description);
    let production = count_matches(&PRODUCTION, description);
    let complexity = count_matches(&COMPLEXITY, description);
    let scope = count_matches(&SCOPE, description);

    let raw = destructive as f64 * DESTRUCTIVE_INCREMENT
        + severe as f64 * SEVERE_INCREMENT
        + production as f64 * PRODUCTION_INCREMENT
        + complexity as f64 * COMPLEXITY_INCREMENT
        + scope as f64 * SCOPE_INCREMENT;

    // Two decimals keeps threshold comparisons stable across summation order.
    let score = ((raw * 100.0).round() / 100.0).min(1.0);

    Some(RiskAssessment {
        score,
        destructive: destructive + severe > 0,
        production: production > 0,
    })
}

/// Risk score in `[0, 1]`. An unassessable description scores 1.0.
pub fn assess_risk(description: &str) -> f64 {
    assess(description).map_or(1.0, |a| a.score)
}

/// Whether `description` may run without human confirmation under `mode`.
pub fn should_auto_approve(mode: RiskMode, description: &str) -> bool {
    let Some(assessment) = assess(description) else {
        return false;
    };
    let policy = mode.policy();
    if !policy.auto_approve || assessment.score > policy.risk_threshold {
        return false;
    }
    if policy.confirm_destructive && assessment.destructive {
        return false;
    }
    if policy.confirm_production && assessment.production {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_description_scores_zero() {
        assert_eq!(assess_risk("add docstrings to the parser module"), 0.0);
    }

    #[test]
    fn matching_is_case_insensitive_and_word_bounded() {
        assert_eq!(assess_risk("DELETE stale fixtures"), 0.15);
        // "cleanup" is not "clean"; "clearly" is not "clear".
        assert_eq!(assess_risk("cleanup helpers, clearly named"), 0.0);
        // "domain" does not contain the word "main".
        assert_eq!(assess_risk("update domain model"), 0.0);
    }

    #[test]
    fn inflected_destructive_verbs_are_caught() {
        for text in [
            "deletes the old user records",
            "removed every backup",
            "dropped the users table",
            "wipes the staging database",
            "purging stale caches",
            "erasing history",
            "del old rows",
        ] {
            assert!(assess(text).is_some_and(|a| a.destructive), "{text}");
            assert!(!should_auto_approve(RiskMode::Standard, text), "{text}");
            assert!(!should_auto_approve(RiskMode::Aggressive, text), "{text}");
        }
    }

    #[test]
    fn severe_phrases_add_on_top_of_verbs() {
        // drop (0.15) + drop table (0.3)
        assert_eq!(assess_risk("drop table users"), 0.45);
        // rm -rf (0.3) only
        assert_eq!(assess_risk("rm -rf build output"), 0.3);
    }

    #[test]
    fn score_is_capped() {
        let text = "delete remove drop truncate destroy wipe erase purge rm -rf force-push \
                    drop table overwrite production deploy release";
        assert_eq!(assess_risk(text), 1.0);
    }

    #[test]
    fn empty_description_fails_closed() {
        assert_eq!(assess_risk("   "), 1.0);
        for mode in RiskMode::ALL {
            assert!(!should_auto_approve(mode, ""));
        }
    }

    #[test]
    fn conservative_never_approves() {
        assert!(!should_auto_approve(
            RiskMode::Conservative,
            "add docstrings"
        ));
    }

    #[test]
    fn standard_approves_low_risk_only() {
        assert!(should_auto_approve(RiskMode::Standard, "add unit tests for parser"));
        assert!(!should_auto_approve(RiskMode::Standard, "delete old logs"));
        assert!(!should_auto_approve(RiskMode::Standard, "deploy docs site"));
    }

    #[test]
    fn aggressive_blocks_destructive_but_allows_production() {
        assert!(should_auto_approve(RiskMode::Aggressive, "deploy docs site"));
        assert!(!should_auto_approve(RiskMode::Aggressive, "remove dead code"));
    }

    #[test]
    fn autonomous_approves_destructive() {
        assert!(should_auto_approve(
            RiskMode::Autonomous,
            "rm -rf target and force-push to main"
        ));
    }

    #[test]
    fn gate_is_deterministic() {
        let text = "refactor the entire storage schema and drop table cache";
        let first = (assess_risk(text), should_auto_approve(RiskMode::Aggressive, text));
        for _ in 0..10 {
            assert_eq!(
                (assess_risk(text), should_auto_approve(RiskMode::Aggressive, text)),
                first
            );
        }
    }

    #[test]
    fn modes_parse_and_order() {
        assert_eq!("Standard".parse::<RiskMode>(), Ok(RiskMode::Standard));
        assert!("yolo".parse::<RiskMode>().is_err());
        assert_eq!(
            RiskMode::Autonomous.stricter(RiskMode::Standard),
            RiskMode::Standard
        );
        assert_eq!(RiskMode::Aggressive.policy().max_parallel, 15);
    }
}
