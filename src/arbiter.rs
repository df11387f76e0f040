//! Multi-criteria selection between two competing worker outputs.
//!
//! Each candidate gets a score in 0-100: a weighted sum over test pass
//! rate, a composite quality score, code size (smaller is better) and
//! per-category review scores. The weights and the confidence bands are
//! configuration, not learned.
//!
//! | criterion       | input                          | default weight |
//! |-----------------|--------------------------------|----------------|
//! | tests           | `test_pass_rate` (0-1)         | 0.30           |
//! | quality         | `quality_score` (0-100)        | 0.20           |
//! | simplicity      | `1000 / (1000 + lines_of_code)`| 0.10           |
//! | security        | security reviews               | 0.15           |
//! | review_quality  | quality reviews                | 0.10           |
//! | compliance      | compliance reviews             | 0.10           |
//! | accessibility   | accessibility reviews          | 0.05           |
//!
//! A candidate without reviews in a category scores 50 there.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

const TIE_EPSILON: f64 = 1e-9;
const MISSING_REVIEW_SCORE: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Tests,
    Quality,
    Simplicity,
    Security,
    ReviewQuality,
    Compliance,
    Accessibility,
}

impl Criterion {
    pub const ALL: [Criterion; 7] = [
        Self::Tests,
        Self::Quality,
        Self::Simplicity,
        Self::Security,
        Self::ReviewQuality,
        Self::Compliance,
        Self::Accessibility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tests => "tests",
            Self::Quality => "quality",
            Self::Simplicity => "simplicity",
            Self::Security => "security",
            Self::ReviewQuality => "review_quality",
            Self::Compliance => "compliance",
            Self::Accessibility => "accessibility",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Tests => "test pass rate",
            Self::Quality => "code quality",
            Self::Simplicity => "code size",
            Self::Security => "security review",
            Self::ReviewQuality => "quality review",
            Self::Compliance => "compliance review",
            Self::Accessibility => "accessibility review",
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review categories that feed the review criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewCategory {
    Security,
    Quality,
    Compliance,
    Accessibility,
}

impl ReviewCategory {
    fn criterion(&self) -> Criterion {
        match self {
            Self::Security => Criterion::Security,
            Self::Quality => Criterion::ReviewQuality,
            Self::Compliance => Criterion::Compliance,
            Self::Accessibility => Criterion::Accessibility,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriteriaWeights {
    #[serde(default = "default_tests_weight")]
    pub tests: f64,
    #[serde(default = "default_quality_weight")]
    pub quality: f64,
    #[serde(default = "default_simplicity_weight")]
    pub simplicity: f64,
    #[serde(default = "default_security_weight")]
    pub security: f64,
    #[serde(default = "default_review_quality_weight")]
    pub review_quality: f64,
    #[serde(default = "default_compliance_weight")]
    pub compliance: f64,
    #[serde(default = "default_accessibility_weight")]
    pub accessibility: f64,
}

fn default_tests_weight() -> f64 {
    0.30
}

fn default_quality_weight() -> f64 {
    0.20
}

fn default_simplicity_weight() -> f64 {
    0.10
}

fn default_security_weight() -> f64 {
    0.15
}

fn default_review_quality_weight() -> f64 {
    0.10
}

fn default_compliance_weight() -> f64 {
    0.10
}

fn default_accessibility_weight() -> f64 {
    0.05
}

impl Default for CriteriaWeights {
    fn default() -> Self {
        Self {
            tests: default_tests_weight(),
            quality: default_quality_weight(),
            simplicity: default_simplicity_weight(),
            security: default_security_weight(),
            review_quality: default_review_quality_weight(),
            compliance: default_compliance_weight(),
            accessibility: default_accessibility_weight(),
        }
    }
}

impl CriteriaWeights {
    pub fn weight(&self, criterion: Criterion) -> f64 {
        match criterion {
            Criterion::Tests => self.tests,
            Criterion::Quality => self.quality,
            Criterion::Simplicity => self.simplicity,
            Criterion::Security => self.security,
            Criterion::ReviewQuality => self.review_quality,
            Criterion::Compliance => self.compliance,
            Criterion::Accessibility => self.accessibility,
        }
    }
}

/// `[arbitration]` section of pipewright.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationConfig {
    #[serde(default)]
    pub weights: CriteriaWeights,
    /// Margin at or above which confidence is high
    #[serde(default = "default_high_margin")]
    pub high_margin: f64,
    /// Margin at or above which confidence is medium
    #[serde(default = "default_low_margin")]
    pub low_margin: f64,
}

fn default_high_margin() -> f64 {
    15.0
}

fn default_low_margin() -> f64 {
    5.0
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            weights: CriteriaWeights::default(),
            high_margin: default_high_margin(),
            low_margin: default_low_margin(),
        }
    }
}

/// One worker's output, as the arbiter sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    /// Fraction of tests passing, 0-1
    pub test_pass_rate: f64,
    /// Composite quality score, 0-100
    pub quality_score: f64,
    pub lines_of_code: u64,
}

impl Candidate {
    pub fn new(id: &str, test_pass_rate: f64, quality_score: f64, lines_of_code: u64) -> Self {
        Self {
            id: id.to_string(),
            test_pass_rate,
            quality_score,
            lines_of_code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub candidate_id: String,
    pub category: ReviewCategory,
    /// 0-100
    pub score: f64,
}

impl ReviewRecord {
    pub fn new(candidate_id: &str, category: ReviewCategory, score: f64) -> Self {
        Self {
            candidate_id: candidate_id.to_string(),
            category,
            score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A candidate's total and its per-criterion weighted contributions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub candidate_id: String,
    pub total: f64,
    pub breakdown: BTreeMap<Criterion, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationResult {
    pub winner: String,
    pub winner_score: f64,
    pub margin: f64,
    pub confidence: Confidence,
    pub reasoning: String,
    pub scores: Vec<CandidateScore>,
}

#[derive(Debug, Clone, Default)]
pub struct Arbiter {
    config: ArbitrationConfig,
}

impl Arbiter {
    pub fn new(config: ArbitrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    /// Weighted score for one candidate.
    pub fn score(&self, candidate: &Candidate, reviews: &[ReviewRecord]) -> CandidateScore {
        let weights = &self.config.weights;
        let mut breakdown = BTreeMap::new();
        for criterion in Criterion::ALL {
            let raw = raw_value(criterion, candidate, reviews);
            breakdown.insert(criterion, raw * weights.weight(criterion));
        }
        CandidateScore {
            candidate_id: candidate.id.clone(),
            total: breakdown.values().sum(),
            breakdown,
        }
    }

    pub fn confidence_for(&self, margin: f64) -> Confidence {
        if margin < TIE_EPSILON {
            Confidence::Low
        } else if margin >= self.config.high_margin {
            Confidence::High
        } else if margin >= self.config.low_margin {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    pub fn select_winner(
        &self,
        candidate_a: &Candidate,
        candidate_b: &Candidate,
        reviews: &[ReviewRecord],
    ) -> ArbitrationResult {
        let score_a = self.score(candidate_a, reviews);
        let score_b = self.score(candidate_b, reviews);
        let margin = (score_a.total - score_b.total).abs();
        let tied = margin < TIE_EPSILON;

        let a_wins = if tied {
            candidate_a.id <= candidate_b.id
        } else {
            score_a.total > score_b.total
        };
        let (winner, loser) = if a_wins {
            (&score_a, &score_b)
        } else {
            (&score_b, &score_a)
        };

        let confidence = self.confidence_for(margin);
        let reasoning = if tied {
            format!(
                "Scores tied at {:.1}; '{}' selected by identifier",
                winner.total, winner.candidate_id
            )
        } else {
            explain(winner, loser, margin, confidence)
        };
        debug!(
            winner = %winner.candidate_id,
            winner_score = winner.total,
            margin,
            %confidence,
            "Arbitration decided"
        );

        ArbitrationResult {
            winner: winner.candidate_id.clone(),
            winner_score: winner.total,
            margin,
            confidence,
            reasoning,
            scores: vec![score_a.clone(), score_b.clone()],
        }
    }
}

/// Arbitrate with the default weights and confidence bands.
pub fn select_winner(
    candidate_a: &Candidate,
    candidate_b: &Candidate,
    reviews: &[ReviewRecord],
) -> ArbitrationResult {
    Arbiter::default().select_winner(candidate_a, candidate_b, reviews)
}

/// Unweighted criterion value on a 0-100 scale.
fn raw_value(criterion: Criterion, candidate: &Candidate, reviews: &[ReviewRecord]) -> f64 {
    match criterion {
        Criterion::Tests => candidate.test_pass_rate.clamp(0.0, 1.0) * 100.0,
        Criterion::Quality => candidate.quality_score.clamp(0.0, 100.0),
        Criterion::Simplicity => 1000.0 / (1000.0 + candidate.lines_of_code as f64) * 100.0,
        review => {
            let scores: Vec<f64> = reviews
                .iter()
                .filter(|r| r.candidate_id == candidate.id && r.category.criterion() == review)
                .map(|r| r.score.clamp(0.0, 100.0))
                .collect();
            if scores.is_empty() {
                MISSING_REVIEW_SCORE
            } else {
                scores.iter().sum::<f64>() / scores.len() as f64
            }
        }
    }
}

fn explain(
    winner: &CandidateScore,
    loser: &CandidateScore,
    margin: f64,
    confidence: Confidence,
) -> String {
    let mut contributions: Vec<(Criterion, f64)> = winner
        .breakdown
        .iter()
        .map(|(criterion, value)| {
            let other = loser.breakdown.get(criterion).copied().unwrap_or(0.0);
            (*criterion, value - other)
        })
        .filter(|(_, delta)| *delta > TIE_EPSILON)
        .collect();
    contributions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let drivers: Vec<String> = contributions
        .iter()
        .take(2)
        .map(|(criterion, delta)| format!("{} (+{:.1})", criterion.label(), delta))
        .collect();

    format!(
        "'{}' wins by {:.1} points ({} confidence); largest contributions: {}",
        winner.candidate_id,
        margin,
        confidence,
        drivers.join(", ")
    )
}
