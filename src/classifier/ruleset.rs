use serde::{Deserialize, Serialize};

use crate::classifier::record::{Confidence, Decision};

/// Whether a category's weight counts for or against relevance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Confirming,
    Disqualifying,
}

impl Polarity {
    pub fn sign(&self) -> i32 {
        match self {
            Polarity::Confirming => 1,
            Polarity::Disqualifying => -1,
        }
    }
}

impl Default for Polarity {
    fn default() -> Self {
        Polarity::Confirming
    }
}

/// A single pattern, optionally voided when another pattern appears later in the text.
///
/// `not_followed_by` mirrors a trailing negative look-ahead: the pattern only counts at a match
/// position after which none of the listed patterns occur.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PatternSpec {
    Plain(String),
    Guarded {
        pattern: String,
        #[serde(default)]
        not_followed_by: Vec<String>,
    },
}

impl PatternSpec {
    pub fn pattern(&self) -> &str {
        match self {
            PatternSpec::Plain(pattern) => pattern,
            PatternSpec::Guarded { pattern, .. } => pattern,
        }
    }

    pub fn guards(&self) -> &[String] {
        match self {
            PatternSpec::Plain(_) => &[],
            PatternSpec::Guarded { not_followed_by, .. } => not_followed_by,
        }
    }
}

impl From<&str> for PatternSpec {
    fn from(pattern: &str) -> Self {
        PatternSpec::Plain(pattern.to_string())
    }
}

/// Word-proximity rule: a word matching `anchors` with a match for `near` within `window` words
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Proximity {
    pub anchors: Vec<String>,
    pub near: Vec<String>,
    #[serde(default = "default_window")]
    pub window: usize,
}

fn default_window() -> usize {
    25
}

/// One weighted category of evidence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryRule {
    pub name: String,

    #[serde(default)]
    pub patterns: Vec<PatternSpec>,

    /// Magnitude applied once when the category is hit; the sign comes from `polarity`
    pub weight: i32,

    #[serde(default)]
    pub polarity: Polarity,

    /// A hit rejects the text outright, whatever else matched
    #[serde(default)]
    pub hard_exclusion: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proximity: Option<Proximity>,
}

impl CategoryRule {
    pub fn confirming(name: &str, weight: i32, patterns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            patterns: patterns.iter().map(|p| PatternSpec::from(*p)).collect(),
            weight,
            polarity: Polarity::Confirming,
            hard_exclusion: false,
            proximity: None,
        }
    }

    pub fn disqualifying(name: &str, weight: i32, patterns: &[&str]) -> Self {
        Self {
            polarity: Polarity::Disqualifying,
            ..Self::confirming(name, weight, patterns)
        }
    }

    pub fn hard_exclusion(name: &str, weight: i32, patterns: Vec<PatternSpec>) -> Self {
        Self {
            name: name.to_string(),
            patterns,
            weight,
            polarity: Polarity::Disqualifying,
            hard_exclusion: true,
            proximity: None,
        }
    }

    /// Weight with the polarity applied
    pub fn signed_weight(&self) -> i32 {
        self.polarity.sign() * self.weight.abs()
    }
}

/// Score cut point. Cuts are evaluated from the highest `min_score` down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionCut {
    pub min_score: i32,
    pub decision: Decision,
    pub confidence: Confidence,
}

impl DecisionCut {
    pub fn new(min_score: i32, decision: Decision, confidence: Confidence) -> Self {
        Self {
            min_score,
            decision,
            confidence,
        }
    }
}

/// A named classification task expressed as data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ruleset {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub categories: Vec<CategoryRule>,

    pub cuts: Vec<DecisionCut>,

    /// Example matches kept per hit category
    #[serde(default = "default_max_evidence")]
    pub max_evidence: usize,
}

fn default_max_evidence() -> usize {
    3
}
