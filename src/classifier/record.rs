use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Keep,
    Review,
    Reject,
    /// Nothing to classify: no website, or the site could not be fetched
    NoSource,
}

impl Decision {
    pub const ALL: [Decision; 4] = [
        Decision::Keep,
        Decision::Review,
        Decision::Reject,
        Decision::NoSource,
    ];

    /// Label used in stats documents
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Keep => "KEEP",
            Decision::Review => "REVIEW",
            Decision::Reject => "REJECT",
            Decision::NoSource => "NO_SOURCE",
        }
    }

    /// Suffix of the output file family
    pub fn family(&self) -> &'static str {
        match self {
            Decision::Keep => "keep",
            Decision::Review => "review",
            Decision::Reject => "reject",
            Decision::NoSource => "no_source",
        }
    }

    pub fn from_family(family: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.family() == family.to_lowercase() || d.as_str() == family.to_uppercase())
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Confidence {
    High,
    Medium,
    Low,
    None,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Confidence::High => "HIGH",
            Confidence::Medium => "MEDIUM",
            Confidence::Low => "LOW",
            Confidence::None => "NONE",
        };
        f.write_str(label)
    }
}

/// Durable output of one classification. Never updated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassificationRecord {
    /// Identifier of the classified target
    pub target: String,

    /// Ruleset that produced the record
    pub ruleset: String,

    /// Hit category -> example matches
    pub matches: BTreeMap<String, Vec<String>>,

    pub score: i32,

    pub decision: Decision,

    pub confidence: Confidence,

    pub rationale: String,
}

impl ClassificationRecord {
    /// Record for a target that produced no text to classify
    pub fn no_source(target: &str, ruleset: &str, rationale: &str) -> Self {
        Self {
            target: target.to_string(),
            ruleset: ruleset.to_string(),
            matches: BTreeMap::new(),
            score: 0,
            decision: Decision::NoSource,
            confidence: Confidence::None,
            rationale: rationale.to_string(),
        }
    }

    /// Evidence flattened for tabular output
    pub fn evidence(&self) -> String {
        self.matches
            .iter()
            .map(|(category, examples)| format!("{}: {}", category, examples.join(", ")))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}
