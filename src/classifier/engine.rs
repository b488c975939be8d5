use std::collections::BTreeMap;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::classifier::record::{ClassificationRecord, Confidence, Decision};
use crate::classifier::ruleset::{CategoryRule, DecisionCut, PatternSpec, Proximity, Ruleset};
use crate::error::CrawlError;
use crate::utils::normalize::normalize_text;

/// Regex pattern plus the patterns that void it when they follow the match
struct CompiledPattern {
    regex: Regex,
    not_followed_by: Vec<Regex>,
}

impl CompiledPattern {
    /// First match position after which no guard matches
    fn find<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.regex
            .find_iter(text)
            .find(|m| {
                let rest = &text[m.end()..];
                !self.not_followed_by.iter().any(|guard| guard.is_match(rest))
            })
            .map(|m| m.as_str())
    }
}

struct CompiledProximity {
    anchors: Vec<Regex>,
    near: Vec<Regex>,
    window: usize,
}

impl CompiledProximity {
    fn find(&self, words: &[&str], limit: usize) -> Vec<String> {
        let mut hits = Vec::new();
        for (i, word) in words.iter().enumerate() {
            if !self.anchors.iter().any(|anchor| anchor.is_match(word)) {
                continue;
            }
            let start = i.saturating_sub(self.window);
            let end = (i + self.window).min(words.len());
            let context = words[start..end].join(" ");
            if let Some(found) = self.near.iter().find_map(|near| near.find(&context)) {
                let evidence = format!("{} ~ {}", word, found.as_str());
                if !hits.contains(&evidence) {
                    hits.push(evidence);
                }
                if hits.len() >= limit {
                    break;
                }
            }
        }
        hits
    }
}

struct CompiledCategory {
    name: String,
    patterns: Vec<CompiledPattern>,
    proximity: Option<CompiledProximity>,
    signed_weight: i32,
    hard_exclusion: bool,
}

impl CompiledCategory {
    /// Example matches for this category, empty when the category is not hit
    fn evidence(&self, text: &str, words: &[&str], limit: usize) -> Vec<String> {
        let limit = limit.max(1);
        let mut found: Vec<String> = Vec::new();

        for pattern in &self.patterns {
            if let Some(m) = pattern.find(text) {
                let m = m.to_string();
                if !found.contains(&m) {
                    found.push(m);
                }
                if found.len() >= limit {
                    return found;
                }
            }
        }

        if let Some(proximity) = &self.proximity {
            for hit in proximity.find(words, limit - found.len()) {
                found.push(hit);
                if found.len() >= limit {
                    break;
                }
            }
        }

        found
    }
}

/// A ruleset whose patterns have been compiled and validated.
///
/// Holds no mutable state, so classifying the same text twice always yields the same record.
pub struct CompiledRuleset {
    name: String,
    categories: Vec<CompiledCategory>,
    cuts: Vec<DecisionCut>,
    max_evidence: usize,
}

fn compile_regex(pattern: &str, ruleset: &str, category: &str) -> Result<Regex, CrawlError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| {
            CrawlError::config(format!(
                "ruleset '{}', category '{}': invalid pattern '{}': {}",
                ruleset, category, pattern, e
            ))
        })
}

fn compile_all(patterns: &[String], ruleset: &str, category: &str) -> Result<Vec<Regex>, CrawlError> {
    patterns
        .iter()
        .map(|p| compile_regex(p, ruleset, category))
        .collect()
}

fn compile_category(rule: &CategoryRule, ruleset: &str) -> Result<CompiledCategory, CrawlError> {
    if rule.patterns.is_empty() && rule.proximity.is_none() {
        return Err(CrawlError::config(format!(
            "ruleset '{}', category '{}': no patterns",
            ruleset, rule.name
        )));
    }
    if rule.hard_exclusion && rule.polarity.sign() > 0 {
        return Err(CrawlError::config(format!(
            "ruleset '{}', category '{}': hard exclusions must be disqualifying",
            ruleset, rule.name
        )));
    }

    let patterns = rule
        .patterns
        .iter()
        .map(|spec: &PatternSpec| -> Result<CompiledPattern, CrawlError> {
            Ok(CompiledPattern {
                regex: compile_regex(spec.pattern(), ruleset, &rule.name)?,
                not_followed_by: compile_all(spec.guards(), ruleset, &rule.name)?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let proximity = match &rule.proximity {
        Some(Proximity { anchors, near, window }) => Some(CompiledProximity {
            anchors: compile_all(anchors, ruleset, &rule.name)?,
            near: compile_all(near, ruleset, &rule.name)?,
            window: *window,
        }),
        None => None,
    };

    Ok(CompiledCategory {
        name: rule.name.clone(),
        patterns,
        proximity,
        signed_weight: rule.signed_weight(),
        hard_exclusion: rule.hard_exclusion,
    })
}

impl CompiledRuleset {
    pub fn compile(ruleset: &Ruleset) -> Result<Self, CrawlError> {
        if ruleset.name.trim().is_empty() {
            return Err(CrawlError::config("ruleset without a name"));
        }
        if ruleset.cuts.iter().any(|cut| cut.decision == Decision::NoSource) {
            return Err(CrawlError::config(format!(
                "ruleset '{}': NO_SOURCE is reserved for missing content",
                ruleset.name
            )));
        }

        let categories = ruleset
            .categories
            .iter()
            .map(|rule| compile_category(rule, &ruleset.name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut cuts = ruleset.cuts.clone();
        cuts.sort_by(|a, b| b.min_score.cmp(&a.min_score));

        debug!(
            "Compiled ruleset '{}' with {} categories",
            ruleset.name,
            categories.len()
        );

        Ok(Self {
            name: ruleset.name.clone(),
            categories,
            cuts,
            max_evidence: ruleset.max_evidence,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Classify `text` on behalf of `target`
    pub fn classify(&self, target: &str, text: &str) -> ClassificationRecord {
        let text = normalize_text(text);
        if text.is_empty() {
            return ClassificationRecord::no_source(target, &self.name, "no content");
        }
        let words: Vec<&str> = text.split(' ').collect();

        // Hard exclusions win regardless of declaration order or positive evidence
        for category in self.categories.iter().filter(|c| c.hard_exclusion) {
            let evidence = category.evidence(&text, &words, self.max_evidence);
            if !evidence.is_empty() {
                let mut matches = BTreeMap::new();
                matches.insert(category.name.clone(), evidence);
                return ClassificationRecord {
                    target: target.to_string(),
                    ruleset: self.name.clone(),
                    matches,
                    score: category.signed_weight,
                    decision: Decision::Reject,
                    confidence: Confidence::High,
                    rationale: format!("hard exclusion: {}", category.name),
                };
            }
        }

        let mut matches = BTreeMap::new();
        let mut contributions = Vec::new();
        let mut score = 0;

        for category in self.categories.iter().filter(|c| !c.hard_exclusion) {
            let evidence = category.evidence(&text, &words, self.max_evidence);
            if evidence.is_empty() {
                continue;
            }
            // One hit per category, however many of its patterns matched
            score += category.signed_weight;
            contributions.push(format!("{}({:+})", category.name, category.signed_weight));
            matches.insert(category.name.clone(), evidence);
        }

        let (decision, confidence) = self.decide(score);
        let rationale = if contributions.is_empty() {
            format!("score {}: no matching categories", score)
        } else {
            format!("score {}: {}", score, contributions.join(", "))
        };

        ClassificationRecord {
            target: target.to_string(),
            ruleset: self.name.clone(),
            matches,
            score,
            decision,
            confidence,
            rationale,
        }
    }

    /// Map a score onto the configured cuts
    pub fn decide(&self, score: i32) -> (Decision, Confidence) {
        self.cuts
            .iter()
            .find(|cut| score >= cut.min_score)
            .map(|cut| (cut.decision, cut.confidence))
            .unwrap_or(if score < 0 {
                (Decision::Reject, Confidence::High)
            } else {
                (Decision::Reject, Confidence::Low)
            })
    }
}
