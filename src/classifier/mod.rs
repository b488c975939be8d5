//! Weighted-pattern relevance classification.

pub mod engine;
pub mod presets;
pub mod record;
pub mod ruleset;

pub use engine::CompiledRuleset;
pub use record::{ClassificationRecord, Confidence, Decision};
pub use ruleset::Ruleset;
