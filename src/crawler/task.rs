use serde::{Serialize, Deserialize};

use crate::crawler::generator::SearchEngine;
use crate::error::CrawlError;
use crate::storage::input::InputRecord;

/// What a target asks the run loop to do
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetKind {
    /// A provider website to fetch and classify
    Site {
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record: Option<InputRecord>,
    },

    /// A search-engine query whose result links become new site targets
    Query {
        query: String,
        engine: SearchEngine,
    },

    /// A directory listing page whose provider links become new site targets
    Listing {
        url: String,
        link_selector: String,
    },
}

/// A unit of crawl work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Target {
    /// The URL or query text; the checkpoint and dedup key
    pub id: String,

    pub kind: TargetKind,

    /// Directory, search engine or input file that produced this target
    #[serde(default)]
    pub source: Option<String>,

    /// Target whose page led to this one (None for generated targets)
    #[serde(default)]
    pub parent: Option<String>,
}

impl Target {
    /// Site target for an input row. Rows without a website are keyed by their natural key.
    pub fn from_record(record: InputRecord, source: &str) -> Self {
        let id = record
            .website
            .clone()
            .unwrap_or_else(|| record.natural_key());
        Self {
            id,
            kind: TargetKind::Site {
                url: record.website.clone(),
                record: Some(record),
            },
            source: Some(source.to_string()),
            parent: None,
        }
    }

    /// Site target found on another target's page
    pub fn discovered(url: &str, parent: &Target) -> Self {
        Self {
            id: url.to_string(),
            kind: TargetKind::Site {
                url: Some(url.to_string()),
                record: None,
            },
            source: parent.source.clone(),
            parent: Some(parent.id.clone()),
        }
    }

    pub fn query(query: &str, engine: SearchEngine) -> Self {
        Self {
            id: query.to_string(),
            kind: TargetKind::Query {
                query: query.to_string(),
                engine,
            },
            source: Some(engine.name().to_string()),
            parent: None,
        }
    }

    pub fn listing(url: &str, link_selector: &str, source: &str) -> Self {
        Self {
            id: url.to_string(),
            kind: TargetKind::Listing {
                url: url.to_string(),
                link_selector: link_selector.to_string(),
            },
            source: Some(source.to_string()),
            parent: None,
        }
    }

    /// URL to fetch, if the target has one
    pub fn url(&self) -> Option<String> {
        match &self.kind {
            TargetKind::Site { url, .. } => url.clone(),
            TargetKind::Query { query, engine } => Some(engine.search_url(query)),
            TargetKind::Listing { url, .. } => Some(url.clone()),
        }
    }

    /// Input row behind a site target
    pub fn record(&self) -> Option<&InputRecord> {
        match &self.kind {
            TargetKind::Site { record, .. } => record.as_ref(),
            _ => None,
        }
    }

    /// Whether the target is classified, as opposed to expanded into more targets
    pub fn is_site(&self) -> bool {
        matches!(self.kind, TargetKind::Site { .. })
    }
}

/// Outcome category of a fetch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Success,
    NotFound,
    RateLimited,
    Blocked,
    Timeout,
    Error,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Success => "success",
            FetchStatus::NotFound => "not_found",
            FetchStatus::RateLimited => "rate_limited",
            FetchStatus::Blocked => "blocked",
            FetchStatus::Timeout => "timeout",
            FetchStatus::Error => "error",
        }
    }

    /// Map a failed status onto the error taxonomy
    pub fn error_kind(&self, detail: &str) -> Option<CrawlError> {
        let detail = detail.to_string();
        match self {
            FetchStatus::Success => None,
            FetchStatus::NotFound => Some(CrawlError::PermanentNotFound(detail)),
            FetchStatus::RateLimited | FetchStatus::Blocked => Some(CrawlError::RateLimited(detail)),
            FetchStatus::Timeout | FetchStatus::Error => Some(CrawlError::TransientNetwork(detail)),
        }
    }
}

/// Result of attempting to retrieve a target. Consumed immediately, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub status: FetchStatus,

    /// Response body, empty on failure
    pub content: String,

    /// URL after redirects
    pub final_url: Option<String>,

    /// HTTP status of the last response, if one arrived
    pub http_status: Option<u16>,

    pub detail: Option<String>,

    /// Requests spent on this fetch
    pub attempts: u32,

    /// Time spent, pauses included
    pub elapsed_ms: u64,
}

impl FetchResult {
    pub fn success(content: String, final_url: String, http_status: u16) -> Self {
        Self {
            status: FetchStatus::Success,
            content,
            final_url: Some(final_url),
            http_status: Some(http_status),
            detail: None,
            attempts: 0,
            elapsed_ms: 0,
        }
    }

    pub fn failure(status: FetchStatus, http_status: Option<u16>, detail: impl Into<String>) -> Self {
        Self {
            status,
            content: String::new(),
            final_url: None,
            http_status,
            detail: Some(detail.into()),
            attempts: 0,
            elapsed_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == FetchStatus::Success
    }

    /// Taxonomy error for a failed fetch
    pub fn error(&self) -> Option<CrawlError> {
        self.status
            .error_kind(self.detail.as_deref().unwrap_or(self.status.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(website: Option<&str>) -> InputRecord {
        InputRecord {
            row: 3,
            id: Some("42".to_string()),
            name: "Harbor Church".to_string(),
            website: website.map(|s| s.to_string()),
            phone: Some("407-555-0134".to_string()),
            city: Some("Orlando".to_string()),
            state: Some("FL".to_string()),
            address: None,
            fields: BTreeMap::new(),
        }
    }

    #[test]
    fn test_record_target_ids() {
        let with_site = Target::from_record(record(Some("https://harbor.example/")), "input.csv");
        assert_eq!(with_site.id, "https://harbor.example/");
        assert_eq!(with_site.url().as_deref(), Some("https://harbor.example/"));

        let without_site = Target::from_record(record(None), "input.csv");
        assert_eq!(without_site.id, "phone:4075550134");
        assert_eq!(without_site.url(), None);
        assert!(without_site.is_site());
    }

    #[test]
    fn test_discovered_target_keeps_lineage() {
        let query = Target::query("church autism Miami", SearchEngine::Bing);
        let site = Target::discovered("https://grace.example/", &query);
        assert_eq!(site.parent.as_deref(), Some("church autism Miami"));
        assert_eq!(site.source.as_deref(), Some("bing"));
        assert!(!query.is_site());
    }

    #[test]
    fn test_target_serialization_is_tagged() {
        let listing = Target::listing("https://dir.example/?page=2", "a.listing", "dir");
        let json = serde_json::to_value(&listing).unwrap();
        assert_eq!(json["kind"]["type"], "listing");
        let back: Target = serde_json::from_value(json).unwrap();
        assert_eq!(back, listing);
    }

    #[test]
    fn test_status_maps_to_taxonomy() {
        assert!(FetchStatus::Success.error_kind("").is_none());
        assert!(matches!(
            FetchStatus::Blocked.error_kind("403"),
            Some(CrawlError::RateLimited(_))
        ));
        assert!(matches!(
            FetchStatus::NotFound.error_kind("404"),
            Some(CrawlError::PermanentNotFound(_))
        ));
        assert!(matches!(
            FetchResult::failure(FetchStatus::Timeout, None, "timed out").error(),
            Some(CrawlError::TransientNetwork(_))
        ));
    }
}
