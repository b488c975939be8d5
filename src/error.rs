use thiserror::Error;

/// Failure taxonomy shared by the fetcher, the datastore client and the run loop.
///
/// Per-target failures (`TransientNetwork`, `RateLimited`, `PermanentNotFound`, `ParseFailure`,
/// `DatastoreConflict`) are recorded and the run continues. `Configuration` and `Checkpoint`
/// abort the whole run.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Timeout, connection reset, broken redirect chain or a 5xx answer
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Explicit throttling (HTTP 429), a 403 block or a bot-challenge page
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The target does not exist or a search produced nothing
    #[error("not found: {0}")]
    PermanentNotFound(String),

    /// Fetched content could not be interpreted
    #[error("could not parse content: {0}")]
    ParseFailure(String),

    /// Duplicate-key rejection on insert
    #[error("datastore rejected duplicate key: {0}")]
    DatastoreConflict(String),

    /// Missing credentials, missing input, invalid profile or ruleset
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The checkpoint document could not be persisted
    #[error("checkpoint write failed for {path}: {source}")]
    Checkpoint {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl CrawlError {
    /// Whether this error should stop the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, CrawlError::Configuration(_) | CrawlError::Checkpoint { .. })
    }

    /// Whether the same call may succeed if repeated after a pause
    pub fn is_retryable(&self) -> bool {
        matches!(self, CrawlError::TransientNetwork(_) | CrawlError::RateLimited(_))
    }

    pub fn config(message: impl Into<String>) -> Self {
        CrawlError::Configuration(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_configuration_and_checkpoint_are_fatal() {
        assert!(CrawlError::config("missing SUPABASE_URL").is_fatal());
        assert!(CrawlError::Checkpoint {
            path: "checkpoint.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        }
        .is_fatal());

        assert!(!CrawlError::RateLimited("429".into()).is_fatal());
        assert!(!CrawlError::DatastoreConflict("providers_pkey".into()).is_fatal());
        assert!(!CrawlError::ParseFailure("bad selector".into()).is_fatal());
    }

    #[test]
    fn only_network_and_throttling_are_retryable() {
        assert!(CrawlError::TransientNetwork("503".into()).is_retryable());
        assert!(CrawlError::RateLimited("429".into()).is_retryable());
        assert!(!CrawlError::DatastoreConflict("providers_pkey".into()).is_retryable());
        assert!(!CrawlError::config("401").is_retryable());
    }
}
