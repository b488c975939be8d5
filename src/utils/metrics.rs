use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classifier::Decision;
use crate::crawler::fetcher::FetcherStats;
use crate::crawler::task::FetchResult;

/// Run metrics written next to the result files
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    /// Start time of the run
    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Targets processed in this run
    pub targets: usize,

    /// Targets skipped because an earlier run completed them
    pub skipped: usize,

    /// Site targets found on search results and listings
    pub discovered: usize,

    /// Fetch outcome counts by status
    pub fetch_statuses: BTreeMap<String, usize>,

    /// HTTP status code counts
    pub http_statuses: BTreeMap<u16, usize>,

    /// Requests spent, retries included
    pub attempts: u64,

    /// Bytes downloaded
    pub bytes_downloaded: usize,

    /// Time spent fetching, pauses included
    pub fetch_ms_total: u64,

    pub fetch_ms_max: u64,

    pub decisions: BTreeMap<Decision, usize>,

    pub fetcher: FetcherStats,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            targets: 0,
            skipped: 0,
            discovered: 0,
            fetch_statuses: BTreeMap::new(),
            http_statuses: BTreeMap::new(),
            attempts: 0,
            bytes_downloaded: 0,
            fetch_ms_total: 0,
            fetch_ms_max: 0,
            decisions: BTreeMap::new(),
            fetcher: FetcherStats::default(),
        }
    }
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one fetch outcome
    pub fn record_fetch(&mut self, result: &FetchResult) {
        *self
            .fetch_statuses
            .entry(result.status.as_str().to_string())
            .or_default() += 1;
        if let Some(code) = result.http_status {
            *self.http_statuses.entry(code).or_default() += 1;
        }
        self.attempts += u64::from(result.attempts);
        self.bytes_downloaded += result.content.len();
        self.fetch_ms_total += result.elapsed_ms;
        self.fetch_ms_max = self.fetch_ms_max.max(result.elapsed_ms);
    }

    pub fn record_decision(&mut self, decision: Decision) {
        *self.decisions.entry(decision).or_default() += 1;
    }

    /// Total fetches recorded
    pub fn fetches(&self) -> usize {
        self.fetch_statuses.values().sum()
    }

    pub fn average_fetch_ms(&self) -> u64 {
        match self.fetches() {
            0 => 0,
            n => self.fetch_ms_total / n as u64,
        }
    }

    /// Stamp the finish time and attach the fetcher counters
    pub fn finish(&mut self, fetcher: FetcherStats) {
        self.fetcher = fetcher;
        self.finished_at = Some(Utc::now());
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize metrics")?;
        fs::write(path, json).context(format!("Failed to write metrics: {}", path.display()))?;
        Ok(())
    }
}
