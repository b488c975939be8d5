use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classifier::{ClassificationRecord, Decision};
use crate::crawler::task::FetchStatus;
use crate::utils::normalize::natural_key;

const CSV_HEADERS: &[&str] = &[
    "target", "record_id", "name", "city", "state", "url", "final_url", "title", "phone", "email",
    "address", "source", "fetch_status", "pages_scanned", "decision", "confidence", "score",
    "rationale", "evidence", "crawled_at",
];

/// One classified target, as written to the output files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultRow {
    pub target: String,

    /// Identifier from the input file, if the target came from one
    #[serde(default)]
    pub record_id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub city: Option<String>,

    #[serde(default)]
    pub state: Option<String>,

    /// Website as listed or discovered
    #[serde(default)]
    pub url: Option<String>,

    /// Website after redirects
    #[serde(default)]
    pub final_url: Option<String>,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub phone: Option<String>,

    #[serde(default)]
    pub email: Option<String>,

    #[serde(default)]
    pub address: Option<String>,

    /// Directory, engine or input file that produced the target
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub fetch_status: Option<FetchStatus>,

    #[serde(default)]
    pub pages_scanned: usize,

    pub classification: ClassificationRecord,

    pub crawled_at: DateTime<Utc>,
}

impl ResultRow {
    pub fn decision(&self) -> Decision {
        self.classification.decision
    }

    /// URL, phone, then name and city; the target identifier as a last resort
    pub fn natural_key(&self) -> String {
        natural_key(
            self.url.as_deref(),
            self.phone.as_deref(),
            self.name.as_deref().unwrap_or(""),
            self.city.as_deref().unwrap_or(""),
        )
        .unwrap_or_else(|| format!("target:{}", self.target))
    }

    fn csv_record(&self) -> Vec<String> {
        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        vec![
            self.target.clone(),
            text(&self.record_id),
            text(&self.name),
            text(&self.city),
            text(&self.state),
            text(&self.url),
            text(&self.final_url),
            text(&self.title),
            text(&self.phone),
            text(&self.email),
            text(&self.address),
            text(&self.source),
            self.fetch_status.map(|s| s.as_str().to_string()).unwrap_or_default(),
            self.pages_scanned.to_string(),
            self.classification.decision.to_string(),
            self.classification.confidence.to_string(),
            self.classification.score.to_string(),
            self.classification.rationale.clone(),
            self.classification.evidence(),
            self.crawled_at.to_rfc3339(),
        ]
    }
}

/// What one flush wrote
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct FlushSummary {
    pub counts: BTreeMap<Decision, usize>,
    pub total: usize,
    pub duplicates: usize,
}

/// Accumulates result rows and writes one file family per decision.
///
/// Every added row is appended to `<prefix>_pending.jsonl` before `add` returns, so rows not yet
/// flushed survive a crash and are replayed by the next `open`.
pub struct ResultSink {
    dir: PathBuf,
    prefix: String,
    rows: Vec<ResultRow>,
    pending: usize,
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents).context(format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).context(format!("Failed to replace {}", path.display()))?;
    Ok(())
}

impl ResultSink {
    /// Open the sink, picking up rows written by an earlier run with the same prefix
    pub fn open(dir: &Path, prefix: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .context(format!("Failed to create output directory: {}", dir.display()))?;

        let mut sink = Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            rows: Vec::new(),
            pending: 0,
        };
        for decision in Decision::ALL {
            let path = sink.json_path(decision);
            if path.exists() {
                let rows = Self::read_rows(&path)?;
                debug!("Loaded {} earlier rows from {}", rows.len(), path.display());
                sink.rows.extend(rows);
            }
        }
        let journaled = sink.replay_journal()?;
        if journaled > 0 {
            info!("Recovered {} unflushed rows from {}", journaled, sink.journal_path().display());
        }
        sink.pending = journaled;
        if !sink.rows.is_empty() {
            info!("Continuing {} with {} earlier rows", prefix, sink.rows.len());
        }
        Ok(sink)
    }

    /// Read a family JSON file
    pub fn read_rows(path: &Path) -> Result<Vec<ResultRow>> {
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read results file: {}", path.display()))?;
        serde_json::from_str(&contents)
            .context(format!("Failed to parse results file: {}", path.display()))
    }

    pub fn json_path(&self, decision: Decision) -> PathBuf {
        self.dir.join(format!("{}_{}.json", self.prefix, decision.family()))
    }

    pub fn csv_path(&self, decision: Decision) -> PathBuf {
        self.dir.join(format!("{}_{}.csv", self.prefix, decision.family()))
    }

    pub fn stats_path(&self) -> PathBuf {
        self.dir.join(format!("{}_stats.json", self.prefix))
    }

    /// Rows added since the last flush, one JSON document per line
    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(format!("{}_pending.jsonl", self.prefix))
    }

    /// Load journaled rows. A torn last line from an interrupted write is dropped.
    fn replay_journal(&mut self) -> Result<usize> {
        let path = self.journal_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).context(format!("Failed to read journal: {}", path.display()));
            }
        };

        let mut replayed = 0;
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ResultRow>(line) {
                Ok(row) => {
                    self.rows.push(row);
                    replayed += 1;
                }
                Err(e) => warn!("Skipping unreadable line {} of {}: {}", n + 1, path.display(), e),
            }
        }
        Ok(replayed)
    }

    /// Journal the row, then buffer it until the next flush
    pub fn add(&mut self, row: ResultRow) -> Result<()> {
        let path = self.journal_path();
        let mut line = serde_json::to_string(&row).context("Failed to serialize result row")?;
        line.push('\n');

        let mut journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!("Failed to open journal: {}", path.display()))?;
        journal
            .write_all(line.as_bytes())
            .and_then(|_| journal.sync_data())
            .context(format!("Failed to append to journal: {}", path.display()))?;

        self.rows.push(row);
        self.pending += 1;
        Ok(())
    }

    /// Rows added since the last flush
    pub fn pending(&self) -> usize {
        self.pending
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Rows in insertion order with later duplicates of a natural key dropped
    pub fn deduplicated(&self) -> Vec<&ResultRow> {
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .filter(|row| seen.insert(row.natural_key()))
            .collect()
    }

    /// Deduplicate and rewrite every output family plus the stats document
    pub fn flush(&mut self) -> Result<FlushSummary> {
        let unique = self.deduplicated();
        let mut summary = FlushSummary {
            counts: BTreeMap::new(),
            total: unique.len(),
            duplicates: self.rows.len() - unique.len(),
        };

        for decision in Decision::ALL {
            let family: Vec<&ResultRow> = unique
                .iter()
                .copied()
                .filter(|row| row.decision() == decision)
                .collect();
            summary.counts.insert(decision, family.len());

            let json = serde_json::to_vec_pretty(&family)
                .context("Failed to serialize results")?;
            write_atomic(&self.json_path(decision), &json)?;

            let mut writer = csv::Writer::from_writer(Vec::new());
            writer.write_record(CSV_HEADERS)?;
            for row in &family {
                writer.write_record(row.csv_record())?;
            }
            let csv = writer
                .into_inner()
                .map_err(|e| anyhow::anyhow!("Failed to finish CSV output: {}", e))?;
            write_atomic(&self.csv_path(decision), &csv)?;
        }

        let mut stats = serde_json::Map::new();
        for (decision, count) in &summary.counts {
            stats.insert(decision.as_str().to_string(), (*count).into());
        }
        stats.insert("total".to_string(), summary.total.into());
        stats.insert("duplicates".to_string(), summary.duplicates.into());
        let stats = serde_json::to_vec_pretty(&serde_json::Value::Object(stats))
            .context("Failed to serialize stats")?;
        write_atomic(&self.stats_path(), &stats)?;

        // Journaled rows are now in the family files
        match fs::remove_file(self.journal_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).context(format!(
                    "Failed to clear journal: {}",
                    self.journal_path().display()
                ));
            }
        }
        self.pending = 0;
        debug!(
            "Flushed {} rows ({} duplicates dropped) to {}",
            summary.total,
            summary.duplicates,
            self.dir.display()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Confidence;

    fn row(target: &str, name: &str, phone: Option<&str>, decision: Decision) -> ResultRow {
        let mut classification = ClassificationRecord::no_source(target, "church-ministry", "no website");
        classification.decision = decision;
        classification.confidence = Confidence::Medium;
        ResultRow {
            target: target.to_string(),
            record_id: None,
            name: Some(name.to_string()),
            city: Some("Miami".to_string()),
            state: Some("FL".to_string()),
            url: None,
            final_url: None,
            title: None,
            phone: phone.map(|p| p.to_string()),
            email: None,
            address: None,
            source: Some("input.csv".to_string()),
            fetch_status: None,
            pages_scanned: 0,
            classification,
            crawled_at: Utc::now(),
        }
    }

    #[test]
    fn test_flush_dedupes_by_phone() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ResultSink::open(dir.path(), "churches").unwrap();
        sink.add(row("a", "Grace Church", Some("(305) 555-0100"), Decision::Keep)).unwrap();
        sink.add(row("b", "  GRACE church", Some("305.555.0100"), Decision::Review)).unwrap();
        sink.add(row("c", "Hope Church", None, Decision::Keep)).unwrap();

        let summary = sink.flush().unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.counts[&Decision::Keep], 2);
        assert_eq!(summary.counts[&Decision::Review], 0);

        let keep = ResultSink::read_rows(&sink.json_path(Decision::Keep)).unwrap();
        assert_eq!(keep.len(), 2);
        assert_eq!(keep[0].target, "a");
        assert!(ResultSink::read_rows(&sink.json_path(Decision::Review)).unwrap().is_empty());
    }

    #[test]
    fn test_flush_writes_stats_and_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ResultSink::open(dir.path(), "aba").unwrap();
        sink.add(row("a", "Sunrise ABA", Some("305-555-0101"), Decision::Keep)).unwrap();
        sink.add(row("b", "No Site", Some("305-555-0102"), Decision::NoSource)).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.pending(), 0);

        let stats: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(sink.stats_path()).unwrap()).unwrap();
        assert_eq!(stats["KEEP"], 1);
        assert_eq!(stats["NO_SOURCE"], 1);
        assert_eq!(stats["REJECT"], 0);
        assert_eq!(stats["total"], 2);

        let csv = fs::read_to_string(sink.csv_path(Decision::NoSource)).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("target,record_id,name"));
        assert!(lines.next().unwrap().contains("NO_SOURCE"));
        assert!(dir.path().join("aba_no_source.json").exists());
    }

    #[test]
    fn test_unflushed_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sink = ResultSink::open(dir.path(), "run").unwrap();
            sink.add(row("a", "Grace Church", Some("305-555-0100"), Decision::Keep)).unwrap();
            sink.add(row("b", "Hope Church", Some("305-555-0199"), Decision::Reject)).unwrap();
            assert!(sink.journal_path().exists());
        }

        let mut sink = ResultSink::open(dir.path(), "run").unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.pending(), 2);
        let summary = sink.flush().unwrap();
        assert_eq!(summary.counts[&Decision::Keep], 1);
        assert_eq!(summary.counts[&Decision::Reject], 1);
        assert!(!sink.journal_path().exists());

        let sink = ResultSink::open(dir.path(), "run").unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.pending(), 0);
    }

    #[test]
    fn test_torn_journal_line_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sink = ResultSink::open(dir.path(), "run").unwrap();
            sink.add(row("a", "Grace Church", Some("305-555-0100"), Decision::Keep)).unwrap();
        }
        let journal = dir.path().join("run_pending.jsonl");
        let mut contents = fs::read_to_string(&journal).unwrap();
        contents.push_str("{\"target\": \"b\", \"na");
        fs::write(&journal, contents).unwrap();

        let sink = ResultSink::open(dir.path(), "run").unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.deduplicated()[0].target, "a");
    }

    #[test]
    fn test_reopen_extends_earlier_output() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sink = ResultSink::open(dir.path(), "run").unwrap();
            sink.add(row("a", "Grace Church", Some("305-555-0100"), Decision::Keep)).unwrap();
            sink.flush().unwrap();
        }

        let mut sink = ResultSink::open(dir.path(), "run").unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.pending(), 0);
        sink.add(row("a2", "Grace Church Miami", Some("305-555-0100"), Decision::Reject)).unwrap();
        sink.add(row("b", "Hope Church", Some("305-555-0199"), Decision::Reject)).unwrap();
        let summary = sink.flush().unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.counts[&Decision::Keep], 1);
        assert_eq!(summary.counts[&Decision::Reject], 1);
    }
}
