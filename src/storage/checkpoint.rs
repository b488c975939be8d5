use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crawler::task::Target;
use crate::error::CrawlError;

/// Persisted crawl progress
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckpointState {
    /// Completed target identifiers in completion order
    pub completed: Vec<String>,

    /// Targets found mid-crawl, re-queued on resume
    #[serde(default)]
    pub discovered: Vec<Target>,
}

/// File-backed checkpoint. Every mutation is written through before it returns.
pub struct CheckpointStore {
    path: PathBuf,
    state: CheckpointState,
    done: HashSet<String>,
    known: HashSet<String>,
}

fn checkpoint_error(path: &Path, source: io::Error) -> CrawlError {
    CrawlError::Checkpoint {
        path: path.display().to_string(),
        source,
    }
}

impl CheckpointStore {
    /// Load prior progress, or start empty when no checkpoint exists yet
    pub fn load(path: &Path) -> Result<Self, CrawlError> {
        let state = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| checkpoint_error(path, e))?;
            let state: CheckpointState = serde_json::from_str(&contents).map_err(|e| {
                checkpoint_error(path, io::Error::new(io::ErrorKind::InvalidData, e))
            })?;
            info!(
                "Resuming from {}: {} targets completed, {} discovered",
                path.display(),
                state.completed.len(),
                state.discovered.len()
            );
            state
        } else {
            debug!("No checkpoint at {}, starting fresh", path.display());
            CheckpointState::default()
        };

        let done = state.completed.iter().cloned().collect();
        let known = state.discovered.iter().map(|t| t.id.clone()).collect();
        Ok(Self {
            path: path.to_path_buf(),
            state,
            done,
            known,
        })
    }

    pub fn is_done(&self, target_id: &str) -> bool {
        self.done.contains(target_id)
    }

    #[cfg(test)]
    pub fn completed_count(&self) -> usize {
        self.state.completed.len()
    }

    /// Targets discovered by earlier runs or earlier in this run
    pub fn discovered(&self) -> &[Target] {
        &self.state.discovered
    }

    /// Record a completed target. Marking the same target twice is a no-op.
    pub fn mark_done(&mut self, target_id: &str) -> Result<(), CrawlError> {
        self.complete(target_id, Vec::new())
    }

    /// Record a completed target together with the targets it led to, in one write
    pub fn complete(&mut self, target_id: &str, discovered: Vec<Target>) -> Result<(), CrawlError> {
        let mut changed = false;
        for target in discovered {
            if self.known.insert(target.id.clone()) {
                self.state.discovered.push(target);
                changed = true;
            }
        }
        if self.done.insert(target_id.to_string()) {
            self.state.completed.push(target_id.to_string());
            changed = true;
        }
        if changed {
            self.persist()?;
        }
        Ok(())
    }

    /// Write to a sibling temp file and rename over the checkpoint
    fn persist(&self) -> Result<(), CrawlError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| checkpoint_error(&self.path, e))?;
            }
        }
        let contents = serde_json::to_string_pretty(&self.state)
            .map_err(|e| checkpoint_error(&self.path, io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, contents).map_err(|e| checkpoint_error(&self.path, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| checkpoint_error(&self.path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::generator::SearchEngine;

    #[test]
    fn test_first_run_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::load(&dir.path().join("checkpoint.json")).unwrap();
        assert_eq!(store.completed_count(), 0);
        assert!(!store.is_done("https://a.example/"));
    }

    #[test]
    fn test_mark_done_is_idempotent_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("checkpoint.json");

        let mut store = CheckpointStore::load(&path).unwrap();
        store.mark_done("https://a.example/").unwrap();
        store.mark_done("https://a.example/").unwrap();
        store.mark_done("https://b.example/").unwrap();
        assert!(store.is_done("https://a.example/"));

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            written["completed"],
            serde_json::json!(["https://a.example/", "https://b.example/"])
        );

        let reloaded = CheckpointStore::load(&path).unwrap();
        assert_eq!(reloaded.completed_count(), 2);
        assert!(reloaded.is_done("https://b.example/"));
    }

    #[test]
    fn test_discovered_targets_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let query = Target::query("church autism Tampa", SearchEngine::DuckDuckGo);
        let found = Target::discovered("https://grace.example/", &query);

        let mut store = CheckpointStore::load(&path).unwrap();
        store.complete(&query.id, vec![found.clone(), found.clone()]).unwrap();

        let reloaded = CheckpointStore::load(&path).unwrap();
        assert_eq!(reloaded.discovered(), &[found]);
        assert!(reloaded.is_done("church autism Tampa"));
    }

    #[test]
    fn test_failed_write_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut store = CheckpointStore::load(&path).unwrap();

        // The rename onto a directory fails
        fs::create_dir(&path).unwrap();
        let err = store.mark_done("https://a.example/").err().unwrap();
        assert!(matches!(err, CrawlError::Checkpoint { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_discovered_targets_carry_no_completion_flag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let query = Target::query("church autism Miami", SearchEngine::Bing);
        let found = Target::discovered("https://hope.example/", &query);
        let mut store = CheckpointStore::load(&path).unwrap();
        store.complete(&query.id, vec![found.clone()]).unwrap();
        store.mark_done(&found.id).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(written["discovered"][0].get("completed").is_none());
        assert!(CheckpointStore::load(&path).unwrap().is_done("https://hope.example/"));
    }

    #[test]
    fn test_corrupt_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, "{not json").unwrap();

        let err = CheckpointStore::load(&path).err().unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_accepts_completed_only_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, r#"{"completed": ["x", "y"]}"#).unwrap();

        let store = CheckpointStore::load(&path).unwrap();
        assert!(store.is_done("y"));
        assert!(store.discovered().is_empty());
    }
}
