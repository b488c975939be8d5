use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::browser::FingerprintManager;
use crate::classifier::{ClassificationRecord, CompiledRuleset};
use crate::cli::config::{CrawlerConfig, CrawlerSettings};
use crate::crawler::extract::{ContactExtractor, ContactInfo};
use crate::crawler::fetcher::{PageSource, RateLimitedFetcher};
use crate::crawler::generator::SearchEngine;
use crate::crawler::page::{search_results, select_links, Page};
use crate::crawler::scheduler::Scheduler;
use crate::crawler::task::{FetchResult, Target, TargetKind};
use crate::storage::checkpoint::CheckpointStore;
use crate::storage::sink::{FlushSummary, ResultRow, ResultSink};
use crate::utils::metrics::RunMetrics;
use crate::utils::normalize::url_key;

/// What one run did
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    /// Targets processed in this run
    pub processed: usize,

    /// Targets skipped because they were already complete
    pub skipped: usize,

    /// Site targets found on search results and listings
    pub discovered: usize,

    /// Set when `max_targets` stopped the run before the queue was empty
    pub stopped_early: bool,

    pub results: FlushSummary,
}

/// Sequential run loop: generator targets in, classified rows out.
///
/// One target is fetched, classified and checkpointed at a time.
pub struct CrawlerController<S: PageSource> {
    settings: CrawlerSettings,
    max_results: usize,
    fetcher: RateLimitedFetcher<S>,
    ruleset: CompiledRuleset,
    scheduler: Scheduler,
    extractor: ContactExtractor,
    checkpoint: CheckpointStore,
    sink: ResultSink,
    metrics: RunMetrics,
    metrics_path: PathBuf,
}

/// Sites are compared without scheme, `www.` or trailing slash
fn site_key(target: &Target) -> String {
    target
        .url()
        .and_then(|url| url_key(&url))
        .unwrap_or_else(|| target.id.clone())
}

impl<S: PageSource> CrawlerController<S> {
    /// Wire up a run. Fails when the checkpoint or earlier output cannot be read.
    pub fn new(source: S, config: &CrawlerConfig, ruleset: CompiledRuleset) -> Result<Self> {
        let identities = FingerprintManager::new(config.identities.clone())?;
        let checkpoint = CheckpointStore::load(&config.output.checkpoint_path())?;
        let sink = ResultSink::open(&config.output.dir, &config.output.prefix)?;
        let metrics_path = config
            .output
            .dir
            .join(format!("{}_metrics.json", config.output.prefix));

        info!(
            "Classifying with ruleset '{}', writing to {}",
            ruleset.name(),
            config.output.dir.display()
        );

        Ok(Self {
            settings: config.crawler.clone(),
            max_results: config.search.max_results,
            fetcher: RateLimitedFetcher::new(source, config.fetcher.clone(), identities),
            ruleset,
            scheduler: Scheduler::new(config.crawler.clone()),
            extractor: ContactExtractor::new()?,
            checkpoint,
            sink,
            metrics: RunMetrics::new(),
            metrics_path,
        })
    }

    #[cfg(test)]
    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.metrics
    }

    /// Work through `targets`, then anything earlier runs discovered but did not finish
    pub async fn run(&mut self, targets: Vec<Target>) -> Result<RunSummary> {
        let mut queued = HashSet::new();
        let mut sites = HashSet::new();
        let mut queue = VecDeque::new();
        let resumed = self.checkpoint.discovered().to_vec();
        for target in targets.into_iter().chain(resumed) {
            if !queued.insert(target.id.clone()) {
                continue;
            }
            if target.is_site() && target.url().is_some() && !sites.insert(site_key(&target)) {
                continue;
            }
            queue.push_back(target);
        }

        info!(
            "Queued {} targets ({} already complete)",
            queue.len(),
            queue.iter().filter(|t| self.checkpoint.is_done(&t.id)).count()
        );

        let mut summary = RunSummary::default();
        while let Some(target) = queue.pop_front() {
            if self.checkpoint.is_done(&target.id) {
                summary.skipped += 1;
                continue;
            }
            if self
                .settings
                .max_targets
                .map_or(false, |max| summary.processed >= max)
            {
                info!("Reached max_targets, stopping with {} targets left", queue.len() + 1);
                summary.stopped_early = true;
                break;
            }

            // Any result row is journaled by the sink before the target is checkpointed
            let found: Vec<Target> = self
                .process(&target)
                .await?
                .into_iter()
                .filter(|t| queued.insert(t.id.clone()) && sites.insert(site_key(t)))
                .collect();
            summary.discovered += found.len();

            if found.is_empty() {
                self.checkpoint.mark_done(&target.id)?;
            } else {
                // Completion and discoveries land in one checkpoint write
                self.checkpoint.complete(&target.id, found.clone())?;
            }
            queue.extend(found);
            summary.processed += 1;

            if summary.processed % self.settings.flush_every.max(1) == 0 {
                debug!("Flushing {} new rows", self.sink.pending());
                let flushed = self.sink.flush()?;
                info!(
                    "Progress: {} targets processed, {} results, {} queued",
                    summary.processed,
                    flushed.total,
                    queue.len()
                );
            }
        }

        summary.results = self.sink.flush()?;
        self.metrics.targets += summary.processed;
        self.metrics.skipped += summary.skipped;
        self.metrics.discovered += summary.discovered;
        self.metrics.finish(self.fetcher.stats().clone());
        self.metrics.save(&self.metrics_path)?;

        info!(
            "Run finished: {} processed, {} skipped, {} discovered, {} results",
            summary.processed, summary.skipped, summary.discovered, summary.results.total
        );
        info!(
            "{} fetches, {} ms average",
            self.metrics.fetches(),
            self.metrics.average_fetch_ms()
        );
        Ok(summary)
    }

    /// Handle one target; returns the site targets it led to.
    /// Only a failure to record the result is an error.
    async fn process(&mut self, target: &Target) -> Result<Vec<Target>> {
        let found = match &target.kind {
            TargetKind::Site { .. } => {
                self.process_site(target).await?;
                Vec::new()
            }
            TargetKind::Query { query, engine } => {
                let engine: SearchEngine = *engine;
                let url = engine.search_url(query);
                let result = self.fetch(&url).await;
                if !result.is_success() {
                    warn!("Search '{}' on {} failed: {}", query, engine.name(), describe(&result));
                    return Ok(Vec::new());
                }
                let links = search_results(&result.content, engine, self.max_results);
                if links.is_empty() {
                    debug!("Search '{}' on {} returned no results", query, engine.name());
                }
                links.iter().map(|link| Target::discovered(link, target)).collect()
            }
            TargetKind::Listing { url, link_selector } => {
                let result = self.fetch(url).await;
                if !result.is_success() {
                    warn!("Listing {} failed: {}", url, describe(&result));
                    return Ok(Vec::new());
                }
                let base = result.final_url.as_deref().unwrap_or(url);
                match select_links(&result.content, base, link_selector) {
                    Ok(links) => {
                        debug!("Listing {} yielded {} links", url, links.len());
                        links.iter().map(|link| Target::discovered(link, target)).collect()
                    }
                    Err(e) => {
                        warn!("Listing {}: {}", url, e);
                        Vec::new()
                    }
                }
            }
        };
        Ok(found)
    }

    async fn fetch(&mut self, url: &str) -> FetchResult {
        let result = self.fetcher.fetch(url).await;
        self.metrics.record_fetch(&result);
        result
    }

    /// Fetch a site's main page and subpages, classify the combined text, add one row
    async fn process_site(&mut self, target: &Target) -> Result<()> {
        let record = target.record().cloned();
        let mut row = ResultRow {
            target: target.id.clone(),
            record_id: record.as_ref().and_then(|r| r.id.clone()),
            name: record.as_ref().map(|r| r.name.clone()).filter(|n| !n.is_empty()),
            city: record.as_ref().and_then(|r| r.city.clone()),
            state: record.as_ref().and_then(|r| r.state.clone()),
            url: target.url(),
            final_url: None,
            title: None,
            phone: record.as_ref().and_then(|r| r.phone.clone()),
            email: None,
            address: record.as_ref().and_then(|r| r.address.clone()),
            source: target.source.clone(),
            fetch_status: None,
            pages_scanned: 0,
            classification: ClassificationRecord::no_source(&target.id, self.ruleset.name(), "no website"),
            crawled_at: Utc::now(),
        };

        if let Some(url) = target.url() {
            let main = self.fetch(&url).await;
            row.fetch_status = Some(main.status);

            if main.is_success() {
                let final_url = main.final_url.clone().unwrap_or_else(|| url.clone());
                let page = Page::parse(&main.content, &final_url);
                let mut contact = self.extractor.extract(&page);
                let mut texts = vec![page.text.clone()];
                row.pages_scanned = 1;

                self.scheduler.start_site(&final_url);
                for subpage in self.scheduler.subpages(&final_url, &page.links) {
                    let result = self.fetch(&subpage).await;
                    if !result.is_success() {
                        debug!("Subpage {} skipped: {}", subpage, describe(&result));
                        continue;
                    }
                    let sub = Page::parse(&result.content, &subpage);
                    contact.merge(self.extractor.extract(&sub));
                    texts.push(sub.text);
                    row.pages_scanned += 1;
                }

                if contact.is_empty() {
                    debug!("No contact details found on {}", final_url);
                }
                row.classification = self.ruleset.classify(&target.id, &texts.join(" "));
                row.final_url = Some(final_url);
                row.title = page.title;
                self.apply_contact(&mut row, contact);
            } else {
                let reason = format!("fetch failed: {}", describe(&main));
                if let Some(error) = main.error() {
                    debug!("{} ({})", reason, error);
                }
                row.classification = ClassificationRecord::no_source(&target.id, self.ruleset.name(), &reason);
            }
        }

        if row.name.is_none() {
            row.name = row.title.clone();
        }

        let record = &row.classification;
        info!(
            "{} -> {} ({}, score {})",
            target.id, record.decision, record.confidence, record.score
        );
        self.metrics.record_decision(record.decision);
        self.sink.add(row)
    }

    /// Fill contact columns the input row left empty
    fn apply_contact(&self, row: &mut ResultRow, contact: ContactInfo) {
        if row.phone.is_none() {
            row.phone = contact.phone;
        }
        if row.address.is_none() {
            row.address = contact.address;
        }
        row.email = contact.email;
    }
}

fn describe(result: &FetchResult) -> String {
    match (&result.detail, result.http_status) {
        (Some(detail), _) => format!("{} ({})", result.status.as_str(), detail),
        (None, Some(code)) => format!("{} (HTTP {})", result.status.as_str(), code),
        (None, None) => result.status.as_str().to_string(),
    }
}
