use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::classifier::{presets, Decision};
use crate::cli::config::CrawlerConfig;
use crate::cli::{PushMode, RunArgs};
use crate::crawler::controller::{CrawlerController, RunSummary};
use crate::crawler::fetcher::HttpPageSource;
use crate::crawler::generator::{listing_targets, record_targets, search_targets};
use crate::crawler::page::Page;
use crate::crawler::task::Target;
use crate::error::CrawlError;
use crate::storage::datastore::RestDatastore;
use crate::storage::input::InputTable;
use crate::storage::reconcile::{parse_assignments, PushSummary, Reconciler};
use crate::storage::sink::ResultSink;
use crate::utils::metrics::RunMetrics;

/// Apply command line overrides to the loaded configuration and check the result
fn apply_run_args(config: &mut CrawlerConfig, run: &RunArgs) -> Result<(), CrawlError> {
    if let Some(dir) = &run.output {
        config.output.dir = dir.clone();
    }
    if let Some(prefix) = &run.prefix {
        config.output.prefix = prefix.clone();
    }
    if let Some(limit) = run.limit {
        config.crawler.max_targets = Some(limit);
    }
    config.validate()
}

/// Run the crawl loop over `targets` against the live web
async fn run_crawl(config: &CrawlerConfig, ruleset: Option<&str>, targets: Vec<Target>) -> Result<()> {
    let ruleset = config.compiled_ruleset(ruleset)?;
    let source = HttpPageSource::new(config.fetcher.timeout())?;
    let mut controller = CrawlerController::new(source, config, ruleset)?;

    let summary = controller.run(targets).await?;
    print_summary(config, &summary, controller.metrics());
    Ok(())
}

fn print_summary(config: &CrawlerConfig, summary: &RunSummary, metrics: &RunMetrics) {
    println!("Processed: {}", summary.processed);
    println!("Skipped (already complete): {}", summary.skipped);
    println!("Discovered: {}", summary.discovered);
    println!(
        "Fetches: {} ({} ms average, {} bytes)",
        metrics.fetches(),
        metrics.average_fetch_ms(),
        metrics.bytes_downloaded
    );
    println!("Results:");
    for decision in Decision::ALL {
        let count = summary.results.counts.get(&decision).copied().unwrap_or(0);
        println!("  {:<10} {}", decision.as_str(), count);
    }
    println!("  {:<10} {}", "TOTAL", summary.results.total);
    if summary.stopped_early {
        println!("Stopped at the target limit; run again to continue.");
    }
    println!("Output: {}", config.output.dir.display());
}

/// Classify the website of every input row
pub async fn verify(mut config: CrawlerConfig, input: &Path, run: &RunArgs) -> Result<()> {
    apply_run_args(&mut config, run)?;
    let table = InputTable::load(input)?;
    let source = input
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| input.display().to_string());

    let targets = record_targets(&table, &source);
    info!("Prepared {} site targets from {} rows", targets.len(), table.records.len());
    run_crawl(&config, run.ruleset.as_deref(), targets).await
}

/// Search-engine crawl over the configured vocabularies
pub async fn search(mut config: CrawlerConfig, run: &RunArgs, max_queries: Option<usize>) -> Result<()> {
    apply_run_args(&mut config, run)?;
    if let Some(max) = max_queries {
        config.search.max_queries = Some(max);
    }
    let targets = search_targets(&config.search);
    if targets.is_empty() {
        return Err(CrawlError::config(
            "no search queries: configure search.locations, entities, accommodations and templates",
        )
        .into());
    }
    run_crawl(&config, run.ruleset.as_deref(), targets).await
}

/// Crawl the configured directory listings
pub async fn directory(mut config: CrawlerConfig, run: &RunArgs) -> Result<()> {
    apply_run_args(&mut config, run)?;
    if config.directories.is_empty() {
        return Err(CrawlError::config("no directories configured in the profile").into());
    }
    let targets = listing_targets(&config.directories);
    run_crawl(&config, run.ruleset.as_deref(), targets).await
}

/// Classify a local file and print the record as JSON
pub fn classify(config: &CrawlerConfig, file: &Path, ruleset: Option<&str>) -> Result<()> {
    let ruleset = config.compiled_ruleset(ruleset)?;
    let contents = fs::read_to_string(file)
        .context(format!("Failed to read {}", file.display()))?;

    let is_html = file
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm"))
        || contents.trim_start().starts_with('<');
    let text = if is_html {
        Page::parse(&contents, &format!("file://{}", file.display())).text
    } else {
        contents
    };

    let record = ruleset.classify(&file.display().to_string(), &text);
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

/// Write `input` to `output` without rows sharing a natural key
pub fn dedupe(input: &Path, output: &Path) -> Result<()> {
    let table = InputTable::load(input)?;
    let deduped = table.dedupe();
    deduped.write(output)?;

    println!(
        "Kept {} of {} rows ({} duplicates removed)",
        deduped.records.len(),
        table.records.len(),
        table.records.len() - deduped.records.len()
    );
    Ok(())
}

/// Push one decision family of a results file to the datastore
pub async fn push(
    config: &CrawlerConfig,
    results: &Path,
    mode: PushMode,
    assignments: &[String],
    family: &str,
) -> Result<()> {
    let decision = Decision::from_family(family)
        .ok_or_else(|| CrawlError::config(format!("unknown decision family '{}'", family)))?;
    let payload = parse_assignments(assignments)?;
    if mode == PushMode::Update && assignments.is_empty() {
        return Err(CrawlError::config("update mode needs at least one --set column=value").into());
    }

    let rows: Vec<_> = ResultSink::read_rows(results)?
        .into_iter()
        .filter(|row| row.decision() == decision)
        .collect();
    if rows.is_empty() {
        warn!("No {} rows in {}", decision, results.display());
        return Ok(());
    }

    let store = RestDatastore::from_env(&config.datastore)?;
    let reconciler = Reconciler::new(&store, &config.datastore);
    let summary = match mode {
        PushMode::Update => reconciler.update_matches(&rows, &payload).await?,
        PushMode::Insert => reconciler.insert_rows(&rows, &payload).await?,
    };
    print_push_summary(&summary);
    Ok(())
}

fn print_push_summary(summary: &PushSummary) {
    println!("Rows: {}", summary.rows);
    if summary.matched + summary.unmatched > 0 {
        println!("Matched: {} (unmatched {})", summary.matched, summary.unmatched);
        println!("Updated providers: {}", summary.updated);
    } else {
        println!("Inserted: {}", summary.inserted);
        println!("Skipped duplicates: {}", summary.skipped);
    }
    println!("Failed: {}", summary.failed);
    println!("Batches: {}", summary.batches);
}

/// List rulesets, or print one as YAML
pub fn rules(config: &CrawlerConfig, name: Option<&str>) -> Result<()> {
    match name {
        Some(name) => {
            let ruleset = config.ruleset(Some(name))?;
            print!("{}", serde_yaml::to_string(&ruleset)?);
        }
        None => {
            println!("Built-in rulesets:");
            for ruleset in presets::all() {
                println!("  {:<26} {}", ruleset.name, ruleset.description);
            }
            if !config.classifier.rulesets.is_empty() {
                println!("Profile rulesets:");
                for ruleset in &config.classifier.rulesets {
                    println!("  {:<26} {}", ruleset.name, ruleset.description);
                }
            }
            println!("Selected: {}", config.classifier.ruleset);
        }
    }
    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a configuration profile, creating it from the defaults if it does not exist
pub fn manage_profile(profile_name: &str) -> Result<()> {
    match CrawlerConfig::load_profile(profile_name) {
        Ok(config) => {
            println!("# Profile: {}", profile_name);
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = CrawlerConfig::default();
            let path = config.save_as_profile(profile_name)?;
            println!("Created default profile: {}", path.display());
        }
    }

    Ok(())
}

/// Show the current configuration
pub fn show_config(config: &CrawlerConfig) -> Result<()> {
    println!("# Current configuration");
    print!("{}", serde_yaml::to_string(config)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_run_args_override_config() {
        let mut config = CrawlerConfig::default();
        let run = RunArgs {
            ruleset: None,
            output: Some(PathBuf::from("out")),
            prefix: Some("aba".to_string()),
            limit: Some(5),
        };
        apply_run_args(&mut config, &run).unwrap();
        assert_eq!(config.output.dir, PathBuf::from("out"));
        assert_eq!(config.output.checkpoint_path(), PathBuf::from("out/aba_checkpoint.json"));
        assert_eq!(config.crawler.max_targets, Some(5));
    }

    #[test]
    fn test_run_args_are_validated() {
        let mut config = CrawlerConfig::default();
        let run = RunArgs {
            prefix: Some("   ".to_string()),
            ..RunArgs::default()
        };
        let err = apply_run_args(&mut config, &run).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("output.prefix"));
    }

    #[test]
    fn test_dedupe_command_writes_unique_rows() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        fs::write(
            &input,
            "name,phone,city\nGrace Church,305-555-0100,Miami\ngrace church,(305) 555-0100,Miami\nHope,,Tampa\n",
        )
        .unwrap();

        dedupe(&input, &output).unwrap();
        let written = InputTable::load(&output).unwrap();
        assert_eq!(written.records.len(), 2);
        assert_eq!(written.headers, vec!["name", "phone", "city"]);
    }

    #[tokio::test]
    async fn test_push_rejects_update_without_assignments() {
        let dir = tempfile::tempdir().unwrap();
        let results = dir.path().join("run_keep.json");
        fs::write(&results, "[]").unwrap();

        let err = push(&CrawlerConfig::default(), &results, PushMode::Update, &[], "keep")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--set"));
    }

    #[test]
    fn test_missing_input_is_a_configuration_error() {
        let err = InputTable::load(Path::new("/nonexistent/providers.csv")).unwrap_err();
        let crawl = err.downcast_ref::<CrawlError>().unwrap();
        assert!(crawl.is_fatal());
    }
}
