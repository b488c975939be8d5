use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, debug, error};

use crate::classifier::{presets, CompiledRuleset, Ruleset};
use crate::crawler::generator::SearchEngine;
use crate::error::CrawlError;

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CrawlerConfig {
    pub crawler: CrawlerSettings,
    pub fetcher: FetcherSettings,
    pub identities: Vec<BrowserFingerprint>,
    pub classifier: ClassifierSettings,
    pub search: SearchSettings,
    pub directories: Vec<DirectorySource>,
    pub output: OutputSettings,
    pub datastore: DatastoreSettings,
}

/// Run loop settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CrawlerSettings {
    /// Flush the sink after this many completed targets
    pub flush_every: usize,

    /// Stop after this many targets have been processed in one run
    pub max_targets: Option<usize>,

    /// Extra same-host pages fetched per site
    pub max_subpages: usize,

    /// Paths tried on every site regardless of its links
    pub probe_paths: Vec<String>,

    /// On-page links containing one of these fragments are scanned as subpages
    pub link_hints: Vec<String>,

    pub url_patterns: UrlPatterns,
}

/// URL pattern settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct UrlPatterns {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Pacing, retry and circuit-breaker settings for the fetcher. Durations are in milliseconds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct FetcherSettings {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Extended pause and identity rotation after this many requests
    pub rotate_every: u64,
    pub long_cooldown_ms: u64,

    /// Pause taken on the first rate-limit signal of a fetch
    pub rate_limit_cooldown_ms: u64,

    /// Requests allowed per fetch, first attempt included
    pub max_attempts: u32,
    pub backoff_base_ms: u64,

    /// Consecutive terminal failures that trip the circuit breaker
    pub circuit_threshold: u32,
    pub circuit_pause_ms: u64,

    pub timeout_ms: u64,

    /// Lower-cased body fragments that identify a bot challenge
    pub challenge_markers: Vec<String>,
}

impl FetcherSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn long_cooldown(&self) -> Duration {
        Duration::from_millis(self.long_cooldown_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    pub fn circuit_pause(&self) -> Duration {
        Duration::from_millis(self.circuit_pause_ms)
    }

    /// Exponential backoff for the given (1-based) attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Browser fingerprint settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BrowserFingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    pub platform: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

/// Ruleset selection
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Name of the ruleset used when the command line does not choose one
    pub ruleset: String,

    /// Inline rulesets; these override built-ins with the same name
    pub rulesets: Vec<Ruleset>,
}

/// Search query generation
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SearchSettings {
    pub engines: Vec<SearchEngine>,

    /// Templates over `{entity}`, `{accommodation}` and `{location}`
    pub templates: Vec<String>,
    pub locations: Vec<String>,
    pub entities: Vec<String>,
    pub accommodations: Vec<String>,

    pub max_queries: Option<usize>,

    /// Result links kept per query
    pub max_results: usize,
}

/// A paginated directory listing
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DirectorySource {
    pub name: String,

    /// Listing URL; `{page}` is replaced with each page number
    pub url_template: String,

    #[serde(default = "default_first_page")]
    pub first_page: u32,

    /// Last page (inclusive). Without it the template is fetched once.
    #[serde(default)]
    pub last_page: Option<u32>,

    /// CSS selector for the provider links on each listing page
    pub link_selector: String,
}

fn default_first_page() -> u32 {
    1
}

/// Output and checkpoint locations
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct OutputSettings {
    pub dir: PathBuf,
    pub prefix: String,
    pub checkpoint: Option<PathBuf>,
}

impl OutputSettings {
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint
            .clone()
            .unwrap_or_else(|| self.dir.join(format!("{}_checkpoint.json", self.prefix)))
    }
}

/// Hosted datastore settings. Credentials are read from the named environment variables.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DatastoreSettings {
    pub url_env: String,
    pub key_env: String,
    pub table: String,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub timeout_ms: u64,

    /// Attempts per request when the datastore answers 429, 5xx or times out
    pub max_attempts: u32,

    /// First retry delay, doubled on every further attempt
    pub retry_backoff_ms: u64,
}

impl DatastoreSettings {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            flush_every: 25,
            max_targets: None,
            max_subpages: 5,
            probe_paths: vec![
                "/about".to_string(),
                "/about-us".to_string(),
                "/services".to_string(),
                "/ministries".to_string(),
                "/programs".to_string(),
            ],
            link_hints: vec![
                "about".to_string(),
                "service".to_string(),
                "program".to_string(),
                "minist".to_string(),
                "therap".to_string(),
                "special".to_string(),
                "access".to_string(),
            ],
            url_patterns: UrlPatterns {
                include: vec![],
                exclude: vec![
                    r"(?i)\.(jpg|jpeg|png|gif|svg|webp|pdf|css|js|zip|mp3|mp4)$".to_string(),
                    r"^mailto:".to_string(),
                    r"^tel:".to_string(),
                ],
            },
        }
    }
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            min_delay_ms: 3_000,
            max_delay_ms: 8_000,
            rotate_every: 50,
            long_cooldown_ms: 60_000,
            rate_limit_cooldown_ms: 60_000,
            max_attempts: 3,
            backoff_base_ms: 2_000,
            circuit_threshold: 5,
            circuit_pause_ms: 180_000,
            timeout_ms: 15_000,
            challenge_markers: vec![
                "unusual traffic".to_string(),
                "verify you are human".to_string(),
                "are you a robot".to_string(),
                "captcha-delivery".to_string(),
                "cf-chl-".to_string(),
            ],
        }
    }
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            ruleset: "church-ministry".to_string(),
            rulesets: vec![],
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            engines: vec![SearchEngine::DuckDuckGo, SearchEngine::Bing],
            templates: strings(&[
                "{entity} {accommodation} {location}",
                "{accommodation} {entity} {location}",
                "{location} {entity} {accommodation}",
            ]),
            locations: strings(&[
                "Florida", "Miami", "Tampa", "Orlando", "Jacksonville", "Tallahassee",
                "Fort Lauderdale", "Gainesville", "Sarasota", "Pensacola",
            ]),
            entities: strings(&["church", "ministry", "congregation", "parish"]),
            accommodations: strings(&[
                "autism", "special needs", "sensory friendly", "disability ministry",
                "neurodiverse",
            ]),
            max_queries: Some(200),
            max_results: 10,
        }
    }
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("results"),
            prefix: "crawl".to_string(),
            checkpoint: None,
        }
    }
}

impl Default for DatastoreSettings {
    fn default() -> Self {
        Self {
            url_env: "SUPABASE_URL".to_string(),
            key_env: "SUPABASE_SERVICE_ROLE_KEY".to_string(),
            table: "providers".to_string(),
            batch_size: 500,
            batch_delay_ms: 1_000,
            timeout_ms: 30_000,
            max_attempts: 3,
            retry_backoff_ms: 2_000,
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlerSettings::default(),
            fetcher: FetcherSettings::default(),
            identities: vec![
                BrowserFingerprint {
                    name: "windows_chrome".to_string(),
                    user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36".to_string(),
                    accept_language: "en-US,en;q=0.9".to_string(),
                    platform: "Win32".to_string(),
                    extra_headers: HashMap::new(),
                },
                BrowserFingerprint {
                    name: "windows_firefox".to_string(),
                    user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:122.0) Gecko/20100101 Firefox/122.0".to_string(),
                    accept_language: "en-US,en;q=0.5".to_string(),
                    platform: "Win32".to_string(),
                    extra_headers: HashMap::new(),
                },
                BrowserFingerprint {
                    name: "mac_safari".to_string(),
                    user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15".to_string(),
                    accept_language: "en-US,en;q=0.9".to_string(),
                    platform: "MacIntel".to_string(),
                    extra_headers: HashMap::new(),
                },
                BrowserFingerprint {
                    name: "linux_chrome".to_string(),
                    user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/121.0.0.0 Safari/537.36".to_string(),
                    accept_language: "en-US,en;q=0.9".to_string(),
                    platform: "Linux x86_64".to_string(),
                    extra_headers: HashMap::new(),
                },
            ],
            classifier: ClassifierSettings::default(),
            search: SearchSettings::default(),
            directories: vec![],
            output: OutputSettings::default(),
            datastore: DatastoreSettings::default(),
        }
    }
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) =
            directories::ProjectDirs::from("org", "asd-directory", "asd-directory-crawler")
        {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the sites directory if it doesn't exist
        path.push("sites");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        // Move back up to the config directory
        path.pop();
        path
    }

    /// Resolve the configuration for a command: explicit file, then profile, then default
    pub fn load(file: Option<&Path>, profile: Option<&str>) -> Result<Self> {
        let config = match (file, profile) {
            (Some(path), _) => Self::load_from_file(path)?,
            (None, Some(profile)) => Self::load_profile(profile)?,
            (None, None) => Self::load_default()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let config_dir = Self::config_dir();
        let profile_path = config_dir.join("sites").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            Err(CrawlError::config(format!("Profile '{}' not found", profile)).into())
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<PathBuf> {
        let config_dir = Self::config_dir();
        let sites_dir = config_dir.join("sites");

        let profile_path = sites_dir.join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)?;
        Ok(profile_path)
    }

    /// Save the configuration to a file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let config_dir = Self::config_dir();
        let sites_dir = config_dir.join("sites");

        if !sites_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(&sites_dir)
            .context(format!("Failed to read profiles directory: {}", sites_dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) {
                    profiles.push(name.to_string());
                }
            }
        }

        profiles.sort();
        Ok(profiles)
    }

    /// Reject settings the run loop cannot honour
    pub fn validate(&self) -> Result<(), CrawlError> {
        let fetcher = &self.fetcher;
        if fetcher.min_delay_ms > fetcher.max_delay_ms {
            return Err(CrawlError::config(format!(
                "fetcher.min_delay_ms ({}) is greater than fetcher.max_delay_ms ({})",
                fetcher.min_delay_ms, fetcher.max_delay_ms
            )));
        }
        if fetcher.max_attempts == 0 {
            return Err(CrawlError::config("fetcher.max_attempts must be at least 1"));
        }
        if fetcher.rotate_every == 0 {
            return Err(CrawlError::config("fetcher.rotate_every must be at least 1"));
        }
        if fetcher.circuit_threshold == 0 {
            return Err(CrawlError::config("fetcher.circuit_threshold must be at least 1"));
        }
        if self.identities.is_empty() {
            return Err(CrawlError::config("at least one identity is required"));
        }
        if self.crawler.flush_every == 0 {
            return Err(CrawlError::config("crawler.flush_every must be at least 1"));
        }
        if self.datastore.batch_size == 0 {
            return Err(CrawlError::config("datastore.batch_size must be at least 1"));
        }
        if self.datastore.max_attempts == 0 {
            return Err(CrawlError::config("datastore.max_attempts must be at least 1"));
        }
        if self.output.prefix.trim().is_empty() {
            return Err(CrawlError::config("output.prefix must not be empty"));
        }
        for source in &self.directories {
            if let Some(last) = source.last_page {
                if last < source.first_page {
                    return Err(CrawlError::config(format!(
                        "directory '{}': last_page {} is before first_page {}",
                        source.name, last, source.first_page
                    )));
                }
            }
        }
        Ok(())
    }

    /// Find a ruleset by name, inline definitions first
    pub fn ruleset(&self, name: Option<&str>) -> Result<Ruleset, CrawlError> {
        let name = name.unwrap_or(&self.classifier.ruleset);
        self.classifier
            .rulesets
            .iter()
            .find(|r| r.name == name)
            .cloned()
            .or_else(|| presets::builtin(name))
            .ok_or_else(|| {
                CrawlError::config(format!(
                    "unknown ruleset '{}' (built-in: {})",
                    name,
                    presets::names().join(", ")
                ))
            })
    }

    /// Look up and compile a ruleset
    pub fn compiled_ruleset(&self, name: Option<&str>) -> Result<CompiledRuleset, CrawlError> {
        CompiledRuleset::compile(&self.ruleset(name)?)
    }
}
