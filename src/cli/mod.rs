pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use crate::cli::config::CrawlerConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Also write logs to the default log file in the data directory
    #[arg(long, global = true, conflicts_with = "log_file")]
    pub save_log: bool,

    /// Configuration file to use instead of a profile
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Configuration profile
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Options shared by the crawling commands
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Ruleset to classify with (built-in or defined in the profile)
    #[arg(short, long)]
    pub ruleset: Option<String>,

    /// Output directory
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Output file prefix; also names the checkpoint
    #[arg(long)]
    pub prefix: Option<String>,

    /// Maximum number of targets to process in this run
    #[arg(short, long)]
    pub limit: Option<usize>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushMode {
    /// Set columns on providers matched by phone, then name and city
    Update,
    /// Insert one provider per result row
    Insert,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the website of every row in a CSV file
    Verify {
        /// Input CSV with at least a name column
        #[arg(required = true)]
        input: PathBuf,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Search for providers and classify every site found
    Search {
        #[command(flatten)]
        run: RunArgs,

        /// Maximum number of search queries
        #[arg(long)]
        max_queries: Option<usize>,
    },

    /// Crawl the configured directory listings and classify every listed site
    Directory {
        #[command(flatten)]
        run: RunArgs,
    },

    /// Classify a local text or HTML file and print the result as JSON
    Classify {
        #[arg(required = true)]
        file: PathBuf,

        #[arg(short, long)]
        ruleset: Option<String>,
    },

    /// Drop CSV rows that share a URL, phone or name and city
    Dedupe {
        #[arg(required = true)]
        input: PathBuf,

        #[arg(required = true)]
        output: PathBuf,
    },

    /// Push classified results to the provider datastore
    Push {
        /// Results JSON file written by a crawl
        #[arg(required = true)]
        results: PathBuf,

        #[arg(short, long, value_enum, default_value_t = PushMode::Update)]
        mode: PushMode,

        /// Column assignment, e.g. --set aba=true (repeatable)
        #[arg(long = "set", value_name = "COLUMN=VALUE")]
        assignments: Vec<String>,

        /// Decision family to push
        #[arg(long, default_value = "keep")]
        family: String,

        /// Table to write (overrides the profile)
        #[arg(long)]
        table: Option<String>,
    },

    /// List built-in rulesets or print one as YAML
    Rules {
        name: Option<String>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to show or create
        #[arg(required = false)]
        name: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

impl Cli {
    fn load_config(&self) -> Result<CrawlerConfig> {
        CrawlerConfig::load(self.config.as_deref(), self.profile.as_deref())
    }
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Verify { input, run } => {
            info!("Verifying websites listed in {}", input.display());
            commands::verify(cli.load_config()?, input, run).await
        }
        Commands::Search { run, max_queries } => {
            info!("Starting search crawl");
            commands::search(cli.load_config()?, run, *max_queries).await
        }
        Commands::Directory { run } => {
            info!("Starting directory crawl");
            commands::directory(cli.load_config()?, run).await
        }
        Commands::Classify { file, ruleset } => {
            commands::classify(&cli.load_config()?, file, ruleset.as_deref())
        }
        Commands::Dedupe { input, output } => commands::dedupe(input, output),
        Commands::Push {
            results,
            mode,
            assignments,
            family,
            table,
        } => {
            info!("Pushing {} rows from {} ({:?})", family, results.display(), mode);
            let mut config = cli.load_config()?;
            if let Some(table) = table {
                config.datastore.table = table.clone();
            }
            commands::push(&config, results, *mode, assignments, family).await
        }
        Commands::Rules { name } => commands::rules(&cli.load_config()?, name.as_deref()),
        Commands::Config { name, list } => {
            if *list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = name {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                info!("Showing current configuration");
                commands::show_config(&cli.load_config()?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_push_arguments() {
        let cli = Cli::try_parse_from([
            "crawler", "--profile", "aba", "push", "results/aba_keep.json", "--set", "aba=true",
            "--set", "verified=true",
        ])
        .unwrap();
        assert_eq!(cli.profile.as_deref(), Some("aba"));
        match cli.command {
            Commands::Push {
                mode,
                assignments,
                family,
                ..
            } => {
                assert_eq!(mode, PushMode::Update);
                assert_eq!(assignments, vec!["aba=true", "verified=true"]);
                assert_eq!(family, "keep");
            }
            _ => panic!("expected push"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["crawler", "verify", "churches.csv", "-v", "--limit", "10"])
            .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Verify { run, .. } => assert_eq!(run.limit, Some(10)),
            _ => panic!("expected verify"),
        }
    }
}
