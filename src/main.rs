use anyhow::Result;
use tracing::{debug, error};

mod browser;
mod classifier;
mod cli;
mod crawler;
mod error;
mod storage;
mod utils;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Initialize logging
    let log_file = args
        .log_file
        .clone()
        .or_else(|| args.save_log.then(utils::default_log_file));
    utils::init_logging(args.verbose, log_file)?;

    debug!("Starting ASD directory crawler v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            debug!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
