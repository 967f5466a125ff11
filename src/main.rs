//! Exporters
//!
//! Resumable batch exports from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Run a job
//! exporters --config job.toml
//!
//! # Resume an interrupted job
//! exporters --resume sqlite:///var/lib/exporters/jobs.db/7
//!
//! # Validate a job without running it
//! exporters --config job.toml check
//! ```

use tokio_util::sync::CancellationToken;

use exporters::cli::CliInterface;
use exporters::error::Result;
use exporters::pipeline::ExportManager;
use exporters::registry::Registry;

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Main application logic
///
/// 1. Parse command-line arguments and load the job configuration
/// 2. Initialize logging
/// 3. Handle subcommands or run the job
///
/// # Returns
/// * `Result<()>` - Success or error
async fn run() -> Result<()> {
    let registry = Registry::default();
    let cli = CliInterface::new(&registry).await?;

    initialize_logging(&cli);

    if cli.handle_subcommand(&registry)? {
        return Ok(());
    }

    let show_progress = cli.show_progress();
    let cancel_token = CancellationToken::new();
    let ctrl_c_handle = spawn_ctrl_c_listener(cancel_token.clone());

    let mut manager = ExportManager::new(cli.into_config(), registry)
        .with_cancellation(cancel_token)
        .with_progress(show_progress);
    let result = manager.run().await;
    ctrl_c_handle.abort();

    let result = result?;
    if result.cancelled {
        eprintln!(
            "Interrupted; resume job {} to continue from its last checkpoint",
            result.job_id
        );
    }
    Ok(())
}

/// Cancel the job on Ctrl+C; the manager stops at the next batch boundary
fn spawn_ctrl_c_listener(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => token.cancel(),
            Err(err) => eprintln!("Failed to listen for Ctrl+C: {}", err),
        }
    })
}

/// Initialize logging system based on the configured level
///
/// # Arguments
/// * `cli` - CLI interface holding the job configuration
fn initialize_logging(cli: &CliInterface) {
    let level = cli.config().exporter_options.log_level.to_tracing_level();

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
