//! Command-line interface for exporters
//!
//! This module handles:
//! - Command-line argument parsing using clap
//! - Loading the job configuration from a file or a resume URI
//! - Logging overrides from `-v`, `--vv` and `-q`
//! - The `check` subcommand

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::bypass;
use crate::config::{ExportConfig, LogLevel};
use crate::error::{ConfigError, Result};
use crate::persistence::{ResumeUri, resolve_job_from_uri};
use crate::registry::Registry;

/// Exporters - resumable batch exports
#[derive(Parser, Debug)]
#[command(
    name = "exporters",
    version,
    about = "Resumable batch export pipeline",
    long_about = "Reads records from a source, formats and buffers them, delivers the
buffers to a destination and checkpoints progress so interrupted jobs resume
where they stopped."
)]
pub struct CliArgs {
    /// Job configuration file (TOML)
    #[arg(
        short = 'c',
        long = "config",
        value_name = "FILE",
        required_unless_present = "resume"
    )]
    pub config_file: Option<PathBuf>,

    /// Resume a stored job
    ///
    /// Format: protocol://[user[:password]@]host[:port]/database/job_id
    /// or sqlite:///path/to/jobs.db/job_id
    #[arg(long, value_name = "URI", conflicts_with = "config_file")]
    pub resume: Option<String>,

    /// Quiet mode (errors only)
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose mode (detailed logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Very verbose mode (debug logging)
    #[arg(long = "vv")]
    pub very_verbose: bool,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Subcommands for exporters
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and report whether the bypass would engage
    Check,
}

/// CLI interface handler
pub struct CliInterface {
    /// Parsed command-line arguments
    args: CliArgs,

    /// Loaded job configuration
    config: ExportConfig,
}

impl CliInterface {
    /// Parse the process arguments and load the job configuration
    ///
    /// # Arguments
    /// * `registry` - Registry used to open the store of a resumed job
    pub async fn new(registry: &Registry) -> Result<Self> {
        Self::from_args(CliArgs::parse(), registry).await
    }

    /// Load the job configuration for already parsed arguments
    pub async fn from_args(args: CliArgs, registry: &Registry) -> Result<Self> {
        let mut config = Self::load_config(&args, registry).await?;
        Self::apply_logging_args(&mut config, &args);
        Ok(Self { args, config })
    }

    /// Load configuration from `--config` or `--resume`
    async fn load_config(args: &CliArgs, registry: &Registry) -> Result<ExportConfig> {
        if let Some(uri) = &args.resume {
            return resolve_job_from_uri(uri, registry).await;
        }
        match &args.config_file {
            Some(path) => ExportConfig::from_file(path),
            None => Err(ConfigError::MissingField("--config".to_string()).into()),
        }
    }

    /// Apply logging-related CLI arguments to configuration
    fn apply_logging_args(config: &mut ExportConfig, args: &CliArgs) {
        let options = &mut config.exporter_options;
        options.log_level = if args.very_verbose {
            LogLevel::Trace
        } else if args.verbose {
            LogLevel::Debug
        } else if args.quiet {
            LogLevel::Error
        } else {
            options.log_level
        };
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Take the configuration out to run the job
    pub fn into_config(self) -> ExportConfig {
        self.config
    }

    pub fn args(&self) -> &CliArgs {
        &self.args
    }

    /// Whether the progress bar should be drawn
    pub fn show_progress(&self) -> bool {
        !self.args.no_progress && !self.args.quiet
    }

    /// Handle subcommands
    ///
    /// # Returns
    /// * `Result<bool>` - True if subcommand was handled, false to continue
    pub fn handle_subcommand(&self, registry: &Registry) -> Result<bool> {
        match &self.args.command {
            Some(Commands::Check) => {
                self.check(registry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Validate module names and options without touching any data
    fn check(&self, registry: &Registry) -> Result<()> {
        registry.validate(&self.config)?;
        registry.stages(&self.config)?;
        registry.formatter(&self.config.exporter_options.formatter)?;
        registry.destination(&self.config.writer)?;

        println!("Source: {}", self.source_description());
        println!(
            "Pipeline: {} -> {} ({} formatter)",
            self.config.reader.name,
            self.config.writer.name,
            self.config.exporter_options.formatter.name
        );
        match bypass::meets_conditions(&self.config, registry) {
            Ok(()) => println!("Bypass: engaged"),
            Err(reason) => println!("Bypass: not engaged ({reason})"),
        }
        println!("Configuration is valid");
        Ok(())
    }

    fn source_description(&self) -> String {
        match (&self.args.resume, &self.args.config_file) {
            (Some(uri), _) => match ResumeUri::parse(uri) {
                Ok(parsed) => format!("resumed job {parsed}"),
                Err(_) => "resumed job".to_string(),
            },
            (None, Some(path)) => path.display().to_string(),
            (None, None) => "-".to_string(),
        }
    }
}
