//! icelink CLI - provision, inspect, verify and tear down a BigLake Iceberg table.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use icelink_core::config::LogFormat;
use icelink_core::{Config, Error};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod report;

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// The input data does not yield a consistent schema
    SchemaError = 2,
    /// Iceberg metadata commit interrupted or unreadable
    CommitError = 3,
    /// A resource could not be created or removed
    ProvisioningError = 4,
    /// Warehouse row count differs from the committed data
    Mismatch = 5,
    /// Verification could not complete
    VerificationError = 6,
    /// General runtime error
    RuntimeError = 10,
}

impl ExitCode {
    /// Map an error to an exit code by its core error variant.
    fn from_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<Error>() {
            Some(Error::Config(_)) => ExitCode::ConfigError,
            Some(Error::Schema(_)) => ExitCode::SchemaError,
            Some(Error::Commit(_)) => ExitCode::CommitError,
            Some(Error::Provisioning { .. }) => ExitCode::ProvisioningError,
            Some(Error::Mismatch { .. }) => ExitCode::Mismatch,
            Some(Error::Verification(_)) => ExitCode::VerificationError,
            _ => ExitCode::RuntimeError,
        }
    }
}

/// Report rendering on stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One line per resource and check
    #[default]
    Text,
    /// The full report as JSON
    Json,
}

#[derive(Parser)]
#[command(name = "icelink")]
#[command(about = "Iceberg tables on Cloud Storage, queryable from BigQuery", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run against in-memory storage and warehouse instead of Google Cloud
    #[arg(long, global = true)]
    simulate: bool,

    /// Report format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the bucket, dataset, connection and external table
    Setup {
        /// Override the input data file
        #[arg(long)]
        data: Option<PathBuf>,
    },

    /// Show the state of every resource and the committed table
    Status,

    /// Compare the warehouse row count with the committed data files
    Verify,

    /// Remove every resource in reverse dependency order
    Cleanup,

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Log format comes from the config file when it parses; JSON otherwise
    let log_format = cli
        .config
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.monitoring.log_format)
        .unwrap_or(LogFormat::Json);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    // stdout carries the report
    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let options = commands::RunOptions {
        simulate: cli.simulate,
        format: cli.format,
    };

    match cli.command {
        Commands::Setup { data } => commands::setup(config, data, options).await?,
        Commands::Status => commands::status(config, options).await?,
        Commands::Verify => commands::verify(config, options).await?,
        Commands::Cleanup => commands::cleanup(config, options).await?,
        Commands::Validate => {
            println!("Configuration is valid");
            println!("  Project:    {}", config.gcp.project_id);
            println!("  Region:     {}", config.gcp.region);
            println!("  Bucket:     {}", config.storage.bucket_name);
            println!(
                "  Table:      {}.{}.{}",
                config.gcp.project_id, config.warehouse.dataset_id, config.warehouse.table_name
            );
            println!("  Connection: {}", config.connection_name());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use icelink_core::provision::Resource;
    use icelink_core::SchemaError;

    #[test]
    fn test_exit_code_from_core_error() {
        let err = anyhow::Error::from(Error::Config("missing".into()));
        assert_eq!(ExitCode::from_error(&err), ExitCode::ConfigError);

        let err = anyhow::Error::from(Error::Schema(SchemaError::Empty));
        assert_eq!(ExitCode::from_error(&err), ExitCode::SchemaError);

        let err = anyhow::Error::from(Error::Mismatch {
            expected: 2,
            actual: 3,
        });
        assert_eq!(ExitCode::from_error(&err), ExitCode::Mismatch);

        let err = anyhow::Error::from(Error::provisioning(Resource::ExternalTable, "denied"));
        assert_eq!(ExitCode::from_error(&err), ExitCode::ProvisioningError);

        let err = anyhow::anyhow!("something else");
        assert_eq!(ExitCode::from_error(&err), ExitCode::RuntimeError);
    }

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::parse_from(["icelink", "verify", "--simulate", "--format", "json", "-vv"]);
        assert!(cli.simulate);
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Verify));
    }
}
