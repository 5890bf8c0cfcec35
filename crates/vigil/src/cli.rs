use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use vigil_core::{VigilConfig, VigilError};

use crate::runtime::Vigil;

/// Exit code for a clean stop.
pub const EXIT_OK: i32 = 0;
/// Exit code for a fatal configuration error.
pub const EXIT_CONFIG: i32 = 1;
/// Exit code for a fatal database or initialization error.
pub const EXIT_INIT: i32 = 2;

/// VIGIL: control-center alert manager.
#[derive(Parser)]
#[command(name = "vigil")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "vigil.toml", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the alert manager.
    Run,

    /// Apply pending database migrations and exit.
    Migrate,

    /// Verify the audit chain and print the report.
    Verify(VerifyCommand),
}

#[derive(Parser)]
pub struct VerifyCommand {
    /// Range start (RFC 3339).
    #[arg(long)]
    pub start: Option<DateTime<Utc>>,

    /// Range end (RFC 3339).
    #[arg(long)]
    pub end: Option<DateTime<Utc>>,
}

impl Cli {
    /// Execute the command, mapping error classes onto process exit codes.
    pub async fn execute(self) -> i32 {
        dotenvy::dotenv().ok();
        init_tracing();

        let config = match VigilConfig::from_file(&self.config) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("vigil: {}", e);
                return EXIT_CONFIG;
            }
        };

        let result = match self.command {
            Commands::Run => Vigil::builder().config(config).build().run().await,
            Commands::Migrate => Vigil::builder().config(config).build().migrate().await,
            Commands::Verify(cmd) => {
                Vigil::builder()
                    .config(config)
                    .build()
                    .verify(cmd.start, cmd.end)
                    .await
            }
        };

        match result {
            Ok(()) => EXIT_OK,
            Err(e @ VigilError::Config(_)) => {
                eprintln!("vigil: {}", e);
                EXIT_CONFIG
            }
            Err(e) => {
                eprintln!("vigil: {}", e);
                EXIT_INIT
            }
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from(["vigil", "run"]).unwrap();
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.config, PathBuf::from("vigil.toml"));
    }

    #[test]
    fn test_cli_parses_config_flag() {
        let cli = Cli::try_parse_from(["vigil", "--config", "/etc/vigil.toml", "migrate"]).unwrap();
        assert!(matches!(cli.command, Commands::Migrate));
        assert_eq!(cli.config, PathBuf::from("/etc/vigil.toml"));
    }

    #[test]
    fn test_cli_parses_verify_range() {
        let cli = Cli::try_parse_from([
            "vigil",
            "verify",
            "--start",
            "2026-01-01T00:00:00Z",
        ])
        .unwrap();
        match cli.command {
            Commands::Verify(cmd) => {
                assert!(cmd.start.is_some());
                assert!(cmd.end.is_none());
            }
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_ne!(EXIT_OK, EXIT_CONFIG);
        assert_ne!(EXIT_CONFIG, EXIT_INIT);
    }
}
