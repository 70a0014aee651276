//! Command line front end.
//!
//! - `mock-pdc`: A TCP device serving random IEEE C37.118 configuration and data frames.
//! - `parse`: Connects a `MultiProtocolFrameParser` and logs or prints what it decodes.
//! - `publish`: Runs a synthetic source through the concentrator and publishes the
//!   aligned frames over TCP or UDP.
//!
//! Every option falls back to a `PDC_*` environment variable.

pub mod mock_pdc;
pub mod parse;
pub mod publish;

use clap::{Args, Parser, Subcommand};
use pdc_core::codec::PhasorProtocol;
use std::error::Error;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pdc")]
#[command(about = "Synchrophasor concentrator, parser and publisher", long_about = None)]
pub struct Cli {
    /// Also write hourly rolling logs into this directory.
    #[arg(long, global = true, env = "PDC_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve random frames to C37.118 clients.
    MockPdc(mock_pdc::MockPdcArgs),
    /// Parse a phasor stream described by a connection string.
    #[command(arg_required_else_help = true)]
    Parse(parse::ParseArgs),
    /// Concentrate a synthetic source and publish the aligned frames.
    Publish(publish::PublishArgs),
}

/// Options shared by the commands that generate random devices.
#[derive(Debug, Clone, Args)]
pub struct SourceArgs {
    /// Frames per second of the generated stream.
    #[arg(long, default_value_t = 30, env = "PDC_FRAME_RATE")]
    pub frame_rate: u16,

    /// Number of devices (cells) in the generated configuration.
    #[arg(long, default_value_t = 4, env = "PDC_DEVICES")]
    pub devices: usize,

    /// ID code of the generated stream.
    #[arg(long, default_value_t = 1, env = "PDC_ID_CODE")]
    pub id_code: u16,
}

pub fn parse_protocol(value: &str) -> Result<PhasorProtocol, String> {
    value.parse().map_err(|e| format!("{}", e))
}

/// Installs the global subscriber. Keep the returned guard alive to flush file logs.
pub fn init_tracing(log_dir: Option<&PathBuf>) -> Result<Option<WorkerGuard>, Box<dyn Error>> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::hourly(dir, "pdc.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(non_blocking)
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .try_init()
                .map_err(|e| e.to_string())?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init()
                .map_err(|e| e.to_string())?;
            Ok(None)
        }
    }
}

pub async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let _guard = init_tracing(cli.log_dir.as_ref())?;
    info!("Starting pdc {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::MockPdc(args) => mock_pdc::run(args).await,
        Commands::Parse(args) => parse::run(args).await,
        Commands::Publish(args) => publish::run(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from([
            "pdc",
            "publish",
            "--protocol",
            "IEC61850_90_5",
            "--devices",
            "2",
            "--lag-time",
            "2.5",
        ])
        .unwrap();
        match cli.command {
            Commands::Publish(args) => {
                assert_eq!(args.protocol, PhasorProtocol::Iec61850_90_5);
                assert_eq!(args.source.devices, 2);
                assert_eq!(args.lag_time, 2.5);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["pdc", "parse", "server=127.0.0.1:4712"]).unwrap();
        assert!(matches!(cli.command, Commands::Parse(_)));
    }

    #[test]
    fn test_unknown_protocol_is_rejected() {
        assert!(Cli::try_parse_from(["pdc", "publish", "--protocol", "BPA"]).is_err());
        assert!(parse_protocol("ieeec37_118v3").is_ok());
    }
}
