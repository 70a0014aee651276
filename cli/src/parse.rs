use clap::Args;
use pdc_core::parser::{MultiProtocolFrameParser, ParserEvent};
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Args)]
pub struct ParseArgs {
    /// For example `phasorProtocol=IEEEC37_118V2; server=127.0.0.1:4712; accessID=1`.
    #[arg(env = "PDC_CONNECTION_STRING")]
    pub connection_string: String,

    /// Stop after this many seconds.
    #[arg(long, env = "PDC_PARSE_SECONDS")]
    pub seconds: Option<f64>,

    /// Print every data frame to stdout as a JSON line.
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: ParseArgs) -> Result<(), Box<dyn Error>> {
    let (parser, events) = MultiProtocolFrameParser::initialize(&args.connection_string)?;
    parser.start()?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let deadline = args
        .seconds
        .map(|s| Instant::now() + Duration::from_secs_f64(s.max(0.0)));
    let json = args.json;

    let parser = tokio::task::spawn_blocking(move || {
        loop {
            if stop.load(Ordering::SeqCst) || deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            match events.recv_timeout(Duration::from_millis(200)) {
                Ok(ParserEvent::ConnectionTerminated) => {
                    info!("Connection terminated");
                    break;
                }
                Ok(event) => report(&event, json),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        parser.stop();
        parser
    })
    .await?;

    info!(
        "Parser statistics: {}",
        serde_json::to_string(&parser.statistics())?
    );
    Ok(())
}

fn report(event: &ParserEvent, json: bool) {
    match event {
        ParserEvent::ConnectionAttempt { attempt } => info!("Connection attempt {}", attempt),
        ParserEvent::ConnectionEstablished => info!("Connection established"),
        ParserEvent::ConnectionException { error, attempt } => {
            warn!("Connection attempt {} failed: {}", attempt, error)
        }
        ParserEvent::ConfigurationFrameReceived(kind, config) => info!(
            "{:?} for ID code {}: {} devices at {} fps",
            kind,
            config.id_code,
            config.cells.len(),
            config.frame_rate
        ),
        ParserEvent::DataFrameReceived(frame) => {
            if json {
                match serde_json::to_string(frame) {
                    Ok(line) => println!("{}", line),
                    Err(e) => warn!("Failed to serialize data frame: {}", e),
                }
            } else {
                debug!(
                    "Data frame at {}",
                    pdc_core::measurement::format_ticks(frame.timestamp)
                );
            }
        }
        ParserEvent::HeaderFrameReceived { id_code, text } => {
            info!("Header from ID code {}: {}", id_code, text)
        }
        ParserEvent::CommandFrameReceived { id_code, command } => {
            info!("Command from ID code {}: {}", id_code, command)
        }
        ParserEvent::ReceivedFrameBufferImage { .. } => {}
        ParserEvent::ParsingException(error) => warn!("Parsing exception: {}", error),
        ParserEvent::ExceededParsingExceptionThreshold => {
            warn!("Too many parsing exceptions; disconnecting")
        }
        ParserEvent::ConnectionTerminated => {}
    }
}
