//! Synthetic source -> concentrator -> publisher.
//!
//! Random devices report every frame as individual measurements stamped with a little
//! jitter, so the concentrator has real sorting to do before frames go out.

use crate::{parse_protocol, SourceArgs};
use clap::Args;
use pdc_core::codec::PhasorProtocol;
use pdc_core::concentrator::{Concentrator, ConcentratorSettings};
use pdc_core::measurement::{Clock, SystemClock, TICKS_PER_MILLISECOND};
use pdc_core::model::SignalMap;
use pdc_core::publisher::channel::{FrameChannel, TcpServerChannel, UdpChannel};
use pdc_core::publisher::{Publisher, PublisherSettings};
use pdc_core::random::{frame_measurements, random_configuration, random_frame};
use rand::Rng;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Clone, Args)]
pub struct PublishArgs {
    #[arg(long, default_value = "IEEEC37_118V2", value_parser = parse_protocol, env = "PDC_PROTOCOL")]
    pub protocol: PhasorProtocol,

    /// TCP address that clients connect to for frames and commands.
    #[arg(long, default_value = "0.0.0.0:4712", env = "PDC_LISTEN")]
    pub listen: String,

    /// Send data frames to this UDP destination; TCP then only carries commands.
    #[arg(long, env = "PDC_UDP_DESTINATION")]
    pub udp: Option<String>,

    #[arg(long, default_value_t = 3.0, env = "PDC_LAG_TIME")]
    pub lag_time: f64,

    #[arg(long, default_value_t = 1.0, env = "PDC_LEAD_TIME")]
    pub lead_time: f64,

    /// Concentrator settings as JSON. Overrides the lag and lead options.
    #[arg(long, env = "PDC_CONCENTRATOR_SETTINGS")]
    pub concentrator_settings: Option<PathBuf>,

    /// Send CFG-2 ahead of the first data frame of every second.
    #[arg(long, env = "PDC_AUTO_PUBLISH_CONFIG")]
    pub auto_publish_config: bool,

    /// Maximum arrival jitter of generated measurements, in milliseconds.
    #[arg(long, default_value_t = 5, env = "PDC_JITTER_MS")]
    pub jitter_ms: i64,

    /// Stop after this many seconds.
    #[arg(long, env = "PDC_PUBLISH_SECONDS")]
    pub seconds: Option<f64>,

    #[command(flatten)]
    pub source: SourceArgs,
}

impl PublishArgs {
    fn concentrator_settings(&self) -> Result<ConcentratorSettings, Box<dyn Error>> {
        let mut settings = match &self.concentrator_settings {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => ConcentratorSettings::new(
                self.source.frame_rate as u32,
                self.lag_time,
                self.lead_time,
            ),
        };
        settings.frames_per_second = self.source.frame_rate as u32;
        Ok(settings)
    }
}

pub async fn run(args: PublishArgs) -> Result<(), Box<dyn Error>> {
    let settings = args.concentrator_settings()?;
    let config = random_configuration(
        args.source.id_code,
        args.source.frame_rate,
        args.source.devices,
        &mut rand::rng(),
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (concentrator, frames) = Concentrator::new(
        settings,
        config.clone(),
        SignalMap::standard(&config),
        Arc::clone(&clock),
    )?;

    let (server, commands) = TcpServerChannel::bind(&args.listen)?;
    let server = Arc::new(server);
    let tcp: Arc<dyn FrameChannel> = server.clone();
    let (data_channel, command_channel) = match &args.udp {
        Some(destination) => {
            let udp: Arc<dyn FrameChannel> = Arc::new(UdpChannel::connect(destination.as_str())?);
            (udp, Some(tcp))
        }
        None => (tcp, None),
    };
    info!("Publishing data frames to {}", data_channel.description());

    let publisher = Arc::new(Publisher::new(
        PublisherSettings {
            protocol: args.protocol,
            id_code: args.source.id_code,
            auto_publish_configuration_frame: args.auto_publish_config,
            ..PublisherSettings::default()
        },
        data_channel,
        command_channel,
        Arc::clone(&clock),
    ));
    publisher.create_new_configuration_frame(&config)?;
    let command_worker = publisher.serve_commands(commands)?;

    let consumer = {
        let publisher = Arc::clone(&publisher);
        thread::Builder::new()
            .name("publish-frames".to_string())
            .spawn(move || {
                for frame in frames {
                    if let Err(e) = publisher.publish_frame(&frame) {
                        warn!("Failed to publish frame: {}", e);
                    }
                }
            })?
    };

    concentrator.start()?;
    generate(&concentrator, &args, clock.as_ref()).await;

    info!("{}", concentrator.status());
    concentrator.stop();
    // Dropping the concentrator closes the frame channel and ends the consumer.
    drop(concentrator);
    if consumer.join().is_err() {
        warn!("Frame consumer panicked");
    }

    info!("{}", publisher.status());
    // Closing the listener drops every command sender, which ends the command worker.
    server.shutdown();
    if command_worker.join().is_err() {
        warn!("Command worker panicked");
    }
    Ok(())
}

/// Feeds random measurements until interrupted or out of time.
async fn generate(concentrator: &Concentrator, args: &PublishArgs, clock: &dyn Clock) {
    let config = concentrator.configuration();
    let jitter = args.jitter_ms.max(0) * TICKS_PER_MILLISECOND;
    let mut ticker = time::interval(Duration::from_secs_f64(
        1.0 / args.source.frame_rate.max(1) as f64,
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let deadline = time::sleep(Duration::from_secs_f64(
        args.seconds.unwrap_or(1e9).clamp(0.0, 1e9),
    ));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mut rng = rand::rng();
                let frame = random_frame(config, clock.now(), &mut rng);
                let mut measurements = frame_measurements(config, &frame);
                for m in measurements.iter_mut() {
                    let offset = if jitter > 0 { rng.random_range(-jitter..=jitter) } else { 0 };
                    *m = m.restamped(m.timestamp + offset);
                }
                concentrator.sort_measurements(&measurements);
            }
            _ = &mut deadline => {
                info!("Publish duration elapsed");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }
}
