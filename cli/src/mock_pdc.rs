//! A mock phasor device for exercising parsers.
//!
//! Every client gets its own random configuration. The device answers configuration
//! and header requests and streams data frames while real-time data is enabled.

use crate::{parse_protocol, SourceArgs};
use clap::Args;
use pdc_core::codec::{
    codec_for, ConfigurationKind, DataFrameOptions, DecodedFrame, DeviceCommand, PhasorProtocol,
    ProtocolCodec,
};
use pdc_core::measurement::{utc_now_ticks, Ticks, TICKS_PER_SECOND};
use pdc_core::model::{ConfigurationFrame, DEFAULT_TIME_BASE};
use pdc_core::parser::assembler::FrameAssembler;
use pdc_core::random::{random_configuration, random_frame};
use std::error::Error;
use std::sync::Arc;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Args)]
pub struct MockPdcArgs {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:4712", env = "PDC_MOCK_ADDRESS")]
    pub address: String,

    /// Any IEEE C37.118 revision.
    #[arg(long, default_value = "IEEEC37_118V2", value_parser = parse_protocol, env = "PDC_PROTOCOL")]
    pub protocol: PhasorProtocol,

    /// Start streaming without waiting for EnableRealTimeData.
    #[arg(long, env = "PDC_MOCK_STREAM")]
    pub stream_immediately: bool,

    #[command(flatten)]
    pub source: SourceArgs,
}

pub async fn run(args: MockPdcArgs) -> Result<(), Box<dyn Error>> {
    if args.protocol == PhasorProtocol::Iec61850_90_5 {
        return Err("the mock device only speaks IEEE C37.118".into());
    }
    if args.source.frame_rate == 0 {
        return Err("frame rate must be positive".into());
    }

    let listener = TcpListener::bind(&args.address).await?;
    info!("Mock PDC listening on {}", listener.local_addr()?);
    info!(
        "Mock PDC serving {} devices at {} fps using {}",
        args.source.devices, args.source.frame_rate, args.protocol
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                info!("Mock PDC client connected: {}", peer);
                let args = args.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(socket, args).await {
                        warn!("Mock PDC client {} failed: {}", peer, e);
                    }
                    info!("Mock PDC client disconnected: {}", peer);
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Mock PDC shutting down");
                return Ok(());
            }
        }
    }
}

struct Device {
    codec: Arc<dyn ProtocolCodec>,
    config: ConfigurationFrame,
    streaming: bool,
}

impl Device {
    fn new(args: &MockPdcArgs) -> Self {
        let mut rng = rand::rng();
        let config = random_configuration(
            args.source.id_code,
            args.source.frame_rate,
            args.source.devices,
            &mut rng,
        );
        Device {
            codec: codec_for(args.protocol),
            config,
            streaming: args.stream_immediately,
        }
    }

    /// Reply to one command, if it needs one.
    fn answer(&mut self, command: &DeviceCommand, now: Ticks) -> io::Result<Option<Vec<u8>>> {
        let reply = match command {
            DeviceCommand::EnableRealTimeData => {
                info!("Mock PDC: start data transmission");
                self.streaming = true;
                None
            }
            DeviceCommand::DisableRealTimeData => {
                info!("Mock PDC: stop data transmission");
                self.streaming = false;
                None
            }
            DeviceCommand::SendHeaderFrame => Some(
                self.codec
                    .encode_header_frame(
                        self.config.id_code,
                        now,
                        DEFAULT_TIME_BASE,
                        "Mock PDC with random devices",
                    )
                    .map_err(io::Error::other)?,
            ),
            other => match ConfigurationKind::for_command(other) {
                Some(kind) => {
                    let images = self
                        .codec
                        .project_configuration(&self.config, 0, now)
                        .map_err(io::Error::other)?;
                    images.image(kind).map(<[u8]>::to_vec)
                }
                None => {
                    debug!("Mock PDC: ignoring {}", other);
                    None
                }
            },
        };
        Ok(reply)
    }

    fn data_frame(&self, now: Ticks) -> io::Result<Vec<u8>> {
        let ticks_per_frame = TICKS_PER_SECOND / self.config.frame_rate as i64;
        let timestamp = now - now.rem_euclid(ticks_per_frame);
        let frame = random_frame(&self.config, timestamp, &mut rand::rng());
        self.codec
            .encode_data_frame(&self.config, &frame, DataFrameOptions::default())
            .map_err(io::Error::other)
    }
}

async fn handle_client(mut socket: TcpStream, args: MockPdcArgs) -> io::Result<()> {
    let mut device = Device::new(&args);
    let mut assembler = FrameAssembler::new(4096);
    let mut buf = vec![0u8; 1024];

    let mut ticker = time::interval(Duration::from_secs_f64(
        1.0 / args.source.frame_rate as f64,
    ));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            read = socket.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                assembler.extend(&buf[..n]);
                while let Some(frame) = assembler.next_frame(device.codec.as_ref()) {
                    let command = frame
                        .map_err(io::Error::other)
                        .and_then(|f| device.codec.decode(&f, None, true).map_err(io::Error::other));
                    match command {
                        Ok(DecodedFrame::Command { command, .. }) => {
                            info!("Mock PDC: received {}", command);
                            if let Some(reply) = device.answer(&command, utc_now_ticks())? {
                                socket.write_all(&reply).await?;
                            }
                        }
                        Ok(other) => debug!("Mock PDC: ignoring {}", other.kind()),
                        Err(e) => debug!("Mock PDC: discarding inbound bytes: {}", e),
                    }
                }
            }
            _ = ticker.tick(), if device.streaming => {
                let frame = device.data_frame(utc_now_ticks())?;
                socket.write_all(&frame).await?;
            }
        }
    }
}
