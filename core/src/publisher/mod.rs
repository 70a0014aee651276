//! # Protocol-Specific Publisher
//!
//! Turns canonical configurations and concentrated frames into protocol-exact frames
//! and answers device commands.
//!
//! ## Key Components
//!
//! - `Publisher`: Caches the projected configuration images, owns the configuration
//!   revision and the 60 second configuration-changed window, and dispatches commands.
//! - `PublisherSettings`: Output protocol, ID code and channel behavior.
//! - `channel`: The `FrameChannel` trait with UDP, TCP server and in-memory channels.
//!
//! ## Usage
//!
//! Call `create_new_configuration_frame` whenever the canonical configuration may have
//! changed, then `publish_frame` for every frame the concentrator emits. Raw command
//! bytes go to `device_command_handler`; `serve_commands` does this on a thread for
//! commands arriving on a `TcpServerChannel`.

pub mod channel;

pub use channel::{FrameChannel, MemoryChannel, TcpServerChannel, UdpChannel};

use crate::codec::{
    codec_for, CodecError, ConfigurationImages, ConfigurationKind, DataFrameOptions, DecodedFrame,
    DeviceCommand, FrameKind, PhasorProtocol, ProtocolCodec,
};
use crate::iec61850_90_5::{Iec61850Codec, Iec61850Options};
use crate::measurement::{format_ticks, Clock, Ticks, TICKS_PER_SECOND};
use crate::model::{ConfigurationFrame, Frame, DEFAULT_TIME_BASE};
use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long data frames carry the configuration-changed flag after a new
/// configuration is projected.
pub const CONFIGURATION_CHANGE_WINDOW: Ticks = 60 * TICKS_PER_SECOND;

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("no configuration has been projected yet")]
    NoConfiguration,
    #[error("frame has {actual} cells but the configuration defines {expected}")]
    CellMismatch { expected: usize, actual: usize },
    #[error("expected a command frame, received a {0}")]
    NotACommand(FrameKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublisherSettings {
    pub protocol: PhasorProtocol,
    /// ID code of the published stream; commands must carry it when validation is on.
    pub id_code: u16,
    pub validate_id_code: bool,
    pub time_base: u32,
    /// Re-send CFG-2 on the data channel at the top of every second.
    pub auto_publish_configuration_frame: bool,
    /// Keep the data channel running regardless of Enable/DisableRealTimeData.
    pub auto_start_data_channel: bool,
    pub iec61850: Iec61850Options,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        PublisherSettings {
            protocol: PhasorProtocol::default(),
            id_code: 1,
            validate_id_code: true,
            time_base: DEFAULT_TIME_BASE,
            auto_publish_configuration_frame: false,
            auto_start_data_channel: true,
            iec61850: Iec61850Options::default(),
        }
    }
}

/// What a handled command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command's ID code did not match the stream.
    Rejected { id_code: u16 },
    SentConfiguration(ConfigurationKind),
    SentHeader,
    DataChannelStarted,
    DataChannelStopped,
    /// Logged without further action.
    Ignored(DeviceCommand),
}

struct Projection {
    config: ConfigurationFrame,
    images: ConfigurationImages,
}

pub struct Publisher {
    settings: PublisherSettings,
    codec: Arc<dyn ProtocolCodec>,
    clock: Arc<dyn Clock>,
    cache: ArcSwapOption<Projection>,
    revision: AtomicU16,
    changed_until: AtomicI64,
    data_channel: Arc<dyn FrameChannel>,
    command_channel: Option<Arc<dyn FrameChannel>>,
    data_enabled: AtomicBool,
    last_configuration_second: AtomicI64,
    published_frames: AtomicU64,
}

impl Publisher {
    pub fn new(
        settings: PublisherSettings,
        data_channel: Arc<dyn FrameChannel>,
        command_channel: Option<Arc<dyn FrameChannel>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let codec: Arc<dyn ProtocolCodec> = match settings.protocol {
            PhasorProtocol::Iec61850_90_5 => Arc::new(Iec61850Codec::new(settings.iec61850.clone())),
            other => codec_for(other),
        };
        Publisher {
            data_enabled: AtomicBool::new(settings.auto_start_data_channel),
            settings,
            codec,
            clock,
            cache: ArcSwapOption::empty(),
            revision: AtomicU16::new(0),
            changed_until: AtomicI64::new(i64::MIN),
            data_channel,
            command_channel,
            last_configuration_second: AtomicI64::new(i64::MIN),
            published_frames: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    pub fn revision(&self) -> u16 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn is_data_enabled(&self) -> bool {
        self.data_enabled.load(Ordering::SeqCst)
    }

    pub fn published_frames(&self) -> u64 {
        self.published_frames.load(Ordering::Relaxed)
    }

    /// True while data frames carry the configuration-changed flag, up to and
    /// including the last tick of the window.
    pub fn configuration_changed(&self) -> bool {
        self.clock.now() <= self.changed_until.load(Ordering::SeqCst)
    }

    /// The cached image of `kind`, if projected.
    pub fn configuration_image(&self, kind: ConfigurationKind) -> Option<Vec<u8>> {
        self.cache
            .load()
            .as_ref()
            .and_then(|p| p.images.image(kind).map(<[u8]>::to_vec))
    }

    /// Projects `config` into the protocol's configuration images.
    ///
    /// Projecting the cached configuration again does nothing. A different
    /// configuration bumps the revision and opens the configuration-changed window.
    ///
    /// # Returns
    ///
    /// `true` when the cache was replaced.
    pub fn create_new_configuration_frame(
        &self,
        config: &ConfigurationFrame,
    ) -> Result<bool, PublisherError> {
        let current = self.cache.load_full();
        if current.as_ref().is_some_and(|p| p.config == *config) {
            return Ok(false);
        }

        let now = self.clock.now();
        let revision = match current {
            Some(_) => self.revision().wrapping_add(1),
            None => self.revision(),
        };
        let images = self.codec.project_configuration(config, revision, now)?;

        self.revision.store(revision, Ordering::SeqCst);
        self.cache.store(Some(Arc::new(Projection {
            config: config.clone(),
            images,
        })));

        if current.is_some() {
            self.changed_until
                .store(now + CONFIGURATION_CHANGE_WINDOW, Ordering::SeqCst);
            info!(
                "Configuration for ID code {} changed, now at revision {}",
                config.id_code, revision
            );
        } else {
            info!(
                "Projected {} configuration for ID code {} with {} cells",
                self.settings.protocol,
                config.id_code,
                config.cells.len()
            );
        }
        Ok(true)
    }

    /// Encodes a completed frame against the cached configuration.
    pub fn create_new_data_frame(&self, frame: &Frame) -> Result<Vec<u8>, PublisherError> {
        let projection = self.cache.load_full().ok_or(PublisherError::NoConfiguration)?;
        if projection.config.cells.len() != frame.cells.len() {
            return Err(PublisherError::CellMismatch {
                expected: projection.config.cells.len(),
                actual: frame.cells.len(),
            });
        }
        let options = DataFrameOptions {
            config_changed: self.configuration_changed(),
        };
        Ok(self.codec.encode_data_frame(&projection.config, frame, options)?)
    }

    /// Sends `frame` on the data channel when it is enabled, preceded by CFG-2 on the
    /// first frame of each second when auto-publishing is on.
    pub fn publish_frame(&self, frame: &Frame) -> Result<(), PublisherError> {
        if !self.is_data_enabled() {
            return Ok(());
        }

        if self.settings.auto_publish_configuration_frame {
            let second = frame.timestamp.div_euclid(TICKS_PER_SECOND);
            if self.last_configuration_second.swap(second, Ordering::SeqCst) != second {
                if let Some(cfg2) = self.configuration_image(ConfigurationKind::Cfg2) {
                    self.data_channel.send(&cfg2)?;
                }
            }
        }

        let bytes = self.create_new_data_frame(frame)?;
        self.data_channel.send(&bytes)?;
        self.published_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reply_channel(&self) -> &Arc<dyn FrameChannel> {
        self.command_channel.as_ref().unwrap_or(&self.data_channel)
    }

    /// Parses and answers a raw command frame. Malformed bytes return an error and
    /// change nothing.
    pub fn device_command_handler(&self, bytes: &[u8]) -> Result<CommandOutcome, PublisherError> {
        let (id_code, command) = match self.codec.decode(bytes, None, true)? {
            DecodedFrame::Command { id_code, command } => (id_code, command),
            other => return Err(PublisherError::NotACommand(other.kind())),
        };

        if self.settings.validate_id_code && id_code != self.settings.id_code {
            warn!(
                "Rejected {} for ID code {}; this stream answers to ID code {}",
                command, id_code, self.settings.id_code
            );
            return Ok(CommandOutcome::Rejected { id_code });
        }

        match command {
            DeviceCommand::SendConfigurationFrame1
            | DeviceCommand::SendConfigurationFrame2
            | DeviceCommand::SendConfigurationFrame3 => {
                let Some(kind) = ConfigurationKind::for_command(&command) else {
                    return Ok(CommandOutcome::Ignored(command));
                };
                match self.configuration_image(kind) {
                    Some(image) => {
                        self.reply_channel().send(&image)?;
                        debug!("Sent {:?} in reply to {}", kind, command);
                        Ok(CommandOutcome::SentConfiguration(kind))
                    }
                    None => {
                        warn!("{} requested but no {:?} image is available", command, kind);
                        Ok(CommandOutcome::Ignored(command))
                    }
                }
            }
            DeviceCommand::SendHeaderFrame => {
                let header = self.codec.encode_header_frame(
                    self.settings.id_code,
                    self.clock.now(),
                    self.settings.time_base,
                    &self.header_text(),
                )?;
                self.reply_channel().send(&header)?;
                Ok(CommandOutcome::SentHeader)
            }
            DeviceCommand::EnableRealTimeData | DeviceCommand::DisableRealTimeData
                if self.settings.auto_start_data_channel =>
            {
                info!("{} ignored: the data channel is started automatically", command);
                Ok(CommandOutcome::Ignored(command))
            }
            DeviceCommand::EnableRealTimeData => {
                self.data_enabled.store(true, Ordering::SeqCst);
                info!("Data channel started by remote request");
                Ok(CommandOutcome::DataChannelStarted)
            }
            DeviceCommand::DisableRealTimeData => {
                self.data_enabled.store(false, Ordering::SeqCst);
                info!("Data channel stopped by remote request");
                Ok(CommandOutcome::DataChannelStopped)
            }
            other => {
                info!("Unsupported device command {} ignored", other);
                Ok(CommandOutcome::Ignored(other))
            }
        }
    }

    /// Answers every command frame received on `commands` until the sender closes.
    pub fn serve_commands(self: &Arc<Self>, commands: Receiver<Vec<u8>>) -> std::io::Result<JoinHandle<()>> {
        let publisher = Arc::clone(self);
        thread::Builder::new()
            .name("publisher-commands".to_string())
            .spawn(move || {
                for bytes in commands {
                    if let Err(e) = publisher.device_command_handler(&bytes) {
                        warn!("Failed to handle device command: {}", e);
                    }
                }
            })
    }

    /// Descriptive text returned in header frames.
    pub fn header_text(&self) -> String {
        format!(
            "Concentrator output stream: protocol {}, auto-publish configuration frame {}, \
             auto-start data channel {}, ID code {}, system time {} UTC",
            self.settings.protocol,
            self.settings.auto_publish_configuration_frame,
            self.settings.auto_start_data_channel,
            self.settings.id_code,
            format_ticks(self.clock.now()),
        )
    }

    pub fn status(&self) -> String {
        let mut status = String::new();
        let _ = writeln!(status, "{:>24}: {}", "Output protocol", self.settings.protocol);
        let _ = writeln!(status, "{:>24}: {}", "Data channel", self.data_channel.description());
        if let Some(channel) = &self.command_channel {
            let _ = writeln!(status, "{:>24}: {}", "Command channel", channel.description());
        }
        let _ = writeln!(status, "{:>24}: {}", "Configured time base", self.settings.time_base);
        let _ = writeln!(status, "{:>24}: {}", "Validating ID code", self.settings.validate_id_code);
        let _ = writeln!(status, "{:>24}: {}", "Revision", self.revision());
        let _ = writeln!(status, "{:>24}: {}", "Configuration changed", self.configuration_changed());
        let _ = writeln!(status, "{:>24}: {}", "Data channel enabled", self.is_data_enabled());
        let _ = writeln!(status, "{:>24}: {}", "Published frames", self.published_frames());
        status.push_str(&self.codec.status());
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ieee_c37_118::codec::IeeeC37118Codec;
    use crate::ieee_c37_118::common::Version;
    use crate::measurement::ManualClock;
    use crate::model::{CellStatus, ConfigurationCell, PhasorKind};
    use tracing_test::traced_test;

    const T0: Ticks = 1_700_000_000 * TICKS_PER_SECOND;

    fn config(station: &str) -> ConfigurationFrame {
        ConfigurationFrame::new(7, 30).with_cell(
            ConfigurationCell::new(7, station, station).with_phasor("VA", PhasorKind::Voltage, 915_527),
        )
    }

    fn publisher(settings: PublisherSettings) -> (Publisher, Arc<MemoryChannel>, Arc<ManualClock>) {
        let channel = Arc::new(MemoryChannel::new());
        let clock = Arc::new(ManualClock::new(T0));
        let publisher = Publisher::new(settings, channel.clone(), None, clock.clone());
        (publisher, channel, clock)
    }

    fn settings() -> PublisherSettings {
        PublisherSettings {
            id_code: 7,
            ..PublisherSettings::default()
        }
    }

    fn command(id_code: u16, command: DeviceCommand) -> Vec<u8> {
        IeeeC37118Codec::new(Version::V2011)
            .encode_command_frame(id_code, &command, T0)
            .unwrap()
    }

    fn decode_status(bytes: &[u8], config: &ConfigurationFrame) -> CellStatus {
        let codec = IeeeC37118Codec::new(Version::V2011);
        match codec.decode(bytes, Some(config), true).unwrap() {
            DecodedFrame::Data { frame, .. } => frame.cells[0].status,
            other => panic!("expected data, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_identical_configuration_is_a_no_op() {
        let (publisher, _, _) = publisher(settings());
        assert!(publisher.create_new_configuration_frame(&config("A")).unwrap());
        assert!(!publisher.create_new_configuration_frame(&config("A")).unwrap());
        assert_eq!(publisher.revision(), 0);
        assert!(!publisher.configuration_changed());
    }

    #[test]
    fn test_configuration_change_window() {
        let (publisher, _, clock) = publisher(settings());
        let first = config("A");
        let second = config("B");
        publisher.create_new_configuration_frame(&first).unwrap();
        publisher.create_new_configuration_frame(&second).unwrap();
        assert_eq!(publisher.revision(), 1);

        let frame = second.empty_frame(T0);
        let bytes = publisher.create_new_data_frame(&frame).unwrap();
        assert!(decode_status(&bytes, &second).contains(CellStatus::CONFIGURATION_CHANGED));

        clock.set(T0 + CONFIGURATION_CHANGE_WINDOW);
        assert!(publisher.configuration_changed());
        let bytes = publisher.create_new_data_frame(&frame).unwrap();
        assert!(decode_status(&bytes, &second).contains(CellStatus::CONFIGURATION_CHANGED));

        clock.set(T0 + CONFIGURATION_CHANGE_WINDOW + 1);
        assert!(!publisher.configuration_changed());
        let bytes = publisher.create_new_data_frame(&frame).unwrap();
        assert!(!decode_status(&bytes, &second).contains(CellStatus::CONFIGURATION_CHANGED));
    }

    #[test]
    fn test_revision_wraps() {
        let (publisher, _, _) = publisher(settings());
        publisher.revision.store(u16::MAX, Ordering::SeqCst);
        publisher.create_new_configuration_frame(&config("A")).unwrap();
        publisher.create_new_configuration_frame(&config("B")).unwrap();
        assert_eq!(publisher.revision(), 0);
    }

    #[test]
    fn test_data_frame_requires_configuration() {
        let (publisher, _, _) = publisher(settings());
        assert!(matches!(
            publisher.create_new_data_frame(&config("A").empty_frame(T0)),
            Err(PublisherError::NoConfiguration)
        ));
        publisher.create_new_configuration_frame(&config("A")).unwrap();
        let two_cells = config("A").with_cell(ConfigurationCell::new(8, "X", "X"));
        assert!(matches!(
            publisher.create_new_data_frame(&two_cells.empty_frame(T0)),
            Err(PublisherError::CellMismatch { expected: 1, actual: 2 })
        ));
    }

    #[traced_test]
    #[test]
    fn test_mismatched_id_code_is_rejected() {
        let (publisher, channel, _) = publisher(settings());
        publisher.create_new_configuration_frame(&config("A")).unwrap();
        let outcome = publisher
            .device_command_handler(&command(99, DeviceCommand::SendConfigurationFrame2))
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Rejected { id_code: 99 });
        assert!(channel.is_empty());
        assert!(logs_contain("Rejected SendConfigurationFrame2 for ID code 99"));
    }

    #[test]
    fn test_configuration_and_header_requests() {
        let (publisher, channel, _) = publisher(settings());
        publisher.create_new_configuration_frame(&config("A")).unwrap();

        let outcome = publisher
            .device_command_handler(&command(7, DeviceCommand::SendConfigurationFrame2))
            .unwrap();
        assert_eq!(outcome, CommandOutcome::SentConfiguration(ConfigurationKind::Cfg2));
        assert_eq!(
            channel.take(),
            vec![publisher.configuration_image(ConfigurationKind::Cfg2).unwrap()]
        );

        let outcome = publisher
            .device_command_handler(&command(7, DeviceCommand::SendHeaderFrame))
            .unwrap();
        assert_eq!(outcome, CommandOutcome::SentHeader);
        let sent = channel.take();
        let codec = IeeeC37118Codec::new(Version::V2011);
        let DecodedFrame::Header { text, .. } = codec.decode(&sent[0], None, true).unwrap() else {
            panic!("expected a header frame");
        };
        assert!(text.contains("IEEEC37_118V2"));
        assert!(text.contains("ID code 7"));
    }

    #[test]
    fn test_real_time_data_commands_respect_auto_start() {
        let (publisher, _, _) = publisher(settings());
        assert!(matches!(
            publisher
                .device_command_handler(&command(7, DeviceCommand::DisableRealTimeData))
                .unwrap(),
            CommandOutcome::Ignored(DeviceCommand::DisableRealTimeData)
        ));
        assert!(publisher.is_data_enabled());

        let (manual, channel, _) = self::publisher(PublisherSettings {
            auto_start_data_channel: false,
            ..settings()
        });
        manual.create_new_configuration_frame(&config("A")).unwrap();
        assert!(!manual.is_data_enabled());
        manual.publish_frame(&config("A").empty_frame(T0)).unwrap();
        assert!(channel.is_empty());

        assert_eq!(
            manual
                .device_command_handler(&command(7, DeviceCommand::EnableRealTimeData))
                .unwrap(),
            CommandOutcome::DataChannelStarted
        );
        manual.publish_frame(&config("A").empty_frame(T0)).unwrap();
        assert_eq!(channel.len(), 1);
        assert_eq!(
            manual
                .device_command_handler(&command(7, DeviceCommand::DisableRealTimeData))
                .unwrap(),
            CommandOutcome::DataChannelStopped
        );
    }

    #[test]
    fn test_malformed_commands_change_nothing() {
        let (publisher, channel, _) = publisher(settings());
        let mut bytes = command(7, DeviceCommand::SendConfigurationFrame2);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(publisher.device_command_handler(&bytes).is_err());
        assert!(publisher.device_command_handler(&[0xAA]).is_err());
        assert!(channel.is_empty());

        let outcome = publisher
            .device_command_handler(&command(7, DeviceCommand::ExtendedFrame(vec![1, 2])))
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Ignored(DeviceCommand::ExtendedFrame(_))));
    }

    #[test]
    fn test_auto_publish_configuration_once_per_second() {
        let (publisher, channel, _) = publisher(PublisherSettings {
            auto_publish_configuration_frame: true,
            ..settings()
        });
        let config = config("A");
        publisher.create_new_configuration_frame(&config).unwrap();
        for i in 0..60 {
            publisher
                .publish_frame(&config.empty_frame(T0 + i * TICKS_PER_SECOND / 30))
                .unwrap();
        }
        let cfg2 = publisher.configuration_image(ConfigurationKind::Cfg2).unwrap();
        let sent = channel.take();
        assert_eq!(sent.len(), 62);
        assert_eq!(sent.iter().filter(|f| **f == cfg2).count(), 2);
        assert_eq!(sent[0], cfg2);
        assert_eq!(sent[31], cfg2);
        assert!(publisher.status().contains("Published frames: 60"));
    }
}
