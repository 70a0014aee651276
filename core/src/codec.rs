//! # Protocol Codecs
//!
//! The protocol-neutral seam between the canonical model and the wire. Each supported
//! phasor protocol implements [`ProtocolCodec`]; the parser uses it to find, size and
//! decode frames in a byte stream and the publisher uses it to project configurations
//! and encode data, header and command frames.
//!
//! Codecs are pure: no I/O happens here. The IEC 61850-90-5 codec does keep sample
//! and packet counters plus its ASDU cascade, so codecs are shared behind `Arc`.

use crate::ber::BerError;
use crate::iec61850_90_5::{Iec61850Codec, Iec61850Options};
use crate::ieee_c37_118::codec::IeeeC37118Codec;
use crate::ieee_c37_118::common::{ParseError, Version};
use crate::measurement::Ticks;
use crate::model::{ConfigurationFrame, Frame};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Wire protocols a stream can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhasorProtocol {
    /// IEEE C37.118-2005.
    IeeeC37_118V1,
    /// IEEE C37.118.2-2011.
    IeeeC37_118V2,
    /// IEEE C37.118.2-2024.
    IeeeC37_118V3,
    Iec61850_90_5,
}

impl PhasorProtocol {
    /// The C37.118 revision used for frames of this protocol. IEC 61850-90-5 borrows
    /// the 2011 layout for its configuration and command frames.
    pub fn c37_version(&self) -> Version {
        match self {
            PhasorProtocol::IeeeC37_118V1 => Version::V2005,
            PhasorProtocol::IeeeC37_118V2 | PhasorProtocol::Iec61850_90_5 => Version::V2011,
            PhasorProtocol::IeeeC37_118V3 => Version::V2024,
        }
    }

    pub fn supports_config3(&self) -> bool {
        match self {
            PhasorProtocol::Iec61850_90_5 => false,
            other => other.c37_version().supports_config3(),
        }
    }
}

impl Default for PhasorProtocol {
    fn default() -> Self {
        PhasorProtocol::IeeeC37_118V2
    }
}

impl FromStr for PhasorProtocol {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "IEEEC37_118V1" | "IEEEC37_118D6" => Ok(PhasorProtocol::IeeeC37_118V1),
            "IEEEC37_118V2" => Ok(PhasorProtocol::IeeeC37_118V2),
            "IEEEC37_118V3" => Ok(PhasorProtocol::IeeeC37_118V3),
            "IEC61850_90_5" => Ok(PhasorProtocol::Iec61850_90_5),
            other => Err(CodecError::Unsupported(format!("phasor protocol '{}'", other))),
        }
    }
}

impl fmt::Display for PhasorProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhasorProtocol::IeeeC37_118V1 => write!(f, "IEEEC37_118V1"),
            PhasorProtocol::IeeeC37_118V2 => write!(f, "IEEEC37_118V2"),
            PhasorProtocol::IeeeC37_118V3 => write!(f, "IEEEC37_118V3"),
            PhasorProtocol::Iec61850_90_5 => write!(f, "IEC61850_90_5"),
        }
    }
}

/// Protocol-neutral device commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceCommand {
    DisableRealTimeData,
    EnableRealTimeData,
    SendHeaderFrame,
    SendConfigurationFrame1,
    SendConfigurationFrame2,
    SendConfigurationFrame3,
    ExtendedFrame(Vec<u8>),
    /// A command code the protocol does not define.
    Reserved(u16),
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCommand::DisableRealTimeData => write!(f, "DisableRealTimeData"),
            DeviceCommand::EnableRealTimeData => write!(f, "EnableRealTimeData"),
            DeviceCommand::SendHeaderFrame => write!(f, "SendHeaderFrame"),
            DeviceCommand::SendConfigurationFrame1 => write!(f, "SendConfigurationFrame1"),
            DeviceCommand::SendConfigurationFrame2 => write!(f, "SendConfigurationFrame2"),
            DeviceCommand::SendConfigurationFrame3 => write!(f, "SendConfigurationFrame3"),
            DeviceCommand::ExtendedFrame(data) => write!(f, "ExtendedFrame({} bytes)", data.len()),
            DeviceCommand::Reserved(code) => write!(f, "Reserved({})", code),
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Ber(#[from] BerError),
    #[error("a configuration frame is required before data frames can be decoded")]
    MissingConfiguration,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigurationKind {
    Cfg1,
    Cfg2,
    Cfg3,
}

impl ConfigurationKind {
    pub fn for_command(command: &DeviceCommand) -> Option<Self> {
        match command {
            DeviceCommand::SendConfigurationFrame1 => Some(ConfigurationKind::Cfg1),
            DeviceCommand::SendConfigurationFrame2 => Some(ConfigurationKind::Cfg2),
            DeviceCommand::SendConfigurationFrame3 => Some(ConfigurationKind::Cfg3),
            _ => None,
        }
    }
}

/// The encoded configuration images of one canonical configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigurationImages {
    pub cfg1: Option<Vec<u8>>,
    pub cfg2: Option<Vec<u8>>,
    pub cfg3: Option<Vec<u8>>,
}

impl ConfigurationImages {
    pub fn image(&self, kind: ConfigurationKind) -> Option<&[u8]> {
        match kind {
            ConfigurationKind::Cfg1 => self.cfg1.as_deref(),
            ConfigurationKind::Cfg2 => self.cfg2.as_deref(),
            ConfigurationKind::Cfg3 => self.cfg3.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataFrameOptions {
    /// Sets the configuration-changed status bit in every cell.
    pub config_changed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    Data,
    Configuration,
    Header,
    Command,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Data => write!(f, "DataFrame"),
            FrameKind::Configuration => write!(f, "ConfigurationFrame"),
            FrameKind::Header => write!(f, "HeaderFrame"),
            FrameKind::Command => write!(f, "CommandFrame"),
        }
    }
}

/// Result of sizing the frame at the head of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLength {
    /// More bytes are needed before the length is known or the frame is whole.
    Incomplete,
    Complete(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    Configuration {
        kind: ConfigurationKind,
        frame: ConfigurationFrame,
    },
    Data {
        id_code: u16,
        frame: Frame,
    },
    Header {
        id_code: u16,
        timestamp: Ticks,
        text: String,
    },
    Command {
        id_code: u16,
        command: DeviceCommand,
    },
}

impl DecodedFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            DecodedFrame::Configuration { .. } => FrameKind::Configuration,
            DecodedFrame::Data { .. } => FrameKind::Data,
            DecodedFrame::Header { .. } => FrameKind::Header,
            DecodedFrame::Command { .. } => FrameKind::Command,
        }
    }

    pub fn id_code(&self) -> u16 {
        match self {
            DecodedFrame::Configuration { frame, .. } => frame.id_code,
            DecodedFrame::Data { id_code, .. }
            | DecodedFrame::Header { id_code, .. }
            | DecodedFrame::Command { id_code, .. } => *id_code,
        }
    }
}

/// Frame grammar of one phasor protocol.
pub trait ProtocolCodec: Send + Sync {
    fn protocol(&self) -> PhasorProtocol;

    /// Projects `config` into every configuration image the protocol defines.
    fn project_configuration(
        &self,
        config: &ConfigurationFrame,
        revision: u16,
        timestamp: Ticks,
    ) -> Result<ConfigurationImages, CodecError>;

    fn encode_data_frame(
        &self,
        config: &ConfigurationFrame,
        frame: &Frame,
        options: DataFrameOptions,
    ) -> Result<Vec<u8>, CodecError>;

    fn encode_header_frame(
        &self,
        id_code: u16,
        timestamp: Ticks,
        time_base: u32,
        text: &str,
    ) -> Result<Vec<u8>, CodecError>;

    fn encode_command_frame(
        &self,
        id_code: u16,
        command: &DeviceCommand,
        timestamp: Ticks,
    ) -> Result<Vec<u8>, CodecError>;

    /// Offset of the first byte that can start a frame.
    fn find_sync(&self, buf: &[u8]) -> Option<usize>;

    /// Size of the frame starting at `buf[0]`.
    fn frame_length(&self, buf: &[u8]) -> Result<FrameLength, CodecError>;

    /// Kind of a complete frame, read from its header only.
    fn frame_kind(&self, frame: &[u8]) -> Result<FrameKind, CodecError>;

    /// Decodes one complete frame. Data frames need the active configuration.
    fn decode(
        &self,
        frame: &[u8],
        config: Option<&ConfigurationFrame>,
        verify_checksum: bool,
    ) -> Result<DecodedFrame, CodecError>;

    /// Extra lines for status reports.
    fn status(&self) -> String {
        String::new()
    }
}

/// Creates the codec for `protocol` with default options.
pub fn codec_for(protocol: PhasorProtocol) -> Arc<dyn ProtocolCodec> {
    match protocol {
        PhasorProtocol::Iec61850_90_5 => Arc::new(Iec61850Codec::new(Iec61850Options::default())),
        other => Arc::new(IeeeC37118Codec::new(other.c37_version())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names_are_case_insensitive() {
        assert_eq!(
            "ieeec37_118v2".parse::<PhasorProtocol>().unwrap(),
            PhasorProtocol::IeeeC37_118V2
        );
        assert_eq!(
            "IEEEC37_118D6".parse::<PhasorProtocol>().unwrap(),
            PhasorProtocol::IeeeC37_118V1
        );
        assert_eq!(
            "Iec61850_90_5".parse::<PhasorProtocol>().unwrap(),
            PhasorProtocol::Iec61850_90_5
        );
        assert!("BPAPDCstream".parse::<PhasorProtocol>().is_err());
        assert_eq!(PhasorProtocol::IeeeC37_118V3.to_string(), "IEEEC37_118V3");
    }

    #[test]
    fn test_codec_for_reports_its_protocol() {
        for protocol in [
            PhasorProtocol::IeeeC37_118V1,
            PhasorProtocol::IeeeC37_118V2,
            PhasorProtocol::IeeeC37_118V3,
            PhasorProtocol::Iec61850_90_5,
        ] {
            assert_eq!(codec_for(protocol).protocol(), protocol);
        }
        assert!(!PhasorProtocol::IeeeC37_118V1.supports_config3());
        assert!(PhasorProtocol::IeeeC37_118V3.supports_config3());
    }
}
