use super::connection_string::ConnectionString;
use super::ParserError;
use crate::codec::{FrameKind, PhasorProtocol};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_ALLOWED_PARSING_EXCEPTIONS: u32 = 10;
pub const DEFAULT_PARSING_EXCEPTION_WINDOW: f64 = 5.0;
pub const DEFAULT_DEFINED_FRAME_RATE: f64 = 30.0;
pub const DEFAULT_ACCESS_ID: u16 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerialParity {
    #[default]
    None,
    Odd,
    Even,
}

impl FromStr for SerialParity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(SerialParity::None),
            "odd" => Ok(SerialParity::Odd),
            "even" => Ok(SerialParity::Even),
            _ => Err(()),
        }
    }
}

/// Where the parser reads its bytes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransportSettings {
    /// TCP client connected to `server` (`host:port`).
    Tcp { server: String },
    /// UDP listener on `interface:local_port`. Commands go to `server` when given,
    /// otherwise to the last peer heard from.
    Udp {
        interface: String,
        local_port: u16,
        server: Option<String>,
    },
    Serial {
        port: String,
        baud_rate: u32,
        parity: SerialParity,
        stop_bits: u8,
        data_bits: u8,
    },
    /// Captured stream replayed from disk.
    File { path: PathBuf },
}

impl TransportSettings {
    pub fn is_file(&self) -> bool {
        matches!(self, TransportSettings::File { .. })
    }

    fn from_connection_string(cs: &ConnectionString) -> Result<Self, ParserError> {
        let protocol = match cs.get_any(&["transportProtocol", "protocol"]) {
            Some(p) => p.trim().to_ascii_lowercase(),
            None if cs.contains("file") => "file".to_string(),
            None if cs.contains("server") => "tcp".to_string(),
            None => "udp".to_string(),
        };

        match protocol.as_str() {
            "tcp" => Ok(TransportSettings::Tcp {
                server: required(cs, "server")?,
            }),
            "udp" => Ok(TransportSettings::Udp {
                interface: cs.get("interface").unwrap_or("0.0.0.0").to_string(),
                local_port: match cs.parse_value::<u16>("localport")? {
                    Some(port) => port,
                    None => cs
                        .parse_value::<u16>("port")?
                        .ok_or_else(|| ParserError::MissingSetting("localPort".to_string()))?,
                },
                server: cs.get("server").map(str::to_string),
            }),
            "serial" => Ok(TransportSettings::Serial {
                port: required(cs, "port")?,
                baud_rate: cs.parse_value("baudRate")?.unwrap_or(115_200),
                parity: cs.parse_value("parity")?.unwrap_or_default(),
                stop_bits: cs.parse_value("stopBits")?.unwrap_or(1),
                data_bits: cs.parse_value("dataBits")?.unwrap_or(8),
            }),
            "file" => Ok(TransportSettings::File {
                path: PathBuf::from(required(cs, "file")?),
            }),
            other => Err(ParserError::InvalidSetting {
                key: "transportProtocol".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for TransportSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSettings::Tcp { server } => write!(f, "tcp://{}", server),
            TransportSettings::Udp {
                interface,
                local_port,
                ..
            } => write!(f, "udp://{}:{}", interface, local_port),
            TransportSettings::Serial { port, baud_rate, .. } => {
                write!(f, "serial://{}@{}", port, baud_rate)
            }
            TransportSettings::File { path } => write!(f, "file://{}", path.display()),
        }
    }
}

fn required(cs: &ConnectionString, key: &str) -> Result<String, ParserError> {
    cs.get(key)
        .map(str::to_string)
        .ok_or_else(|| ParserError::MissingSetting(key.to_string()))
}

/// Frame kinds whose checksums are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumValidation {
    pub data: bool,
    pub configuration: bool,
    pub header: bool,
    pub command: bool,
}

impl ChecksumValidation {
    pub const ALL: ChecksumValidation = ChecksumValidation {
        data: true,
        configuration: true,
        header: true,
        command: true,
    };

    pub const NONE: ChecksumValidation = ChecksumValidation {
        data: false,
        configuration: false,
        header: false,
        command: false,
    };

    pub fn contains(&self, kind: FrameKind) -> bool {
        match kind {
            FrameKind::Data => self.data,
            FrameKind::Configuration => self.configuration,
            FrameKind::Header => self.header,
            FrameKind::Command => self.command,
        }
    }
}

impl Default for ChecksumValidation {
    fn default() -> Self {
        ChecksumValidation::ALL
    }
}

impl FromStr for ChecksumValidation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut validation = ChecksumValidation::NONE;
        for item in s.split(['|', ',']).map(str::trim).filter(|i| !i.is_empty()) {
            match item.to_ascii_lowercase().as_str() {
                "noframes" => {}
                "allframes" => validation = ChecksumValidation::ALL,
                "dataframe" => validation.data = true,
                "configurationframe" => validation.configuration = true,
                "headerframe" => validation.header = true,
                "commandframe" => validation.command = true,
                other => return Err(other.to_string()),
            }
        }
        Ok(validation)
    }
}

/// Everything the parser needs to connect and decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserSettings {
    pub phasor_protocol: PhasorProtocol,
    pub transport: TransportSettings,
    /// Separate TCP channel for commands and their replies.
    pub command_channel: Option<TransportSettings>,
    /// ID code used in commands. When set, frames for other ID codes are ignored.
    pub access_id: Option<u16>,
    pub checksum_validation: ChecksumValidation,
    pub allowed_parsing_exceptions: u32,
    /// Seconds.
    pub parsing_exception_window: f64,
    pub auto_repeat_captured_playback: bool,
    pub auto_start_data_parsing_sequence: bool,
    pub skip_disable_real_time_data: bool,
    /// Re-stamp data frames with the local clock.
    pub simulate_timestamp: bool,
    /// Data frames per second during file playback; zero plays unpaced.
    pub defined_frame_rate: f64,
    pub buffer_size: usize,
    /// Zero or negative retries forever.
    pub maximum_connection_attempts: i32,
    /// Seconds between connection attempts.
    pub reconnect_delay: f64,
    pub event_queue_size: usize,
}

impl ParserSettings {
    pub fn new(phasor_protocol: PhasorProtocol, transport: TransportSettings) -> Self {
        ParserSettings {
            phasor_protocol,
            transport,
            command_channel: None,
            access_id: None,
            checksum_validation: ChecksumValidation::ALL,
            allowed_parsing_exceptions: DEFAULT_ALLOWED_PARSING_EXCEPTIONS,
            parsing_exception_window: DEFAULT_PARSING_EXCEPTION_WINDOW,
            auto_repeat_captured_playback: false,
            auto_start_data_parsing_sequence: true,
            skip_disable_real_time_data: false,
            simulate_timestamp: false,
            defined_frame_rate: DEFAULT_DEFINED_FRAME_RATE,
            buffer_size: super::assembler::DEFAULT_BUFFER_SIZE,
            maximum_connection_attempts: -1,
            reconnect_delay: 5.0,
            event_queue_size: 1024,
        }
    }

    pub fn from_connection_string(input: &str) -> Result<Self, ParserError> {
        let cs = ConnectionString::parse(input)?;

        let phasor_protocol = match cs.get("phasorProtocol") {
            Some(p) => p.parse::<PhasorProtocol>()?,
            None => PhasorProtocol::default(),
        };
        let mut settings =
            ParserSettings::new(phasor_protocol, TransportSettings::from_connection_string(&cs)?);

        if let Some(nested) = cs.get("commandChannel") {
            let nested = ConnectionString::parse(nested)?;
            match TransportSettings::from_connection_string(&nested)? {
                tcp @ TransportSettings::Tcp { .. } => settings.command_channel = Some(tcp),
                other => {
                    return Err(ParserError::InvalidSetting {
                        key: "commandChannel".to_string(),
                        value: other.to_string(),
                    })
                }
            }
        }

        settings.access_id = cs.parse_value("accessID")?;
        if let Some(validation) = cs.get("checkSumValidationFrameTypes") {
            settings.checksum_validation =
                validation
                    .parse()
                    .map_err(|value| ParserError::InvalidSetting {
                        key: "checkSumValidationFrameTypes".to_string(),
                        value,
                    })?;
        }
        if let Some(v) = cs.parse_value("allowedParsingExceptions")? {
            settings.allowed_parsing_exceptions = v;
        }
        if let Some(v) = cs.parse_value("parsingExceptionWindow")? {
            settings.parsing_exception_window = v;
        }
        if let Some(v) = cs.parse_bool("autoRepeatCapturedPlayback")? {
            settings.auto_repeat_captured_playback = v;
        }
        if let Some(v) = cs.parse_bool("autoStartDataParsingSequence")? {
            settings.auto_start_data_parsing_sequence = v;
        }
        if let Some(v) = cs.parse_bool("skipDisableRealTimeData")? {
            settings.skip_disable_real_time_data = v;
        }
        if let Some(v) = cs.parse_bool("simulateTimestamp")? {
            settings.simulate_timestamp = v;
        }
        if let Some(v) = cs.parse_value("definedFrameRate")? {
            settings.defined_frame_rate = v;
        }
        if let Some(v) = cs.parse_value("bufferSize")? {
            settings.buffer_size = v;
        }
        if let Some(v) = cs.parse_value("maximumConnectionAttempts")? {
            settings.maximum_connection_attempts = v;
        }
        if let Some(v) = cs.parse_value("reconnectDelay")? {
            settings.reconnect_delay = v;
        }
        if let Some(v) = cs.parse_value("eventQueueSize")? {
            settings.event_queue_size = v;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ParserError> {
        let invalid = |key: &str, value: String| ParserError::InvalidSetting {
            key: key.to_string(),
            value,
        };
        if self.buffer_size == 0 {
            return Err(invalid("bufferSize", "0".to_string()));
        }
        if self.event_queue_size == 0 {
            return Err(invalid("eventQueueSize", "0".to_string()));
        }
        if !(self.parsing_exception_window > 0.0) {
            return Err(invalid(
                "parsingExceptionWindow",
                self.parsing_exception_window.to_string(),
            ));
        }
        if !(self.defined_frame_rate >= 0.0) {
            return Err(invalid("definedFrameRate", self.defined_frame_rate.to_string()));
        }
        if !(self.reconnect_delay >= 0.0) {
            return Err(invalid("reconnectDelay", self.reconnect_delay.to_string()));
        }
        Ok(())
    }

    /// ID code stamped on outgoing commands.
    pub fn command_id_code(&self) -> u16 {
        self.access_id.unwrap_or(DEFAULT_ACCESS_ID)
    }
}
