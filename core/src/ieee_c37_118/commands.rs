//! # IEEE C37.118 Command Frame Utilities
//!
//! Construction and parsing of command frames, which ask a device to start or stop
//! real-time data or to send a header or configuration frame.
//!
//! ## Key Components
//!
//! - `CommandFrame`: Prefix, command code, optional extended data and CRC.
//! - `CommandType`: The command codes defined by the standard.
//!
//! Command frames are also the command format of IEC 61850-90-5 streams.

use super::common::{FrameType, ParseError, PrefixFrame, Version, CHECKSUM_SIZE, PREFIX_SIZE};
use super::utils::{append_checksum, validate_checksum};
use crate::codec::DeviceCommand;
use serde::{Deserialize, Serialize};

/// Represents an IEEE C37.118 command frame.
///
/// # Fields
///
/// * `prefix`: Common frame prefix (SYNC, frame size, ID code, timestamp).
/// * `command`: 16-bit command code.
/// * `extended_data`: Optional additional data for extended commands.
/// * `chk`: CRC-CCITT checksum for frame validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFrame {
    pub prefix: PrefixFrame,
    pub command: u16,
    pub extended_data: Option<Vec<u8>>,
    pub chk: u16,
}

/// Command codes for IEEE C37.118 command frames.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CommandType {
    TurnOffTransmission = 1,
    TurnOnTransmission = 2,
    SendHeaderFrame = 3,
    SendConfigFrame1 = 4,
    SendConfigFrame2 = 5,
    SendConfigFrame3 = 6,
    SendExtendedFrame = 8,
}

impl CommandFrame {
    /// Parses a command frame from a byte slice.
    ///
    /// # Returns
    ///
    /// * `Ok(CommandFrame)`: The parsed command frame.
    /// * `Err(ParseError)`: If the frame is too short, is not a command frame, has an
    ///   invalid checksum, or its FRAMESIZE disagrees with the buffer.
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        Self::from_hex_with(bytes, true)
    }

    pub fn from_hex_with(bytes: &[u8], verify_checksum: bool) -> Result<Self, ParseError> {
        let minimum = PREFIX_SIZE + 2 + CHECKSUM_SIZE;
        if bytes.len() < minimum {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "CommandFrame: Expected at least {} bytes, but got {}",
                    minimum,
                    bytes.len()
                ),
            });
        }

        let prefix = PrefixFrame::from_hex(bytes)?;
        if prefix.frame_type()? != FrameType::Command {
            return Err(ParseError::InvalidFrameType {
                message: format!("CommandFrame: SYNC 0x{:04X} is not a command frame", prefix.sync),
            });
        }
        prefix.expect_framesize(bytes.len(), "CommandFrame")?;
        if verify_checksum {
            validate_checksum(bytes)?;
        }

        let command = u16::from_be_bytes([bytes[14], bytes[15]]);
        let extended_data = if bytes.len() > minimum {
            Some(bytes[16..bytes.len() - 2].to_vec())
        } else {
            None
        };
        let chk = u16::from_be_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);

        Ok(CommandFrame {
            prefix,
            command,
            extended_data,
            chk,
        })
    }

    /// Converts the command frame to bytes, filling FRAMESIZE and CHK.
    pub fn to_hex(&self) -> Vec<u8> {
        let ext_size = self.extended_data.as_ref().map_or(0, Vec::len);
        let mut prefix = self.prefix.clone();
        prefix.framesize = (PREFIX_SIZE + 2 + ext_size + CHECKSUM_SIZE) as u16;

        let mut result = Vec::with_capacity(prefix.framesize as usize);
        result.extend_from_slice(&prefix.to_hex());
        result.extend_from_slice(&self.command.to_be_bytes());
        if let Some(data) = &self.extended_data {
            result.extend_from_slice(data);
        }
        append_checksum(&mut result);
        result
    }

    /// Creates a command frame.
    ///
    /// # Parameters
    ///
    /// * `idcode`: Device identification code.
    /// * `version`: Standard version used in the SYNC word.
    /// * `cmd_type`: The command type.
    /// * `time`: Optional `(soc, fracsec)` timestamp.
    /// * `extended_data`: Optional additional data.
    pub fn new(
        idcode: u16,
        version: Version,
        cmd_type: CommandType,
        time: Option<(u32, u32)>,
        extended_data: Option<Vec<u8>>,
    ) -> Self {
        let (soc, fracsec) = time.unwrap_or((0, 0));
        CommandFrame {
            prefix: PrefixFrame::new(version, FrameType::Command, idcode).with_time(soc, fracsec),
            command: cmd_type as u16,
            extended_data,
            chk: 0,
        }
    }

    /// Creates a command frame for a protocol-neutral device command.
    pub fn from_device_command(
        idcode: u16,
        version: Version,
        command: &DeviceCommand,
        time: Option<(u32, u32)>,
    ) -> Self {
        let (soc, fracsec) = time.unwrap_or((0, 0));
        let (code, extended_data) = match command {
            DeviceCommand::DisableRealTimeData => (CommandType::TurnOffTransmission as u16, None),
            DeviceCommand::EnableRealTimeData => (CommandType::TurnOnTransmission as u16, None),
            DeviceCommand::SendHeaderFrame => (CommandType::SendHeaderFrame as u16, None),
            DeviceCommand::SendConfigurationFrame1 => (CommandType::SendConfigFrame1 as u16, None),
            DeviceCommand::SendConfigurationFrame2 => (CommandType::SendConfigFrame2 as u16, None),
            DeviceCommand::SendConfigurationFrame3 => (CommandType::SendConfigFrame3 as u16, None),
            DeviceCommand::ExtendedFrame(data) => {
                (CommandType::SendExtendedFrame as u16, Some(data.clone()))
            }
            DeviceCommand::Reserved(code) => (*code, None),
        };
        CommandFrame {
            prefix: PrefixFrame::new(version, FrameType::Command, idcode).with_time(soc, fracsec),
            command: code,
            extended_data,
            chk: 0,
        }
    }

    pub fn command_type(&self) -> Option<CommandType> {
        CommandType::try_from(self.command).ok()
    }

    /// The protocol-neutral form of this command. Unknown codes map to `Reserved`.
    pub fn device_command(&self) -> DeviceCommand {
        match self.command_type() {
            Some(CommandType::TurnOffTransmission) => DeviceCommand::DisableRealTimeData,
            Some(CommandType::TurnOnTransmission) => DeviceCommand::EnableRealTimeData,
            Some(CommandType::SendHeaderFrame) => DeviceCommand::SendHeaderFrame,
            Some(CommandType::SendConfigFrame1) => DeviceCommand::SendConfigurationFrame1,
            Some(CommandType::SendConfigFrame2) => DeviceCommand::SendConfigurationFrame2,
            Some(CommandType::SendConfigFrame3) => DeviceCommand::SendConfigurationFrame3,
            Some(CommandType::SendExtendedFrame) => {
                DeviceCommand::ExtendedFrame(self.extended_data.clone().unwrap_or_default())
            }
            None => DeviceCommand::Reserved(self.command),
        }
    }

    /// A human-readable description of the command.
    pub fn command_description(&self) -> String {
        match self.command_type() {
            Some(cmd_type) => cmd_type.to_string(),
            None => format!("Unknown command ({})", self.command),
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandType::TurnOffTransmission => write!(f, "Turn OFF real-time data transmission"),
            CommandType::TurnOnTransmission => write!(f, "Turn ON real-time data transmission"),
            CommandType::SendHeaderFrame => write!(f, "Send Header frame"),
            CommandType::SendConfigFrame1 => write!(f, "Send Configuration frame 1"),
            CommandType::SendConfigFrame2 => write!(f, "Send Configuration frame 2"),
            CommandType::SendConfigFrame3 => write!(f, "Send Configuration frame 3"),
            CommandType::SendExtendedFrame => write!(f, "Send Extended frame"),
        }
    }
}

impl TryFrom<u16> for CommandType {
    type Error = ParseError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CommandType::TurnOffTransmission),
            2 => Ok(CommandType::TurnOnTransmission),
            3 => Ok(CommandType::SendHeaderFrame),
            4 => Ok(CommandType::SendConfigFrame1),
            5 => Ok(CommandType::SendConfigFrame2),
            6 => Ok(CommandType::SendConfigFrame3),
            8 => Ok(CommandType::SendExtendedFrame),
            _ => Err(ParseError::InvalidFormat {
                message: format!("Invalid command type: {}", value),
            }),
        }
    }
}
