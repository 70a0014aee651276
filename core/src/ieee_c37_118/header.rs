//! # IEEE C37.118 Header Frame
//!
//! A header frame carries free-form ASCII text between the prefix and the CRC.

use super::common::{FrameType, ParseError, PrefixFrame, Version, CHECKSUM_SIZE, PREFIX_SIZE};
use super::utils::{append_checksum, validate_checksum};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderFrame {
    pub prefix: PrefixFrame,
    pub text: String,
}

impl HeaderFrame {
    pub fn new(idcode: u16, version: Version, soc: u32, fracsec: u32, text: impl Into<String>) -> Self {
        HeaderFrame {
            prefix: PrefixFrame::new(version, FrameType::Header, idcode).with_time(soc, fracsec),
            text: text.into(),
        }
    }

    pub fn from_hex(bytes: &[u8], verify_checksum: bool) -> Result<Self, ParseError> {
        let prefix = PrefixFrame::from_hex(bytes)?;
        if prefix.frame_type()? != FrameType::Header {
            return Err(ParseError::InvalidFrameType {
                message: format!("HeaderFrame: SYNC 0x{:04X} is not a header frame", prefix.sync),
            });
        }
        if bytes.len() < PREFIX_SIZE + CHECKSUM_SIZE {
            return Err(ParseError::InvalidLength {
                message: format!("HeaderFrame: {} bytes is shorter than prefix and CRC", bytes.len()),
            });
        }
        prefix.expect_framesize(bytes.len(), "HeaderFrame")?;
        if verify_checksum {
            validate_checksum(bytes)?;
        }

        let body = &bytes[PREFIX_SIZE..bytes.len() - CHECKSUM_SIZE];
        if !body.is_ascii() {
            return Err(ParseError::InvalidHeader {
                message: "header text is not ASCII".to_string(),
            });
        }
        Ok(HeaderFrame {
            prefix,
            text: String::from_utf8_lossy(body).to_string(),
        })
    }

    /// Non-ASCII characters are replaced with `?`.
    pub fn to_hex(&self) -> Result<Vec<u8>, ParseError> {
        let text: Vec<u8> = self
            .text
            .chars()
            .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
            .collect();
        let frame_size = PREFIX_SIZE + text.len() + CHECKSUM_SIZE;
        if frame_size > u16::MAX as usize {
            return Err(ParseError::InvalidLength {
                message: format!("HeaderFrame: {} bytes exceeds the 65535 byte frame limit", frame_size),
            });
        }
        let mut prefix = self.prefix.clone();
        prefix.framesize = frame_size as u16;

        let mut result = Vec::with_capacity(frame_size);
        result.extend_from_slice(&prefix.to_hex());
        result.extend_from_slice(&text);
        append_checksum(&mut result);
        Ok(result)
    }
}
