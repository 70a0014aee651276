//! # IEC 61850-90-5 Common Definitions
//!
//! Session constants, security/signature algorithm identifiers and the sampled
//! value tag helpers used by the ASDU codec. Tags are expressed as [`Tag`] values
//! from the BER primitives; values use definite-form lengths except for the
//! container tags, which always carry a fixed two-octet long-form length.

use crate::ber::{decode_length, write_length, Tag, TagClass, TagForm};
use crate::codec::CodecError;
use crate::ieee_c37_118::common::ParseError;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

/// Fractional-second resolution of the ASDU refresh time.
pub const TIMEBASE: u32 = 16_777_216;

/// CLTP length indicator: header length with an empty variable part.
pub const CLTP_LENGTH_INDICATOR: u8 = 0x01;
/// Connectionless transport protocol marker, second byte of every data frame.
pub const CLTP_TAG: u8 = 0x40;
pub const SESSION_TYPE_SAMPLED_VALUES: u8 = 0xA2;
pub const SESSION_HEADER_SIZE: u8 = 0x18;
/// Payload type tag for sampled values.
pub const PAYLOAD_SAMPLED_VALUES: u8 = 0x82;
pub const SIGNATURE_TAG: u8 = 0x85;

/// Fixed size of the session header plus the SV PDU preamble.
pub const HEADER_SIZE: usize = 49;

const KEY_BLOCK: [u8; 16] = [
    0x01, 0x33, 0x34, 0x35, 0x36, 0x37, 0x01, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x66, 0x77, 0x88,
];

/// Key shared by draft IEC 61850-90-5 implementations for packet signatures: the
/// 16-byte block repeated eight times.
pub const DUMMY_KEY: [u8; 128] = {
    let mut key = [0u8; 128];
    let mut i = 0;
    while i < 128 {
        key[i] = KEY_BLOCK[i % 16];
        i += 1;
    }
    key
};

pub const SV_PDU: Tag = Tag::new(TagClass::Application, TagForm::Constructed, 0);
pub const ASDU_COUNT: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 0);
pub const SEQUENCE_OF_ASDU: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Constructed, 2);
pub const ASDU_SEQUENCE: Tag = Tag::new(TagClass::Universal, TagForm::Constructed, 16);
pub const MSV_ID: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 0);
pub const DATASET: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 1);
pub const SMP_CNT: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 2);
pub const CONF_REV: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 3);
pub const REFR_TM: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 4);
pub const SMP_SYNCH: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 5);
pub const SMP_RATE: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 6);
pub const SAMPLES: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 7);
pub const SMP_MOD: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 8);
pub const UTC_TIMESTAMP: Tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 9);

/// Packet signature algorithm, byte 23 of the session header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[default]
    None,
    Sha80,
    Sha128,
    Sha256,
    Aes64,
    Aes128,
}

impl SignatureAlgorithm {
    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(SignatureAlgorithm::None),
            1 => Ok(SignatureAlgorithm::Sha80),
            2 => Ok(SignatureAlgorithm::Sha128),
            3 => Ok(SignatureAlgorithm::Sha256),
            4 => Ok(SignatureAlgorithm::Aes64),
            5 => Ok(SignatureAlgorithm::Aes128),
            other => Err(CodecError::Malformed(format!(
                "invalid signature algorithm 0x{:02X}",
                other
            ))),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            SignatureAlgorithm::None => 0,
            SignatureAlgorithm::Sha80 => 1,
            SignatureAlgorithm::Sha128 => 2,
            SignatureAlgorithm::Sha256 => 3,
            SignatureAlgorithm::Aes64 => 4,
            SignatureAlgorithm::Aes128 => 5,
        }
    }

    /// Length of the truncated MAC.
    pub fn digest_len(self) -> usize {
        match self {
            SignatureAlgorithm::None => 0,
            SignatureAlgorithm::Sha80 => 10,
            SignatureAlgorithm::Sha128 | SignatureAlgorithm::Aes128 => 16,
            SignatureAlgorithm::Sha256 => 32,
            SignatureAlgorithm::Aes64 => 8,
        }
    }

    /// Bytes the signature adds after the SPDU: the tag plus the digest.
    pub fn trailer_len(self) -> usize {
        match self {
            SignatureAlgorithm::None => 0,
            other => 1 + other.digest_len(),
        }
    }

    /// Computes the truncated MAC of `data` with the shared key.
    ///
    /// Every algorithm uses HMAC-SHA256 and keeps its own digest length.
    pub fn sign(self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        if self == SignatureAlgorithm::None {
            return Ok(Vec::new());
        }
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&DUMMY_KEY)
            .map_err(|e| CodecError::Unsupported(format!("signature key: {}", e)))?;
        mac.update(data);
        let digest = mac.finalize().into_bytes();
        Ok(digest[..self.digest_len()].to_vec())
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignatureAlgorithm::None => "None",
            SignatureAlgorithm::Sha80 => "SHA 256/80",
            SignatureAlgorithm::Sha128 => "SHA 256/128",
            SignatureAlgorithm::Sha256 => "SHA 256/256",
            SignatureAlgorithm::Aes64 => "AES GMAC 64",
            SignatureAlgorithm::Aes128 => "AES GMAC 128",
        };
        write!(f, "{}", name)
    }
}

/// Payload encryption algorithm, byte 22 of the session header. Payloads are never
/// encrypted here; the identifier is carried for interoperability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SecurityAlgorithm {
    #[default]
    None,
    Aes128,
    Aes256,
}

impl SecurityAlgorithm {
    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        match byte {
            0 => Ok(SecurityAlgorithm::None),
            1 => Ok(SecurityAlgorithm::Aes128),
            2 => Ok(SecurityAlgorithm::Aes256),
            other => Err(CodecError::Malformed(format!(
                "invalid security algorithm 0x{:02X}",
                other
            ))),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            SecurityAlgorithm::None => 0,
            SecurityAlgorithm::Aes128 => 1,
            SecurityAlgorithm::Aes256 => 2,
        }
    }
}

impl fmt::Display for SecurityAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityAlgorithm::None => write!(f, "None"),
            SecurityAlgorithm::Aes128 => write!(f, "AES 128"),
            SecurityAlgorithm::Aes256 => write!(f, "AES 256"),
        }
    }
}

/// Writes `tag` with a fixed long-form length: `tag 0x82 hi lo`.
pub fn write_fixed_length(tag: Tag, length: u16, out: &mut Vec<u8>) {
    out.push(tag.identifier_octet());
    out.push(0x82);
    out.extend_from_slice(&length.to_be_bytes());
}

fn write_value(tag: Tag, value: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
    out.push(tag.identifier_octet());
    write_length(value.len() as u64, out)?;
    out.extend_from_slice(value);
    Ok(())
}

pub fn write_u8_tag(tag: Tag, value: u8, out: &mut Vec<u8>) -> Result<(), CodecError> {
    write_value(tag, &[value], out)
}

pub fn write_u16_tag(tag: Tag, value: u16, out: &mut Vec<u8>) -> Result<(), CodecError> {
    write_value(tag, &value.to_be_bytes(), out)
}

pub fn write_u32_tag(tag: Tag, value: u32, out: &mut Vec<u8>) -> Result<(), CodecError> {
    write_value(tag, &value.to_be_bytes(), out)
}

pub fn write_u64_tag(tag: Tag, value: u64, out: &mut Vec<u8>) -> Result<(), CodecError> {
    write_value(tag, &value.to_be_bytes(), out)
}

/// Writes an ASCII string value. Non-ASCII characters become `?`.
pub fn write_string_tag(tag: Tag, value: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if value.len() > u16::MAX as usize {
        return Err(CodecError::Malformed(format!(
            "string of {} bytes exceeds the 65535 byte tag limit",
            value.len()
        )));
    }
    let ascii: Vec<u8> = value
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect();
    write_value(tag, &ascii, out)
}

/// Sequential reader over sampled value tags.
pub struct TagReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> TagReader<'a> {
    pub fn new(bytes: &'a [u8], offset: usize) -> Self {
        TagReader { bytes, offset }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn peek(&self) -> Option<u8> {
        self.bytes.get(self.offset).copied()
    }

    pub fn next_is(&self, tag: Tag) -> bool {
        self.peek() == Some(tag.identifier_octet())
    }

    /// Checks that the next tag is `tag` and returns its value length.
    pub fn expect(&mut self, tag: Tag) -> Result<usize, CodecError> {
        match self.peek() {
            Some(octet) if octet == tag.identifier_octet() => {}
            Some(octet) => {
                return Err(CodecError::Malformed(format!(
                    "out-of-sequence or unknown sampled value tag 0x{:02X}, expected 0x{:02X}",
                    octet,
                    tag.identifier_octet()
                )))
            }
            None => {
                return Err(ParseError::InvalidLength {
                    message: format!("missing sampled value tag 0x{:02X}", tag.identifier_octet()),
                }
                .into())
            }
        }
        let (length, used) = decode_length(&self.bytes[self.offset + 1..])?;
        self.offset += 1 + used;
        Ok(length as usize)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.offset + n;
        if end > self.bytes.len() {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "sampled value needs {} bytes at offset {}, {} available",
                    n,
                    self.offset,
                    self.bytes.len().saturating_sub(self.offset)
                ),
            }
            .into());
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn value<const N: usize>(&mut self, tag: Tag) -> Result<[u8; N], CodecError> {
        let length = self.expect(tag)?;
        if length != N {
            return Err(CodecError::Malformed(format!(
                "tag 0x{:02X} has length {}, expected {}",
                tag.identifier_octet(),
                length,
                N
            )));
        }
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self, tag: Tag) -> Result<u8, CodecError> {
        Ok(self.value::<1>(tag)?[0])
    }

    pub fn read_u16(&mut self, tag: Tag) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.value::<2>(tag)?))
    }

    pub fn read_u32(&mut self, tag: Tag) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.value::<4>(tag)?))
    }

    pub fn read_u64(&mut self, tag: Tag) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.value::<8>(tag)?))
    }

    pub fn read_string(&mut self, tag: Tag) -> Result<String, CodecError> {
        let length = self.expect(tag)?;
        Ok(String::from_utf8_lossy(self.take(length)?).into_owned())
    }

    /// Skips `tag` and its value when it is next.
    pub fn skip_optional(&mut self, tag: Tag) -> Result<(), CodecError> {
        if self.next_is(tag) {
            let length = self.expect(tag)?;
            self.take(length)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_octets() {
        assert_eq!(SV_PDU.identifier_octet(), 0x60);
        assert_eq!(ASDU_COUNT.identifier_octet(), 0x80);
        assert_eq!(SEQUENCE_OF_ASDU.identifier_octet(), 0xA2);
        assert_eq!(ASDU_SEQUENCE.identifier_octet(), 0x30);
        assert_eq!(SAMPLES.identifier_octet(), 0x87);
        assert_eq!(UTC_TIMESTAMP.identifier_octet(), 0x89);
    }

    #[test]
    fn test_tag_values_read_back() {
        let mut out = Vec::new();
        write_string_tag(MSV_ID, "235_SHELBY", &mut out).unwrap();
        write_u16_tag(SMP_CNT, 0xBEEF, &mut out).unwrap();
        write_u32_tag(CONF_REV, 7, &mut out).unwrap();
        write_u64_tag(REFR_TM, 0x0102_0304_0506_0708, &mut out).unwrap();
        write_u8_tag(SMP_SYNCH, 1, &mut out).unwrap();
        write_fixed_length(SAMPLES, 3, &mut out);
        out.extend_from_slice(&[9, 9, 9]);

        assert_eq!(&out[..2], &[0x80, 10]);
        assert_eq!(&out[12..16], &[0x82, 0x02, 0xBE, 0xEF]);

        let mut reader = TagReader::new(&out, 0);
        assert_eq!(reader.read_string(MSV_ID).unwrap(), "235_SHELBY");
        assert_eq!(reader.read_u16(SMP_CNT).unwrap(), 0xBEEF);
        assert_eq!(reader.read_u32(CONF_REV).unwrap(), 7);
        assert_eq!(reader.read_u64(REFR_TM).unwrap(), 0x0102_0304_0506_0708);
        reader.skip_optional(SMP_RATE).unwrap();
        assert_eq!(reader.read_u8(SMP_SYNCH).unwrap(), 1);
        assert_eq!(reader.expect(SAMPLES).unwrap(), 3);
        assert_eq!(reader.take(3).unwrap(), &[9, 9, 9]);
        assert!(reader.take(1).is_err());
    }

    #[test]
    fn test_tag_validation_failures() {
        let bytes = [0x83, 0x02, 0x00, 0x01];
        let mut reader = TagReader::new(&bytes, 0);
        assert!(matches!(reader.read_u16(SMP_CNT), Err(CodecError::Malformed(_))));
        // Right tag, wrong width.
        assert!(matches!(reader.read_u32(CONF_REV), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_signature_lengths() {
        assert_eq!(SignatureAlgorithm::Sha80.sign(b"frame").unwrap().len(), 10);
        assert_eq!(SignatureAlgorithm::Aes64.trailer_len(), 9);
        assert_eq!(SignatureAlgorithm::Sha256.trailer_len(), 33);
        assert!(SignatureAlgorithm::None.sign(b"frame").unwrap().is_empty());
        assert!(SignatureAlgorithm::from_byte(9).is_err());
    }
}
