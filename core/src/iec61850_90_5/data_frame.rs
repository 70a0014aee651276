//! # IEC 61850-90-5 Data Frame
//!
//! A data frame is a connectionless transport (CLTP) session carrying one sampled
//! value PDU. The fixed 49-byte header is followed by `asdu_count` ASDUs, oldest
//! first, and an optional signature trailer.
//!
//! ```text
//!  0  01 40            CLTP length indicator and tag
//!  2  A2 18            session type (sampled values) and header size
//!  4  80 16            common session header tag
//!  6  SPDU length      u32, ASDU bytes + 39
//! 10  packet number    u32
//! 14  SPDU version     u16 (1)
//! 16  time of key      u32
//! 20  time to next key u16 (100)
//! 22  security, signature algorithm
//! 24  key ID           u32
//! 28  payload length   u32, ASDU bytes + 17
//! 32  82 simulated     payload tag, simulated flag
//! 34  APPID            u16
//! 36  PDU length       u16, ASDU bytes + 11
//! 38  60 82 LLLL       SV PDU
//! 42  80 01 n          ASDU count
//! 45  A2 82 LLLL       sequence of ASDU
//! ```
//!
//! Each ASDU holds MSVID, smpCnt, confRev, refrTm, smpSynch and the sample block,
//! which is the C37.118 data cell image of every configured device.

use super::common::*;
use crate::codec::{CodecError, FrameLength};
use crate::ieee_c37_118::common::ParseError;
use crate::ieee_c37_118::utils::ticks_from_soc_fracsec;
use crate::measurement::Ticks;
use serde::{Deserialize, Serialize};

/// Bytes the SPDU length counts beyond the ASDU sequence.
const SPDU_OVERHEAD: usize = 39;
const MIN_SIZING_BYTES: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionHeader {
    pub packet_number: u32,
    /// Time of the current key, seconds since the Unix epoch.
    pub key_time: u32,
    pub security: SecurityAlgorithm,
    pub signature: SignatureAlgorithm,
    pub key_id: u32,
    pub simulated: bool,
    pub app_id: u16,
}

/// Sizes the data frame at the head of `buf`.
pub fn frame_length(buf: &[u8]) -> Result<FrameLength, CodecError> {
    if buf.len() < MIN_SIZING_BYTES {
        return Ok(FrameLength::Incomplete);
    }
    if buf[0] != CLTP_LENGTH_INDICATOR || buf[1] != CLTP_TAG {
        return Err(CodecError::Malformed(format!(
            "expected CLTP header 01 40, got {:02X} {:02X}",
            buf[0], buf[1]
        )));
    }
    if buf[2] != SESSION_TYPE_SAMPLED_VALUES {
        return Err(CodecError::Unsupported(format!(
            "session type 0x{:02X}, only sampled values are parsed",
            buf[2]
        )));
    }
    if buf[3] != SESSION_HEADER_SIZE {
        return Err(CodecError::Malformed(format!(
            "invalid session header size {}",
            buf[3]
        )));
    }
    let spdu_length = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
    if spdu_length < SPDU_OVERHEAD {
        return Err(CodecError::Malformed(format!(
            "SPDU length {} is shorter than its header",
            spdu_length
        )));
    }
    let signature = SignatureAlgorithm::from_byte(buf[23])?;
    let total = 2 + spdu_length + 8 + signature.trailer_len();
    if buf.len() < total {
        Ok(FrameLength::Incomplete)
    } else {
        Ok(FrameLength::Complete(total))
    }
}

/// One application service data unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asdu {
    pub msv_id: String,
    pub smp_cnt: u16,
    pub conf_rev: u32,
    pub soc: u32,
    /// Fraction of second in units of [`TIMEBASE`].
    pub fracsec: u32,
    pub time_quality: u8,
    pub smp_synch: u8,
    pub smp_rate: Option<u16>,
    pub samples: Vec<u8>,
}

impl Asdu {
    /// The 64-bit refresh time: SOC, 24-bit fraction and time quality byte.
    pub fn refresh_time(&self) -> u64 {
        ((self.soc as u64) << 32) | (((self.fracsec & 0x00FF_FFFF) as u64) << 8) | self.time_quality as u64
    }

    pub fn timestamp(&self) -> Ticks {
        ticks_from_soc_fracsec(self.soc, self.fracsec, TIMEBASE)
    }

    /// ID code from an MSVID of the form `<idcode>_<station>`.
    pub fn id_code(&self) -> Option<u16> {
        self.msv_id
            .split_once('_')
            .and_then(|(code, _)| code.parse().ok())
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::with_capacity(40 + self.msv_id.len() + self.samples.len());
        write_string_tag(MSV_ID, &self.msv_id, &mut body)?;
        write_u16_tag(SMP_CNT, self.smp_cnt, &mut body)?;
        write_u32_tag(CONF_REV, self.conf_rev, &mut body)?;
        write_u64_tag(REFR_TM, self.refresh_time(), &mut body)?;
        write_u8_tag(SMP_SYNCH, self.smp_synch, &mut body)?;
        if let Some(rate) = self.smp_rate {
            write_u16_tag(SMP_RATE, rate, &mut body)?;
        }
        let samples_len = u16::try_from(self.samples.len()).map_err(|_| {
            CodecError::Malformed(format!("{} sample bytes exceed one ASDU", self.samples.len()))
        })?;
        write_fixed_length(SAMPLES, samples_len, &mut body);
        body.extend_from_slice(&self.samples);

        let body_len = u16::try_from(body.len())
            .map_err(|_| CodecError::Malformed(format!("ASDU of {} bytes is too large", body.len())))?;
        let mut out = Vec::with_capacity(4 + body.len());
        write_fixed_length(ASDU_SEQUENCE, body_len, &mut out);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn read(reader: &mut TagReader<'_>) -> Result<Self, CodecError> {
        let length = reader.expect(ASDU_SEQUENCE)?;
        let end = reader.offset() + length;

        let msv_id = reader.read_string(MSV_ID)?;
        reader.skip_optional(DATASET)?;
        let smp_cnt = reader.read_u16(SMP_CNT)?;
        let conf_rev = reader.read_u32(CONF_REV)?;
        let refresh = reader.read_u64(REFR_TM)?;
        let smp_synch = reader.read_u8(SMP_SYNCH)?;
        let smp_rate = if reader.next_is(SMP_RATE) {
            Some(reader.read_u16(SMP_RATE)?)
        } else {
            None
        };
        let samples_len = reader.expect(SAMPLES)?;
        let samples = reader.take(samples_len)?.to_vec();
        reader.skip_optional(SMP_MOD)?;
        reader.skip_optional(UTC_TIMESTAMP)?;

        if reader.offset() != end {
            return Err(CodecError::Malformed(format!(
                "ASDU declares {} bytes, contents span {}",
                length,
                reader.offset() + length - end
            )));
        }

        Ok(Asdu {
            msv_id,
            smp_cnt,
            conf_rev,
            soc: (refresh >> 32) as u32,
            fracsec: ((refresh >> 8) & 0x00FF_FFFF) as u32,
            time_quality: refresh as u8,
            smp_synch,
            smp_rate,
            samples,
        })
    }
}

/// A parsed data frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub header: SessionHeader,
    /// Oldest first; the last ASDU is the newest sample.
    pub asdus: Vec<Asdu>,
}

impl DataFrame {
    /// Assembles a frame from already encoded ASDU images, signing it when the
    /// header names a signature algorithm.
    pub fn encode(header: &SessionHeader, asdu_images: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
        let asdu_count = u8::try_from(asdu_images.len())
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                CodecError::Malformed(format!("{} ASDUs, expected 1-255", asdu_images.len()))
            })?;
        let seq_len: usize = asdu_images.iter().map(Vec::len).sum();
        let seq_len = u16::try_from(seq_len)
            .ok()
            .filter(|&n| n as usize + 17 <= u16::MAX as usize)
            .ok_or_else(|| CodecError::Malformed(format!("{} ASDU bytes exceed one frame", seq_len)))?;

        let pdu_len = seq_len + 11;
        let payload_len = pdu_len + 4;
        let data_len = payload_len as u32 + 2;
        let spdu_len = payload_len as u32 + SESSION_HEADER_SIZE as u32;

        let mut out = Vec::with_capacity(HEADER_SIZE + seq_len as usize + header.signature.trailer_len());
        out.extend_from_slice(&[
            CLTP_LENGTH_INDICATOR,
            CLTP_TAG,
            SESSION_TYPE_SAMPLED_VALUES,
            SESSION_HEADER_SIZE,
            0x80,
            0x16,
        ]);
        out.extend_from_slice(&spdu_len.to_be_bytes());
        out.extend_from_slice(&header.packet_number.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&header.key_time.to_be_bytes());
        out.extend_from_slice(&100u16.to_be_bytes());
        out.push(header.security.to_byte());
        out.push(header.signature.to_byte());
        out.extend_from_slice(&header.key_id.to_be_bytes());
        out.extend_from_slice(&data_len.to_be_bytes());
        out.push(PAYLOAD_SAMPLED_VALUES);
        out.push(header.simulated as u8);
        out.extend_from_slice(&header.app_id.to_be_bytes());
        out.extend_from_slice(&pdu_len.to_be_bytes());
        write_fixed_length(SV_PDU, payload_len, &mut out);
        write_u8_tag(ASDU_COUNT, asdu_count, &mut out)?;
        write_fixed_length(SEQUENCE_OF_ASDU, seq_len, &mut out);
        for image in asdu_images {
            out.extend_from_slice(image);
        }

        if header.signature != SignatureAlgorithm::None {
            let digest = header.signature.sign(&out[2..])?;
            out.push(SIGNATURE_TAG);
            out.extend_from_slice(&digest);
        }
        Ok(out)
    }

    pub fn to_hex(&self) -> Result<Vec<u8>, CodecError> {
        let images = self
            .asdus
            .iter()
            .map(Asdu::encode)
            .collect::<Result<Vec<_>, _>>()?;
        Self::encode(&self.header, &images)
    }

    /// Parses one complete frame.
    ///
    /// # Returns
    ///
    /// * `Err(CodecError::Parse(ParseError::InvalidChecksum))`: If `verify_signature`
    ///   and the signature trailer is missing or wrong.
    /// * `Err(CodecError::Malformed)`: On out-of-sequence tags or inconsistent lengths.
    pub fn from_hex(bytes: &[u8], verify_signature: bool) -> Result<Self, CodecError> {
        match frame_length(bytes)? {
            FrameLength::Complete(n) if n == bytes.len() => {}
            FrameLength::Complete(n) => {
                return Err(ParseError::InvalidLength {
                    message: format!("IEC 61850-90-5 frame declares {} bytes, buffer holds {}", n, bytes.len()),
                }
                .into())
            }
            FrameLength::Incomplete => {
                return Err(ParseError::InvalidLength {
                    message: format!("IEC 61850-90-5 frame is incomplete at {} bytes", bytes.len()),
                }
                .into())
            }
        }

        let u32_at = |i: usize| u32::from_be_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let signature = SignatureAlgorithm::from_byte(bytes[23])?;
        let spdu_end = bytes.len() - signature.trailer_len();
        if spdu_end < HEADER_SIZE {
            return Err(ParseError::InvalidLength {
                message: format!("IEC 61850-90-5 frame of {} bytes is shorter than its header", bytes.len()),
            }
            .into());
        }
        if bytes[32] != PAYLOAD_SAMPLED_VALUES {
            return Err(CodecError::Malformed(format!(
                "payload tagged 0x{:02X}, expected sampled values",
                bytes[32]
            )));
        }

        let header = SessionHeader {
            packet_number: u32_at(10),
            key_time: u32_at(16),
            security: SecurityAlgorithm::from_byte(bytes[22])?,
            signature,
            key_id: u32_at(24),
            simulated: bytes[33] != 0,
            app_id: u16::from_be_bytes([bytes[34], bytes[35]]),
        };

        if verify_signature && signature != SignatureAlgorithm::None {
            if bytes[spdu_end] != SIGNATURE_TAG {
                return Err(ParseError::InvalidChecksum {
                    message: "expected IEC 61850-90-5 signature does not exist".to_string(),
                }
                .into());
            }
            let expected = signature.sign(&bytes[2..spdu_end])?;
            if bytes[spdu_end + 1..] != expected[..] {
                return Err(ParseError::InvalidChecksum {
                    message: format!("IEC 61850-90-5 {} signature does not match", signature),
                }
                .into());
            }
        }

        let spdu = &bytes[..spdu_end];
        let mut reader = TagReader::new(spdu, 38);
        reader.expect(SV_PDU)?;
        let asdu_count = reader.read_u8(ASDU_COUNT)?;
        if asdu_count == 0 {
            return Err(CodecError::Malformed("ASDU count must be greater than zero".to_string()));
        }
        let seq_len = reader.expect(SEQUENCE_OF_ASDU)?;
        if reader.offset() + seq_len != spdu_end {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "ASDU sequence declares {} bytes, frame carries {}",
                    seq_len,
                    spdu_end - reader.offset()
                ),
            }
            .into());
        }

        let asdus = (0..asdu_count)
            .map(|_| Asdu::read(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;
        if reader.offset() != spdu_end {
            return Err(CodecError::Malformed(format!(
                "{} bytes left after {} ASDUs",
                spdu_end - reader.offset(),
                asdu_count
            )));
        }

        Ok(DataFrame { header, asdus })
    }

    /// The newest ASDU.
    pub fn latest(&self) -> Option<&Asdu> {
        self.asdus.last()
    }
}
