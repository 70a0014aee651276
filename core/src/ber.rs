//! # BER Tag, Length and Object Identifier Primitives
//!
//! Deterministic encode/decode routines for the ASN.1 Basic Encoding Rules (X.690)
//! building blocks used by the IEC 61850-90-5 sampled value codec: definite-form
//! lengths, identifier octets (tags) and object identifier arcs.
//!
//! ## Key Components
//!
//! - `encode_length` / `decode_length`: Short and long definite-form lengths.
//! - `Tag`, `TagClass`, `TagForm`: Identifier octets, including the extended
//!   (`0x1F`) high-tag-number form.
//! - `tag_value`: Packs an encoded tag into a big-endian integer, applying an
//!   optional class/number override.
//! - `encode_arcs` / `decode_arcs`: Object identifier contents octets (X.690 §8.19).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Largest number of long-form length octets accepted.
pub const MAX_LENGTH_OCTETS: usize = 4;

/// Largest number of octets a single OID arc may occupy.
pub const MAX_ARC_OCTETS: usize = 5;

/// Largest number of octets an encoded tag may occupy when packed into a `u32`.
pub const MAX_TAG_OCTETS: usize = 4;

/// Errors raised by the BER primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BerError {
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("indefinite length form is not supported")]
    IndefiniteLength,
    #[error("length uses {octets} octets, at most {MAX_LENGTH_OCTETS} are supported")]
    LengthTooLong { octets: usize },
    #[error("length {0} cannot be encoded in {MAX_LENGTH_OCTETS} octets")]
    LengthOverflow(u64),
    #[error("tag number {0} needs more than {MAX_TAG_OCTETS} identifier octets")]
    TagNumberTooLarge(u32),
    #[error("object identifier arc exceeds {MAX_ARC_OCTETS} octets or 32 bits")]
    ArcTooLong,
    #[error("object identifier arc is not minimally encoded")]
    NonMinimalArc,
    #[error("first object identifier arc must be 0, 1 or 2, got {0}")]
    InvalidFirstArc(u32),
    #[error("second object identifier arc {second} is out of range for first arc {first}")]
    InvalidSecondArc { first: u32, second: u32 },
    #[error("object identifier needs at least two arcs, got {0}")]
    TooFewArcs(usize),
}

fn ensure_available(bytes: &[u8], needed: usize) -> Result<(), BerError> {
    if bytes.len() < needed {
        return Err(BerError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

/// Encodes a definite-form length.
///
/// Values below 128 use the single octet short form. Larger values use the long form:
/// an initial octet `0x80 | k` followed by `k` (1-4) big-endian length octets.
///
/// # Returns
///
/// * `Ok(Vec<u8>)`: The encoded length octets.
/// * `Err(BerError::LengthOverflow)`: If the length does not fit in 4 octets.
pub fn encode_length(length: u64) -> Result<Vec<u8>, BerError> {
    let mut out = Vec::with_capacity(5);
    write_length(length, &mut out)?;
    Ok(out)
}

/// Appends a definite-form length to `out`. See [`encode_length`].
pub fn write_length(length: u64, out: &mut Vec<u8>) -> Result<(), BerError> {
    if length < 0x80 {
        out.push(length as u8);
        return Ok(());
    }
    if length > u32::MAX as u64 {
        return Err(BerError::LengthOverflow(length));
    }

    let bytes = (length as u32).to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    let octets = &bytes[skip..];
    out.push(0x80 | octets.len() as u8);
    out.extend_from_slice(octets);
    Ok(())
}

/// Decodes a definite-form length.
///
/// # Returns
///
/// * `Ok((length, consumed))`: The length value and the number of octets read.
/// * `Err(BerError)`: On premature end of input, the indefinite form (`0x80`) or more
///   than four length octets.
pub fn decode_length(bytes: &[u8]) -> Result<(u32, usize), BerError> {
    ensure_available(bytes, 1)?;
    let first = bytes[0];

    if first & 0x80 == 0 {
        return Ok((first as u32, 1));
    }

    let octets = (first & 0x7F) as usize;
    if octets == 0 {
        return Err(BerError::IndefiniteLength);
    }
    if octets > MAX_LENGTH_OCTETS {
        return Err(BerError::LengthTooLong { octets });
    }
    ensure_available(bytes, 1 + octets)?;

    let length = bytes[1..=octets]
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | b as u32);
    Ok((length, 1 + octets))
}

/// Identifier class, stored in bits 8-7 of the first identifier octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagClass {
    Universal = 0x00,
    Application = 0x40,
    ContextSpecific = 0x80,
    Private = 0xC0,
}

impl TagClass {
    pub fn from_octet(octet: u8) -> Self {
        match octet & 0xC0 {
            0x00 => TagClass::Universal,
            0x40 => TagClass::Application,
            0x80 => TagClass::ContextSpecific,
            _ => TagClass::Private,
        }
    }
}

/// Primitive or constructed encoding, bit 6 of the first identifier octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagForm {
    Primitive,
    Constructed,
}

const CONSTRUCTED_BIT: u8 = 0x20;
const HIGH_TAG_NUMBER: u8 = 0x1F;

/// A BER identifier: class, form and tag number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub class: TagClass,
    pub form: TagForm,
    pub number: u32,
}

impl Tag {
    pub const fn new(class: TagClass, form: TagForm, number: u32) -> Self {
        Tag {
            class,
            form,
            number,
        }
    }

    /// Returns the single identifier octet of a low-number tag (number below 31).
    ///
    /// Only meaningful for low tag numbers; higher bits of the number are masked off.
    pub const fn identifier_octet(&self) -> u8 {
        let form = match self.form {
            TagForm::Primitive => 0,
            TagForm::Constructed => CONSTRUCTED_BIT,
        };
        (self.class as u8) | form | (self.number as u8 & 0x1F)
    }

    /// Number of identifier octets this tag encodes to.
    pub fn encoded_len(&self) -> usize {
        if self.number < HIGH_TAG_NUMBER as u32 {
            return 1;
        }
        let mut groups = 1;
        let mut n = self.number >> 7;
        while n > 0 {
            groups += 1;
            n >>= 7;
        }
        1 + groups
    }

    /// Encodes the identifier octets.
    ///
    /// Tag numbers below 31 fit in the first octet. Larger numbers set the low five
    /// bits to `0x1F` and follow with base-128 groups, high bit set on all but the last.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        let lead = (self.class as u8)
            | match self.form {
                TagForm::Primitive => 0,
                TagForm::Constructed => CONSTRUCTED_BIT,
            };

        if self.number < HIGH_TAG_NUMBER as u32 {
            out.push(lead | self.number as u8);
            return out;
        }

        out.push(lead | HIGH_TAG_NUMBER);
        encode_base128(self.number, &mut out);
        out
    }

    /// Packs the identifier octets into a big-endian `u32`.
    ///
    /// # Returns
    ///
    /// * `Ok(u32)`: The packed tag value.
    /// * `Err(BerError::TagNumberTooLarge)`: If the tag needs more than four octets.
    pub fn value(&self) -> Result<u32, BerError> {
        if self.encoded_len() > MAX_TAG_OCTETS {
            return Err(BerError::TagNumberTooLarge(self.number));
        }
        Ok(self
            .encode()
            .iter()
            .fold(0u32, |acc, &b| (acc << 8) | b as u32))
    }

    /// Decodes identifier octets from the start of `bytes`.
    ///
    /// # Returns
    ///
    /// * `Ok((Tag, consumed))`: The tag and the number of octets read.
    /// * `Err(BerError)`: On truncation or a tag number that overflows 32 bits.
    pub fn decode(bytes: &[u8]) -> Result<(Tag, usize), BerError> {
        ensure_available(bytes, 1)?;
        let first = bytes[0];
        let class = TagClass::from_octet(first);
        let form = if first & CONSTRUCTED_BIT != 0 {
            TagForm::Constructed
        } else {
            TagForm::Primitive
        };

        if first & HIGH_TAG_NUMBER != HIGH_TAG_NUMBER {
            return Ok((Tag::new(class, form, (first & 0x1F) as u32), 1));
        }

        let (number, used) = decode_base128(&bytes[1..]).map_err(|e| match e {
            BerError::ArcTooLong => BerError::TagNumberTooLarge(u32::MAX),
            other => other,
        })?;
        Ok((Tag::new(class, form, number), 1 + used))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = match self.class {
            TagClass::Universal => "UNIVERSAL",
            TagClass::Application => "APPLICATION",
            TagClass::ContextSpecific => "CONTEXT",
            TagClass::Private => "PRIVATE",
        };
        write!(f, "[{} {}]", class, self.number)
    }
}

/// Produces the packed tag value for `base`, optionally overridden by an assigned
/// class and number.
///
/// An assigned tag keeps the constructed/primitive form of the base tag and replaces
/// its class and number, the way implicit tagging re-labels an underlying type.
pub fn tag_value(base: Tag, assigned: Option<(TagClass, u32)>) -> Result<u32, BerError> {
    let tag = match assigned {
        Some((class, number)) => Tag::new(class, base.form, number),
        None => base,
    };
    tag.value()
}

fn encode_base128(value: u32, out: &mut Vec<u8>) {
    let mut groups = [0u8; MAX_ARC_OCTETS];
    let mut count = 0;
    let mut v = value;
    loop {
        groups[count] = (v & 0x7F) as u8;
        count += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    for i in (0..count).rev() {
        let continuation = if i > 0 { 0x80 } else { 0 };
        out.push(groups[i] | continuation);
    }
}

fn decode_base128(bytes: &[u8]) -> Result<(u32, usize), BerError> {
    ensure_available(bytes, 1)?;
    if bytes[0] == 0x80 {
        return Err(BerError::NonMinimalArc);
    }

    let mut value: u64 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if i >= MAX_ARC_OCTETS {
            return Err(BerError::ArcTooLong);
        }
        value = (value << 7) | (b & 0x7F) as u64;
        if value > u32::MAX as u64 {
            return Err(BerError::ArcTooLong);
        }
        if b & 0x80 == 0 {
            return Ok((value as u32, i + 1));
        }
    }
    Err(BerError::Truncated {
        needed: bytes.len() + 1,
        available: bytes.len(),
    })
}

/// Appends a single base-128 encoded OID arc.
pub fn encode_arc(arc: u32, out: &mut Vec<u8>) {
    encode_base128(arc, out)
}

/// Decodes a single base-128 OID arc.
///
/// # Returns
///
/// * `Ok((arc, consumed))`
/// * `Err(BerError)`: On truncation, a non-minimal leading `0x80` octet, or an arc
///   longer than five octets or overflowing 32 bits.
pub fn decode_arc(bytes: &[u8]) -> Result<(u32, usize), BerError> {
    decode_base128(bytes)
}

/// Encodes object identifier arcs into contents octets (X.690 §8.19).
///
/// The first two arcs are combined into a single subidentifier `40 * a0 + a1`.
pub fn encode_arcs(arcs: &[u32]) -> Result<Vec<u8>, BerError> {
    if arcs.len() < 2 {
        return Err(BerError::TooFewArcs(arcs.len()));
    }
    let (first, second) = (arcs[0], arcs[1]);
    if first > 2 {
        return Err(BerError::InvalidFirstArc(first));
    }
    if first < 2 && second >= 40 {
        return Err(BerError::InvalidSecondArc { first, second });
    }
    let combined = (first * 40)
        .checked_add(second)
        .ok_or(BerError::InvalidSecondArc { first, second })?;

    let mut out = Vec::with_capacity(arcs.len() * 2);
    encode_arc(combined, &mut out);
    for &arc in &arcs[2..] {
        encode_arc(arc, &mut out);
    }
    Ok(out)
}

/// Decodes object identifier contents octets into arcs.
pub fn decode_arcs(bytes: &[u8]) -> Result<Vec<u32>, BerError> {
    if bytes.is_empty() {
        return Err(BerError::TooFewArcs(0));
    }

    let (combined, mut offset) = decode_arc(bytes)?;
    let mut arcs = match combined {
        0..=39 => vec![0, combined],
        40..=79 => vec![1, combined - 40],
        _ => vec![2, combined - 80],
    };

    while offset < bytes.len() {
        let (arc, used) = decode_arc(&bytes[offset..])?;
        arcs.push(arc);
        offset += used;
    }
    Ok(arcs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_short_and_long_forms() {
        assert_eq!(encode_length(0).unwrap(), vec![0x00]);
        assert_eq!(encode_length(127).unwrap(), vec![0x7F]);
        assert_eq!(encode_length(128).unwrap(), vec![0x81, 0x80]);
        assert_eq!(encode_length(255).unwrap(), vec![0x81, 0xFF]);
        assert_eq!(encode_length(256).unwrap(), vec![0x82, 0x01, 0x00]);
        assert_eq!(encode_length(65_536).unwrap(), vec![0x83, 0x01, 0x00, 0x00]);
        assert_eq!(
            encode_length(u32::MAX as u64).unwrap(),
            vec![0x84, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            encode_length(1u64 << 32),
            Err(BerError::LengthOverflow(1u64 << 32))
        );
    }

    #[test]
    fn test_length_decode_consumes_exact_octets() {
        for n in [0u64, 1, 127, 128, 255, 256, 65_535, 65_536, 16_777_216, u32::MAX as u64] {
            let mut bytes = encode_length(n).unwrap();
            let used = bytes.len();
            bytes.push(0xEE);
            assert_eq!(decode_length(&bytes).unwrap(), (n as u32, used), "length {}", n);
        }
    }

    #[test]
    fn test_length_decode_rejects_bad_forms() {
        assert_eq!(decode_length(&[0x80]), Err(BerError::IndefiniteLength));
        assert_eq!(
            decode_length(&[0x85, 1, 2, 3, 4, 5]),
            Err(BerError::LengthTooLong { octets: 5 })
        );
        assert!(matches!(
            decode_length(&[0x82, 0x01]),
            Err(BerError::Truncated { .. })
        ));
        assert!(matches!(decode_length(&[]), Err(BerError::Truncated { .. })));
    }

    #[test]
    fn test_tag_extension_boundaries() {
        let cases = [(30u32, 1usize), (31, 2), (127, 2), (128, 3), (16_383, 3), (16_384, 4)];
        for (number, expected) in cases {
            let tag = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, number);
            let encoded = tag.encode();
            assert_eq!(encoded.len(), expected, "tag number {}", number);
            assert_eq!(tag.encoded_len(), expected);

            let (decoded, used) = Tag::decode(&encoded).unwrap();
            assert_eq!(decoded, tag);
            assert_eq!(used, expected);
        }
    }

    #[test]
    fn test_tag_value_packs_octets() {
        let sv_pdu = Tag::new(TagClass::Application, TagForm::Constructed, 0);
        assert_eq!(tag_value(sv_pdu, None).unwrap(), 0x60);
        assert_eq!(sv_pdu.identifier_octet(), 0x60);

        let seq = Tag::new(TagClass::Universal, TagForm::Constructed, 16);
        assert_eq!(tag_value(seq, None).unwrap(), 0x30);

        // Implicit re-tagging keeps the constructed bit of the base
        assert_eq!(
            tag_value(seq, Some((TagClass::ContextSpecific, 2))).unwrap(),
            0xA2
        );

        let big = Tag::new(TagClass::ContextSpecific, TagForm::Primitive, 128);
        assert_eq!(tag_value(big, None).unwrap(), 0x9F_81_00);

        let too_big = Tag::new(TagClass::Private, TagForm::Primitive, 1 << 21);
        assert_eq!(
            tag_value(too_big, None),
            Err(BerError::TagNumberTooLarge(1 << 21))
        );
    }

    #[test]
    fn test_oid_known_encodings() {
        // 1.2.840.113549
        let arcs = [1, 2, 840, 113_549];
        let encoded = encode_arcs(&arcs).unwrap();
        assert_eq!(encoded, vec![0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D]);
        assert_eq!(decode_arcs(&encoded).unwrap(), arcs.to_vec());

        // 2.999.3 combines to 1079
        let encoded = encode_arcs(&[2, 999, 3]).unwrap();
        assert_eq!(encoded, vec![0x88, 0x37, 0x03]);
        assert_eq!(decode_arcs(&encoded).unwrap(), vec![2, 999, 3]);
    }

    #[test]
    fn test_oid_rejects_invalid_input() {
        assert_eq!(encode_arcs(&[1]), Err(BerError::TooFewArcs(1)));
        assert_eq!(encode_arcs(&[3, 1]), Err(BerError::InvalidFirstArc(3)));
        assert_eq!(
            encode_arcs(&[1, 40]),
            Err(BerError::InvalidSecondArc { first: 1, second: 40 })
        );
        assert_eq!(decode_arcs(&[]), Err(BerError::TooFewArcs(0)));
        assert!(matches!(decode_arcs(&[0x2A, 0x86]), Err(BerError::Truncated { .. })));
        assert_eq!(
            decode_arcs(&[0x2A, 0x90, 0x80, 0x80, 0x80, 0x00]),
            Err(BerError::ArcTooLong)
        );
        assert_eq!(
            decode_arcs(&[0x2A, 0x81, 0x80, 0x80, 0x80, 0x80, 0x00]),
            Err(BerError::ArcTooLong)
        );
        assert_eq!(decode_arcs(&[0x2A, 0x80, 0x01]), Err(BerError::NonMinimalArc));
    }

    #[test]
    fn test_arc_max_value() {
        let mut out = Vec::new();
        encode_arc(u32::MAX, &mut out);
        assert_eq!(out, vec![0x8F, 0xFF, 0xFF, 0xFF, 0x7F]);
        assert_eq!(decode_arc(&out).unwrap(), (u32::MAX, 5));
    }
}
