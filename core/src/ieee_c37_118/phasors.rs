//! # IEEE C37.118 Phasor Measurement Utilities
//!
//! Wire forms of phasor values. A phasor is carried in polar or rectangular
//! coordinates, as 16-bit integers scaled by the PHUNIT factor or as 32-bit floats,
//! depending on the cell's FORMAT word.
//!
//! ## Key Components
//!
//! - `PhasorType`: The four wire formats (e.g., `FloatPolar`, `IntRect`).
//! - `PhasorValue`: Enum wrapping the specific wire phasor types.
//! - `PhasorFloatPolar`, `PhasorFloatRect`, `PhasorIntPolar`, `PhasorIntRect`:
//!   Structures for specific phasor formats.
//! - `scale_phasor_value`: Scales raw phasor values using PHUNIT factors.

use super::common::{require_len, ParseError};
use crate::model::{CoordinateFormat, DataFormats, NumericFormat, PhasorValue as CanonicalPhasor};
use std::fmt;

// PHUNIT is in 10⁻⁵ V or A per bit. See IEEE C37.118-2011 Table 9.
const SCALE_DENOMINATOR_INVERSE: f64 = 0.00001;

// Integer angles are radians × 10⁴.
const ANGLE_SCALE: f64 = 10_000.0;

/// Scales a raw phasor value using a PHUNIT conversion factor.
///
/// With the IEEE example factors, 14635 at 915527 is roughly 134 kV and 1092 at
/// 45776 is roughly 500 A.
fn scale_phasor_value(value: f64, factor: u32) -> f64 {
    value * SCALE_DENOMINATOR_INVERSE * factor as f64
}

/// Inverse of [`scale_phasor_value`]. Zero factors behave as one bit per unit.
fn unscale_phasor_value(value: f64, factor: u32) -> f64 {
    if factor == 0 {
        return value;
    }
    value / (SCALE_DENOMINATOR_INVERSE * factor as f64)
}

fn clamp_i16(value: f64) -> i16 {
    if value.is_nan() {
        0
    } else {
        value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }
}

fn clamp_u16(value: f64) -> u16 {
    if value.is_nan() {
        0
    } else {
        value.round().clamp(0.0, u16::MAX as f64) as u16
    }
}

/// Enumerates phasor data formats in IEEE C37.118.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhasorType {
    #[default]
    FloatPolar,
    FloatRect,
    IntRect,
    IntPolar,
}

impl fmt::Display for PhasorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PhasorType::FloatPolar => write!(f, "FloatPolar"),
            PhasorType::FloatRect => write!(f, "FloatRect"),
            PhasorType::IntRect => write!(f, "IntRect"),
            PhasorType::IntPolar => write!(f, "IntPolar"),
        }
    }
}

impl std::str::FromStr for PhasorType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, ParseError> {
        match s {
            "FloatPolar" => Ok(PhasorType::FloatPolar),
            "FloatRect" => Ok(PhasorType::FloatRect),
            "IntRect" => Ok(PhasorType::IntRect),
            "IntPolar" => Ok(PhasorType::IntPolar),
            _ => Err(ParseError::InvalidPhasorType {
                message: format!("Invalid phasor type: {}", s),
            }),
        }
    }
}

impl PhasorType {
    pub fn from_format(formats: &DataFormats) -> Self {
        match (formats.phasor, formats.coordinates) {
            (NumericFormat::Float, CoordinateFormat::Polar) => PhasorType::FloatPolar,
            (NumericFormat::Float, CoordinateFormat::Rectangular) => PhasorType::FloatRect,
            (NumericFormat::Integer, CoordinateFormat::Polar) => PhasorType::IntPolar,
            (NumericFormat::Integer, CoordinateFormat::Rectangular) => PhasorType::IntRect,
        }
    }

    /// Bytes one phasor occupies on the wire.
    pub fn size(&self) -> usize {
        match self {
            PhasorType::FloatPolar | PhasorType::FloatRect => 8,
            PhasorType::IntPolar | PhasorType::IntRect => 4,
        }
    }
}

/// A phasor in one of its wire formats.
#[derive(Debug, Clone, Copy)]
pub enum PhasorValue {
    FloatPolar(PhasorFloatPolar),
    FloatRect(PhasorFloatRect),
    IntPolar(PhasorIntPolar),
    IntRect(PhasorIntRect),
}

impl PhasorValue {
    /// Parses a phasor value from a byte slice.
    ///
    /// # Returns
    ///
    /// * `Ok(PhasorValue)`: The parsed phasor value.
    /// * `Err(ParseError)`: If the byte slice is too short.
    pub fn from_hex(bytes: &[u8], phasor_type: PhasorType) -> Result<Self, ParseError> {
        match phasor_type {
            PhasorType::FloatPolar => Ok(PhasorValue::FloatPolar(PhasorFloatPolar::from_hex(
                bytes,
            )?)),
            PhasorType::FloatRect => Ok(PhasorValue::FloatRect(PhasorFloatRect::from_hex(bytes)?)),
            PhasorType::IntPolar => Ok(PhasorValue::IntPolar(PhasorIntPolar::from_hex(bytes)?)),
            PhasorType::IntRect => Ok(PhasorValue::IntRect(PhasorIntRect::from_hex(bytes)?)),
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            PhasorValue::FloatPolar(p) => out.extend_from_slice(&p.to_hex()),
            PhasorValue::FloatRect(p) => out.extend_from_slice(&p.to_hex()),
            PhasorValue::IntPolar(p) => out.extend_from_slice(&p.to_hex()),
            PhasorValue::IntRect(p) => out.extend_from_slice(&p.to_hex()),
        }
    }

    /// Projects a canonical phasor into `phasor_type`, scaling integer forms by
    /// `scale_factor`. Missing (NaN) components encode as zero for integers.
    pub fn from_canonical(
        value: &CanonicalPhasor,
        phasor_type: PhasorType,
        scale_factor: u32,
    ) -> Self {
        match phasor_type {
            PhasorType::FloatPolar => PhasorValue::FloatPolar(PhasorFloatPolar {
                magnitude: value.magnitude() as f32,
                angle: value.angle() as f32,
            }),
            PhasorType::FloatRect => PhasorValue::FloatRect(PhasorFloatRect {
                real: value.real() as f32,
                imag: value.imaginary() as f32,
            }),
            PhasorType::IntPolar => PhasorValue::IntPolar(PhasorIntPolar {
                magnitude: clamp_u16(unscale_phasor_value(value.magnitude(), scale_factor)),
                angle: clamp_i16(value.angle() * ANGLE_SCALE),
            }),
            PhasorType::IntRect => PhasorValue::IntRect(PhasorIntRect {
                real: clamp_i16(unscale_phasor_value(value.real(), scale_factor)),
                imag: clamp_i16(unscale_phasor_value(value.imaginary(), scale_factor)),
            }),
        }
    }

    /// Converts to a canonical phasor in the wire coordinate system, applying
    /// `scale_factor` to integer forms.
    pub fn to_canonical(&self, scale_factor: u32) -> CanonicalPhasor {
        match self {
            PhasorValue::FloatPolar(p) => CanonicalPhasor::Polar {
                magnitude: p.magnitude as f64,
                angle: p.angle as f64,
            },
            PhasorValue::FloatRect(p) => CanonicalPhasor::Rectangular {
                real: p.real as f64,
                imaginary: p.imag as f64,
            },
            PhasorValue::IntPolar(p) => CanonicalPhasor::Polar {
                magnitude: scale_phasor_value(p.magnitude as f64, scale_factor),
                angle: p.angle as f64 / ANGLE_SCALE,
            },
            PhasorValue::IntRect(p) => CanonicalPhasor::Rectangular {
                real: scale_phasor_value(p.real as f64, scale_factor),
                imaginary: scale_phasor_value(p.imag as f64, scale_factor),
            },
        }
    }
}

/// Floating-point polar phasor: magnitude in physical units, angle in radians.
#[derive(Debug, Clone, Copy)]
pub struct PhasorFloatPolar {
    pub magnitude: f32,
    pub angle: f32,
}

impl PhasorFloatPolar {
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, 8, "PhasorFloatPolar")?;
        let magnitude = f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let angle = f32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(PhasorFloatPolar { magnitude, angle })
    }

    pub fn to_hex(&self) -> [u8; 8] {
        let mut result = [0u8; 8];
        result[0..4].copy_from_slice(&self.magnitude.to_be_bytes());
        result[4..8].copy_from_slice(&self.angle.to_be_bytes());
        result
    }

    pub fn to_float_rect(&self) -> PhasorFloatRect {
        PhasorFloatRect {
            real: self.magnitude * self.angle.cos(),
            imag: self.magnitude * self.angle.sin(),
        }
    }
}

/// Floating-point rectangular phasor.
#[derive(Debug, Clone, Copy)]
pub struct PhasorFloatRect {
    pub real: f32,
    pub imag: f32,
}

impl PhasorFloatRect {
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, 8, "PhasorFloatRect")?;
        let real = f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let imag = f32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(PhasorFloatRect { real, imag })
    }

    pub fn to_hex(&self) -> [u8; 8] {
        let mut result = [0u8; 8];
        result[0..4].copy_from_slice(&self.real.to_be_bytes());
        result[4..8].copy_from_slice(&self.imag.to_be_bytes());
        result
    }

    pub fn to_float_polar(&self) -> PhasorFloatPolar {
        PhasorFloatPolar {
            magnitude: self.real.hypot(self.imag),
            angle: self.imag.atan2(self.real),
        }
    }
}

/// Integer polar phasor: unsigned magnitude scaled by PHUNIT, then the angle in
/// radians × 10⁴.
#[derive(Debug, Clone, Copy)]
pub struct PhasorIntPolar {
    pub magnitude: u16,
    pub angle: i16,
}

impl PhasorIntPolar {
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, 4, "PhasorIntPolar")?;
        let magnitude = u16::from_be_bytes([bytes[0], bytes[1]]);
        let angle = i16::from_be_bytes([bytes[2], bytes[3]]);
        Ok(PhasorIntPolar { magnitude, angle })
    }

    pub fn to_hex(&self) -> [u8; 4] {
        let mut result = [0u8; 4];
        result[0..2].copy_from_slice(&self.magnitude.to_be_bytes());
        result[2..4].copy_from_slice(&self.angle.to_be_bytes());
        result
    }

    pub fn to_float_polar(&self, scale_factor: u32) -> PhasorFloatPolar {
        PhasorFloatPolar {
            magnitude: scale_phasor_value(self.magnitude as f64, scale_factor) as f32,
            angle: (self.angle as f64 / ANGLE_SCALE) as f32,
        }
    }
}

/// Integer rectangular phasor, both components scaled by PHUNIT.
#[derive(Debug, Clone, Copy)]
pub struct PhasorIntRect {
    pub real: i16,
    pub imag: i16,
}

impl PhasorIntRect {
    pub fn from_hex(bytes: &[u8]) -> Result<Self, ParseError> {
        require_len(bytes, 4, "PhasorIntRect")?;
        let real = i16::from_be_bytes([bytes[0], bytes[1]]);
        let imag = i16::from_be_bytes([bytes[2], bytes[3]]);
        Ok(PhasorIntRect { real, imag })
    }

    pub fn to_hex(&self) -> [u8; 4] {
        let mut result = [0u8; 4];
        result[0..2].copy_from_slice(&self.real.to_be_bytes());
        result[2..4].copy_from_slice(&self.imag.to_be_bytes());
        result
    }

    pub fn to_float_rect(&self, scale_factor: u32) -> PhasorFloatRect {
        PhasorFloatRect {
            real: scale_phasor_value(self.real as f64, scale_factor) as f32,
            imag: scale_phasor_value(self.imag as f64, scale_factor) as f32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    #[test]
    fn test_phasor_polar_conversions() {
        let polar = PhasorFloatPolar {
            magnitude: 1.0,
            angle: PI / 4.0,
        };
        let rect = polar.to_float_rect();
        assert!((rect.real - 0.7071).abs() < 0.001);
        assert!((rect.imag - 0.7071).abs() < 0.001);

        let back = rect.to_float_polar();
        assert!((back.magnitude - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_int_to_float_conversion() {
        let int_polar = PhasorIntPolar {
            magnitude: 100,
            angle: 7854,
        };
        // 100 * 10 / 1e5 = 0.01
        let float_polar = int_polar.to_float_polar(10);
        assert!((float_polar.magnitude - 0.01).abs() < 0.0001);
        assert!((float_polar.angle - PI / 4.0).abs() < 0.01);
    }

    #[test]
    fn test_hex_conversion() {
        let bytes = [
            0x3F, 0x80, 0x00, 0x00, // 1.0
            0x3F, 0x00, 0x00, 0x00, // 0.5
        ];
        let phasor = PhasorFloatPolar::from_hex(&bytes).unwrap();
        assert_eq!(phasor.magnitude, 1.0);
        assert_eq!(phasor.angle, 0.5);
        assert_eq!(phasor.to_hex(), bytes);

        // Integer polar puts the magnitude first.
        let int_bytes = [0x39, 0x2B, 0x3D, 0x5C];
        let int_phasor = PhasorIntPolar::from_hex(&int_bytes).unwrap();
        assert_eq!(int_phasor.magnitude, 14635);
        assert_eq!(int_phasor.angle, 15708);
        assert_eq!(int_phasor.to_hex(), int_bytes);

        assert!(PhasorIntRect::from_hex(&int_bytes[..3]).is_err());
    }

    #[test]
    fn test_scale_phasor_value() {
        let scaled = scale_phasor_value(14635.0, 915527);
        assert!((scaled - 134_000.0).abs() < 1000.0, "got {}", scaled);

        let scaled = scale_phasor_value(1092.0, 45776);
        assert!((scaled - 500.0).abs() < 1.0, "got {}", scaled);

        assert_eq!(scale_phasor_value(0.0, 45776), 0.0);
        assert_eq!(scale_phasor_value(1092.0, 0), 0.0);
    }

    #[test]
    fn test_canonical_projection_uses_scale() {
        let canonical = CanonicalPhasor::Rectangular {
            real: 134_000.0,
            imaginary: -134_000.0,
        };
        let wire = PhasorValue::from_canonical(&canonical, PhasorType::IntRect, 915527);
        match wire {
            PhasorValue::IntRect(p) => {
                assert_eq!(p.real, 14636);
                assert_eq!(p.imag, -14636);
            }
            other => panic!("unexpected {:?}", other),
        }
        let back = wire.to_canonical(915527);
        assert!((back.real() - 134_000.0).abs() < 10.0);

        // Out-of-range magnitudes saturate rather than wrap.
        let big = CanonicalPhasor::Polar {
            magnitude: 1e12,
            angle: -4.0,
        };
        match PhasorValue::from_canonical(&big, PhasorType::IntPolar, 1) {
            PhasorValue::IntPolar(p) => {
                assert_eq!(p.magnitude, u16::MAX);
                assert_eq!(p.angle, -32768);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
