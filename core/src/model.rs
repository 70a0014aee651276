//! # Canonical Synchrophasor Model
//!
//! Protocol-neutral configuration and data types. Codecs project these to and from
//! their wire images; the concentrator fills frames of them; the publisher caches
//! projections of them.
//!
//! ## Key Components
//!
//! - `ConfigurationFrame` / `ConfigurationCell`: Static per-device metadata (formats,
//!   phasor/analog/digital definitions, nominal frequency).
//! - `Frame` / `Cell`: One time-aligned slot of values, one cell per device.
//! - `PhasorValue`: A polar or rectangular phasor.
//! - `CellStatus`: Status word shared bit-for-bit with the C37.118 STAT field.
//! - `SignalMap`: Routes a `MeasurementKey` to a cell and field.

use crate::measurement::{MeasurementKey, Ticks};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumericFormat {
    Integer,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordinateFormat {
    Rectangular,
    Polar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineFrequency {
    Hz50,
    Hz60,
}

impl LineFrequency {
    pub fn hertz(&self) -> f64 {
        match self {
            LineFrequency::Hz50 => 50.0,
            LineFrequency::Hz60 => 60.0,
        }
    }
}

impl fmt::Display for LineFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.hertz())
    }
}

/// Wire encodings of a cell's values.
///
/// Maps to the C37.118 FORMAT word: bit 0 polar, bit 1 float phasors, bit 2 float
/// analogs, bit 3 float frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataFormats {
    pub phasor: NumericFormat,
    pub coordinates: CoordinateFormat,
    pub frequency: NumericFormat,
    pub analog: NumericFormat,
}

impl Default for DataFormats {
    fn default() -> Self {
        DataFormats {
            phasor: NumericFormat::Float,
            coordinates: CoordinateFormat::Polar,
            frequency: NumericFormat::Float,
            analog: NumericFormat::Float,
        }
    }
}

impl DataFormats {
    pub fn to_format_word(&self) -> u16 {
        let mut word = 0;
        if self.coordinates == CoordinateFormat::Polar {
            word |= 0x0001;
        }
        if self.phasor == NumericFormat::Float {
            word |= 0x0002;
        }
        if self.analog == NumericFormat::Float {
            word |= 0x0004;
        }
        if self.frequency == NumericFormat::Float {
            word |= 0x0008;
        }
        word
    }

    pub fn from_format_word(word: u16) -> Self {
        let float = |bit: u16| {
            if word & bit != 0 {
                NumericFormat::Float
            } else {
                NumericFormat::Integer
            }
        };
        DataFormats {
            coordinates: if word & 0x0001 != 0 {
                CoordinateFormat::Polar
            } else {
                CoordinateFormat::Rectangular
            },
            phasor: float(0x0002),
            analog: float(0x0004),
            frequency: float(0x0008),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhasorKind {
    Voltage,
    Current,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalogKind {
    SinglePointOnWave,
    Rms,
    Peak,
}

/// A phasor channel. `scale` is the unsigned 24-bit conversion factor in 10⁻⁵ V or A
/// per bit, used only for integer encodings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhasorDefinition {
    pub label: String,
    pub kind: PhasorKind,
    pub scale: u32,
}

/// An analog channel. `scale` is a signed 24-bit user-defined multiplier for
/// integer encodings; zero is treated as one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnalogDefinition {
    pub label: String,
    pub kind: AnalogKind,
    pub scale: i32,
}

impl AnalogDefinition {
    pub fn effective_scale(&self) -> f64 {
        if self.scale == 0 {
            1.0
        } else {
            self.scale as f64
        }
    }
}

/// A 16-bit digital status word with one label per bit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DigitalDefinition {
    pub labels: Vec<String>,
    pub normal_status: u16,
    pub valid_inputs: u16,
}

impl DigitalDefinition {
    /// Creates a definition with bit labels `<prefix>00`..`<prefix>15`.
    pub fn with_prefix(prefix: &str) -> Self {
        DigitalDefinition {
            labels: (0..16).map(|i| format!("{}{:02}", prefix, i)).collect(),
            normal_status: 0,
            valid_inputs: 0xFFFF,
        }
    }
}

/// Static metadata for one device in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigurationCell {
    pub id_code: u16,
    pub station_name: String,
    pub id_label: String,
    pub nominal_frequency: LineFrequency,
    pub formats: DataFormats,
    pub phasors: Vec<PhasorDefinition>,
    pub analogs: Vec<AnalogDefinition>,
    pub digitals: Vec<DigitalDefinition>,
}

impl ConfigurationCell {
    pub fn new(id_code: u16, station_name: impl Into<String>, id_label: impl Into<String>) -> Self {
        ConfigurationCell {
            id_code,
            station_name: station_name.into(),
            id_label: id_label.into(),
            nominal_frequency: LineFrequency::Hz60,
            formats: DataFormats::default(),
            phasors: Vec::new(),
            analogs: Vec::new(),
            digitals: Vec::new(),
        }
    }

    pub fn with_formats(mut self, formats: DataFormats) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_nominal_frequency(mut self, nominal: LineFrequency) -> Self {
        self.nominal_frequency = nominal;
        self
    }

    pub fn with_phasor(mut self, label: impl Into<String>, kind: PhasorKind, scale: u32) -> Self {
        self.phasors.push(PhasorDefinition {
            label: label.into(),
            kind,
            scale,
        });
        self
    }

    pub fn with_analog(mut self, label: impl Into<String>, kind: AnalogKind, scale: i32) -> Self {
        self.analogs.push(AnalogDefinition {
            label: label.into(),
            kind,
            scale,
        });
        self
    }

    pub fn with_digital(mut self, digital: DigitalDefinition) -> Self {
        self.digitals.push(digital);
        self
    }

    /// A cell with every value missing: NaN phasors/analogs/frequency, zero digitals.
    pub fn empty_cell(&self) -> Cell {
        let phasor = match self.formats.coordinates {
            CoordinateFormat::Polar => PhasorValue::Polar {
                magnitude: f64::NAN,
                angle: f64::NAN,
            },
            CoordinateFormat::Rectangular => PhasorValue::Rectangular {
                real: f64::NAN,
                imaginary: f64::NAN,
            },
        };
        Cell {
            id_code: self.id_code,
            status: CellStatus::default(),
            phasors: vec![phasor; self.phasors.len()],
            frequency: f64::NAN,
            dfdt: f64::NAN,
            analogs: vec![f64::NAN; self.analogs.len()],
            digitals: vec![0; self.digitals.len()],
        }
    }

    /// True when `cell` has exactly the channel counts this configuration declares.
    pub fn matches(&self, cell: &Cell) -> bool {
        cell.phasors.len() == self.phasors.len()
            && cell.analogs.len() == self.analogs.len()
            && cell.digitals.len() == self.digitals.len()
    }

    /// Number of individual measurements that fill one cell of this device.
    pub fn measurement_count(&self) -> usize {
        2 * self.phasors.len() + 2 + self.analogs.len() + self.digitals.len()
    }
}

/// Canonical configuration: the stream's ID code, frame rate, time base and cells.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigurationFrame {
    pub id_code: u16,
    pub frame_rate: u16,
    pub time_base: u32,
    pub cells: Vec<ConfigurationCell>,
}

pub const DEFAULT_TIME_BASE: u32 = 16_777_215;

impl ConfigurationFrame {
    pub fn new(id_code: u16, frame_rate: u16) -> Self {
        ConfigurationFrame {
            id_code,
            frame_rate,
            time_base: DEFAULT_TIME_BASE,
            cells: Vec::new(),
        }
    }

    pub fn with_cell(mut self, cell: ConfigurationCell) -> Self {
        self.cells.push(cell);
        self
    }

    pub fn empty_frame(&self, timestamp: Ticks) -> Frame {
        Frame {
            timestamp,
            published: false,
            cells: self.cells.iter().map(|c| c.empty_cell()).collect(),
        }
    }

    pub fn cell_index(&self, id_code: u16) -> Option<usize> {
        self.cells.iter().position(|c| c.id_code == id_code)
    }

    pub fn measurement_count(&self) -> usize {
        self.cells.iter().map(|c| c.measurement_count()).sum()
    }
}

/// A phasor value. Angles are in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PhasorValue {
    Polar { magnitude: f64, angle: f64 },
    Rectangular { real: f64, imaginary: f64 },
}

impl PhasorValue {
    pub fn magnitude(&self) -> f64 {
        match *self {
            PhasorValue::Polar { magnitude, .. } => magnitude,
            PhasorValue::Rectangular { real, imaginary } => real.hypot(imaginary),
        }
    }

    pub fn angle(&self) -> f64 {
        match *self {
            PhasorValue::Polar { angle, .. } => angle,
            PhasorValue::Rectangular { real, imaginary } => imaginary.atan2(real),
        }
    }

    pub fn real(&self) -> f64 {
        match *self {
            PhasorValue::Polar { magnitude, angle } => magnitude * angle.cos(),
            PhasorValue::Rectangular { real, .. } => real,
        }
    }

    pub fn imaginary(&self) -> f64 {
        match *self {
            PhasorValue::Polar { magnitude, angle } => magnitude * angle.sin(),
            PhasorValue::Rectangular { imaginary, .. } => imaginary,
        }
    }

    pub fn to_polar(&self) -> PhasorValue {
        PhasorValue::Polar {
            magnitude: self.magnitude(),
            angle: self.angle(),
        }
    }

    pub fn to_rectangular(&self) -> PhasorValue {
        PhasorValue::Rectangular {
            real: self.real(),
            imaginary: self.imaginary(),
        }
    }

    pub fn is_nan(&self) -> bool {
        match *self {
            PhasorValue::Polar { magnitude, angle } => magnitude.is_nan() || angle.is_nan(),
            PhasorValue::Rectangular { real, imaginary } => real.is_nan() || imaginary.is_nan(),
        }
    }
}

/// Cell status word. Bit layout matches the C37.118 STAT field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellStatus(pub u16);

impl CellStatus {
    pub const DATA_INVALID: u16 = 0x8000;
    pub const DEVICE_ERROR: u16 = 0x4000;
    pub const SYNC_ERROR: u16 = 0x2000;
    pub const SORTED_BY_ARRIVAL: u16 = 0x1000;
    pub const DEVICE_TRIGGER: u16 = 0x0800;
    pub const CONFIGURATION_CHANGED: u16 = 0x0400;
    pub const DATA_MODIFIED: u16 = 0x0200;
    pub const UNLOCKED_TIME_MASK: u16 = 0x0030;
    pub const TRIGGER_REASON_MASK: u16 = 0x000F;

    /// "No data" shares the data-invalid bit.
    pub const NO_DATA: u16 = Self::DATA_INVALID;

    pub fn contains(&self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    pub fn set(&mut self, bits: u16) {
        self.0 |= bits;
    }

    pub fn clear(&mut self, bits: u16) {
        self.0 &= !bits;
    }
}

/// One device's values within a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id_code: u16,
    pub status: CellStatus,
    pub phasors: Vec<PhasorValue>,
    pub frequency: f64,
    pub dfdt: f64,
    pub analogs: Vec<f64>,
    pub digitals: Vec<u16>,
}

impl Cell {
    /// Writes `value` into `field`. Returns `false` when the field index is out of range.
    pub fn apply(&mut self, field: SignalField, value: f64) -> bool {
        match field {
            SignalField::PhasorMagnitude(i) => self.update_phasor(i, |p| {
                PhasorValue::Polar {
                    magnitude: value,
                    angle: polar_part(p).1,
                }
            }),
            SignalField::PhasorAngle(i) => self.update_phasor(i, |p| PhasorValue::Polar {
                magnitude: polar_part(p).0,
                angle: value,
            }),
            SignalField::PhasorReal(i) => self.update_phasor(i, |p| PhasorValue::Rectangular {
                real: value,
                imaginary: rectangular_part(p).1,
            }),
            SignalField::PhasorImaginary(i) => {
                self.update_phasor(i, |p| PhasorValue::Rectangular {
                    real: rectangular_part(p).0,
                    imaginary: value,
                })
            }
            SignalField::Frequency => {
                self.frequency = value;
                true
            }
            SignalField::Dfdt => {
                self.dfdt = value;
                true
            }
            SignalField::Analog(i) => match self.analogs.get_mut(i) {
                Some(slot) => {
                    *slot = value;
                    true
                }
                None => false,
            },
            SignalField::Digital(i) => match self.digitals.get_mut(i) {
                Some(slot) => {
                    *slot = value as u16;
                    true
                }
                None => false,
            },
            SignalField::Status => {
                self.status = CellStatus(value as u16);
                true
            }
        }
    }

    fn update_phasor(&mut self, index: usize, f: impl FnOnce(PhasorValue) -> PhasorValue) -> bool {
        match self.phasors.get_mut(index) {
            Some(slot) => {
                *slot = f(*slot);
                true
            }
            None => false,
        }
    }
}

// Keep the untouched component as-is when it is still missing, rather than
// converting NaN through trigonometry.
fn polar_part(p: PhasorValue) -> (f64, f64) {
    match p {
        PhasorValue::Polar { magnitude, angle } => (magnitude, angle),
        other if other.is_nan() => (f64::NAN, f64::NAN),
        other => (other.magnitude(), other.angle()),
    }
}

fn rectangular_part(p: PhasorValue) -> (f64, f64) {
    match p {
        PhasorValue::Rectangular { real, imaginary } => (real, imaginary),
        other if other.is_nan() => (f64::NAN, f64::NAN),
        other => (other.real(), other.imaginary()),
    }
}

/// One discrete time slot at the output rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp: Ticks,
    pub published: bool,
    pub cells: Vec<Cell>,
}

impl Frame {
    pub fn cell(&self, id_code: u16) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id_code == id_code)
    }
}

/// Destination of a measurement within a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalField {
    PhasorMagnitude(usize),
    PhasorAngle(usize),
    PhasorReal(usize),
    PhasorImaginary(usize),
    Frequency,
    Dfdt,
    Analog(usize),
    Digital(usize),
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalTarget {
    pub cell: usize,
    pub field: SignalField,
}

/// Routes measurement keys to cell fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalMap {
    targets: HashMap<MeasurementKey, SignalTarget>,
}

/// Standard point layout of a cell, in point-id order.
///
/// Phasor `i` takes points `2i` (magnitude or real) and `2i + 1` (angle or imaginary),
/// followed by frequency, dF/dt, the analogs and the digitals.
pub fn standard_points(cell: &ConfigurationCell) -> Vec<(u32, SignalField)> {
    let mut points = Vec::with_capacity(cell.measurement_count());
    let polar = cell.formats.coordinates == CoordinateFormat::Polar;

    for i in 0..cell.phasors.len() {
        let (first, second) = if polar {
            (SignalField::PhasorMagnitude(i), SignalField::PhasorAngle(i))
        } else {
            (SignalField::PhasorReal(i), SignalField::PhasorImaginary(i))
        };
        points.push(first);
        points.push(second);
    }
    points.push(SignalField::Frequency);
    points.push(SignalField::Dfdt);
    points.extend((0..cell.analogs.len()).map(SignalField::Analog));
    points.extend((0..cell.digitals.len()).map(SignalField::Digital));

    points
        .into_iter()
        .enumerate()
        .map(|(id, field)| (id as u32, field))
        .collect()
}

impl SignalMap {
    pub fn new() -> Self {
        SignalMap::default()
    }

    /// Builds the standard map: keys are `(cell.id_label, point_id)` per
    /// [`standard_points`].
    pub fn standard(config: &ConfigurationFrame) -> Self {
        let mut map = SignalMap::new();
        for (index, cell) in config.cells.iter().enumerate() {
            for (point_id, field) in standard_points(cell) {
                map.insert(
                    MeasurementKey::new(cell.id_label.clone(), point_id),
                    SignalTarget { cell: index, field },
                );
            }
        }
        map
    }

    pub fn insert(&mut self, key: MeasurementKey, target: SignalTarget) {
        self.targets.insert(key, target);
    }

    pub fn get(&self, key: &MeasurementKey) -> Option<&SignalTarget> {
        self.targets.get(key)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &MeasurementKey> {
        self.targets.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ConfigurationFrame {
        ConfigurationFrame::new(1, 30)
            .with_cell(
                ConfigurationCell::new(10, "STATION A", "PMU_A")
                    .with_phasor("VA", PhasorKind::Voltage, 915_527)
                    .with_phasor("IA", PhasorKind::Current, 45_776)
                    .with_analog("MW", AnalogKind::Rms, 1)
                    .with_digital(DigitalDefinition::with_prefix("BRK")),
            )
            .with_cell(
                ConfigurationCell::new(20, "STATION B", "PMU_B").with_formats(DataFormats {
                    coordinates: CoordinateFormat::Rectangular,
                    ..DataFormats::default()
                }).with_phasor("VB", PhasorKind::Voltage, 915_527),
            )
    }

    #[test]
    fn test_format_word_roundtrip() {
        let formats = DataFormats {
            phasor: NumericFormat::Integer,
            coordinates: CoordinateFormat::Polar,
            frequency: NumericFormat::Float,
            analog: NumericFormat::Integer,
        };
        assert_eq!(formats.to_format_word(), 0x0009);
        assert_eq!(DataFormats::from_format_word(0x0009), formats);
        assert_eq!(DataFormats::default().to_format_word(), 0x000F);
    }

    #[test]
    fn test_empty_frame_matches_configuration() {
        let config = sample_config();
        let frame = config.empty_frame(42);
        assert_eq!(frame.timestamp, 42);
        assert!(!frame.published);
        for (cfg, cell) in config.cells.iter().zip(&frame.cells) {
            assert!(cfg.matches(cell));
            assert!(cell.frequency.is_nan());
            assert!(cell.phasors.iter().all(|p| p.is_nan()));
        }
        assert_eq!(config.measurement_count(), (4 + 2 + 1 + 1) + (2 + 2));
    }

    #[test]
    fn test_standard_signal_map_routes_values() {
        let config = sample_config();
        let map = SignalMap::standard(&config);
        assert_eq!(map.len(), config.measurement_count());

        let mut frame = config.empty_frame(0);
        let target = *map.get(&MeasurementKey::new("PMU_A", 1)).unwrap();
        assert_eq!(target.field, SignalField::PhasorAngle(0));
        assert!(frame.cells[target.cell].apply(target.field, 0.5));

        let target = *map.get(&MeasurementKey::new("PMU_B", 0)).unwrap();
        assert_eq!(target.field, SignalField::PhasorReal(0));
        assert!(frame.cells[target.cell].apply(target.field, 3.0));

        let target = *map.get(&MeasurementKey::new("PMU_A", 4)).unwrap();
        assert_eq!(target.field, SignalField::Frequency);

        assert_eq!(frame.cells[0].phasors[0].angle(), 0.5);
        assert!(frame.cells[0].phasors[0].magnitude().is_nan());
        assert_eq!(frame.cells[1].phasors[0].real(), 3.0);
        assert!(!frame.cells[0].apply(SignalField::Analog(5), 1.0));
    }

    #[test]
    fn test_phasor_conversions() {
        let p = PhasorValue::Rectangular {
            real: 3.0,
            imaginary: 4.0,
        };
        assert!((p.magnitude() - 5.0).abs() < 1e-12);
        let back = p.to_polar().to_rectangular();
        assert!((back.real() - 3.0).abs() < 1e-9);
        assert!((back.imaginary() - 4.0).abs() < 1e-9);
    }
}
