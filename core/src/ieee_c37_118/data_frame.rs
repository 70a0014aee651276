//! # IEEE C37.118 Data Frame Utilities
//!
//! Parsing and construction of data frames. A data frame is the common prefix, one
//! data cell per PMU in configuration order, and the CRC trailer. Cell sizes depend
//! entirely on the configuration, so every parse needs the active configuration.
//!
//! ## Key Components
//!
//! - `CellLayout`: Field widths of one PMU's data cell, derived from its FORMAT word.
//! - `PMUData`: Raw sections of one data cell (STAT, phasors, FREQ, DFREQ, analogs,
//!   digitals), with typed conversion to and from the canonical [`crate::model::Cell`].
//! - `DataFrame`: A complete data frame.
//!
//! The cell image is shared with IEC 61850-90-5, which embeds it inside each ASDU.

use super::common::{Cursor, FrameType, ParseError, PrefixFrame, StatField, Version, CHECKSUM_SIZE, PREFIX_SIZE};
use super::config::{ConfigurationFrame, PMUConfigurationFrame};
use super::phasors::{PhasorType, PhasorValue};
use super::utils::{append_checksum, soc_fracsec_from_ticks, ticks_from_soc_fracsec, validate_checksum};
use crate::model::{
    Cell, CellStatus, ConfigurationCell, ConfigurationFrame as CanonicalConfiguration, Frame,
    NumericFormat,
};
use serde::{Deserialize, Serialize};

/// Integer FREQ is the deviation from nominal in mHz.
const FREQ_INT_SCALE: f64 = 1000.0;
/// Integer DFREQ is ROCOF × 100.
const DFDT_INT_SCALE: f64 = 100.0;

fn clamp_i16(value: f64) -> i16 {
    if value.is_nan() {
        0
    } else {
        value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
    }
}

/// Field widths of one PMU's data cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellLayout {
    pub phasor_type: PhasorType,
    pub phasor_count: usize,
    pub float_frequency: bool,
    pub float_analog: bool,
    pub analog_count: usize,
    pub digital_count: usize,
}

impl CellLayout {
    pub fn from_cell(cell: &ConfigurationCell) -> Self {
        CellLayout {
            phasor_type: PhasorType::from_format(&cell.formats),
            phasor_count: cell.phasors.len(),
            float_frequency: cell.formats.frequency == NumericFormat::Float,
            float_analog: cell.formats.analog == NumericFormat::Float,
            analog_count: cell.analogs.len(),
            digital_count: cell.digitals.len(),
        }
    }

    pub fn from_pmu_config(pmu: &PMUConfigurationFrame) -> Self {
        CellLayout {
            phasor_type: pmu.phasor_type(),
            phasor_count: pmu.phnmr as usize,
            float_frequency: pmu.freq_dfreq_size() == 4,
            float_analog: pmu.analog_size() == 4,
            analog_count: pmu.annmr as usize,
            digital_count: pmu.dgnmr as usize,
        }
    }

    pub fn freq_size(&self) -> usize {
        if self.float_frequency {
            4
        } else {
            2
        }
    }

    pub fn analog_size(&self) -> usize {
        if self.float_analog {
            4
        } else {
            2
        }
    }

    /// Total bytes of one data cell, STAT included.
    pub fn size(&self) -> usize {
        2 + self.phasor_type.size() * self.phasor_count
            + 2 * self.freq_size()
            + self.analog_size() * self.analog_count
            + 2 * self.digital_count
    }
}

/// Represents an IEEE C37.118 data frame.
///
/// # Fields
///
/// * `prefix`: Common frame prefix (SYNC, frame size, ID code, timestamp).
/// * `pmu_data`: One data cell per PMU, in configuration order.
/// * `chk`: CRC-CCITT checksum for frame validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFrame {
    pub prefix: PrefixFrame,
    pub pmu_data: Vec<PMUData>,
    pub chk: u16,
}

/// Represents data from a single PMU within an IEEE C37.118 data frame.
///
/// # Fields
///
/// * `stat`: Status field indicating data validity and PMU state.
/// * `phasors`: Raw bytes for phasor measurements.
/// * `freq`: Raw bytes for frequency value.
/// * `dfreq`: Raw bytes for rate-of-change-of-frequency value.
/// * `analog`: Raw bytes for analog measurements.
/// * `digital`: Raw bytes for digital status words.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PMUData {
    pub stat: StatField,
    pub phasors: Vec<u8>,
    pub freq: Vec<u8>,
    pub dfreq: Vec<u8>,
    pub analog: Vec<u8>,
    pub digital: Vec<u8>,
}

impl PMUData {
    /// Reads one data cell laid out per `layout`.
    pub fn parse(bytes: &[u8], layout: &CellLayout, version: Version) -> Result<(Self, usize), ParseError> {
        let mut cursor = Cursor::new(bytes, 0, "PMUData");
        let data = Self::read(&mut cursor, layout, version)?;
        Ok((data, cursor.offset()))
    }

    pub(crate) fn read(
        cursor: &mut Cursor<'_>,
        layout: &CellLayout,
        version: Version,
    ) -> Result<Self, ParseError> {
        let stat = StatField::from_raw(cursor.u16()?, version);
        let phasors = cursor
            .take(layout.phasor_type.size() * layout.phasor_count)?
            .to_vec();
        let freq = cursor.take(layout.freq_size())?.to_vec();
        let dfreq = cursor.take(layout.freq_size())?.to_vec();
        let analog = cursor.take(layout.analog_size() * layout.analog_count)?.to_vec();
        let digital = cursor.take(2 * layout.digital_count)?.to_vec();
        Ok(PMUData {
            stat,
            phasors,
            freq,
            dfreq,
            analog,
            digital,
        })
    }

    pub fn write(&self, version: Version, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.stat.to_raw(version).to_be_bytes());
        out.extend_from_slice(&self.phasors);
        out.extend_from_slice(&self.freq);
        out.extend_from_slice(&self.dfreq);
        out.extend_from_slice(&self.analog);
        out.extend_from_slice(&self.digital);
    }

    pub fn to_hex(&self, version: Version) -> Vec<u8> {
        let mut out = Vec::new();
        self.write(version, &mut out);
        out
    }

    /// Encodes a canonical cell using `config`'s formats and scales.
    ///
    /// # Returns
    ///
    /// * `Err(ParseError::InvalidFormat)`: If the cell's channel counts disagree with
    ///   the configuration.
    pub fn from_cell(cell: &Cell, config: &ConfigurationCell, version: Version) -> Result<Self, ParseError> {
        if !config.matches(cell) {
            return Err(ParseError::InvalidFormat {
                message: format!(
                    "cell {} has {}/{}/{} channels, configuration declares {}/{}/{}",
                    cell.id_code,
                    cell.phasors.len(),
                    cell.analogs.len(),
                    cell.digitals.len(),
                    config.phasors.len(),
                    config.analogs.len(),
                    config.digitals.len()
                ),
            });
        }
        let layout = CellLayout::from_cell(config);

        let mut phasors = Vec::with_capacity(layout.phasor_type.size() * layout.phasor_count);
        for (value, definition) in cell.phasors.iter().zip(&config.phasors) {
            PhasorValue::from_canonical(value, layout.phasor_type, definition.scale)
                .write_to(&mut phasors);
        }

        let nominal = config.nominal_frequency.hertz();
        let (freq, dfreq) = if layout.float_frequency {
            (
                (cell.frequency as f32).to_be_bytes().to_vec(),
                (cell.dfdt as f32).to_be_bytes().to_vec(),
            )
        } else {
            (
                clamp_i16((cell.frequency - nominal) * FREQ_INT_SCALE)
                    .to_be_bytes()
                    .to_vec(),
                clamp_i16(cell.dfdt * DFDT_INT_SCALE).to_be_bytes().to_vec(),
            )
        };

        let mut analog = Vec::with_capacity(layout.analog_size() * layout.analog_count);
        for (value, definition) in cell.analogs.iter().zip(&config.analogs) {
            if layout.float_analog {
                analog.extend_from_slice(&(*value as f32).to_be_bytes());
            } else {
                analog.extend_from_slice(&clamp_i16(value / definition.effective_scale()).to_be_bytes());
            }
        }

        let digital = cell.digitals.iter().flat_map(|d| d.to_be_bytes()).collect();

        Ok(PMUData {
            stat: StatField::from_cell_status(cell.status, version),
            phasors,
            freq,
            dfreq,
            analog,
            digital,
        })
    }

    /// Decodes this cell's values using `config`'s formats and scales.
    pub fn to_cell(&self, config: &ConfigurationCell, version: Version) -> Result<Cell, ParseError> {
        let layout = CellLayout::from_cell(config);
        let phasor_size = layout.phasor_type.size();
        if self.phasors.len() != phasor_size * layout.phasor_count
            || self.freq.len() != layout.freq_size()
            || self.analog.len() != layout.analog_size() * layout.analog_count
            || self.digital.len() != 2 * layout.digital_count
        {
            return Err(ParseError::InvalidLength {
                message: format!("data cell for {} does not match its configuration", config.id_code),
            });
        }

        let mut phasors = Vec::with_capacity(layout.phasor_count);
        for (chunk, definition) in self.phasors.chunks(phasor_size).zip(&config.phasors) {
            phasors.push(PhasorValue::from_hex(chunk, layout.phasor_type)?.to_canonical(definition.scale));
        }

        let (frequency, dfdt) = if layout.float_frequency {
            (
                f32::from_be_bytes([self.freq[0], self.freq[1], self.freq[2], self.freq[3]]) as f64,
                f32::from_be_bytes([self.dfreq[0], self.dfreq[1], self.dfreq[2], self.dfreq[3]]) as f64,
            )
        } else {
            (
                config.nominal_frequency.hertz()
                    + i16::from_be_bytes([self.freq[0], self.freq[1]]) as f64 / FREQ_INT_SCALE,
                i16::from_be_bytes([self.dfreq[0], self.dfreq[1]]) as f64 / DFDT_INT_SCALE,
            )
        };

        let analogs = self
            .analog
            .chunks(layout.analog_size())
            .zip(&config.analogs)
            .map(|(chunk, definition)| {
                if layout.float_analog {
                    f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
                } else {
                    i16::from_be_bytes([chunk[0], chunk[1]]) as f64 * definition.effective_scale()
                }
            })
            .collect();

        let digitals = self
            .digital
            .chunks(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect();

        Ok(Cell {
            id_code: config.id_code,
            status: self.stat.to_cell_status(version),
            phasors,
            frequency,
            dfdt,
            analogs,
            digitals,
        })
    }
}

impl DataFrame {
    /// Parses a data frame using a wire configuration frame, validating the checksum.
    pub fn from_hex(bytes: &[u8], config: &ConfigurationFrame) -> Result<Self, ParseError> {
        let layouts: Vec<CellLayout> = config
            .pmu_configs
            .iter()
            .map(CellLayout::from_pmu_config)
            .collect();
        Self::from_hex_with(bytes, &layouts, true)
    }

    /// Parses a data frame given the cell layouts of the active configuration.
    ///
    /// # Returns
    ///
    /// * `Err(ParseError::InvalidLength)`: If FRAMESIZE disagrees with the buffer or
    ///   with the layouts.
    /// * `Err(ParseError::InvalidChecksum)`: If `verify_checksum` and the CRC fails.
    pub fn from_hex_with(
        bytes: &[u8],
        layouts: &[CellLayout],
        verify_checksum: bool,
    ) -> Result<Self, ParseError> {
        let prefix = PrefixFrame::from_hex(bytes)?;
        if prefix.frame_type()? != FrameType::Data {
            return Err(ParseError::InvalidFrameType {
                message: format!("DataFrame: SYNC 0x{:04X} is not a data frame", prefix.sync),
            });
        }
        prefix.expect_framesize(bytes.len(), "DataFrame")?;
        if verify_checksum {
            validate_checksum(bytes)?;
        }

        let expected = PREFIX_SIZE + CHECKSUM_SIZE + layouts.iter().map(CellLayout::size).sum::<usize>();
        if expected != bytes.len() {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "DataFrame: configuration implies {} bytes, frame has {}",
                    expected,
                    bytes.len()
                ),
            });
        }

        let body = &bytes[..bytes.len() - CHECKSUM_SIZE];
        let mut cursor = Cursor::new(body, PREFIX_SIZE, "DataFrame");
        let pmu_data = layouts
            .iter()
            .map(|layout| PMUData::read(&mut cursor, layout, prefix.version))
            .collect::<Result<Vec<_>, _>>()?;

        let chk = u16::from_be_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]);
        Ok(DataFrame {
            prefix,
            pmu_data,
            chk,
        })
    }

    /// Converts the data frame to bytes, filling FRAMESIZE and CHK.
    pub fn to_hex(&self) -> Result<Vec<u8>, ParseError> {
        let mut result = Vec::new();
        result.extend_from_slice(&self.prefix.to_hex());
        for pmu in &self.pmu_data {
            pmu.write(self.prefix.version, &mut result);
        }

        let frame_size = result.len() + CHECKSUM_SIZE;
        if frame_size > u16::MAX as usize {
            return Err(ParseError::InvalidLength {
                message: format!("DataFrame: {} bytes exceeds the 65535 byte frame limit", frame_size),
            });
        }
        result[2..4].copy_from_slice(&(frame_size as u16).to_be_bytes());
        append_checksum(&mut result);
        Ok(result)
    }

    /// Builds a data frame from a canonical frame. With `config_changed` every cell
    /// carries the configuration-changed STAT bit.
    pub fn from_canonical(
        config: &CanonicalConfiguration,
        frame: &Frame,
        version: Version,
        config_changed: bool,
    ) -> Result<Self, ParseError> {
        if frame.cells.len() != config.cells.len() {
            return Err(ParseError::InvalidFormat {
                message: format!(
                    "frame has {} cells, configuration declares {}",
                    frame.cells.len(),
                    config.cells.len()
                ),
            });
        }
        let (soc, fracsec) = soc_fracsec_from_ticks(frame.timestamp, config.time_base);

        let mut pmu_data = Vec::with_capacity(frame.cells.len());
        for (cell, cell_config) in frame.cells.iter().zip(&config.cells) {
            let mut data = PMUData::from_cell(cell, cell_config, version)?;
            if config_changed {
                let mut status = data.stat.to_cell_status(version);
                status.set(CellStatus::CONFIGURATION_CHANGED);
                data.stat = StatField::from_cell_status(status, version);
            }
            pmu_data.push(data);
        }

        Ok(DataFrame {
            prefix: PrefixFrame::new(version, FrameType::Data, config.id_code).with_time(soc, fracsec),
            pmu_data,
            chk: 0,
        })
    }

    pub fn to_canonical(&self, config: &CanonicalConfiguration) -> Result<Frame, ParseError> {
        if self.pmu_data.len() != config.cells.len() {
            return Err(ParseError::InvalidFormat {
                message: format!(
                    "data frame has {} cells, configuration declares {}",
                    self.pmu_data.len(),
                    config.cells.len()
                ),
            });
        }
        let cells = self
            .pmu_data
            .iter()
            .zip(&config.cells)
            .map(|(data, cell_config)| data.to_cell(cell_config, self.prefix.version))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Frame {
            timestamp: ticks_from_soc_fracsec(self.prefix.soc, self.prefix.fracsec, config.time_base),
            published: false,
            cells,
        })
    }
}
