//! # IEEE C37.118.2 Configuration Frame 3
//!
//! CFG-3 is the extended configuration introduced in 2011. Compared with CFG-2 it
//! uses variable-length names, carries a global PMU id, float phasor and analog
//! scales with offsets, and the device location, service class, measurement window
//! and group delay. Frames are emitted unfragmented (CONT_IDX 0).

use super::common::{Cursor, FrameType, ParseError, PrefixFrame, Version, CHECKSUM_SIZE, PREFIX_SIZE};
use super::config::TIME_BASE_MASK;
use super::units::{DigitalUnits, NominalFrequency};
use super::utils::{append_checksum, soc_fracsec_from_ticks, validate_checksum};
use crate::measurement::Ticks;
use crate::model::{
    AnalogDefinition, AnalogKind, ConfigurationCell, ConfigurationFrame as CanonicalConfiguration,
    DataFormats, DigitalDefinition, PhasorDefinition, PhasorKind,
};
use serde::{Deserialize, Serialize};

const PHUNIT_TO_SCALE: f64 = 0.00001;

fn read_name(cursor: &mut Cursor<'_>) -> Result<String, ParseError> {
    let len = cursor.u8()? as usize;
    Ok(String::from_utf8_lossy(cursor.take(len)?).to_string())
}

fn write_name(name: &str, out: &mut Vec<u8>) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    out.push(len as u8);
    out.extend_from_slice(&bytes[..len]);
}

/// PHSCALE entry: flags, phasor type, user byte, scale and angle offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasorScale {
    pub flags: u16,
    pub is_current: bool,
    pub component: u8,
    pub user: u8,
    pub scale: f32,
    pub angle_offset: f32,
}

impl PhasorScale {
    fn read(cursor: &mut Cursor<'_>) -> Result<Self, ParseError> {
        let flags = cursor.u16()?;
        let kind = cursor.u8()?;
        let user = cursor.u8()?;
        Ok(PhasorScale {
            flags,
            is_current: kind & 0x08 != 0,
            component: kind & 0x07,
            user,
            scale: cursor.f32()?,
            angle_offset: cursor.f32()?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.push(((self.is_current as u8) << 3) | (self.component & 0x07));
        out.push(self.user);
        out.extend_from_slice(&self.scale.to_be_bytes());
        out.extend_from_slice(&self.angle_offset.to_be_bytes());
    }
}

/// ANSCALE entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogScale {
    pub scale: f32,
    pub offset: f32,
}

/// One PMU block of a CFG-3 frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PMUConfiguration3 {
    pub stn: String,
    pub idcode: u16,
    pub g_pmu_id: [u8; 16],
    pub format: u16,
    pub phasor_names: Vec<String>,
    pub analog_names: Vec<String>,
    /// 16 names per digital word.
    pub digital_names: Vec<String>,
    pub phscale: Vec<PhasorScale>,
    pub anscale: Vec<AnalogScale>,
    pub digunit: Vec<DigitalUnits>,
    pub latitude: f32,
    pub longitude: f32,
    pub elevation: f32,
    pub svc_class: u8,
    pub window: i32,
    pub group_delay: i32,
    pub fnom: NominalFrequency,
    pub cfgcnt: u16,
}

impl PMUConfiguration3 {
    fn read(cursor: &mut Cursor<'_>) -> Result<Self, ParseError> {
        let stn = read_name(cursor)?;
        let idcode = cursor.u16()?;
        let mut g_pmu_id = [0u8; 16];
        g_pmu_id.copy_from_slice(cursor.take(16)?);
        let format = cursor.u16()?;
        let phnmr = cursor.u16()? as usize;
        let annmr = cursor.u16()? as usize;
        let dgnmr = cursor.u16()? as usize;

        let phasor_names = (0..phnmr)
            .map(|_| read_name(cursor))
            .collect::<Result<Vec<_>, _>>()?;
        let analog_names = (0..annmr)
            .map(|_| read_name(cursor))
            .collect::<Result<Vec<_>, _>>()?;
        let digital_names = (0..16 * dgnmr)
            .map(|_| read_name(cursor))
            .collect::<Result<Vec<_>, _>>()?;

        let phscale = (0..phnmr)
            .map(|_| PhasorScale::read(cursor))
            .collect::<Result<Vec<_>, _>>()?;
        let mut anscale = Vec::with_capacity(annmr);
        for _ in 0..annmr {
            anscale.push(AnalogScale {
                scale: cursor.f32()?,
                offset: cursor.f32()?,
            });
        }
        let mut digunit = Vec::with_capacity(dgnmr);
        for _ in 0..dgnmr {
            digunit.push(DigitalUnits::from_hex(cursor.take(4)?)?);
        }

        Ok(PMUConfiguration3 {
            stn,
            idcode,
            g_pmu_id,
            format,
            phasor_names,
            analog_names,
            digital_names,
            phscale,
            anscale,
            digunit,
            latitude: cursor.f32()?,
            longitude: cursor.f32()?,
            elevation: cursor.f32()?,
            svc_class: cursor.u8()?,
            window: cursor.i32()?,
            group_delay: cursor.i32()?,
            fnom: NominalFrequency::from_hex(cursor.take(2)?)?,
            cfgcnt: cursor.u16()?,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        write_name(&self.stn, out);
        out.extend_from_slice(&self.idcode.to_be_bytes());
        out.extend_from_slice(&self.g_pmu_id);
        out.extend_from_slice(&self.format.to_be_bytes());
        out.extend_from_slice(&(self.phasor_names.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.analog_names.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.digunit.len() as u16).to_be_bytes());
        for name in self
            .phasor_names
            .iter()
            .chain(&self.analog_names)
            .chain(&self.digital_names)
        {
            write_name(name, out);
        }
        for scale in &self.phscale {
            scale.write(out);
        }
        for scale in &self.anscale {
            out.extend_from_slice(&scale.scale.to_be_bytes());
            out.extend_from_slice(&scale.offset.to_be_bytes());
        }
        for unit in &self.digunit {
            out.extend_from_slice(&unit.to_hex());
        }
        out.extend_from_slice(&self.latitude.to_be_bytes());
        out.extend_from_slice(&self.longitude.to_be_bytes());
        out.extend_from_slice(&self.elevation.to_be_bytes());
        out.push(self.svc_class);
        out.extend_from_slice(&self.window.to_be_bytes());
        out.extend_from_slice(&self.group_delay.to_be_bytes());
        out.extend_from_slice(&self.fnom.to_hex());
        out.extend_from_slice(&self.cfgcnt.to_be_bytes());
    }

    pub fn from_canonical(cell: &ConfigurationCell, cfgcnt: u16) -> Self {
        PMUConfiguration3 {
            stn: cell.station_name.clone(),
            idcode: cell.id_code,
            g_pmu_id: [0; 16],
            format: cell.formats.to_format_word(),
            phasor_names: cell.phasors.iter().map(|p| p.label.clone()).collect(),
            analog_names: cell.analogs.iter().map(|a| a.label.clone()).collect(),
            digital_names: cell
                .digitals
                .iter()
                .flat_map(|d| (0..16).map(move |bit| d.labels.get(bit).cloned().unwrap_or_default()))
                .collect(),
            phscale: cell
                .phasors
                .iter()
                .map(|p| PhasorScale {
                    flags: 0,
                    is_current: p.kind == PhasorKind::Current,
                    component: 0,
                    user: 0,
                    scale: (p.scale as f64 * PHUNIT_TO_SCALE) as f32,
                    angle_offset: 0.0,
                })
                .collect(),
            anscale: cell
                .analogs
                .iter()
                .map(|a| AnalogScale {
                    scale: a.scale as f32,
                    offset: 0.0,
                })
                .collect(),
            digunit: cell
                .digitals
                .iter()
                .map(|d| DigitalUnits {
                    normal_status: d.normal_status,
                    valid_inputs: d.valid_inputs,
                })
                .collect(),
            latitude: 0.0,
            longitude: 0.0,
            elevation: 0.0,
            svc_class: b'M',
            window: 0,
            group_delay: 0,
            fnom: cell.nominal_frequency.into(),
            cfgcnt,
        }
    }

    /// Canonical cell. CFG-3 carries no analog type, so analogs come back as RMS.
    pub fn to_canonical(&self) -> ConfigurationCell {
        let mut cell = ConfigurationCell::new(self.idcode, self.stn.clone(), self.stn.clone())
            .with_formats(DataFormats::from_format_word(self.format))
            .with_nominal_frequency(self.fnom.into());

        cell.phasors = self
            .phasor_names
            .iter()
            .zip(&self.phscale)
            .map(|(label, scale)| PhasorDefinition {
                label: label.clone(),
                kind: if scale.is_current {
                    PhasorKind::Current
                } else {
                    PhasorKind::Voltage
                },
                scale: (scale.scale as f64 / PHUNIT_TO_SCALE).round().max(0.0) as u32,
            })
            .collect();
        cell.analogs = self
            .analog_names
            .iter()
            .zip(&self.anscale)
            .map(|(label, scale)| AnalogDefinition {
                label: label.clone(),
                kind: AnalogKind::Rms,
                scale: scale.scale.round() as i32,
            })
            .collect();
        cell.digitals = self
            .digunit
            .iter()
            .enumerate()
            .map(|(i, unit)| DigitalDefinition {
                labels: self
                    .digital_names
                    .iter()
                    .skip(16 * i)
                    .take(16)
                    .cloned()
                    .collect(),
                normal_status: unit.normal_status,
                valid_inputs: unit.valid_inputs,
            })
            .collect();
        cell
    }
}

/// A complete CFG-3 frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationFrame3 {
    pub prefix: PrefixFrame,
    pub cont_idx: u16,
    pub time_base: u32,
    pub pmu_configs: Vec<PMUConfiguration3>,
    pub data_rate: i16,
}

impl ConfigurationFrame3 {
    pub fn from_hex(bytes: &[u8], verify_checksum: bool) -> Result<Self, ParseError> {
        let prefix = PrefixFrame::from_hex(bytes)?;
        if prefix.frame_type()? != FrameType::Config3 {
            return Err(ParseError::InvalidFrameType {
                message: format!("ConfigurationFrame3: SYNC 0x{:04X} is not CFG-3", prefix.sync),
            });
        }
        if !prefix.version.supports_config3() {
            return Err(ParseError::VersionNotSupported {
                message: format!("CFG-3 is not defined for {}", prefix.version),
            });
        }
        prefix.expect_framesize(bytes.len(), "ConfigurationFrame3")?;
        if verify_checksum {
            validate_checksum(bytes)?;
        }

        let body = &bytes[..bytes.len() - CHECKSUM_SIZE];
        let mut cursor = Cursor::new(body, PREFIX_SIZE, "ConfigurationFrame3");
        let cont_idx = cursor.u16()?;
        if cont_idx != 0 {
            return Err(ParseError::InvalidFormat {
                message: format!("fragmented CFG-3 (CONT_IDX {}) is not supported", cont_idx),
            });
        }
        let time_base = cursor.u32()?;
        let num_pmu = cursor.u16()?;
        let pmu_configs = (0..num_pmu)
            .map(|_| PMUConfiguration3::read(&mut cursor))
            .collect::<Result<Vec<_>, _>>()?;
        let data_rate = cursor.i16()?;

        Ok(ConfigurationFrame3 {
            prefix,
            cont_idx,
            time_base,
            pmu_configs,
            data_rate,
        })
    }

    pub fn to_hex(&self) -> Result<Vec<u8>, ParseError> {
        let mut result = Vec::new();
        result.extend_from_slice(&self.prefix.to_hex());
        result.extend_from_slice(&self.cont_idx.to_be_bytes());
        result.extend_from_slice(&self.time_base.to_be_bytes());
        result.extend_from_slice(&(self.pmu_configs.len() as u16).to_be_bytes());
        for pmu in &self.pmu_configs {
            pmu.write(&mut result);
        }
        result.extend_from_slice(&self.data_rate.to_be_bytes());

        let frame_size = result.len() + CHECKSUM_SIZE;
        if frame_size > u16::MAX as usize {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "ConfigurationFrame3: {} bytes exceeds the 65535 byte frame limit",
                    frame_size
                ),
            });
        }
        result[2..4].copy_from_slice(&(frame_size as u16).to_be_bytes());
        append_checksum(&mut result);
        Ok(result)
    }

    pub fn from_canonical(
        config: &CanonicalConfiguration,
        version: Version,
        cfgcnt: u16,
        timestamp: Ticks,
    ) -> Result<Self, ParseError> {
        if !version.supports_config3() {
            return Err(ParseError::VersionNotSupported {
                message: format!("CFG-3 is not defined for {}", version),
            });
        }
        let time_base = config.time_base & TIME_BASE_MASK;
        let (soc, fracsec) = soc_fracsec_from_ticks(timestamp, time_base);
        Ok(ConfigurationFrame3 {
            prefix: PrefixFrame::new(version, FrameType::Config3, config.id_code)
                .with_time(soc, fracsec),
            cont_idx: 0,
            time_base,
            pmu_configs: config
                .cells
                .iter()
                .map(|cell| PMUConfiguration3::from_canonical(cell, cfgcnt))
                .collect(),
            data_rate: config.frame_rate.min(i16::MAX as u16) as i16,
        })
    }

    pub fn to_canonical(&self) -> CanonicalConfiguration {
        CanonicalConfiguration {
            id_code: self.prefix.idcode,
            frame_rate: if self.data_rate > 0 {
                self.data_rate as u16
            } else {
                1
            },
            time_base: self.time_base & TIME_BASE_MASK,
            cells: self
                .pmu_configs
                .iter()
                .map(PMUConfiguration3::to_canonical)
                .collect(),
        }
    }
}
