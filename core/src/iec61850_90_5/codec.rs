//! # IEC 61850-90-5 Codec
//!
//! Data frames use the sampled value session layout from [`super::data_frame`];
//! configuration, header and command frames reuse the C37.118 2011 layouts. The
//! codec owns the stream state the protocol requires: the ASDU sample counter, the
//! session packet number and the cascade of recent ASDU images.

use super::common::{SecurityAlgorithm, SignatureAlgorithm, CLTP_LENGTH_INDICATOR, CLTP_TAG, TIMEBASE};
use super::data_frame::{frame_length, Asdu, DataFrame, SessionHeader};
use crate::codec::{
    CodecError, ConfigurationImages, DataFrameOptions, DecodedFrame, DeviceCommand, FrameKind,
    FrameLength, PhasorProtocol, ProtocolCodec,
};
use crate::ieee_c37_118::codec::IeeeC37118Codec;
use crate::ieee_c37_118::common::{Cursor, ParseError, Version, SYNC_BYTE};
use crate::ieee_c37_118::data_frame::{CellLayout, DataFrame as C37DataFrame, PMUData};
use crate::ieee_c37_118::utils::soc_fracsec_from_ticks;
use crate::measurement::{ticks_to_seconds, utc_now_ticks, Ticks};
use crate::model::{ConfigurationFrame, Frame};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};

const VERSION: Version = Version::V2011;

/// Publishing options for IEC 61850-90-5 streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Iec61850Options {
    /// MSVID of every ASDU. Defaults to `<idcode>_<first station name>`.
    pub msv_id: Option<String>,
    /// ASDUs per frame; older samples are repeated for redundancy.
    pub asdu_count: u8,
    pub app_id: u16,
    pub signature: SignatureAlgorithm,
    pub security: SecurityAlgorithm,
    pub key_id: u32,
    pub simulated: bool,
}

impl Default for Iec61850Options {
    fn default() -> Self {
        Iec61850Options {
            msv_id: None,
            asdu_count: 1,
            app_id: 0x4000,
            signature: SignatureAlgorithm::None,
            security: SecurityAlgorithm::None,
            key_id: 0,
            simulated: false,
        }
    }
}

pub struct Iec61850Codec {
    options: Iec61850Options,
    sample_count: AtomicU16,
    packet_number: AtomicU32,
    configuration_revision: AtomicU32,
    cascade: Mutex<VecDeque<Vec<u8>>>,
}

impl Iec61850Codec {
    pub fn new(options: Iec61850Options) -> Self {
        let options = Iec61850Options {
            asdu_count: options.asdu_count.max(1),
            ..options
        };
        Iec61850Codec {
            options,
            sample_count: AtomicU16::new(0),
            packet_number: AtomicU32::new(0),
            configuration_revision: AtomicU32::new(1),
            cascade: Mutex::new(VecDeque::new()),
        }
    }

    pub fn options(&self) -> &Iec61850Options {
        &self.options
    }

    pub fn sample_count(&self) -> u16 {
        self.sample_count.load(Ordering::Relaxed)
    }

    pub fn packet_number(&self) -> u32 {
        self.packet_number.load(Ordering::Relaxed)
    }

    fn msv_id(&self, config: &ConfigurationFrame) -> String {
        match &self.options.msv_id {
            Some(id) => id.clone(),
            None => {
                let station = config
                    .cells
                    .first()
                    .map(|cell| cell.station_name.trim())
                    .unwrap_or("");
                format!("{}_{}", config.id_code, station)
            }
        }
    }

    /// Pushes `image` as the newest ASDU and returns the images to publish, oldest
    /// first. The first image fills every slot.
    fn cascade(&self, image: Vec<u8>) -> Vec<Vec<u8>> {
        let count = self.options.asdu_count as usize;
        let mut cascade = self.cascade.lock();
        if cascade.is_empty() {
            cascade.extend(std::iter::repeat(image).take(count));
        } else {
            cascade.pop_front();
            cascade.push_back(image);
        }
        cascade.iter().cloned().collect()
    }

    fn decode_samples(samples: &[u8], config: &ConfigurationFrame, timestamp: Ticks) -> Result<Frame, CodecError> {
        let layouts: Vec<CellLayout> = config.cells.iter().map(CellLayout::from_cell).collect();
        let expected: usize = layouts.iter().map(CellLayout::size).sum();
        if samples.len() != expected {
            return Err(ParseError::InvalidLength {
                message: format!(
                    "sample block of {} bytes does not match the configured {}",
                    samples.len(),
                    expected
                ),
            }
            .into());
        }
        let mut cursor = Cursor::new(samples, 0, "ASDU samples");
        let cells = layouts
            .iter()
            .zip(&config.cells)
            .map(|(layout, cell_config)| {
                PMUData::read(&mut cursor, layout, VERSION)?.to_cell(cell_config, VERSION)
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Frame {
            timestamp,
            published: false,
            cells,
        })
    }
}

impl ProtocolCodec for Iec61850Codec {
    fn protocol(&self) -> PhasorProtocol {
        PhasorProtocol::Iec61850_90_5
    }

    /// Projects CFG-1 and CFG-2 in the C37.118 2011 layout. A new projection starts
    /// a fresh ASDU cascade because the sample size may have changed.
    fn project_configuration(
        &self,
        config: &ConfigurationFrame,
        revision: u16,
        timestamp: Ticks,
    ) -> Result<ConfigurationImages, CodecError> {
        let images = IeeeC37118Codec::new(VERSION).encode_configuration(config, revision, timestamp, false)?;
        self.configuration_revision.store(revision as u32, Ordering::Relaxed);
        self.cascade.lock().clear();
        Ok(images)
    }

    fn encode_data_frame(
        &self,
        config: &ConfigurationFrame,
        frame: &Frame,
        options: DataFrameOptions,
    ) -> Result<Vec<u8>, CodecError> {
        let cells = C37DataFrame::from_canonical(config, frame, VERSION, options.config_changed)?;
        let mut samples = Vec::new();
        for cell in &cells.pmu_data {
            cell.write(VERSION, &mut samples);
        }

        let (soc, fracsec) = soc_fracsec_from_ticks(frame.timestamp, TIMEBASE);
        let asdu = Asdu {
            msv_id: self.msv_id(config),
            smp_cnt: self.sample_count.fetch_add(1, Ordering::Relaxed),
            conf_rev: self.configuration_revision.load(Ordering::Relaxed),
            soc,
            fracsec,
            time_quality: 0,
            smp_synch: 1,
            smp_rate: None,
            samples,
        };
        let images = self.cascade(asdu.encode()?);

        let header = SessionHeader {
            packet_number: self.packet_number.fetch_add(1, Ordering::Relaxed),
            key_time: ticks_to_seconds(utc_now_ticks()).max(0.0) as u32,
            security: self.options.security,
            signature: self.options.signature,
            key_id: self.options.key_id,
            simulated: self.options.simulated,
            app_id: self.options.app_id,
        };
        DataFrame::encode(&header, &images)
    }

    fn encode_header_frame(
        &self,
        id_code: u16,
        timestamp: Ticks,
        time_base: u32,
        text: &str,
    ) -> Result<Vec<u8>, CodecError> {
        IeeeC37118Codec::encode_header(VERSION, id_code, timestamp, time_base, text)
    }

    fn encode_command_frame(
        &self,
        id_code: u16,
        command: &DeviceCommand,
        timestamp: Ticks,
    ) -> Result<Vec<u8>, CodecError> {
        Ok(IeeeC37118Codec::encode_command(VERSION, id_code, command, timestamp))
    }

    fn find_sync(&self, buf: &[u8]) -> Option<usize> {
        let c37 = IeeeC37118Codec::new(VERSION);
        (0..buf.len()).find(|&i| match buf[i] {
            SYNC_BYTE => c37.find_sync(&buf[i..]) == Some(0),
            CLTP_LENGTH_INDICATOR => buf.get(i + 1).map_or(true, |&b| b == CLTP_TAG),
            _ => false,
        })
    }

    fn frame_length(&self, buf: &[u8]) -> Result<FrameLength, CodecError> {
        match buf.first() {
            None => Ok(FrameLength::Incomplete),
            Some(&CLTP_LENGTH_INDICATOR) => frame_length(buf),
            Some(_) => IeeeC37118Codec::c37_frame_length(buf),
        }
    }

    fn frame_kind(&self, frame: &[u8]) -> Result<FrameKind, CodecError> {
        match frame.first() {
            Some(&CLTP_LENGTH_INDICATOR) => Ok(FrameKind::Data),
            _ => IeeeC37118Codec::c37_frame_kind(frame),
        }
    }

    fn decode(
        &self,
        frame: &[u8],
        config: Option<&ConfigurationFrame>,
        verify_checksum: bool,
    ) -> Result<DecodedFrame, CodecError> {
        if frame.first() != Some(&CLTP_LENGTH_INDICATOR) {
            return IeeeC37118Codec::decode_common(frame, config, verify_checksum);
        }
        let parsed = DataFrame::from_hex(frame, verify_checksum)?;
        let config = config.ok_or(CodecError::MissingConfiguration)?;
        let asdu = parsed
            .latest()
            .ok_or_else(|| CodecError::Malformed("data frame carries no ASDU".to_string()))?;
        Ok(DecodedFrame::Data {
            id_code: asdu.id_code().unwrap_or(config.id_code),
            frame: Self::decode_samples(&asdu.samples, config, asdu.timestamp())?,
        })
    }

    fn status(&self) -> String {
        let msv_id = self.options.msv_id.as_deref().unwrap_or("<idcode>_<station>");
        let mut status = String::new();
        let _ = writeln!(status, "{:>24}: {}", "MSVID", msv_id);
        let _ = writeln!(status, "{:>24}: {}", "ASDU count", self.options.asdu_count);
        let _ = writeln!(
            status,
            "{:>24}: {}",
            "Configuration revision",
            self.configuration_revision.load(Ordering::Relaxed)
        );
        let _ = writeln!(status, "{:>24}: {}", "Sample count", self.sample_count());
        let _ = writeln!(status, "{:>24}: {}", "Packet number", self.packet_number());
        let _ = writeln!(status, "{:>24}: {}", "Signature algorithm", self.options.signature);
        let _ = writeln!(status, "{:>24}: {}", "Security algorithm", self.options.security);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ConfigurationKind;
    use crate::measurement::TICKS_PER_SECOND;
    use crate::model::{CellStatus, ConfigurationCell, PhasorKind, PhasorValue};

    fn config() -> ConfigurationFrame {
        ConfigurationFrame::new(235, 30).with_cell(
            ConfigurationCell::new(235, "SHELBY", "SHELBY")
                .with_phasor("VA", PhasorKind::Voltage, 915_527)
                .with_phasor("IA", PhasorKind::Current, 45_776),
        )
    }

    fn frame(config: &ConfigurationFrame, timestamp: Ticks, magnitude: f64) -> Frame {
        let mut frame = config.empty_frame(timestamp);
        let cell = &mut frame.cells[0];
        cell.phasors[0] = PhasorValue::Polar {
            magnitude,
            angle: 0.25,
        };
        cell.frequency = 60.01;
        cell.dfdt = 0.0;
        frame
    }

    #[test]
    fn test_cascade_and_counters() {
        let codec = Iec61850Codec::new(Iec61850Options {
            asdu_count: 3,
            ..Iec61850Options::default()
        });
        let config = config();
        codec.project_configuration(&config, 5, 0).unwrap();
        let start = 1_700_000_000 * TICKS_PER_SECOND;

        let first = codec
            .encode_data_frame(&config, &frame(&config, start, 100.0), DataFrameOptions::default())
            .unwrap();
        let parsed = DataFrame::from_hex(&first, true).unwrap();
        assert_eq!(parsed.asdus.len(), 3);
        assert!(parsed.asdus.iter().all(|a| a.smp_cnt == 0));
        assert_eq!(parsed.asdus[0].msv_id, "235_SHELBY");
        assert_eq!(parsed.asdus[0].conf_rev, 5);

        let second = codec
            .encode_data_frame(
                &config,
                &frame(&config, start + TICKS_PER_SECOND / 30, 200.0),
                DataFrameOptions::default(),
            )
            .unwrap();
        let parsed = DataFrame::from_hex(&second, true).unwrap();
        let counts: Vec<u16> = parsed.asdus.iter().map(|a| a.smp_cnt).collect();
        assert_eq!(counts, vec![0, 0, 1]);
        assert_eq!(parsed.header.packet_number, 1);
        assert_eq!(codec.sample_count(), 2);

        let DecodedFrame::Data { id_code, frame: decoded } = codec.decode(&second, Some(&config), true).unwrap()
        else {
            panic!("expected a data frame");
        };
        assert_eq!(id_code, 235);
        assert!((decoded.cells[0].phasors[0].magnitude() - 200.0).abs() < 1e-3);
        assert!((decoded.timestamp - (start + TICKS_PER_SECOND / 30)).abs() <= 1);
    }

    #[test]
    fn test_counters_wrap() {
        let codec = Iec61850Codec::new(Iec61850Options::default());
        codec.sample_count.store(u16::MAX, Ordering::Relaxed);
        codec.packet_number.store(u32::MAX, Ordering::Relaxed);
        let config = config();
        codec
            .encode_data_frame(&config, &frame(&config, 0, 1.0), DataFrameOptions::default())
            .unwrap();
        assert_eq!(codec.sample_count(), 0);
        assert_eq!(codec.packet_number(), 0);
    }

    #[test]
    fn test_configuration_and_commands_use_c37_layout() {
        let codec = Iec61850Codec::new(Iec61850Options::default());
        let images = codec.project_configuration(&config(), 1, 0).unwrap();
        let cfg2 = images.image(ConfigurationKind::Cfg2).unwrap();
        assert_eq!(&cfg2[..2], &[0xAA, 0x32]);
        assert!(images.cfg3.is_none());

        let mut stream = vec![0x55, 0x01, 0x02];
        stream.extend_from_slice(cfg2);
        assert_eq!(codec.find_sync(&stream), Some(3));
        assert_eq!(
            codec.frame_length(&stream[3..]).unwrap(),
            FrameLength::Complete(cfg2.len())
        );

        let command = codec
            .encode_command_frame(235, &DeviceCommand::EnableRealTimeData, 0)
            .unwrap();
        assert_eq!(codec.frame_kind(&command).unwrap(), FrameKind::Command);
    }

    #[test]
    fn test_config_changed_flag_reaches_asdu_cells() {
        let codec = Iec61850Codec::new(Iec61850Options::default());
        let config = config();
        let bytes = codec
            .encode_data_frame(
                &config,
                &frame(&config, 0, 1.0),
                DataFrameOptions { config_changed: true },
            )
            .unwrap();
        let DecodedFrame::Data { frame, .. } = codec.decode(&bytes, Some(&config), true).unwrap() else {
            panic!("expected a data frame");
        };
        assert!(frame.cells[0].status.contains(CellStatus::CONFIGURATION_CHANGED));
        assert!(codec.decode(&bytes, None, true).is_err());
        assert!(codec.status().contains("ASDU count: 1"));
    }
}
