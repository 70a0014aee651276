//! # IEEE C37.118 Codec
//!
//! [`ProtocolCodec`] over the C37.118 frame modules. One codec instance speaks one
//! revision when encoding; decoding accepts any revision and follows the SYNC word
//! of each frame.

use super::commands::CommandFrame;
use super::common::{FrameType, ParseError, Version, CHECKSUM_SIZE, PREFIX_SIZE, SYNC_BYTE};
use super::config::ConfigurationFrame as WireConfiguration;
use super::config3::ConfigurationFrame3;
use super::data_frame::{CellLayout, DataFrame};
use super::header::HeaderFrame;
use super::utils::{soc_fracsec_from_ticks, ticks_from_soc_fracsec};
use crate::codec::{
    CodecError, ConfigurationImages, ConfigurationKind, DataFrameOptions, DecodedFrame,
    DeviceCommand, FrameKind, FrameLength, PhasorProtocol, ProtocolCodec,
};
use crate::measurement::Ticks;
use crate::model::{ConfigurationFrame, Frame, DEFAULT_TIME_BASE};

#[derive(Debug, Clone, Copy)]
pub struct IeeeC37118Codec {
    version: Version,
}

impl IeeeC37118Codec {
    pub fn new(version: Version) -> Self {
        IeeeC37118Codec { version }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// True when `byte` can follow 0xAA in a SYNC word.
    fn valid_second_sync_byte(byte: u8) -> bool {
        let sync = ((SYNC_BYTE as u16) << 8) | byte as u16;
        FrameType::from_sync(sync).is_ok() && Version::from_sync(sync).is_ok()
    }

    pub(crate) fn encode_configuration(
        &self,
        config: &ConfigurationFrame,
        revision: u16,
        timestamp: Ticks,
        with_cfg3: bool,
    ) -> Result<ConfigurationImages, CodecError> {
        let cfg1 = WireConfiguration::from_canonical(
            config,
            FrameType::Config1,
            self.version,
            revision,
            timestamp,
        )?
        .to_hex()?;
        let cfg2 = WireConfiguration::from_canonical(
            config,
            FrameType::Config2,
            self.version,
            revision,
            timestamp,
        )?
        .to_hex()?;
        let cfg3 = if with_cfg3 && self.version.supports_config3() {
            Some(ConfigurationFrame3::from_canonical(config, self.version, revision, timestamp)?.to_hex()?)
        } else {
            None
        };
        Ok(ConfigurationImages {
            cfg1: Some(cfg1),
            cfg2: Some(cfg2),
            cfg3,
        })
    }

    pub(crate) fn c37_frame_length(buf: &[u8]) -> Result<FrameLength, CodecError> {
        if buf.len() < 4 {
            return Ok(FrameLength::Incomplete);
        }
        if buf[0] != SYNC_BYTE || !Self::valid_second_sync_byte(buf[1]) {
            return Err(CodecError::Malformed(format!(
                "bad SYNC 0x{:02X}{:02X}",
                buf[0], buf[1]
            )));
        }
        let size = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if size < PREFIX_SIZE + CHECKSUM_SIZE {
            return Err(CodecError::Malformed(format!("FRAMESIZE {} is too small", size)));
        }
        if buf.len() < size {
            Ok(FrameLength::Incomplete)
        } else {
            Ok(FrameLength::Complete(size))
        }
    }

    pub(crate) fn c37_frame_kind(frame: &[u8]) -> Result<FrameKind, CodecError> {
        if frame.len() < 2 {
            return Err(CodecError::Malformed("frame shorter than SYNC".to_string()));
        }
        let frame_type = FrameType::from_sync(u16::from_be_bytes([frame[0], frame[1]]))?;
        Ok(match frame_type {
            FrameType::Data => FrameKind::Data,
            FrameType::Header => FrameKind::Header,
            FrameType::Command => FrameKind::Command,
            FrameType::Config1 | FrameType::Config2 | FrameType::Config3 => FrameKind::Configuration,
        })
    }

    /// Decodes everything but data frames, which differ between protocols.
    pub(crate) fn decode_common(
        frame: &[u8],
        config: Option<&ConfigurationFrame>,
        verify_checksum: bool,
    ) -> Result<DecodedFrame, CodecError> {
        if frame.len() < 2 {
            return Err(CodecError::Malformed("frame shorter than SYNC".to_string()));
        }
        let frame_type = FrameType::from_sync(u16::from_be_bytes([frame[0], frame[1]]))?;
        match frame_type {
            FrameType::Config1 | FrameType::Config2 => {
                let wire = WireConfiguration::from_hex_with(frame, verify_checksum)?;
                let kind = if frame_type == FrameType::Config1 {
                    ConfigurationKind::Cfg1
                } else {
                    ConfigurationKind::Cfg2
                };
                Ok(DecodedFrame::Configuration {
                    kind,
                    frame: wire.to_canonical(),
                })
            }
            FrameType::Config3 => {
                let wire = ConfigurationFrame3::from_hex(frame, verify_checksum)?;
                Ok(DecodedFrame::Configuration {
                    kind: ConfigurationKind::Cfg3,
                    frame: wire.to_canonical(),
                })
            }
            FrameType::Header => {
                let header = HeaderFrame::from_hex(frame, verify_checksum)?;
                let time_base = config.map_or(DEFAULT_TIME_BASE, |c| c.time_base);
                Ok(DecodedFrame::Header {
                    id_code: header.prefix.idcode,
                    timestamp: ticks_from_soc_fracsec(header.prefix.soc, header.prefix.fracsec, time_base),
                    text: header.text,
                })
            }
            FrameType::Command => {
                let command = CommandFrame::from_hex_with(frame, verify_checksum)?;
                Ok(DecodedFrame::Command {
                    id_code: command.prefix.idcode,
                    command: command.device_command(),
                })
            }
            FrameType::Data => Err(ParseError::InvalidFrameType {
                message: "data frames are decoded by the protocol codec".to_string(),
            }
            .into()),
        }
    }

    pub(crate) fn encode_header(
        version: Version,
        id_code: u16,
        timestamp: Ticks,
        time_base: u32,
        text: &str,
    ) -> Result<Vec<u8>, CodecError> {
        let (soc, fracsec) = soc_fracsec_from_ticks(timestamp, time_base);
        Ok(HeaderFrame::new(id_code, version, soc, fracsec, text).to_hex()?)
    }

    pub(crate) fn encode_command(
        version: Version,
        id_code: u16,
        command: &DeviceCommand,
        timestamp: Ticks,
    ) -> Vec<u8> {
        let time = soc_fracsec_from_ticks(timestamp, DEFAULT_TIME_BASE);
        CommandFrame::from_device_command(id_code, version, command, Some(time)).to_hex()
    }
}

impl ProtocolCodec for IeeeC37118Codec {
    fn protocol(&self) -> PhasorProtocol {
        match self.version {
            Version::V2005 => PhasorProtocol::IeeeC37_118V1,
            Version::V2011 => PhasorProtocol::IeeeC37_118V2,
            Version::V2024 => PhasorProtocol::IeeeC37_118V3,
        }
    }

    fn project_configuration(
        &self,
        config: &ConfigurationFrame,
        revision: u16,
        timestamp: Ticks,
    ) -> Result<ConfigurationImages, CodecError> {
        self.encode_configuration(config, revision, timestamp, true)
    }

    fn encode_data_frame(
        &self,
        config: &ConfigurationFrame,
        frame: &Frame,
        options: DataFrameOptions,
    ) -> Result<Vec<u8>, CodecError> {
        let data = DataFrame::from_canonical(config, frame, self.version, options.config_changed)?;
        Ok(data.to_hex()?)
    }

    fn encode_header_frame(
        &self,
        id_code: u16,
        timestamp: Ticks,
        time_base: u32,
        text: &str,
    ) -> Result<Vec<u8>, CodecError> {
        Self::encode_header(self.version, id_code, timestamp, time_base, text)
    }

    fn encode_command_frame(
        &self,
        id_code: u16,
        command: &DeviceCommand,
        timestamp: Ticks,
    ) -> Result<Vec<u8>, CodecError> {
        Ok(Self::encode_command(self.version, id_code, command, timestamp))
    }

    fn find_sync(&self, buf: &[u8]) -> Option<usize> {
        (0..buf.len()).find(|&i| {
            buf[i] == SYNC_BYTE && buf.get(i + 1).map_or(true, |&b| Self::valid_second_sync_byte(b))
        })
    }

    fn frame_length(&self, buf: &[u8]) -> Result<FrameLength, CodecError> {
        Self::c37_frame_length(buf)
    }

    fn frame_kind(&self, frame: &[u8]) -> Result<FrameKind, CodecError> {
        Self::c37_frame_kind(frame)
    }

    fn decode(
        &self,
        frame: &[u8],
        config: Option<&ConfigurationFrame>,
        verify_checksum: bool,
    ) -> Result<DecodedFrame, CodecError> {
        if Self::c37_frame_kind(frame)? != FrameKind::Data {
            return Self::decode_common(frame, config, verify_checksum);
        }
        let config = config.ok_or(CodecError::MissingConfiguration)?;
        let layouts: Vec<CellLayout> = config.cells.iter().map(CellLayout::from_cell).collect();
        let data = DataFrame::from_hex_with(frame, &layouts, verify_checksum)?;
        Ok(DecodedFrame::Data {
            id_code: data.prefix.idcode,
            frame: data.to_canonical(config)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::TICKS_PER_SECOND;
    use crate::model::{
        AnalogKind, ConfigurationCell, DigitalDefinition, PhasorKind, PhasorValue,
    };

    fn config() -> ConfigurationFrame {
        ConfigurationFrame::new(235, 30)
            .with_cell(
                ConfigurationCell::new(235, "SHELBY", "SHELBY")
                    .with_phasor("VA", PhasorKind::Voltage, 915_527)
                    .with_phasor("IA", PhasorKind::Current, 45_776)
                    .with_analog("MW", AnalogKind::Rms, 1)
                    .with_digital(DigitalDefinition::with_prefix("BRK")),
            )
            .with_cell(ConfigurationCell::new(236, "CORDOVA", "CORDOVA").with_phasor(
                "VB",
                PhasorKind::Voltage,
                915_527,
            ))
    }

    fn sample_frame(config: &ConfigurationFrame, timestamp: Ticks) -> Frame {
        let mut frame = config.empty_frame(timestamp);
        for cell in frame.cells.iter_mut() {
            cell.status.clear(crate::model::CellStatus::NO_DATA);
            for phasor in cell.phasors.iter_mut() {
                *phasor = PhasorValue::Polar {
                    magnitude: 132_790.5,
                    angle: 0.5,
                };
            }
            cell.frequency = 59.98;
            cell.dfdt = 0.01;
            for analog in cell.analogs.iter_mut() {
                *analog = 12.5;
            }
            for digital in cell.digitals.iter_mut() {
                *digital = 0x0101;
            }
        }
        frame
    }

    #[test]
    fn test_stream_round_trip_through_codec() {
        let codec = IeeeC37118Codec::new(Version::V2011);
        let config = config();
        let timestamp = 1_700_000_000 * TICKS_PER_SECOND + TICKS_PER_SECOND / 30;
        let images = codec.project_configuration(&config, 3, timestamp).unwrap();
        assert!(images.cfg3.is_some());

        let data = codec
            .encode_data_frame(&config, &sample_frame(&config, timestamp), DataFrameOptions::default())
            .unwrap();

        let mut stream = vec![0x00, 0xAA, 0xFF];
        let cfg2 = images.image(ConfigurationKind::Cfg2).unwrap();
        stream.extend_from_slice(cfg2);
        stream.extend_from_slice(&data);

        // 0xAA 0xFF is not a valid SYNC word and is skipped.
        assert_eq!(codec.find_sync(&stream), Some(3));
        let buf = &stream[3..];
        assert_eq!(codec.frame_length(&buf[..10]).unwrap(), FrameLength::Incomplete);
        let FrameLength::Complete(len) = codec.frame_length(buf).unwrap() else {
            panic!("configuration frame should be complete");
        };
        assert_eq!(len, cfg2.len());

        let decoded = codec.decode(&buf[..len], None, true).unwrap();
        let DecodedFrame::Configuration { kind, frame: parsed } = decoded else {
            panic!("expected a configuration frame");
        };
        assert_eq!(kind, ConfigurationKind::Cfg2);
        assert_eq!(parsed, config);

        assert!(matches!(
            codec.decode(&buf[len..], None, true),
            Err(CodecError::MissingConfiguration)
        ));
        let DecodedFrame::Data { id_code, frame } = codec.decode(&buf[len..], Some(&parsed), true).unwrap()
        else {
            panic!("expected a data frame");
        };
        assert_eq!(id_code, 235);
        assert!((frame.timestamp - timestamp).abs() <= 1);
        let cell = &frame.cells[0];
        assert!((cell.phasors[0].magnitude() - 132_790.5).abs() < 0.1);
        assert!((cell.frequency - 59.98).abs() < 1e-4);
        assert_eq!(cell.digitals, vec![0x0101]);
    }

    #[test]
    fn test_commands_and_headers_decode() {
        let codec = IeeeC37118Codec::new(Version::V2005);
        let bytes = codec
            .encode_command_frame(235, &DeviceCommand::SendConfigurationFrame2, 0)
            .unwrap();
        assert_eq!(codec.frame_kind(&bytes).unwrap(), FrameKind::Command);
        assert_eq!(
            codec.decode(&bytes, None, true).unwrap(),
            DecodedFrame::Command {
                id_code: 235,
                command: DeviceCommand::SendConfigurationFrame2
            }
        );

        let header = codec
            .encode_header_frame(235, 10 * TICKS_PER_SECOND, DEFAULT_TIME_BASE, "PMU 235")
            .unwrap();
        let DecodedFrame::Header { text, timestamp, .. } = codec.decode(&header, None, true).unwrap()
        else {
            panic!("expected a header frame");
        };
        assert_eq!(text, "PMU 235");
        assert_eq!(timestamp, 10 * TICKS_PER_SECOND);

        // No CFG-3 for the 2005 revision.
        let images = codec.project_configuration(&config(), 1, 0).unwrap();
        assert!(images.cfg3.is_none());
    }

    #[test]
    fn test_frame_length_rejects_garbage() {
        let codec = IeeeC37118Codec::new(Version::V2011);
        assert!(codec.frame_length(&[0xAA, 0x31, 0x00, 0x05]).is_err());
        assert!(codec.frame_length(&[0x12, 0x31, 0x00, 0x20]).is_err());
        assert_eq!(codec.find_sync(&[0x01, 0x02, 0xAA]), Some(2));
        assert_eq!(codec.find_sync(&[0x01, 0x02]), None);
    }
}
