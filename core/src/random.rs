//! # Synthetic Configurations and Frames
//!
//! Generates canonical configurations, frames and measurement streams with plausible
//! values. Used by the CLI's synthetic source, the integration tests and the benches.
//!
//! ## Key Components
//!
//! - `random_configuration`: A configuration of `num_cells` devices, each with three
//!   voltage phasors, one current phasor, one analog of each kind and one digital word.
//! - `random_frame`: A fully populated frame for a configuration.
//! - `frame_measurements`: Splits a frame into the measurements that would rebuild it
//!   through the standard signal map.

use crate::measurement::{Measurement, MeasurementKey, Ticks};
use crate::model::{
    AnalogKind, CellStatus, ConfigurationCell, ConfigurationFrame, CoordinateFormat,
    DataFormats, DigitalDefinition, Frame, LineFrequency, PhasorKind, PhasorValue, SignalField,
    standard_points,
};
use rand::Rng;
use std::f64::consts::PI;

const FIRST_ID_CODE: u16 = 1000;
const VOLTAGE_SCALE: u32 = 915_527;
const CURRENT_SCALE: u32 = 45_776;

fn station_name(index: usize) -> String {
    format!("STATION{:02}", index)
}

fn channel_name(prefix: &str, index: usize) -> String {
    format!("{}_{:02}", prefix, index)
}

/// Builds one device configuration. ID codes start at 1000.
pub fn random_cell<R: Rng + ?Sized>(index: usize, rng: &mut R) -> ConfigurationCell {
    let formats = DataFormats {
        coordinates: if rng.random_bool(0.5) {
            CoordinateFormat::Polar
        } else {
            CoordinateFormat::Rectangular
        },
        ..DataFormats::default()
    };
    let nominal = if rng.random_bool(0.5) {
        LineFrequency::Hz60
    } else {
        LineFrequency::Hz50
    };

    let mut cell = ConfigurationCell::new(
        FIRST_ID_CODE + index as u16,
        station_name(index),
        format!("PMU{:02}", index),
    )
    .with_formats(formats)
    .with_nominal_frequency(nominal);

    for i in 0..3 {
        cell = cell.with_phasor(channel_name("PH", i), PhasorKind::Voltage, VOLTAGE_SCALE);
    }
    cell = cell.with_phasor(channel_name("PH", 3), PhasorKind::Current, CURRENT_SCALE);

    for (i, kind) in [AnalogKind::SinglePointOnWave, AnalogKind::Rms, AnalogKind::Peak]
        .into_iter()
        .enumerate()
    {
        cell = cell.with_analog(channel_name("AN", i), kind, 1);
    }

    cell.with_digital(DigitalDefinition::with_prefix("DG_"))
}

/// Generates a configuration with `num_cells` devices at `frame_rate`.
pub fn random_configuration<R: Rng + ?Sized>(
    id_code: u16,
    frame_rate: u16,
    num_cells: usize,
    rng: &mut R,
) -> ConfigurationFrame {
    (0..num_cells).fold(ConfigurationFrame::new(id_code, frame_rate), |config, i| {
        config.with_cell(random_cell(i, rng))
    })
}

/// Generates a frame for `config` at `timestamp` with every value present.
pub fn random_frame<R: Rng + ?Sized>(
    config: &ConfigurationFrame,
    timestamp: Ticks,
    rng: &mut R,
) -> Frame {
    let mut frame = config.empty_frame(timestamp);

    for (cfg, cell) in config.cells.iter().zip(frame.cells.iter_mut()) {
        cell.status = CellStatus::default();

        for (definition, phasor) in cfg.phasors.iter().zip(cell.phasors.iter_mut()) {
            let magnitude = match definition.kind {
                PhasorKind::Voltage => 132_790.0 + rng.random_range(-500.0..500.0),
                PhasorKind::Current => 400.0 + rng.random_range(-25.0..25.0),
            };
            let value = PhasorValue::Polar {
                magnitude,
                angle: rng.random_range(-PI..PI),
            };
            *phasor = match cfg.formats.coordinates {
                CoordinateFormat::Polar => value,
                CoordinateFormat::Rectangular => value.to_rectangular(),
            };
        }

        cell.frequency = cfg.nominal_frequency.hertz() + rng.random_range(-0.1..0.1);
        cell.dfdt = rng.random_range(-0.05..0.05);

        for analog in cell.analogs.iter_mut() {
            *analog = rng.random_range(0.0..100.0_f64).round();
        }
        for digital in cell.digitals.iter_mut() {
            *digital = rng.random();
        }
    }

    frame
}

/// The measurements that rebuild `frame` through `SignalMap::standard(config)`.
pub fn frame_measurements(config: &ConfigurationFrame, frame: &Frame) -> Vec<Measurement> {
    let mut measurements = Vec::with_capacity(config.measurement_count());

    for (cfg, cell) in config.cells.iter().zip(&frame.cells) {
        for (point_id, field) in standard_points(cfg) {
            let value = match field {
                SignalField::PhasorMagnitude(i) => cell.phasors[i].magnitude(),
                SignalField::PhasorAngle(i) => cell.phasors[i].angle(),
                SignalField::PhasorReal(i) => cell.phasors[i].real(),
                SignalField::PhasorImaginary(i) => cell.phasors[i].imaginary(),
                SignalField::Frequency => cell.frequency,
                SignalField::Dfdt => cell.dfdt,
                SignalField::Analog(i) => cell.analogs[i],
                SignalField::Digital(i) => cell.digitals[i] as f64,
                SignalField::Status => cell.status.0 as f64,
            };
            measurements.push(Measurement::new(
                MeasurementKey::new(cfg.id_label.clone(), point_id),
                frame.timestamp,
                value,
            ));
        }
    }

    measurements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SignalMap;

    #[test]
    fn test_random_configuration_shape() {
        let mut rng = rand::rng();
        let config = random_configuration(7, 30, 3, &mut rng);
        assert_eq!(config.cells.len(), 3);
        assert_eq!(config.cells[2].id_code, 1002);
        assert_eq!(config.cells[0].station_name, "STATION00");
        for cell in &config.cells {
            assert_eq!(cell.phasors.len(), 4);
            assert_eq!(cell.phasors[3].kind, PhasorKind::Current);
            assert_eq!(cell.analogs.len(), 3);
            assert_eq!(cell.digitals.len(), 1);
        }
    }

    #[test]
    fn test_measurements_rebuild_the_frame() {
        let mut rng = rand::rng();
        let config = random_configuration(1, 30, 2, &mut rng);
        let frame = random_frame(&config, 1234, &mut rng);
        let measurements = frame_measurements(&config, &frame);
        assert_eq!(measurements.len(), config.measurement_count());

        let map = SignalMap::standard(&config);
        let mut rebuilt = config.empty_frame(1234);
        for m in &measurements {
            assert_eq!(m.timestamp, 1234);
            let target = map.get(&m.key).unwrap();
            assert!(rebuilt.cells[target.cell].apply(target.field, m.value));
        }
        for (expected, actual) in frame.cells.iter().zip(&rebuilt.cells) {
            assert!((expected.frequency - actual.frequency).abs() < 1e-12);
            assert_eq!(expected.digitals, actual.digitals);
            for (a, b) in expected.phasors.iter().zip(&actual.phasors) {
                assert!((a.magnitude() - b.magnitude()).abs() < 1e-6);
            }
        }
    }
}
