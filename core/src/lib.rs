//! # Synchrophasor Concentrator, Parser and Publisher
//!
//! This crate time-aligns phasor measurements from many devices into whole frames, reads
//! IEEE C37.118 and IEC 61850-90-5 streams from TCP, UDP, serial and file sources, and
//! republishes concentrated frames in either protocol.
//!
//! ## Submodules
//!
//! - `measurement`: Ticks, clocks and the keyed measurement type fed to the concentrator.
//! - `model`: Protocol-neutral configuration and data frames, plus the signal map that
//!   routes measurements into cells.
//! - `concentrator`: Sorts measurements into time-aligned frames and publishes them once
//!   they are complete or overdue.
//! - `codec`: The `ProtocolCodec` trait shared by the parser and the publisher.
//! - `ieee_c37_118`: Frame layouts of IEEE C37.118-2005, C37.118.2-2011 and C37.118.2-2024.
//!   - `commands`: Command frames for controlling a data stream.
//!   - `config` / `config3`: CFG-1, CFG-2 and CFG-3 frames.
//!   - `data_frame`: Data frames with synchrophasor measurements.
//!   - `header`: Free-text header frames.
//! - `iec61850_90_5`: Session and SV PDU framing of IEC 61850-90-5.
//! - `ber`: ASN.1 BER tag, length and OID primitives.
//! - `parser`: Connection strings, transports and the multi-protocol frame parser.
//! - `publisher`: Configuration projection, data frame encoding and command handling.
//! - `random`: Random configurations and frames for tests, benches and the mock device.
//!
//! ## Usage
//!
//! A typical concentrator feeds parser output into a `Concentrator`, and hands the
//! frames it publishes to a `Publisher` bound to a UDP or TCP channel.

pub mod ber;
pub mod codec;
pub mod concentrator;
pub mod iec61850_90_5;
pub mod ieee_c37_118;
pub mod measurement;
pub mod model;
pub mod parser;
pub mod publisher;
pub mod random;
