//! # IEEE C37.118 Frame Grammar
//!
//! Wire structures for IEEE C37.118-2005, IEEE C37.118.2-2011 and IEEE C37.118.2-2024
//! streams, plus the projections between them and the canonical model.
//!
//! ## Submodules
//!
//! - `codec`: `IeeeC37118Codec`, the `ProtocolCodec` implementation.
//! - `commands`: Command frames (turn data on/off, request header or configuration).
//! - `common`: Shared types (`ParseError`, `PrefixFrame`, `Version`, `StatField`) and the
//!   byte cursor used by every parser.
//! - `config`: CFG-1 and CFG-2 configuration frames.
//! - `config3`: CFG-3 extended configuration frames (2011 and later).
//! - `data_frame`: Data frames and per-cell measurement blocks.
//! - `header`: Header frames carrying free-form text.
//! - `phasors`: Phasor encodings in polar or rectangular, integer or float form.
//! - `units`: Conversion factor words (`PhasorUnits`, `AnalogUnits`, `NominalFrequency`).
//! - `utils`: CRC-CCITT and SOC/FRACSEC time conversions.

pub mod codec;
pub mod commands;
pub mod common;
pub mod config;
pub mod config3;
pub mod data_frame;
pub mod header;
pub mod phasors;
pub mod units;
pub mod utils;
