//! # IEC 61850-90-5 Synchrophasor Transport
//!
//! Routable sampled value sessions carrying synchrophasor data, as described by
//! IEC TR 61850-90-5. Data frames are CLTP sessions holding one or more ASDUs whose
//! sample blocks are C37.118 data cell images; configuration, header and command
//! frames are C37.118.2-2011 frames.
//!
//! ## Submodules
//!
//! - `common`: Session constants, signature/security algorithms and tag helpers.
//! - `data_frame`: Session header, ASDU and data frame encode/decode.
//! - `codec`: The stream codec with sample counter, packet number and ASDU cascade.

pub mod codec;
pub mod common;
pub mod data_frame;

pub use codec::{Iec61850Codec, Iec61850Options};
