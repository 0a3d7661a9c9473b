//! # adcd
//!
//! Acquisition gateway for ADC64/TQDC digitizer modules.
//!
//! The gateway speaks the proprietary MLink transport over UDP: devices
//! stream triggered waveform data as fragmented MStream payloads and accept
//! register/memory read-write requests on a separate control port. adcd
//! reassembles the fragmented streams, groups trigger and channel-data
//! fragments into events, and writes them out as run-framed MPD records,
//! while a durable register cache tracks every device's state.
//!
//! ## Architecture
//!
//! ```text
//! acquisition (per device)
//!   UDP :33301 ─▶ receiver ─▶ defragmenter ─▶ event builder ─▶ MPD writer
//!                    │ ACK per fragment piece
//!                    ▼
//!                 device
//!
//! control (all devices, one socket)
//!   device model ─▶ control link ─▶ UDP :33300 ─▶ device
//!   register cache ◀─ response dispatch ◀──────── device
//! ```
//!
//! Each per-device pipeline stage runs as its own tokio task joined by
//! bounded channels; the register cache is the only state shared across
//! devices.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)] // wire fields are explicitly sized
#![allow(clippy::unreadable_literal)] // wire magic numbers

pub mod cli;
pub mod config;
pub mod control;
pub mod defrag;
pub mod device;
pub mod error;
pub mod protocol;
pub mod store;
pub mod stream;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
