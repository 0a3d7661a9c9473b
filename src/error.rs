//! Error types for adcd.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for adcd operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for adcd.
#[derive(Error, Debug)]
pub enum Error {
    // Wire-level errors
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("defragmentation error: {0}")]
    Defrag(#[from] DefragError),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    // Transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    // Register store errors
    #[error("register store error: {0}")]
    Store(#[from] StoreError),

    // Device errors
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("operation {op} is not supported by the {family} family")]
    NotSupported { op: &'static str, family: &'static str },

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // General errors
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Wire codec errors. Any of these drops the offending datagram; the
/// receive loops keep running.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated frame: got {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },

    #[error("MLink sync mismatch: got 0x{0:04x}")]
    SyncMismatch(u16),

    #[error("MLink trailer mismatch on MStream frame: got 0x{0:08x}")]
    TrailerMismatch(u32),

    #[error("MStream fragment with zero length")]
    EmptyFragment,

    #[error("unknown MLink frame type 0x{0:04x}")]
    UnknownType(u16),

    #[error("unknown MStream subtype {subtype} for the {family} family")]
    UnknownSubtype { subtype: u8, family: &'static str },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Fragment assembly errors. Both variants drop the whole fragment list
/// for the offending fragment id.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DefragError {
    #[error("gap or overlap at offset {offset} while assembling fragment 0x{fragment_id:04x}")]
    AssemblyHole { fragment_id: u16, offset: u16 },

    #[error("fragment 0x{fragment_id:04x} exceeded {max} pieces before assembly")]
    TooManyFragments { fragment_id: u16, max: usize },
}

/// Event builder errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventError {
    #[error("event {event_num} has no trigger")]
    MissingTrigger { event_num: u32 },

    #[error("fragment for serial 0x{got:08x}, builder expects 0x{expected:08x}")]
    SerialMismatch { expected: u32, got: u32 },

    #[error("channel {0} outside the 64-bit trigger bitmap")]
    ChannelOutOfRange(u8),
}

/// Register store errors. A missing namespace is a programming error and
/// fatal; a missing key is reported as an absent value, not an error.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("namespace missing for device {0}")]
    NamespaceMissing(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("pipeline channel closed")]
    ChannelClosed,
}

impl Error {
    /// Check whether the error is a transient wire-level fault that the
    /// receive loops absorb locally (drop the datagram, keep running).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Codec(_) | Error::Defrag(_) | Error::Event(_))
    }

    /// Check whether the error must terminate the affected device
    /// pipeline: I/O termination and store corruption, nothing else.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Transport(_) | Error::Store(_)
        )
    }
}
