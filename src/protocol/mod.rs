//! Wire protocol for the ADC64/TQDC device family.
//!
//! Two layers ride on UDP. The outer MLink frame is a 12-byte header, a
//! payload and a 4-byte trailer:
//!
//! ```text
//! ┌──────────┬──────────┬─────────┬─────────┬─────────┬─────────┐
//! │ Type (2) │ Sync (2) │ Seq (2) │ Len (2) │ Src (2) │ Dst (2) │
//! ├──────────┴──────────┴─────────┴─────────┴─────────┴─────────┤
//! │ Payload ...                                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Trailer (4)                                                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All fields are little-endian. `Len` counts 32-bit words for the whole
//! frame. The payload is one of: an MStream fragment train (acquisition
//! data), register operations, or a memory operation.
//!
//! The trailer is three different things depending on the frame type:
//! MStream frames from a device carry the fixed sentinel `0x12206249`,
//! requests carry `crc32(header ‖ payload)` computed over the serialized
//! bytes, and response trailers are filled with zero by the device and
//! never checked.

mod mem;
mod mlink;
mod mpd;
mod mstream;
mod reg;
pub mod tqdc;

pub use mem::{encode_mem_request, MemOp, MEM_MAX_WORDS};
pub use mlink::{MLinkFrame, MLinkHeader, MLinkType};
pub use mpd::{
    start_run_header, stop_run_header, MpdDeviceHeader, MpdEventHeader, MpdMStreamHeader,
    MpdTimestampHeader, MPD_SYNC, MPD_TIMESTAMP_SYNC, RUN_HEADER_SIZE,
};
pub use mstream::{
    decode_fragments, encode_ack, encode_handshake, EventFragment, EventPayload, FragmentFlags,
    MStreamFragment, MStreamTrigger, PayloadHeader, FRAGMENT_HEADER_SIZE, HANDSHAKE_SENTINEL,
    PAYLOAD_HEADER_SIZE, TRIGGER_BODY_SIZE,
};
pub use reg::{encode_reg_request, Reg, RegOp};

use crate::error::CodecError;

/// MLink sync magic, bytes 2..4 of every frame.
pub const MLINK_SYNC: u16 = 0x2A50;

/// Trailer sentinel carried by MStream frames sent from a device.
pub const MLINK_MSTREAM_TRAILER: u32 = 0x12206249;

/// Host-side MLink address.
pub const MLINK_HOST_ADDR: u16 = 0x0001;

/// Device-side MLink address.
pub const MLINK_DEVICE_ADDR: u16 = 0xFEFE;

/// MLink header size in bytes.
pub const MLINK_HEADER_SIZE: usize = 12;

/// MLink trailer size in bytes.
pub const MLINK_TRAILER_SIZE: usize = 4;

/// Maximum MLink frame size including header and trailer.
pub const MLINK_MAX_FRAME_SIZE: usize = 1400;

/// Maximum MLink payload size.
pub const MLINK_MAX_PAYLOAD_SIZE: usize =
    MLINK_MAX_FRAME_SIZE - MLINK_HEADER_SIZE - MLINK_TRAILER_SIZE;

/// Calculate the crc32/IEEE checksum used in request trailers.
pub fn checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Decoded MLink payload, dispatched on the frame type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MLinkPayload {
    /// One or more MStream fragments.
    MStream(Vec<MStreamFragment>),
    /// Register operations (requests and responses share the encoding).
    Reg(Vec<RegOp>),
    /// A memory operation.
    Mem(MemOp),
}

/// Decode the payload of an MLink frame according to its type.
///
/// This is the single dispatch point over the closed set of known frame
/// types; anything else was already rejected as `UnknownType` by the
/// MLink header decoder.
pub fn decode_mlink_payload(
    frame_type: MLinkType,
    payload: &[u8],
) -> Result<MLinkPayload, CodecError> {
    match frame_type {
        MLinkType::MStream => Ok(MLinkPayload::MStream(decode_fragments(payload)?)),
        MLinkType::RegRequest | MLinkType::RegResponse => {
            Ok(MLinkPayload::Reg(reg::decode_reg_ops(payload)))
        }
        MLinkType::MemRequest | MLinkType::MemResponse => {
            Ok(MLinkPayload::Mem(mem::decode_mem_op(payload)?))
        }
    }
}
