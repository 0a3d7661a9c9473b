//! MStream payload protocol.
//!
//! An MLink frame of type MStream carries one or more fragments back to
//! back with no outer header. Each fragment is an 8-byte header followed
//! by `fragment_length` payload bytes:
//!
//! ```text
//! ┌────────────┬───────────────────┬─────────────┬─────────────────────┐
//! │ Length (2) │ Flags·Subtype (1) │ DeviceId(1) │ Id (2) ‖ Offset (2) │
//! └────────────┴───────────────────┴─────────────┴─────────────────────┘
//! ```
//!
//! Byte 2 packs the 2-bit subtype in its low bits and six flag bits above
//! it; bytes 4..8 are one little-endian u32 with the fragment id in the
//! high half and the fragment offset in the low half.

use byteorder::{ByteOrder, LittleEndian};
use bytes::BufMut;

use super::mlink::{MLinkFrame, MLinkHeader, MLinkType};
use super::{MLINK_DEVICE_ADDR, MLINK_HOST_ADDR};
use crate::error::CodecError;
use crate::types::DeviceFamily;

/// Size of the per-fragment header.
pub const FRAGMENT_HEADER_SIZE: usize = 8;

/// Size of the payload header at the start of every fragment payload.
pub const PAYLOAD_HEADER_SIZE: usize = 8;

/// Size of the trigger body following the payload header.
pub const TRIGGER_BODY_SIZE: usize = 16;

/// Sentinel fragment id/offset used by the stream handshake.
pub const HANDSHAKE_SENTINEL: u16 = 0xFFFF;

/// The six MStream flag bits from byte 2 of the fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentFlags(u8);

impl FragmentFlags {
    /// Fragment acknowledges another fragment.
    pub const ACK: u8 = 0b01_0000;
    /// Last fragment piece of an MStream frame.
    pub const LAST: u8 = 0b10_0000;

    pub fn new(bits: u8) -> Self {
        Self(bits & 0x3f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn has(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }
}

/// One MStream fragment piece as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MStreamFragment {
    /// Payload length in bytes, the 8-byte fragment header excluded.
    pub fragment_length: u16,
    /// 2-bit subtype; its meaning depends on the device family.
    pub subtype: u8,
    pub flags: FragmentFlags,
    /// Device model code (0xd9 ADC64VE-XGE, 0xdf ADC64VE-V3-XG, 0xd6 TQDC).
    pub device_id: u8,
    pub fragment_id: u16,
    pub fragment_offset: u16,
    pub data: Vec<u8>,
}

impl MStreamFragment {
    pub fn is_last(&self) -> bool {
        self.flags.has(FragmentFlags::LAST)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.has(FragmentFlags::ACK)
    }

    /// Exclusive end offset of this piece within the assembled payload.
    pub fn end_offset(&self) -> u32 {
        u32::from(self.fragment_offset) + u32::from(self.fragment_length)
    }

    /// Serialize the fragment header and payload into `buf`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.fragment_length);
        buf.put_u8((self.flags.bits() << 2) | (self.subtype & 0x3));
        buf.put_u8(self.device_id);
        buf.put_u32_le((u32::from(self.fragment_id) << 16) | u32::from(self.fragment_offset));
        buf.put_slice(&self.data);
    }
}

/// Decode all fragments of an MStream MLink payload.
///
/// Fragments are concatenated with nothing in between; decoding walks the
/// buffer until it is exhausted. A zero `fragment_length` means a corrupt
/// train (only ACKs we send carry empty fragments) and fails fast.
pub fn decode_fragments(data: &[u8]) -> Result<Vec<MStreamFragment>, CodecError> {
    if data.len() < FRAGMENT_HEADER_SIZE {
        return Err(CodecError::Truncated {
            got: data.len(),
            need: FRAGMENT_HEADER_SIZE,
        });
    }

    let mut fragments = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        if data.len() - offset < FRAGMENT_HEADER_SIZE {
            return Err(CodecError::Truncated {
                got: data.len() - offset,
                need: FRAGMENT_HEADER_SIZE,
            });
        }

        let fragment_length = LittleEndian::read_u16(&data[offset..offset + 2]);
        if fragment_length == 0 {
            return Err(CodecError::EmptyFragment);
        }

        let end = offset + FRAGMENT_HEADER_SIZE + fragment_length as usize;
        if data.len() < end {
            return Err(CodecError::Truncated {
                got: data.len() - offset,
                need: end - offset,
            });
        }

        let packed = LittleEndian::read_u32(&data[offset + 4..offset + 8]);
        fragments.push(MStreamFragment {
            fragment_length,
            subtype: data[offset + 2] & 0x3,
            flags: FragmentFlags::new(data[offset + 2] >> 2),
            device_id: data[offset + 3],
            fragment_id: (packed >> 16) as u16,
            fragment_offset: (packed & 0xffff) as u16,
            data: data[offset + FRAGMENT_HEADER_SIZE..end].to_vec(),
        });
        offset = end;
    }

    Ok(fragments)
}

/// Encode an acknowledgement frame for one received fragment piece.
///
/// The ACK is an MLink MStream frame of exactly six words: header, one
/// zero-length fragment carrying the ACK flag and the echoed fragment
/// id/offset, and a zero trailer. `seq` echoes the acknowledged frame and
/// src/dst mirror the acknowledged frame's dst/src.
pub fn encode_ack(seq: u16, src: u16, dst: u16, fragment_id: u16, fragment_offset: u16) -> Vec<u8> {
    let ack = MStreamFragment {
        fragment_length: 0,
        subtype: 0,
        flags: FragmentFlags::new(FragmentFlags::ACK),
        device_id: 1,
        fragment_id,
        fragment_offset,
        data: Vec::new(),
    };

    let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE);
    ack.encode_into(&mut payload);

    let header = MLinkHeader {
        frame_type: MLinkType::MStream,
        seq,
        len: 6,
        src,
        dst,
    };
    MLinkFrame {
        header,
        payload,
        trailer: 0,
    }
    .encode()
}

/// Encode the stream handshake: an ACK with the `0xFFFF` sentinel id and
/// offset, addressed device→host, which registers this socket as the
/// device's stream peer.
pub fn encode_handshake() -> Vec<u8> {
    encode_ack(
        0,
        MLINK_DEVICE_ADDR,
        MLINK_HOST_ADDR,
        HANDSHAKE_SENTINEL,
        HANDSHAKE_SENTINEL,
    )
}

/// The header at the start of every fragment payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub device_serial: u32,
    /// 24-bit event counter, zero-padded to u32.
    pub event_num: u32,
    /// Channel number for ADC64 data fragments; zero for trigger
    /// fragments and unused by TQDC.
    pub channel_num: u8,
}

impl PayloadHeader {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < PAYLOAD_HEADER_SIZE {
            return Err(CodecError::Truncated {
                got: data.len(),
                need: PAYLOAD_HEADER_SIZE,
            });
        }
        let mut event = [0u8; 4];
        event[..3].copy_from_slice(&data[4..7]);
        Ok(Self {
            device_serial: LittleEndian::read_u32(&data[0..4]),
            event_num: u32::from_le_bytes(event),
            channel_num: data[7],
        })
    }

    #[cfg(test)]
    pub fn encode(&self) -> [u8; PAYLOAD_HEADER_SIZE] {
        let mut buf = [0u8; PAYLOAD_HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.device_serial);
        buf[4..7].copy_from_slice(&self.event_num.to_le_bytes()[..3]);
        buf[7] = self.channel_num;
        buf
    }
}

/// Trigger metadata carried by ADC64 subtype-0 fragments, 16 bytes after
/// the payload header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MStreamTrigger {
    pub tai_sec: u32,
    /// 30-bit nanosecond counter.
    pub tai_nsec: u32,
    /// 2-bit TAI flags.
    pub tai_flags: u8,
    /// Bitmap of channels 0..=31 expected to deliver data.
    pub low_ch: u32,
    /// Bitmap of channels 32..=63.
    pub hi_ch: u32,
}

impl MStreamTrigger {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < TRIGGER_BODY_SIZE {
            return Err(CodecError::Truncated {
                got: data.len(),
                need: TRIGGER_BODY_SIZE,
            });
        }
        let nsec_word = LittleEndian::read_u32(&data[4..8]);
        Ok(Self {
            tai_sec: LittleEndian::read_u32(&data[0..4]),
            tai_nsec: nsec_word >> 2,
            tai_flags: (nsec_word & 0x3) as u8,
            low_ch: LittleEndian::read_u32(&data[8..12]),
            hi_ch: LittleEndian::read_u32(&data[12..16]),
        })
    }

    pub fn encode(&self) -> [u8; TRIGGER_BODY_SIZE] {
        let mut buf = [0u8; TRIGGER_BODY_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.tai_sec);
        LittleEndian::write_u32(
            &mut buf[4..8],
            (self.tai_nsec << 2) | u32::from(self.tai_flags & 0x3),
        );
        LittleEndian::write_u32(&mut buf[8..12], self.low_ch);
        LittleEndian::write_u32(&mut buf[12..16], self.hi_ch);
        buf
    }

    /// The 64-bit channel bitmap `hi_ch << 32 | low_ch`.
    pub fn channels(&self) -> u64 {
        (u64::from(self.hi_ch) << 32) | u64::from(self.low_ch)
    }
}

/// Typed payload of an assembled fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Trigger(MStreamTrigger),
    Data(Vec<u8>),
}

/// A fully assembled MStream fragment with its payload decoded: the unit
/// the defragmenter emits and the event builder consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFragment {
    pub device_id: u8,
    pub subtype: u8,
    pub fragment_id: u16,
    /// Total assembled payload length in bytes, payload header included.
    pub total_length: u16,
    pub header: PayloadHeader,
    pub payload: EventPayload,
}

impl EventFragment {
    /// Decode the payload of an assembled fragment: payload header first,
    /// then a trigger body or raw data bytes depending on the subtype and
    /// the device family.
    pub fn from_assembled(
        family: DeviceFamily,
        device_id: u8,
        subtype: u8,
        fragment_id: u16,
        data: &[u8],
    ) -> Result<Self, CodecError> {
        let header = PayloadHeader::decode(data)?;
        let body = &data[PAYLOAD_HEADER_SIZE..];

        let payload = if family.trigger_subtype() == Some(subtype) {
            EventPayload::Trigger(MStreamTrigger::decode(body)?)
        } else if family.data_subtype() == subtype {
            EventPayload::Data(body.to_vec())
        } else {
            return Err(CodecError::UnknownSubtype {
                subtype,
                family: family.as_str(),
            });
        };

        Ok(Self {
            device_id,
            subtype,
            fragment_id,
            total_length: data.len() as u16,
            header,
            payload,
        })
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self.payload, EventPayload::Trigger(_))
    }
}
