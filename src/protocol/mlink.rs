//! MLink transport framing.

use byteorder::{ByteOrder, LittleEndian};

use super::{
    MLINK_HEADER_SIZE, MLINK_MAX_FRAME_SIZE, MLINK_MSTREAM_TRAILER, MLINK_SYNC,
    MLINK_TRAILER_SIZE,
};
use crate::error::CodecError;

/// MLink frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MLinkType {
    /// Acquisition data (fragmented MStream payload) and ACKs.
    MStream = 0x5354,
    /// Register read/write request (host → device).
    RegRequest = 0x0101,
    /// Register read/write response (device → host).
    RegResponse = 0x0102,
    /// Memory read/write request (host → device).
    MemRequest = 0x0105,
    /// Memory read/write response (device → host).
    MemResponse = 0x0106,
}

impl MLinkType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x5354 => Some(Self::MStream),
            0x0101 => Some(Self::RegRequest),
            0x0102 => Some(Self::RegResponse),
            0x0105 => Some(Self::MemRequest),
            0x0106 => Some(Self::MemResponse),
            _ => None,
        }
    }

    /// Whether the trailer of this frame carries a crc32 the sender must
    /// compute. Responses are filled with zero by the device firmware and
    /// MStream frames carry the fixed sentinel instead.
    pub fn is_request(self) -> bool {
        matches!(self, Self::RegRequest | Self::MemRequest)
    }
}

/// MLink frame header. The sync word is implied and not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MLinkHeader {
    pub frame_type: MLinkType,
    pub seq: u16,
    /// Length of the whole frame in 32-bit words, header and trailer
    /// included.
    pub len: u16,
    pub src: u16,
    pub dst: u16,
}

impl MLinkHeader {
    /// Serialize the 12-byte header.
    ///
    /// Kept separate from full-frame encoding because the request trailer
    /// is a crc32 over these exact bytes plus the payload: the caller has
    /// to serialize the header first, checksum, then append the trailer.
    pub fn serialize(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.frame_type as u16);
        LittleEndian::write_u16(&mut buf[2..4], MLINK_SYNC);
        LittleEndian::write_u16(&mut buf[4..6], self.seq);
        LittleEndian::write_u16(&mut buf[6..8], self.len);
        LittleEndian::write_u16(&mut buf[8..10], self.src);
        LittleEndian::write_u16(&mut buf[10..12], self.dst);
    }

    /// Frame length in bytes as claimed by the `len` field.
    pub fn frame_bytes(&self) -> usize {
        self.len as usize * 4
    }
}

/// A decoded MLink frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MLinkFrame {
    pub header: MLinkHeader,
    pub payload: Vec<u8>,
    pub trailer: u32,
}

impl MLinkFrame {
    /// Decode one MLink frame from a datagram.
    ///
    /// The payload is `data[12 .. len_bytes - 4]` where `len_bytes` comes
    /// from the header's word count. MStream frames whose trailer is not
    /// the `0x12206249` sentinel are rejected; request/response trailers
    /// are not verified here (the request crc binds serialized bytes and
    /// is only meaningful to the receiving device).
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < MLINK_HEADER_SIZE + MLINK_TRAILER_SIZE {
            return Err(CodecError::Truncated {
                got: data.len(),
                need: MLINK_HEADER_SIZE + MLINK_TRAILER_SIZE,
            });
        }

        let sync = LittleEndian::read_u16(&data[2..4]);
        if sync != MLINK_SYNC {
            return Err(CodecError::SyncMismatch(sync));
        }

        let raw_type = LittleEndian::read_u16(&data[0..2]);
        let frame_type =
            MLinkType::from_u16(raw_type).ok_or(CodecError::UnknownType(raw_type))?;

        let header = MLinkHeader {
            frame_type,
            seq: LittleEndian::read_u16(&data[4..6]),
            len: LittleEndian::read_u16(&data[6..8]),
            src: LittleEndian::read_u16(&data[8..10]),
            dst: LittleEndian::read_u16(&data[10..12]),
        };

        let frame_bytes = header.frame_bytes();
        if frame_bytes < MLINK_HEADER_SIZE + MLINK_TRAILER_SIZE || data.len() < frame_bytes {
            return Err(CodecError::Truncated {
                got: data.len(),
                need: frame_bytes,
            });
        }

        let payload = data[MLINK_HEADER_SIZE..frame_bytes - MLINK_TRAILER_SIZE].to_vec();
        let trailer = LittleEndian::read_u32(&data[frame_bytes - MLINK_TRAILER_SIZE..frame_bytes]);

        if frame_type == MLinkType::MStream && trailer != MLINK_MSTREAM_TRAILER {
            return Err(CodecError::TrailerMismatch(trailer));
        }

        Ok(Self {
            header,
            payload,
            trailer,
        })
    }

    /// Serialize the frame: header, payload, trailer.
    ///
    /// The caller is responsible for a correct `header.len` and trailer;
    /// for requests that means crc32 over the serialized header ‖ payload
    /// (see [`encode_request`]).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; MLINK_HEADER_SIZE + self.payload.len() + MLINK_TRAILER_SIZE];
        self.header.serialize(&mut buf[..MLINK_HEADER_SIZE]);
        buf[MLINK_HEADER_SIZE..MLINK_HEADER_SIZE + self.payload.len()]
            .copy_from_slice(&self.payload);
        let at = MLINK_HEADER_SIZE + self.payload.len();
        LittleEndian::write_u32(&mut buf[at..at + 4], self.trailer);
        buf
    }
}

/// Encode a request frame around an already-serialized payload: stamps the
/// word count, computes `crc32(header ‖ payload)` and appends it as the
/// trailer.
pub fn encode_request(
    frame_type: MLinkType,
    seq: u16,
    src: u16,
    dst: u16,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    debug_assert!(frame_type.is_request());
    debug_assert_eq!(payload.len() % 4, 0);

    let frame_len = MLINK_HEADER_SIZE + payload.len() + MLINK_TRAILER_SIZE;
    if frame_len > MLINK_MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: frame_len,
            max: MLINK_MAX_FRAME_SIZE,
        });
    }

    let header = MLinkHeader {
        frame_type,
        seq,
        len: (frame_len / 4) as u16,
        src,
        dst,
    };

    let mut buf = vec![0u8; frame_len];
    header.serialize(&mut buf[..MLINK_HEADER_SIZE]);
    buf[MLINK_HEADER_SIZE..MLINK_HEADER_SIZE + payload.len()].copy_from_slice(payload);
    let crc = super::checksum(&buf[..MLINK_HEADER_SIZE + payload.len()]);
    LittleEndian::write_u32(&mut buf[frame_len - MLINK_TRAILER_SIZE..], crc);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{checksum, MLINK_DEVICE_ADDR, MLINK_HOST_ADDR};

    fn mstream_frame(payload: &[u8]) -> Vec<u8> {
        let header = MLinkHeader {
            frame_type: MLinkType::MStream,
            seq: 0x1d,
            len: ((MLINK_HEADER_SIZE + payload.len() + MLINK_TRAILER_SIZE) / 4) as u16,
            src: 1,
            dst: 0,
        };
        MLinkFrame {
            header,
            payload: payload.to_vec(),
            trailer: MLINK_MSTREAM_TRAILER,
        }
        .encode()
    }

    #[test]
    fn roundtrip_mstream_frame() {
        let bytes = mstream_frame(&[0u8; 16]);
        let frame = MLinkFrame::decode(&bytes).unwrap();
        assert_eq!(frame.header.frame_type, MLinkType::MStream);
        assert_eq!(frame.header.seq, 0x1d);
        assert_eq!(frame.payload.len(), 16);
        assert_eq!(frame.trailer, MLINK_MSTREAM_TRAILER);
        assert_eq!(frame.encode(), bytes);
    }

    #[test]
    fn rejects_short_input() {
        let err = MLinkFrame::decode(&[0u8; 15]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { got: 15, .. }));
    }

    #[test]
    fn rejects_bad_sync() {
        let mut bytes = mstream_frame(&[0u8; 16]);
        bytes[2] = 0x00;
        assert!(matches!(
            MLinkFrame::decode(&bytes).unwrap_err(),
            CodecError::SyncMismatch(_)
        ));
    }

    #[test]
    fn rejects_bad_mstream_trailer() {
        let mut bytes = mstream_frame(&[0u8; 16]);
        let at = bytes.len() - 4;
        bytes[at..].copy_from_slice(&0xdeadbeefu32.to_le_bytes());
        assert!(matches!(
            MLinkFrame::decode(&bytes).unwrap_err(),
            CodecError::TrailerMismatch(0xdeadbeef)
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut bytes = mstream_frame(&[0u8; 16]);
        bytes[0] = 0x99;
        bytes[1] = 0x99;
        assert!(matches!(
            MLinkFrame::decode(&bytes).unwrap_err(),
            CodecError::UnknownType(0x9999)
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let mut bytes = mstream_frame(&[0u8; 16]);
        bytes.truncate(bytes.len() - 8);
        assert!(matches!(
            MLinkFrame::decode(&bytes).unwrap_err(),
            CodecError::Truncated { .. }
        ));
    }

    #[test]
    fn request_crc_binds_header_and_payload() {
        let payload = [0x11u8, 0x22, 0x33, 0x44];
        let bytes = encode_request(
            MLinkType::RegRequest,
            7,
            MLINK_HOST_ADDR,
            MLINK_DEVICE_ADDR,
            &payload,
        )
        .unwrap();

        let frame = MLinkFrame::decode(&bytes).unwrap();
        assert_eq!(frame.header.len as usize * 4, bytes.len());
        assert_eq!(frame.trailer, checksum(&bytes[..bytes.len() - 4]));
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn response_trailer_is_not_verified() {
        // Devices fill response trailers with zero; any value must decode.
        let header = MLinkHeader {
            frame_type: MLinkType::RegResponse,
            seq: 3,
            len: 5,
            src: MLINK_DEVICE_ADDR,
            dst: MLINK_HOST_ADDR,
        };
        let frame = MLinkFrame {
            header,
            payload: vec![0u8; 4],
            trailer: 0xabad1dea,
        };
        let decoded = MLinkFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }
}
