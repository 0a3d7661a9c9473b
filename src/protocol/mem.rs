//! Memory operation layer.
//!
//! A Mem payload is one 4-byte little-endian header (read flag in bit
//! 31, a 9-bit size in 32-bit words in bits 30..22, a 22-bit address in
//! bits 21..0) followed by `size` data words on writes and nothing on
//! reads.

use byteorder::{ByteOrder, LittleEndian};

use super::mlink::{self, MLinkType};
use super::{MLINK_DEVICE_ADDR, MLINK_HOST_ADDR};
use crate::error::CodecError;

/// Maximum block size expressible in the 9-bit size field.
pub const MEM_MAX_WORDS: usize = 0x1ff;

/// One memory block read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemOp {
    pub read: bool,
    /// 22-bit memory address.
    pub addr: u32,
    /// Block size in 32-bit words. Equals `data.len()` for writes; for
    /// reads it is the requested word count.
    pub size: u32,
    pub data: Vec<u32>,
}

impl MemOp {
    pub fn read(addr: u32, size: u32) -> Self {
        Self {
            read: true,
            addr: addr & 0x3f_ffff,
            size: size & 0x1ff,
            data: Vec::new(),
        }
    }

    /// A write of `data.len()` words. A zero-word write is a legal no-op.
    pub fn write(addr: u32, data: Vec<u32>) -> Self {
        debug_assert!(data.len() <= MEM_MAX_WORDS);
        Self {
            read: false,
            addr: addr & 0x3f_ffff,
            size: data.len() as u32,
            data,
        }
    }

    /// Payload size in bytes: header word plus data words.
    pub fn encoded_len(&self) -> usize {
        4 + self.data.len() * 4
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut header = (self.size & 0x1ff) << 22 | (self.addr & 0x3f_ffff);
        if self.read {
            header |= 0x8000_0000;
        }

        let mut buf = vec![0u8; self.encoded_len()];
        LittleEndian::write_u32(&mut buf[0..4], header);
        for (i, word) in self.data.iter().enumerate() {
            LittleEndian::write_u32(&mut buf[(i + 1) * 4..(i + 2) * 4], *word);
        }
        buf
    }
}

/// Decode a Mem payload. Writes carry `size` data words after the header;
/// reads carry none.
pub fn decode_mem_op(data: &[u8]) -> Result<MemOp, CodecError> {
    if data.len() < 4 {
        return Err(CodecError::Truncated {
            got: data.len(),
            need: 4,
        });
    }

    let header = LittleEndian::read_u32(&data[0..4]);
    let read = header & 0x8000_0000 != 0;
    let size = (header >> 22) & 0x1ff;
    let addr = header & 0x3f_ffff;

    let mut words = Vec::new();
    if !read {
        let need = 4 + size as usize * 4;
        if data.len() < need {
            return Err(CodecError::Truncated {
                got: data.len(),
                need,
            });
        }
        for i in 0..size as usize {
            words.push(LittleEndian::read_u32(&data[(i + 1) * 4..(i + 2) * 4]));
        }
    }

    Ok(MemOp {
        read,
        addr,
        size,
        data: words,
    })
}

/// Build a complete MemRequest frame: header word plus data, stamped
/// length (`4 + size + 1` words) and the crc32 trailer over
/// header ‖ payload.
pub fn encode_mem_request(op: &MemOp, seq: u16) -> Result<Vec<u8>, CodecError> {
    mlink::encode_request(
        MLinkType::MemRequest,
        seq,
        MLINK_HOST_ADDR,
        MLINK_DEVICE_ADDR,
        &op.encode(),
    )
}
