//! Register operation layer.
//!
//! A Reg payload is a train of 4-byte little-endian words, one per
//! operation: read flag in bit 31, a 15-bit register address in bits
//! 30..16 and the 16-bit value in the low half (ignored on reads).

use byteorder::{ByteOrder, LittleEndian};

use super::mlink::{self, MLinkType};
use super::{MLINK_DEVICE_ADDR, MLINK_HOST_ADDR};
use crate::error::CodecError;
use crate::types::{parse_reg_hex, reg_hex};

/// A register address/value pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg {
    pub addr: u16,
    pub value: u16,
}

impl Reg {
    pub fn new(addr: u16, value: u16) -> Self {
        Self { addr, value }
    }

    /// Hex text forms used by external interfaces.
    pub fn hex(&self) -> (String, String) {
        (reg_hex(self.addr), reg_hex(self.value))
    }

    pub fn from_hex(addr: &str, value: &str) -> crate::Result<Self> {
        Ok(Self {
            addr: parse_reg_hex(addr)?,
            value: parse_reg_hex(value)?,
        })
    }
}

/// One register read or write. The value is ignored on reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegOp {
    pub read: bool,
    pub reg: Reg,
}

impl RegOp {
    pub fn read(addr: u16) -> Self {
        Self {
            read: true,
            reg: Reg::new(addr, 0),
        }
    }

    pub fn write(addr: u16, value: u16) -> Self {
        Self {
            read: false,
            reg: Reg::new(addr, value),
        }
    }

    fn to_word(self) -> u32 {
        let mut word = (u32::from(self.reg.addr) & 0x7fff) << 16;
        if self.read {
            word |= 0x8000_0000;
        } else {
            word |= u32::from(self.reg.value);
        }
        word
    }

    fn from_word(word: u32) -> Self {
        Self {
            read: word & 0x8000_0000 != 0,
            reg: Reg {
                addr: ((word >> 16) & 0x7fff) as u16,
                value: (word & 0xffff) as u16,
            },
        }
    }
}

/// Serialize register operations into their word train.
pub fn encode_reg_ops(ops: &[RegOp]) -> Vec<u8> {
    let mut buf = vec![0u8; ops.len() * 4];
    for (i, op) in ops.iter().enumerate() {
        LittleEndian::write_u32(&mut buf[i * 4..i * 4 + 4], op.to_word());
    }
    buf
}

/// Decode a Reg payload, iterating words until it is exhausted. A
/// trailing partial word is ignored the way the device firmware ignores
/// it.
pub fn decode_reg_ops(data: &[u8]) -> Vec<RegOp> {
    data.chunks_exact(4)
        .map(|w| RegOp::from_word(LittleEndian::read_u32(w)))
        .collect()
}

/// Build a complete RegRequest frame: word train, stamped length
/// (`4 + ops.len()` words) and the crc32 trailer over header ‖ payload.
pub fn encode_reg_request(ops: &[RegOp], seq: u16) -> Result<Vec<u8>, CodecError> {
    mlink::encode_request(
        MLinkType::RegRequest,
        seq,
        MLINK_HOST_ADDR,
        MLINK_DEVICE_ADDR,
        &encode_reg_ops(ops),
    )
}
