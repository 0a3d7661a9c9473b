//! MPD output record format.
//!
//! Acquisition files are run-framed: a 28-byte start-run header, a
//! sequence of event records, and a 28-byte stop-run header written on
//! flush. Each event record is
//!
//! ```text
//! MpdTimestampHeader (16) · MpdEventHeader (12) · MpdDeviceHeader (8)
//!   trigger subblock:   MpdMStreamHeader (4) + 16-byte trigger body
//!   per-channel blocks: MpdMStreamHeader (4) + raw sample bytes
//! ```
//!
//! with channel blocks in ascending channel order.

use byteorder::{ByteOrder, LittleEndian};

/// Event header sync word.
pub const MPD_SYNC: u32 = 0x2A502A50;

/// Timestamp header sync word.
pub const MPD_TIMESTAMP_SYNC: u32 = 0x3F60B8A8;

const MPD_START_RUN: u32 = 0x72617453; // "Star"
const MPD_STOP_RUN: u32 = 0x706F7453; // "Stop"
const MPD_RUN_NUMBER: u32 = 0x236E7552; // "Run#"
const MPD_RUN_INDEX: u32 = 0x78646E49; // "Indx"

/// Size of one run-framing header.
pub const RUN_HEADER_SIZE: usize = 28;

fn run_header(sync: u32) -> [u8; RUN_HEADER_SIZE] {
    let mut buf = [0u8; RUN_HEADER_SIZE];
    LittleEndian::write_u32(&mut buf[0..4], sync);
    LittleEndian::write_u32(&mut buf[4..8], 0x14);
    LittleEndian::write_u32(&mut buf[8..12], MPD_RUN_NUMBER);
    LittleEndian::write_u32(&mut buf[12..16], 0x04);
    LittleEndian::write_u32(&mut buf[16..20], 0); // run number
    LittleEndian::write_u32(&mut buf[20..24], MPD_RUN_INDEX);
    LittleEndian::write_u32(&mut buf[24..28], 0); // run index
    buf
}

/// The header opening every acquisition file.
pub fn start_run_header() -> [u8; RUN_HEADER_SIZE] {
    run_header(MPD_START_RUN)
}

/// The header closing every acquisition file on flush.
pub fn stop_run_header() -> [u8; RUN_HEADER_SIZE] {
    run_header(MPD_STOP_RUN)
}

/// Wall-clock stamp preceding each event record, 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpdTimestampHeader {
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl MpdTimestampHeader {
    pub const SIZE: usize = 16;

    pub fn serialize(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], MPD_TIMESTAMP_SYNC);
        LittleEndian::write_u32(&mut buf[4..8], 8);
        LittleEndian::write_u64(&mut buf[8..16], self.timestamp_ms);
    }
}

/// Event record header, 12 bytes: sync, total length of the device block,
/// event number, in that field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpdEventHeader {
    pub event_num: u32,
    pub length: u32,
}

impl MpdEventHeader {
    pub const SIZE: usize = 12;

    pub fn serialize(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], MPD_SYNC);
        LittleEndian::write_u32(&mut buf[4..8], self.length);
        LittleEndian::write_u32(&mut buf[8..12], self.event_num);
    }
}

/// Device block header, 8 bytes: serial, then the 24-bit block length in
/// bytes 4..6 (low 16) and byte 6 (bits 16..23), device model id in
/// byte 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpdDeviceHeader {
    pub device_serial: u32,
    pub device_id: u8,
    /// Total length in bytes of all MStream subblocks, 24 bits.
    pub length: u32,
}

impl MpdDeviceHeader {
    pub const SIZE: usize = 8;

    pub fn serialize(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.device_serial);
        LittleEndian::write_u16(&mut buf[4..6], (self.length & 0xffff) as u16);
        buf[6] = ((self.length >> 16) & 0xff) as u8;
        buf[7] = self.device_id;
    }
}

/// Inner MStream subblock header, 4 bytes: a 24-bit little-endian word
/// packing `(length_words << 2) | subtype`, then the channel number in
/// byte 3 (zero for the trigger block and for TQDC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpdMStreamHeader {
    pub subtype: u8,
    /// Subblock payload length in 32-bit words, 22 bits.
    pub length_words: u32,
    pub channel: u8,
}

impl MpdMStreamHeader {
    pub const SIZE: usize = 4;

    pub fn serialize(&self, buf: &mut [u8]) {
        let packed = (self.length_words << 2) | u32::from(self.subtype & 0x3);
        buf[0] = (packed & 0xff) as u8;
        LittleEndian::write_u16(&mut buf[1..3], ((packed >> 8) & 0xffff) as u16);
        buf[3] = self.channel;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_headers_are_byte_exact() {
        let start = start_run_header();
        let expected: Vec<u8> = [
            0x72617453u32,
            0x00000014,
            0x236E7552,
            0x00000004,
            0x00000000,
            0x78646E49,
            0x00000000,
        ]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
        assert_eq!(start.as_slice(), expected.as_slice());

        let stop = stop_run_header();
        assert_eq!(&stop[0..4], &0x706F7453u32.to_le_bytes());
        assert_eq!(&stop[4..], &start[4..]);
    }

    #[test]
    fn timestamp_header_layout() {
        let mut buf = [0u8; MpdTimestampHeader::SIZE];
        MpdTimestampHeader {
            timestamp_ms: 0x0102030405060708,
        }
        .serialize(&mut buf);
        assert_eq!(&buf[0..4], &MPD_TIMESTAMP_SYNC.to_le_bytes());
        assert_eq!(&buf[4..8], &8u32.to_le_bytes());
        assert_eq!(&buf[8..16], &0x0102030405060708u64.to_le_bytes());
    }

    #[test]
    fn event_header_field_order() {
        let mut buf = [0u8; MpdEventHeader::SIZE];
        MpdEventHeader {
            event_num: 0x1d,
            length: 0x240,
        }
        .serialize(&mut buf);
        assert_eq!(&buf[0..4], &MPD_SYNC.to_le_bytes());
        assert_eq!(&buf[4..8], &0x240u32.to_le_bytes());
        assert_eq!(&buf[8..12], &0x1du32.to_le_bytes());
    }

    #[test]
    fn device_header_packs_length_and_id() {
        let mut buf = [0u8; MpdDeviceHeader::SIZE];
        MpdDeviceHeader {
            device_serial: 0x0CD93DB0,
            device_id: 0xdf,
            length: 0x0123_45,
        }
        .serialize(&mut buf);
        assert_eq!(&buf[0..4], &0x0CD93DB0u32.to_le_bytes());
        assert_eq!(&buf[4..6], &0x2345u16.to_le_bytes());
        assert_eq!(buf[6], 0x01);
        assert_eq!(buf[7], 0xdf);
    }

    #[test]
    fn mstream_subheader_packs_words_and_channel() {
        let mut buf = [0u8; MpdMStreamHeader::SIZE];
        MpdMStreamHeader {
            subtype: 1,
            length_words: 130, // 520 bytes
            channel: 5,
        }
        .serialize(&mut buf);
        let packed = u32::from(buf[0]) | u32::from(buf[1]) << 8 | u32::from(buf[2]) << 16;
        assert_eq!(packed & 0x3, 1);
        assert_eq!(packed >> 2, 130);
        assert_eq!(buf[3], 5);
    }
}
