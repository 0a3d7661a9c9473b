//! End-to-end decode of a captured ADC64 datagram.
//!
//! The frame replayed here is the canonical two-fragment capture from an
//! ADC64VE-V3-XG (model 0xdf): a 24-byte trigger fragment (id 0x38)
//! announcing channel 0, followed by a 528-byte data fragment (id 0x39)
//! for event 0x1d of device serial 0x0cd93db0. It walks the whole
//! offline path: MLink decode, fragment split, defragmentation, event
//! assembly, MPD serialization.

use byteorder::{ByteOrder, LittleEndian};

use adcd::defrag::Defragmenter;
use adcd::protocol::{
    decode_mlink_payload, MLinkFrame, MLinkPayload, MLinkType, MPD_SYNC, MPD_TIMESTAMP_SYNC,
};
use adcd::stream::EventBuilder;
use adcd::types::{DeviceFamily, DeviceName};

const SERIAL: u32 = 0x0CD93DB0;
const EVENT: u32 = 0x1d;
const SAMPLE_BYTES: usize = 520;

/// Rebuild the captured datagram byte by byte.
fn sample_datagram() -> Vec<u8> {
    let mut buf = Vec::new();

    // MLink header: type 0x5354, sync 0x2a50, seq 0x1d, len 0x92 words,
    // src 1, dst 0.
    for word in [0x5354u16, 0x2a50, 0x001d, 0x0092, 0x0001, 0x0000] {
        buf.extend_from_slice(&word.to_le_bytes());
    }

    // Trigger fragment: length 24, flags LAST + subtype 0, device 0xdf,
    // offset 0, id 0x38.
    buf.extend_from_slice(&[0x18, 0x00, 0x80, 0xdf, 0x00, 0x00, 0x38, 0x00]);
    //   payload header: serial, event (24-bit), unused channel byte
    buf.extend_from_slice(&SERIAL.to_le_bytes());
    buf.extend_from_slice(&EVENT.to_le_bytes()[..3]);
    buf.push(0x00);
    //   trigger body: tai_sec 0, tai_nsec|flags 0, low_ch 1, hi_ch 0
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());

    // Data fragment: length 0x210, flags LAST + subtype 1, device 0xdf,
    // offset 0, id 0x39.
    buf.extend_from_slice(&[0x10, 0x02, 0x81, 0xdf, 0x00, 0x00, 0x39, 0x00]);
    buf.extend_from_slice(&SERIAL.to_le_bytes());
    buf.extend_from_slice(&EVENT.to_le_bytes()[..3]);
    buf.push(0x00);
    //   520 bytes of samples
    buf.extend((0..SAMPLE_BYTES).map(|i| (i % 251) as u8));

    // MLink trailer: the MStream sentinel.
    buf.extend_from_slice(&0x12206249u32.to_le_bytes());

    assert_eq!(buf.len(), 0x92 * 4);
    buf
}

#[test]
fn sample_decodes_through_the_whole_chain() {
    let datagram = sample_datagram();

    let frame = MLinkFrame::decode(&datagram).expect("mlink decode");
    assert_eq!(frame.header.frame_type, MLinkType::MStream);
    assert_eq!(frame.header.seq, 0x1d);
    assert_eq!(frame.header.src, 1);

    let fragments = match decode_mlink_payload(frame.header.frame_type, &frame.payload).unwrap() {
        MLinkPayload::MStream(fragments) => fragments,
        other => panic!("unexpected payload {other:?}"),
    };
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].fragment_id, 0x38);
    assert_eq!(fragments[0].fragment_length, 24);
    assert_eq!(fragments[0].subtype, 0);
    assert!(fragments[0].is_last());
    assert_eq!(fragments[1].fragment_id, 0x39);
    assert_eq!(fragments[1].fragment_length, 0x210);
    assert_eq!(fragments[1].subtype, 1);

    // Defragment: both fragments are single-piece, so each pops out as
    // soon as it is fed, in id order.
    let mut defrag = Defragmenter::new(DeviceName::from("adc64-0"), DeviceFamily::Adc64);
    let mut assembled = Vec::new();
    for fragment in fragments {
        defrag.insert(fragment).unwrap();
        assembled.extend(defrag.drain());
    }
    assert_eq!(assembled.len(), 2);
    assert!(assembled[0].is_trigger());
    assert_eq!(assembled[0].header.device_serial, SERIAL);
    assert_eq!(assembled[0].header.event_num, EVENT);
    assert_eq!(assembled[1].header.channel_num, 0);

    // Build the event: trigger announces channel 0 only, so the data
    // fragment completes it.
    let mut builder = EventBuilder::new(DeviceName::from("adc64-0"), DeviceFamily::Adc64);
    let mut records = builder.handle(&assembled[0]).unwrap();
    assert!(records.is_empty());
    records = builder.handle(&assembled[1]).unwrap();
    assert_eq!(records.len(), 1);

    let record = &records[0];

    // device block = trigger body + samples + 2 subheaders
    let device_len = (16 + SAMPLE_BYTES as u32) + 2 * 4;
    assert_eq!(record.len(), 16 + 12 + 8 + device_len as usize);

    assert_eq!(LittleEndian::read_u32(&record[0..4]), MPD_TIMESTAMP_SYNC);
    assert_eq!(LittleEndian::read_u32(&record[4..8]), 8);

    assert_eq!(LittleEndian::read_u32(&record[16..20]), MPD_SYNC);
    assert_eq!(LittleEndian::read_u32(&record[20..24]), device_len + 8);
    assert_eq!(LittleEndian::read_u32(&record[24..28]), EVENT);

    assert_eq!(LittleEndian::read_u32(&record[28..32]), SERIAL);
    assert_eq!(record[35], 0xdf);

    // Trigger subblock announces channel 0 in its body.
    let trigger_body = &record[40..56];
    assert_eq!(LittleEndian::read_u32(&trigger_body[8..12]), 1);

    // Data subblock: subtype 1, 130 words, channel 0, then the samples.
    let sub = &record[56..60];
    let packed = u32::from(sub[0]) | u32::from(sub[1]) << 8 | u32::from(sub[2]) << 16;
    assert_eq!(packed & 0x3, 1);
    assert_eq!(packed >> 2, (SAMPLE_BYTES / 4) as u32);
    assert_eq!(sub[3], 0);
    let samples = &record[60..60 + SAMPLE_BYTES];
    assert!(samples.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
}

#[test]
fn corrupted_trailer_rejects_the_sample() {
    let mut datagram = sample_datagram();
    let len = datagram.len();
    datagram[len - 1] ^= 0xff;
    assert!(MLinkFrame::decode(&datagram).is_err());
}
