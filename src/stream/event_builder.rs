//! Event assembly and MPD record serialization.
//!
//! Events are scoped by `(device serial, event number)`. The trigger
//! fragment announces which channels will deliver data through its 64-bit
//! channel bitmap; the event closes when every announced channel has
//! arrived. Closed events are serialized straight into the MPD record
//! layout and handed to the writer.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::error::{Error, EventError, Result};
use crate::protocol::{
    EventFragment, EventPayload, MStreamTrigger, MpdDeviceHeader, MpdEventHeader,
    MpdMStreamHeader, MpdTimestampHeader, PAYLOAD_HEADER_SIZE,
};
use crate::types::{ChannelNum, DeviceFamily, DeviceName};

/// Largest tolerated distance between a live event number and the newest
/// closed one before the stale sweep reaps it.
pub const MAX_EVENT_DIFF: u32 = 10;

/// One event under construction.
#[derive(Debug)]
pub struct Event {
    pub device_serial: u32,
    pub event_num: u32,
    pub device_id: u8,
    pub trigger: Option<MStreamTrigger>,
    pub trigger_channels: u64,
    pub data_channels: u64,
    data: BTreeMap<ChannelNum, Vec<u8>>,
    /// Total payload bytes of all fragments, payload headers excluded
    /// (they are not serialized into MPD output).
    length: u32,
}

impl Event {
    fn new(device_serial: u32, event_num: u32) -> Self {
        Self {
            device_serial,
            event_num,
            device_id: 0,
            trigger: None,
            trigger_channels: 0,
            data_channels: 0,
            data: BTreeMap::new(),
            length: 0,
        }
    }

    /// Apply one assembled fragment. Returns true when the event became
    /// complete: trigger present and the data channels match its bitmap.
    fn set_fragment(&mut self, fragment: &EventFragment) -> bool {
        self.length += u32::from(fragment.total_length) - PAYLOAD_HEADER_SIZE as u32;

        match &fragment.payload {
            EventPayload::Trigger(trigger) => {
                self.device_id = fragment.device_id;
                self.trigger_channels = trigger.channels();
                self.trigger = Some(*trigger);
            }
            EventPayload::Data(bytes) => {
                if self.device_id == 0 {
                    self.device_id = fragment.device_id;
                }
                self.data_channels |= 1u64 << fragment.header.channel_num;
                self.data.insert(fragment.header.channel_num, bytes.clone());
            }
        }

        self.trigger.is_some() && self.data_channels == self.trigger_channels
    }

    /// Serialize the event into one MPD record.
    pub fn serialize(&self, family: DeviceFamily, timestamp_ms: u64) -> Result<Vec<u8>> {
        let trigger = self.trigger.ok_or(EventError::MissingTrigger {
            event_num: self.event_num,
        })?;

        // One inner subheader per data channel plus one for the trigger.
        let data_count = self.data_channels.count_ones();
        let device_header_length = self.length + (data_count + 1) * 4;
        let event_header_length = device_header_length + MpdDeviceHeader::SIZE as u32;

        let total = MpdTimestampHeader::SIZE
            + MpdEventHeader::SIZE
            + MpdDeviceHeader::SIZE
            + device_header_length as usize;
        let mut buf = vec![0u8; total];
        let mut at = 0;

        MpdTimestampHeader { timestamp_ms }.serialize(&mut buf[at..at + MpdTimestampHeader::SIZE]);
        at += MpdTimestampHeader::SIZE;

        MpdEventHeader {
            event_num: self.event_num,
            length: event_header_length,
        }
        .serialize(&mut buf[at..at + MpdEventHeader::SIZE]);
        at += MpdEventHeader::SIZE;

        MpdDeviceHeader {
            device_serial: self.device_serial,
            device_id: self.device_id,
            length: device_header_length,
        }
        .serialize(&mut buf[at..at + MpdDeviceHeader::SIZE]);
        at += MpdDeviceHeader::SIZE;

        let trigger_body = trigger.encode();
        MpdMStreamHeader {
            subtype: family.trigger_subtype().unwrap_or(0),
            length_words: (trigger_body.len() / 4) as u32,
            channel: 0,
        }
        .serialize(&mut buf[at..at + MpdMStreamHeader::SIZE]);
        at += MpdMStreamHeader::SIZE;
        buf[at..at + trigger_body.len()].copy_from_slice(&trigger_body);
        at += trigger_body.len();

        for (&channel, bytes) in &self.data {
            MpdMStreamHeader {
                subtype: family.data_subtype(),
                length_words: (bytes.len() / 4) as u32,
                channel: family.mpd_channel_byte(channel),
            }
            .serialize(&mut buf[at..at + MpdMStreamHeader::SIZE]);
            at += MpdMStreamHeader::SIZE;
            buf[at..at + bytes.len()].copy_from_slice(bytes);
            at += bytes.len();
        }

        debug_assert_eq!(at, total);
        Ok(buf)
    }
}

/// Per-device event builder.
pub struct EventBuilder {
    device: DeviceName,
    family: DeviceFamily,
    expected_serial: Option<u32>,
    events: HashMap<(u32, u32), Event>,
    max_closed: u32,
}

impl EventBuilder {
    pub fn new(device: DeviceName, family: DeviceFamily) -> Self {
        Self {
            device,
            family,
            expected_serial: None,
            events: HashMap::new(),
            max_closed: 0,
        }
    }

    /// Number of events currently under construction.
    pub fn live_events(&self) -> usize {
        self.events.len()
    }

    /// Consume one assembled fragment; returns the MPD records that
    /// became ready (the completed event plus any force-closed strays
    /// reaped by the stale sweep).
    pub fn handle(&mut self, fragment: &EventFragment) -> Result<Vec<Vec<u8>>> {
        let serial = fragment.header.device_serial;
        match self.expected_serial {
            None => self.expected_serial = Some(serial),
            Some(expected) if expected != serial => {
                return Err(Error::Event(EventError::SerialMismatch {
                    expected,
                    got: serial,
                }));
            }
            Some(_) => {}
        }

        if matches!(fragment.payload, EventPayload::Data(_)) && fragment.header.channel_num >= 64 {
            return Err(Error::Event(EventError::ChannelOutOfRange(
                fragment.header.channel_num,
            )));
        }

        let key = (serial, fragment.header.event_num);
        let event = self
            .events
            .entry(key)
            .or_insert_with(|| Event::new(key.0, key.1));

        let mut records = Vec::new();
        if event.set_fragment(fragment) {
            debug!(device = %self.device, event = key.1, "close event");
            let event = self.events.remove(&key).expect("event exists");
            records.push(event.serialize(self.family, now_ms())?);
            self.max_closed = self.max_closed.max(key.1);
            self.sweep_stale(&mut records);
        }
        Ok(records)
    }

    /// Reap events that fell too far behind the newest closed one: ones
    /// that at least saw their trigger are force-closed (incomplete but
    /// self-consistent), triggerless ones are dropped.
    fn sweep_stale(&mut self, records: &mut Vec<Vec<u8>>) {
        if self.events.len() <= 2 * MAX_EVENT_DIFF as usize {
            return;
        }

        let max_closed = self.max_closed;
        let stale: Vec<(u32, u32)> = self
            .events
            .keys()
            .filter(|&&(_, event_num)| max_closed.wrapping_sub(event_num) > MAX_EVENT_DIFF)
            .copied()
            .collect();

        for key in stale {
            let event = self.events.remove(&key).expect("stale event exists");
            if event.trigger.is_some() {
                warn!(device = %self.device, event = key.1, "force closing stale event");
                match event.serialize(self.family, now_ms()) {
                    Ok(record) => records.push(record),
                    Err(err) => warn!(device = %self.device, event = key.1, %err,
                        "failed to serialize stale event"),
                }
            } else {
                debug!(device = %self.device, event = key.1, "dropping stale event without trigger");
            }
        }
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PayloadHeader;
    use byteorder::{ByteOrder, LittleEndian};

    const SERIAL: u32 = 0x0CD93DB0;

    fn trigger_fragment(event_num: u32, low_ch: u32, hi_ch: u32, id: u16) -> EventFragment {
        EventFragment {
            device_id: 0xdf,
            subtype: 0,
            fragment_id: id,
            total_length: 24,
            header: PayloadHeader {
                device_serial: SERIAL,
                event_num,
                channel_num: 0,
            },
            payload: EventPayload::Trigger(MStreamTrigger {
                tai_sec: 0,
                tai_nsec: 0,
                tai_flags: 0,
                low_ch,
                hi_ch,
            }),
        }
    }

    fn data_fragment(event_num: u32, channel: ChannelNum, bytes: Vec<u8>, id: u16) -> EventFragment {
        EventFragment {
            device_id: 0xdf,
            subtype: 1,
            fragment_id: id,
            total_length: (PAYLOAD_HEADER_SIZE + bytes.len()) as u16,
            header: PayloadHeader {
                device_serial: SERIAL,
                event_num,
                channel_num: channel,
            },
            payload: EventPayload::Data(bytes),
        }
    }

    fn builder() -> EventBuilder {
        EventBuilder::new(DeviceName::from("adc-1"), DeviceFamily::Adc64)
    }

    #[test]
    fn single_channel_event_closes() {
        let mut eb = builder();
        assert!(eb
            .handle(&trigger_fragment(0x1d, 0x1, 0, 0x38))
            .unwrap()
            .is_empty());
        let records = eb.handle(&data_fragment(0x1d, 0, vec![0xee; 520], 0x39)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(eb.live_events(), 0);

        let record = &records[0];
        // Timestamp, event and device headers followed by the trigger
        // subblock and one channel subblock.
        let expected_device_len = (520 + 16) + (1 + 1) * 4;
        assert_eq!(record.len(), 16 + 12 + 8 + expected_device_len);

        assert_eq!(LittleEndian::read_u32(&record[0..4]), 0x3F60B8A8);
        assert_eq!(LittleEndian::read_u32(&record[16..20]), 0x2A502A50);
        let event_header_len = LittleEndian::read_u32(&record[20..24]);
        let event_num = LittleEndian::read_u32(&record[24..28]);
        assert_eq!(event_num, 0x1d);
        assert_eq!(event_header_len, expected_device_len as u32 + 8);

        assert_eq!(LittleEndian::read_u32(&record[28..32]), SERIAL);
        let device_len = u32::from(LittleEndian::read_u16(&record[32..34]))
            | u32::from(record[34]) << 16;
        assert_eq!(device_len, expected_device_len as u32);
        assert_eq!(record[35], 0xdf);

        // Trigger subheader: subtype 0, 4 words, channel 0.
        let packed = u32::from(record[36]) | u32::from(record[37]) << 8 | u32::from(record[38]) << 16;
        assert_eq!(packed & 0x3, 0);
        assert_eq!(packed >> 2, 4);
        assert_eq!(record[39], 0);

        // Channel subheader after the 16-byte trigger body.
        let ch = &record[36 + 4 + 16..];
        let packed = u32::from(ch[0]) | u32::from(ch[1]) << 8 | u32::from(ch[2]) << 16;
        assert_eq!(packed & 0x3, 1);
        assert_eq!(packed >> 2, 130);
        assert_eq!(ch[3], 0);
        assert!(ch[4..4 + 520].iter().all(|&b| b == 0xee));
    }

    #[test]
    fn waits_for_all_announced_channels() {
        let mut eb = builder();
        // Channels 0, 2 and 40 announced.
        let bitmap_lo = 0b101;
        let bitmap_hi = 1 << (40 - 32);
        assert!(eb
            .handle(&trigger_fragment(1, bitmap_lo, bitmap_hi, 1))
            .unwrap()
            .is_empty());
        assert!(eb.handle(&data_fragment(1, 0, vec![0; 8], 2)).unwrap().is_empty());
        assert!(eb.handle(&data_fragment(1, 40, vec![0; 8], 3)).unwrap().is_empty());
        let records = eb.handle(&data_fragment(1, 2, vec![0; 8], 4)).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn trigger_last_also_closes() {
        let mut eb = builder();
        assert!(eb.handle(&data_fragment(7, 0, vec![1, 2, 3, 4], 1)).unwrap().is_empty());
        let records = eb.handle(&trigger_fragment(7, 0x1, 0, 2)).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn channels_serialize_in_ascending_order() {
        let mut eb = builder();
        eb.handle(&trigger_fragment(1, 0b111, 0, 1)).unwrap();
        eb.handle(&data_fragment(1, 2, vec![0x22; 4], 2)).unwrap();
        eb.handle(&data_fragment(1, 0, vec![0x00; 4], 3)).unwrap();
        let records = eb.handle(&data_fragment(1, 1, vec![0x11; 4], 4)).unwrap();
        let record = &records[0];

        // Walk the three channel subblocks behind the trigger block.
        let mut at = 16 + 12 + 8 + 4 + 16;
        let mut channels = Vec::new();
        while at < record.len() {
            channels.push(record[at + 3]);
            at += 4 + 4;
        }
        assert_eq!(channels, vec![0, 1, 2]);
    }

    #[test]
    fn interleaved_events_complete_independently() {
        let mut eb = builder();
        eb.handle(&trigger_fragment(10, 0x1, 0, 1)).unwrap();
        eb.handle(&trigger_fragment(11, 0x1, 0, 2)).unwrap();
        assert_eq!(eb.live_events(), 2);

        // The newer event completes first; the older one stays live.
        let records = eb.handle(&data_fragment(11, 0, vec![0; 4], 3)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(eb.live_events(), 1);

        let records = eb.handle(&data_fragment(10, 0, vec![0; 4], 4)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(eb.live_events(), 0);
    }

    #[test]
    fn serial_mismatch_is_an_error() {
        let mut eb = builder();
        eb.handle(&trigger_fragment(1, 0x1, 0, 1)).unwrap();

        let mut foreign = data_fragment(1, 0, vec![0; 4], 2);
        foreign.header.device_serial = 0xdeadbeef;
        let err = eb.handle(&foreign).unwrap_err();
        assert!(matches!(
            err,
            Error::Event(EventError::SerialMismatch { got: 0xdeadbeef, .. })
        ));
    }

    #[test]
    fn stale_sweep_reaps_far_behind_events() {
        let mut eb = builder();

        // A triggerless stray and a triggered-but-incomplete stray.
        eb.handle(&data_fragment(1, 0, vec![0; 4], 1)).unwrap();
        eb.handle(&trigger_fragment(2, 0b11, 0, 2)).unwrap();
        eb.handle(&data_fragment(2, 0, vec![0; 4], 3)).unwrap();

        // Fill the map past the sweep threshold with open events.
        for n in 0..20 {
            eb.handle(&trigger_fragment(100 + n, 0b11, 0, 4)).unwrap();
        }
        assert_eq!(eb.live_events(), 22);

        // Closing one event well ahead of everything triggers the sweep:
        // every stray is now more than MAX_EVENT_DIFF behind.
        eb.handle(&trigger_fragment(130, 0x1, 0, 5)).unwrap();
        let records = eb.handle(&data_fragment(130, 0, vec![0; 4], 6)).unwrap();

        // Event 130 itself plus 21 force-closed events that had triggers;
        // the triggerless stray is dropped silently.
        assert_eq!(records.len(), 22);
        assert_eq!(eb.live_events(), 0);
    }
}
