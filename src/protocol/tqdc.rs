//! TQDC data payload decoding.
//!
//! A TQDC data fragment body is a sequence of 32-bit words: a two-word
//! time header, then per-channel data blocks. Each block header packs the
//! data type in bits 28..31, the channel in bits 24..27, a spec field in
//! bits 16..18 and the block length in bytes in the low half. Type 0
//! blocks carry TDC hit words (tagged 2..=6 in their own top nibble),
//! type 1 blocks carry packed 16-bit ADC samples.
//!
//! The acquisition path stores TQDC payloads opaquely; this decoder
//! serves the operator-facing last-event view.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::CodecError;

/// Decoded TQDC event payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TqdcEvent {
    /// Coarse event timestamp from the time header.
    pub event_timestamp: u32,
    /// 30-bit TAI nanosecond counter.
    pub tai_nsec: u32,
    /// 2-bit TAI flags.
    pub tai_flags: u8,
    pub blocks: Vec<TqdcDataBlock>,
}

/// One per-channel data block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TqdcDataBlock {
    pub data_type: u8,
    pub channel: u8,
    pub spec: u8,
    /// Block payload length in bytes.
    pub length: u16,
    pub payload: TqdcBlockPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TqdcBlockPayload {
    Tdc(Vec<TdcWord>),
    Adc(AdcSamples),
}

/// One decoded TDC hit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TdcWord {
    /// Event header: coarse timestamp and event number.
    EventHeader { timestamp: u16, event_num: u16, id: u8 },
    /// Event trailer: word count and event number.
    EventTrailer { word_count: u16, event_num: u16, id: u8 },
    /// Leading edge hit.
    LeadingEdge { channel: u8, edge_time: u16, rc_data: u8 },
    /// Trailing edge hit.
    TrailingEdge { channel: u8, edge_time: u16, rc_data: u8 },
    /// Error summary word.
    Error { flags: u16, id: u8 },
}

/// Packed ADC waveform samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdcSamples {
    /// Timestamp of the first sample.
    pub timestamp: u16,
    /// Sample values, two per data word.
    pub samples: Vec<u16>,
}

const TIME_HEADER_WORDS: usize = 2;

/// Decode a TQDC data fragment body (the bytes after the MStream payload
/// header).
pub fn decode_tqdc_event(data: &[u8]) -> Result<TqdcEvent, CodecError> {
    if data.len() < TIME_HEADER_WORDS * 4 || data.len() % 4 != 0 {
        return Err(CodecError::Truncated {
            got: data.len(),
            need: TIME_HEADER_WORDS * 4,
        });
    }

    let words: Vec<u32> = data.chunks_exact(4).map(LittleEndian::read_u32).collect();

    let mut event = TqdcEvent {
        event_timestamp: words[0],
        tai_nsec: words[1] >> 2,
        tai_flags: (words[1] & 0x3) as u8,
        blocks: Vec::new(),
    };

    let mut at = TIME_HEADER_WORDS;
    while at < words.len() {
        let header = words[at];
        at += 1;

        let data_type = ((header >> 28) & 0xf) as u8;
        let channel = ((header >> 24) & 0xf) as u8;
        let spec = ((header >> 16) & 0x7) as u8;
        let length = (header & 0xffff) as u16;
        let block_words = length as usize / 4;

        if at + block_words > words.len() {
            return Err(CodecError::Truncated {
                got: data.len(),
                need: (at + block_words) * 4,
            });
        }

        let payload = match data_type {
            0 => {
                let tdc = words[at..at + block_words]
                    .iter()
                    .map(|&word| decode_tdc_word(word))
                    .collect::<Result<Vec<_>, _>>()?;
                TqdcBlockPayload::Tdc(tdc)
            }
            1 => TqdcBlockPayload::Adc(decode_adc_block(&words[at..at + block_words])?),
            other => {
                return Err(CodecError::UnknownSubtype {
                    subtype: other,
                    family: "tqdc",
                })
            }
        };
        at += block_words;

        event.blocks.push(TqdcDataBlock {
            data_type,
            channel,
            spec,
            length,
            payload,
        });
    }

    Ok(event)
}

fn decode_tdc_word(word: u32) -> Result<TdcWord, CodecError> {
    let tag = ((word >> 28) & 0xf) as u8;
    match tag {
        2 => Ok(TdcWord::EventHeader {
            timestamp: (word & 0xfff) as u16,
            event_num: ((word >> 12) & 0xfff) as u16,
            id: ((word >> 24) & 0xf) as u8,
        }),
        3 => Ok(TdcWord::EventTrailer {
            word_count: (word & 0xfff) as u16,
            event_num: ((word >> 12) & 0xfff) as u16,
            id: ((word >> 24) & 0xf) as u8,
        }),
        4 => Ok(TdcWord::LeadingEdge {
            rc_data: (word & 0x3) as u8,
            edge_time: ((word >> 2) & 0x7ffff) as u16,
            channel: ((word >> 21) & 0xf) as u8,
        }),
        5 => Ok(TdcWord::TrailingEdge {
            rc_data: (word & 0x3) as u8,
            edge_time: ((word >> 2) & 0x7ffff) as u16,
            channel: ((word >> 21) & 0xf) as u8,
        }),
        6 => Ok(TdcWord::Error {
            flags: (word & 0x7fff) as u16,
            id: ((word >> 24) & 0xf) as u8,
        }),
        other => Err(CodecError::UnknownSubtype {
            subtype: other,
            family: "tqdc-tdc",
        }),
    }
}

fn decode_adc_block(words: &[u32]) -> Result<AdcSamples, CodecError> {
    if words.is_empty() {
        return Err(CodecError::Truncated { got: 0, need: 4 });
    }

    let timestamp = (words[0] & 0xffff) as u16;
    let byte_len = ((words[0] >> 16) & 0xffff) as usize;
    let sample_count = byte_len / 2;
    let sample_words = sample_count.div_ceil(2);

    if 1 + sample_words > words.len() {
        return Err(CodecError::Truncated {
            got: words.len() * 4,
            need: (1 + sample_words) * 4,
        });
    }

    let mut samples = Vec::with_capacity(sample_count);
    for i in 0..sample_count {
        let word = words[1 + i / 2];
        let sample = if i % 2 == 0 {
            (word & 0xffff) as u16
        } else {
            ((word >> 16) & 0xffff) as u16
        };
        samples.push(sample);
    }

    Ok(AdcSamples { timestamp, samples })
}
