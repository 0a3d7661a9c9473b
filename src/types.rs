//! Core types used throughout adcd.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Configured name of a device, used as the register-cache namespace and
/// in acquisition file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceName(pub String);

impl DeviceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// ADC channel number. The trigger's channel bitmap is 64 bits wide, so
/// valid channels are 0..=63.
pub type ChannelNum = u8;

/// Device family. Selects the semantic register map, the stream start/stop
/// sequences and the meaning of MStream fragment subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    /// ADC64 waveform digitizers (ADC64VE-XGE, ADC64VE-V3-XG, ...).
    #[default]
    Adc64,
    /// TQDC time/charge digitizers.
    Tqdc,
}

impl DeviceFamily {
    /// MStream subtype carrying trigger metadata, if the family has one.
    /// TQDC streams carry no separate trigger fragments.
    pub fn trigger_subtype(self) -> Option<u8> {
        match self {
            Self::Adc64 => Some(0),
            Self::Tqdc => None,
        }
    }

    /// MStream subtype carrying channel data.
    pub fn data_subtype(self) -> u8 {
        match self {
            Self::Adc64 => 1,
            Self::Tqdc => 0,
        }
    }

    /// Whether the MPD subheader carries the channel number. In TQDC
    /// records the channel byte is unused and written as zero.
    pub fn mpd_channel_byte(self, channel: ChannelNum) -> u8 {
        match self {
            Self::Adc64 => channel,
            Self::Tqdc => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Adc64 => "adc64",
            Self::Tqdc => "tqdc",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeviceFamily {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adc64" => Ok(Self::Adc64),
            "tqdc" => Ok(Self::Tqdc),
            other => Err(Error::InvalidConfig(format!(
                "unknown device family: {other}"
            ))),
        }
    }
}

/// Device firmware version, read from the FwVer/FwRev registers.
/// FwVer packs major.minor as a high/low byte pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FwVersion {
    pub major: u16,
    pub minor: u16,
    pub revision: u16,
}

impl FwVersion {
    pub fn from_regs(ver: u16, rev: u16) -> Self {
        Self {
            major: (ver >> 8) & 0xff,
            minor: ver & 0xff,
            revision: rev,
        }
    }

    /// Firmware at or above 1.0.23232 reports raw ADC data as signed
    /// 16-bit values; older firmware uses offset-biased unsigned values.
    pub fn raw_data_signed(self) -> bool {
        self >= FwVersion {
            major: 1,
            minor: 0,
            revision: 23232,
        }
    }
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Hex text form of a register address or value as used by external
/// interfaces: `0x` followed by four lowercase hex digits.
pub fn reg_hex(v: u16) -> String {
    format!("0x{v:04x}")
}

/// Parse the hex text form accepted by external interfaces. A bare hex
/// string without the `0x` prefix is accepted too.
pub fn parse_reg_hex(s: &str) -> Result<u16, Error> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u16::from_str_radix(digits, 16)
        .map_err(|e| Error::InvalidConfig(format!("bad register hex {s:?}: {e}")))
}
