//! Semantic register and memory maps of the supported device families.
//!
//! Addresses follow the vendor register documents; only the registers the
//! gateway actually drives are listed. The periodic poll reads the whole
//! alias set of a family to keep the cache warm.

use crate::types::DeviceFamily;

/// Number of channels on both supported families.
pub const NCH: usize = 64;

/// ADC64 register map.
pub mod adc64 {
    /// Run control: 0x8000 arms the device, 1 requests a halt.
    pub const DEVICE_CTRL: u16 = 0x0040;
    /// Run status; see [`super::RUN_STATUS_BIT_RUNNING`].
    pub const RUN_STATUS: u16 = 0x0041;
    /// MStream run control: 1 plain streaming, 2 with zero suppression.
    pub const MSTREAM_RUN_CTRL: u16 = 0x0042;
    /// Trigger source enable bits.
    pub const TRIG_CTRL: u16 = 0x0043;
    /// Readout window size in bytes.
    pub const MSTREAM_DATA_SIZE: u16 = 0x0044;
    /// Readout latency.
    pub const DEVICE_RLAT: u16 = 0x0045;
    /// Firmware version, major.minor packed as high/low byte.
    pub const FW_VER: u16 = 0x0046;
    /// Firmware revision.
    pub const FW_REV: u16 = 0x0047;
    /// FIR filter enable.
    pub const FIR_CONTROL: u16 = 0x0120;
    /// FIR result roundoff, 0..=3.
    pub const FIR_ROUNDOFF: u16 = 0x0121;
    /// FIR coefficient load strobe (1 then 0).
    pub const FIR_COEF_CTRL: u16 = 0x0122;
    /// First of 16 consecutive FIR coefficient registers.
    pub const FIR_COEF_START: u16 = 0x0130;

    /// Registers covered by the periodic poll.
    pub const ALIASES: &[u16] = &[
        DEVICE_CTRL,
        RUN_STATUS,
        MSTREAM_RUN_CTRL,
        TRIG_CTRL,
        MSTREAM_DATA_SIZE,
        DEVICE_RLAT,
        FW_VER,
        FW_REV,
        FIR_CONTROL,
        FIR_ROUNDOFF,
    ];
}

/// TQDC register map.
pub mod tqdc {
    /// Run control: 0x8000 arms the device, 0 halts it.
    pub const DEVICE_CTRL: u16 = 0x0040;
    /// Trigger control/status.
    pub const TRIG_CSR: u16 = 0x0100;
    /// Trigger event counter preload.
    pub const TRIG_EVENT_NUM_LOAD: u16 = 0x0104;
    /// TDC general control.
    pub const TDC_GEN_CTRL: u16 = 0x0220;

    /// Registers covered by the periodic poll.
    pub const ALIASES: &[u16] = &[DEVICE_CTRL, TRIG_CSR, TRIG_EVENT_NUM_LOAD, TDC_GEN_CTRL];
}

/// RunStatus bit: device is streaming.
pub const RUN_STATUS_BIT_RUNNING: u16 = 0x0010;

/// TrigCtrl bit: periodic timer trigger.
pub const TRIG_BIT_TIMER: u16 = 0x0001;
/// TrigCtrl bit: threshold trigger.
pub const TRIG_BIT_THRESHOLD: u16 = 0x0002;
/// TrigCtrl bit: LEMO input trigger.
pub const TRIG_BIT_LEMO: u16 = 0x0004;

/// Per-channel memory-mapped registers (ADC64), offset within a channel
/// bank.
pub mod mem {
    /// Channel control word.
    pub const CH_CTRL: u32 = 0x0001;
    /// Trigger threshold.
    pub const CH_THR: u32 = 0x0002;
    /// Zero-suppression threshold.
    pub const CH_ZS_THR: u32 = 0x0003;
    /// Baseline.
    pub const CH_BASELINE: u32 = 0x0004;
    /// Baseline correction threshold, upper.
    pub const CH_BLC_THR_HI: u32 = 0x0008;
    /// Baseline correction threshold, lower.
    pub const CH_BLC_THR_LO: u32 = 0x0009;
}

/// bit13 = 1 on the memory bus selects register operation.
pub const MEM_BIT_SELECT_CTRL: u32 = 1 << 13;

/// Base memory address of a channel's register bank.
pub fn ch_base_addr(ch: usize) -> u32 {
    (ch as u32) << 14
}

/// Memory address of one per-channel register.
pub fn ch_reg_addr(ch: usize, reg: u32) -> u32 {
    MEM_BIT_SELECT_CTRL | reg | ch_base_addr(ch)
}

impl DeviceFamily {
    /// The register alias set the periodic poll reads.
    pub fn reg_aliases(self) -> &'static [u16] {
        match self {
            Self::Adc64 => adc64::ALIASES,
            Self::Tqdc => tqdc::ALIASES,
        }
    }
}
