//! Per-device semantic operations.
//!
//! A [`DeviceModel`] translates high-level operations (start or stop the
//! stream, enable a trigger source, shape a channel) into the register
//! and memory write sequences its family expects, sent through the
//! control link. Register reads never touch the wire: they are served
//! from the cache kept warm by the periodic poll.

pub mod registers;

use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::control::ControlLink;
use crate::error::{Error, Result};
use crate::protocol::{MemOp, Reg, RegOp};
use crate::store::RegStore;
use crate::types::{ChannelNum, DeviceFamily, DeviceName, FwVersion};

use registers::{adc64, ch_reg_addr, mem, tqdc, NCH};
use registers::{RUN_STATUS_BIT_RUNNING, TRIG_BIT_LEMO, TRIG_BIT_THRESHOLD, TRIG_BIT_TIMER};

/// Trigger sources selectable on ADC64 devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Timer,
    Threshold,
    Lemo,
}

impl TriggerSource {
    fn bit(self) -> u16 {
        match self {
            Self::Timer => TRIG_BIT_TIMER,
            Self::Threshold => TRIG_BIT_THRESHOLD,
            Self::Lemo => TRIG_BIT_LEMO,
        }
    }
}

/// Requested setup for one channel.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSetup {
    pub id: ChannelNum,
    pub enabled: bool,
    pub trigger_enabled: bool,
    pub trigger_threshold: i32,
    pub zs_threshold: i32,
    pub baseline: i32,
}

#[derive(Debug, Clone, Copy)]
struct ChannelSettings {
    enabled: bool,
    trigger_enabled: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            trigger_enabled: true,
        }
    }
}

/// Mutable DSP/channel state mirrored on the host side; rewritten to the
/// device whenever one of the knobs changes.
#[derive(Debug)]
struct Adc64Settings {
    channels: [ChannelSettings; NCH],
    invert_input: bool,
    invert_threshold_trigger: bool,
    invert_zs_threshold: bool,
    zero_suppression: bool,
    dsp_enabled: bool,
    maf_enabled: bool,
    maf_tap_sel: u16,
    test_enabled: bool,
    blc_thr: i32,
    fir_roundoff: u16,
}

impl Adc64Settings {
    fn new(zero_suppression: bool) -> Self {
        Self {
            channels: [ChannelSettings::default(); NCH],
            invert_input: false,
            invert_threshold_trigger: false,
            invert_zs_threshold: false,
            zero_suppression,
            dsp_enabled: false,
            maf_enabled: false,
            maf_tap_sel: 2,
            test_enabled: false,
            blc_thr: 100,
            fir_roundoff: 1,
        }
    }

    /// Encode the 16-bit channel control word.
    fn ch_ctrl_word(&self, ch: usize) -> u16 {
        let mut word = 0u16;
        if self.channels[ch].enabled {
            word |= 0x8000;
        }
        if self.invert_input {
            word |= 0x4000;
        }
        if self.invert_threshold_trigger {
            word |= 0x2000;
        }
        if self.invert_zs_threshold {
            word |= 0x1000;
        }
        if self.channels[ch].trigger_enabled {
            word |= 0x0800;
        }
        word |= 0x0600; // fixed bits
        if self.dsp_enabled && self.maf_enabled {
            word |= 0x0080;
        }
        if self.dsp_enabled && self.test_enabled {
            word |= 0x0040;
        }
        word |= (self.maf_tap_sel & 0x0003) << 4;
        word
    }
}

/// Per-device façade over the control link and the register cache.
pub struct DeviceModel {
    name: DeviceName,
    ip: Ipv4Addr,
    family: DeviceFamily,
    link: ControlLink,
    store: Arc<RegStore>,
    settings: Mutex<Adc64Settings>,
}

impl DeviceModel {
    pub fn new(config: &DeviceConfig, link: ControlLink, store: Arc<RegStore>) -> Self {
        Self {
            name: config.name.clone(),
            ip: config.ip,
            family: config.family,
            link,
            store,
            settings: Mutex::new(Adc64Settings::new(config.zero_suppression)),
        }
    }

    pub fn name(&self) -> &DeviceName {
        &self.name
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn family(&self) -> DeviceFamily {
        self.family
    }

    fn unsupported(&self, op: &'static str) -> Error {
        Error::NotSupported {
            op,
            family: self.family.as_str(),
        }
    }

    /// Start the acquisition stream.
    pub async fn start_stream(&self) -> Result<()> {
        debug!(device = %self.name, "start stream");
        match self.family {
            DeviceFamily::Adc64 => {
                let run_ctrl = if self.settings.lock().zero_suppression {
                    2
                } else {
                    1
                };
                let ops = [
                    RegOp::write(adc64::DEVICE_CTRL, 0x0000),
                    RegOp::write(adc64::DEVICE_CTRL, 0x8000),
                    RegOp::write(adc64::MSTREAM_RUN_CTRL, run_ctrl),
                ];
                self.link.reg_request(&ops, self.ip).await?;
            }
            DeviceFamily::Tqdc => {
                let ops = [RegOp::write(tqdc::DEVICE_CTRL, 0x8000)];
                self.link.reg_request(&ops, self.ip).await?;
            }
        }
        Ok(())
    }

    /// Stop the acquisition stream.
    pub async fn stop_stream(&self) -> Result<()> {
        debug!(device = %self.name, "stop stream");
        match self.family {
            DeviceFamily::Adc64 => {
                let ops = [
                    RegOp::write(adc64::DEVICE_CTRL, 1),
                    RegOp::write(adc64::DEVICE_CTRL, 0),
                    RegOp::write(adc64::MSTREAM_RUN_CTRL, 0),
                ];
                self.link.reg_request(&ops, self.ip).await?;
            }
            DeviceFamily::Tqdc => {
                let ops = [RegOp::write(tqdc::DEVICE_CTRL, 0)];
                self.link.reg_request(&ops, self.ip).await?;
            }
        }
        Ok(())
    }

    /// Enable or disable one trigger source: read-modify-write on the
    /// cached TrigCtrl value.
    pub async fn set_trigger(&self, source: TriggerSource, enable: bool) -> Result<()> {
        if self.family != DeviceFamily::Adc64 {
            return Err(self.unsupported("set_trigger"));
        }

        let current = self
            .reg_read(adc64::TRIG_CTRL)?
            .map_or(0, |reg| reg.value);
        let value = if enable {
            current | source.bit()
        } else {
            current & !source.bit()
        };
        let ops = [RegOp::write(adc64::TRIG_CTRL, value)];
        self.link.reg_request(&ops, self.ip).await?;
        Ok(())
    }

    /// Apply channel setups: control word, baseline and both thresholds
    /// per channel, through the memory bus.
    pub async fn set_channels(&self, setups: &[ChannelSetup]) -> Result<()> {
        if self.family != DeviceFamily::Adc64 {
            return Err(self.unsupported("set_channels"));
        }

        for setup in setups {
            let ch = setup.id as usize;
            if ch >= NCH {
                return Err(Error::Internal(format!("channel {ch} out of range")));
            }

            let ctrl = {
                let mut settings = self.settings.lock();
                settings.channels[ch].enabled = setup.enabled;
                settings.channels[ch].trigger_enabled = setup.trigger_enabled;
                settings.ch_ctrl_word(ch)
            };

            self.write_ch_reg(ch, mem::CH_CTRL, u32::from(ctrl)).await?;
            self.write_ch_reg(ch, mem::CH_BASELINE, setup.baseline as u32)
                .await?;
            let zs = self.truncate_value(setup.zs_threshold)?;
            self.write_ch_reg(ch, mem::CH_ZS_THR, u32::from(zs)).await?;
            let thr = self.truncate_value(setup.trigger_threshold)?;
            self.write_ch_reg(ch, mem::CH_THR, u32::from(thr)).await?;
        }
        Ok(())
    }

    /// Select the moving-average filter tap and rewrite every channel
    /// control word.
    pub async fn set_maf(&self, tap_sel: u16) -> Result<()> {
        if self.family != DeviceFamily::Adc64 {
            return Err(self.unsupported("set_maf"));
        }
        {
            let mut settings = self.settings.lock();
            settings.dsp_enabled = true;
            settings.maf_enabled = true;
            settings.maf_tap_sel = tap_sel;
        }
        self.rewrite_ch_ctrl().await
    }

    /// Set the baseline-correction threshold and rewrite channel state.
    pub async fn set_maf_blc_thresh(&self, threshold: i32) -> Result<()> {
        if self.family != DeviceFamily::Adc64 {
            return Err(self.unsupported("set_maf_blc_thresh"));
        }
        self.settings.lock().blc_thr = threshold;
        for ch in 0..NCH {
            self.write_ch_blc(ch).await?;
        }
        Ok(())
    }

    /// Invert the analog input on every channel.
    pub async fn set_invert(&self, invert: bool) -> Result<()> {
        if self.family != DeviceFamily::Adc64 {
            return Err(self.unsupported("set_invert"));
        }
        self.settings.lock().invert_input = invert;
        self.rewrite_ch_ctrl().await
    }

    /// Enable zero suppression for subsequent stream starts.
    pub fn set_zero_suppression(&self, enabled: bool) -> Result<()> {
        if self.family != DeviceFamily::Adc64 {
            return Err(self.unsupported("set_zero_suppression"));
        }
        self.settings.lock().zero_suppression = enabled;
        Ok(())
    }

    /// Load FIR coefficients: enable, roundoff, 16 coefficient registers
    /// and the CoefCtrl 1→0 strobe, in one request.
    pub async fn set_fir(&self, coef: &[u16; 16], roundoff: u16) -> Result<()> {
        if self.family != DeviceFamily::Adc64 {
            return Err(self.unsupported("set_fir"));
        }

        let roundoff = roundoff.min(3);
        self.settings.lock().fir_roundoff = roundoff;

        let mut ops = vec![
            RegOp::write(adc64::FIR_CONTROL, 1),
            RegOp::write(adc64::FIR_ROUNDOFF, roundoff),
        ];
        for (i, &c) in coef.iter().enumerate() {
            ops.push(RegOp::write(adc64::FIR_COEF_START + i as u16, c));
        }
        ops.push(RegOp::write(adc64::FIR_COEF_CTRL, 1));
        ops.push(RegOp::write(adc64::FIR_COEF_CTRL, 0));

        self.link.reg_request(&ops, self.ip).await?;
        Ok(())
    }

    /// Set the readout window size.
    pub async fn set_window_size(&self, size: u16) -> Result<()> {
        if self.family != DeviceFamily::Adc64 {
            return Err(self.unsupported("set_window_size"));
        }
        let ops = [RegOp::write(adc64::MSTREAM_DATA_SIZE, size)];
        self.link.reg_request(&ops, self.ip).await?;
        Ok(())
    }

    /// Set the readout latency.
    pub async fn set_latency(&self, latency: u16) -> Result<()> {
        if self.family != DeviceFamily::Adc64 {
            return Err(self.unsupported("set_latency"));
        }
        let ops = [RegOp::write(adc64::DEVICE_RLAT, latency)];
        self.link.reg_request(&ops, self.ip).await?;
        Ok(())
    }

    /// Whether the device reports a running stream (cached RunStatus).
    pub fn is_running(&self) -> Result<bool> {
        let status = self.reg_read(adc64::RUN_STATUS)?;
        Ok(status.is_some_and(|reg| reg.value & RUN_STATUS_BIT_RUNNING != 0))
    }

    /// Cached firmware version, if the poll has seen it yet.
    pub fn firmware(&self) -> Result<Option<FwVersion>> {
        let ver = self.reg_read(adc64::FW_VER)?;
        let rev = self.reg_read(adc64::FW_REV)?;
        Ok(match (ver, rev) {
            (Some(ver), Some(rev)) => Some(FwVersion::from_regs(ver.value, rev.value)),
            _ => None,
        })
    }

    /// Clamp a threshold to the value range of the device firmware.
    ///
    /// Firmware at or above 1.0.23232 takes signed 16-bit values; older
    /// firmware wants the value biased by 0x8000 into the unsigned range.
    /// Unknown firmware is treated as current.
    pub fn truncate_value(&self, value: i32) -> Result<u16> {
        let signed = self.firmware()?.map_or(true, FwVersion::raw_data_signed);
        let truncated = if signed {
            value.clamp(-32768, 32767) as u16
        } else {
            (value + 0x8000).clamp(0, 0xFFFF) as u16
        };
        Ok(truncated)
    }

    /// Read one register from the cache (never from the wire).
    pub fn reg_read(&self, addr: u16) -> Result<Option<Reg>> {
        Ok(self.store.get_reg(&self.name, addr)?)
    }

    /// All cached registers of this device's alias set.
    pub fn reg_read_all(&self) -> Result<Vec<Reg>> {
        Ok(self
            .store
            .get_all(&self.name)?
            .into_iter()
            .filter(|reg| self.family.reg_aliases().contains(&reg.addr))
            .collect())
    }

    /// Fire-and-forget register write. The cache is not updated; the
    /// next poll reflects whatever the device accepted.
    pub async fn reg_write(&self, reg: Reg) -> Result<()> {
        let ops = [RegOp::write(reg.addr, reg.value)];
        self.link.reg_request(&ops, self.ip).await?;
        Ok(())
    }

    /// Write one word to a per-channel register through the memory bus.
    async fn write_ch_reg(&self, ch: usize, reg: u32, value: u32) -> Result<()> {
        let op = MemOp::write(ch_reg_addr(ch, reg), vec![value]);
        self.link.mem_request(&op, self.ip).await?;
        Ok(())
    }

    async fn write_ch_blc(&self, ch: usize) -> Result<()> {
        let (ctrl, blc) = {
            let settings = self.settings.lock();
            (settings.ch_ctrl_word(ch), settings.blc_thr)
        };
        self.write_ch_reg(ch, mem::CH_CTRL, u32::from(ctrl)).await?;
        self.write_ch_reg(ch, mem::CH_BLC_THR_HI, blc as u32).await?;
        self.write_ch_reg(ch, mem::CH_BLC_THR_LO, (-blc) as u32)
            .await?;
        Ok(())
    }

    async fn rewrite_ch_ctrl(&self) -> Result<()> {
        for ch in 0..NCH {
            let ctrl = self.settings.lock().ch_ctrl_word(ch);
            self.write_ch_reg(ch, mem::CH_CTRL, u32::from(ctrl)).await?;
        }
        Ok(())
    }
}
