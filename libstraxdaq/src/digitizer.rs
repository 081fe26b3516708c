use std::thread;
use std::time::Duration;

use super::config::{BoardSpec, DacCalibration};
use super::constants::{
    CLOCK_BITS, CLOCK_MASK, ERR_PLL_UNLOCK, ERR_VME_BUS, HEADER_NIBBLE, ROLLOVER_HIGH,
    ROLLOVER_LOW,
};
use super::error::DigitizerError;
use super::registers::{
    DataFormat, RegisterMap, ACQ_CTRL_SIN_RUN, ACQ_CTRL_STOP, ACQ_CTRL_SW_RUN, ACQ_STATUS_READY,
    ACQ_STATUS_RUNNING, BOARD_ERR_BUS, BOARD_ERR_PLL, CHANNEL_STRIDE, CH_STATUS_DAC_BUSY,
};
use super::vme::VmeAccess;

/// Words requested per block-transfer cycle.
const BLT_WORDS: usize = 0x8000;
/// The pedestal lives on a 14-bit ADC scale.
const ADC_MAX: f64 = 16383.0;

/// Rollover bookkeeping for the 31-bit board clock.
///
/// The counter wraps roughly every 17 s at 125 MHz. An epoch closes only
/// after a full low-high-low transition has been confirmed, so several
/// buffers observed within one epoch cannot double-increment the counter.
#[derive(Debug, Default)]
struct ClockState {
    rollover_counter: u32,
    last_clock: u32,
    seen_over_high: bool,
}

impl ClockState {
    fn update(&mut self, timestamp: u32) -> u32 {
        if timestamp > ROLLOVER_HIGH {
            self.seen_over_high = true;
        } else if timestamp < ROLLOVER_LOW && self.seen_over_high {
            self.rollover_counter += 1;
            self.seen_over_high = false;
        }
        self.last_clock = timestamp;
        self.rollover_counter
    }
}

/// One waveform digitizer on an optical link.
///
/// Wraps the raw [`VmeAccess`] handle with the register map and data-format
/// descriptor of the board's variant. Owned exclusively by the link that
/// reads it; nothing here is shared between threads.
pub struct Digitizer {
    vme: Box<dyn VmeAccess>,
    regs: &'static RegisterMap,
    fmt: DataFormat,
    bid: i32,
    link: u8,
    n_channels: usize,
    clock: ClockState,
}

impl Digitizer {
    /// Open and reset a board. Fails if the board does not respond on its
    /// link afterwards.
    pub fn init(mut vme: Box<dyn VmeAccess>, spec: &BoardSpec) -> Result<Self, DigitizerError> {
        let regs = spec.kind.register_map();
        vme.write_register(regs.reset, 0x1)
            .map_err(|_| DigitizerError::InitFailed(spec.bid))?;
        vme.read_register(regs.acq_status)
            .map_err(|_| DigitizerError::InitFailed(spec.bid))?;
        spdlog::debug!("Initialized digitizer {}", spec.bid);
        Ok(Digitizer {
            vme,
            regs,
            fmt: spec.kind.data_format(),
            bid: spec.bid,
            link: spec.link,
            n_channels: spec.kind.num_channels(),
            clock: ClockState::default(),
        })
    }

    pub fn bid(&self) -> i32 {
        self.bid
    }

    pub fn link(&self) -> u8 {
        self.link
    }

    pub fn num_channels(&self) -> usize {
        self.n_channels
    }

    pub fn data_format(&self) -> DataFormat {
        self.fmt
    }

    pub fn write_register(&mut self, reg: u32, value: u32) -> Result<(), DigitizerError> {
        Ok(self.vme.write_register(reg, value)?)
    }

    pub fn read_register(&mut self, reg: u32) -> Result<u32, DigitizerError> {
        Ok(self.vme.read_register(reg)?)
    }

    /// Drain the board's output buffer. Returns the transferred words;
    /// empty means the board had nothing. The returned buffer is owned by
    /// the caller.
    pub fn read_mblt(&mut self) -> Result<Vec<u32>, DigitizerError> {
        let mut words: Vec<u32> = Vec::new();
        loop {
            let chunk = self.vme.read_blt(BLT_WORDS)?;
            let done = chunk.len() < BLT_WORDS;
            words.extend_from_slice(&chunk);
            if done {
                break;
            }
        }
        Ok(words)
    }

    pub fn acquisition_status(&mut self) -> Result<u32, DigitizerError> {
        self.read_register(self.regs.acq_status)
    }

    pub fn software_start(&mut self) -> Result<(), DigitizerError> {
        self.write_register(self.regs.acq_control, ACQ_CTRL_SW_RUN)
    }

    /// Arm for a hardware run: acquisition gates on the S-IN input.
    pub fn sin_start(&mut self) -> Result<(), DigitizerError> {
        self.write_register(self.regs.acq_control, ACQ_CTRL_SIN_RUN)
    }

    pub fn acquisition_stop(&mut self) -> Result<(), DigitizerError> {
        self.write_register(self.regs.acq_control, ACQ_CTRL_STOP)
    }

    pub fn sw_trigger(&mut self) -> Result<(), DigitizerError> {
        self.write_register(self.regs.sw_trigger, 0x1)
    }

    pub fn reset(&mut self) -> Result<(), DigitizerError> {
        self.write_register(self.regs.reset, 0x1)
    }

    /// Poll `reg` until the masked bits are set (or cleared), up to
    /// `ntries` polls with `sleep_ms` between them.
    fn monitor_register(
        &mut self,
        reg: u32,
        mask: u32,
        ntries: u32,
        sleep_ms: u64,
        set: bool,
    ) -> Result<bool, DigitizerError> {
        for _ in 0..ntries {
            let value = self.read_register(reg)?;
            if ((value & mask) != 0) == set {
                return Ok(true);
            }
            thread::sleep(Duration::from_millis(sleep_ms));
        }
        Ok(false)
    }

    pub fn ensure_ready(&mut self, ntries: u32, sleep_ms: u64) -> Result<bool, DigitizerError> {
        self.monitor_register(self.regs.acq_status, ACQ_STATUS_READY, ntries, sleep_ms, true)
    }

    pub fn ensure_started(&mut self, ntries: u32, sleep_ms: u64) -> Result<bool, DigitizerError> {
        self.monitor_register(
            self.regs.acq_status,
            ACQ_STATUS_RUNNING,
            ntries,
            sleep_ms,
            true,
        )
    }

    pub fn ensure_stopped(&mut self, ntries: u32, sleep_ms: u64) -> Result<bool, DigitizerError> {
        self.monitor_register(
            self.regs.acq_status,
            ACQ_STATUS_RUNNING,
            ntries,
            sleep_ms,
            false,
        )
    }

    /// Read and decode the board error register into the PLL/VME-bus mask.
    pub fn check_errors(&mut self) -> Result<u32, DigitizerError> {
        let raw = self
            .vme
            .read_register(self.regs.board_error)
            .map_err(|_| DigitizerError::ErrorRegisterUnreadable(self.bid))?;
        let mut decoded = 0;
        if raw & BOARD_ERR_PLL != 0 {
            decoded |= ERR_PLL_UNLOCK;
        }
        if raw & BOARD_ERR_BUS != 0 {
            decoded |= ERR_VME_BUS;
        }
        Ok(decoded)
    }

    /// Write the per-channel DC offsets, waiting out the DAC-busy bit
    /// before each write.
    pub fn load_dac(&mut self, values: &[u16]) -> Result<(), DigitizerError> {
        if values.len() != self.n_channels {
            return Err(DigitizerError::BadDacVector(
                self.bid,
                values.len(),
                self.n_channels,
            ));
        }
        for (ch, value) in values.iter().enumerate() {
            let status_reg = self.regs.ch_status + ch as u32 * CHANNEL_STRIDE;
            if !self.monitor_register(status_reg, CH_STATUS_DAC_BUSY, 100, 1, false)? {
                return Err(DigitizerError::RegisterTimeout(self.bid, status_reg));
            }
            self.write_register(
                self.regs.ch_dac + ch as u32 * CHANNEL_STRIDE,
                *value as u32,
            )?;
        }
        Ok(())
    }

    /// Clamp DAC values so the predicted pedestal stays on the ADC scale.
    pub fn clamp_dac_values(&self, values: &mut [u16], cal: &DacCalibration) {
        for (ch, value) in values.iter_mut().enumerate() {
            if ch >= cal.slope.len() || cal.slope[ch] == 0.0 {
                continue;
            }
            let at_zero = (0.0 - cal.yint[ch]) / cal.slope[ch];
            let at_max = (ADC_MAX - cal.yint[ch]) / cal.slope[ch];
            let lo = at_zero.min(at_max).max(0.0) as u16;
            let hi = at_zero.max(at_max).min(u16::MAX as f64) as u16;
            *value = (*value).clamp(lo, hi);
        }
    }

    pub fn set_thresholds(&mut self, values: &[u16]) -> Result<(), DigitizerError> {
        for (ch, value) in values.iter().enumerate().take(self.n_channels) {
            self.write_register(
                self.regs.ch_threshold + ch as u32 * CHANNEL_STRIDE,
                *value as u32,
            )?;
        }
        Ok(())
    }

    /// Trigger time of the first event header in a raw buffer.
    pub fn header_time(&self, buf: &[u32]) -> u32 {
        for (idx, word) in buf.iter().enumerate() {
            if word >> 28 == HEADER_NIBBLE && idx + 3 < buf.len() {
                return buf[idx + 3] & CLOCK_MASK;
            }
        }
        0
    }

    /// Feed a new header timestamp into the rollover bookkeeping and get
    /// the current rollover count.
    pub fn clock_counter(&mut self, timestamp: u32) -> u32 {
        self.clock.update(timestamp)
    }
}

/// The full 63-bit time of a 31-bit timestamp under a rollover count.
pub fn full_time(rollover_counter: u32, timestamp: u32) -> u64 {
    ((rollover_counter as u64) << CLOCK_BITS) | timestamp as u64
}
