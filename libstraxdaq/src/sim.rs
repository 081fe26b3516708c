//! A register-level digitizer stand-in.
//!
//! SimBoard implements [`VmeAccess`] against an in-memory register file and
//! a linear DAC-to-pedestal response, so the whole readout chain can run on
//! a laptop. The CLI uses it in `--simulate` mode and the test suite drives
//! it everywhere hardware would be.

use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::constants::{CLOCK_MASK, HEADER_NIBBLE};
use super::error::VmeError;
use super::registers::{
    ACQ_CTRL_SIN_RUN, ACQ_CTRL_SW_RUN, ACQ_STATUS_READY, ACQ_STATUS_RUNNING, CHANNEL_STRIDE,
    V1724_REGISTERS,
};
use super::vme::VmeAccess;

struct SimState {
    n_channels: usize,
    dac: Vec<u16>,
    /// Pedestal model: baseline = slope * dac + yint, in ADC counts.
    slope: f64,
    yint: f64,
    noise: u16,
    samples_per_trigger: usize,
    running: bool,
    event_time: u32,
    time_step: u32,
    pending: VecDeque<u32>,
    /// When nonzero the next readouts return a header-only event.
    short_reads: u32,
    fail_next_blt: bool,
    error_register: u32,
}

impl SimState {
    fn baseline(&self, ch: usize) -> f64 {
        self.slope * self.dac[ch] as f64 + self.yint
    }

    fn build_event(&mut self) {
        let mask: u32 = (1u32 << self.n_channels) - 1;
        let words_per_channel = self.samples_per_trigger / 2;
        let words_in_event = 4 + words_per_channel * self.n_channels;
        self.pending
            .push_back((HEADER_NIBBLE << 28) | words_in_event as u32);
        self.pending.push_back(mask);
        self.pending.push_back(0);
        self.pending.push_back(self.event_time & CLOCK_MASK);
        let mut rng = rand::thread_rng();
        for ch in 0..self.n_channels {
            let baseline = self.baseline(ch);
            for _ in 0..words_per_channel {
                let mut pair = [0u32; 2];
                for half in pair.iter_mut() {
                    let jitter = if self.noise > 0 {
                        rng.gen_range(-(self.noise as i32)..=self.noise as i32)
                    } else {
                        0
                    };
                    // clamp to the 14-bit ADC scale, away from zero since
                    // zeroed halves are skipped downstream
                    *half = (baseline as i32 + jitter).clamp(1, 0x3FFF) as u32;
                }
                self.pending.push_back(pair[0] | (pair[1] << 16));
            }
        }
        self.event_time = self.event_time.wrapping_add(self.time_step) & CLOCK_MASK;
    }
}

/// Handle onto a simulated board. Clones share the same state, so a test
/// can keep one handle for fault injection while the digitizer owns another.
#[derive(Clone)]
pub struct SimBoard {
    state: Arc<Mutex<SimState>>,
}

impl SimBoard {
    pub fn new(n_channels: usize) -> Self {
        SimBoard {
            state: Arc::new(Mutex::new(SimState {
                n_channels,
                dac: vec![0; n_channels],
                slope: 0.1,
                yint: 200.0,
                noise: 0,
                samples_per_trigger: 64,
                running: false,
                event_time: 1_000,
                time_step: 10_000,
                pending: VecDeque::new(),
                short_reads: 0,
                fail_next_blt: false,
                error_register: 0,
            })),
        }
    }

    /// Set the pedestal response, baseline = slope * dac + yint.
    pub fn with_response(self, slope: f64, yint: f64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.slope = slope;
            state.yint = yint;
        }
        self
    }

    pub fn with_noise(self, noise: u16) -> Self {
        self.state.lock().unwrap().noise = noise;
        self
    }

    /// The next `n` readouts return a header-only event.
    pub fn inject_short_reads(&self, n: u32) {
        self.state.lock().unwrap().short_reads = n;
    }

    pub fn fail_next_blt(&self) {
        self.state.lock().unwrap().fail_next_blt = true;
    }

    pub fn set_error_register(&self, value: u32) {
        self.state.lock().unwrap().error_register = value;
    }

    pub fn set_event_time(&self, t: u32) {
        self.state.lock().unwrap().event_time = t;
    }

    /// Queue raw words directly, bypassing the event generator.
    pub fn push_words(&self, words: &[u32]) {
        self.state.lock().unwrap().pending.extend(words);
    }

    pub fn dac(&self, ch: usize) -> u16 {
        self.state.lock().unwrap().dac[ch]
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }
}

impl VmeAccess for SimBoard {
    fn write_register(&mut self, addr: u32, value: u32) -> Result<(), VmeError> {
        let regs = &V1724_REGISTERS;
        let mut state = self.state.lock().unwrap();
        if addr == regs.acq_control {
            state.running = value == ACQ_CTRL_SW_RUN || value == ACQ_CTRL_SIN_RUN;
        } else if addr == regs.sw_trigger {
            if state.running {
                state.build_event();
            }
        } else if addr == regs.reset {
            state.running = false;
            state.pending.clear();
        } else {
            for ch in 0..state.n_channels {
                if addr == regs.ch_dac + ch as u32 * CHANNEL_STRIDE {
                    state.dac[ch] = value as u16;
                }
            }
        }
        Ok(())
    }

    fn read_register(&mut self, addr: u32) -> Result<u32, VmeError> {
        let regs = &V1724_REGISTERS;
        let state = self.state.lock().unwrap();
        if addr == regs.acq_status {
            let mut status = ACQ_STATUS_READY;
            if state.running {
                status |= ACQ_STATUS_RUNNING;
            }
            return Ok(status);
        }
        if addr == regs.board_error {
            return Ok(state.error_register);
        }
        if addr == regs.ch_status {
            return Ok(0);
        }
        Ok(0)
    }

    fn read_blt(&mut self, max_words: usize) -> Result<Vec<u32>, VmeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_blt {
            state.fail_next_blt = false;
            return Err(VmeError::Blt(String::from("simulated transfer fault")));
        }
        if state.short_reads > 0 {
            state.short_reads -= 1;
            let time = state.event_time & CLOCK_MASK;
            state.pending.clear();
            return Ok(vec![(HEADER_NIBBLE << 28) | 4, 0, 0, time]);
        }
        let take = max_words.min(state.pending.len());
        Ok(state.pending.drain(..take).collect())
    }
}
