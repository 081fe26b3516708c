//! Register addresses and bit masks for the supported digitizer flavors.
//!
//! Addresses are offsets into a board's VME address space. Registers in the
//! 0x1000 block are per-channel; the channel stride is 0x100.

use super::config::BoardKind;

/// Acquisition control register values.
pub const ACQ_CTRL_STOP: u32 = 0x100; // keep register config, clear run
pub const ACQ_CTRL_SW_RUN: u32 = 0x104; // software-controlled run
pub const ACQ_CTRL_SIN_RUN: u32 = 0x105; // S-IN controlled run

/// Acquisition status register bits.
pub const ACQ_STATUS_RUNNING: u32 = 1 << 2;
pub const ACQ_STATUS_READY: u32 = 1 << 8;

/// Channel status register bit: DAC write in progress.
pub const CH_STATUS_DAC_BUSY: u32 = 1 << 2;

/// Board error register bits.
pub const BOARD_ERR_PLL: u32 = 1 << 4;
pub const BOARD_ERR_BUS: u32 = 1 << 9;

/// Stride between consecutive channels in the 0x1000 register block.
pub const CHANNEL_STRIDE: u32 = 0x100;

/// Address table for one digitizer flavor.
#[derive(Debug, Clone, Copy)]
pub struct RegisterMap {
    pub acq_control: u32,
    pub acq_status: u32,
    pub sw_trigger: u32,
    pub reset: u32,
    pub board_error: u32,
    pub readout_status: u32,
    pub ch_status: u32,
    pub ch_dac: u32,
    pub ch_threshold: u32,
}

pub const V1724_REGISTERS: RegisterMap = RegisterMap {
    acq_control: 0x8100,
    acq_status: 0x8104,
    sw_trigger: 0x8108,
    reset: 0xEF24,
    board_error: 0xEF00,
    readout_status: 0xEF04,
    ch_status: 0x1088,
    ch_dac: 0x1098,
    ch_threshold: 0x1080,
};

// The V1730 shares the 0x8000/0xEF00 blocks with the V1724 family; only the
// channel geometry and sampling differ.
pub const V1730_REGISTERS: RegisterMap = V1724_REGISTERS;

/// Bit-level description of the event stream a board variant emits.
#[derive(Debug, Clone, Copy)]
pub struct DataFormat {
    pub ns_per_clock: u64,
    pub ns_per_sample: u64,
    /// 0 for stock firmware; DPP-DAW firmware prefixes each channel with
    /// this many header words.
    pub channel_header_words: usize,
    /// Word index carrying the high byte of the channel mask, -1 if the
    /// mask is 8 bits only.
    pub channel_mask_msb_idx: i32,
    /// Word index carrying bits 32..48 of the channel time, -1 if channel
    /// times are 31 bits.
    pub channel_time_msb_idx: i32,
}

impl BoardKind {
    pub fn register_map(&self) -> &'static RegisterMap {
        match self {
            BoardKind::V1724 | BoardKind::V1724Mv => &V1724_REGISTERS,
            BoardKind::V1730 => &V1730_REGISTERS,
        }
    }

    pub fn num_channels(&self) -> usize {
        match self {
            BoardKind::V1724 | BoardKind::V1724Mv => 8,
            BoardKind::V1730 => 16,
        }
    }

    pub fn data_format(&self) -> DataFormat {
        match self {
            // DPP-DAW firmware: two channel header words, 31-bit times.
            BoardKind::V1724 => DataFormat {
                ns_per_clock: 10,
                ns_per_sample: 10,
                channel_header_words: 2,
                channel_mask_msb_idx: -1,
                channel_time_msb_idx: -1,
            },
            // Stock firmware, channels share the event header.
            BoardKind::V1724Mv => DataFormat {
                ns_per_clock: 10,
                ns_per_sample: 10,
                channel_header_words: 0,
                channel_mask_msb_idx: -1,
                channel_time_msb_idx: -1,
            },
            // 16 channels, extended mask, 48-bit channel times.
            BoardKind::V1730 => DataFormat {
                ns_per_clock: 8,
                ns_per_sample: 2,
                channel_header_words: 3,
                channel_mask_msb_idx: 2,
                channel_time_msb_idx: 2,
            },
        }
    }
}
