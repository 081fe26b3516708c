//! Fixed properties of the digitizer event stream and the strax record layout.

/// Top nibble marking the first word of an event header.
pub const HEADER_NIBBLE: u32 = 0xA;
/// Words in an event header.
pub const EVENT_HEADER_WORDS: usize = 4;
/// Widest channel mask any supported board emits.
pub const MAX_CHANNELS: usize = 16;
/// Bytes per 32-bit transfer word.
pub const WORD_BYTES: usize = 4;

/// The board clock counter is 31 bits wide; bit 31 of the trigger-time word
/// flags an extended-time readout and is masked off everywhere.
pub const CLOCK_BITS: u32 = 31;
pub const CLOCK_MASK: u32 = 0x7FFF_FFFF;
/// Timestamps below this count as "early" in the rollover epoch.
pub const ROLLOVER_LOW: u32 = 500_000_000;
/// Timestamps above this count as "late" in the rollover epoch.
pub const ROLLOVER_HIGH: u32 = 1_500_000_000;

/// Bit 26 of the second header word reports a board failure.
pub const BOARD_FAIL_BIT: u32 = 0x0400_0000;

/// Fixed size of the strax fragment header.
pub const STRAX_HEADER_BYTES: usize = 24;
/// Logical channel carrying artificial-deadtime markers.
pub const DEADTIME_CHANNEL: i16 = 790;

/// Decoded board error bits, see [`crate::digitizer::Digitizer::check_errors`].
pub const ERR_PLL_UNLOCK: u32 = 0x1;
pub const ERR_VME_BUS: u32 = 0x2;

/// A readout of this many bytes or fewer carries a header and nothing else.
pub const HEADER_ONLY_BYTES: usize = 16;
