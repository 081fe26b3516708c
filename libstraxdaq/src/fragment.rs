//! The strax fragment record: a fixed-size slice of one channel's waveform.
//!
//! Layout is little-endian packed, 24 header bytes then the sample payload
//! zero-padded to the configured fragment size:
//!
//! ```text
//! i64 time_ns | i32 length | i16 sample_interval_ns | i16 channel |
//! i32 pulse_length | i16 fragment_index | i16 baseline | payload...
//! ```

use super::constants::{DEADTIME_CHANNEL, STRAX_HEADER_BYTES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    pub time_ns: i64,
    /// Samples in this fragment.
    pub length_samples: i32,
    pub sample_interval_ns: i16,
    /// Logical channel from the channel map.
    pub channel: i16,
    /// Samples in the whole pulse this fragment was cut from.
    pub pulse_length_samples: i32,
    pub fragment_index: i16,
    /// Baseline value reported by DPP-DAW channel headers, 0 otherwise.
    pub baseline_ch: i16,
}

impl FragmentHeader {
    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.time_ns.to_le_bytes());
        out.extend_from_slice(&self.length_samples.to_le_bytes());
        out.extend_from_slice(&self.sample_interval_ns.to_le_bytes());
        out.extend_from_slice(&self.channel.to_le_bytes());
        out.extend_from_slice(&self.pulse_length_samples.to_le_bytes());
        out.extend_from_slice(&self.fragment_index.to_le_bytes());
        out.extend_from_slice(&self.baseline_ch.to_le_bytes());
    }
}

/// Encode one fragment record of exactly `STRAX_HEADER_BYTES +
/// fragment_bytes` bytes. Short payloads are zero-padded.
pub fn encode_fragment(header: &FragmentHeader, samples: &[u16], fragment_bytes: usize) -> Vec<u8> {
    let record_bytes = STRAX_HEADER_BYTES + fragment_bytes;
    let mut record = Vec::with_capacity(record_bytes);
    header.encode_into(&mut record);
    for sample in samples {
        record.extend_from_slice(&sample.to_le_bytes());
    }
    record.resize(record_bytes, 0);
    record
}

/// A synthetic fragment marking a lost or corrupted interval on the
/// deadtime channel. The source board id is stamped into the payload.
pub fn deadtime_fragment(time_ns: i64, bid: i32, fragment_bytes: usize) -> Vec<u8> {
    let samples = (fragment_bytes / 2) as i32;
    let header = FragmentHeader {
        time_ns,
        length_samples: samples,
        sample_interval_ns: 10,
        channel: DEADTIME_CHANNEL,
        pulse_length_samples: samples,
        fragment_index: 0,
        baseline_ch: 0,
    };
    encode_fragment(&header, &[bid as u16], fragment_bytes)
}

/// Zero-padded fixed-width chunk key, e.g. `000042`.
pub fn chunk_key(chunk_id: i64, width: usize) -> String {
    format!("{chunk_id:0width$}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_has_fixed_size_and_offsets() {
        let header = FragmentHeader {
            time_ns: 1000,
            length_samples: 4,
            sample_interval_ns: 10,
            channel: 42,
            pulse_length_samples: 6,
            fragment_index: 0,
            baseline_ch: 0,
        };
        let record = encode_fragment(&header, &[1, 2, 3, 4], 220);
        assert_eq!(record.len(), STRAX_HEADER_BYTES + 220);
        assert_eq!(i64::from_le_bytes(record[0..8].try_into().unwrap()), 1000);
        assert_eq!(i32::from_le_bytes(record[8..12].try_into().unwrap()), 4);
        // channel sits at byte 14, the offset downstream tooling reads
        assert_eq!(i16::from_le_bytes(record[14..16].try_into().unwrap()), 42);
        assert_eq!(i32::from_le_bytes(record[16..20].try_into().unwrap()), 6);
        assert_eq!(
            u16::from_le_bytes(record[24..26].try_into().unwrap()),
            1,
            "payload starts right after the header"
        );
        // padding beyond the samples is zeroed
        assert!(record[32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn deadtime_marks_sentinel_channel() {
        let record = deadtime_fragment(5_000, 110, 220);
        assert_eq!(
            i16::from_le_bytes(record[14..16].try_into().unwrap()),
            DEADTIME_CHANNEL
        );
        assert_eq!(i64::from_le_bytes(record[0..8].try_into().unwrap()), 5_000);
        assert_eq!(u16::from_le_bytes(record[24..26].try_into().unwrap()), 110);
    }

    #[test]
    fn chunk_keys_are_fixed_width() {
        assert_eq!(chunk_key(0, 6), "000000");
        assert_eq!(chunk_key(1950 / 1100, 6), "000001");
        assert_eq!(chunk_key(1234567, 6), "1234567");
    }
}
