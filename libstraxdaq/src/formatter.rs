//! Reformats raw digitizer buffers into strax fragments.
//!
//! One formatter runs per board. It drains the board's slot, walks the
//! event structure, slices each channel's waveform into fixed-size
//! fragments and buckets them into time chunks, handing completed chunks
//! to the sink.

use fxhash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::board_queue::{BoardSlot, RawPacket};
use super::channel_map::ChannelMap;
use super::config::{BufferType, Options};
use super::constants::{
    BOARD_FAIL_BIT, CLOCK_MASK, EVENT_HEADER_WORDS, HEADER_NIBBLE, MAX_CHANNELS, ROLLOVER_HIGH,
    ROLLOVER_LOW,
};
use super::digitizer::full_time;
use super::error::FormatterError;
use super::fragment::{chunk_key, deadtime_fragment, encode_fragment, FragmentHeader};
use super::registers::DataFormat;
use super::writer::ChunkSink;

/// Idle backoff when the board queue is empty.
const IDLE_SLEEP: Duration = Duration::from_micros(10);

/// State a formatter shares with the controller and its link reader.
#[derive(Debug, Default)]
pub struct FormatterShared {
    /// Cleared by the controller to begin the shutdown drain.
    pub active: AtomicBool,
    /// Set by the controller when the drain deadline expires.
    pub force_quit: AtomicBool,
    pub running: AtomicBool,
    /// Bytes currently sitting in unflushed chunk buffers.
    pub buffered_bytes: AtomicUsize,
    /// Board-fail events seen since the start of the run.
    pub fail_count: AtomicUsize,
    pub lost_packets: AtomicUsize,
    /// Raised when the formatter aborts on a configuration error.
    pub error: AtomicBool,
    data_per_chan: Mutex<FxHashMap<i16, usize>>,
}

impl FormatterShared {
    pub fn new() -> Self {
        let shared = FormatterShared::default();
        shared.active.store(true, Ordering::Release);
        shared
    }

    /// Bytes per logical channel since the last poll; polling resets.
    pub fn drain_channel_rates(&self, into: &mut FxHashMap<i16, usize>) {
        let mut per_chan = self.data_per_chan.lock().unwrap();
        for (channel, bytes) in per_chan.drain() {
            *into.entry(channel).or_default() += bytes;
        }
    }
}

/// Counters reported when a formatter winds down.
#[derive(Debug, Default, Clone)]
pub struct FormatterSummary {
    pub bid: i32,
    pub bytes_processed: u64,
    pub events_processed: u64,
    pub fragments_processed: u64,
    pub data_packets: u64,
}

pub struct StraxFormatter {
    bid: i32,
    fmt: DataFormat,
    slot: Arc<BoardSlot>,
    map: ChannelMap,
    sink: Arc<dyn ChunkSink>,
    shared: Arc<FormatterShared>,
    buffer_type: BufferType,
    fragment_bytes: usize,
    chunk_overlap: i64,
    full_chunk_length: i64,
    chunk_name_length: usize,
    warn_if_chunk_older_than: i64,
    buffer_chunks: i64,
    fragments: FxHashMap<String, Vec<u8>>,
    /// Newest emitted time per logical channel, for the monotonicity check.
    last_emitted: FxHashMap<i16, i64>,
    /// Histogram of batch sizes pulled from the slot.
    buffer_counter: FxHashMap<usize, u64>,
    bytes_processed: u64,
    events_processed: u64,
    fragments_processed: u64,
    data_packets: u64,
}

impl StraxFormatter {
    pub fn new(
        bid: i32,
        fmt: DataFormat,
        slot: Arc<BoardSlot>,
        map: ChannelMap,
        sink: Arc<dyn ChunkSink>,
        shared: Arc<FormatterShared>,
        options: &Options,
    ) -> Self {
        StraxFormatter {
            bid,
            fmt,
            slot,
            map,
            sink,
            shared,
            buffer_type: options.buffer_type,
            fragment_bytes: options.strax_fragment_payload_bytes,
            chunk_overlap: options.chunk_overlap_ns,
            full_chunk_length: options.full_chunk_length(),
            chunk_name_length: options.chunk_name_length,
            warn_if_chunk_older_than: options.warn_if_chunk_older_than,
            buffer_chunks: options.buffer_chunks,
            fragments: FxHashMap::default(),
            last_emitted: FxHashMap::default(),
            buffer_counter: FxHashMap::default(),
            bytes_processed: 0,
            events_processed: 0,
            fragments_processed: 0,
            data_packets: 0,
        }
    }

    /// Drain the slot until deactivated, then flush everything buffered.
    pub fn run(mut self) -> Result<FormatterSummary, FormatterError> {
        self.shared.running.store(true, Ordering::Release);
        let result = self.event_loop();
        if result.is_err() {
            self.shared.error.store(true, Ordering::Release);
        }
        self.shared.running.store(false, Ordering::Release);
        match result {
            Ok(()) => {
                spdlog::debug!(
                    "Board {} formatter done: {} packets, {} events, {} fragments",
                    self.bid,
                    self.data_packets,
                    self.events_processed,
                    self.fragments_processed
                );
                Ok(FormatterSummary {
                    bid: self.bid,
                    bytes_processed: self.bytes_processed,
                    events_processed: self.events_processed,
                    fragments_processed: self.fragments_processed,
                    data_packets: self.data_packets,
                })
            }
            Err(e) => {
                spdlog::error!("Board {} formatter aborted: {}", self.bid, e);
                Err(e)
            }
        }
    }

    fn event_loop(&mut self) -> Result<(), FormatterError> {
        loop {
            let processed = match self.buffer_type {
                BufferType::Dual => {
                    let batch = self.slot.drain();
                    let n = batch.len();
                    if n > 0 {
                        *self.buffer_counter.entry(n).or_default() += 1;
                        for packet in batch {
                            if self.shared.force_quit.load(Ordering::Acquire) {
                                self.shared.lost_packets.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                            self.process_packet(packet)?;
                        }
                    }
                    n
                }
                BufferType::Single => match self.slot.pop() {
                    Some(packet) => {
                        *self.buffer_counter.entry(1).or_default() += 1;
                        self.process_packet(packet)?;
                        1
                    }
                    None => 0,
                },
            };

            if processed > 0 {
                self.flush_chunks(false)?;
            } else if self.shared.force_quit.load(Ordering::Acquire) {
                let lost = self.slot.clear();
                if lost > 0 {
                    self.shared.lost_packets.fetch_add(lost, Ordering::Relaxed);
                    spdlog::warn!("Board {} force-quit: {} packets lost", self.bid, lost);
                }
                break;
            } else if !self.shared.active.load(Ordering::Acquire) && self.slot.is_empty() {
                break;
            } else {
                thread::sleep(IDLE_SLEEP);
            }
        }
        self.flush_chunks(true)?;
        Ok(())
    }

    fn process_packet(&mut self, packet: RawPacket) -> Result<(), FormatterError> {
        let mut idx = 0usize;
        while idx < packet.buff.len() {
            if packet.buff[idx] >> 28 == HEADER_NIBBLE {
                idx += self.process_event(&packet, idx)?;
            } else {
                idx += 1;
            }
            if self.shared.force_quit.load(Ordering::Acquire) {
                break;
            }
        }
        self.bytes_processed += packet.size_bytes as u64;
        self.data_packets += 1;
        Ok(())
    }

    /// Parse one event starting at `start`; returns the words consumed.
    fn process_event(&mut self, packet: &RawPacket, start: usize) -> Result<usize, FormatterError> {
        let words = &packet.buff[start..];
        let claimed = (words[0] & 0xFFF_FFFF) as usize;
        if claimed < EVENT_HEADER_WORDS || words.len() < EVENT_HEADER_WORDS {
            return Ok(1);
        }
        let words_in_event = claimed.min(words.len());
        if words_in_event < claimed {
            spdlog::debug!(
                "Board {} garbled event header: {}/{}",
                self.bid,
                claimed,
                words.len()
            );
        }
        if claimed == EVENT_HEADER_WORDS {
            // empty event
            return Ok(EVENT_HEADER_WORDS);
        }

        let mut channel_mask = words[1] & 0xFF;
        if self.fmt.channel_mask_msb_idx != -1 {
            channel_mask |= ((words[2] >> 24) & 0xFF) << 8;
        }
        let event_time = words[3] & CLOCK_MASK;
        self.events_processed += 1;

        if words[1] & BOARD_FAIL_BIT != 0 {
            let time_ns =
                (full_time(packet.clock_counter, event_time) * self.fmt.ns_per_clock) as i64;
            self.add_fragment(
                deadtime_fragment(time_ns, self.bid, self.fragment_bytes),
                time_ns,
            );
            self.shared.fail_count.fetch_add(1, Ordering::Relaxed);
            self.slot.request_error_check();
            return Ok(EVENT_HEADER_WORDS);
        }
        if channel_mask == 0 {
            return Ok(EVENT_HEADER_WORDS);
        }

        let mut idx = EVENT_HEADER_WORDS;
        for ch in 0..MAX_CHANNELS {
            if channel_mask & (1 << ch) == 0 {
                continue;
            }
            if start + idx >= packet.buff.len() {
                break;
            }
            match self.process_channel(packet, start + idx, words_in_event, channel_mask, event_time, ch)? {
                Some(consumed) => idx += consumed,
                None => break,
            }
        }
        Ok(idx)
    }

    /// Parse one channel's block; returns the words it spanned, or None if
    /// the rest of the event is unusable.
    fn process_channel(
        &mut self,
        packet: &RawPacket,
        start: usize,
        words_in_event: usize,
        channel_mask: u32,
        event_time: u32,
        ch: usize,
    ) -> Result<Option<usize>, FormatterError> {
        let words = &packet.buff[start..];
        let header_words = self.fmt.channel_header_words;
        if words.len() <= header_words {
            return Ok(None);
        }

        // stock firmware: channels split the event evenly and share its time
        let mut channel_words =
            (words_in_event - EVENT_HEADER_WORDS) / channel_mask.count_ones() as usize;
        let mut channel_time: u64 = full_time(packet.clock_counter, event_time);
        let mut baseline_ch: i16 = 0;

        if header_words > 0 {
            let claimed = (words[0] & 0x7F_FFFF) as usize;
            if claimed > words.len() {
                spdlog::debug!(
                    "Board {} ch {} garbled header: {:x}/{:x}",
                    self.bid,
                    ch,
                    claimed,
                    words.len()
                );
                return Ok(None);
            }
            channel_words = claimed;
            if channel_words <= header_words {
                spdlog::debug!(
                    "Board {} ch {} empty ({}/{})",
                    self.bid,
                    ch,
                    channel_words,
                    header_words
                );
                return Ok(None);
            }
            let low_bits = (words[1] & CLOCK_MASK) as u64;

            if self.fmt.channel_time_msb_idx == 2 {
                channel_time = (((words[2] & 0xFFFF) as u64) << 32) | low_bits;
                baseline_ch = ((words[2] >> 16) & 0x3FFF) as i16;
            } else {
                // Only 31 time bits in the channel header. Channels within
                // one readout can straddle a rollover, so correct against
                // the packet's header time.
                let mut counter = packet.clock_counter as i64;
                if low_bits > ROLLOVER_HIGH as u64
                    && packet.header_time < ROLLOVER_LOW
                    && counter > 0
                {
                    counter -= 1;
                } else if low_bits < ROLLOVER_LOW as u64 && packet.header_time > ROLLOVER_HIGH {
                    counter += 1;
                }
                channel_time = ((counter as u64) << 31) | low_bits;
            }
        }

        let time_ns = (self.fmt.ns_per_clock * channel_time) as i64;

        // a header nibble inside the payload means the sizes lied
        for w in header_words..channel_words.min(words.len()) {
            if words[w] >> 28 == HEADER_NIBBLE {
                spdlog::debug!("Board {} ch {} corrupted payload", self.bid, ch);
                self.add_fragment(
                    deadtime_fragment(time_ns, self.bid, self.fragment_bytes),
                    time_ns,
                );
                return Ok(None);
            }
        }

        let logical = self
            .map
            .logical(self.bid, ch)
            .ok_or(FormatterError::UnmappedChannel {
                bid: self.bid,
                channel: ch,
            })?;

        let mut samples: Vec<u16> =
            Vec::with_capacity((channel_words - header_words) * 2);
        for word in &words[header_words..channel_words.min(words.len())] {
            samples.push((word & 0xFFFF) as u16);
            samples.push((word >> 16) as u16);
        }
        self.emit_pulse(time_ns, logical, baseline_ch, &samples);

        Ok(Some(channel_words))
    }

    /// Slice one pulse into fragments and bucket them.
    fn emit_pulse(&mut self, time_ns: i64, channel: i16, baseline_ch: i16, samples: &[u16]) {
        let fragment_samples = self.fragment_bytes / 2;
        let pulse_length = samples.len();
        let num_frags = pulse_length.div_ceil(fragment_samples);

        if let Some(&last) = self.last_emitted.get(&channel) {
            debug_assert!(
                time_ns >= last,
                "channel {channel} time went backward: {time_ns} after {last}"
            );
            if time_ns < last {
                spdlog::warn!(
                    "Channel {} went back in time: {} after {}",
                    channel,
                    time_ns,
                    last
                );
            }
        }
        self.last_emitted.insert(channel, time_ns);

        for frag_i in 0..num_frags {
            let lo = frag_i * fragment_samples;
            let hi = (lo + fragment_samples).min(pulse_length);
            let header = FragmentHeader {
                time_ns: time_ns
                    + (frag_i * fragment_samples) as i64 * self.fmt.ns_per_sample as i64,
                length_samples: (hi - lo) as i32,
                sample_interval_ns: self.fmt.ns_per_sample as i16,
                channel,
                pulse_length_samples: pulse_length as i32,
                fragment_index: frag_i as i16,
                baseline_ch,
            };
            let time = header.time_ns;
            let record = encode_fragment(&header, &samples[lo..hi], self.fragment_bytes);
            self.fragments_processed += 1;
            self.add_fragment(record, time);
        }

        let mut per_chan = self.shared.data_per_chan.lock().unwrap();
        *per_chan.entry(channel).or_default() += pulse_length * 2;
    }

    /// Bucket one encoded fragment by chunk, shadowing boundary fragments
    /// into the pre/post buffers.
    fn add_fragment(&mut self, record: Vec<u8>, time_ns: i64) {
        let chunk_id = time_ns / self.full_chunk_length;
        let in_overlap = (chunk_id + 1) * self.full_chunk_length - time_ns <= self.chunk_overlap;

        let buffered: Vec<i64> = self
            .fragments
            .keys()
            .filter_map(|k| Self::key_chunk_id(k))
            .collect();
        if let (Some(&min_chunk), Some(&max_chunk)) =
            (buffered.iter().min(), buffered.iter().max())
        {
            if min_chunk - chunk_id > self.warn_if_chunk_older_than {
                spdlog::warn!(
                    "Board {} got data {} chunks behind the buffer, it might get lost",
                    self.bid,
                    min_chunk - chunk_id
                );
            } else if chunk_id - max_chunk > 2 {
                spdlog::info!("Board {} skipped {} chunk(s)", self.bid, chunk_id - max_chunk - 1);
            }
        }

        self.shared
            .buffered_bytes
            .fetch_add(record.len() * if in_overlap { 3 } else { 1 }, Ordering::Relaxed);
        let key = chunk_key(chunk_id, self.chunk_name_length);
        self.fragments
            .entry(key.clone())
            .or_default()
            .extend_from_slice(&record);
        if in_overlap {
            let post = format!("{key}_post");
            let pre = format!("{}_pre", chunk_key(chunk_id + 1, self.chunk_name_length));
            self.fragments
                .entry(post)
                .or_default()
                .extend_from_slice(&record);
            self.fragments
                .entry(pre)
                .or_default()
                .extend_from_slice(&record);
        }
    }

    fn key_chunk_id(key: &str) -> Option<i64> {
        key.split('_').next().and_then(|s| s.parse().ok())
    }

    /// Hand completed chunks to the sink. Without `force`, a chunk is
    /// complete once the buffer has moved `buffer_chunks` past it.
    fn flush_chunks(&mut self, force: bool) -> Result<(), FormatterError> {
        if self.fragments.is_empty() {
            return Ok(());
        }
        let newest = self
            .fragments
            .keys()
            .filter_map(|k| Self::key_chunk_id(k))
            .max()
            .unwrap_or(0);

        let mut ready: Vec<String> = self
            .fragments
            .keys()
            .filter(|k| {
                force
                    || Self::key_chunk_id(k)
                        .map(|id| newest - id > self.buffer_chunks)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        ready.sort();

        for key in ready {
            if let Some(data) = self.fragments.remove(&key) {
                self.shared
                    .buffered_bytes
                    .fetch_sub(data.len(), Ordering::Relaxed);
                self.sink.receive_chunk(&key, data)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BoardKind;
    use crate::writer::MemorySink;

    struct Decoded {
        time: i64,
        length: i32,
        interval: i16,
        channel: i16,
        pulse_length: i32,
        index: i16,
        samples: Vec<u16>,
    }

    fn decode(chunk: &[u8], payload_bytes: usize) -> Vec<Decoded> {
        let record = 24 + payload_bytes;
        assert_eq!(chunk.len() % record, 0);
        chunk
            .chunks(record)
            .map(|r| Decoded {
                time: i64::from_le_bytes(r[0..8].try_into().unwrap()),
                length: i32::from_le_bytes(r[8..12].try_into().unwrap()),
                interval: i16::from_le_bytes(r[12..14].try_into().unwrap()),
                channel: i16::from_le_bytes(r[14..16].try_into().unwrap()),
                pulse_length: i32::from_le_bytes(r[16..20].try_into().unwrap()),
                index: i16::from_le_bytes(r[20..22].try_into().unwrap()),
                samples: r[24..]
                    .chunks(2)
                    .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
                    .collect(),
            })
            .collect()
    }

    fn test_options() -> Options {
        let mut options = Options::default();
        options.strax_fragment_payload_bytes = 8;
        // chunk buckets every 1000 ns with a 100 ns overlap window
        options.chunk_length_ns = 900;
        options.chunk_overlap_ns = 100;
        options.channel_map.insert(42, (0..8).collect());
        options
    }

    fn make(
        kind: BoardKind,
        options: &Options,
    ) -> (
        StraxFormatter,
        Arc<BoardSlot>,
        Arc<MemorySink>,
        Arc<FormatterShared>,
    ) {
        let slot = Arc::new(BoardSlot::new(42));
        let sink = Arc::new(MemorySink::new());
        let shared = Arc::new(FormatterShared::new());
        let formatter = StraxFormatter::new(
            42,
            kind.data_format(),
            slot.clone(),
            ChannelMap::from_options(options),
            sink.clone(),
            shared.clone(),
            options,
        );
        (formatter, slot, sink, shared)
    }

    #[test]
    fn single_channel_event_splits_into_fragments() {
        let options = test_options();
        let (formatter, slot, sink, shared) = make(BoardKind::V1724Mv, &options);
        slot.push(RawPacket::new(
            42,
            vec![
                0xA000_000A, 0x0000_0001, 0x0000_0000, 0x0000_0064, 0x1000_2000, 0x3000_4000,
                0x5000_6000,
            ],
            0,
            0x64,
        ));
        shared.active.store(false, Ordering::Release);
        let summary = formatter.run().unwrap();

        assert_eq!(summary.events_processed, 1);
        assert_eq!(summary.fragments_processed, 2);
        assert!(slot.is_empty());
        assert_eq!(slot.byte_size(), 0);

        let frags = decode(&sink.chunk("000001").unwrap(), 8);
        assert_eq!(frags.len(), 2);
        assert_eq!(frags[0].time, 1000);
        assert_eq!(frags[0].length, 4);
        assert_eq!(frags[0].interval, 10);
        assert_eq!(frags[0].channel, 0);
        assert_eq!(frags[0].pulse_length, 6);
        assert_eq!(frags[0].index, 0);
        assert_eq!(frags[0].samples, vec![0x2000, 0x1000, 0x4000, 0x3000]);
        assert_eq!(frags[1].time, 1040);
        assert_eq!(frags[1].length, 2);
        assert_eq!(frags[1].pulse_length, 6);
        assert_eq!(frags[1].index, 1);
        assert_eq!(frags[1].samples, vec![0x6000, 0x5000, 0, 0]);
    }

    #[test]
    fn board_fail_bit_emits_artificial_deadtime() {
        let options = test_options();
        let (formatter, slot, sink, shared) = make(BoardKind::V1724Mv, &options);
        slot.push(RawPacket::new(
            42,
            vec![
                0xA000_0008, 0x0400_0001, 0x0000_0000, 0x0000_0064, 0x0101_0101, 0x0101_0101,
                0x0101_0101, 0x0101_0101,
            ],
            0,
            0x64,
        ));
        shared.active.store(false, Ordering::Release);
        formatter.run().unwrap();

        assert_eq!(shared.fail_count.load(Ordering::Relaxed), 1);
        assert!(slot.take_error_check(), "reader should be asked to poll errors");

        let frags = decode(&sink.chunk("000001").unwrap(), 8);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].channel, crate::constants::DEADTIME_CHANNEL);
        assert_eq!(frags[0].time, 1000);
        // board id is stamped into the payload
        assert_eq!(frags[0].samples[0], 42);
    }

    #[test]
    fn overlap_fragments_shadow_into_pre_and_post() {
        let options = test_options();
        let (formatter, slot, sink, shared) = make(BoardKind::V1724Mv, &options);
        // event at 1500 ns is cleanly inside chunk 1
        slot.push(RawPacket::new(
            42,
            vec![0xA000_0005, 0x1, 0, 150, 0x0002_0002],
            0,
            150,
        ));
        // event at 1950 ns sits in the last 100 ns of chunk 1
        slot.push(RawPacket::new(
            42,
            vec![0xA000_0005, 0x1, 0, 195, 0x0001_0001],
            0,
            195,
        ));
        shared.active.store(false, Ordering::Release);
        formatter.run().unwrap();

        assert_eq!(
            sink.keys(),
            vec!["000001", "000001_post", "000002_pre"]
        );
        let post = sink.chunk("000001_post").unwrap();
        let pre = sink.chunk("000002_pre").unwrap();
        assert_eq!(post, pre, "post and pre shadows must match byte for byte");
        let shadows = decode(&post, 8);
        assert_eq!(shadows.len(), 1);
        assert_eq!(shadows[0].time, 1950);

        let plain = decode(&sink.chunk("000001").unwrap(), 8);
        let times: Vec<i64> = plain.iter().map(|f| f.time).collect();
        assert!(times.contains(&1950) && times.contains(&1500));
    }

    #[test]
    fn daw_channel_header_sets_time_and_payload() {
        let mut options = test_options();
        options.channel_map.insert(42, (10..18).collect());
        let (formatter, slot, sink, shared) = make(BoardKind::V1724, &options);
        // one channel: 2 header words + 2 payload words
        slot.push(RawPacket::new(
            42,
            vec![
                0xA000_0008,
                0x0000_0001,
                0x0000_0000,
                0x0000_0064,
                0x0000_0004, // channel_words
                0x0000_0080, // channel time
                0x1111_2222,
                0x3333_4444,
            ],
            0,
            0x64,
        ));
        shared.active.store(false, Ordering::Release);
        formatter.run().unwrap();

        let frags = decode(&sink.chunk("000001").unwrap(), 8);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].time, 0x80 * 10);
        assert_eq!(frags[0].channel, 10);
        assert_eq!(frags[0].pulse_length, 4);
        assert_eq!(frags[0].samples, vec![0x2222, 0x1111, 0x4444, 0x3333]);
    }

    #[test]
    fn channel_rollover_skew_is_corrected() {
        let options = test_options();
        let (mut formatter, _slot, _sink, _shared) = make(BoardKind::V1724, &options);
        // header already rolled over (counter 1, early header time) but this
        // channel's stamp is still from before the rollover
        let packet = RawPacket::new(
            42,
            vec![
                0xA000_0008,
                0x0000_0001,
                0x0000_0000,
                0x0000_0010,
                0x0000_0004,
                1_600_000_000u32,
                0x0101_0101,
                0x0202_0202,
            ],
            1,
            0x10,
        );
        formatter.process_packet(packet).unwrap();
        // counter corrected back to 0: time is just the channel stamp
        assert_eq!(
            formatter.last_emitted.get(&0).copied(),
            Some(1_600_000_000i64 * 10)
        );

        // and the opposite skew: channel rolled first
        let (mut formatter, _slot, _sink, _shared) = make(BoardKind::V1724, &options);
        let packet = RawPacket::new(
            42,
            vec![
                0xA000_0008,
                0x0000_0001,
                0x0000_0000,
                1_600_000_000u32 & 0x7FFF_FFFF,
                0x0000_0004,
                0x0000_0010,
                0x0101_0101,
                0x0202_0202,
            ],
            1,
            1_600_000_000,
        );
        formatter.process_packet(packet).unwrap();
        let expected = ((2u64 << 31) | 0x10) as i64 * 10;
        assert_eq!(formatter.last_emitted.get(&0).copied(), Some(expected));
    }

    #[test]
    fn corrupted_payload_becomes_deadtime() {
        let options = test_options();
        let (formatter, slot, sink, shared) = make(BoardKind::V1724, &options);
        slot.push(RawPacket::new(
            42,
            vec![
                0xA000_000C,
                0x0000_0003, // two channels
                0x0000_0000,
                0x0000_0064,
                0x0000_0004,
                0x0000_0080,
                0xA111_1111, // header nibble inside the payload
                0x2222_2222,
                0x0000_0004,
                0x0000_0090,
                0x0303_0303,
                0x0404_0404,
            ],
            0,
            0x64,
        ));
        shared.active.store(false, Ordering::Release);
        let summary = formatter.run().unwrap();

        // second channel is skipped along with the rest of the event
        let frags = decode(&sink.chunk("000001").unwrap(), 8);
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].channel, crate::constants::DEADTIME_CHANNEL);
        assert_eq!(summary.events_processed, 1);
        assert_eq!(shared.fail_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unmapped_channel_aborts_the_formatter() {
        let mut options = test_options();
        options.channel_map.clear();
        let (formatter, slot, _sink, shared) = make(BoardKind::V1724Mv, &options);
        slot.push(RawPacket::new(
            42,
            vec![0xA000_0005, 0x1, 0, 100, 0x0001_0001],
            0,
            100,
        ));
        shared.active.store(false, Ordering::Release);
        let result = formatter.run();
        assert!(matches!(
            result,
            Err(FormatterError::UnmappedChannel { bid: 42, channel: 0 })
        ));
        assert!(shared.error.load(Ordering::Acquire));
    }

    #[test]
    fn chunks_flush_in_arrival_order() {
        let options = test_options();
        let (mut formatter, _slot, sink, _shared) = make(BoardKind::V1724Mv, &options);
        for event_time in [50u32, 500, 650] {
            let packet = RawPacket::new(
                42,
                vec![0xA000_0005, 0x1, 0, event_time, 0x0001_0001],
                0,
                event_time,
            );
            formatter.process_packet(packet).unwrap();
        }
        // newest chunk is 6; only chunks more than buffer_chunks behind close
        formatter.flush_chunks(false).unwrap();
        assert_eq!(sink.keys(), vec!["000000"]);
        formatter.flush_chunks(true).unwrap();
        assert_eq!(sink.keys(), vec!["000000", "000005", "000006"]);
    }

    #[test]
    fn single_buffer_mode_processes_packet_by_packet() {
        let mut options = test_options();
        options.buffer_type = BufferType::Single;
        let (formatter, slot, sink, shared) = make(BoardKind::V1724Mv, &options);
        for event_time in [100u32, 200] {
            slot.push(RawPacket::new(
                42,
                vec![0xA000_0005, 0x1, 0, event_time, 0x0001_0001],
                0,
                event_time,
            ));
        }
        shared.active.store(false, Ordering::Release);
        let summary = formatter.run().unwrap();
        assert_eq!(summary.data_packets, 2);
        assert_eq!(summary.fragments_processed, 2);
        assert_eq!(decode(&sink.chunk("000001").unwrap(), 8).len(), 1);
        assert_eq!(decode(&sink.chunk("000002").unwrap(), 8).len(), 1);
    }

    #[test]
    fn empty_and_garbage_words_are_skipped() {
        let options = test_options();
        let (formatter, slot, sink, shared) = make(BoardKind::V1724Mv, &options);
        slot.push(RawPacket::new(
            42,
            vec![0x1234_5678, 0xA000_0004, 0x0, 0x0, 0x0, 0x7FFF_FFFF],
            0,
            0,
        ));
        shared.active.store(false, Ordering::Release);
        let summary = formatter.run().unwrap();
        assert_eq!(summary.fragments_processed, 0);
        assert!(sink.keys().is_empty());
        assert_eq!(summary.data_packets, 1);
    }
}
