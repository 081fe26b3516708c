use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::constants::WORD_BYTES;

/// One board's worth of raw data between the link reader and its formatter.
///
/// Created by the reader, consumed by the formatter, dropped after parsing.
/// `buff` is non-empty exactly when `size_bytes` is nonzero.
#[derive(Debug)]
pub struct RawPacket {
    pub bid: i32,
    pub buff: Vec<u32>,
    pub size_bytes: usize,
    pub clock_counter: u32,
    pub header_time: u32,
}

impl RawPacket {
    pub fn new(bid: i32, buff: Vec<u32>, clock_counter: u32, header_time: u32) -> Self {
        let size_bytes = buff.len() * WORD_BYTES;
        RawPacket {
            bid,
            buff,
            size_bytes,
            clock_counter,
            header_time,
        }
    }
}

/// Per-board buffer slot: the bounded FIFO between one link reader and one
/// formatter, with its own mutex and mirror counters.
///
/// The mutex covers the queue and keeps the counters consistent with its
/// contents; the atomics let status queries read sizes without taking the
/// lock. `check_error` is the formatter's request that the reader poll the
/// board's error register on its next round.
#[derive(Debug, Default)]
pub struct BoardSlot {
    bid: i32,
    queue: Mutex<VecDeque<RawPacket>>,
    bytes: AtomicUsize,
    length: AtomicUsize,
    check_error: AtomicBool,
}

impl BoardSlot {
    pub fn new(bid: i32) -> Self {
        BoardSlot {
            bid,
            ..Default::default()
        }
    }

    pub fn bid(&self) -> i32 {
        self.bid
    }

    pub fn push(&self, packet: RawPacket) {
        let mut queue = self.queue.lock().unwrap();
        self.bytes.fetch_add(packet.size_bytes, Ordering::Relaxed);
        self.length.fetch_add(1, Ordering::Relaxed);
        queue.push_back(packet);
    }

    /// Pop one packet (single-buffer consumption mode).
    pub fn pop(&self) -> Option<RawPacket> {
        if self.length.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let mut queue = self.queue.lock().unwrap();
        let packet = queue.pop_front()?;
        self.bytes.fetch_sub(packet.size_bytes, Ordering::Relaxed);
        self.length.fetch_sub(1, Ordering::Relaxed);
        Some(packet)
    }

    /// Take the whole queue in one swap (dual-buffer consumption mode).
    pub fn drain(&self) -> VecDeque<RawPacket> {
        if self.length.load(Ordering::Relaxed) == 0 {
            return VecDeque::new();
        }
        let mut queue = self.queue.lock().unwrap();
        let taken = std::mem::take(&mut *queue);
        self.bytes.store(0, Ordering::Relaxed);
        self.length.store(0, Ordering::Relaxed);
        taken
    }

    /// Discard everything buffered, returning how many packets were lost.
    pub fn clear(&self) -> usize {
        self.drain().len()
    }

    pub fn byte_size(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.length.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn request_error_check(&self) {
        self.check_error.store(true, Ordering::Release);
    }

    /// Consume a pending error-check request, if any.
    pub fn take_error_check(&self) -> bool {
        self.check_error.swap(false, Ordering::AcqRel)
    }
}
