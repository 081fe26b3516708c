use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::board_queue::RawPacket;
use super::constants::{ERR_PLL_UNLOCK, ERR_VME_BUS};
use super::registry::LinkGroup;

/// Rounds between acquisition-status samples in the log.
const STATUS_EVERY: u32 = 10_000;

/// The hot read loop for one optical link.
///
/// Round-robins the link's boards, pulls block transfers and hands stamped
/// packets to each board's slot. Never waits on the consumers: the boards
/// overflow their onboard memory if they are not drained promptly, so the
/// only pacing is a microsecond between rounds.
pub struct LinkReader {
    group: LinkGroup,
    run_flag: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    data_rate: Arc<AtomicUsize>,
}

impl LinkReader {
    pub fn new(
        group: LinkGroup,
        run_flag: Arc<AtomicBool>,
        running: Arc<AtomicBool>,
        data_rate: Arc<AtomicUsize>,
    ) -> Self {
        LinkReader {
            group,
            run_flag,
            running,
            data_rate,
        }
    }

    /// Read until the run flag clears. Returns the link group so the
    /// controller can stop the boards afterwards.
    pub fn run(mut self) -> LinkGroup {
        for slot in self.group.slots.iter() {
            let stale = slot.clear();
            if stale > 0 {
                spdlog::debug!(
                    "Board {}: {} stale packets brute force cleared",
                    slot.bid(),
                    stale
                );
                self.data_rate.store(0, Ordering::Relaxed);
            }
        }

        self.running.store(true, Ordering::Release);
        let mut readcycler: u32 = 0;
        while self.run_flag.load(Ordering::Acquire) {
            for (digi, slot) in self.group.digis.iter_mut().zip(self.group.slots.iter()) {
                if readcycler % STATUS_EVERY == 0 {
                    readcycler = 0;
                    match digi.acquisition_status() {
                        Ok(status) => {
                            spdlog::debug!("Board {} has status 0x{:04x}", digi.bid(), status)
                        }
                        Err(e) => spdlog::warn!("Board {} status read failed: {}", digi.bid(), e),
                    }
                }
                if slot.take_error_check() {
                    match digi.check_errors() {
                        Ok(mask) => {
                            if mask & ERR_PLL_UNLOCK != 0 {
                                spdlog::warn!("Board {} has PLL unlock", digi.bid());
                            }
                            if mask & ERR_VME_BUS != 0 {
                                spdlog::warn!("Board {} has VME bus error", digi.bid());
                            }
                        }
                        Err(e) => spdlog::warn!("{}", e),
                    }
                }
                let words = match digi.read_mblt() {
                    Ok(words) => words,
                    Err(e) => {
                        spdlog::warn!("Board {} readout error: {}", digi.bid(), e);
                        break;
                    }
                };
                if !words.is_empty() {
                    let header_time = digi.header_time(&words);
                    let clock_counter = digi.clock_counter(header_time);
                    let packet = RawPacket::new(digi.bid(), words, clock_counter, header_time);
                    self.data_rate.fetch_add(packet.size_bytes, Ordering::Relaxed);
                    slot.push(packet);
                }
            }
            readcycler += 1;
            thread::sleep(Duration::from_micros(1));
        }
        self.running.store(false, Ordering::Release);
        spdlog::debug!("Readout thread for link {} returning", self.group.link);
        self.group
    }
}
