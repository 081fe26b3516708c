use fxhash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::baseline::{self, CalMap, FitTiming};
use super::channel_map::ChannelMap;
use super::config::{BaselineMode, DacCalibrationStore, Options};
use super::error::{BaselineError, ControllerError, FormatterError};
use super::formatter::{FormatterShared, FormatterSummary, StraxFormatter};
use super::readout::LinkReader;
use super::registry::{BoardRegistry, LinkGroup};
use super::vme::VmeFactory;
use super::writer::ChunkSink;

/// How long the readers get to wind down after the run flag clears.
const READER_WAIT: Duration = Duration::from_millis(100);
const READER_WAIT_ROUNDS: u32 = 10;
/// How long the formatters get to drain before being force-quit.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);
const POLL_TRIES: u32 = 1000;
const POLL_SLEEP_MS: u64 = 1;

/// Controller states, driven by the orchestrator's commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    Arming,
    Armed,
    Running,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Arming => "arming",
            Status::Armed => "armed",
            Status::Running => "running",
            Status::Error => "error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct ReaderHandle {
    link: u8,
    running: Arc<AtomicBool>,
    join: JoinHandle<LinkGroup>,
}

struct FormatterHandle {
    bid: i32,
    shared: Arc<FormatterShared>,
    join: JoinHandle<Result<FormatterSummary, FormatterError>>,
}

/// The status document returned to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub host: String,
    pub status: String,
    pub run_mode: String,
    /// Raw packets buffered between readers and formatters.
    pub buffer_length: usize,
    /// Bytes buffered in unflushed chunk buffers.
    pub buffer_size: usize,
    /// Bytes read from the boards since the last poll.
    pub rate_bytes: usize,
    /// Bytes per logical channel since the last poll.
    pub channel_rates: BTreeMap<i16, usize>,
}

/// The host-level state machine: owns the boards, the reader and formatter
/// threads and the transitions the orchestrator drives.
pub struct DaqController {
    hostname: String,
    vme_factory: VmeFactory,
    sink: Arc<dyn ChunkSink>,
    cal_store_path: Option<PathBuf>,
    fit_timing: FitTiming,
    status: Status,
    options: Option<Arc<Options>>,
    registry: Option<BoardRegistry>,
    run_flag: Arc<AtomicBool>,
    readers: Vec<ReaderHandle>,
    formatters: Vec<FormatterHandle>,
    data_rate: Arc<AtomicUsize>,
}

impl DaqController {
    pub fn new(hostname: String, vme_factory: VmeFactory, sink: Arc<dyn ChunkSink>) -> Self {
        DaqController {
            hostname,
            vme_factory,
            sink,
            cal_store_path: None,
            fit_timing: FitTiming::default(),
            status: Status::Idle,
            options: None,
            registry: None,
            run_flag: Arc::new(AtomicBool::new(false)),
            readers: Vec::new(),
            formatters: Vec::new(),
            data_rate: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Where cached DAC calibrations are read and fit results written.
    pub fn with_cal_store(mut self, path: PathBuf) -> Self {
        self.cal_store_path = Some(path);
        self
    }

    /// Override the fit waits, for simulated boards.
    pub fn with_fit_timing(mut self, timing: FitTiming) -> Self {
        self.fit_timing = timing;
        self
    }

    pub fn status(&mut self) -> Status {
        self.elevate_errors();
        self.status
    }

    pub fn run_mode(&self) -> String {
        self.options
            .as_ref()
            .map(|o| o.name.clone())
            .unwrap_or_else(|| String::from("none"))
    }

    /// Idle -> Arming -> Armed: build the digitizers, baseline every link
    /// in parallel and program the run mode.
    pub fn arm(&mut self, options: Options) -> Result<(), ControllerError> {
        if self.status != Status::Idle {
            return Err(ControllerError::BadTransition("arm", self.status.as_str()));
        }
        self.status = Status::Arming;
        options.validate()?;
        let options = Arc::new(options);
        if let Some(requested) = options.processing_threads.get(&self.hostname) {
            spdlog::debug!(
                "Config requests {} processing threads; running one per board ({})",
                requested,
                options.boards.len()
            );
        }

        let mut registry = match BoardRegistry::build(&options, &self.vme_factory) {
            Ok(registry) => registry,
            Err(e) => {
                self.status = Status::Idle;
                return Err(e.into());
            }
        };

        let mut cal_map = CalMap::default();
        if options.baseline_dac_mode == BaselineMode::Cached {
            if let Some(path) = &self.cal_store_path {
                match DacCalibrationStore::load(path) {
                    Ok(store) => cal_map = store.boards,
                    Err(e) => {
                        self.status = Status::Idle;
                        return Err(e.into());
                    }
                }
            }
        }
        let cal_values = Mutex::new(cal_map);

        // program all links in parallel; baselining is the slow part
        let results: Vec<(u8, Result<(), BaselineError>)> = thread::scope(|s| {
            let mut handles = Vec::new();
            for group in registry.links_mut() {
                let link = group.link;
                let digis = &mut group.digis;
                let opts = options.as_ref();
                let cal = &cal_values;
                let timing = &self.fit_timing;
                handles.push((
                    link,
                    s.spawn(move || baseline::init_link_with_timing(digis, opts, cal, timing)),
                ));
            }
            handles
                .into_iter()
                .map(|(link, handle)| (link, handle.join().unwrap()))
                .collect()
        });

        let mut worst: Option<BaselineError> = None;
        for (link, result) in results {
            if let Err(e) = result {
                spdlog::warn!("Errors during baselining on link {}: {}", link, e);
                let replace = match &worst {
                    Some(BaselineError::Hardware(_)) => false,
                    Some(_) => matches!(e, BaselineError::Hardware(_)),
                    None => true,
                };
                if replace {
                    worst = Some(e);
                }
            }
        }
        if let Some(e) = worst {
            self.status = if matches!(e, BaselineError::Hardware(_)) {
                Status::Error
            } else {
                Status::Idle
            };
            return Err(e.into());
        }

        if options.baseline_dac_mode == BaselineMode::Fit {
            if let Some(path) = &self.cal_store_path {
                let store = DacCalibrationStore {
                    boards: cal_values.into_inner().unwrap(),
                };
                if let Err(e) = store.save(path) {
                    spdlog::warn!("Could not persist DAC calibrations: {}", e);
                }
            }
        }

        let hardware_start = options.hardware_start();
        if let Err(e) = registry.for_each_digi(|digi| {
            if hardware_start {
                digi.sin_start()
            } else {
                digi.acquisition_stop()
            }
        }) {
            self.status = Status::Error;
            return Err(e.into());
        }

        self.options = Some(options);
        self.registry = Some(registry);
        self.status = Status::Armed;
        spdlog::info!("Arm command finished, returning to main loop");
        Ok(())
    }

    /// Armed -> Running: start the boards if in software mode and spawn the
    /// reader and formatter threads.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.status != Status::Armed {
            return Err(ControllerError::BadTransition("start", self.status.as_str()));
        }
        let options = self.options.clone().expect("armed without options");
        let registry = self.registry.as_mut().expect("armed without boards");

        if !options.hardware_start() {
            registry.for_each_digi(|digi| {
                let bid = digi.bid();
                if !digi.ensure_ready(POLL_TRIES, POLL_SLEEP_MS)? {
                    spdlog::warn!("Digitizer {} not ready to start", bid);
                    return Err(super::error::DigitizerError::ControlTimeout(
                        bid,
                        "become ready",
                    ));
                }
                digi.software_start()?;
                if !digi.ensure_started(POLL_TRIES, POLL_SLEEP_MS)? {
                    spdlog::warn!("Timed out waiting for board {} to start", bid);
                    return Err(super::error::DigitizerError::ControlTimeout(bid, "start"));
                }
                Ok(())
            })?;
        }

        let map = ChannelMap::from_options(&options);
        if map.is_empty() {
            spdlog::warn!("No channel map configured; any data will abort the formatters");
        }
        for bid in registry.bids() {
            let shared = Arc::new(FormatterShared::new());
            let formatter = StraxFormatter::new(
                bid,
                registry.data_format(bid).expect("registered board"),
                registry.slot(bid).expect("registered board"),
                map.clone(),
                self.sink.clone(),
                shared.clone(),
                &options,
            );
            let join = thread::spawn(move || formatter.run());
            self.formatters.push(FormatterHandle { bid, shared, join });
        }

        self.run_flag.store(true, Ordering::Release);
        for group in registry.take_links() {
            let running = Arc::new(AtomicBool::new(false));
            let link = group.link;
            let reader = LinkReader::new(
                group,
                self.run_flag.clone(),
                running.clone(),
                self.data_rate.clone(),
            );
            let join = thread::spawn(move || reader.run());
            self.readers.push(ReaderHandle {
                link,
                running,
                join,
            });
        }

        self.status = Status::Running;
        Ok(())
    }

    /// Running -> Idle: wind the readers down, stop the boards, drain and
    /// close the formatters.
    pub fn stop(&mut self) -> Result<(), ControllerError> {
        if self.status != Status::Running {
            return Err(ControllerError::BadTransition("stop", self.status.as_str()));
        }
        self.run_flag.store(false, Ordering::Release);

        let mut rounds = 0;
        while self.readers.iter().any(|r| r.running.load(Ordering::Acquire))
            && rounds < READER_WAIT_ROUNDS
        {
            thread::sleep(READER_WAIT);
            rounds += 1;
        }
        if rounds >= READER_WAIT_ROUNDS {
            spdlog::debug!("Boards taking a while to clear");
        }

        let stop_result = {
            let registry = self.registry.as_mut().expect("running without boards");
            let mut groups = Vec::new();
            for handle in self.readers.drain(..) {
                match handle.join.join() {
                    Ok(group) => groups.push(group),
                    Err(_) => spdlog::error!("Reader for link {} panicked", handle.link),
                }
            }
            registry.restore_links(groups);

            let stop_result = registry.for_each_digi(|digi| {
                digi.acquisition_stop()?;
                if !digi.ensure_stopped(POLL_TRIES, POLL_SLEEP_MS)? {
                    spdlog::warn!(
                        "Timed out waiting for acquisition to stop on board {}",
                        digi.bid()
                    );
                    return Err(super::error::DigitizerError::ControlTimeout(
                        digi.bid(),
                        "stop",
                    ));
                }
                Ok(())
            });
            spdlog::debug!("Stopped digitizers");
            stop_result
        };

        let close_result = self.close_formatters();

        let lost: usize = self
            .registry
            .as_ref()
            .map(|r| r.slots().map(|slot| slot.clear()).sum())
            .unwrap_or(0);
        if lost > 0 {
            spdlog::warn!("Deleting {} uncleared packets at end of run", lost);
        }
        self.data_rate.store(0, Ordering::Relaxed);

        if close_result.is_err() {
            self.status = Status::Error;
            return close_result;
        }
        match stop_result {
            Ok(()) => {
                self.status = Status::Idle;
                Ok(())
            }
            Err(e) => {
                // a board refusing to stop is hardware trouble
                self.status = Status::Error;
                Err(e.into())
            }
        }
    }

    /// Two-stage formatter close: drain, then force-quit past the deadline.
    fn close_formatters(&mut self) -> Result<(), ControllerError> {
        for handle in self.formatters.iter() {
            handle.shared.active.store(false, Ordering::Release);
        }
        let deadline = Instant::now() + DRAIN_DEADLINE;
        while self
            .formatters
            .iter()
            .any(|f| f.shared.running.load(Ordering::Acquire))
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(10));
        }
        for handle in self.formatters.iter() {
            if handle.shared.running.load(Ordering::Acquire) {
                spdlog::warn!("Force-quitting formatter for board {}", handle.bid);
                handle.shared.force_quit.store(true, Ordering::Release);
            }
        }

        let mut board_fails: FxHashMap<i32, usize> = FxHashMap::default();
        let mut lost_packets = 0usize;
        let mut failure: Option<ControllerError> = None;
        for handle in self.formatters.drain(..) {
            let shared = handle.shared.clone();
            match handle.join.join() {
                Ok(Ok(summary)) => {
                    spdlog::debug!(
                        "Board {} processed {} fragments",
                        summary.bid,
                        summary.fragments_processed
                    );
                }
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e.into());
                    }
                }
                Err(_) => spdlog::error!("Formatter for board {} panicked", handle.bid),
            }
            let fails = shared.fail_count.load(Ordering::Relaxed);
            if fails > 0 {
                board_fails.insert(handle.bid, fails);
            }
            lost_packets += shared.lost_packets.load(Ordering::Relaxed);
        }
        if !board_fails.is_empty() {
            let mut msg = String::from("Found board failures: ");
            for (bid, count) in board_fails.iter() {
                msg.push_str(&format!("{bid}:{count} | "));
            }
            spdlog::warn!("{}", msg);
        }
        if lost_packets > 0 {
            spdlog::warn!("{} packets lost in shutdown", lost_packets);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// External reset: tear everything down and return to Idle. The only
    /// way out of the Error state.
    pub fn reset(&mut self) {
        self.run_flag.store(false, Ordering::Release);
        for handle in self.readers.drain(..) {
            let _ = handle.join.join();
        }
        for handle in self.formatters.iter() {
            handle.shared.active.store(false, Ordering::Release);
            handle.shared.force_quit.store(true, Ordering::Release);
        }
        for handle in self.formatters.drain(..) {
            let _ = handle.join.join();
        }
        if let Some(registry) = self.registry.as_mut() {
            let lost: usize = registry.slots().map(|slot| slot.clear()).sum();
            if lost > 0 {
                spdlog::warn!("Deleting {} uncleared packets in reset", lost);
            }
        }
        self.registry = None;
        self.options = None;
        self.data_rate.store(0, Ordering::Relaxed);
        self.status = Status::Idle;
        spdlog::info!("Controller reset to idle");
    }

    /// Raise Error if any worker flagged one since the last poll.
    fn elevate_errors(&mut self) {
        if self.status == Status::Error {
            return;
        }
        if self
            .formatters
            .iter()
            .any(|f| f.shared.error.load(Ordering::Acquire))
        {
            spdlog::error!("Error found in processing thread");
            self.status = Status::Error;
        }
    }

    /// Snapshot for the orchestrator. Reading resets the rate counters.
    pub fn status_report(&mut self) -> StatusReport {
        self.elevate_errors();
        let mut channel_rates_raw = FxHashMap::default();
        for handle in self.formatters.iter() {
            handle.shared.drain_channel_rates(&mut channel_rates_raw);
        }
        StatusReport {
            host: self.hostname.clone(),
            status: self.status.to_string(),
            run_mode: self.run_mode(),
            buffer_length: self
                .registry
                .as_ref()
                .map(|r| r.buffered_packets())
                .unwrap_or(0),
            buffer_size: self
                .formatters
                .iter()
                .map(|f| f.shared.buffered_bytes.load(Ordering::Relaxed))
                .sum(),
            rate_bytes: self.data_rate.swap(0, Ordering::Relaxed),
            channel_rates: channel_rates_raw.into_iter().collect(),
        }
    }
}

impl Drop for DaqController {
    fn drop(&mut self) {
        if !self.readers.is_empty() || !self.formatters.is_empty() {
            self.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoardKind, BoardSpec};
    use crate::constants::HEADER_NIBBLE;
    use crate::sim::SimBoard;
    use crate::writer::MemorySink;

    fn setup(
        bids: &[(i32, u8)],
    ) -> (
        DaqController,
        FxHashMap<i32, SimBoard>,
        Arc<MemorySink>,
        Options,
    ) {
        let mut sims: FxHashMap<i32, SimBoard> = FxHashMap::default();
        let mut options = Options::default();
        for &(bid, link) in bids {
            sims.insert(bid, SimBoard::new(8).with_response(0.25, 200.0));
            options.boards.push(BoardSpec {
                bid,
                link,
                crate_num: 0,
                vme_address: 0,
                kind: BoardKind::V1724Mv,
            });
            options.channel_map.insert(bid, (0..8).collect());
        }
        let for_factory = sims.clone();
        let factory: VmeFactory =
            Box::new(move |spec| Ok(Box::new(for_factory[&spec.bid].clone())));
        let sink = Arc::new(MemorySink::new());
        let controller = DaqController::new(String::from("testhost"), factory, sink.clone())
            .with_fit_timing(FitTiming::immediate());
        (controller, sims, sink, options)
    }

    fn wait_until<F: FnMut() -> bool>(mut cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn arm_start_stop_round_trip() {
        let (mut controller, sims, sink, options) = setup(&[(100, 0), (101, 1)]);

        controller.arm(options).unwrap();
        assert_eq!(controller.status(), Status::Armed);
        assert_eq!(sims[&100].dac(0), 0x0FA0);
        assert!(!sims[&100].is_running(), "armed in stop state before start");

        controller.start().unwrap();
        assert_eq!(controller.status(), Status::Running);
        assert!(sims[&100].is_running() && sims[&101].is_running());

        // one small event on board 100, channel 0
        sims[&100].push_words(&[(HEADER_NIBBLE << 28) | 5, 0x1, 0, 100, 0x0001_0001]);
        let mut seen_channel_bytes = 0;
        wait_until(|| {
            let report = controller.status_report();
            seen_channel_bytes += report.channel_rates.get(&0).copied().unwrap_or(0);
            seen_channel_bytes > 0 && report.buffer_size > 0
        });
        assert_eq!(seen_channel_bytes, 4);

        controller.stop().unwrap();
        assert_eq!(controller.status(), Status::Idle);
        assert!(!sims[&100].is_running());

        let chunk = sink.chunk("000000").expect("fragment flushed at close");
        assert_eq!(chunk.len(), 24 + 220);

        let report = controller.status_report();
        assert_eq!(report.buffer_length, 0);
        assert_eq!(report.buffer_size, 0);
        assert_eq!(report.host, "testhost");
        assert_eq!(report.status, "idle");
    }

    #[test]
    fn transitions_are_guarded() {
        let (mut controller, _sims, _sink, options) = setup(&[(100, 0)]);
        assert!(matches!(
            controller.start(),
            Err(ControllerError::BadTransition("start", "idle"))
        ));
        assert!(matches!(
            controller.stop(),
            Err(ControllerError::BadTransition("stop", "idle"))
        ));
        controller.arm(options.clone()).unwrap();
        assert!(matches!(
            controller.arm(options),
            Err(ControllerError::BadTransition("arm", "armed"))
        ));
    }

    #[test]
    fn unconverged_baselines_return_to_idle() {
        let (mut controller, sims, _sink, mut options) = setup(&[(100, 0)]);
        options.baseline_dac_mode = BaselineMode::Fit;
        sims[&100].inject_short_reads(1_000);
        let result = controller.arm(options);
        assert!(matches!(
            result,
            Err(ControllerError::Baseline(BaselineError::Unconverged))
        ));
        assert_eq!(controller.status(), Status::Idle);
    }

    #[test]
    fn hardware_fault_during_arm_is_sticky_until_reset() {
        let (mut controller, sims, _sink, mut options) = setup(&[(100, 0)]);
        options.baseline_dac_mode = BaselineMode::Fit;
        sims[&100].fail_next_blt();
        let result = controller.arm(options.clone());
        assert!(matches!(
            result,
            Err(ControllerError::Baseline(BaselineError::Hardware(_)))
        ));
        assert_eq!(controller.status(), Status::Error);

        // only an external reset leaves Error
        assert!(controller.arm(options.clone()).is_err());
        controller.reset();
        assert_eq!(controller.status(), Status::Idle);
        controller.arm(options).unwrap();
    }

    #[test]
    fn fit_results_land_in_the_cal_store() {
        let dir = std::env::temp_dir().join("straxdaq_cal_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("dac_cal.yaml");
        let _ = std::fs::remove_file(&path);

        let (controller, _sims, sink, mut options) = setup(&[(100, 0)]);
        drop(controller);
        let for_factory = _sims.clone();
        let factory: VmeFactory =
            Box::new(move |spec| Ok(Box::new(for_factory[&spec.bid].clone())));
        let mut controller = DaqController::new(String::from("testhost"), factory, sink)
            .with_fit_timing(FitTiming::immediate())
            .with_cal_store(path.clone());

        options.baseline_dac_mode = BaselineMode::Fit;
        controller.arm(options).unwrap();
        assert_eq!(controller.status(), Status::Armed);

        let store = DacCalibrationStore::load(&path).unwrap();
        let cal = store.for_board(100).unwrap();
        assert!((cal.slope[0] - 0.25).abs() < 1e-6);
        assert!((cal.yint[0] - 200.0).abs() < 1e-3);
        let _ = std::fs::remove_file(&path);
    }
}
