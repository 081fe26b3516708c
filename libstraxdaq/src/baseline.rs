//! Drives each channel's DC offset until the pedestal sits on the
//! configured target.
//!
//! One calibration runs per optical link, against all boards on that link
//! at once since they share the transfer bandwidth anyway. Three modes:
//! `fixed` writes a constant, `cached` applies a stored linear calibration,
//! `fit` measures the DAC response and closes the loop on live pedestals.

use fxhash::FxHashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use super::config::{BaselineMode, DacCalibration, Options};
use super::constants::{HEADER_NIBBLE, HEADER_ONLY_BYTES, WORD_BYTES};
use super::digitizer::Digitizer;
use super::error::{BaselineError, DigitizerError};
use super::registers::DataFormat;

const MAX_ITERATIONS: usize = 2;
const MAX_STEPS: usize = 20;
const TRIGGERS_PER_STEP: usize = 3;
const ADJUSTMENT_THRESHOLD: f64 = 10.0;
const CONVERGENCE_THRESHOLD: i32 = 3;
const MIN_ADJUSTMENT: i32 = 0x0A;
/// Histogram rebinning, log base 2.
const REBIN_FACTOR: u32 = 1;
const NBINS: usize = 1 << (14 - REBIN_FACTOR);
const BINS_AROUND_MAX: usize = 3;
const FRACTION_AROUND_MAX: f64 = 0.8;
const MAX_REPEATED_STEPS: usize = 10;
const DAC_CAL_POINTS: [u16; 3] = [60_000, 30_000, 6_000];
const POLL_TRIES: u32 = 1000;
const POLL_SLEEP_MS: u64 = 1;

/// Shared slope/intercept store, written per-link during fits.
pub type CalMap = FxHashMap<i32, DacCalibration>;

/// Waits between the hardware phases of a fit step. Production values per
/// the digitizer documentation; tests shrink them.
#[derive(Debug, Clone)]
pub struct FitTiming {
    pub dac_settle: Duration,
    pub post_start: Duration,
    pub trigger_spacing: Duration,
    pub post_stop: Duration,
}

impl Default for FitTiming {
    fn default() -> Self {
        FitTiming {
            // the DAC output needs a moment to stabilize after a write
            dac_settle: Duration::from_secs(1),
            post_start: Duration::from_millis(5),
            trigger_spacing: Duration::from_millis(10),
            post_stop: Duration::from_millis(1),
        }
    }
}

impl FitTiming {
    /// No waiting, for simulated boards.
    pub fn immediate() -> Self {
        FitTiming {
            dac_settle: Duration::ZERO,
            post_start: Duration::ZERO,
            trigger_spacing: Duration::ZERO,
            post_stop: Duration::ZERO,
        }
    }
}

/// Program every board on one link: baseline DACs per the configured mode,
/// then user registers and thresholds.
pub fn init_link(
    digis: &mut [Digitizer],
    options: &Options,
    cal_values: &Mutex<CalMap>,
) -> Result<(), BaselineError> {
    init_link_with_timing(digis, options, cal_values, &FitTiming::default())
}

pub fn init_link_with_timing(
    digis: &mut [Digitizer],
    options: &Options,
    cal_values: &Mutex<CalMap>,
    timing: &FitTiming,
) -> Result<(), BaselineError> {
    let target = options.baseline_value;
    let mut dac_values: FxHashMap<i32, Vec<u16>> = FxHashMap::default();

    match options.baseline_dac_mode {
        BaselineMode::Fit => {
            dac_values = fit_baselines(digis, target, cal_values, timing)?;
        }
        BaselineMode::Cached => {
            for digi in digis.iter() {
                let bid = digi.bid();
                let cal = {
                    let map = cal_values.lock().unwrap();
                    map.get(&bid)
                        .or_else(|| map.get(&-1))
                        .cloned()
                        .ok_or(BaselineError::MissingCalibration(bid))?
                };
                spdlog::debug!("Board {} using cached baselines", bid);
                let values: Vec<u16> = (0..digi.num_channels())
                    .map(|ch| cal.dac_for(ch, target as f64).clamp(0.0, u16::MAX as f64) as u16)
                    .collect();
                dac_values.insert(bid, values);
                digi.clamp_dac_values(dac_values.get_mut(&bid).unwrap(), &cal);
            }
        }
        BaselineMode::Fixed => {
            spdlog::debug!(
                "Loading fixed baselines with value 0x{:04X}",
                options.baseline_fixed_value
            );
            for digi in digis.iter() {
                dac_values.insert(
                    digi.bid(),
                    vec![options.baseline_fixed_value; digi.num_channels()],
                );
            }
        }
    }

    for digi in digis.iter_mut() {
        let bid = digi.bid();
        spdlog::debug!("Board {} survived baseline mode, setting registers", bid);
        for write in options.registers_for(bid) {
            // validated at config load, cannot fail here
            if let Ok((reg, val)) = write.parsed() {
                digi.write_register(reg, val)?;
            }
        }
        digi.load_dac(&dac_values[&bid])?;
        if let Some(thresholds) = options.thresholds_for(bid) {
            digi.set_thresholds(thresholds)?;
        }
        spdlog::debug!("Board {} programmed", bid);
    }
    Ok(())
}

/// Closed-loop baseline fit for all boards on one link.
///
/// Walks the DAC calibration points, fits the linear DAC response per
/// channel, seeds the target DAC from the fit and then nudges each channel
/// until its measured pedestal stays within the adjustment threshold for
/// three consecutive steps. Returns the final DAC vectors.
pub fn fit_baselines(
    digis: &mut [Digitizer],
    target: i32,
    cal_values: &Mutex<CalMap>,
    timing: &FitTiming,
) -> Result<FxHashMap<i32, Vec<u16>>, BaselineError> {
    let mut dac_values: FxHashMap<i32, Vec<u16>> = FxHashMap::default();
    let mut finished: FxHashMap<i32, Vec<i32>> = FxHashMap::default();
    // measured pedestal per board, channel and step
    let mut measured: FxHashMap<i32, Vec<Vec<f64>>> = FxHashMap::default();
    let mut local_cal: CalMap = CalMap::default();

    for digi in digis.iter() {
        let nch = digi.num_channels();
        dac_values.insert(digi.bid(), vec![0; nch]);
        finished.insert(digi.bid(), vec![0; nch]);
        measured.insert(digi.bid(), vec![vec![0.0; MAX_STEPS]; nch]);
    }

    let all_converged = |finished: &FxHashMap<i32, Vec<i32>>| {
        finished
            .values()
            .all(|v| v.iter().all(|&c| c >= CONVERGENCE_THRESHOLD))
    };

    let mut calibrate = true;
    for iteration in 0..MAX_ITERATIONS {
        spdlog::debug!(
            "Beginning baseline iteration {}/{}",
            iteration,
            MAX_ITERATIONS
        );
        for history in measured.values_mut() {
            for per_channel in history.iter_mut() {
                per_channel.iter_mut().for_each(|v| *v = 0.0);
            }
        }
        for counters in finished.values_mut() {
            counters.iter_mut().for_each(|c| *c = 0);
        }
        let mut steps_repeated = 0usize;

        let mut step = 0usize;
        while step < MAX_STEPS {
            if all_converged(&finished) {
                spdlog::debug!("All boards on this link finished baselining");
                break;
            }
            if steps_repeated >= MAX_REPEATED_STEPS {
                spdlog::debug!("Repeating a lot of steps here");
                break;
            }

            if step < DAC_CAL_POINTS.len() {
                if !calibrate {
                    step += 1;
                    continue;
                }
                for digi in digis.iter() {
                    dac_values
                        .get_mut(&digi.bid())
                        .unwrap()
                        .iter_mut()
                        .for_each(|v| *v = DAC_CAL_POINTS[step]);
                }
            }
            for digi in digis.iter_mut() {
                let values = dac_values[&digi.bid()].clone();
                digi.load_dac(&values)?;
            }
            thread::sleep(timing.dac_settle);

            let mut stuck: Option<(i32, &'static str)> = None;
            for digi in digis.iter_mut() {
                if digi.ensure_ready(POLL_TRIES, POLL_SLEEP_MS)? {
                    digi.software_start()?;
                } else {
                    stuck = Some((digi.bid(), "become ready"));
                    break;
                }
            }
            thread::sleep(timing.post_start);
            if stuck.is_none() {
                for digi in digis.iter_mut() {
                    if !digi.ensure_started(POLL_TRIES, POLL_SLEEP_MS)? {
                        stuck = Some((digi.bid(), "start"));
                        break;
                    }
                }
            }
            if let Some((bid, what)) = stuck {
                return Err(control_timeout(digis, bid, what));
            }

            for _ in 0..TRIGGERS_PER_STEP {
                for digi in digis.iter_mut() {
                    digi.sw_trigger()?;
                }
                thread::sleep(timing.trigger_spacing);
            }

            for digi in digis.iter_mut() {
                digi.acquisition_stop()?;
                if !digi.ensure_stopped(POLL_TRIES, POLL_SLEEP_MS)? {
                    stuck = Some((digi.bid(), "stop"));
                    break;
                }
            }
            if let Some((bid, what)) = stuck {
                return Err(control_timeout(digis, bid, what));
            }
            thread::sleep(timing.post_stop);

            let mut buffers: FxHashMap<i32, Vec<u32>> = FxHashMap::default();
            for digi in digis.iter_mut() {
                buffers.insert(digi.bid(), digi.read_mblt()?);
            }
            if buffers
                .values()
                .any(|words| words.len() * WORD_BYTES <= HEADER_ONLY_BYTES)
            {
                spdlog::debug!("Undersized readout, repeating step {}", step);
                steps_repeated += 1;
                continue;
            }

            let mut redo_step = false;
            for digi in digis.iter() {
                let bid = digi.bid();
                measure_pedestals(
                    &digi.data_format(),
                    digi.num_channels(),
                    &buffers[&bid],
                    step,
                    bid,
                    measured.get_mut(&bid).unwrap(),
                    &mut redo_step,
                );
            }
            if redo_step {
                steps_repeated += 1;
                continue;
            }

            if step + 1 < DAC_CAL_POINTS.len() {
                step += 1;
                continue;
            }
            if step + 1 == DAC_CAL_POINTS.len() && calibrate {
                // least-squares fit over the calibration points seeds the DAC
                for digi in digis.iter() {
                    let bid = digi.bid();
                    let nch = digi.num_channels();
                    let mut cal = DacCalibration {
                        slope: vec![0.0; nch],
                        yint: vec![0.0; nch],
                    };
                    for ch in 0..nch {
                        let (slope, yint) = ols_fit(&DAC_CAL_POINTS, &measured[&bid][ch]);
                        cal.slope[ch] = slope;
                        cal.yint[ch] = yint;
                        let seed = ((target as f64 - yint) / slope)
                            .clamp(0.0, u16::MAX as f64) as u16;
                        dac_values.get_mut(&bid).unwrap()[ch] = seed;
                    }
                    cal_values.lock().unwrap().insert(bid, cal.clone());
                    local_cal.insert(bid, cal);
                }
                calibrate = false;
            } else {
                for digi in digis.iter() {
                    let bid = digi.bid();
                    let cal = &local_cal[&bid];
                    for ch in 0..digi.num_channels() {
                        let counters = finished.get_mut(&bid).unwrap();
                        if counters[ch] >= CONVERGENCE_THRESHOLD {
                            continue;
                        }
                        let off_by = target as f64 - measured[&bid][ch][step];
                        if off_by.abs() < ADJUSTMENT_THRESHOLD {
                            counters[ch] += 1;
                            continue;
                        }
                        counters[ch] = (counters[ch] - 1).max(0);
                        let raw = off_by * cal.slope[ch];
                        let mut adjustment = raw as i32;
                        if adjustment.abs() < MIN_ADJUSTMENT {
                            adjustment = if raw >= 0.0 {
                                MIN_ADJUSTMENT
                            } else {
                                -MIN_ADJUSTMENT
                            };
                        }
                        let dac = dac_values.get_mut(&bid).unwrap();
                        spdlog::trace!(
                            "Bd {} ch {} dac {:04x} bl {:.1} adjust {} step {}",
                            bid,
                            ch,
                            dac[ch],
                            measured[&bid][ch][step],
                            adjustment,
                            step
                        );
                        dac[ch] = (dac[ch] as i32 + adjustment).clamp(0, u16::MAX as i32) as u16;
                    }
                }
            }
            for digi in digis.iter() {
                if let Some(cal) = local_cal.get(&digi.bid()) {
                    digi.clamp_dac_values(dac_values.get_mut(&digi.bid()).unwrap(), cal);
                }
            }
            step += 1;
        }

        if all_converged(&finished) {
            spdlog::debug!("All baselines for boards on this link converged");
            return Ok(dac_values);
        }
    }

    Err(BaselineError::Unconverged)
}

/// Best-effort stop of the whole link before reporting a control timeout.
fn control_timeout(digis: &mut [Digitizer], bid: i32, what: &'static str) -> BaselineError {
    for digi in digis.iter_mut() {
        let _ = digi.acquisition_stop();
    }
    spdlog::warn!("Error in baseline digitizer control on board {}", bid);
    BaselineError::Hardware(DigitizerError::ControlTimeout(bid, what))
}

/// Ordinary least squares through the (DAC, pedestal) calibration points.
fn ols_fit(dac_points: &[u16], measured: &[f64]) -> (f64, f64) {
    let mut sum_xx = 0.0;
    let mut n = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_y = 0.0;
    let mut sum_x = 0.0;
    for (i, &x) in dac_points.iter().enumerate() {
        let x = x as f64;
        sum_xx += x * x;
        n += 1.0;
        sum_xy += x * measured[i];
        sum_y += measured[i];
        sum_x += x;
    }
    let denom = sum_xx * n - sum_x * sum_x;
    let slope = (n * sum_xy - sum_y * sum_x) / denom;
    let yint = (sum_xx * sum_y - sum_xy * sum_x) / denom;
    (slope, yint)
}

/// Histogram each channel's samples in one readout and extract the
/// pedestal as the weighted average around the histogram peak. A channel
/// whose distribution is too wide or too empty marks the step for repeat.
fn measure_pedestals(
    fmt: &DataFormat,
    n_channels: usize,
    words: &[u32],
    step: usize,
    bid: i32,
    history: &mut [Vec<f64>],
    redo_step: &mut bool,
) {
    let mut hist = vec![0f64; NBINS];
    let mut idx = 0usize;
    while idx < words.len() {
        if words[idx] >> 28 != HEADER_NIBBLE {
            idx += 1;
            continue;
        }
        let words_in_event = (words[idx] & 0xFFF_FFFF) as usize;
        if words_in_event == 4 || idx + 4 > words.len() {
            idx += 4;
            continue;
        }
        let mut channel_mask = (words[idx + 1] & 0xFF) as u32;
        if fmt.channel_mask_msb_idx != -1 {
            channel_mask |= ((words[idx + 2] >> 24) & 0xFF) << 8;
        }
        if channel_mask == 0 {
            idx += 4;
            continue;
        }
        let channels_in_event = channel_mask.count_ones() as usize;
        let words_per_channel =
            (words_in_event - 4) / channels_in_event - fmt.channel_header_words;

        idx += 4;
        for ch in 0..n_channels {
            if channel_mask & (1 << ch) == 0 {
                continue;
            }
            idx += fmt.channel_header_words;
            hist.iter_mut().for_each(|b| *b = 0.0);
            for w in 0..words_per_channel {
                if idx + w >= words.len() {
                    break;
                }
                let val0 = words[idx + w] & 0xFFFF;
                let val1 = (words[idx + w] >> 16) & 0xFFFF;
                if val0 == 0 || val1 == 0 {
                    continue;
                }
                for val in [val0, val1] {
                    let bin = (val >> REBIN_FACTOR) as usize;
                    if bin < NBINS {
                        hist[bin] += 1.0;
                    }
                }
            }
            idx += words_per_channel;

            let peak = hist
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            let window_lo = peak.saturating_sub(BINS_AROUND_MAX);
            let window_hi = (peak + BINS_AROUND_MAX + 1).min(NBINS);
            let counts_total: f64 = hist.iter().sum();
            let counts_around_max: f64 = hist[window_lo..window_hi].iter().sum();
            if counts_total == 0.0
                || counts_around_max / counts_total < FRACTION_AROUND_MAX
            {
                spdlog::debug!(
                    "Bd {} ch {}: {} of {} counts around max {}",
                    bid,
                    ch,
                    counts_around_max,
                    counts_total,
                    peak << REBIN_FACTOR
                );
                *redo_step = true;
            }
            // a quarter of the words zeroed means the channel is not live
            if counts_total / (words_per_channel as f64) < 1.5 {
                *redo_step = true;
            }
            let mut pedestal = 0.0;
            for (bin, count) in hist[window_lo..window_hi].iter().enumerate() {
                pedestal += (((window_lo + bin) << REBIN_FACTOR) as f64) * count;
            }
            if counts_around_max > 0.0 {
                pedestal /= counts_around_max;
            }
            history[ch][step] = pedestal;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoardKind, BoardSpec};
    use crate::sim::SimBoard;

    fn sim_link(n_boards: usize, slope: f64, yint: f64) -> (Vec<SimBoard>, Vec<Digitizer>) {
        let mut sims = Vec::new();
        let mut digis = Vec::new();
        for i in 0..n_boards {
            let sim = SimBoard::new(8).with_response(slope, yint);
            let spec = BoardSpec {
                bid: 100 + i as i32,
                link: 0,
                crate_num: 0,
                vme_address: 0,
                kind: BoardKind::V1724Mv,
            };
            digis.push(Digitizer::init(Box::new(sim.clone()), &spec).unwrap());
            sims.push(sim);
        }
        (sims, digis)
    }

    #[test]
    fn ideal_linear_channel_converges() {
        let (_sims, mut digis) = sim_link(1, 0.25, 200.0);
        let cal_values = Mutex::new(CalMap::default());
        let dacs = fit_baselines(&mut digis, 16000, &cal_values, &FitTiming::immediate())
            .expect("fit should converge on an ideal channel");

        // seed lands on (16000 - 200) / 0.25 and never needs adjusting
        for &dac in dacs[&100].iter() {
            assert!((dac as i32 - 63_200).abs() < 40, "dac was {dac}");
        }
        let cal = &cal_values.lock().unwrap()[&100];
        for ch in 0..8 {
            assert!((cal.slope[ch] - 0.25).abs() < 1e-6);
            assert!((cal.yint[ch] - 200.0).abs() < 1e-3);
        }
    }

    #[test]
    fn short_readout_repeats_the_step() {
        let (sims, mut digis) = sim_link(1, 0.25, 200.0);
        sims[0].inject_short_reads(1);
        let cal_values = Mutex::new(CalMap::default());
        let dacs = fit_baselines(&mut digis, 16000, &cal_values, &FitTiming::immediate())
            .expect("one short read must not fail the fit");
        assert!((dacs[&100][0] as i32 - 63_200).abs() < 40);
    }

    #[test]
    fn persistent_short_reads_end_unconverged() {
        let (sims, mut digis) = sim_link(1, 0.25, 200.0);
        sims[0].inject_short_reads(1_000);
        let cal_values = Mutex::new(CalMap::default());
        let result = fit_baselines(&mut digis, 16000, &cal_values, &FitTiming::immediate());
        assert!(matches!(result, Err(BaselineError::Unconverged)));
    }

    #[test]
    fn transfer_fault_is_a_hardware_error() {
        let (sims, mut digis) = sim_link(1, 0.25, 200.0);
        sims[0].fail_next_blt();
        let cal_values = Mutex::new(CalMap::default());
        let result = fit_baselines(&mut digis, 16000, &cal_values, &FitTiming::immediate());
        assert!(matches!(result, Err(BaselineError::Hardware(_))));
    }

    #[test]
    fn cached_mode_applies_stored_calibration() {
        let (sims, mut digis) = sim_link(1, 0.25, 200.0);
        let mut options = Options::default();
        options.baseline_dac_mode = BaselineMode::Cached;
        let mut map = CalMap::default();
        map.insert(
            -1,
            DacCalibration {
                slope: vec![0.25; 8],
                yint: vec![200.0; 8],
            },
        );
        let cal_values = Mutex::new(map);
        init_link_with_timing(&mut digis, &options, &cal_values, &FitTiming::immediate())
            .unwrap();
        assert_eq!(sims[0].dac(0), 63_200);
    }

    #[test]
    fn cached_mode_without_calibration_fails() {
        let (_sims, mut digis) = sim_link(1, 0.25, 200.0);
        let mut options = Options::default();
        options.baseline_dac_mode = BaselineMode::Cached;
        let cal_values = Mutex::new(CalMap::default());
        let result =
            init_link_with_timing(&mut digis, &options, &cal_values, &FitTiming::immediate());
        assert!(matches!(result, Err(BaselineError::MissingCalibration(100))));
    }

    #[test]
    fn fixed_mode_writes_the_constant() {
        let (sims, mut digis) = sim_link(2, 0.25, 200.0);
        let options = Options::default();
        let cal_values = Mutex::new(CalMap::default());
        init_link_with_timing(&mut digis, &options, &cal_values, &FitTiming::immediate())
            .unwrap();
        for sim in sims.iter() {
            assert_eq!(sim.dac(0), 0x0FA0);
            assert_eq!(sim.dac(7), 0x0FA0);
        }
    }
}
