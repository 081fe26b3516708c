use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::ConfigError;

/// Digitizer flavors this host knows how to drive.
///
/// The base V1724 runs the DPP-DAW firmware (per-channel headers), the
/// muon-veto V1724 runs the stock firmware (no channel headers) and the
/// V1730 carries 16 channels with an extended channel mask and 48-bit
/// channel times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoardKind {
    V1724,
    #[serde(rename = "V1724_MV")]
    V1724Mv,
    V1730,
}

/// One entry of the `boards` list: everything needed to open a digitizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardSpec {
    pub bid: i32,
    pub link: u8,
    #[serde(rename = "crate")]
    pub crate_num: u8,
    #[serde(default)]
    pub vme_address: u32,
    #[serde(rename = "type")]
    pub kind: BoardKind,
}

/// A raw register write from the options store. Register and value are hex
/// strings as the configuration database keeps them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWrite {
    pub reg: String,
    pub val: String,
}

impl RegisterWrite {
    pub fn parsed(&self) -> Result<(u32, u32), ConfigError> {
        let reg = u32::from_str_radix(self.reg.trim_start_matches("0x"), 16)
            .map_err(|_| ConfigError::BadHexValue(self.reg.clone()))?;
        let val = u32::from_str_radix(self.val.trim_start_matches("0x"), 16)
            .map_err(|_| ConfigError::BadHexValue(self.val.clone()))?;
        Ok((reg, val))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BaselineMode {
    Fixed,
    Cached,
    Fit,
}

// Lenient on purpose: an unrecognized mode string from the options store
// falls back to fixed with a warning instead of refusing the run mode.
impl<'de> Deserialize<'de> for BaselineMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "fixed" => BaselineMode::Fixed,
            "cached" => BaselineMode::Cached,
            "fit" => BaselineMode::Fit,
            other => {
                spdlog::warn!(
                    "Received unknown baseline mode '{}', fallback to fixed",
                    other
                );
                BaselineMode::Fixed
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferType {
    Dual,
    Single,
}

fn default_baseline_value() -> i32 {
    16000
}
fn default_baseline_fixed_value() -> u16 {
    0x0FA0
}
fn default_fragment_bytes() -> usize {
    220
}
fn default_buffer_type() -> BufferType {
    BufferType::Dual
}
fn default_chunk_length() -> i64 {
    5_000_000_000
}
fn default_chunk_overlap() -> i64 {
    50_000_000
}
fn default_chunk_name_length() -> usize {
    6
}
fn default_warn_chunks() -> i64 {
    1
}
fn default_buffer_chunks() -> i64 {
    2
}

/// The options document handed down by the orchestrator at arm time.
///
/// Serializable to YAML with serde so a run mode can be saved and reloaded;
/// defaults follow the production values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Run mode name, reported back in the status document.
    #[serde(default)]
    pub name: String,
    /// Requested processing threads per host. Informational only: the
    /// formatter runs one thread per board.
    #[serde(default)]
    pub processing_threads: FxHashMap<String, usize>,
    pub baseline_dac_mode: BaselineMode,
    #[serde(default = "default_baseline_value")]
    pub baseline_value: i32,
    #[serde(default = "default_baseline_fixed_value")]
    pub baseline_fixed_value: u16,
    /// 0 = software start, 1 = hardware start via the S-IN input.
    #[serde(default)]
    pub run_start: i32,
    #[serde(default = "default_fragment_bytes")]
    pub strax_fragment_payload_bytes: usize,
    #[serde(default = "default_buffer_type")]
    pub buffer_type: BufferType,
    #[serde(default = "default_chunk_length")]
    pub chunk_length_ns: i64,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap_ns: i64,
    #[serde(default = "default_chunk_name_length")]
    pub chunk_name_length: usize,
    #[serde(default = "default_warn_chunks")]
    pub warn_if_chunk_older_than: i64,
    /// How many chunks stay buffered before the oldest is handed to the sink.
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: i64,
    pub boards: Vec<BoardSpec>,
    /// Raw register writes applied per board after baselining.
    #[serde(default)]
    pub registers: FxHashMap<i32, Vec<RegisterWrite>>,
    /// Per-board trigger thresholds, one value per channel.
    #[serde(default)]
    pub thresholds: FxHashMap<i32, Vec<u16>>,
    /// Per-board physical-to-logical channel map.
    #[serde(default)]
    pub channel_map: FxHashMap<i32, Vec<i16>>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: String::from("none"),
            processing_threads: FxHashMap::default(),
            baseline_dac_mode: BaselineMode::Fixed,
            baseline_value: default_baseline_value(),
            baseline_fixed_value: default_baseline_fixed_value(),
            run_start: 0,
            strax_fragment_payload_bytes: default_fragment_bytes(),
            buffer_type: default_buffer_type(),
            chunk_length_ns: default_chunk_length(),
            chunk_overlap_ns: default_chunk_overlap(),
            chunk_name_length: default_chunk_name_length(),
            warn_if_chunk_older_than: default_warn_chunks(),
            buffer_chunks: default_buffer_chunks(),
            boards: Vec::new(),
            registers: FxHashMap::default(),
            thresholds: FxHashMap::default(),
            channel_map: FxHashMap::default(),
        }
    }
}

impl Options {
    /// Read an options document from a YAML file
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(config_path)?;
        let options = serde_yaml::from_str::<Self>(&yaml_str)?;
        options.validate()?;
        Ok(options)
    }

    /// Reject documents that would later fail in a worker thread
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = Vec::with_capacity(self.boards.len());
        for board in self.boards.iter() {
            if seen.contains(&board.bid) {
                return Err(ConfigError::DuplicateBoard(board.bid));
            }
            seen.push(board.bid);
        }
        for writes in self.registers.values() {
            for w in writes.iter() {
                w.parsed()?;
            }
        }
        Ok(())
    }

    pub fn hardware_start(&self) -> bool {
        self.run_start == 1
    }

    /// Chunk length plus its overlap window, the actual bucket width.
    pub fn full_chunk_length(&self) -> i64 {
        self.chunk_length_ns + self.chunk_overlap_ns
    }

    pub fn registers_for(&self, bid: i32) -> &[RegisterWrite] {
        self.registers.get(&bid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn thresholds_for(&self, bid: i32) -> Option<&[u16]> {
        self.thresholds.get(&bid).map(Vec::as_slice)
    }
}

/// Per-channel linear response of measured pedestal to DAC setting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DacCalibration {
    pub slope: Vec<f64>,
    pub yint: Vec<f64>,
}

impl DacCalibration {
    /// DAC value expected to land the pedestal on `target`.
    pub fn dac_for(&self, ch: usize, target: f64) -> f64 {
        (target - self.yint[ch]) / self.slope[ch]
    }
}

/// The calibration store: slope and intercept per board, with the `-1`
/// entry as the fallback for boards that have never been fit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DacCalibrationStore {
    pub boards: FxHashMap<i32, DacCalibration>,
}

impl DacCalibrationStore {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::BadFilePath(path.to_path_buf()));
        }
        let yaml_str = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml_str = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml_str)?;
        Ok(())
    }

    /// Calibration for a board, falling back to the default entry.
    pub fn for_board(&self, bid: i32) -> Option<&DacCalibration> {
        self.boards.get(&bid).or_else(|| self.boards.get(&-1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip() {
        let options = Options::default();
        let yaml = serde_yaml::to_string(&options).unwrap();
        let back: Options = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.baseline_value, 16000);
        assert_eq!(back.baseline_fixed_value, 0x0FA0);
        assert_eq!(back.strax_fragment_payload_bytes, 220);
        assert_eq!(back.buffer_type, BufferType::Dual);
        assert_eq!(back.full_chunk_length(), 5_050_000_000);
    }

    #[test]
    fn minimal_document_fills_defaults() {
        let yaml = "
baseline_dac_mode: fit
boards:
  - bid: 100
    link: 0
    crate: 0
    type: V1724
";
        let options: Options = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.baseline_dac_mode, BaselineMode::Fit);
        assert_eq!(options.boards.len(), 1);
        assert_eq!(options.boards[0].kind, BoardKind::V1724);
        assert!(!options.hardware_start());
    }

    #[test]
    fn unknown_baseline_mode_falls_back_to_fixed() {
        let yaml = "
baseline_dac_mode: automagic
boards: []
";
        let options: Options = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(options.baseline_dac_mode, BaselineMode::Fixed);
    }

    #[test]
    fn duplicate_boards_rejected() {
        let mut options = Options::default();
        let spec = BoardSpec {
            bid: 7,
            link: 0,
            crate_num: 0,
            vme_address: 0,
            kind: BoardKind::V1724,
        };
        options.boards.push(spec.clone());
        options.boards.push(spec);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::DuplicateBoard(7))
        ));
    }

    #[test]
    fn register_writes_parse_hex() {
        let w = RegisterWrite {
            reg: String::from("8020"),
            val: String::from("0x1F4"),
        };
        assert_eq!(w.parsed().unwrap(), (0x8020, 0x1F4));
        let bad = RegisterWrite {
            reg: String::from("80G0"),
            val: String::from("0"),
        };
        assert!(bad.parsed().is_err());
    }

    #[test]
    fn calibration_store_fallback() {
        let mut store = DacCalibrationStore::default();
        store.boards.insert(
            -1,
            DacCalibration {
                slope: vec![-0.25; 8],
                yint: vec![17000.0; 8],
            },
        );
        assert!(store.for_board(42).is_some());
        assert_eq!(store.for_board(42).unwrap().slope[0], -0.25);
    }
}
