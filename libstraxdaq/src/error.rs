use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum VmeError {
    #[error("VME bus error accessing register 0x{0:04X}")]
    Bus(u32),
    #[error("Block transfer failed: {0}")]
    Blt(String),
    #[error("Optical link is not open")]
    LinkClosed,
}

#[derive(Debug, Error)]
pub enum DigitizerError {
    #[error("Digitizer failed due to VME error: {0}")]
    Vme(#[from] VmeError),
    #[error("Board {0} failed initialization")]
    InitFailed(i32),
    #[error("Board {0} timed out polling register 0x{1:04X}")]
    RegisterTimeout(i32, u32),
    #[error("Board {0} timed out waiting to {1}")]
    ControlTimeout(i32, &'static str),
    #[error("Board {0} could not read its error register")]
    ErrorRegisterUnreadable(i32),
    #[error("Board {0} was given {1} DAC values for {2} channels")]
    BadDacVector(i32, usize, usize),
}

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("Baseline calibration failed due to digitizer error: {0}")]
    Hardware(#[from] DigitizerError),
    #[error("Baseline calibration did not converge on all channels")]
    Unconverged,
    #[error("Board {0} has no cached DAC calibration and the store has no default entry")]
    MissingCalibration(i32),
}

#[derive(Debug, Error)]
pub enum FormatterError {
    #[error("Board {bid} produced data on unmapped channel {channel}")]
    UnmappedChannel { bid: i32, channel: usize },
    #[error("Formatter failed due to chunk sink error: {0}")]
    Sink(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config contains a bad hex value '{0}'")]
    BadHexValue(String),
    #[error("Board {0} appears more than once in the board list")]
    DuplicateBoard(i32),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Controller failed due to configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Controller failed due to digitizer error: {0}")]
    Digitizer(#[from] DigitizerError),
    #[error("Controller failed due to baseline error: {0}")]
    Baseline(#[from] BaselineError),
    #[error("Controller failed due to formatter error: {0}")]
    Formatter(#[from] FormatterError),
    #[error("Cannot {0} while the controller is {1}")]
    BadTransition(&'static str, &'static str),
}
