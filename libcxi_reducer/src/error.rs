use std::path::PathBuf;
use thiserror::Error;

use super::reader_status::ReaderStatus;

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("Could not open run parameter table because file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Run parameter table failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Run parameter table failed to parse an integer: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),
    #[error("Run parameter table failed to parse a number: {0}")]
    ParseFloatError(#[from] std::num::ParseFloatError),
    #[error("Run parameter table has the incorrect format; most likely the number of columns is incorrect")]
    BadFileFormat,
    #[error("Run parameter table has no row for run {0}")]
    MissingRun(i32),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Facility {0} is not supported")]
    UnknownFacility(String),
    #[error("Config is missing required parameter {0} (set it directly or provide a parameter table)")]
    MissingParameter(&'static str),
    #[error("Config failed due to run parameter table error: {0}")]
    ParamsError(#[from] ParamsError),
    #[error("Number of readers must be at least 1, got {0}")]
    BadReaderCount(usize),
    #[error("Output level must be in 0..=4, got {0}")]
    BadOutputLevel(u8),
    #[error("Chunk size must be at least 1")]
    BadChunkSize,
}

#[derive(Debug, Error)]
pub enum TranslatorError {
    #[error("Translator failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Raised by analysis stages; never fatal to the event loop.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("Missing input {category}/{key}")]
    MissingInput { category: String, key: String },
    #[error("Input {category}/{key} has the wrong type")]
    WrongType { category: String, key: String },
}

#[derive(Debug, Clone, Error)]
pub enum CommError {
    #[error("Collective operation aborted because a peer observed a fatal error")]
    Aborted,
    #[error("Shared coordination state was poisoned by a peer panic")]
    Poisoned,
}

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("CxiWriter failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("CxiWriter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("CxiWriter failed due to coordination error: {0}")]
    CommError(#[from] CommError),
    #[error("Solo record written from reader {0}, which is not the designated main reader")]
    SoloFromNonPrimary(usize),
    #[error("Solo record was already written once this run")]
    SoloAlreadyWritten,
    #[error("Record leaf {path} does not match the shape of its dataset")]
    ShapeMismatch { path: String },
}

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("Finalizer failed due to HDF5 error: {0}")]
    HDF5Error(#[from] hdf5::Error),
    #[error("Finalizer failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Processor failed due to Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Processor failed due to Translator error: {0}")]
    TranslatorError(#[from] TranslatorError),
    #[error("Processor failed due to CxiWriter error: {0}")]
    WriterError(#[from] WriterError),
    #[error("Processor failed due to Finalizer error: {0}")]
    FinalizeError(#[from] FinalizeError),
    #[error("Processor failed due to coordination error: {0}")]
    CommError(#[from] CommError),
    #[error("Processor failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<ReaderStatus>),
    #[error("Processor failed due to IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Reader thread {0} panicked")]
    ReaderPanicked(usize),
}
