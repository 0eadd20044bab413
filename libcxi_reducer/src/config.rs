use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::ConfigError;
use super::params;
use super::translator::Facility;

/// pnccd pixel pitch in meters; used to convert the gap geometry to rows.
pub const PIXEL_SIZE: f64 = 75.0e-6;

/// Map a pnccd gain level to its tabulated ADU threshold.
///
/// Gain levels without a tabulated value fall back to 0 with a warning, so a
/// misconfigured run still processes rather than silently dropping all hits.
pub fn adu_threshold_for_gain(gain_level: i64) -> f64 {
    match gain_level {
        64 => 50.0,
        16 => 100.0,
        4 => 200.0,
        1 => 400.0,
        _ => {
            log::warn!(
                "Do not have tabulated value for chosen pnccd gain level {}. Setting ADU threshold to 0.",
                gain_level
            );
            0.0
        }
    }
}

/// Structure representing the application configuration. Contains facility,
/// run and output information. Configs are serializable and deserializable
/// to YAML using serde and serde_yaml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub facility: String,
    pub run_number: i32,
    pub dark_number: Option<i32>,
    pub params_path: Option<PathBuf>,
    pub data_glob: Option<String>,
    pub calib_glob: Option<String>,
    pub daq_dir: Option<PathBuf>,
    pub motor_file: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub output_level: u8,
    pub skip_tof: bool,
    pub only_save_multiples: bool,
    pub hitscore_threshold: Option<f64>,
    pub multiscore_threshold: Option<f64>,
    pub gain_level: Option<i64>,
    pub nr_frames: Option<u64>,
    pub n_readers: usize,
    pub chunk_size: usize,
    pub frame_shape: [usize; 2],
    pub dummy_n_events: u64,
}

impl Default for Config {
    /// Generate a new Config object. Path fields will be empty/invalid
    fn default() -> Self {
        Self {
            facility: String::from("dummy"),
            run_number: 0,
            dark_number: None,
            params_path: None,
            data_glob: None,
            calib_glob: None,
            daq_dir: None,
            motor_file: None,
            output_dir: PathBuf::from("None"),
            output_level: 3,
            skip_tof: false,
            only_save_multiples: false,
            hitscore_threshold: None,
            multiscore_threshold: None,
            gain_level: None,
            nr_frames: None,
            n_readers: 1,
            chunk_size: 10,
            frame_shape: [64, 64],
            dummy_n_events: 100,
        }
    }
}

impl Config {
    /// Read the configuration in a YAML file
    /// Returns a Config if successful
    pub fn read_config_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::BadFilePath(config_path.to_path_buf()));
        }

        let yaml_str = std::fs::read_to_string(config_path)?;

        Ok(serde_yaml::from_str::<Self>(&yaml_str)?)
    }

    /// Hidden name the output file carries while the run is in flight.
    pub fn get_temp_file_name(&self) -> PathBuf {
        self.output_dir
            .join(format!(".r{:04}_ol{}.h5", self.run_number, self.output_level))
    }

    /// Final name the output file is published under.
    pub fn get_final_file_name(&self) -> PathBuf {
        self.output_dir
            .join(format!("r{:04}_ol{}.h5", self.run_number, self.output_level))
    }

    /// Resolve the configuration into the immutable per-run state.
    ///
    /// Thresholds set directly take precedence over the run parameter
    /// table; a threshold resolvable from neither is a fatal configuration
    /// error, as is an unknown facility or an invalid reader count.
    pub fn resolve(&self) -> Result<RunState, ConfigError> {
        if self.n_readers < 1 {
            return Err(ConfigError::BadReaderCount(self.n_readers));
        }
        if self.chunk_size < 1 {
            return Err(ConfigError::BadChunkSize);
        }
        let facility = Facility::parse(&self.facility)?;
        let output = OutputFlags::from_level(self.output_level, self.skip_tof)?;

        let row = match &self.params_path {
            Some(path) => Some(params::read_params(path, self.run_number)?),
            None => None,
        };

        let hitscore_threshold = self
            .hitscore_threshold
            .or(row.as_ref().map(|r| r.hitscore_threshold))
            .ok_or(ConfigError::MissingParameter("hitscore_threshold"))?;
        let multiscore_threshold = self
            .multiscore_threshold
            .or(row.as_ref().map(|r| r.multiscore_threshold))
            .ok_or(ConfigError::MissingParameter("multiscore_threshold"))?;
        let gain_level = self
            .gain_level
            .or(row.as_ref().map(|r| r.gain_level))
            .ok_or(ConfigError::MissingParameter("gain_level"))?;
        let dark_number = self.dark_number.or(row.as_ref().map(|r| r.dark_nr));

        let gap_total_mm = row
            .as_ref()
            .map(|r| r.gap_top_mm + r.gap_bottom_mm)
            .unwrap_or(0.0);
        let gap_rows = ((gap_total_mm * 1.0e-3) / PIXEL_SIZE).round() as usize;

        Ok(RunState {
            facility,
            run_number: self.run_number,
            dark_number,
            hitscore_threshold,
            multiscore_threshold,
            adu_threshold: adu_threshold_for_gain(gain_level),
            gain_level,
            output,
            only_save_multiples: self.only_save_multiples,
            frame_limit: self.nr_frames.map(|n| n / self.n_readers as u64),
            n_readers: self.n_readers,
            chunk_size: self.chunk_size,
            frame_shape: (self.frame_shape[0], self.frame_shape[1]),
            gap_rows: gap_rows.min(self.frame_shape[0]),
            dummy_n_events: self.dummy_n_events,
            source: SourceLocations {
                data_glob: self.data_glob.clone(),
                calib_glob: self.calib_glob.clone(),
                daq_dir: self.daq_dir.clone(),
                motor_file: self.motor_file.clone(),
            },
            temp_path: self.get_temp_file_name(),
            final_path: self.get_final_file_name(),
        })
    }
}

/// What the configured output level persists.
///
/// Levels are monotonic: 0 nothing, 1 lightweight summary, 2 adds the TOF
/// trace (unless skipped), 3 adds the detector frame, 4 adds the multi-hit
/// transform outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFlags {
    pub level: u8,
    pub save_anything: bool,
    pub save_tof: bool,
    pub save_pnccd: bool,
    pub save_multiple: bool,
}

impl OutputFlags {
    pub fn from_level(level: u8, skip_tof: bool) -> Result<Self, ConfigError> {
        if level > 4 {
            return Err(ConfigError::BadOutputLevel(level));
        }
        Ok(Self {
            level,
            save_anything: level > 0,
            save_tof: level >= 2 && !skip_tof,
            save_pnccd: level >= 3,
            save_multiple: level >= 4,
        })
    }
}

/// Where the facility translator finds its inputs. Opaque to the pipeline;
/// handed to the translator at startup.
#[derive(Debug, Clone, Default)]
pub struct SourceLocations {
    pub data_glob: Option<String>,
    pub calib_glob: Option<String>,
    pub daq_dir: Option<PathBuf>,
    pub motor_file: Option<PathBuf>,
}

/// Configuration resolved once at startup; immutable for the run's duration.
#[derive(Debug, Clone)]
pub struct RunState {
    pub facility: Facility,
    pub run_number: i32,
    pub dark_number: Option<i32>,
    pub hitscore_threshold: f64,
    pub multiscore_threshold: f64,
    pub adu_threshold: f64,
    pub gain_level: i64,
    pub output: OutputFlags,
    pub only_save_multiples: bool,
    /// Per-reader event budget, `nr_frames / n_readers`.
    pub frame_limit: Option<u64>,
    pub n_readers: usize,
    pub chunk_size: usize,
    pub frame_shape: (usize, usize),
    pub gap_rows: usize,
    pub dummy_n_events: u64,
    pub source: SourceLocations,
    pub temp_path: PathBuf,
    pub final_path: PathBuf,
}

impl RunState {
    /// Validity mask for the detector center: true everywhere except the
    /// rows covered by the gap between the two pnccd halves.
    pub fn center_mask(&self) -> Array2<bool> {
        let (rows, cols) = self.frame_shape;
        let mut mask = Array2::from_elem((rows, cols), true);
        if self.gap_rows > 0 {
            let first = (rows - self.gap_rows) / 2;
            for row in first..(first + self.gap_rows).min(rows) {
                for col in 0..cols {
                    mask[[row, col]] = false;
                }
            }
        }
        mask
    }
}
