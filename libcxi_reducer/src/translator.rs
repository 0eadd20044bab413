use ndarray::{Array1, Array2};

use super::config::RunState;
use super::error::{ConfigError, TranslatorError};
use super::record::{
    EventRecord, Value, CAT_DAQ, CAT_DETECTOR, CAT_FEL, CAT_ID, CAT_MOTORS, KEY_DETECTOR, KEY_TOF,
};

/// Supported facilities, fixed at compile time.
///
/// The facility string in the configuration is parsed into this enum once at
/// startup; an unknown identifier is a fatal configuration error before the
/// event loop starts. Facility-specific translators (FLASH frms6 readers and
/// friends) plug in here as further variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facility {
    Dummy,
}

impl Facility {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "dummy" => Ok(Facility::Dummy),
            _ => Err(ConfigError::UnknownFacility(name.to_string())),
        }
    }
}

/// Source of translated event records for one reader.
///
/// `Ok(None)` signals a clean end-of-stream. Implementations own the
/// partitioning of the underlying stream: two readers of the same run must
/// never yield the same event.
pub trait Translator: Send {
    fn next_event(&mut self) -> Result<Option<EventRecord>, TranslatorError>;
}

/// Construct the translator for the configured facility and reader rank.
pub fn build_translator(
    state: &RunState,
    rank: usize,
) -> Result<Box<dyn Translator>, ConfigError> {
    match state.facility {
        Facility::Dummy => Ok(Box::new(DummyTranslator::new(state, rank))),
    }
}

const TOF_TRACE_LEN: usize = 256;

/// Deterministic synthetic event stream.
///
/// Events are partitioned round-robin across readers: rank r yields global
/// indices r, r+size, r+2*size, ... below the configured total. Every third
/// event carries enough lit pixels to score as a hit and every sixth adds a
/// second bright cluster, so dry runs and tests exercise the full gating
/// path without facility data.
pub struct DummyTranslator {
    next_index: u64,
    stride: u64,
    n_total: u64,
    frame_shape: (usize, usize),
    run_number: i32,
}

impl DummyTranslator {
    pub fn new(state: &RunState, rank: usize) -> Self {
        Self {
            next_index: rank as u64,
            stride: state.n_readers as u64,
            n_total: state.dummy_n_events,
            frame_shape: state.frame_shape,
            run_number: state.run_number,
        }
    }

    fn synth_frame(&self, index: u64) -> Array2<f32> {
        let (rows, cols) = self.frame_shape;
        let mut frame = Array2::zeros((rows, cols));
        let lit = if index % 3 == 0 {
            20 + (index % 5) as usize * 4
        } else {
            2
        };
        // Isolated bright pixels on an every-other-pixel grid in the upper
        // left quadrant, clear of the center gap rows.
        let grid_cols = (cols / 2).max(1);
        for k in 0..lit {
            let row = 1 + 2 * (k / grid_cols);
            let col = 1 + 2 * (k % grid_cols);
            if row < rows / 2 && col < cols {
                frame[[row, col]] = 1000.0;
                if index % 6 == 0 {
                    // Centrosymmetric twin cluster marks a multiple hit
                    frame[[rows - 1 - row, cols - 1 - col]] = 1000.0;
                }
            }
        }
        frame
    }

    fn synth_tof(&self, index: u64) -> Array1<f32> {
        let mut trace = Array1::zeros(TOF_TRACE_LEN);
        let peak = 40 + (index % 16) as usize;
        for (offset, value) in [(0usize, -5.0f32), (1, -3.5), (2, -1.5)] {
            if peak + offset < TOF_TRACE_LEN {
                trace[peak + offset] = value;
            }
        }
        trace
    }
}

impl Translator for DummyTranslator {
    fn next_event(&mut self) -> Result<Option<EventRecord>, TranslatorError> {
        if self.next_index >= self.n_total {
            return Ok(None);
        }
        let i = self.next_index;
        self.next_index += self.stride;

        let mut evt = EventRecord::new();
        evt.insert(CAT_DETECTOR, KEY_DETECTOR, Value::Array2(self.synth_frame(i)));
        evt.insert(CAT_DAQ, KEY_TOF, Value::Array1(self.synth_tof(i)));

        evt.insert(CAT_ID, "bunch_id", Value::Int(i as i64));
        evt.insert(CAT_ID, "tv_sec", Value::Int(1_500_000_000 + (i / 10) as i64));
        evt.insert(CAT_ID, "tv_usec", Value::Int((i % 10) as i64 * 100_000));
        evt.insert(CAT_ID, "dataset_id", Value::Int(self.run_number as i64));
        evt.insert(CAT_ID, "bunch_sec", Value::Int(1_500_000_000 + (i / 10) as i64));

        evt.insert(CAT_FEL, "wavelength_nm", Value::Scalar(5.3));
        evt.insert(CAT_FEL, "gmd", Value::Scalar(80.0 + (i % 20) as f64));

        for (key, base) in [
            ("manualy", 1.0),
            ("injectorx", 2.0),
            ("injectory", 3.0),
            ("trigdelay", 4.0),
            ("samplepress", 5.0),
            ("nozzlepress", 6.0),
            ("posdownstream", 7.0),
            ("posupstream", 8.0),
            ("injectorpress", 9.0),
            ("focusinggas", 10.0),
        ] {
            evt.insert(CAT_MOTORS, key, Value::Scalar(base + i as f64 * 0.01));
        }

        Ok(Some(evt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn state(n_readers: usize, n_events: u64) -> RunState {
        let config = Config {
            run_number: 7,
            hitscore_threshold: Some(10.0),
            multiscore_threshold: Some(4.0),
            gain_level: Some(64),
            n_readers,
            dummy_n_events: n_events,
            frame_shape: [32, 32],
            ..Default::default()
        };
        config.resolve().unwrap()
    }

    #[test]
    fn test_facility_parse() {
        assert_eq!(Facility::parse("dummy").unwrap(), Facility::Dummy);
        assert_eq!(Facility::parse("Dummy").unwrap(), Facility::Dummy);
        assert!(matches!(
            Facility::parse("FLASH"),
            Err(ConfigError::UnknownFacility(_))
        ));
    }

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        let state = state(3, 20);
        let mut seen = Vec::new();
        for rank in 0..3 {
            let mut translator = DummyTranslator::new(&state, rank);
            while let Some(evt) = translator.next_event().unwrap() {
                seen.push(evt.get_int(CAT_ID, "bunch_id").unwrap());
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<i64>>());
    }

    #[test]
    fn test_deterministic() {
        let state = state(2, 10);
        let mut a = DummyTranslator::new(&state, 1);
        let mut b = DummyTranslator::new(&state, 1);
        while let Some(evt_a) = a.next_event().unwrap() {
            let evt_b = b.next_event().unwrap().unwrap();
            assert_eq!(
                evt_a.get_array2(CAT_DETECTOR, KEY_DETECTOR),
                evt_b.get_array2(CAT_DETECTOR, KEY_DETECTOR)
            );
            assert_eq!(
                evt_a.get_int(CAT_ID, "bunch_id"),
                evt_b.get_int(CAT_ID, "bunch_id")
            );
        }
        assert!(b.next_event().unwrap().is_none());
    }

    #[test]
    fn test_end_of_stream() {
        let state = state(1, 2);
        let mut translator = DummyTranslator::new(&state, 0);
        assert!(translator.next_event().unwrap().is_some());
        assert!(translator.next_event().unwrap().is_some());
        assert!(translator.next_event().unwrap().is_none());
        assert!(translator.next_event().unwrap().is_none());
    }
}
