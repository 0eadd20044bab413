use fxhash::FxHashMap;
use ndarray::Array2;

use super::config::RunState;
use super::error::StageError;
use super::record::{
    EventRecord, Value, CAT_ANALYSIS, CAT_DETECTOR, KEY_DETECTOR, KEY_HITSCORE, KEY_IS_HIT,
    KEY_MULTIPLE_SCORE, KEY_PATTERSON, KEY_PATTERSON_MULTIPLES,
};

/// Flat mapping of named scalar options, enumerated at configuration time.
#[derive(Debug, Clone, Default)]
pub struct StageParams {
    values: FxHashMap<String, f64>,
}

impl StageParams {
    pub fn set(&mut self, name: &str, value: f64) {
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn get_or(&self, name: &str, fallback: f64) -> f64 {
        self.get(name).unwrap_or(fallback)
    }
}

/// Enumerate the stage options implied by the resolved run state.
pub fn stage_params(state: &RunState) -> StageParams {
    let mut params = StageParams::default();
    params.set("aduThreshold", state.adu_threshold);
    params.set("hitscoreThreshold", state.hitscore_threshold);
    params.set("multiscoreThreshold", state.multiscore_threshold);
    params.set("pattersonThreshold", 0.5);
    params.set("pattersonDiameterPix", 8.0);
    params.set(
        "pattersonFullOutput",
        if state.output.save_multiple { 1.0 } else { 0.0 },
    );
    params
}

/// One step of the per-event analysis recipe.
///
/// Stages read and extend the event record in place; a missing input is
/// reported through `StageError` and handled by the event loop as "this
/// event's feature is absent", never as a fatal condition.
pub trait AnalysisStage: Send {
    fn name(&self) -> &'static str;
    fn process(&mut self, evt: &mut EventRecord) -> Result<(), StageError>;
}

/// The default recipe: lit-pixel hit finding followed by multi-hit scoring.
pub fn default_stages(state: &RunState) -> Vec<Box<dyn AnalysisStage>> {
    let params = stage_params(state);
    let mask = state.center_mask();
    vec![
        Box::new(LitPixels::new(&params, Some(mask.clone()))),
        Box::new(PattersonMultiples::new(&params, Some(mask))),
    ]
}

fn missing(key: &str) -> StageError {
    StageError::MissingInput {
        category: CAT_DETECTOR.to_string(),
        key: key.to_string(),
    }
}

/// Hit finding by counting lit pixels.
///
/// A pixel is lit when it is inside the valid mask and above the ADU
/// threshold; the event is a hit when the lit count is strictly above the
/// hit-score threshold. Writes `analysis/hitscore` and `analysis/is_hit`.
pub struct LitPixels {
    adu_threshold: f64,
    hitscore_threshold: f64,
    mask: Option<Array2<bool>>,
}

impl LitPixels {
    pub fn new(params: &StageParams, mask: Option<Array2<bool>>) -> Self {
        Self {
            adu_threshold: params.get_or("aduThreshold", 0.0),
            hitscore_threshold: params.get_or("hitscoreThreshold", 0.0),
            mask,
        }
    }
}

impl AnalysisStage for LitPixels {
    fn name(&self) -> &'static str {
        "litpixels"
    }

    fn process(&mut self, evt: &mut EventRecord) -> Result<(), StageError> {
        let frame = evt
            .get_array2(CAT_DETECTOR, KEY_DETECTOR)
            .ok_or_else(|| missing(KEY_DETECTOR))?;
        if let Some(mask) = &self.mask {
            if mask.dim() != frame.dim() {
                return Err(StageError::WrongType {
                    category: CAT_DETECTOR.to_string(),
                    key: KEY_DETECTOR.to_string(),
                });
            }
        }
        let mut score = 0u64;
        for ((row, col), value) in frame.indexed_iter() {
            let valid = self.mask.as_ref().map_or(true, |m| m[[row, col]]);
            if valid && *value as f64 > self.adu_threshold {
                score += 1;
            }
        }
        let hit = (score as f64) > self.hitscore_threshold;
        evt.insert(CAT_ANALYSIS, KEY_HITSCORE, Value::Scalar(score as f64));
        evt.insert(CAT_ANALYSIS, KEY_IS_HIT, Value::Int(hit as i64));
        Ok(())
    }
}

/// Multi-hit scoring through a Patterson-style symmetry map.
///
/// Runs only on events already flagged as hits. The map is the pixelwise
/// product of the frame with its 180-degree rotation, normalized to the
/// frame maximum; peaks outside the central exclusion disk indicate
/// overlapping particles. Writes `analysis/multiple_score` and, when full
/// output is enabled, the map and its peak mask.
pub struct PattersonMultiples {
    patterson_threshold: f64,
    diameter_pix: f64,
    full_output: bool,
    mask: Option<Array2<bool>>,
}

impl PattersonMultiples {
    pub fn new(params: &StageParams, mask: Option<Array2<bool>>) -> Self {
        Self {
            patterson_threshold: params.get_or("pattersonThreshold", 0.5),
            diameter_pix: params.get_or("pattersonDiameterPix", 8.0),
            full_output: params.get_or("pattersonFullOutput", 0.0) != 0.0,
            mask,
        }
    }
}

impl AnalysisStage for PattersonMultiples {
    fn name(&self) -> &'static str {
        "patterson"
    }

    fn process(&mut self, evt: &mut EventRecord) -> Result<(), StageError> {
        let is_hit = evt.get_int(CAT_ANALYSIS, KEY_IS_HIT).ok_or_else(|| {
            StageError::MissingInput {
                category: CAT_ANALYSIS.to_string(),
                key: KEY_IS_HIT.to_string(),
            }
        })?;
        if is_hit == 0 {
            return Ok(());
        }
        let frame = evt
            .get_array2(CAT_DETECTOR, KEY_DETECTOR)
            .ok_or_else(|| missing(KEY_DETECTOR))?;

        let (rows, cols) = frame.dim();
        let mut masked = frame.clone();
        if let Some(mask) = &self.mask {
            if mask.dim() == masked.dim() {
                for ((row, col), value) in masked.indexed_iter_mut() {
                    if !mask[[row, col]] {
                        *value = 0.0;
                    }
                }
            }
        }
        let peak_value = masked.iter().cloned().fold(0.0f32, f32::max);
        if peak_value <= 0.0 {
            evt.insert(CAT_ANALYSIS, KEY_MULTIPLE_SCORE, Value::Scalar(0.0));
            return Ok(());
        }

        let norm = (peak_value as f64) * (peak_value as f64);
        let mut map = Array2::<f32>::zeros((rows, cols));
        let mut peaks = Array2::<bool>::from_elem((rows, cols), false);
        let center = ((rows / 2) as f64, (cols / 2) as f64);
        let exclusion_sq = (self.diameter_pix / 2.0) * (self.diameter_pix / 2.0);
        let mut score = 0u64;
        for row in 0..rows {
            for col in 0..cols {
                let product = masked[[row, col]] as f64
                    * masked[[rows - 1 - row, cols - 1 - col]] as f64
                    / norm;
                map[[row, col]] = product as f32;
                if product > self.patterson_threshold {
                    let dr = row as f64 - center.0;
                    let dc = col as f64 - center.1;
                    if dr * dr + dc * dc > exclusion_sq {
                        peaks[[row, col]] = true;
                        score += 1;
                    }
                }
            }
        }

        evt.insert(CAT_ANALYSIS, KEY_MULTIPLE_SCORE, Value::Scalar(score as f64));
        if self.full_output {
            evt.insert(CAT_ANALYSIS, KEY_PATTERSON, Value::Array2(map));
            evt.insert(CAT_ANALYSIS, KEY_PATTERSON_MULTIPLES, Value::Mask(peaks));
        }
        Ok(())
    }
}
