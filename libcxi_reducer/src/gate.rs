use ndarray::{Array1, Array2};
use std::collections::BTreeMap;

use super::config::RunState;
use super::record::{
    EventRecord, CAT_ANALYSIS, CAT_DAQ, CAT_DETECTOR, CAT_FEL, CAT_ID, CAT_MOTORS, KEY_DETECTOR,
    KEY_HITSCORE, KEY_IS_HIT, KEY_MULTIPLE_SCORE, KEY_PATTERSON, KEY_PATTERSON_MULTIPLES, KEY_TOF,
};

/// One leaf of the projected output record.
#[derive(Debug, Clone, PartialEq)]
pub enum OutValue {
    Float(f64),
    Int(i64),
    Array1(Array1<f32>),
    Array2(Array2<f32>),
    Bool2(Array2<bool>),
    Mask(Array2<u16>),
}

/// The reduced record persisted for one gated event: group -> key -> leaf,
/// rooted under `entry_1` in the output file.
///
/// BTreeMaps keep leaf iteration order deterministic, so identical inputs
/// project to identical records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputRecord {
    groups: BTreeMap<String, BTreeMap<String, OutValue>>,
}

impl OutputRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, group: &str, key: &str, value: OutValue) {
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get(&self, group: &str, key: &str) -> Option<&OutValue> {
        self.groups.get(group)?.get(key)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Leaves in deterministic (group, key) order.
    pub fn leaves(&self) -> impl Iterator<Item = (&str, &str, &OutValue)> {
        self.groups.iter().flat_map(|(group, keys)| {
            keys.iter()
                .map(move |(key, value)| (group.as_str(), key.as_str(), value))
        })
    }
}

fn is_hit(evt: &EventRecord) -> bool {
    evt.get_int(CAT_ANALYSIS, KEY_IS_HIT).unwrap_or(0) != 0
}

fn is_multiple(evt: &EventRecord, state: &RunState) -> bool {
    evt.get_scalar(CAT_ANALYSIS, KEY_MULTIPLE_SCORE)
        .map_or(false, |score| score > state.multiscore_threshold)
}

/// Decide whether this event's record is persisted.
pub fn should_persist(evt: &EventRecord, state: &RunState) -> bool {
    state.output.save_anything
        && is_hit(evt)
        && (!state.only_save_multiples || is_multiple(evt, state))
}

fn put_int(rec: &mut OutputRecord, evt: &EventRecord, group: &str, key: &str, source_key: &str) {
    match evt.get_int(CAT_ID, source_key) {
        Some(v) => rec.insert(group, key, OutValue::Int(v)),
        None => log::warn!("Cannot find event data {}/{}.", CAT_ID, source_key),
    }
}

fn put_scalar(
    rec: &mut OutputRecord,
    evt: &EventRecord,
    group: &str,
    key: &str,
    category: &str,
    source_key: &str,
) {
    match evt.get_scalar(category, source_key) {
        Some(v) => rec.insert(group, key, OutValue::Float(v)),
        None => log::warn!("Cannot find {} data {}/{}.", group, category, source_key),
    }
}

/// Build the reduced output record for a gated event.
///
/// The schema is a function of the static output flags only; leaves whose
/// source data is missing are omitted with a warning while the record as a
/// whole still persists. The one exception is the TOF trace: when it is
/// configured as required and unreadable, the whole event is skipped (None)
/// and the loop moves on.
pub fn project(evt: &EventRecord, state: &RunState) -> Option<OutputRecord> {
    let tof = if state.output.save_tof {
        match evt.get_array1(CAT_DAQ, KEY_TOF) {
            Some(trace) => Some(trace),
            None => {
                log::warn!("Error when reading TOF data; skipping event.");
                return None;
            }
        }
    } else {
        None
    };

    let mut rec = OutputRecord::new();

    put_int(&mut rec, evt, "event", "bunch_id", "bunch_id");
    put_int(&mut rec, evt, "event", "tv_sec", "tv_sec");
    put_int(&mut rec, evt, "event", "tv_usec", "tv_usec");
    put_int(&mut rec, evt, "event", "dataset_id", "dataset_id");
    put_int(&mut rec, evt, "event", "bunch_sec", "bunch_sec");

    for key in [
        "manualy",
        "injectorx",
        "injectory",
        "trigdelay",
        "samplepress",
        "nozzlepress",
        "posdownstream",
        "posupstream",
        "injectorpress",
        "focusinggas",
    ] {
        put_scalar(&mut rec, evt, "motors", key, CAT_MOTORS, key);
    }

    put_scalar(&mut rec, evt, "FEL", "gmd", CAT_FEL, "gmd");
    put_scalar(&mut rec, evt, "FEL", "wavelength_nm", CAT_FEL, "wavelength_nm");

    put_scalar(
        &mut rec,
        evt,
        "result_1",
        "hitscore_litpixel",
        CAT_ANALYSIS,
        KEY_HITSCORE,
    );
    rec.insert(
        "result_1",
        "hitscore_litpixel_threshold",
        OutValue::Float(state.hitscore_threshold),
    );
    put_scalar(
        &mut rec,
        evt,
        "result_1",
        "multiscore_patterson",
        CAT_ANALYSIS,
        KEY_MULTIPLE_SCORE,
    );
    rec.insert(
        "result_1",
        "multiscore_patterson_threshold",
        OutValue::Float(state.multiscore_threshold),
    );

    if state.output.save_pnccd {
        match evt.get_array2(CAT_DETECTOR, KEY_DETECTOR) {
            Some(frame) => rec.insert("detector_1", "data", OutValue::Array2(frame.clone())),
            None => log::warn!("Cannot find detector data {}/{}.", CAT_DETECTOR, KEY_DETECTOR),
        }
        if state.output.save_multiple {
            if let Some(map) = evt.get_array2(CAT_ANALYSIS, KEY_PATTERSON) {
                rec.insert("detector_1", "patterson", OutValue::Array2(map.clone()));
            }
            if let Some(peaks) = evt.get_mask(CAT_ANALYSIS, KEY_PATTERSON_MULTIPLES) {
                rec.insert(
                    "detector_1",
                    "patterson_mask",
                    OutValue::Bool2(peaks.clone()),
                );
            }
        }
    }

    if let Some(trace) = tof {
        rec.insert("detector_2", "data", OutValue::Array1(trace.clone()));
    }

    Some(rec)
}

/// Dataset-wide artifacts written once per run by the designated reader:
/// the detector bitmask in CXI encoding (512 marks a masked-out pixel).
pub fn build_solo(state: &RunState) -> OutputRecord {
    let mut rec = OutputRecord::new();
    if !state.output.save_pnccd {
        return rec;
    }
    let bitmask = state.center_mask().mapv(|valid| if valid { 0u16 } else { 512u16 });
    rec.insert("detector_1", "mask", OutValue::Mask(bitmask));
    rec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::record::Value;
    use ndarray::Array1;

    fn state_with_level(level: u8) -> RunState {
        let config = Config {
            run_number: 12,
            output_level: level,
            hitscore_threshold: Some(10.0),
            multiscore_threshold: Some(200.0),
            gain_level: Some(16),
            ..Default::default()
        };
        config.resolve().unwrap()
    }

    fn hit_event(hitscore: f64) -> EventRecord {
        let mut evt = EventRecord::new();
        evt.insert(CAT_ANALYSIS, KEY_HITSCORE, Value::Scalar(hitscore));
        evt.insert(
            CAT_ANALYSIS,
            KEY_IS_HIT,
            Value::Int((hitscore > 10.0) as i64),
        );
        evt.insert(CAT_ANALYSIS, KEY_MULTIPLE_SCORE, Value::Scalar(0.0));
        evt.insert(CAT_ID, "bunch_id", Value::Int(1));
        evt.insert(CAT_ID, "tv_sec", Value::Int(2));
        evt.insert(CAT_ID, "tv_usec", Value::Int(3));
        evt.insert(CAT_ID, "dataset_id", Value::Int(12));
        evt.insert(CAT_ID, "bunch_sec", Value::Int(2));
        evt.insert(CAT_FEL, "gmd", Value::Scalar(85.0));
        evt.insert(CAT_FEL, "wavelength_nm", Value::Scalar(5.3));
        evt.insert(CAT_MOTORS, "injectorx", Value::Scalar(1.5));
        evt.insert(
            CAT_DETECTOR,
            KEY_DETECTOR,
            Value::Array2(Array2::zeros((4, 4))),
        );
        evt.insert(CAT_DAQ, KEY_TOF, Value::Array1(Array1::zeros(8)));
        evt
    }

    #[test]
    fn test_gate_requires_hit() {
        let state = state_with_level(3);
        assert!(should_persist(&hit_event(12.0), &state));
        assert!(!should_persist(&hit_event(9.0), &state));
    }

    #[test]
    fn test_gate_level_zero_persists_nothing() {
        let state = state_with_level(0);
        assert!(!should_persist(&hit_event(12.0), &state));
    }

    #[test]
    fn test_gate_multiples_only() {
        let mut state = state_with_level(3);
        state.only_save_multiples = true;
        let mut evt = hit_event(12.0);
        assert!(!should_persist(&evt, &state));
        evt.insert(CAT_ANALYSIS, KEY_MULTIPLE_SCORE, Value::Scalar(250.0));
        assert!(should_persist(&evt, &state));
        // Equal to the threshold is not enough
        evt.insert(CAT_ANALYSIS, KEY_MULTIPLE_SCORE, Value::Scalar(200.0));
        assert!(!should_persist(&evt, &state));
    }

    #[test]
    fn test_projection_level_one_leaves() {
        let state = state_with_level(1);
        let rec = project(&hit_event(12.0), &state).unwrap();
        assert!(rec.has_group("event"));
        assert!(rec.has_group("FEL"));
        assert!(rec.has_group("motors"));
        assert!(rec.has_group("result_1"));
        assert!(!rec.has_group("detector_1"));
        assert!(!rec.has_group("detector_2"));
    }

    #[test]
    fn test_projection_level_three_adds_frame() {
        let state = state_with_level(3);
        let rec = project(&hit_event(12.0), &state).unwrap();
        assert!(matches!(
            rec.get("detector_1", "data"),
            Some(OutValue::Array2(_))
        ));
        assert!(matches!(
            rec.get("detector_2", "data"),
            Some(OutValue::Array1(_))
        ));
    }

    #[test]
    fn test_projection_deterministic() {
        let state = state_with_level(3);
        let evt = hit_event(12.0);
        let a = project(&evt, &state).unwrap();
        let b = project(&evt, &state).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_projection_omits_missing_motor() {
        let state = state_with_level(1);
        let rec = project(&hit_event(12.0), &state).unwrap();
        assert!(rec.get("motors", "injectorx").is_some());
        assert!(rec.get("motors", "focusinggas").is_none());
    }

    #[test]
    fn test_projection_required_tof_missing_skips_event() {
        let state = state_with_level(2);
        let mut evt = hit_event(12.0);
        evt.insert(CAT_DAQ, KEY_TOF, Value::Scalar(0.0)); // unreadable trace
        assert!(project(&evt, &state).is_none());
    }

    #[test]
    fn test_projection_optional_tof_missing_still_persists() {
        let mut state = state_with_level(2);
        state.output.save_tof = false; // skip-tof configured
        let mut evt = hit_event(12.0);
        evt.insert(CAT_DAQ, KEY_TOF, Value::Scalar(0.0));
        let rec = project(&evt, &state).unwrap();
        assert!(!rec.has_group("detector_2"));
    }

    #[test]
    fn test_solo_bitmask_encoding() {
        let mut state = state_with_level(3);
        state.gap_rows = 2;
        state.frame_shape = (8, 4);
        let solo = build_solo(&state);
        match solo.get("detector_1", "mask") {
            Some(OutValue::Mask(mask)) => {
                assert_eq!(mask[[0, 0]], 0);
                assert_eq!(mask[[3, 0]], 512);
            }
            other => panic!("expected mask, got {other:?}"),
        }
    }

    #[test]
    fn test_solo_empty_below_level_three() {
        let state = state_with_level(1);
        assert!(build_solo(&state).is_empty());
    }
}
