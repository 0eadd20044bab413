use fxhash::FxHashMap;
use ndarray::{Array1, Array2};

// Category and key names shared between translators, analysis stages and
// the projection. Raw categories are filled by the translator; the
// "analysis" category is owned by the stages.
pub const CAT_DETECTOR: &str = "photonPixelDetectors";
pub const KEY_DETECTOR: &str = "pnccd";
pub const CAT_ID: &str = "ID";
pub const CAT_FEL: &str = "FEL";
pub const CAT_MOTORS: &str = "motorPositions";
pub const CAT_DAQ: &str = "DAQ";
pub const KEY_TOF: &str = "TOF";
pub const CAT_ANALYSIS: &str = "analysis";
pub const KEY_HITSCORE: &str = "hitscore";
pub const KEY_IS_HIT: &str = "is_hit";
pub const KEY_MULTIPLE_SCORE: &str = "multiple_score";
pub const KEY_PATTERSON: &str = "patterson";
pub const KEY_PATTERSON_MULTIPLES: &str = "patterson_multiples";

/// A single typed value in an event record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Int(i64),
    Text(String),
    Array1(Array1<f32>),
    Array2(Array2<f32>),
    Mask(Array2<bool>),
}

/// The in-memory record for one acquisition event.
///
/// A nested (category, key) -> Value map, populated incrementally: the
/// translator fills the raw categories and analysis stages append derived
/// ones. Lookups return `Option`; a missing category or key is a normal,
/// recoverable condition.
#[derive(Debug, Clone, Default)]
pub struct EventRecord {
    categories: FxHashMap<String, FxHashMap<String, Value>>,
}

impl EventRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, creating the category on first use.
    pub fn insert(&mut self, category: &str, key: &str, value: Value) {
        self.categories
            .entry(category.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn get(&self, category: &str, key: &str) -> Option<&Value> {
        self.categories.get(category)?.get(key)
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    /// Scalar lookup; integers are widened so stages can treat counts as scores.
    pub fn get_scalar(&self, category: &str, key: &str) -> Option<f64> {
        match self.get(category, key)? {
            Value::Scalar(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn get_int(&self, category: &str, key: &str) -> Option<i64> {
        match self.get(category, key)? {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn get_array1(&self, category: &str, key: &str) -> Option<&Array1<f32>> {
        match self.get(category, key)? {
            Value::Array1(a) => Some(a),
            _ => None,
        }
    }

    pub fn get_array2(&self, category: &str, key: &str) -> Option<&Array2<f32>> {
        match self.get(category, key)? {
            Value::Array2(a) => Some(a),
            _ => None,
        }
    }

    pub fn get_mask(&self, category: &str, key: &str) -> Option<&Array2<bool>> {
        match self.get(category, key)? {
            Value::Mask(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_is_none() {
        let mut record = EventRecord::new();
        record.insert(CAT_FEL, "gmd", Value::Scalar(85.0));
        assert_eq!(record.get_scalar(CAT_FEL, "gmd"), Some(85.0));
        assert!(record.get(CAT_FEL, "wavelength_nm").is_none());
        assert!(record.get(CAT_MOTORS, "injectorx").is_none());
        assert!(!record.has_category(CAT_ANALYSIS));
    }

    #[test]
    fn test_typed_lookups() {
        let mut record = EventRecord::new();
        record.insert(CAT_ID, "bunch_id", Value::Int(42));
        record.insert(
            CAT_DAQ,
            KEY_TOF,
            Value::Array1(Array1::from_elem(16, 1.0f32)),
        );
        assert_eq!(record.get_int(CAT_ID, "bunch_id"), Some(42));
        // Ints widen to scalars, arrays do not
        assert_eq!(record.get_scalar(CAT_ID, "bunch_id"), Some(42.0));
        assert!(record.get_scalar(CAT_DAQ, KEY_TOF).is_none());
        assert_eq!(record.get_array1(CAT_DAQ, KEY_TOF).map(|a| a.len()), Some(16));
    }

    #[test]
    fn test_insert_overwrites() {
        let mut record = EventRecord::new();
        record.insert(CAT_ANALYSIS, KEY_HITSCORE, Value::Scalar(3.0));
        record.insert(CAT_ANALYSIS, KEY_HITSCORE, Value::Scalar(7.0));
        assert_eq!(record.get_scalar(CAT_ANALYSIS, KEY_HITSCORE), Some(7.0));
    }
}
