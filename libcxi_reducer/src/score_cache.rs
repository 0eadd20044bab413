/// Rolling cache of the most recent hit scores.
///
/// A fixed-capacity circular buffer indexed by `event_counter mod capacity`.
/// After M events it holds the scores of the most recent `min(M, capacity)`
/// events; it exists only to provide the end-of-run median summary and is
/// owned by a single reader, never shared.
#[derive(Debug, Clone)]
pub struct RollingScoreCache {
    scores: Vec<f64>,
    capacity: usize,
    seen: u64,
}

pub const DEFAULT_CACHE_LENGTH: usize = 10000;

impl RollingScoreCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            scores: vec![0.0; capacity.max(1)],
            capacity: capacity.max(1),
            seen: 0,
        }
    }

    /// Record the score of the event with the given monotonic counter.
    pub fn push(&mut self, counter: u64, score: f64) {
        self.scores[(counter % self.capacity as u64) as usize] = score;
        self.seen = self.seen.max(counter + 1);
    }

    /// Number of valid entries currently held.
    pub fn len(&self) -> usize {
        self.seen.min(self.capacity as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Median of the held scores, None while empty.
    pub fn median(&self) -> Option<f64> {
        let n = self.len();
        if n == 0 {
            return None;
        }
        let mut scratch = self.scores[..n].to_vec();
        scratch.sort_by(|a, b| a.total_cmp(b));
        if n % 2 == 1 {
            Some(scratch[n / 2])
        } else {
            Some((scratch[n / 2 - 1] + scratch[n / 2]) / 2.0)
        }
    }
}

impl Default for RollingScoreCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(cache: &mut RollingScoreCache, n: u64) {
        for i in 0..n {
            cache.push(i, i as f64);
        }
    }

    #[test]
    fn test_empty() {
        let cache = RollingScoreCache::new(10);
        assert_eq!(cache.len(), 0);
        assert!(cache.median().is_none());
    }

    #[test]
    fn test_below_capacity() {
        let mut cache = RollingScoreCache::new(10);
        fill(&mut cache, 9);
        assert_eq!(cache.len(), 9);
        assert_eq!(cache.median(), Some(4.0));
    }

    #[test]
    fn test_at_capacity() {
        let mut cache = RollingScoreCache::new(10);
        fill(&mut cache, 10);
        assert_eq!(cache.len(), 10);
        assert_eq!(cache.median(), Some(4.5));
    }

    #[test]
    fn test_wrap_around() {
        // M = 3N + 7 events through a cache of N slots
        let n = 10u64;
        let m = 3 * n + 7;
        let mut cache = RollingScoreCache::new(n as usize);
        fill(&mut cache, m);
        assert_eq!(cache.len(), n as usize);
        // Slots hold the most recent N scores: 27..=36 in wrapped order
        let held = cache.median().unwrap();
        assert_eq!(held, (31.0 + 32.0) / 2.0);
    }
}
