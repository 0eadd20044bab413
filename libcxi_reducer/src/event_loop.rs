use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

use super::analysis::AnalysisStage;
use super::config::RunState;
use super::cxi_writer::CxiWriter;
use super::error::ProcessorError;
use super::gate;
use super::reader_status::ReaderStatus;
use super::record::{CAT_ANALYSIS, KEY_HITSCORE, KEY_IS_HIT};
use super::score_cache::RollingScoreCache;
use super::translator::Translator;

const STATUS_INTERVAL: u64 = 100;

/// What one reader saw over its whole stream.
#[derive(Debug, Clone, Default)]
pub struct LoopSummary {
    pub events: u64,
    pub hits: u64,
    pub written: u64,
    pub median_hitscore: Option<f64>,
}

/// The per-reader pull-process-gate loop.
///
/// Pulls events from the translator until end-of-stream or the configured
/// frame budget, passes each event through the analysis stages in declared
/// order, records hit scores in the rolling cache, and hands gated events
/// to the writer. A stage failure costs the event that stage's outputs,
/// never the run.
pub struct EventLoop {
    state: Arc<RunState>,
    rank: usize,
    translator: Box<dyn Translator>,
    stages: Vec<Box<dyn AnalysisStage>>,
    cache: RollingScoreCache,
}

impl EventLoop {
    pub fn new(
        state: Arc<RunState>,
        rank: usize,
        translator: Box<dyn Translator>,
        stages: Vec<Box<dyn AnalysisStage>>,
    ) -> Self {
        Self {
            state,
            rank,
            translator,
            stages,
            cache: RollingScoreCache::default(),
        }
    }

    /// Run to completion. `writer` is None when the output level persists
    /// nothing; the loop still runs the full analysis for the summary.
    pub fn run(
        &mut self,
        mut writer: Option<&mut CxiWriter>,
        tx: &Sender<ReaderStatus>,
    ) -> Result<LoopSummary, ProcessorError> {
        let started = Instant::now();
        let mut events = 0u64;
        let mut hits = 0u64;
        let mut written = 0u64;

        loop {
            if let Some(limit) = self.state.frame_limit {
                if events >= limit {
                    log::info!(
                        "Reader {} reached its frame budget of {} events",
                        self.rank,
                        limit
                    );
                    break;
                }
            }
            let Some(mut evt) = self.translator.next_event()? else {
                break;
            };
            let counter = events;
            events += 1;

            for stage in self.stages.iter_mut() {
                if let Err(e) = stage.process(&mut evt) {
                    log::warn!(
                        "Reader {}: stage {} skipped for event {}: {}",
                        self.rank,
                        stage.name(),
                        counter,
                        e
                    );
                }
            }

            if let Some(score) = evt.get_scalar(CAT_ANALYSIS, KEY_HITSCORE) {
                self.cache.push(counter, score);
            }
            if evt.get_int(CAT_ANALYSIS, KEY_IS_HIT).unwrap_or(0) != 0 {
                hits += 1;
            }

            if gate::should_persist(&evt, &self.state) {
                if let Some(w) = writer.as_deref_mut() {
                    if let Some(record) = gate::project(&evt, &self.state) {
                        w.write_slice(record)?;
                        written += 1;
                    }
                }
            }

            if events % STATUS_INTERVAL == 0 {
                let rate = events as f64 / started.elapsed().as_secs_f64().max(1e-9);
                log::info!("Reader {}: {} events at {:.1} Hz", self.rank, events, rate);
                tx.send(ReaderStatus::new(self.progress(events), self.rank, events, hits))?;
            }
        }

        tx.send(ReaderStatus::new(1.0, self.rank, events, hits))?;
        Ok(LoopSummary {
            events,
            hits,
            written,
            median_hitscore: self.cache.median(),
        })
    }

    fn progress(&self, events: u64) -> f32 {
        match self.state.frame_limit {
            Some(limit) if limit > 0 => (events as f32 / limit as f32).min(1.0),
            _ => -1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::default_stages;
    use crate::config::Config;
    use crate::record::EventRecord;
    use crate::translator::{build_translator, Translator};
    use std::sync::mpsc::channel;

    fn state(n_events: u64, nr_frames: Option<u64>) -> Arc<RunState> {
        Arc::new(
            Config {
                run_number: 3,
                output_level: 0,
                hitscore_threshold: Some(10.0),
                multiscore_threshold: Some(1.0e9),
                gain_level: Some(64),
                dummy_n_events: n_events,
                nr_frames,
                frame_shape: [32, 32],
                ..Default::default()
            }
            .resolve()
            .unwrap(),
        )
    }

    #[test]
    fn test_dry_run_counts_hits() {
        let state = state(30, None);
        let translator = build_translator(&state, 0).unwrap();
        let stages = default_stages(&state);
        let mut event_loop = EventLoop::new(state, 0, translator, stages);
        let (tx, _rx) = channel();
        let summary = event_loop.run(None, &tx).unwrap();
        assert_eq!(summary.events, 30);
        // The dummy stream lights up every third frame
        assert_eq!(summary.hits, 10);
        assert_eq!(summary.written, 0);
        assert!(summary.median_hitscore.is_some());
    }

    #[test]
    fn test_frame_budget_stops_loop() {
        let state = state(30, Some(12));
        let translator = build_translator(&state, 0).unwrap();
        let stages = default_stages(&state);
        let mut event_loop = EventLoop::new(state, 0, translator, stages);
        let (tx, _rx) = channel();
        let summary = event_loop.run(None, &tx).unwrap();
        assert_eq!(summary.events, 12);
    }

    struct Barren {
        remaining: u64,
    }

    impl Translator for Barren {
        fn next_event(
            &mut self,
        ) -> Result<Option<EventRecord>, crate::error::TranslatorError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(EventRecord::new()))
        }
    }

    #[test]
    fn test_stage_failure_is_soft() {
        // Events without detector frames make every stage fail; the loop
        // must still drain the stream
        let state = state(0, None);
        let stages = default_stages(&state);
        let mut event_loop =
            EventLoop::new(state, 0, Box::new(Barren { remaining: 5 }), stages);
        let (tx, _rx) = channel();
        let summary = event_loop.run(None, &tx).unwrap();
        assert_eq!(summary.events, 5);
        assert_eq!(summary.hits, 0);
        assert!(summary.median_hitscore.is_none());
    }
}
