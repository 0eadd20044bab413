use std::path::Path;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use super::analysis::default_stages;
use super::comm::{CommHandle, Communicator, LocalComm};
use super::config::{Config, RunState};
use super::cxi_writer::{CxiWriter, SharedCxi};
use super::error::ProcessorError;
use super::event_loop::{EventLoop, LoopSummary};
use super::finalize;
use super::gate;
use super::reader_status::ReaderStatus;
use super::translator::build_translator;

/// The outcome of a clean run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub events: u64,
    pub hits: u64,
    pub records_written: u64,
    pub n_frames: u64,
    /// Median hit score seen by the main reader.
    pub median_hitscore: Option<f64>,
}

/// The main entry point of cxi_reducer.
///
/// Resolves the configuration, spawns one reader thread per configured
/// reader and joins them, then finalizes and publishes the output file on
/// the calling thread. Readers report progress through `tx`. Any reader
/// failure aborts the run's collectives so no peer keeps writing, and the
/// temporary file is left unpublished.
pub fn run(config: &Config, tx: &Sender<ReaderStatus>) -> Result<RunSummary, ProcessorError> {
    let state = Arc::new(config.resolve()?);
    log::info!("hitscore threshold: {}", state.hitscore_threshold);
    log::info!("multiscore threshold: {}", state.multiscore_threshold);

    let shared = if state.output.save_anything {
        let parent = state.temp_path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)?;
        Some(SharedCxi::create(&state.temp_path, state.chunk_size)?)
    } else {
        None
    };

    let comms = LocalComm::create(state.n_readers);
    let mut threads = Vec::new();
    for (rank, comm) in comms.into_iter().enumerate() {
        let state = state.clone();
        let shared = shared.clone();
        let tx = tx.clone();
        threads.push(std::thread::spawn(move || {
            reader_task(&state, rank, comm, shared, tx)
        }));
    }

    let mut summaries: Vec<LoopSummary> = Vec::new();
    let mut failure: Option<ProcessorError> = None;
    let mut panicked: Option<usize> = None;
    for (rank, thread) in threads.into_iter().enumerate() {
        match thread.join() {
            Ok(Ok(summary)) => summaries.push(summary),
            Ok(Err(e)) => {
                // Prefer the root cause over secondary abort fallout
                let replace = match &failure {
                    None => true,
                    Some(existing) => is_abort_fallout(existing) && !is_abort_fallout(&e),
                };
                if replace {
                    failure = Some(e);
                }
            }
            Err(_) => panicked = Some(rank),
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    if let Some(rank) = panicked {
        return Err(ProcessorError::ReaderPanicked(rank));
    }

    let n_frames = if state.output.save_anything {
        finalize::finalize(&state)?
    } else {
        0
    };

    let summary = RunSummary {
        events: summaries.iter().map(|s| s.events).sum(),
        hits: summaries.iter().map(|s| s.hits).sum(),
        records_written: summaries.iter().map(|s| s.written).sum(),
        n_frames,
        median_hitscore: summaries.first().and_then(|s| s.median_hitscore),
    };
    if let Some(median) = summary.median_hitscore {
        log::info!(
            "Run {}: Median hit score is {:.1}.",
            state.run_number,
            median
        );
    }
    log::info!("Clean exit");
    Ok(summary)
}

/// A reader that fails because a peer aborted the collectives carries no
/// information about the actual fault.
fn is_abort_fallout(error: &ProcessorError) -> bool {
    matches!(
        error,
        ProcessorError::CommError(_)
            | ProcessorError::WriterError(super::error::WriterError::CommError(_))
    )
}

/// One reader: build the translator and stages, run the loop, then drain
/// through the end-of-run protocol. Errors poison the communicator before
/// returning so peers blocked in collectives observe the failure too.
fn reader_task(
    state: &Arc<RunState>,
    rank: usize,
    comm: CommHandle,
    shared: Option<Arc<SharedCxi>>,
    tx: Sender<ReaderStatus>,
) -> Result<LoopSummary, ProcessorError> {
    let result = reader_task_inner(state, rank, &comm, shared, tx);
    if result.is_err() {
        comm.abort();
    }
    result
}

fn reader_task_inner(
    state: &Arc<RunState>,
    rank: usize,
    comm: &CommHandle,
    shared: Option<Arc<SharedCxi>>,
    tx: Sender<ReaderStatus>,
) -> Result<LoopSummary, ProcessorError> {
    let translator = build_translator(state, rank)?;
    let stages = default_stages(state);
    let mut writer = shared.map(|s| CxiWriter::new(s, Box::new(comm.clone())));

    let mut event_loop = EventLoop::new(state.clone(), rank, translator, stages);
    let summary = event_loop.run(writer.as_mut(), &tx)?;

    if let Some(mut writer) = writer {
        if rank == 0 {
            let solo = gate::build_solo(state);
            if !solo.is_empty() {
                writer.write_solo(&solo)?;
            }
        }
        // The barrier shortcut is only sound for one or two readers
        writer.close(state.n_readers > 2)?;
    }
    Ok(summary)
}
