/// Progress report sent by a reader thread to the UI channel.
///
/// `progress` is a 0..1 fraction of the reader's frame budget, or -1.0 when
/// no budget is configured and only the counters are meaningful.
#[derive(Debug, Clone, Default)]
pub struct ReaderStatus {
    pub progress: f32,
    pub rank: usize,
    pub events: u64,
    pub hits: u64,
}

impl ReaderStatus {
    pub fn new(progress: f32, rank: usize, events: u64, hits: u64) -> Self {
        Self {
            progress,
            rank,
            events,
            hits,
        }
    }
}
