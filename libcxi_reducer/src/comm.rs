use std::sync::{Arc, Condvar, Mutex};

use super::error::CommError;

/// Collective operations between the cooperating readers of one run.
///
/// Every reader holds its own handle. `barrier` and `exchange_counts` are
/// collective: each participant blocks until all of them have arrived, so a
/// reader must never skip a collective call its peers will make. `abort`
/// poisons the communicator; all current and future waiters observe
/// `CommError::Aborted` instead of blocking forever on a peer that died.
pub trait Communicator: Send {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self) -> Result<(), CommError>;
    /// Deposit this reader's pending count and receive everyone's, indexed
    /// by rank. No participant proceeds until all have deposited.
    fn exchange_counts(&self, pending: u64) -> Result<Vec<u64>, CommError>;
    fn abort(&self);
    fn is_aborted(&self) -> bool;
}

#[derive(Debug)]
struct CommState {
    aborted: bool,
    barrier_arrived: usize,
    barrier_generation: u64,
    deposit: Vec<u64>,
    deposited: usize,
    exchange_generation: u64,
    exchanged: Vec<u64>,
}

/// Communicator for readers running as threads of one process.
#[derive(Debug)]
pub struct LocalComm {
    size: usize,
    state: Mutex<CommState>,
    signal: Condvar,
}

impl LocalComm {
    /// Create the shared state and one handle per reader rank.
    pub fn create(size: usize) -> Vec<CommHandle> {
        let shared = Arc::new(LocalComm {
            size,
            state: Mutex::new(CommState {
                aborted: false,
                barrier_arrived: 0,
                barrier_generation: 0,
                deposit: vec![0; size],
                deposited: 0,
                exchange_generation: 0,
                exchanged: vec![0; size],
            }),
            signal: Condvar::new(),
        });
        (0..size)
            .map(|rank| CommHandle {
                shared: shared.clone(),
                rank,
            })
            .collect()
    }
}

/// One reader's endpoint of a [`LocalComm`].
#[derive(Debug, Clone)]
pub struct CommHandle {
    shared: Arc<LocalComm>,
    rank: usize,
}

impl Communicator for CommHandle {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<(), CommError> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| CommError::Poisoned)?;
        if state.aborted {
            return Err(CommError::Aborted);
        }
        state.barrier_arrived += 1;
        if state.barrier_arrived == self.shared.size {
            state.barrier_arrived = 0;
            state.barrier_generation += 1;
            self.shared.signal.notify_all();
            return Ok(());
        }
        let generation = state.barrier_generation;
        while state.barrier_generation == generation && !state.aborted {
            state = self
                .shared
                .signal
                .wait(state)
                .map_err(|_| CommError::Poisoned)?;
        }
        if state.aborted {
            Err(CommError::Aborted)
        } else {
            Ok(())
        }
    }

    fn exchange_counts(&self, pending: u64) -> Result<Vec<u64>, CommError> {
        let mut state = self
            .shared
            .state
            .lock()
            .map_err(|_| CommError::Poisoned)?;
        if state.aborted {
            return Err(CommError::Aborted);
        }
        state.deposit[self.rank] = pending;
        state.deposited += 1;
        if state.deposited == self.shared.size {
            state.exchanged = state.deposit.clone();
            state.deposit.iter_mut().for_each(|c| *c = 0);
            state.deposited = 0;
            state.exchange_generation += 1;
            self.shared.signal.notify_all();
            return Ok(state.exchanged.clone());
        }
        let generation = state.exchange_generation;
        while state.exchange_generation == generation && !state.aborted {
            state = self
                .shared
                .signal
                .wait(state)
                .map_err(|_| CommError::Poisoned)?;
        }
        if state.aborted {
            Err(CommError::Aborted)
        } else {
            Ok(state.exchanged.clone())
        }
    }

    fn abort(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.aborted = true;
        }
        self.shared.signal.notify_all();
    }

    fn is_aborted(&self) -> bool {
        match self.shared.state.lock() {
            Ok(state) => state.aborted,
            Err(_) => true,
        }
    }
}

/// A contiguous block of record slots owned by one reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub rank: usize,
    pub start: u64,
    pub len: u64,
}

impl Reservation {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    cursor: u64,
    history: Vec<Reservation>,
}

/// Negotiates exclusive regions of the shared output dataset.
///
/// Every flush reserves its slot range here before touching the file; the
/// monotone cursor guarantees the handed-out ranges are pairwise disjoint
/// across readers, so concurrent flushes never overlap on disk.
#[derive(Debug, Default)]
pub struct RegionLedger {
    inner: Mutex<LedgerState>,
}

impl RegionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, rank: usize, len: u64) -> Result<Reservation, CommError> {
        let mut state = self.inner.lock().map_err(|_| CommError::Poisoned)?;
        let reservation = Reservation {
            rank,
            start: state.cursor,
            len,
        };
        state.cursor += len;
        state.history.push(reservation.clone());
        Ok(reservation)
    }

    /// Total number of record slots handed out so far.
    pub fn total(&self) -> Result<u64, CommError> {
        Ok(self.inner.lock().map_err(|_| CommError::Poisoned)?.cursor)
    }

    pub fn history(&self) -> Result<Vec<Reservation>, CommError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| CommError::Poisoned)?
            .history
            .clone())
    }
}
