use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::trace;

use crate::error::FailureKind;
use crate::EditionId;

/// Number of past snapshots handed to a late subscriber.
pub const REPLAY_DEPTH: usize = 10;
const CHANNEL_CAPACITY: usize = 256;

/// Download status of a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEntry {
    Loading { current: u64, total: u64 },
    Success,
    Error(FailureKind),
}

pub type Snapshot = Arc<BTreeMap<EditionId, ProgressEntry>>;

/// Observable map of file identifier to download status.
///
/// Every change publishes a full copy of the map. Publishing never waits on
/// subscribers: a subscriber that falls behind skips to newer snapshots.
#[derive(Clone)]
pub struct ProgressLedger {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<LedgerState>,
    tx: broadcast::Sender<Snapshot>,
}

struct LedgerState {
    current: Snapshot,
    replay: VecDeque<Snapshot>,
}

impl ProgressLedger {
    pub fn new() -> Self {
        Self::with_completed(std::iter::empty())
    }

    /// Seeds the ledger with `Success` for files already on disk.
    pub fn with_completed(ids: impl IntoIterator<Item = EditionId>) -> Self {
        let current: BTreeMap<_, _> = ids
            .into_iter()
            .map(|id| (id, ProgressEntry::Success))
            .collect();
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LedgerState {
                    current: Arc::new(current),
                    replay: VecDeque::with_capacity(REPLAY_DEPTH),
                }),
                tx,
            }),
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().current.clone()
    }

    pub fn get(&self, id: EditionId) -> Option<ProgressEntry> {
        self.lock().current.get(&id).copied()
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        // Holding the lock keeps a concurrent publish from landing between
        // the replay copy and the receiver registration.
        let state = self.lock();
        ProgressSubscription {
            replay: state.replay.clone(),
            rx: self.inner.tx.subscribe(),
        }
    }

    pub(crate) fn set(&self, id: EditionId, entry: ProgressEntry) {
        self.publish(|map| {
            map.insert(id, entry);
        });
    }

    pub(crate) fn remove(&self, id: EditionId) {
        self.publish(|map| {
            map.remove(&id);
        });
    }

    fn publish(&self, mutate: impl FnOnce(&mut BTreeMap<EditionId, ProgressEntry>)) {
        let mut state = self.lock();
        let mut next = (*state.current).clone();
        mutate(&mut next);
        let next = Arc::new(next);
        state.current = next.clone();
        if state.replay.len() == REPLAY_DEPTH {
            state.replay.pop_front();
        }
        state.replay.push_back(next.clone());
        // No subscribers is not an error.
        let receivers = self.inner.tx.send(next).unwrap_or(0);
        trace!(receivers, "published progress snapshot");
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // The state is replaced wholesale, so a poisoned guard still holds a
        // consistent snapshot.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ProgressLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of ledger snapshots, starting with the replay buffer.
pub struct ProgressSubscription {
    replay: VecDeque<Snapshot>,
    rx: broadcast::Receiver<Snapshot>,
}

impl ProgressSubscription {
    /// Next snapshot, or `None` once the ledger is gone.
    pub async fn next(&mut self) -> Option<Snapshot> {
        if let Some(snapshot) = self.replay.pop_front() {
            return Some(snapshot);
        }
        loop {
            match self.rx.recv().await {
                Ok(snapshot) => return Some(snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(skipped, "progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Aggregate view of a snapshot, as shown by a "downloading..." indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub active: usize,
    pub current: u64,
    pub total: u64,
}

impl ProgressSummary {
    pub fn of(snapshot: &BTreeMap<EditionId, ProgressEntry>) -> Self {
        snapshot
            .values()
            .fold(Self::default(), |mut acc, entry| {
                if let ProgressEntry::Loading { current, total } = *entry {
                    acc.active += 1;
                    acc.current += current;
                    acc.total += total;
                }
                acc
            })
    }

    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        (self.current.min(self.total) * 100 / self.total) as u8
    }
}
