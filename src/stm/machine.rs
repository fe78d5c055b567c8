use async_std::sync::{Arc, Mutex as AsyncMutex};
use async_std::task;
use futures::channel::{mpsc, oneshot};
use futures::future::Shared;
use futures::{FutureExt, StreamExt};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::raft::Consensus;
use crate::stm::codec;
use crate::stm::codec::StmSnapshot;
use crate::stm::error::{StmError, StmResult};
use crate::stm::snapshot_store::SnapshotManager;
use crate::stm::state_machine::StateMachineHooks;

// A replicated state machine whose derived state is periodically snapshotted
// to disk, so that a restart only replays the suffix of the log not yet
// covered by a snapshot.
//
// Also implements the leader "sync" protocol: sync() resolves once the
// locally applied state reflects every entry committed under the current
// leadership term, which is the consistency guarantee leader-side reads
// build on.
//
// The replay loop itself lives with whoever owns the consensus engine. It
// applies committed entries into the hooks object and reports progress
// through advance_to(). After start(), if next_offset() is below the
// engine's start offset the local snapshot predates the retained log range;
// the loop must then reset the derived state, reposition via set_next() and
// catch up from the log floor.
pub struct PersistedStateMachine {
    name: String,
    consensus: Arc<dyn Consensus>,
    hooks: Arc<AsyncMutex<dyn StateMachineHooks + Send>>,
    snapshots: SnapshotManager,

    // Serializes all snapshot-producing operations so that at most one
    // snapshot write is ever in flight.
    op_lock: AsyncMutex<()>,

    // Small shared bookkeeping, never held across a suspension point.
    state: Mutex<SyncState>,
    apply: Mutex<ApplyCursor>,

    // Resolved exactly once when startup hydration completes. Snapshot
    // operations wait on this so they never race with the initial load.
    hydrated_rx: Shared<oneshot::Receiver<()>>,
    hydrated_tx: Mutex<Option<oneshot::Sender<()>>>,

    // Tracks in-flight background snapshot writes so shutdown drains them
    // instead of abandoning a half-written file.
    gate: Gate,
}

struct SyncState {
    // Term for which a sync has last validated freshness.
    insync_term: Option<i64>,

    // True while a sync attempt is in flight. Later callers ride that
    // attempt instead of starting their own.
    catching_up: bool,
    sync_waiters: Vec<oneshot::Sender<bool>>,

    // Highest offset known to be durably covered by a snapshot.
    last_snapshot_offset: i64,
}

struct ApplyCursor {
    // First offset not yet applied into the derived state.
    next: i64,

    listener_uid: i64,
    listeners: BTreeSet<ApplyListener>,
}

impl PersistedStateMachine {
    pub fn new(
        name: &str,
        consensus: Arc<dyn Consensus>,
        hooks: Arc<AsyncMutex<dyn StateMachineHooks + Send>>,
        snapshots: SnapshotManager,
    ) -> Self {
        let (hydrated_tx, hydrated_rx) = oneshot::channel();
        PersistedStateMachine {
            name: name.to_string(),
            consensus,
            hooks,
            snapshots,
            op_lock: AsyncMutex::new(()),
            state: Mutex::new(SyncState {
                insync_term: None,
                catching_up: false,
                sync_waiters: Vec::new(),
                last_snapshot_offset: -1,
            }),
            apply: Mutex::new(ApplyCursor {
                next: 0,
                listener_uid: 0,
                listeners: BTreeSet::new(),
            }),
            hydrated_rx: hydrated_rx.shared(),
            hydrated_tx: Mutex::new(Some(hydrated_tx)),
            gate: Gate::new(),
        }
    }

    // Runs startup hydration exactly once: loads the latest usable snapshot
    // (if any), restores the derived state from it and positions the apply
    // cursor. An error from this method means the on-disk snapshot exists
    // but cannot be trusted; the process must not continue replaying on top
    // of unknown state, so callers treat it as fatal.
    pub async fn start(&self) -> StmResult<()> {
        let maybe_snapshot = match self.load_snapshot().await {
            Ok(s) => s,
            Err(e) => {
                return Err(StmError::Hydration {
                    path: self.snapshot_path(),
                    source: Box::new(e),
                });
            }
        };

        match maybe_snapshot {
            Some(snapshot) => {
                let next = snapshot.header.offset + 1;
                if next >= self.consensus.start_offset() {
                    let header = snapshot.header.clone();
                    self.hooks
                        .lock()
                        .await
                        .apply_snapshot(&header, snapshot.data)
                        .await
                        .map_err(|message| StmError::Hydration {
                            path: self.snapshot_path(),
                            source: Box::new(StmError::RestoreRejected(message)),
                        })?;
                    info!(
                        "[{}] Restored snapshot covering offset {}",
                        self.name, snapshot.header.offset
                    );
                } else {
                    // An out-of-date replica rejoining after its peers have
                    // evicted entries past our snapshot. Nothing is
                    // restored; the apply loop detects the gap and forces a
                    // fresh catch-up.
                    warn!(
                        "[{}] Skipping snapshot {} since it's out of sync with the log",
                        self.name,
                        self.snapshot_path()
                    );
                }
                self.set_next(next);
            }
            None => {
                let offset = self.consensus.start_offset();
                if offset >= 0 {
                    self.set_next(offset);
                }
            }
        }

        self.resolve_hydrated();
        Ok(())
    }

    // Waits for any in-flight background snapshot to finish, then prevents
    // new ones from starting.
    pub async fn stop(&self) {
        self.gate.close().await;
        debug!("[{}] Stopped", self.name);
    }

    // Reads and decodes the on-disk snapshot. A missing file and the
    // recognized legacy format both mean "no usable snapshot".
    async fn load_snapshot(&self) -> StmResult<Option<StmSnapshot>> {
        let contents = match self.snapshots.open_snapshot().await? {
            Some(contents) => contents,
            None => return Ok(None),
        };

        match codec::decode(contents)? {
            Some(snapshot) => {
                self.snapshots.remove_partial_snapshots().await?;
                Ok(Some(snapshot))
            }
            None => {
                warn!(
                    "[{}] Skipping snapshot {} due to old format",
                    self.name,
                    self.snapshot_path()
                );
                Ok(None)
            }
        }
    }

    fn snapshot_path(&self) -> String {
        self.snapshots.snapshot_path().display().to_string()
    }

    async fn wait_for_snapshot_hydrated(&self) {
        // The sender is only dropped once resolved (or with the whole
        // machine), so either outcome means hydration is no longer pending.
        let _ = self.hydrated_rx.clone().await;
    }

    fn resolve_hydrated(&self) {
        if let Some(sender) = self.hydrated_tx.lock().unwrap().take() {
            sender.send(()).ok();
        }
    }

    // Positions the apply cursor. Called during hydration, and by the apply
    // loop owner when recovering from log eviction.
    pub fn set_next(&self, offset: i64) {
        let mut cursor = self.apply.lock().unwrap();
        cursor.next = offset;
        Self::resolve_listeners(&mut cursor);
    }

    // Reports that the entry at `offset` has been applied into the derived
    // state. Called by the apply loop after each entry.
    pub fn advance_to(&self, offset: i64) {
        let mut cursor = self.apply.lock().unwrap();
        if offset + 1 > cursor.next {
            cursor.next = offset + 1;
        }
        Self::resolve_listeners(&mut cursor);
    }

    // First offset not yet applied into the derived state.
    pub fn next_offset(&self) -> i64 {
        self.apply.lock().unwrap().next
    }

    // Highest offset applied into the derived state so far, or -1.
    pub fn in_sync_offset(&self) -> i64 {
        self.apply.lock().unwrap().next - 1
    }

    // Highest offset known to be durably covered by a snapshot. The log
    // layer consults this when deciding how far it may evict.
    pub fn last_snapshot_offset(&self) -> i64 {
        self.state.lock().unwrap().last_snapshot_offset
    }

    // Upper bound on log eviction imposed by the application, defaulting to
    // no limit.
    pub async fn max_collectible_offset(&self) -> i64 {
        self.hooks.lock().await.max_collectible_offset()
    }

    // Takes a snapshot of the current derived state and persists it.
    pub async fn make_snapshot(&self) -> StmResult<()> {
        let _guard = self.op_lock.lock().await;
        self.wait_for_snapshot_hydrated().await;
        self.do_make_snapshot().await
    }

    // Guarantees that a persisted snapshot covers at least `target_offset`
    // before returning. A snapshot that already covers the target makes
    // this a no-op, so repeated calls issue at most one write.
    pub async fn ensure_snapshot_exists(&self, target_offset: i64) -> StmResult<()> {
        let _guard = self.op_lock.lock().await;
        self.wait_for_snapshot_hydrated().await;

        if target_offset <= self.last_snapshot_offset() {
            return Ok(());
        }

        self.wait_applied(target_offset).await?;
        let in_sync = self.in_sync_offset();
        assert!(
            target_offset <= in_sync,
            "[{}] Apply cursor at {} after waiting for offset {}",
            self.name,
            in_sync,
            target_offset,
        );
        self.do_make_snapshot().await
    }

    // Schedules a snapshot write without waiting for it. The write runs
    // under the shutdown gate, so stop() drains it rather than abandoning
    // it mid-write.
    pub fn make_snapshot_in_background(self: Arc<Self>) {
        let Some(guard) = self.gate.enter() else {
            debug!(
                "[{}] Ignoring background snapshot request during shutdown",
                self.name
            );
            return;
        };
        task::spawn(async move {
            let _guard = guard;
            if let Err(e) = self.make_snapshot().await {
                warn!("[{}] Background snapshot failed: {}", self.name, e);
            }
        });
    }

    async fn do_make_snapshot(&self) -> StmResult<()> {
        let covered = self.in_sync_offset();
        let snapshot = self.hooks.lock().await.take_snapshot(covered).await;
        let offset = snapshot.header.offset;
        self.persist_snapshot(snapshot).await?;

        let mut state = self.state.lock().unwrap();
        state.last_snapshot_offset = state.last_snapshot_offset.max(offset);
        Ok(())
    }

    async fn persist_snapshot(&self, snapshot: StmSnapshot) -> StmResult<()> {
        let offset = snapshot.header.offset;
        let encoded = codec::encode(&snapshot);

        let mut writer = self.snapshots.start_snapshot().await?;
        writer.write(&encoded).await?;
        self.snapshots.finish_snapshot(writer).await?;

        debug!(
            "[{}] Persisted snapshot covering offset {}",
            self.name, offset
        );
        Ok(())
    }

    // Returns true once the locally applied state reflects everything
    // committed under the current leadership term. Concurrent callers
    // coalesce onto a single in-flight attempt and share its outcome. A
    // false return only means "not known to be in sync yet"; callers may
    // retry.
    pub async fn sync(&self, timeout: Duration) -> bool {
        let term = self.consensus.term();
        if !self.consensus.is_leader() {
            return false;
        }

        {
            let mut state = self.state.lock().unwrap();
            if state.insync_term == Some(term) {
                // A previous sync already validated freshness for this term.
                return true;
            }
            if state.catching_up {
                let (sender, receiver) = oneshot::channel();
                state.sync_waiters.push(sender);
                drop(state);

                // Ride the in-flight attempt, bounded by our own deadline.
                return match async_std::future::timeout(timeout, receiver).await {
                    Ok(Ok(outcome)) => outcome,
                    _ => false,
                };
            }
            state.catching_up = true;
        }

        let dirty = self.consensus.dirty_offset();
        let synced = match self.consensus.refresh_commit_index().await {
            Ok(()) => self.do_sync(timeout, dirty, term).await,
            Err(e) => {
                error!(
                    "[{}] sync error: refresh_commit_index failed with {}",
                    self.name, e
                );
                false
            }
        };

        let waiters = {
            let mut state = self.state.lock().unwrap();
            state.catching_up = false;
            std::mem::take(&mut state.sync_waiters)
        };
        for waiter in waiters {
            waiter.send(synced).ok();
        }
        synced
    }

    // The commit-then-apply wait at the heart of sync: first make sure
    // everything appended under `term` is committed, then wait for the
    // local apply cursor to catch up to it.
    async fn do_sync(&self, timeout: Duration, offset: i64, term: i64) -> bool {
        let committed = self.consensus.committed_offset();
        let mut offset = offset;

        if offset > committed {
            if let Err(e) = self
                .consensus
                .wait_commit_index(offset, term, timeout)
                .await
            {
                error!(
                    "[{}] sync error: commit wait failed with {}; offsets: dirty={}, committed={}",
                    self.name, e, offset, committed
                );
                return false;
            }
        } else {
            offset = committed;
        }

        if self.consensus.term() != term {
            // Leadership moved on while we waited, nothing is guaranteed
            // anymore.
            return false;
        }

        if let Err(e) = self.wait_applied_with_timeout(offset, timeout).await {
            error!(
                "[{}] sync error: waiting for offset {} failed with {}; committed offset={}",
                self.name, offset, e, committed
            );
            return false;
        }

        self.state.lock().unwrap().insync_term = Some(term);
        true
    }

    // Like the bounded apply wait, but reports failure as a boolean rather
    // than an error.
    pub async fn wait_no_throw(&self, offset: i64, timeout: Duration) -> bool {
        match self.wait_applied_with_timeout(offset, timeout).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "[{}] Error waiting for offset {}: {}",
                    self.name, offset, e
                );
                false
            }
        }
    }

    // Suspends until the apply cursor covers `offset`.
    async fn wait_applied(&self, offset: i64) -> StmResult<()> {
        match self.add_apply_listener(offset).await {
            Ok(()) => Ok(()),
            Err(oneshot::Canceled) => Err(StmError::WaitAbandoned(offset)),
        }
    }

    async fn wait_applied_with_timeout(&self, offset: i64, timeout: Duration) -> StmResult<()> {
        let receiver = self.add_apply_listener(offset);
        match async_std::future::timeout(timeout, receiver).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(oneshot::Canceled)) => Err(StmError::WaitAbandoned(offset)),
            Err(_) => Err(StmError::WaitTimeout(offset)),
        }
    }

    fn add_apply_listener(&self, offset: i64) -> oneshot::Receiver<()> {
        let mut cursor = self.apply.lock().unwrap();
        let (sender, receiver) = oneshot::channel();
        let uid = cursor.listener_uid;
        cursor.listeners.insert(ApplyListener {
            offset,
            sender,
            uid,
        });
        cursor.listener_uid += 1;

        // Resolves immediately if the cursor is already past the offset.
        Self::resolve_listeners(&mut cursor);
        receiver
    }

    fn resolve_listeners(cursor: &mut ApplyCursor) {
        let applied = cursor.next - 1;
        while cursor
            .listeners
            .first()
            .is_some_and(|listener| listener.offset <= applied)
        {
            let next = cursor.listeners.pop_first().expect("get first");
            next.sender
                .send(())
                .map_err(|_| debug!("Apply waiter for offset {} no longer listening", next.offset))
                .ok();
        }
    }
}

// Each instance represents a caller waiting for the apply cursor to reach a
// given offset.
struct ApplyListener {
    offset: i64,

    // Used to notify the waiting caller.
    sender: oneshot::Sender<()>,

    // Used to disambiguate between listeners for the same offset.
    uid: i64,
}

impl Eq for ApplyListener {}

impl PartialEq<Self> for ApplyListener {
    fn eq(&self, other: &Self) -> bool {
        (self.offset, self.uid).eq(&(other.offset, other.uid))
    }
}

impl PartialOrd<Self> for ApplyListener {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ApplyListener {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.offset, self.uid).cmp(&(other.offset, other.uid))
    }
}

// Tracks in-flight background work. Each tracked task holds a clone of the
// channel sender; once the gate's own sender is taken and every task clone
// has been dropped, the stream ends and close() returns.
struct Gate {
    sender: Mutex<Option<mpsc::Sender<()>>>,
    receiver: Mutex<Option<mpsc::Receiver<()>>>,
}

struct GateGuard {
    _sender: mpsc::Sender<()>,
}

impl Gate {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(1);
        Gate {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    // Returns a guard keeping the gate open, or None if it is closing.
    fn enter(&self) -> Option<GateGuard> {
        self.sender
            .lock()
            .unwrap()
            .clone()
            .map(|sender| GateGuard { _sender: sender })
    }

    async fn close(&self) {
        drop(self.sender.lock().unwrap().take());
        let receiver = self.receiver.lock().unwrap().take();
        if let Some(mut receiver) = receiver {
            while receiver.next().await.is_some() {}
        }
    }
}
