use crate::raft::{Consensus, EngineError, EngineResult};
use async_trait::async_trait;
use futures::channel::oneshot;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

// A fake implementation of the Consensus trait for testing purposes. Tests
// script the cursors directly; pending commit-index waits resolve as soon as
// the scripted state satisfies their stop condition.
pub struct FakeConsensus {
    state: Mutex<FakeState>,
    refresh_calls: AtomicUsize,
    commit_waits: AtomicUsize,
}

struct FakeState {
    term: i64,
    leader: bool,
    committed: i64,
    dirty: i64,
    start: i64,
    waiters: Vec<CommitWaiter>,
}

struct CommitWaiter {
    offset: i64,
    term: i64,
    sender: oneshot::Sender<()>,
}

impl FakeConsensus {
    pub fn new() -> Self {
        FakeConsensus {
            state: Mutex::new(FakeState {
                term: 1,
                leader: true,
                committed: -1,
                dirty: -1,
                start: 0,
                waiters: Vec::new(),
            }),
            refresh_calls: AtomicUsize::new(0),
            commit_waits: AtomicUsize::new(0),
        }
    }

    pub fn set_term(&self, term: i64) {
        let mut state = self.state.lock().unwrap();
        state.term = term;
        Self::resolve_waiters(&mut state);
    }

    pub fn set_leader(&self, leader: bool) {
        self.state.lock().unwrap().leader = leader;
    }

    pub fn set_committed(&self, offset: i64) {
        let mut state = self.state.lock().unwrap();
        state.committed = offset;
        Self::resolve_waiters(&mut state);
    }

    pub fn set_dirty(&self, offset: i64) {
        self.state.lock().unwrap().dirty = offset;
    }

    pub fn set_start_offset(&self, offset: i64) {
        self.state.lock().unwrap().start = offset;
    }

    // Number of refresh_commit_index calls observed so far.
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    // Number of wait_commit_index calls observed so far.
    pub fn commit_waits(&self) -> usize {
        self.commit_waits.load(Ordering::SeqCst)
    }

    fn resolve_waiters(state: &mut FakeState) {
        let term = state.term;
        let committed = state.committed;
        let waiters = std::mem::take(&mut state.waiters);
        for waiter in waiters {
            if committed >= waiter.offset || term > waiter.term {
                waiter.sender.send(()).ok();
            } else {
                state.waiters.push(waiter);
            }
        }
    }
}

#[async_trait]
impl Consensus for FakeConsensus {
    fn term(&self) -> i64 {
        self.state.lock().unwrap().term
    }

    fn is_leader(&self) -> bool {
        self.state.lock().unwrap().leader
    }

    fn committed_offset(&self) -> i64 {
        self.state.lock().unwrap().committed
    }

    fn dirty_offset(&self) -> i64 {
        self.state.lock().unwrap().dirty
    }

    fn start_offset(&self) -> i64 {
        self.state.lock().unwrap().start
    }

    async fn refresh_commit_index(&self) -> EngineResult<()> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_commit_index(
        &self,
        offset: i64,
        term: i64,
        timeout: Duration,
    ) -> EngineResult<()> {
        self.commit_waits.fetch_add(1, Ordering::SeqCst);
        let receiver = {
            let mut state = self.state.lock().unwrap();
            if state.committed >= offset || state.term > term {
                return Ok(());
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push(CommitWaiter {
                offset,
                term,
                sender,
            });
            receiver
        };
        match async_std::future::timeout(timeout, receiver).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(EngineError::ShuttingDown),
            Err(_) => Err(EngineError::Timeout(timeout)),
        }
    }
}
