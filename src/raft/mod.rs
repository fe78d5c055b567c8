// Interface boundary to the consensus engine this crate sits on top of. The
// engine owns leader election, log replication and the committed-index
// computation; the state machine layer only consumes the cursors and wait
// primitives below.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[cfg(test)]
pub mod testing;

/// A specialized `Result` type for engine wait primitives.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reported by the consensus engine. All of them are transient from
/// the state machine's point of view.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Internal engine error: {0}")]
    Internal(String),
}

// The consensus engine as seen by a state machine replica. One instance is
// bound to exactly one replicated log.
#[async_trait]
pub trait Consensus: Send + Sync {
    // Current leadership term.
    fn term(&self) -> i64;

    // Whether this replica currently believes it is the leader.
    fn is_leader(&self) -> bool;

    // Highest offset known to be committed across a quorum, or -1.
    fn committed_offset(&self) -> i64;

    // Highest offset appended locally, possibly not yet committed, or -1.
    fn dirty_offset(&self) -> i64;

    // First offset still retained in the log. Entries below it have been
    // evicted. Negative while the log is empty.
    fn start_offset(&self) -> i64;

    // Asks the engine to refresh its view of the committed index. Needed
    // where local knowledge can be stale, e.g. right after winning an
    // election or in a single-node group.
    async fn refresh_commit_index(&self) -> EngineResult<()>;

    // Resolves once the committed offset reaches `offset` or the term moves
    // past `term`, whichever happens first. Errs if neither happens within
    // the timeout.
    async fn wait_commit_index(
        &self,
        offset: i64,
        term: i64,
        timeout: Duration,
    ) -> EngineResult<()>;
}
