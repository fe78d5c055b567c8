use async_trait::async_trait;
use bytes::Bytes;

use crate::stm::codec::{SnapshotHeader, StmSnapshot};

// Outcome of state machine operations which the application may reject,
// reported as a human-readable message.
pub type StateMachineResult = Result<(), String>;

// The application-specific half of a persisted state machine. The derived
// state itself lives behind this trait: the replay loop applies committed
// entries into it, and the snapshot scheduler reads it back out. Both run
// under the same lock, so a snapshot never observes a half-applied entry.
#[async_trait]
pub trait StateMachineHooks: Send {
    // Produces a snapshot of the derived state covering every entry applied
    // up to and including the supplied offset. The payload must be
    // self-consistent, it is restored verbatim by apply_snapshot.
    async fn take_snapshot(&mut self, covered_offset: i64) -> StmSnapshot;

    // Restores the derived state from a snapshot payload. Invoked at most
    // once, during startup hydration.
    async fn apply_snapshot(
        &mut self,
        header: &SnapshotHeader,
        data: Bytes,
    ) -> StateMachineResult;

    // The highest offset the log layer may evict. Implementations that
    // still need older entries can hold eviction back by returning a lower
    // offset.
    fn max_collectible_offset(&self) -> i64 {
        i64::MAX
    }
}
