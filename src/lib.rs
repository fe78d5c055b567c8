// This crate implements a checkpointed replicated state machine: application
// state is derived by replaying a totally ordered log of committed entries,
// periodic on-disk snapshots bound the cost of that replay, and a
// leadership-scoped "sync" protocol tells callers when their locally applied
// view reflects everything committed under the current term.
//
// The consensus engine which replicates the log is not part of this crate.
// It is consumed through the `raft::Consensus` trait, and whoever owns the
// replay loop drives the apply cursor of the state machine.

pub mod raft;
pub mod stm;
