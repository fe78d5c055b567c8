mod codec;
pub use codec::{SNAPSHOT_FORMAT, SNAPSHOT_FORMAT_V0, SnapshotHeader, StmSnapshot, decode, encode};

mod error;
pub use error::{StmError, StmResult};

mod machine;
pub use machine::PersistedStateMachine;

mod snapshot_store;
pub use snapshot_store::{SnapshotManager, SnapshotWriter};

mod state_machine;
pub use state_machine::{StateMachineHooks, StateMachineResult};

#[cfg(test)]
pub mod testing;
