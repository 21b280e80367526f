//! Backend-neutral core of tasksync: the task model, the local store contract,
//! the VTODO codec, the task mover and sync orchestration.

pub mod error;
pub mod ics;
pub mod model;
pub mod mover;
pub mod store;
pub mod sync;

pub use error::{StoreError, StoreResult, SyncError, SyncResult};
pub use mover::{MoveReport, TaskMover};
pub use store::{LocalStore, TaskStore};
pub use sync::{
    AccountSynchronizer, Cancellation, RetryPolicy, SyncOrchestrator, SyncOutcome, SyncRequester,
};
