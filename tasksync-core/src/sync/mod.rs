//! Sync plumbing shared by every backend.

mod apply;
mod cancel;
mod orchestrator;
mod retry;

use async_trait::async_trait;

use crate::error::SyncResult;
use crate::model::Account;

pub use apply::{ApplyOutcome, RemoteObject, apply_remote};
pub use cancel::Cancellation;
pub use orchestrator::{SyncOrchestrator, SyncOutcome, default_workers};
pub use retry::{REQUEST_TIMEOUT, RetryPolicy};

/// A backend capable of running one sync pass for an account.
#[async_trait]
pub trait AccountSynchronizer: Send + Sync {
    async fn sync_account(&self, account: &Account, cancel: &Cancellation) -> SyncResult<()>;
}

/// Something that can schedule a sync pass for an account.
pub trait SyncRequester: Send + Sync {
    fn request_sync(&self, account: &str);
}
