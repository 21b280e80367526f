//! Runs sync passes across accounts.
//!
//! Accounts sync concurrently on a bounded pool; a pass requested while one
//! is already running for the same account is folded into a single follow-up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{AccountSynchronizer, Cancellation, SyncRequester};
use crate::error::SyncError;
use crate::model::AccountId;
use crate::store::TaskStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Synced,
    Failed(String),
    /// Folded into the pass already running for this account
    Coalesced,
    Cancelled,
    /// The account no longer exists
    Skipped,
}

struct InFlight {
    rerun: bool,
    cancel: Cancellation,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    store: Arc<dyn TaskStore>,
    synchronizer: Arc<dyn AccountSynchronizer>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<AccountId, InFlight>>>,
}

/// Worker count used when none is configured.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        synchronizer: Arc<dyn AccountSynchronizer>,
        max_workers: Option<usize>,
    ) -> Self {
        let workers = max_workers.unwrap_or_else(default_workers).max(1);
        log::debug!("Sync pool sized to {} workers", workers);
        SyncOrchestrator {
            store,
            synchronizer,
            permits: Arc::new(Semaphore::new(workers)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<AccountId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sync every account once, concurrently.
    pub async fn sync_all(&self) -> Vec<(AccountId, SyncOutcome)> {
        let accounts = match self.store.accounts() {
            Ok(accounts) => accounts,
            Err(e) => {
                log::error!("Could not load accounts: {}", e);
                return Vec::new();
            }
        };

        let mut set = JoinSet::new();
        for account in accounts {
            let this = self.clone();
            set.spawn(async move {
                let outcome = this.sync_account(&account.id).await;
                (account.id, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => log::error!("Sync task panicked: {}", e),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }

    /// Sync one account, or coalesce into the pass already running for it.
    pub async fn sync_account(&self, id: &str) -> SyncOutcome {
        let cancel = {
            let mut in_flight = self.in_flight();
            if let Some(running) = in_flight.get_mut(id) {
                log::debug!("Sync already running for {}, scheduling a follow-up", id);
                running.rerun = true;
                return SyncOutcome::Coalesced;
            }
            let cancel = Cancellation::new();
            in_flight.insert(
                id.to_string(),
                InFlight {
                    rerun: false,
                    cancel: cancel.clone(),
                },
            );
            cancel
        };

        loop {
            let outcome = self.run_once(id, &cancel).await;

            let rerun = {
                let mut in_flight = self.in_flight();
                match in_flight.get_mut(id) {
                    Some(running) if running.rerun && !cancel.is_cancelled() => {
                        running.rerun = false;
                        true
                    }
                    _ => {
                        in_flight.remove(id);
                        false
                    }
                }
            };

            if !rerun {
                return outcome;
            }
            log::debug!("Running follow-up sync for {}", id);
        }
    }

    /// Abandon the running pass of an account, if any.
    pub fn cancel_account(&self, id: &str) {
        if let Some(running) = self.in_flight().get(id) {
            log::info!("Cancelling sync of {}", id);
            running.cancel.cancel();
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.in_flight().contains_key(id)
    }

    async fn run_once(&self, id: &str, cancel: &Cancellation) -> SyncOutcome {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => return SyncOutcome::Failed("Sync pool closed".into()),
        };

        let account = match self.store.fetch_account(id) {
            Ok(Some(account)) => account,
            Ok(None) => return SyncOutcome::Skipped,
            Err(e) => return SyncOutcome::Failed(e.to_string()),
        };

        log::info!("Syncing {} ({})", account.name, account.backend.kind_name());

        match self.synchronizer.sync_account(&account, cancel).await {
            Ok(()) => {
                if let Err(e) = self.store.set_account_error(id, None) {
                    log::warn!("Could not clear error of {}: {}", id, e);
                }
                SyncOutcome::Synced
            }
            Err(SyncError::Cancelled) => {
                log::info!("Sync of {} cancelled", account.name);
                SyncOutcome::Cancelled
            }
            Err(e) => {
                let message = e.to_string();
                log::error!("Sync of {} failed: {}", account.name, message);
                if let Err(e) = self.store.set_account_error(id, Some(&message)) {
                    log::warn!("Could not record error of {}: {}", id, e);
                }
                SyncOutcome::Failed(message)
            }
        }
    }
}

impl SyncRequester for SyncOrchestrator {
    fn request_sync(&self, account: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime available to sync {}", account);
            return;
        };
        let this = self.clone();
        let account = account.to_string();
        handle.spawn(async move {
            this.sync_account(&account).await;
        });
    }
}
