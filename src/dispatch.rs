//! Routes a sync pass to the synchronizer of the account's backend.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use tasksync_core::error::{SyncError, SyncResult};
use tasksync_core::model::{Account, Backend};
use tasksync_core::store::TaskStore;
use tasksync_core::sync::{AccountSynchronizer, Cancellation, RetryPolicy};
use tasksync_provider_caldav::{CaldavSynchronizer, LibdavTransport};
use tasksync_provider_journal::{
    DerivedKey, HttpJournalClient, JournalKeyCache, JournalSynchronizer,
};

use crate::session::{Credentials, Session};

pub struct BackendDispatcher {
    store: Arc<dyn TaskStore>,
    keys: Arc<JournalKeyCache>,
    sessions: PathBuf,
    retry: RetryPolicy,
    zone: Tz,
}

impl BackendDispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        keys: Arc<JournalKeyCache>,
        sessions: PathBuf,
        retry: RetryPolicy,
        zone: Tz,
    ) -> Self {
        BackendDispatcher {
            store,
            keys,
            sessions,
            retry,
            zone,
        }
    }

    fn credentials(&self, account: &Account) -> SyncResult<Credentials> {
        Session::load_from(&self.sessions, &account.id)
            .map(|s| s.credentials)
            .map_err(|e| SyncError::Config(format!("{:#}", e)))
    }
}

fn wrong_credentials(account: &Account) -> SyncError {
    SyncError::Config(format!(
        "Stored credentials of {} do not match its {} backend",
        account.name,
        account.backend.kind_name()
    ))
}

#[async_trait]
impl AccountSynchronizer for BackendDispatcher {
    async fn sync_account(&self, account: &Account, cancel: &Cancellation) -> SyncResult<()> {
        match &account.backend {
            Backend::CalDav { url, username, .. } => {
                let Credentials::CalDav { password } = self.credentials(account)? else {
                    return Err(wrong_credentials(account));
                };
                let transport = LibdavTransport::connect(url, username, &password)?;
                CaldavSynchronizer::new(self.store.clone(), Arc::new(transport))
                    .with_retry(self.retry)
                    .with_zone(self.zone)
                    .sync(account, cancel)
                    .await
            }
            Backend::Journal { url, .. } => {
                let Credentials::Journal {
                    token,
                    encryption_key,
                } = self.credentials(account)?
                else {
                    return Err(wrong_credentials(account));
                };
                if self.keys.derived_key(&account.id).is_none() {
                    self.keys
                        .init(&account.id, DerivedKey::from_base64(&encryption_key)?);
                }
                let transport = HttpJournalClient::new(url, token)?;
                JournalSynchronizer::new(self.store.clone(), Arc::new(transport), self.keys.clone())
                    .with_retry(self.retry)
                    .with_zone(self.zone)
                    .sync(account, cancel)
                    .await
            }
            Backend::ListOnly { provider } => {
                log::info!(
                    "No synchronizer for {} ({} lists), skipping",
                    account.name,
                    provider
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasksync_core::store::LocalStore;

    fn dispatcher(sessions: PathBuf) -> BackendDispatcher {
        BackendDispatcher::new(
            Arc::new(LocalStore::in_memory()),
            Arc::new(JournalKeyCache::new()),
            sessions,
            RetryPolicy::default(),
            Tz::UTC,
        )
    }

    #[tokio::test]
    async fn list_only_accounts_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::new(
            "gtasks",
            "Google Tasks",
            Backend::ListOnly {
                provider: "google-tasks".into(),
            },
        );

        dispatcher(dir.path().to_path_buf())
            .sync_account(&account, &Cancellation::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_credentials_are_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let account = Account::new(
            "dav",
            "dav",
            Backend::CalDav {
                url: "https://dav.example.com/".into(),
                username: "user1".into(),
                family: Default::default(),
                tasks_org: false,
            },
        );

        let err = dispatcher(dir.path().to_path_buf())
            .sync_account(&account, &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn mismatched_credentials_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        Session::new(
            "ete",
            Credentials::CalDav {
                password: "secret".into(),
            },
        )
        .save_in(dir.path())
        .unwrap();
        let account = Account::new(
            "ete",
            "ete",
            Backend::Journal {
                url: "https://journal.example.com/".into(),
                username: "alice".into(),
            },
        );

        let err = dispatcher(dir.path().to_path_buf())
            .sync_account(&account, &Cancellation::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
