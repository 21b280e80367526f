//! Process-wide key material of journal accounts.
//!
//! Entries are created when an account is added or its session loaded and
//! dropped when the account is removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::crypto::DerivedKey;

#[derive(Clone)]
struct AccountKeys {
    derived: DerivedKey,
    /// Decrypted from the user info on first use
    account_key: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct JournalKeyCache {
    accounts: Mutex<HashMap<String, AccountKeys>>,
}

static GLOBAL: OnceLock<Arc<JournalKeyCache>> = OnceLock::new();

impl JournalKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by every synchronizer in this process.
    pub fn global() -> Arc<JournalKeyCache> {
        GLOBAL.get_or_init(|| Arc::new(JournalKeyCache::new())).clone()
    }

    fn with<T>(&self, f: impl FnOnce(&mut HashMap<String, AccountKeys>) -> T) -> T {
        let mut accounts = self
            .accounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut accounts)
    }

    /// Register the password-derived key of an account, forgetting any
    /// account key cached for a previous password.
    pub fn init(&self, account: &str, derived: DerivedKey) {
        self.with(|accounts| {
            accounts.insert(
                account.to_string(),
                AccountKeys {
                    derived,
                    account_key: None,
                },
            );
        });
    }

    pub fn clear(&self, account: &str) {
        self.with(|accounts| {
            accounts.remove(account);
        });
    }

    pub fn derived_key(&self, account: &str) -> Option<DerivedKey> {
        self.with(|accounts| accounts.get(account).map(|keys| keys.derived.clone()))
    }

    pub fn account_key(&self, account: &str) -> Option<Vec<u8>> {
        self.with(|accounts| accounts.get(account).and_then(|keys| keys.account_key.clone()))
    }

    /// Remember the decrypted account key; ignored for unknown accounts.
    pub fn set_account_key(&self, account: &str, key: Vec<u8>) {
        self.with(|accounts| {
            if let Some(keys) = accounts.get_mut(account) {
                keys.account_key = Some(key);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleared_account_has_no_keys() {
        let cache = JournalKeyCache::new();
        cache.init("work", DerivedKey::from_bytes([1u8; 32]));
        cache.set_account_key("work", vec![2u8; 32]);

        assert!(cache.derived_key("work").is_some());
        assert_eq!(cache.account_key("work"), Some(vec![2u8; 32]));

        cache.clear("work");
        assert!(cache.derived_key("work").is_none());
        assert!(cache.account_key("work").is_none());
    }

    #[test]
    fn reinit_drops_stale_account_key() {
        let cache = JournalKeyCache::new();
        cache.init("work", DerivedKey::from_bytes([1u8; 32]));
        cache.set_account_key("work", vec![2u8; 32]);
        cache.init("work", DerivedKey::from_bytes([3u8; 32]));

        assert!(cache.account_key("work").is_none());
        cache.set_account_key("other", vec![4u8; 32]);
        assert!(cache.account_key("other").is_none());
    }

    #[test]
    fn global_cache_is_shared() {
        JournalKeyCache::global().init("shared-test", DerivedKey::from_bytes([5u8; 32]));
        assert!(JournalKeyCache::global().derived_key("shared-test").is_some());
        JournalKeyCache::global().clear("shared-test");
    }
}
