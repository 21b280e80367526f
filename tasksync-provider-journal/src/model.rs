//! Wire types of the journal API and their encrypted payloads.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tasksync_core::error::{SyncError, SyncResult};

use crate::crypto::{CURRENT_VERSION, CryptoManager, DerivedKey};

/// Collection type of task journals.
pub const TYPE_TASKS: &str = "TASKS";

const USER_INFO_SALT: &str = "userInfo";
const JOURNAL_KEYS_SALT: &str = "journalKeys";

fn decode_blob(what: &str, blob: &str) -> SyncResult<Vec<u8>> {
    STANDARD
        .decode(blob)
        .map_err(|e| SyncError::Integrity(format!("{} is not valid base64: {}", what, e)))
}

/// Per-user key material stored on the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub owner: String,
    pub version: u8,
    /// Account key sealed with the password-derived key
    pub content: String,
}

impl UserInfo {
    pub fn seal(owner: &str, derived: &DerivedKey, account_key: &[u8]) -> SyncResult<Self> {
        let crypto = CryptoManager::new(CURRENT_VERSION, derived.as_bytes(), USER_INFO_SALT)?;
        Ok(UserInfo {
            owner: owner.to_string(),
            version: CURRENT_VERSION,
            content: STANDARD.encode(crypto.encrypt(account_key)?),
        })
    }

    pub fn account_key(&self, derived: &DerivedKey) -> SyncResult<Vec<u8>> {
        let crypto = CryptoManager::new(self.version, derived.as_bytes(), USER_INFO_SALT)?;
        crypto.decrypt(&decode_blob("User info", &self.content)?)
    }
}

/// Decrypted description of a journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl CollectionInfo {
    pub fn tasks(display_name: impl Into<String>) -> Self {
        CollectionInfo {
            kind: TYPE_TASKS.to_string(),
            display_name: display_name.into(),
            color: None,
        }
    }

    pub fn is_tasks(&self) -> bool {
        self.kind == TYPE_TASKS
    }
}

/// A journal as listed by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Journal {
    pub uid: String,
    pub version: u8,
    #[serde(default)]
    pub owner: Option<String>,
    /// Sealed [`CollectionInfo`]
    pub content: String,
    /// Journal key sealed with the account key; absent when the key is
    /// derived from the password
    #[serde(default)]
    pub key: Option<String>,
    /// Uid of the newest entry
    #[serde(default)]
    pub last_uid: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

impl Journal {
    /// Build a journal whose key derives from the password and its uid.
    pub fn seal(uid: &str, derived: &DerivedKey, info: &CollectionInfo) -> SyncResult<Self> {
        let crypto = CryptoManager::new(CURRENT_VERSION, derived.as_bytes(), uid)?;
        Ok(Journal {
            uid: uid.to_string(),
            version: CURRENT_VERSION,
            owner: None,
            content: seal_json(&crypto, info)?,
            key: None,
            last_uid: None,
            read_only: false,
        })
    }

    /// Build a journal with its own key, sealed with the account key.
    pub fn seal_with_key(
        uid: &str,
        account_key: &[u8],
        journal_key: &[u8],
        info: &CollectionInfo,
    ) -> SyncResult<Self> {
        let keyring = CryptoManager::new(CURRENT_VERSION, account_key, JOURNAL_KEYS_SALT)?;
        let crypto = CryptoManager::new(CURRENT_VERSION, journal_key, uid)?;
        Ok(Journal {
            uid: uid.to_string(),
            version: CURRENT_VERSION,
            owner: None,
            content: seal_json(&crypto, info)?,
            key: Some(STANDARD.encode(keyring.encrypt(journal_key)?)),
            last_uid: None,
            read_only: false,
        })
    }

    /// Keys for this journal's content and entries.
    ///
    /// `account_key` is only needed for journals that carry their own key.
    pub fn crypto(
        &self,
        derived: &DerivedKey,
        account_key: Option<&[u8]>,
    ) -> SyncResult<CryptoManager> {
        let Some(sealed_key) = &self.key else {
            return CryptoManager::new(self.version, derived.as_bytes(), &self.uid);
        };
        let account_key = account_key.ok_or_else(|| {
            SyncError::Integrity(format!(
                "Journal {} has a key but no user info exists",
                self.uid
            ))
        })?;
        let keyring = CryptoManager::new(CURRENT_VERSION, account_key, JOURNAL_KEYS_SALT)?;
        let journal_key = keyring.decrypt(&decode_blob("Journal key", sealed_key)?)?;
        CryptoManager::new(self.version, &journal_key, &self.uid)
    }

    /// Verify and decrypt the collection info.
    pub fn collection_info(&self, crypto: &CryptoManager) -> SyncResult<CollectionInfo> {
        open_json(crypto, "Collection info", &self.content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Add,
    Change,
    Delete,
}

/// Decrypted entry content: an action and the VTODO it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub action: Action,
    pub content: String,
}

/// An entry as stored on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedEntry {
    pub uid: String,
    pub content: String,
}

impl EncryptedEntry {
    /// Seal `entry` and chain it to `prev`.
    pub fn seal(crypto: &CryptoManager, prev: Option<&str>, entry: &SyncEntry) -> SyncResult<Self> {
        let json = serde_json::to_vec(entry).map_err(|e| SyncError::Codec(e.to_string()))?;
        let sealed = crypto.encrypt(&json)?;
        Ok(EncryptedEntry {
            uid: crypto.entry_uid(prev, &sealed)?,
            content: STANDARD.encode(sealed),
        })
    }

    /// Verify the chain link to `prev`, then decrypt.
    pub fn open(&self, crypto: &CryptoManager, prev: Option<&str>) -> SyncResult<SyncEntry> {
        let sealed = decode_blob("Entry", &self.content)?;
        crypto.verify_entry(&self.uid, prev, &sealed)?;
        let json = crypto.decrypt(&sealed)?;
        serde_json::from_slice(&json).map_err(|e| {
            SyncError::Integrity(format!("Entry {} is not a sync entry: {}", self.uid, e))
        })
    }
}

fn seal_json<T: Serialize>(crypto: &CryptoManager, value: &T) -> SyncResult<String> {
    let json = serde_json::to_vec(value).map_err(|e| SyncError::Codec(e.to_string()))?;
    Ok(STANDARD.encode(crypto.encrypt(&json)?))
}

fn open_json<T: for<'de> Deserialize<'de>>(
    crypto: &CryptoManager,
    what: &str,
    blob: &str,
) -> SyncResult<T> {
    let json = crypto.decrypt(&decode_blob(what, blob)?)?;
    serde_json::from_slice(&json)
        .map_err(|e| SyncError::Integrity(format!("{} is malformed: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derived() -> DerivedKey {
        DerivedKey::from_bytes([3u8; 32])
    }

    #[test]
    fn entry_json_uses_upper_case_actions() {
        let entry = SyncEntry {
            action: Action::Change,
            content: "BEGIN:VCALENDAR".into(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"action":"CHANGE","content":"BEGIN:VCALENDAR"}"#);
    }

    #[test]
    fn journal_wire_format_is_camel_case() {
        let journal: Journal = serde_json::from_str(
            r#"{"uid":"j1","version":2,"content":"","lastUid":"abc","readOnly":true}"#,
        )
        .unwrap();
        assert_eq!(journal.last_uid.as_deref(), Some("abc"));
        assert!(journal.read_only);
        assert!(journal.key.is_none());
    }

    #[test]
    fn entries_open_only_on_their_own_chain() {
        let journal = Journal::seal("j1", &derived(), &CollectionInfo::tasks("Inbox")).unwrap();
        let crypto = journal.crypto(&derived(), None).unwrap();
        let entry = SyncEntry {
            action: Action::Add,
            content: "BEGIN:VCALENDAR".into(),
        };

        let first = EncryptedEntry::seal(&crypto, None, &entry).unwrap();
        let second = EncryptedEntry::seal(&crypto, Some(&first.uid), &entry).unwrap();

        assert_eq!(second.open(&crypto, Some(&first.uid)).unwrap(), entry);
        assert!(matches!(
            second.open(&crypto, None),
            Err(SyncError::Integrity(_))
        ));
    }

    #[test]
    fn journal_with_own_key_needs_account_key() {
        let account_key = [9u8; 32];
        let info = CollectionInfo::tasks("Shared");
        let journal = Journal::seal_with_key("j2", &account_key, &[5u8; 32], &info).unwrap();

        let crypto = journal.crypto(&derived(), Some(&account_key)).unwrap();
        assert_eq!(journal.collection_info(&crypto).unwrap(), info);
        assert!(journal.crypto(&derived(), None).is_err());
    }

    #[test]
    fn user_info_round_trips_account_key() {
        let user = UserInfo::seal("alice", &derived(), &[4u8; 32]).unwrap();
        assert_eq!(user.account_key(&derived()).unwrap(), vec![4u8; 32]);

        let wrong = DerivedKey::from_bytes([1u8; 32]);
        assert!(matches!(
            user.account_key(&wrong),
            Err(SyncError::Integrity(_))
        ));
    }
}
