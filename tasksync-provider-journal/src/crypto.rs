//! Key derivation, sealing and entry hashing for encrypted journals.
//!
//! Every journal is read through a [`CryptoManager`] holding two keys
//! derived from the journal key: one seals payloads with AES-256-GCM, the
//! other authenticates the hash chain of entry uids.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use tasksync_core::error::{SyncError, SyncResult};

type HmacSha256 = Hmac<Sha256>;

/// Newest journal schema this client understands.
pub const CURRENT_VERSION: u8 = 2;

/// PBKDF2 rounds for the password-derived key.
pub const PBKDF2_ROUNDS: u32 = 100_000;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Key derived from the account's encryption password.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    /// PBKDF2-HMAC-SHA256 of the password, salted with the username.
    pub fn derive(username: &str, password: &str) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            username.as_bytes(),
            PBKDF2_ROUNDS,
            &mut key,
        );
        DerivedKey(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        DerivedKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> SyncResult<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| SyncError::Config(format!("Invalid encryption key: {}", e)))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            SyncError::Config(format!("Encryption key must be {} bytes", KEY_LEN))
        })?;
        Ok(DerivedKey(key))
    }
}

// Never print key material
impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

/// Fresh random key material, used for account and journal keys.
pub fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> SyncResult<[u8; KEY_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| SyncError::Integrity(format!("Invalid HMAC key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

pub struct CryptoManager {
    version: u8,
    cipher_key: [u8; KEY_LEN],
    mac_key: [u8; KEY_LEN],
}

impl CryptoManager {
    /// Derive the keys of one journal from `key`, bound to `salt` (usually
    /// the journal uid).
    pub fn new(version: u8, key: &[u8], salt: &str) -> SyncResult<Self> {
        if version > CURRENT_VERSION {
            return Err(SyncError::VersionTooNew {
                found: version,
                supported: CURRENT_VERSION,
            });
        }
        if version == 0 {
            return Err(SyncError::Integrity("Journal version 0 is invalid".into()));
        }

        let base = hmac_sha256(key, &[salt.as_bytes()])?;
        Ok(CryptoManager {
            version,
            cipher_key: hmac_sha256(&base, &[b"cipher"])?,
            mac_key: hmac_sha256(&base, &[b"mac"])?,
        })
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Seal `plaintext`; the random nonce is prepended to the ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> SyncResult<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.cipher_key)
            .map_err(|e| SyncError::Integrity(format!("Invalid cipher key: {}", e)))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SyncError::Integrity("Encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> SyncResult<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(SyncError::Integrity("Ciphertext too short".into()));
        }
        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.cipher_key)
            .map_err(|e| SyncError::Integrity(format!("Invalid cipher key: {}", e)))?;

        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SyncError::Integrity("Decryption failed".into()))
    }

    /// Uid of an entry: HMAC of the previous uid and the entry's ciphertext.
    pub fn entry_uid(&self, prev: Option<&str>, ciphertext: &[u8]) -> SyncResult<String> {
        let prev = prev.unwrap_or_default();
        let digest = hmac_sha256(&self.mac_key, &[prev.as_bytes(), ciphertext])?;
        Ok(hex::encode(digest))
    }

    /// Check that `uid` chains to `prev` over `ciphertext`.
    pub fn verify_entry(&self, uid: &str, prev: Option<&str>, ciphertext: &[u8]) -> SyncResult<()> {
        let expected = hex::decode(uid)
            .map_err(|_| SyncError::Integrity(format!("Malformed entry uid {}", uid)))?;

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .map_err(|e| SyncError::Integrity(format!("Invalid HMAC key: {}", e)))?;
        mac.update(prev.unwrap_or_default().as_bytes());
        mac.update(ciphertext);
        mac.verify_slice(&expected)
            .map_err(|_| SyncError::Integrity(format!("Entry {} does not match its content", uid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(salt: &str) -> CryptoManager {
        CryptoManager::new(CURRENT_VERSION, &[7u8; 32], salt).unwrap()
    }

    #[test]
    fn sealed_payload_opens_with_same_keys() {
        let crypto = manager("journal-1");
        let sealed = crypto.encrypt(b"BEGIN:VCALENDAR").unwrap();

        assert_ne!(&sealed[NONCE_LEN..], b"BEGIN:VCALENDAR");
        assert_eq!(crypto.decrypt(&sealed).unwrap(), b"BEGIN:VCALENDAR");
    }

    #[test]
    fn keys_are_bound_to_the_salt() {
        let sealed = manager("journal-1").encrypt(b"secret").unwrap();
        let err = manager("journal-2").decrypt(&sealed).unwrap_err();
        assert!(matches!(err, SyncError::Integrity(_)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let crypto = manager("journal-1");
        let mut sealed = crypto.encrypt(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(
            crypto.decrypt(&sealed),
            Err(SyncError::Integrity(_))
        ));
        assert!(matches!(crypto.decrypt(&[1, 2, 3]), Err(SyncError::Integrity(_))));
    }

    #[test]
    fn newer_versions_are_refused() {
        let err = CryptoManager::new(CURRENT_VERSION + 1, &[0u8; 32], "uid").err();
        assert!(matches!(
            err,
            Some(SyncError::VersionTooNew { found: 3, supported: 2 })
        ));
    }

    #[test]
    fn entry_uids_chain_on_previous_uid() {
        let crypto = manager("journal-1");
        let first = crypto.entry_uid(None, b"one").unwrap();
        let second = crypto.entry_uid(Some(&first), b"two").unwrap();

        assert_eq!(first.len(), 64);
        assert_ne!(second, crypto.entry_uid(None, b"two").unwrap());
        crypto.verify_entry(&second, Some(&first), b"two").unwrap();
        assert!(crypto.verify_entry(&second, None, b"two").is_err());
        assert!(crypto.verify_entry(&second, Some(&first), b"three").is_err());
    }

    #[test]
    fn derived_key_depends_on_username() {
        let a = DerivedKey::derive("alice", "hunter2");
        let b = DerivedKey::derive("bob", "hunter2");

        assert_ne!(a, b);
        assert_eq!(DerivedKey::from_base64(&a.to_base64()).unwrap(), a);
        assert_eq!(format!("{:?}", a), "DerivedKey(..)");
    }
}
