//! Encrypted journal backend for tasksync.
//!
//! Each task list is a journal of hash-chained, encrypted entries. Keys are
//! derived from the account's encryption password and kept in a
//! process-wide [`JournalKeyCache`].

pub mod cache;
pub mod client;
pub mod crypto;
pub mod model;
pub mod synchronizer;

pub use cache::JournalKeyCache;
pub use client::{HttpJournalClient, JournalTransport, MAX_FETCH, MAX_PUSH, authenticate};
pub use crypto::{CURRENT_VERSION, CryptoManager, DerivedKey};
pub use model::{Action, CollectionInfo, EncryptedEntry, Journal, SyncEntry, UserInfo};
pub use synchronizer::{CONFLICT_ATTEMPTS, JournalSynchronizer};
