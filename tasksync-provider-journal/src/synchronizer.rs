//! Synchronization of task journals.
//!
//! A journal is an append-only chain of encrypted entries. Pulling replays
//! the entries after the stored tail; pushing appends one entry per local
//! change, chained to that tail, and fails with a conflict when another
//! client appended first.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tasksync_core::error::{SyncError, SyncResult};
use tasksync_core::ics::{EncodeOptions, RemoteTodo, generate_todo, parse_todo};
use tasksync_core::model::{
    Access, Account, Backend, RemoteLink, ServerFamily, TaskList, parents_first,
};
use tasksync_core::store::TaskStore;
use tasksync_core::sync::{
    AccountSynchronizer, ApplyOutcome, Cancellation, RemoteObject, RetryPolicy, apply_remote,
};

use crate::cache::JournalKeyCache;
use crate::client::{JournalTransport, MAX_FETCH, MAX_PUSH};
use crate::crypto::{CryptoManager, DerivedKey};
use crate::model::{Action, CollectionInfo, EncryptedEntry, Journal, SyncEntry};

/// Pull + push rounds per journal when another client keeps appending.
pub const CONFLICT_ATTEMPTS: u32 = 3;

/// Journal payloads follow the RFC 5545 priority scale.
const FAMILY: ServerFamily = ServerFamily::Unknown;

pub struct JournalSynchronizer {
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn JournalTransport>,
    keys: Arc<JournalKeyCache>,
    retry: RetryPolicy,
    zone: Tz,
}

#[derive(Debug, Default)]
struct ListStats {
    fetched: usize,
    applied: usize,
    deleted: usize,
    pushed: usize,
    failed: usize,
}

/// A local change waiting to be appended.
struct Outgoing {
    link: RemoteLink,
    entry: SyncEntry,
    /// Modification time of the task when it was encoded
    synced_at: Option<DateTime<Utc>>,
    remote_parent: Option<String>,
    order: Option<i64>,
}

/// An opened task journal.
struct OpenJournal {
    journal: Journal,
    crypto: CryptoManager,
    info: CollectionInfo,
}

impl JournalSynchronizer {
    pub fn new(
        store: Arc<dyn TaskStore>,
        transport: Arc<dyn JournalTransport>,
        keys: Arc<JournalKeyCache>,
    ) -> Self {
        JournalSynchronizer {
            store,
            transport,
            keys,
            retry: RetryPolicy::default(),
            zone: Tz::UTC,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_zone(mut self, zone: Tz) -> Self {
        self.zone = zone;
        self
    }

    /// Run one pass over every task journal of the account.
    pub async fn sync(&self, account: &Account, cancel: &Cancellation) -> SyncResult<()> {
        let Backend::Journal { username, .. } = &account.backend else {
            return Err(SyncError::Config(format!(
                "{} is not a journal account",
                account.name
            )));
        };
        let derived = self.keys.derived_key(&account.id).ok_or_else(|| {
            SyncError::Unauthorized(format!("No encryption key loaded for {}", account.name))
        })?;

        cancel.check()?;
        let journals = self
            .retry
            .run("Listing journals", || self.transport.journals())
            .await?;

        let account_key = if journals.iter().any(|j| j.key.is_some()) {
            self.account_key(account, username, &derived).await?
        } else {
            None
        };

        // Unreadable journals stay listed so their local lists survive
        let listed: HashSet<String> = journals.iter().map(|j| j.uid.clone()).collect();
        let mut first_error = None;
        let mut opened = Vec::new();
        for journal in journals {
            let uid = journal.uid.clone();
            match open_journal(journal, &derived, account_key.as_deref()) {
                Ok(Some(journal)) => opened.push(journal),
                Ok(None) => {}
                Err(e @ (SyncError::Integrity(_) | SyncError::VersionTooNew { .. })) => {
                    log::error!("Cannot open journal {}: {}", uid, e);
                    first_error.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        let lists = self.reconcile_lists(account, username, &listed, &opened)?;

        for (list, open) in lists.into_iter().zip(opened) {
            cancel.check()?;
            match self.sync_collection(&list.id, open, cancel).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::error!("Sync of {} failed: {}", list.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The account key from the user info, fetched once per process.
    async fn account_key(
        &self,
        account: &Account,
        username: &str,
        derived: &DerivedKey,
    ) -> SyncResult<Option<Vec<u8>>> {
        if let Some(key) = self.keys.account_key(&account.id) {
            return Ok(Some(key));
        }
        let info = self
            .retry
            .run("Fetching user info", || self.transport.user_info(username))
            .await?;
        let Some(info) = info else {
            return Ok(None);
        };
        let key = info.account_key(derived)?;
        self.keys.set_account_key(&account.id, key.clone());
        Ok(Some(key))
    }

    /// Mirror opened journals into local lists, in the same order.
    fn reconcile_lists(
        &self,
        account: &Account,
        username: &str,
        listed: &HashSet<String>,
        opened: &[OpenJournal],
    ) -> SyncResult<Vec<TaskList>> {
        let existing = self.store.lists_for_account(&account.id)?;

        for list in &existing {
            if !listed.contains(&list.url) {
                log::info!("Journal {} disappeared, removing {}", list.url, list.name);
                self.store.delete_list(&list.id)?;
            }
        }

        let mut lists = Vec::new();
        for open in opened {
            let access = if open.journal.read_only {
                Access::ReadOnly
            } else if open.journal.owner.as_deref().is_none_or(|o| o == username) {
                Access::Owner
            } else {
                Access::ReadWrite
            };

            let list = match existing.iter().find(|l| l.url == open.journal.uid) {
                Some(list) => {
                    let mut updated = list.clone();
                    updated.name = open.info.display_name.clone();
                    updated.color = open.info.color.clone();
                    updated.access = access;
                    if updated != *list {
                        log::debug!("Updating list {}", updated.name);
                        self.store.upsert_list(&updated)?;
                    }
                    updated
                }
                None => {
                    let mut list =
                        TaskList::new(&account.id, &open.journal.uid, &open.info.display_name);
                    list.color = open.info.color.clone();
                    list.access = access;
                    log::info!("New list {} for journal {}", list.name, list.url);
                    self.store.upsert_list(&list)?;
                    list
                }
            };
            lists.push(list);
        }

        Ok(lists)
    }

    /// Pull and push one journal, starting over when the push lost a race.
    async fn sync_collection(
        &self,
        list_id: &str,
        open: OpenJournal,
        cancel: &Cancellation,
    ) -> SyncResult<()> {
        let OpenJournal {
            mut journal,
            crypto,
            ..
        } = open;
        let uid = journal.uid.clone();

        let mut attempt = 1;
        loop {
            match self.sync_journal(list_id, &journal, &crypto, cancel).await {
                Err(e) if e.is_conflict() && attempt < CONFLICT_ATTEMPTS => {
                    log::info!(
                        "Journal {} changed while pushing, syncing again ({}/{})",
                        uid,
                        attempt,
                        CONFLICT_ATTEMPTS
                    );
                    attempt += 1;
                    cancel.check()?;
                    journal = self
                        .retry
                        .run("Refreshing journal", || self.transport.journal(&uid))
                        .await?;
                }
                result => return result,
            }
        }
    }

    async fn sync_journal(
        &self,
        list_id: &str,
        journal: &Journal,
        crypto: &CryptoManager,
        cancel: &Cancellation,
    ) -> SyncResult<()> {
        let Some(list) = self.store.fetch_list(list_id)? else {
            return Ok(());
        };
        let mut stats = ListStats::default();

        if journal.last_uid == list.change_token {
            log::debug!("{} is up to date", list.name);
        } else {
            self.fetch_entries(&list, journal, crypto, cancel, &mut stats)
                .await?;
        }

        if list.is_read_only() {
            log::debug!("{} is read-only, not pushing", list.name);
        } else {
            self.push_changes(list_id, journal, crypto, cancel, &mut stats)
                .await?;
        }

        log::info!(
            "Synced {}: {} fetched, {} applied, {} deleted, {} pushed, {} failed",
            list.name,
            stats.fetched,
            stats.applied,
            stats.deleted,
            stats.pushed,
            stats.failed
        );
        Ok(())
    }

    async fn fetch_entries(
        &self,
        list: &TaskList,
        journal: &Journal,
        crypto: &CryptoManager,
        cancel: &Cancellation,
        stats: &mut ListStats,
    ) -> SyncResult<()> {
        let mut last = list.change_token.clone();
        loop {
            cancel.check()?;
            let batch = self
                .retry
                .run("Fetching entries", || {
                    self.transport
                        .entries(&journal.uid, last.as_deref(), MAX_FETCH)
                })
                .await?;
            stats.fetched += batch.len();

            for encrypted in &batch {
                let entry = encrypted.open(crypto, last.as_deref())?;
                self.apply_entry(list, &encrypted.uid, &entry, stats)?;
                self.store
                    .set_list_change_token(&list.id, Some(&encrypted.uid))?;
                last = Some(encrypted.uid.clone());
            }

            if batch.len() < MAX_FETCH {
                break;
            }
        }

        self.store.update_parents(&list.id)?;
        Ok(())
    }

    fn apply_entry(
        &self,
        list: &TaskList,
        uid: &str,
        entry: &SyncEntry,
        stats: &mut ListStats,
    ) -> SyncResult<()> {
        let Some(todo) = parse_todo(&entry.content, self.zone) else {
            log::warn!("Skipping entry {}: invalid VCALENDAR", uid);
            return Ok(());
        };

        match entry.action {
            Action::Add | Action::Change => {
                let outcome = apply_remote(
                    self.store.as_ref(),
                    list,
                    RemoteObject {
                        todo: &todo,
                        payload: &entry.content,
                        version: uid,
                        object: None,
                    },
                    FAMILY,
                )?;
                if matches!(
                    outcome,
                    ApplyOutcome::Created(_) | ApplyOutcome::Updated(_)
                ) {
                    stats.applied += 1;
                }
            }
            Action::Delete => {
                let Some(link) = self.store.link_by_remote_id(&list.id, &todo.uid)? else {
                    log::debug!("Entry {} deletes unknown {}", uid, todo.uid);
                    return Ok(());
                };
                if !link.is_tombstone() {
                    log::debug!("{} was deleted remotely", todo.uid);
                    self.store.mark_deleted(link.task_id, Utc::now())?;
                    stats.deleted += 1;
                }
                self.store.purge_link(link.id)?;
            }
        }
        Ok(())
    }

    /// Encode local changes into entries, in the order they must be appended.
    fn collect_changes(&self, list: &TaskList, stats: &mut ListStats) -> SyncResult<Vec<Outgoing>> {
        let (tombstones, dirty): (Vec<RemoteLink>, Vec<RemoteLink>) = self
            .store
            .list_dirty_links(&list.id)?
            .into_iter()
            .partition(RemoteLink::is_tombstone);

        let mut outgoing = Vec::new();
        for link in tombstones {
            match link.payload.clone() {
                Some(content) => outgoing.push(Outgoing {
                    link,
                    entry: SyncEntry {
                        action: Action::Delete,
                        content,
                    },
                    synced_at: None,
                    remote_parent: None,
                    order: None,
                }),
                // Never reached the journal
                None => self.store.release_link(link.id)?,
            }
        }

        for link in parents_first(dirty) {
            let Some(task) = self.store.fetch_task(link.task_id)? else {
                self.store.purge_link(link.id)?;
                continue;
            };

            if task.is_deleted() {
                match link.payload.clone() {
                    Some(content) => outgoing.push(Outgoing {
                        link,
                        entry: SyncEntry {
                            action: Action::Delete,
                            content,
                        },
                        synced_at: None,
                        remote_parent: None,
                        order: None,
                    }),
                    None => self.store.release_link(link.id)?,
                }
                continue;
            }

            let previous = link
                .payload
                .as_deref()
                .and_then(|payload| parse_todo(payload, self.zone));
            let parent_uid = match task.parent {
                Some(parent) => self
                    .store
                    .get_remote_link(parent, &list.id)?
                    .map(|l| l.remote_id),
                None => None,
            };
            let todo = RemoteTodo::from_task(
                &task,
                &link.remote_id,
                parent_uid.clone(),
                previous.as_ref(),
                FAMILY,
            );
            let content = match generate_todo(
                &todo,
                &EncodeOptions {
                    zone: self.zone,
                    family: FAMILY,
                },
            ) {
                Ok(content) => content,
                Err(e) => {
                    log::warn!("Failed to encode task {}: {}", task.id, e);
                    stats.failed += 1;
                    continue;
                }
            };

            let action = if link.payload.is_some() {
                Action::Change
            } else {
                Action::Add
            };
            outgoing.push(Outgoing {
                link,
                entry: SyncEntry { action, content },
                synced_at: Some(task.modified),
                remote_parent: parent_uid,
                order: task.order,
            });
        }

        Ok(outgoing)
    }

    async fn push_changes(
        &self,
        list_id: &str,
        journal: &Journal,
        crypto: &CryptoManager,
        cancel: &Cancellation,
        stats: &mut ListStats,
    ) -> SyncResult<()> {
        // Re-read: fetching advanced the tail
        let Some(list) = self.store.fetch_list(list_id)? else {
            return Ok(());
        };
        let outgoing = self.collect_changes(&list, stats)?;
        if outgoing.is_empty() {
            return Ok(());
        }

        let mut prev = list.change_token.clone();
        let mut sealed = Vec::with_capacity(outgoing.len());
        for change in &outgoing {
            let entry = EncryptedEntry::seal(crypto, prev.as_deref(), &change.entry)?;
            prev = Some(entry.uid.clone());
            sealed.push(entry);
        }

        let mut last = list.change_token.clone();
        for (entries, changes) in sealed.chunks(MAX_PUSH).zip(outgoing.chunks(MAX_PUSH)) {
            cancel.check()?;
            self.retry
                .run("Pushing entries", || {
                    self.transport
                        .push_entries(&journal.uid, entries, last.as_deref())
                })
                .await?;

            for (entry, change) in entries.iter().zip(changes) {
                self.commit_pushed(&entry.uid, change)?;
                stats.pushed += 1;
            }
            last = entries.last().map(|e| e.uid.clone());
            self.store.set_list_change_token(&list.id, last.as_deref())?;
        }
        Ok(())
    }

    /// Record an appended entry locally, as if it had been fetched.
    fn commit_pushed(&self, uid: &str, change: &Outgoing) -> SyncResult<()> {
        match change.entry.action {
            Action::Delete => {
                self.store.release_link(change.link.id)?;
            }
            Action::Add | Action::Change => {
                let mut link = change.link.clone();
                link.etag = Some(uid.to_string());
                link.payload = Some(change.entry.content.clone());
                link.remote_parent = change.remote_parent.clone();
                link.order = change.order;
                link.last_sync = change.synced_at;
                self.store.upsert_remote_link(link)?;
            }
        }
        log::debug!("Appended {} for task {}", uid, change.link.task_id);
        Ok(())
    }
}

/// Decrypt a journal's description; `None` for journals that hold no tasks.
fn open_journal(
    journal: Journal,
    derived: &DerivedKey,
    account_key: Option<&[u8]>,
) -> SyncResult<Option<OpenJournal>> {
    let crypto = journal.crypto(derived, account_key)?;
    let info = journal.collection_info(&crypto)?;

    if !info.is_tasks() {
        log::debug!("Ignoring {} journal {}", info.kind, journal.uid);
        return Ok(None);
    }
    Ok(Some(OpenJournal {
        journal,
        crypto,
        info,
    }))
}

#[async_trait]
impl AccountSynchronizer for JournalSynchronizer {
    async fn sync_account(&self, account: &Account, cancel: &Cancellation) -> SyncResult<()> {
        self.sync(account, cancel).await
    }
}
