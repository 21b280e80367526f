//! ETag/CTag based synchronization of CalDAV task collections.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use tasksync_core::error::{SyncError, SyncResult};
use tasksync_core::ics::{EncodeOptions, RemoteTodo, generate_todo, parse_todo};
use tasksync_core::model::{
    Account, Backend, RemoteLink, ServerFamily, Task, TaskList, parents_first,
};
use tasksync_core::store::TaskStore;
use tasksync_core::sync::{
    AccountSynchronizer, ApplyOutcome, Cancellation, RemoteObject, RetryPolicy, apply_remote,
};

use crate::client::{href_name, object_href, object_name, same_collection};
use crate::family::detect_family;
use crate::requests::{Collection, Member, Resource};
use crate::transport::CaldavTransport;

/// Objects fetched per calendar-multiget.
pub const MULTIGET_CHUNK: usize = 30;

pub struct CaldavSynchronizer {
    store: Arc<dyn TaskStore>,
    transport: Arc<dyn CaldavTransport>,
    retry: RetryPolicy,
    zone: Tz,
}

/// Counters for one list pass, logged at the end.
#[derive(Debug, Default)]
struct ListStats {
    fetched: usize,
    applied: usize,
    deleted: usize,
    pushed: usize,
    failed: usize,
}

impl CaldavSynchronizer {
    pub fn new(store: Arc<dyn TaskStore>, transport: Arc<dyn CaldavTransport>) -> Self {
        CaldavSynchronizer {
            store,
            transport,
            retry: RetryPolicy::default(),
            zone: Tz::UTC,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Zone used for local times in outgoing objects and floating incoming ones.
    pub fn with_zone(mut self, zone: Tz) -> Self {
        self.zone = zone;
        self
    }

    /// Run one pass over every task collection of the account.
    ///
    /// Lists sync one after another; a failing list does not stop the
    /// others, but its error is returned once all lists were attempted.
    pub async fn sync(&self, account: &Account, cancel: &Cancellation) -> SyncResult<()> {
        let Backend::CalDav {
            family: known_family,
            tasks_org,
            ..
        } = &account.backend
        else {
            return Err(SyncError::Config(format!(
                "{} is not a CalDAV account",
                account.name
            )));
        };

        cancel.check()?;
        let discovery = self
            .retry
            .run("Discovering collections", || self.transport.discover())
            .await?;

        let family = detect_family(&discovery.server, *tasks_org);
        if family != *known_family {
            log::info!("{} identified as {:?}", account.name, family);
            let mut updated = account.clone();
            if let Backend::CalDav { family: f, .. } = &mut updated.backend {
                *f = family;
            }
            self.store.upsert_account(&updated)?;
        }

        let lists = self.reconcile_lists(account, &discovery.collections)?;

        let mut first_error = None;
        for (list, collection) in lists {
            cancel.check()?;
            match self.sync_list(&list, &collection, family, cancel).await {
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

    /// Mirror the discovered collections into local lists.
    fn reconcile_lists(
        &self,
        account: &Account,
        collections: &[Collection],
    ) -> SyncResult<Vec<(TaskList, Collection)>> {
        let existing = self.store.lists_for_account(&account.id)?;

        for list in &existing {
            if !collections.iter().any(|c| same_collection(&c.href, &list.url)) {
                log::info!("Collection {} disappeared, removing {}", list.url, list.name);
                self.store.delete_list(&list.id)?;
            }
        }

        let mut lists = Vec::new();
        for collection in collections {
            let name = collection
                .display_name
                .clone()
                .unwrap_or_else(|| href_name(&collection.href).to_string());

            let list = match existing.iter().find(|l| same_collection(&l.url, &collection.href)) {
                Some(list) => {
                    let mut updated = list.clone();
                    updated.name = name;
                    updated.color = collection.color.clone();
                    updated.access = collection.access;
                    if updated != *list {
                        log::debug!("Updating list {}", updated.name);
                        self.store.upsert_list(&updated)?;
                    }
                    updated
                }
                None => {
                    let mut list = TaskList::new(&account.id, &collection.href, name);
                    list.color = collection.color.clone();
                    list.access = collection.access;
                    log::info!("New list {} at {}", list.name, list.url);
                    self.store.upsert_list(&list)?;
                    list
                }
            };

            self.store
                .replace_principals(&list.id, collection.principals.clone())?;
            lists.push((list, collection.clone()));
        }

        Ok(lists)
    }

    async fn sync_list(
        &self,
        list: &TaskList,
        collection: &Collection,
        family: ServerFamily,
        cancel: &Cancellation,
    ) -> SyncResult<()> {
        let mut stats = ListStats::default();
        let remote_token = collection.change_token();

        if remote_token.is_some() && remote_token == list.change_token.as_deref() {
            log::debug!("{} is up to date", list.name);
        } else {
            self.fetch_changes(list, family, cancel, &mut stats).await?;
        }

        if list.is_read_only() {
            log::debug!("{} is read-only, not pushing", list.name);
        } else {
            self.push_changes(list, family, cancel, &mut stats).await?;
        }

        if remote_token != list.change_token.as_deref() {
            self.store.set_list_change_token(&list.id, remote_token)?;
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

    async fn fetch_changes(
        &self,
        list: &TaskList,
        family: ServerFamily,
        cancel: &Cancellation,
        stats: &mut ListStats,
    ) -> SyncResult<()> {
        let members = self
            .retry
            .run("Listing objects", || self.transport.list_etags(&list.url))
            .await?;

        let mut changed = Vec::new();
        for Member { href, etag } in &members {
            let Some(etag) = etag else {
                log::warn!("Skipping {}: no ETag", href);
                continue;
            };
            let known = self.store.link_by_object(&list.id, href_name(href))?;
            if known.and_then(|l| l.etag).as_deref() != Some(etag.as_str()) {
                changed.push(href.clone());
            }
        }

        for chunk in changed.chunks(MULTIGET_CHUNK) {
            cancel.check()?;
            let resources = self
                .retry
                .run("Fetching objects", || self.transport.multiget(&list.url, chunk))
                .await?;
            stats.fetched += resources.len();
            for resource in &resources {
                if self.apply_resource(list, resource, family)? {
                    stats.applied += 1;
                }
            }
        }

        let listed: HashSet<&str> = members.iter().map(|m| href_name(&m.href)).collect();
        for link in self.store.links_for_list(&list.id)? {
            let Some(object) = link.object.as_deref() else {
                continue;
            };
            if link.is_tombstone() || listed.contains(object) {
                continue;
            }
            stats.deleted += self.handle_remote_delete(link)? as usize;
        }

        self.store.update_parents(&list.id)?;
        Ok(())
    }

    /// Apply one fetched object; returns whether local data changed.
    fn apply_resource(
        &self,
        list: &TaskList,
        resource: &Resource,
        family: ServerFamily,
    ) -> SyncResult<bool> {
        let Some(etag) = resource.etag.as_deref() else {
            log::warn!("Skipping {}: response without ETag", resource.href);
            return Ok(false);
        };
        let Some(data) = resource.data.as_deref() else {
            log::warn!("Skipping {}: response without calendar data", resource.href);
            return Ok(false);
        };
        let Some(todo) = parse_todo(data, self.zone) else {
            log::warn!("Skipping {}: invalid VCALENDAR", resource.href);
            return Ok(false);
        };

        let outcome = apply_remote(
            self.store.as_ref(),
            list,
            RemoteObject {
                todo: &todo,
                payload: data,
                version: etag,
                object: Some(href_name(&resource.href)),
            },
            family,
        )?;
        Ok(matches!(
            outcome,
            ApplyOutcome::Created(_) | ApplyOutcome::Updated(_)
        ))
    }

    /// The object vanished remotely. Clean tasks follow; dirty ones are
    /// re-created on the next push.
    fn handle_remote_delete(&self, mut link: RemoteLink) -> SyncResult<bool> {
        let task = self.store.fetch_task(link.task_id)?;
        match task {
            Some(task) if link.is_dirty(&task) && !task.is_deleted() => {
                log::info!(
                    "{} was deleted remotely but has local changes, re-creating",
                    link.remote_id
                );
                link.etag = None;
                self.store.upsert_remote_link(link)?;
                Ok(false)
            }
            Some(task) => {
                log::debug!("{} was deleted remotely", link.remote_id);
                self.store.mark_deleted(task.id, chrono::Utc::now())?;
                self.store.purge_link(link.id)?;
                Ok(true)
            }
            None => {
                self.store.purge_link(link.id)?;
                Ok(false)
            }
        }
    }

    async fn push_changes(
        &self,
        list: &TaskList,
        family: ServerFamily,
        cancel: &Cancellation,
        stats: &mut ListStats,
    ) -> SyncResult<()> {
        let (tombstones, dirty): (Vec<RemoteLink>, Vec<RemoteLink>) = self
            .store
            .list_dirty_links(&list.id)?
            .into_iter()
            .partition(RemoteLink::is_tombstone);

        for link in tombstones {
            cancel.check()?;
            match self.delete_remote(list, &link).await {
                Ok(()) => self.store.release_link(link.id)?,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!("Failed to delete {}: {}", link.remote_id, e);
                    stats.failed += 1;
                }
            }
        }

        for link in parents_first(dirty) {
            cancel.check()?;
            let Some(task) = self.store.fetch_task(link.task_id)? else {
                self.store.purge_link(link.id)?;
                continue;
            };

            let result = if task.is_deleted() {
                self.delete_remote(list, &link).await.and_then(|()| {
                    self.store.release_link(link.id)?;
                    Ok(())
                })
            } else {
                self.push_task(list, link, &task, family).await
            };

            match result {
                Ok(()) => stats.pushed += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!("Failed to push task {}: {}", task.id, e);
                    stats.failed += 1;
                }
            }
        }

        if stats.failed > 0 {
            log::warn!(
                "{}: {} object(s) left for the next sync",
                list.name,
                stats.failed
            );
        }
        Ok(())
    }

    async fn delete_remote(&self, list: &TaskList, link: &RemoteLink) -> SyncResult<()> {
        let Some(object) = link.object.as_deref() else {
            // Never pushed, nothing to delete remotely
            return Ok(());
        };
        let href = object_href(&list.url, object);
        self.retry
            .run("Deleting object", || self.transport.delete(&href))
            .await
    }

    async fn push_task(
        &self,
        list: &TaskList,
        mut link: RemoteLink,
        task: &Task,
        family: ServerFamily,
    ) -> SyncResult<()> {
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
            task,
            &link.remote_id,
            parent_uid.clone(),
            previous.as_ref(),
            family,
        );
        let ics = generate_todo(
            &todo,
            &EncodeOptions {
                zone: self.zone,
                family,
            },
        )?;

        let object = link
            .object
            .clone()
            .unwrap_or_else(|| object_name(&link.remote_id));
        let href = object_href(&list.url, &object);
        let etag = link.etag.clone();

        let new_etag = self
            .retry
            .run("Uploading object", || {
                self.transport.put(&href, &ics, etag.as_deref())
            })
            .await?;

        log::debug!("Pushed task {} to {}", task.id, href);
        link.object = Some(object);
        link.etag = new_etag;
        link.payload = Some(ics);
        link.remote_parent = parent_uid;
        link.order = task.order;
        link.last_sync = Some(task.modified);
        self.store.upsert_remote_link(link)?;
        Ok(())
    }
}

#[async_trait]
impl AccountSynchronizer for CaldavSynchronizer {
    async fn sync_account(&self, account: &Account, cancel: &Cancellation) -> SyncResult<()> {
        self.sync(account, cancel).await
    }
}
