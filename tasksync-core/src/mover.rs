//! Moving tasks, with their subtrees, between lists.
//!
//! A move never deletes anything remotely by itself: source links become
//! tombstones and new links are created on the target list, so the next sync
//! pass of each involved account propagates the change.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::model::{AccountId, RemoteLink, Task, TaskId, TaskList};
use crate::store::{TaskStore, account_for_list};
use crate::sync::SyncRequester;

/// What a call to [`TaskMover::move_tasks`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MoveReport {
    /// Roots whose subtree was relocated
    pub moved: Vec<TaskId>,
    /// Requested ids left where they are
    pub skipped: Vec<TaskId>,
    pub tombstoned: usize,
    pub linked: usize,
}

pub struct TaskMover {
    store: Arc<dyn TaskStore>,
    requester: Arc<dyn SyncRequester>,
}

impl TaskMover {
    pub fn new(store: Arc<dyn TaskStore>, requester: Arc<dyn SyncRequester>) -> Self {
        TaskMover { store, requester }
    }

    /// Move `ids` and their descendants into `target`.
    pub fn move_tasks(&self, ids: &[TaskId], target: &str) -> SyncResult<MoveReport> {
        let mut report = MoveReport::default();

        let Some((list, account)) = account_for_list(self.store.as_ref(), &target.to_string())?
        else {
            log::warn!("Cannot move tasks: list {} or its account is missing", target);
            return Ok(report);
        };
        if list.is_read_only() {
            log::warn!("Cannot move tasks into read-only list {}", list.name);
            report.skipped.extend(ids.iter().copied());
            return Ok(report);
        }
        let hierarchical = account.backend.supports_hierarchy();

        // Tasks that may move at all
        let mut eligible = BTreeSet::new();
        for &id in ids {
            match self.store.fetch_task(id)? {
                Some(task) if task.is_deleted() => {
                    log::debug!("Not moving deleted task {}", id);
                    report.skipped.push(id);
                }
                Some(task) if self.in_read_only_list(task.id)? => {
                    log::info!("Not moving task {} out of a read-only list", id);
                    report.skipped.push(id);
                }
                Some(task) => {
                    eligible.insert(task.id);
                }
                None => {
                    log::warn!("Cannot move task {}: not found", id);
                    report.skipped.push(id);
                }
            }
        }

        // An ancestor that moves carries its subtree along
        let mut roots = Vec::new();
        for &id in &eligible {
            if !self.has_ancestor_in(id, &eligible)? {
                roots.push(id);
            }
        }

        let now = Utc::now();
        let mut touched = Vec::new();
        let mut sources = BTreeSet::new();

        for root in roots {
            if self.store.get_remote_link(root, &list.id)?.is_some() {
                log::debug!("Task {} is already in {}", root, list.name);
                report.skipped.push(root);
                continue;
            }
            self.move_subtree(
                root,
                &list,
                hierarchical,
                now,
                &mut sources,
                &mut touched,
                &mut report,
            )?;
            report.moved.push(root);
        }

        if touched.is_empty() {
            return Ok(report);
        }

        self.store.touch(&touched, now)?;
        log::info!(
            "Moved {} task(s) into {} ({} tombstoned, {} linked)",
            touched.len(),
            list.name,
            report.tombstoned,
            report.linked
        );

        self.requester.request_sync(&account.id);
        for source in sources.iter().filter(|s| **s != account.id) {
            self.requester.request_sync(source);
        }

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn move_subtree(
        &self,
        root: TaskId,
        target: &TaskList,
        hierarchical: bool,
        now: DateTime<Utc>,
        sources: &mut BTreeSet<AccountId>,
        touched: &mut Vec<TaskId>,
        report: &mut MoveReport,
    ) -> SyncResult<()> {
        let subtree = self.collect_subtree(root)?;
        let mut remote_ids: HashMap<TaskId, String> = HashMap::new();

        for mut task in subtree {
            let is_root = task.id == root;

            if is_root && task.parent.is_some() {
                task.parent = None;
                self.store.upsert_task(&task)?;
            } else if !is_root && !hierarchical && task.parent != Some(root) {
                task.parent = Some(root);
                self.store.upsert_task(&task)?;
            }

            let links = self.store.links_for_task(task.id)?;
            let mut reused_uid = None;
            let mut existing = None;

            for mut link in links {
                if link.list_id == target.id {
                    // Prefer the active link, else revive a tombstone
                    if existing.as_ref().is_none_or(|e: &RemoteLink| e.is_tombstone()) {
                        existing = Some(link);
                    }
                    continue;
                }
                if link.is_tombstone() {
                    continue;
                }
                if let Some(source) = self.store.fetch_list(&link.list_id)? {
                    sources.insert(source.account_id);
                }
                reused_uid.get_or_insert_with(|| link.remote_id.clone());
                link.deleted_at = Some(now);
                self.store.upsert_remote_link(link)?;
                report.tombstoned += 1;
            }

            let mut link = match existing {
                Some(mut link) => {
                    link.deleted_at = None;
                    link
                }
                None => match reused_uid {
                    Some(uid) => RemoteLink::new(task.id, target.id.clone(), uid),
                    None => RemoteLink::with_new_remote_id(task.id, target.id.clone()),
                },
            };

            link.remote_parent = if hierarchical && !is_root {
                task.parent.and_then(|p| remote_ids.get(&p).cloned())
            } else {
                None
            };
            link.order = task.order;

            remote_ids.insert(task.id, link.remote_id.clone());
            self.store.upsert_remote_link(link)?;
            report.linked += 1;
            touched.push(task.id);
        }

        Ok(())
    }

    /// The task and its non-deleted descendants, parents before children.
    fn collect_subtree(&self, root: TaskId) -> SyncResult<Vec<Task>> {
        let Some(task) = self.store.fetch_task(root)? else {
            return Ok(Vec::new());
        };

        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([task]);
        let mut subtree = Vec::new();

        while let Some(task) = queue.pop_front() {
            for child in self.store.fetch_children(task.id)? {
                if seen.insert(child.id) {
                    queue.push_back(child);
                }
            }
            subtree.push(task);
        }
        Ok(subtree)
    }

    fn has_ancestor_in(&self, id: TaskId, set: &BTreeSet<TaskId>) -> SyncResult<bool> {
        let mut seen = HashSet::from([id]);
        let mut current = self.store.fetch_task(id)?.and_then(|t| t.parent);
        while let Some(parent) = current {
            if set.contains(&parent) {
                return Ok(true);
            }
            if !seen.insert(parent) {
                log::warn!("Parent cycle detected at task {}", parent);
                return Ok(false);
            }
            current = self.store.fetch_task(parent)?.and_then(|t| t.parent);
        }
        Ok(false)
    }

    fn in_read_only_list(&self, task: TaskId) -> SyncResult<bool> {
        for link in self.store.links_for_task(task)? {
            if link.is_tombstone() {
                continue;
            }
            if let Some(list) = self.store.fetch_list(&link.list_id)? {
                if list.is_read_only() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}
