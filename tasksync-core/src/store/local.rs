//! In-process task store with optional JSON snapshot persistence.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskStore;
use crate::error::{StoreError, StoreResult};
use crate::model::{Account, LinkId, Principal, RemoteLink, Task, TaskId, TaskList};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    next_task_id: TaskId,
    next_link_id: LinkId,
    tasks: BTreeMap<TaskId, Task>,
    links: BTreeMap<LinkId, RemoteLink>,
    lists: BTreeMap<String, TaskList>,
    accounts: BTreeMap<String, Account>,
    principals: BTreeMap<String, Vec<Principal>>,
}

impl Snapshot {
    fn insert_task(&mut self, mut task: Task) -> Task {
        self.next_task_id += 1;
        task.id = self.next_task_id;
        self.tasks.insert(task.id, task.clone());
        task
    }

    fn upsert_link(&mut self, mut link: RemoteLink) -> RemoteLink {
        if link.id == 0 {
            self.next_link_id += 1;
            link.id = self.next_link_id;
        }
        self.links.insert(link.id, link.clone());
        link
    }

    fn links_in<'a>(&'a self, list: &'a str) -> impl Iterator<Item = &'a RemoteLink> + 'a {
        self.links.values().filter(move |l| l.list_id == list)
    }

    /// Active match first, tombstones second.
    fn find_link(&self, list: &str, pred: impl Fn(&RemoteLink) -> bool) -> Option<RemoteLink> {
        let mut tombstone = None;
        for link in self.links_in(list).filter(|l| pred(l)) {
            if !link.is_tombstone() {
                return Some(link.clone());
            }
            tombstone.get_or_insert_with(|| link.clone());
        }
        tombstone
    }

    fn delete_list(&mut self, id: &str) {
        let removed: Vec<RemoteLink> = self.links_in(id).cloned().collect();
        for link in &removed {
            self.links.remove(&link.id);
        }
        let linked: HashSet<TaskId> = self.links.values().map(|l| l.task_id).collect();
        for link in removed {
            if !linked.contains(&link.task_id) {
                self.tasks.remove(&link.task_id);
            }
        }
        self.lists.remove(id);
        self.principals.remove(id);
    }
}

/// A [`TaskStore`] kept in memory and optionally mirrored to a JSON file.
///
/// Every mutation rewrites the snapshot through a temp file and rename so a
/// crash never leaves a half-written store behind.
pub struct LocalStore {
    path: Option<PathBuf>,
    state: Mutex<Snapshot>,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        LocalStore {
            path: None,
            state: Mutex::new(Snapshot::default()),
        }
    }

    /// Open (or create) a store persisted at `path`.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let snapshot = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| StoreError::Serialization(e.to_string()))?
        } else {
            Snapshot::default()
        };

        log::debug!("Opened task store at {}", path.display());

        Ok(LocalStore {
            path: Some(path),
            state: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Snapshot>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> StoreResult<T> {
        let state = self.lock()?;
        Ok(f(&state))
    }

    /// Apply `f` to a copy and swap it in only once it is on disk.
    fn write<T>(&self, f: impl FnOnce(&mut Snapshot) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self.lock()?;
        let mut next = state.clone();
        let result = f(&mut next)?;
        self.persist(&next)?;
        *state = next;
        Ok(result)
    }

    fn persist(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, content)?;
        std::fs::rename(&temp, path)?;
        Ok(())
    }
}

fn not_found(kind: &'static str, id: impl ToString) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

impl TaskStore for LocalStore {
    fn fetch_task(&self, id: TaskId) -> StoreResult<Option<Task>> {
        self.read(|s| s.tasks.get(&id).cloned())
    }

    fn fetch_children(&self, id: TaskId) -> StoreResult<Vec<Task>> {
        self.read(|s| {
            s.tasks
                .values()
                .filter(|t| t.parent == Some(id) && !t.is_deleted())
                .cloned()
                .collect()
        })
    }

    fn insert_task(&self, task: Task) -> StoreResult<Task> {
        self.write(|s| Ok(s.insert_task(task)))
    }

    fn upsert_task(&self, task: &Task) -> StoreResult<()> {
        self.write(|s| {
            s.tasks.insert(task.id, task.clone());
            Ok(())
        })
    }

    fn mark_deleted(&self, id: TaskId, at: DateTime<Utc>) -> StoreResult<()> {
        self.write(|s| {
            let task = s.tasks.get_mut(&id).ok_or_else(|| not_found("Task", id))?;
            task.deleted = Some(at);
            task.modified = at;
            Ok(())
        })
    }

    fn purge_task(&self, id: TaskId) -> StoreResult<()> {
        self.write(|s| {
            s.tasks.remove(&id);
            s.links.retain(|_, l| l.task_id != id);
            Ok(())
        })
    }

    fn touch(&self, ids: &[TaskId], at: DateTime<Utc>) -> StoreResult<()> {
        self.write(|s| {
            for id in ids {
                if let Some(task) = s.tasks.get_mut(id) {
                    task.modified = at;
                }
            }
            Ok(())
        })
    }

    fn tasks(&self) -> StoreResult<Vec<Task>> {
        self.read(|s| s.tasks.values().cloned().collect())
    }

    fn get_remote_link(&self, task: TaskId, list: &str) -> StoreResult<Option<RemoteLink>> {
        self.read(|s| {
            s.links_in(list)
                .find(|l| l.task_id == task && !l.is_tombstone())
                .cloned()
        })
    }

    fn link_by_remote_id(&self, list: &str, remote_id: &str) -> StoreResult<Option<RemoteLink>> {
        self.read(|s| s.find_link(list, |l| l.remote_id == remote_id))
    }

    fn link_by_object(&self, list: &str, object: &str) -> StoreResult<Option<RemoteLink>> {
        self.read(|s| s.find_link(list, |l| l.object.as_deref() == Some(object)))
    }

    fn links_for_task(&self, task: TaskId) -> StoreResult<Vec<RemoteLink>> {
        self.read(|s| s.links.values().filter(|l| l.task_id == task).cloned().collect())
    }

    fn links_for_list(&self, list: &str) -> StoreResult<Vec<RemoteLink>> {
        self.read(|s| s.links_in(list).cloned().collect())
    }

    fn upsert_remote_link(&self, link: RemoteLink) -> StoreResult<RemoteLink> {
        self.write(|s| Ok(s.upsert_link(link)))
    }

    fn purge_link(&self, id: LinkId) -> StoreResult<()> {
        self.write(|s| {
            s.links.remove(&id);
            Ok(())
        })
    }

    fn release_link(&self, id: LinkId) -> StoreResult<()> {
        self.write(|s| {
            let Some(link) = s.links.remove(&id) else {
                return Ok(());
            };
            let deleted = s.tasks.get(&link.task_id).is_some_and(Task::is_deleted);
            if deleted && !s.links.values().any(|l| l.task_id == link.task_id) {
                s.tasks.remove(&link.task_id);
            }
            Ok(())
        })
    }

    fn list_dirty_links(&self, list: &str) -> StoreResult<Vec<RemoteLink>> {
        self.read(|s| {
            s.links_in(list)
                .filter(|l| match s.tasks.get(&l.task_id) {
                    Some(task) => l.is_dirty(task),
                    None => true,
                })
                .cloned()
                .collect()
        })
    }

    fn save_synced(&self, task: Task, mut link: RemoteLink) -> StoreResult<(Task, RemoteLink)> {
        self.write(|s| {
            let task = if task.id == 0 {
                s.insert_task(task)
            } else {
                s.tasks.insert(task.id, task.clone());
                task
            };
            link.task_id = task.id;
            let link = s.upsert_link(link);
            Ok((task, link))
        })
    }

    fn update_parents(&self, list: &str) -> StoreResult<()> {
        self.write(|s| {
            let active: Vec<RemoteLink> = s
                .links_in(list)
                .filter(|l| !l.is_tombstone())
                .cloned()
                .collect();

            for link in &active {
                let Some(task) = s.tasks.get(&link.task_id) else {
                    continue;
                };
                if link.is_dirty(task) {
                    continue;
                }
                let parent = link.remote_parent.as_deref().and_then(|remote_parent| {
                    active
                        .iter()
                        .find(|p| p.remote_id == remote_parent)
                        .map(|p| p.task_id)
                });
                if task.parent != parent {
                    log::debug!(
                        "Re-parenting task {} to {:?} from remote parent",
                        task.id,
                        parent
                    );
                    if let Some(task) = s.tasks.get_mut(&link.task_id) {
                        task.parent = parent;
                    }
                }
            }
            Ok(())
        })
    }

    fn fetch_list(&self, id: &str) -> StoreResult<Option<TaskList>> {
        self.read(|s| s.lists.get(id).cloned())
    }

    fn lists_for_account(&self, account: &str) -> StoreResult<Vec<TaskList>> {
        self.read(|s| {
            s.lists
                .values()
                .filter(|l| l.account_id == account)
                .cloned()
                .collect()
        })
    }

    fn upsert_list(&self, list: &TaskList) -> StoreResult<()> {
        self.write(|s| {
            s.lists.insert(list.id.clone(), list.clone());
            Ok(())
        })
    }

    fn delete_list(&self, id: &str) -> StoreResult<()> {
        self.write(|s| {
            s.delete_list(id);
            Ok(())
        })
    }

    fn set_list_change_token(&self, list: &str, token: Option<&str>) -> StoreResult<()> {
        self.write(|s| {
            let list = s.lists.get_mut(list).ok_or_else(|| not_found("List", list))?;
            list.change_token = token.map(str::to_string);
            Ok(())
        })
    }

    fn replace_principals(&self, list: &str, principals: Vec<Principal>) -> StoreResult<()> {
        self.write(|s| {
            if principals.is_empty() {
                s.principals.remove(list);
            } else {
                s.principals.insert(list.to_string(), principals);
            }
            Ok(())
        })
    }

    fn principals(&self, list: &str) -> StoreResult<Vec<Principal>> {
        self.read(|s| s.principals.get(list).cloned().unwrap_or_default())
    }

    fn fetch_account(&self, id: &str) -> StoreResult<Option<Account>> {
        self.read(|s| s.accounts.get(id).cloned())
    }

    fn accounts(&self) -> StoreResult<Vec<Account>> {
        self.read(|s| s.accounts.values().cloned().collect())
    }

    fn upsert_account(&self, account: &Account) -> StoreResult<()> {
        self.write(|s| {
            s.accounts.insert(account.id.clone(), account.clone());
            Ok(())
        })
    }

    fn remove_account(&self, id: &str) -> StoreResult<()> {
        self.write(|s| {
            let lists: Vec<String> = s
                .lists
                .values()
                .filter(|l| l.account_id == id)
                .map(|l| l.id.clone())
                .collect();
            for list in lists {
                s.delete_list(&list);
            }
            s.accounts.remove(id);
            Ok(())
        })
    }

    fn set_account_error(&self, id: &str, error: Option<&str>) -> StoreResult<()> {
        self.write(|s| {
            let account = s.accounts.get_mut(id).ok_or_else(|| not_found("Account", id))?;
            account.error = error.map(str::to_string);
            Ok(())
        })
    }
}
