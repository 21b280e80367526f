//! The narrow local-store contract the sync engine depends on.
//!
//! Every method is atomic on its own; `save_synced` writes a task and its
//! link together so a half-applied remote object is never observable.

mod local;

pub use local::LocalStore;

use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::model::{
    Account, AccountId, LinkId, ListId, Principal, RemoteLink, Task, TaskId, TaskList,
};

pub trait TaskStore: Send + Sync {
    // Tasks
    fn fetch_task(&self, id: TaskId) -> StoreResult<Option<Task>>;
    /// Direct, non-deleted children of a task.
    fn fetch_children(&self, id: TaskId) -> StoreResult<Vec<Task>>;
    /// Insert a new task, assigning its id.
    fn insert_task(&self, task: Task) -> StoreResult<Task>;
    fn upsert_task(&self, task: &Task) -> StoreResult<()>;
    fn mark_deleted(&self, id: TaskId, at: DateTime<Utc>) -> StoreResult<()>;
    fn purge_task(&self, id: TaskId) -> StoreResult<()>;
    /// Bump the modification timestamp so the next pass pushes these tasks.
    fn touch(&self, ids: &[TaskId], at: DateTime<Utc>) -> StoreResult<()>;
    fn tasks(&self) -> StoreResult<Vec<Task>>;

    // Remote links
    /// The active (non-tombstoned) link of a task in a list.
    fn get_remote_link(&self, task: TaskId, list: &str) -> StoreResult<Option<RemoteLink>>;
    /// Link carrying `remote_id` in a list, active links first, then tombstones.
    fn link_by_remote_id(&self, list: &str, remote_id: &str) -> StoreResult<Option<RemoteLink>>;
    /// Link stored under a resource name in a list, active links first.
    fn link_by_object(&self, list: &str, object: &str) -> StoreResult<Option<RemoteLink>>;
    fn links_for_task(&self, task: TaskId) -> StoreResult<Vec<RemoteLink>>;
    fn links_for_list(&self, list: &str) -> StoreResult<Vec<RemoteLink>>;
    /// Insert or update a link, assigning its id on insert.
    fn upsert_remote_link(&self, link: RemoteLink) -> StoreResult<RemoteLink>;
    fn purge_link(&self, id: LinkId) -> StoreResult<()>;
    /// Drop a link whose remote side is settled, and its task too once that
    /// task is deleted and no other link (pending deletes included) is left.
    fn release_link(&self, id: LinkId) -> StoreResult<()>;
    /// Tombstones plus every link whose task changed since its last sync.
    fn list_dirty_links(&self, list: &str) -> StoreResult<Vec<RemoteLink>>;
    /// Atomically write a task and its link, inserting either when new.
    fn save_synced(&self, task: Task, link: RemoteLink) -> StoreResult<(Task, RemoteLink)>;
    /// Recompute local parents of clean tasks in a list from their remote parents.
    fn update_parents(&self, list: &str) -> StoreResult<()>;

    // Lists
    fn fetch_list(&self, id: &str) -> StoreResult<Option<TaskList>>;
    fn lists_for_account(&self, account: &str) -> StoreResult<Vec<TaskList>>;
    fn upsert_list(&self, list: &TaskList) -> StoreResult<()>;
    /// Remove a list, its links, and every task left without a link.
    fn delete_list(&self, id: &str) -> StoreResult<()>;
    fn set_list_change_token(&self, list: &str, token: Option<&str>) -> StoreResult<()>;
    fn replace_principals(&self, list: &str, principals: Vec<Principal>) -> StoreResult<()>;
    fn principals(&self, list: &str) -> StoreResult<Vec<Principal>>;

    // Accounts
    fn fetch_account(&self, id: &str) -> StoreResult<Option<Account>>;
    fn accounts(&self) -> StoreResult<Vec<Account>>;
    fn upsert_account(&self, account: &Account) -> StoreResult<()>;
    fn remove_account(&self, id: &str) -> StoreResult<()>;
    fn set_account_error(&self, id: &str, error: Option<&str>) -> StoreResult<()>;
}

/// Look up a list together with its owning account, if both exist.
pub fn account_for_list(
    store: &dyn TaskStore,
    list: &ListId,
) -> StoreResult<Option<(TaskList, Account)>> {
    let Some(list) = store.fetch_list(list)? else {
        return Ok(None);
    };
    let account: Option<Account> = store.fetch_account(&list.account_id)?;
    Ok(account.map(|a| (list, a)))
}

/// Ids of every configured account.
pub fn account_ids(store: &dyn TaskStore) -> StoreResult<Vec<AccountId>> {
    Ok(store.accounts()?.into_iter().map(|a| a.id).collect())
}
