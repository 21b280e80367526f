//! Applying decoded remote objects to the local store.

use chrono::Utc;

use crate::error::SyncResult;
use crate::ics::RemoteTodo;
use crate::model::{RemoteLink, ServerFamily, Task, TaskId, TaskList};
use crate::store::TaskStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created(TaskId),
    Updated(TaskId),
    /// The task has unpushed local changes; only the remote version was cached
    KeptLocal(TaskId),
    /// The object's link is waiting for a remote delete
    Tombstoned,
}

/// A remote object after decoding, with the version that carried it.
pub struct RemoteObject<'a> {
    pub todo: &'a RemoteTodo,
    /// Raw payload, cached on the link for merging on the next push
    pub payload: &'a str,
    /// ETag or journal entry uid
    pub version: &'a str,
    /// Resource file name, for backends that address objects by name
    pub object: Option<&'a str>,
}

/// Create or update the task behind a remote object.
///
/// Local edits win: when the link is dirty the task is left untouched and
/// the next push overwrites the remote copy.
pub fn apply_remote(
    store: &dyn TaskStore,
    list: &TaskList,
    remote: RemoteObject<'_>,
    family: ServerFamily,
) -> SyncResult<ApplyOutcome> {
    let existing = match remote.object {
        Some(object) => store.link_by_object(&list.id, object)?,
        None => None,
    };
    let existing = match existing {
        Some(link) => Some(link),
        None => store.link_by_remote_id(&list.id, &remote.todo.uid)?,
    };

    if existing.as_ref().is_some_and(RemoteLink::is_tombstone) {
        log::debug!("Ignoring {}: pending remote delete", remote.todo.uid);
        return Ok(ApplyOutcome::Tombstoned);
    }

    let task = match &existing {
        Some(link) => store.fetch_task(link.task_id)?,
        None => None,
    };

    if let (Some(link), Some(task)) = (&existing, &task) {
        if link.is_dirty(task) {
            log::debug!(
                "Task {} has local changes, caching remote version of {}",
                task.id,
                remote.todo.uid
            );
            let mut link = link.clone();
            link.etag = Some(remote.version.to_string());
            link.payload = Some(remote.payload.to_string());
            if let Some(object) = remote.object {
                link.object = Some(object.to_string());
            }
            store.upsert_remote_link(link)?;
            return Ok(ApplyOutcome::KeptLocal(task.id));
        }
    }

    let created = task.is_none();
    let mut task = task.unwrap_or_else(|| Task::new(""));
    let mut link = existing
        .unwrap_or_else(|| RemoteLink::new(task.id, list.id.clone(), remote.todo.uid.clone()));

    remote.todo.apply_to(&mut task, family);
    let now = Utc::now();
    task.modified = now;

    if let Some(object) = remote.object {
        link.object = Some(object.to_string());
    }
    link.etag = Some(remote.version.to_string());
    link.payload = Some(remote.payload.to_string());
    link.remote_parent = remote.todo.parent_uid.clone();
    link.order = remote.todo.order;
    link.last_sync = Some(now);

    let (task, _) = store.save_synced(task, link)?;
    log::debug!("Applied {} to task {}", remote.todo.uid, task.id);

    Ok(if created {
        ApplyOutcome::Created(task.id)
    } else {
        ApplyOutcome::Updated(task.id)
    })
}
