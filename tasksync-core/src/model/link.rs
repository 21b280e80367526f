//! Join records between local tasks and their remote representations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::list::ListId;
use super::task::{Task, TaskId};

pub type LinkId = i64;

/// Maps a task to its object in one remote list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLink {
    /// Assigned by the store on insert; zero until then
    pub id: LinkId,
    pub task_id: TaskId,
    pub list_id: ListId,
    /// iCalendar UID of the remote object
    pub remote_id: String,
    /// Resource file name inside the collection (CalDAV only)
    pub object: Option<String>,
    /// ETag, or the uid of the journal entry that last carried the object
    pub etag: Option<String>,
    /// Last known remote payload
    pub payload: Option<String>,
    /// UID of the parent object in the same list
    pub remote_parent: Option<String>,
    /// Tombstone: the remote object still has to be deleted
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
    pub order: Option<i64>,
}

impl RemoteLink {
    pub fn new(task_id: TaskId, list_id: impl Into<String>, remote_id: impl Into<String>) -> Self {
        RemoteLink {
            id: 0,
            task_id,
            list_id: list_id.into(),
            remote_id: remote_id.into(),
            object: None,
            etag: None,
            payload: None,
            remote_parent: None,
            deleted_at: None,
            last_sync: None,
            order: None,
        }
    }

    /// Mint a link with a fresh remote id.
    pub fn with_new_remote_id(task_id: TaskId, list_id: impl Into<String>) -> Self {
        RemoteLink::new(task_id, list_id, uuid::Uuid::new_v4().to_string())
    }

    pub fn is_tombstone(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Whether the local side holds changes the remote has not seen yet.
    pub fn is_dirty(&self, task: &Task) -> bool {
        if self.is_tombstone() || task.is_deleted() {
            return true;
        }
        match self.last_sync {
            None => true,
            Some(last_sync) => task.modified > last_sync,
        }
    }
}

/// Order links so that every parent precedes its children.
///
/// Only parents that are themselves part of `links` constrain the order;
/// links otherwise keep their relative position.
pub fn parents_first(links: Vec<RemoteLink>) -> Vec<RemoteLink> {
    let parents: HashMap<&str, Option<&str>> = links
        .iter()
        .map(|l| (l.remote_id.as_str(), l.remote_parent.as_deref()))
        .collect();

    let depth = |link: &RemoteLink| {
        let mut depth = 0usize;
        let mut current = link.remote_parent.as_deref();
        while let Some(parent) = current {
            // Cycles are bounded by the batch size
            if depth > parents.len() {
                break;
            }
            match parents.get(parent) {
                Some(next) => {
                    depth += 1;
                    current = *next;
                }
                None => break,
            }
        }
        depth
    };

    let mut keyed: Vec<(usize, usize)> = links
        .iter()
        .map(&depth)
        .enumerate()
        .map(|(i, d)| (d, i))
        .collect();
    keyed.sort();

    let mut slots: Vec<Option<RemoteLink>> = links.into_iter().map(Some).collect();
    keyed
        .into_iter()
        .filter_map(|(_, i)| slots[i].take())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn never_synced_link_is_dirty() {
        let task = Task::new("Buy milk");
        let link = RemoteLink::new(1, "list", "uid-1");
        assert!(link.is_dirty(&task));
    }

    #[test]
    fn link_is_clean_until_task_is_modified() {
        let mut task = Task::new("Buy milk");
        task.modified = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let mut link = RemoteLink::new(1, "list", "uid-1");
        link.last_sync = Some(Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap());
        assert!(!link.is_dirty(&task));

        task.modified = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 1).unwrap();
        assert!(link.is_dirty(&task));
    }

    #[test]
    fn deleted_task_makes_link_dirty() {
        let mut task = Task::new("Buy milk");
        task.modified = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        task.deleted = Some(task.modified);
        let mut link = RemoteLink::new(1, "list", "uid-1");
        link.last_sync = Some(Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap());
        assert!(link.is_dirty(&task));
    }

    #[test]
    fn parents_are_ordered_before_children() {
        let mut grandchild = RemoteLink::new(3, "list", "c");
        grandchild.remote_parent = Some("b".into());
        let mut child = RemoteLink::new(2, "list", "b");
        child.remote_parent = Some("a".into());
        let root = RemoteLink::new(1, "list", "a");
        let mut unrelated = RemoteLink::new(4, "list", "d");
        unrelated.remote_parent = Some("not-in-batch".into());

        let ordered = parents_first(vec![grandchild, child, unrelated, root]);
        let ids: Vec<&str> = ordered.iter().map(|l| l.remote_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "a", "b", "c"]);
    }
}
