//! Wire-level VTODO record and its mapping to and from [`Task`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::priority;
use crate::model::{Alarm, Place, Recurrence, ServerFamily, Task, TaskTime};

/// Properties we map explicitly; every other `X-` property is carried as-is.
pub(crate) const SORT_ORDER_PROP: &str = "X-APPLE-SORT-ORDER";
pub(crate) const COLLAPSED_PROP: &str = "X-OC-HIDESUBTASKS";

/// A decoded VTODO, before it is mapped onto a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteTodo {
    pub uid: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    /// Raw PRIORITY value, classified per server family when applied
    pub priority: Option<u8>,
    pub due: Option<TaskTime>,
    pub start: Option<TaskTime>,
    pub completed: Option<DateTime<Utc>>,
    /// STATUS:COMPLETED without a COMPLETED timestamp
    pub status_completed: bool,
    pub recurrence: Option<Recurrence>,
    pub parent_uid: Option<String>,
    pub order: Option<i64>,
    pub collapsed: bool,
    pub categories: Vec<String>,
    pub geo: Option<Place>,
    pub alarms: Vec<Alarm>,
    pub created: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    /// Unmapped `X-` properties, preserved for round-tripping
    pub custom_properties: Vec<(String, String)>,
}

impl RemoteTodo {
    /// Build the wire record for `task`.
    ///
    /// `previous` is the last payload seen for this object; its raw priority
    /// and custom properties survive a local edit.
    pub fn from_task(
        task: &Task,
        uid: &str,
        parent_uid: Option<String>,
        previous: Option<&RemoteTodo>,
        family: ServerFamily,
    ) -> RemoteTodo {
        let previous_priority = previous.and_then(|p| p.priority);
        RemoteTodo {
            uid: uid.to_string(),
            summary: Some(task.title.clone()),
            description: task.notes.clone(),
            priority: Some(priority::encode(task.priority, previous_priority, family)),
            due: task.due,
            start: task.start,
            completed: task.completed,
            status_completed: task.completed.is_some(),
            recurrence: task.recurrence.clone(),
            parent_uid,
            order: task.order,
            collapsed: task.collapsed,
            categories: task.tags.iter().cloned().collect(),
            geo: task.place,
            alarms: task.alarms.clone(),
            created: Some(task.created),
            last_modified: Some(task.modified),
            custom_properties: previous
                .map(|p| p.custom_properties.clone())
                .unwrap_or_default(),
        }
    }

    /// Overwrite the synced fields of `task` with this record.
    ///
    /// Local parent, id and modification time are owned by the caller.
    pub fn apply_to(&self, task: &mut Task, family: ServerFamily) {
        task.title = self.summary.clone().unwrap_or_default();
        task.notes = self.description.clone();
        task.priority = priority::decode(self.priority, family);
        task.due = self.due;
        task.start = self.start;
        task.completed = match (self.completed, self.status_completed) {
            (Some(at), _) => Some(at),
            (None, true) => Some(task.completed.or(self.last_modified).unwrap_or_else(Utc::now)),
            (None, false) => None,
        };
        task.recurrence = self.recurrence.clone();
        task.order = self.order;
        task.collapsed = self.collapsed;
        task.tags = self.categories.iter().cloned().collect::<BTreeSet<_>>();
        task.place = self.geo;
        task.alarms = self.alarms.clone();
        if let Some(created) = self.created {
            task.created = created;
        }
    }
}
