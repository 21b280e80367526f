//! Canonical task record.
//!
//! Synchronizers convert wire objects into these types, and the mover and
//! local store work exclusively with them.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = i64;

/// A task (backend-neutral)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Assigned by the store on insert; zero until then
    pub id: TaskId,
    pub title: String,
    pub notes: Option<String>,
    pub priority: Priority,
    pub due: Option<TaskTime>,
    /// Start / hide-until
    pub start: Option<TaskTime>,
    pub completed: Option<DateTime<Utc>>,
    pub recurrence: Option<Recurrence>,

    // Hierarchy & ordering
    /// Local parent task (never a remote id)
    pub parent: Option<TaskId>,
    pub collapsed: bool,
    pub order: Option<i64>,

    pub tags: BTreeSet<String>,
    pub place: Option<Place>,
    pub alarms: Vec<Alarm>,

    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Soft-delete marker, purged after the deletion reached every remote
    pub deleted: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Task {
            id: 0,
            title: title.into(),
            notes: None,
            priority: Priority::None,
            due: None,
            start: None,
            completed: None,
            recurrence: None,
            parent: None,
            collapsed: false,
            order: None,
            tags: BTreeSet::new(),
            place: None,
            alarms: Vec::new(),
            created: now,
            modified: now,
            deleted: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }
}

/// Due and start values are either a calendar day or an exact instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskTime {
    AllDay(NaiveDate),
    Timed(DateTime<Utc>),
}

impl TaskTime {
    pub fn has_time(&self) -> bool {
        matches!(self, TaskTime::Timed(_))
    }

    /// Instant used for ordering; all-day values sort at UTC midnight.
    pub fn instant(&self) -> DateTime<Utc> {
        match self {
            TaskTime::AllDay(d) => d.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc(),
            TaskTime::Timed(dt) => *dt,
        }
    }
}

impl std::fmt::Display for TaskTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskTime::AllDay(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            TaskTime::Timed(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M UTC")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    None,
    Low,
    Medium,
    High,
}

/// A recurrence rule without the `RRULE:` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub rule: String,
    /// Repeat from the completion date instead of the due date
    pub from_completion: bool,
}

/// Geographic place reference
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Place {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Alarm {
    /// Offset in seconds from the start (negative = before)
    RelativeToStart(i64),
    /// Offset in seconds from the due time (negative = before)
    RelativeToDue(i64),
    At(DateTime<Utc>),
}
