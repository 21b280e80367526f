//! Accounts, task lists and sharing principals.

use serde::{Deserialize, Serialize};

pub type ListId = String;
pub type AccountId = String;

/// A remote task list (CalDAV calendar or journal collection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    pub id: ListId,
    pub account_id: AccountId,
    /// Collection href for CalDAV, journal uid for the journal backend
    pub url: String,
    pub name: String,
    pub color: Option<String>,
    pub access: Access,
    /// CTag / sync-token / stoken of the last fully applied state
    pub change_token: Option<String>,
}

impl TaskList {
    pub fn new(
        account_id: impl Into<String>,
        url: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        TaskList {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            url: url.into(),
            name: name.into(),
            color: None,
            access: Access::Unknown,
            change_token: None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.access == Access::ReadOnly
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Owner,
    ReadWrite,
    ReadOnly,
    #[default]
    Unknown,
}

/// Server families that need distinct handling when decoding task data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFamily {
    Tasks,
    OwnCloud,
    SabreDav,
    OpenXchange,
    #[default]
    Unknown,
}

/// Backend kind, each variant carrying only what it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backend {
    CalDav {
        url: String,
        username: String,
        #[serde(default)]
        family: ServerFamily,
        /// Account points at a tasks.org server
        #[serde(default)]
        tasks_org: bool,
    },
    Journal {
        url: String,
        username: String,
    },
    /// List-style providers without task hierarchy
    ListOnly {
        provider: String,
    },
}

impl Backend {
    pub fn supports_hierarchy(&self) -> bool {
        match self {
            Backend::CalDav { .. } | Backend::Journal { .. } => true,
            Backend::ListOnly { .. } => false,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Backend::CalDav { .. } => "caldav",
            Backend::Journal { .. } => "journal",
            Backend::ListOnly { .. } => "list-only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub backend: Backend,
    /// Last sync failure, surfaced to the user
    pub error: Option<String>,
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>, backend: Backend) -> Self {
        Account {
            id: id.into(),
            name: name.into(),
            backend,
            error: None,
        }
    }
}

/// A collaborator on a shared list, written only from remote discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub href: String,
    pub display_name: Option<String>,
    pub invite: InviteState,
    pub access: Access,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InviteState {
    Accepted,
    #[default]
    NoResponse,
    Declined,
    Invalid,
}
