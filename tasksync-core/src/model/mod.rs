//! Backend-neutral data model.

mod link;
mod list;
mod task;

pub use link::{LinkId, RemoteLink, parents_first};
pub use list::{
    Access, Account, AccountId, Backend, InviteState, ListId, Principal, ServerFamily, TaskList,
};
pub use task::{Alarm, Place, Priority, Recurrence, Task, TaskId, TaskTime};
