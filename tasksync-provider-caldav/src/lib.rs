//! CalDAV backend for tasksync.
//!
//! Discovers task collections, fetches changed VTODO objects by ETag and
//! pushes local changes with conditional PUTs.

pub mod client;
pub mod family;
pub mod requests;
pub mod synchronizer;
pub mod transport;

pub use family::{ServerInfo, detect_family};
pub use requests::{Collection, Member, Resource};
pub use synchronizer::{CaldavSynchronizer, MULTIGET_CHUNK};
pub use transport::{CaldavTransport, Discovery, LibdavTransport};
