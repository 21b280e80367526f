//! The network seam of the CalDAV synchronizer.

use async_trait::async_trait;
use http::StatusCode;
use libdav::caldav::FindCalendarHomeSet;
use tasksync_core::error::{SyncError, SyncResult};

use crate::client::{TaskDavClient, create_caldav_client};
use crate::family::ServerInfo;
use crate::requests::{
    Collection, DeleteTodo, ListTodoEtags, Member, MultigetTodos, PropfindCollections, PutTodo,
    Resource,
};

/// Result of collection discovery.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub server: ServerInfo,
    pub collections: Vec<Collection>,
}

#[async_trait]
pub trait CaldavTransport: Send + Sync {
    /// Task collections in the calendar home set.
    async fn discover(&self) -> SyncResult<Discovery>;

    /// Every VTODO member of a collection with its ETag.
    async fn list_etags(&self, collection: &str) -> SyncResult<Vec<Member>>;

    async fn multiget(&self, collection: &str, hrefs: &[String]) -> SyncResult<Vec<Resource>>;

    /// Store an object, returning the new ETag when the server sends one.
    async fn put(&self, href: &str, body: &str, etag: Option<&str>) -> SyncResult<Option<String>>;

    /// Delete an object; a missing object counts as deleted.
    async fn delete(&self, href: &str) -> SyncResult<()>;
}

/// [`CaldavTransport`] backed by libdav over hyper.
pub struct LibdavTransport {
    client: TaskDavClient,
}

impl LibdavTransport {
    pub fn connect(url: &str, username: &str, password: &str) -> SyncResult<Self> {
        Ok(LibdavTransport {
            client: create_caldav_client(url, username, password)?,
        })
    }

    async fn home_set(&self) -> SyncResult<String> {
        let principal = self
            .client
            .find_current_user_principal()
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to find user principal: {}", e)))?
            .ok_or_else(|| {
                SyncError::Unauthorized("Server did not report a user principal".into())
            })?;

        let response = self
            .client
            .request(FindCalendarHomeSet::new(&principal))
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to find calendar home set: {}", e)))?;

        response
            .home_sets
            .into_iter()
            .next()
            .map(|home| home.path().to_string())
            .ok_or_else(|| SyncError::Config("No calendar home set found for this account".into()))
    }
}

/// Map a response status to a sync error.
pub fn check_status(status: StatusCode, what: &str) -> SyncResult<()> {
    if status.is_success() || status == StatusCode::MULTI_STATUS {
        return Ok(());
    }
    Err(match status.as_u16() {
        401 | 403 => SyncError::Unauthorized(format!("{} rejected ({})", what, status)),
        409 | 412 => SyncError::Conflict(format!("{} ({})", what, status)),
        code => SyncError::Http {
            status: code,
            message: format!("{} failed", what),
        },
    })
}

fn transport_error(what: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Transport(format!("{}: {}", what, e))
}

#[async_trait]
impl CaldavTransport for LibdavTransport {
    async fn discover(&self) -> SyncResult<Discovery> {
        let home = self.home_set().await?;
        log::debug!("Calendar home set: {}", home);

        let response = self
            .client
            .request(PropfindCollections::new(&home))
            .await
            .map_err(|e| transport_error("PROPFIND", e))?;
        check_status(response.status, "PROPFIND")?;

        Ok(Discovery {
            server: response.server,
            collections: response.collections,
        })
    }

    async fn list_etags(&self, collection: &str) -> SyncResult<Vec<Member>> {
        let response = self
            .client
            .request(ListTodoEtags::new(collection))
            .await
            .map_err(|e| transport_error("calendar-query", e))?;
        check_status(response.status, "calendar-query")?;
        Ok(response.members)
    }

    async fn multiget(&self, collection: &str, hrefs: &[String]) -> SyncResult<Vec<Resource>> {
        let response = self
            .client
            .request(MultigetTodos::new(collection, hrefs))
            .await
            .map_err(|e| transport_error("calendar-multiget", e))?;
        check_status(response.status, "calendar-multiget")?;
        Ok(response.resources)
    }

    async fn put(&self, href: &str, body: &str, etag: Option<&str>) -> SyncResult<Option<String>> {
        let response = self
            .client
            .request(PutTodo::new(href, body, etag))
            .await
            .map_err(|e| transport_error("PUT", e))?;
        check_status(response.status, &format!("PUT {}", href))?;
        Ok(response.etag)
    }

    async fn delete(&self, href: &str) -> SyncResult<()> {
        let response = self
            .client
            .request(DeleteTodo::new(href))
            .await
            .map_err(|e| transport_error("DELETE", e))?;
        if response.status == StatusCode::NOT_FOUND || response.status == StatusCode::GONE {
            log::debug!("{} was already gone", href);
            return Ok(());
        }
        check_status(response.status, &format!("DELETE {}", href))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_statuses_to_error_classes() {
        assert!(check_status(StatusCode::CREATED, "PUT").is_ok());
        assert!(check_status(StatusCode::MULTI_STATUS, "REPORT").is_ok());
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED, "PUT"),
            Err(SyncError::Unauthorized(_))
        ));
        assert!(matches!(
            check_status(StatusCode::PRECONDITION_FAILED, "PUT"),
            Err(SyncError::Conflict(_))
        ));

        let server_error = check_status(StatusCode::BAD_GATEWAY, "PUT").unwrap_err();
        assert!(server_error.is_retryable());
        let client_error = check_status(StatusCode::BAD_REQUEST, "PUT").unwrap_err();
        assert!(!client_error.is_retryable());
    }
}
