//! HTTP client for the journal server.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tasksync_core::error::{SyncError, SyncResult};

use crate::model::{EncryptedEntry, Journal, UserInfo};

/// Entries requested per fetch.
pub const MAX_FETCH: usize = 50;
/// Entries sent per push.
pub const MAX_PUSH: usize = 30;

/// Operations the journal synchronizer needs from a server.
#[async_trait]
pub trait JournalTransport: Send + Sync {
    /// Key material of `username`, if the account has any.
    async fn user_info(&self, username: &str) -> SyncResult<Option<UserInfo>>;

    async fn journals(&self) -> SyncResult<Vec<Journal>>;

    async fn journal(&self, uid: &str) -> SyncResult<Journal>;

    /// Up to `limit` entries following `last`, oldest first.
    async fn entries(
        &self,
        journal: &str,
        last: Option<&str>,
        limit: usize,
    ) -> SyncResult<Vec<EncryptedEntry>>;

    /// Append `entries`; rejected with a conflict when `last` is no longer the
    /// journal's newest entry.
    async fn push_entries(
        &self,
        journal: &str,
        entries: &[EncryptedEntry],
        last: Option<&str>,
    ) -> SyncResult<()>;
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

fn base_url(url: &str) -> String {
    format!("{}/", url.trim_end_matches('/'))
}

fn transport_error(e: reqwest::Error) -> SyncError {
    SyncError::Transport(e.to_string())
}

async fn check_status(resp: Response) -> SyncResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Unauthorized(message),
        StatusCode::CONFLICT => SyncError::Conflict(message),
        _ => SyncError::Http {
            status: status.as_u16(),
            message,
        },
    })
}

/// Exchange a login password for an API token.
pub async fn authenticate(url: &str, username: &str, password: &str) -> SyncResult<String> {
    let resp = Client::new()
        .post(format!("{}api-token-auth/", base_url(url)))
        .json(&TokenRequest { username, password })
        .send()
        .await
        .map_err(transport_error)?;

    let token: TokenResponse = check_status(resp)
        .await?
        .json()
        .await
        .map_err(transport_error)?;
    Ok(token.token)
}

/// Journal server client using token authentication.
pub struct HttpJournalClient {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpJournalClient {
    pub fn new(url: &str, token: impl Into<String>) -> SyncResult<Self> {
        let http = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(transport_error)?;
        Ok(HttpJournalClient {
            http,
            base_url: base_url(url),
            token: token.into(),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http.get(format!("{}{}", self.base_url, path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorized(self.http.post(format!("{}{}", self.base_url, path)))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(
            reqwest::header::AUTHORIZATION,
            format!("Token {}", self.token),
        )
    }

    async fn send(request: RequestBuilder) -> SyncResult<Response> {
        let resp = request.send().await.map_err(transport_error)?;
        check_status(resp).await
    }
}

#[async_trait]
impl JournalTransport for HttpJournalClient {
    async fn user_info(&self, username: &str) -> SyncResult<Option<UserInfo>> {
        let resp = self
            .get(&format!("api/v1/user/{}/", username))
            .send()
            .await
            .map_err(transport_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let info = check_status(resp).await?.json().await.map_err(transport_error)?;
        Ok(Some(info))
    }

    async fn journals(&self) -> SyncResult<Vec<Journal>> {
        Self::send(self.get("api/v1/journals/"))
            .await?
            .json()
            .await
            .map_err(transport_error)
    }

    async fn journal(&self, uid: &str) -> SyncResult<Journal> {
        Self::send(self.get(&format!("api/v1/journals/{}/", uid)))
            .await?
            .json()
            .await
            .map_err(transport_error)
    }

    async fn entries(
        &self,
        journal: &str,
        last: Option<&str>,
        limit: usize,
    ) -> SyncResult<Vec<EncryptedEntry>> {
        let mut request = self
            .get(&format!("api/v1/journals/{}/entries/", journal))
            .query(&[("limit", limit.to_string())]);
        if let Some(last) = last {
            request = request.query(&[("last", last)]);
        }
        Self::send(request).await?.json().await.map_err(transport_error)
    }

    async fn push_entries(
        &self,
        journal: &str,
        entries: &[EncryptedEntry],
        last: Option<&str>,
    ) -> SyncResult<()> {
        let mut request = self
            .post(&format!("api/v1/journals/{}/entries/", journal))
            .json(entries);
        if let Some(last) = last {
            request = request.query(&[("last", last)]);
        }
        Self::send(request).await?;
        Ok(())
    }
}
