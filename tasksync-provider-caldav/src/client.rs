//! CalDAV client construction and href helpers.

use http::Uri;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use libdav::CalDavClient;
use libdav::dav::WebDavClient;
use tasksync_core::error::{SyncError, SyncResult};
use tower::ServiceBuilder;
use tower_http::{auth::AddAuthorization, follow_redirect::FollowRedirect};

/// HTTP client with basic auth and redirect following.
pub type HttpClient = FollowRedirect<
    AddAuthorization<
        Client<
            hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
            String,
        >,
    >,
>;

pub type TaskDavClient = CalDavClient<HttpClient>;

/// Create a libdav client authenticating with HTTP basic auth.
///
/// Redirects are followed, since many servers answer the well-known
/// endpoint with a redirect to the real DAV root.
pub fn create_caldav_client(
    base_url: &str,
    username: &str,
    password: &str,
) -> SyncResult<TaskDavClient> {
    let uri: Uri = base_url
        .parse()
        .map_err(|e| SyncError::Config(format!("Invalid server URL {}: {}", base_url, e)))?;

    let https_connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .map_err(|e| SyncError::Transport(format!("Failed to load native TLS roots: {}", e)))?
        .https_or_http()
        .enable_http1()
        .build();

    let http_client = Client::builder(TokioExecutor::new()).build(https_connector);
    let auth_client = AddAuthorization::basic(http_client, username, password);
    let client = ServiceBuilder::new()
        .layer(tower_http::follow_redirect::FollowRedirectLayer::new())
        .service(auth_client);

    let webdav = WebDavClient::new(uri, client);
    Ok(CalDavClient::new(webdav))
}

/// Href of a resource inside a collection.
pub fn object_href(collection_href: &str, object: &str) -> String {
    format!("{}/{}", collection_href.trim_end_matches('/'), object)
}

/// Resource file name for a remote id, as used when creating objects.
pub fn object_name(remote_id: &str) -> String {
    format!("{}.ics", remote_id)
}

/// Last path segment of an href.
///
/// "/calendars/user1/tasks/abc.ics" becomes "abc.ics".
pub fn href_name(href: &str) -> &str {
    href.trim_end_matches('/').rsplit('/').next().unwrap_or(href)
}

/// Path component of a full URL, or the input when it is already a path.
pub fn url_to_href(url: &str) -> String {
    match url.parse::<Uri>() {
        Ok(uri) if uri.scheme().is_some() => uri.path().to_string(),
        _ => url.to_string(),
    }
}

/// Collection hrefs compare equal regardless of a trailing slash.
pub fn same_collection(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}
