//! Server family detection from discovery response headers.

use tasksync_core::model::ServerFamily;

/// Headers of the discovery response that identify the server software.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    /// `DAV` compliance header
    pub dav: Option<String>,
    /// `X-Sabre-Version`
    pub sabre_version: Option<String>,
    /// `Server`
    pub server: Option<String>,
}

impl ServerInfo {
    pub fn from_headers(headers: &http::HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };

        ServerInfo {
            dav: non_empty(get("dav")),
            sabre_version: non_empty(get("x-sabre-version")),
            server: non_empty(get("server")),
        }
    }
}

/// Pick the family whose quirks apply to this server.
///
/// A tasks.org account always wins; otherwise the first matching header
/// decides, and anything unrecognized falls back to plain RFC 5545.
pub fn detect_family(info: &ServerInfo, tasks_org: bool) -> ServerFamily {
    if tasks_org {
        return ServerFamily::Tasks;
    }
    if info
        .dav
        .as_deref()
        .is_some_and(|dav| dav.contains("oc-resource-sharing"))
    {
        return ServerFamily::OwnCloud;
    }
    if info
        .sabre_version
        .as_deref()
        .is_some_and(|v| !v.trim().is_empty())
    {
        return ServerFamily::SabreDav;
    }
    if info.server.as_deref() == Some("Openexchange WebDAV") {
        return ServerFamily::OpenXchange;
    }
    ServerFamily::Unknown
}
