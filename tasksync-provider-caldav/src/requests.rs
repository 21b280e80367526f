//! CalDAV requests libdav does not provide in the shape the synchronizer needs.
//!
//! Every request here reports the response status instead of failing on it,
//! so the transport can map statuses to sync errors.

use http::{Method, StatusCode};
use libdav::requests::{DavRequest, ParseResponseError, PreparedRequest};
use roxmltree::Node;
use tasksync_core::model::{Access, InviteState, Principal};

use crate::family::ServerInfo;

/// A task collection as seen during discovery.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    pub href: String,
    pub display_name: Option<String>,
    pub color: Option<String>,
    pub ctag: Option<String>,
    pub sync_token: Option<String>,
    pub access: Access,
    pub principals: Vec<Principal>,
}

impl Collection {
    /// The sync-token when the server has one, else the CTag.
    pub fn change_token(&self) -> Option<&str> {
        self.sync_token.as_deref().or(self.ctag.as_deref())
    }
}

/// Href and version of a collection member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub href: String,
    pub etag: Option<String>,
}

/// A fetched calendar object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub href: String,
    pub etag: Option<String>,
    pub data: Option<String>,
}

fn is_success(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::MULTI_STATUS
}

// ============================================================================
// PROPFIND on the calendar home set
// ============================================================================

pub struct PropfindCollections<'a> {
    home_href: &'a str,
}

impl<'a> PropfindCollections<'a> {
    pub fn new(home_href: &'a str) -> Self {
        Self { home_href }
    }
}

#[derive(Debug)]
pub struct PropfindCollectionsResponse {
    pub status: StatusCode,
    pub server: ServerInfo,
    /// Only collections that accept VTODO components
    pub collections: Vec<Collection>,
}

impl DavRequest for PropfindCollections<'_> {
    type Response = PropfindCollectionsResponse;
    type ParseError = ParseResponseError;
    type Error<E> = libdav::dav::WebDavError<E>;

    fn prepare_request(&self) -> std::result::Result<PreparedRequest, http::Error> {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<d:propfind xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav" xmlns:cs="http://calendarserver.org/ns/" xmlns:ic="http://apple.com/ns/ical/" xmlns:oc="http://owncloud.org/ns">
  <d:prop>
    <d:displayname/>
    <d:resourcetype/>
    <d:sync-token/>
    <d:current-user-principal/>
    <d:current-user-privilege-set/>
    <d:share-access/>
    <d:invite/>
    <c:supported-calendar-component-set/>
    <cs:getctag/>
    <ic:calendar-color/>
    <oc:owner-principal/>
    <oc:invite/>
  </d:prop>
</d:propfind>"#;

        Ok(PreparedRequest {
            method: Method::from_bytes(b"PROPFIND")?,
            path: self.home_href.to_string(),
            body: body.to_string(),
            headers: vec![
                ("Depth".to_string(), "1".to_string()),
                (
                    "Content-Type".to_string(),
                    "application/xml; charset=utf-8".to_string(),
                ),
            ],
        })
    }

    fn parse_response(
        &self,
        parts: &http::response::Parts,
        body: &[u8],
    ) -> std::result::Result<Self::Response, ParseResponseError> {
        let server = ServerInfo::from_headers(&parts.headers);
        let collections = if is_success(parts.status) {
            parse_collections(body, self.home_href)?
        } else {
            Vec::new()
        };
        Ok(PropfindCollectionsResponse {
            status: parts.status,
            server,
            collections,
        })
    }
}

fn parse_collections(
    body: &[u8],
    home_href: &str,
) -> std::result::Result<Vec<Collection>, ParseResponseError> {
    let text = std::str::from_utf8(body)?;
    let doc = roxmltree::Document::parse(text)?;

    let mut collections = Vec::new();
    for response in responses(&doc) {
        let Some(href) = child_text(response, "href") else {
            continue;
        };
        if href.trim_end_matches('/') == home_href.trim_end_matches('/') {
            continue;
        }

        let props = ok_props(response);
        let find = |name: &str| props.iter().find_map(|p| descendant(*p, name));

        let is_calendar = find("resourcetype")
            .and_then(|rt| descendant(rt, "calendar"))
            .is_some();
        if !is_calendar {
            continue;
        }

        // Servers that omit the component set accept every component
        let supports_todo = find("supported-calendar-component-set").is_none_or(|set| {
            set.descendants()
                .filter(|n| n.tag_name().name() == "comp")
                .any(|n| n.attribute("name") == Some("VTODO"))
        });
        if !supports_todo {
            log::debug!("Skipping {}: no VTODO support", href);
            continue;
        }

        let current_user = find("current-user-principal").and_then(|n| child_text(n, "href"));
        let owner = find("owner-principal").map(node_text).filter(|s| !s.is_empty());
        let is_owner = match (&owner, &current_user) {
            (Some(owner), Some(me)) => is_same_principal(me, owner),
            _ => false,
        };

        let access = match find("share-access") {
            Some(share) => access_of(share),
            None if is_owner => Access::Owner,
            None => match find("current-user-privilege-set") {
                Some(set) if !may_write(set) => Access::ReadOnly,
                _ => Access::ReadWrite,
            },
        };

        let mut principals = Vec::new();
        if let Some(invite) = props
            .iter()
            .flat_map(|p| p.children())
            .find(|n| n.tag_name().name() == "invite")
        {
            for sharee in invite
                .children()
                .filter(|n| matches!(n.tag_name().name(), "sharee" | "user"))
            {
                let Some(href) = child_text(sharee, "href") else {
                    continue;
                };
                if current_user
                    .as_deref()
                    .is_some_and(|me| is_same_principal(me, &href))
                {
                    continue;
                }
                let display_name =
                    child_text(sharee, "displayname").or_else(|| child_text(sharee, "common-name"));
                let access = descendant(sharee, "share-access")
                    .or_else(|| descendant(sharee, "access"))
                    .map(access_of)
                    .unwrap_or_default();
                principals.push(Principal {
                    href,
                    display_name,
                    invite: invite_state(sharee),
                    access,
                });
            }
            if let (Some(owner), false) = (&owner, is_owner) {
                principals.push(Principal {
                    href: owner.clone(),
                    display_name: None,
                    invite: InviteState::Accepted,
                    access: Access::Owner,
                });
            }
        }

        collections.push(Collection {
            href,
            display_name: find("displayname").map(node_text).filter(|s| !s.is_empty()),
            color: find("calendar-color").map(|n| normalize_color(&node_text(n))),
            ctag: find("getctag").map(node_text).filter(|s| !s.is_empty()),
            sync_token: find("sync-token").map(node_text).filter(|s| !s.is_empty()),
            access,
            principals,
        });
    }

    Ok(collections)
}

fn access_of(node: Node) -> Access {
    let names: Vec<&str> = node
        .descendants()
        .filter(|n| n.is_element())
        .map(|n| n.tag_name().name())
        .collect();
    if names.contains(&"shared-owner") {
        Access::Owner
    } else if names.contains(&"read-write") {
        Access::ReadWrite
    } else if names.contains(&"read") {
        Access::ReadOnly
    } else {
        Access::Unknown
    }
}

fn may_write(privileges: Node) -> bool {
    privileges
        .descendants()
        .any(|n| matches!(n.tag_name().name(), "all" | "write" | "write-content"))
}

fn invite_state(sharee: Node) -> InviteState {
    let names: Vec<&str> = sharee
        .children()
        .filter(|n| n.is_element())
        .map(|n| n.tag_name().name())
        .collect();
    if names.contains(&"invite-accepted") {
        InviteState::Accepted
    } else if names.contains(&"invite-declined") {
        InviteState::Declined
    } else if names.contains(&"invite-invalid") {
        InviteState::Invalid
    } else {
        InviteState::NoResponse
    }
}

/// Principal hrefs are compared ignoring a trailing slash, and ownCloud
/// reports owners relative to the principal collection.
fn is_same_principal(current: &str, other: &str) -> bool {
    let current = current.trim_end_matches('/');
    let other = other.trim_end_matches('/');
    current == other || current.ends_with(other)
}

/// Apple-style `#RRGGBBAA` colors lose their alpha channel.
fn normalize_color(color: &str) -> String {
    let color = color.trim();
    if color.len() == 9 && color.starts_with('#') {
        color[..7].to_string()
    } else {
        color.to_string()
    }
}

// ============================================================================
// calendar-query listing member ETags
// ============================================================================

pub struct ListTodoEtags<'a> {
    collection_href: &'a str,
}

impl<'a> ListTodoEtags<'a> {
    pub fn new(collection_href: &'a str) -> Self {
        Self { collection_href }
    }
}

#[derive(Debug)]
pub struct ListTodoEtagsResponse {
    pub status: StatusCode,
    pub members: Vec<Member>,
}

impl DavRequest for ListTodoEtags<'_> {
    type Response = ListTodoEtagsResponse;
    type ParseError = ParseResponseError;
    type Error<E> = libdav::dav::WebDavError<E>;

    fn prepare_request(&self) -> std::result::Result<PreparedRequest, http::Error> {
        let body = r#"<c:calendar-query xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
    <d:prop>
        <d:getetag/>
    </d:prop>
    <c:filter>
        <c:comp-filter name="VCALENDAR">
            <c:comp-filter name="VTODO"/>
        </c:comp-filter>
    </c:filter>
</c:calendar-query>"#;

        Ok(PreparedRequest {
            method: Method::from_bytes(b"REPORT")?,
            path: self.collection_href.to_string(),
            body: body.to_string(),
            headers: vec![
                ("Depth".to_string(), "1".to_string()),
                (
                    "Content-Type".to_string(),
                    "application/xml; charset=utf-8".to_string(),
                ),
            ],
        })
    }

    fn parse_response(
        &self,
        parts: &http::response::Parts,
        body: &[u8],
    ) -> std::result::Result<Self::Response, ParseResponseError> {
        if !is_success(parts.status) {
            return Ok(ListTodoEtagsResponse {
                status: parts.status,
                members: Vec::new(),
            });
        }

        let text = std::str::from_utf8(body)?;
        let doc = roxmltree::Document::parse(text)?;
        let members = responses(&doc)
            .filter_map(|response| {
                let href = child_text(response, "href")?;
                if href.trim_end_matches('/') == self.collection_href.trim_end_matches('/') {
                    return None;
                }
                let etag = ok_props(response)
                    .into_iter()
                    .find_map(|p| descendant(p, "getetag"))
                    .map(node_text)
                    .filter(|s| !s.is_empty());
                Some(Member { href, etag })
            })
            .collect();

        Ok(ListTodoEtagsResponse {
            status: parts.status,
            members,
        })
    }
}

// ============================================================================
// calendar-multiget
// ============================================================================

pub struct MultigetTodos<'a> {
    collection_href: &'a str,
    hrefs: &'a [String],
}

impl<'a> MultigetTodos<'a> {
    pub fn new(collection_href: &'a str, hrefs: &'a [String]) -> Self {
        Self {
            collection_href,
            hrefs,
        }
    }
}

#[derive(Debug)]
pub struct MultigetTodosResponse {
    pub status: StatusCode,
    pub resources: Vec<Resource>,
}

impl DavRequest for MultigetTodos<'_> {
    type Response = MultigetTodosResponse;
    type ParseError = ParseResponseError;
    type Error<E> = libdav::dav::WebDavError<E>;

    fn prepare_request(&self) -> std::result::Result<PreparedRequest, http::Error> {
        let hrefs: String = self
            .hrefs
            .iter()
            .map(|h| format!("    <d:href>{}</d:href>\n", escape_xml(h)))
            .collect();
        let body = format!(
            r#"<c:calendar-multiget xmlns:d="DAV:" xmlns:c="urn:ietf:params:xml:ns:caldav">
    <d:prop>
        <d:getetag/>
        <c:calendar-data/>
    </d:prop>
{}</c:calendar-multiget>"#,
            hrefs
        );

        Ok(PreparedRequest {
            method: Method::from_bytes(b"REPORT")?,
            path: self.collection_href.to_string(),
            body,
            headers: vec![
                ("Depth".to_string(), "1".to_string()),
                (
                    "Content-Type".to_string(),
                    "application/xml; charset=utf-8".to_string(),
                ),
            ],
        })
    }

    fn parse_response(
        &self,
        parts: &http::response::Parts,
        body: &[u8],
    ) -> std::result::Result<Self::Response, ParseResponseError> {
        if !is_success(parts.status) {
            return Ok(MultigetTodosResponse {
                status: parts.status,
                resources: Vec::new(),
            });
        }

        let text = std::str::from_utf8(body)?;
        let doc = roxmltree::Document::parse(text)?;
        let resources = responses(&doc)
            .filter_map(|response| {
                let href = child_text(response, "href")?;
                let props = ok_props(response);
                let etag = props
                    .iter()
                    .find_map(|p| descendant(*p, "getetag"))
                    .map(node_text)
                    .filter(|s| !s.is_empty());
                let data = props
                    .iter()
                    .find_map(|p| descendant(*p, "calendar-data"))
                    .map(node_text)
                    .filter(|s| !s.trim().is_empty());
                Some(Resource { href, etag, data })
            })
            .collect();

        Ok(MultigetTodosResponse {
            status: parts.status,
            resources,
        })
    }
}

// ============================================================================
// PUT and DELETE of single objects
// ============================================================================

pub struct PutTodo<'a> {
    href: &'a str,
    body: &'a str,
    etag: Option<&'a str>,
}

impl<'a> PutTodo<'a> {
    /// Conditional on `etag` when updating, on absence when creating.
    pub fn new(href: &'a str, body: &'a str, etag: Option<&'a str>) -> Self {
        Self { href, body, etag }
    }
}

#[derive(Debug)]
pub struct PutTodoResponse {
    pub status: StatusCode,
    pub etag: Option<String>,
}

impl DavRequest for PutTodo<'_> {
    type Response = PutTodoResponse;
    type ParseError = ParseResponseError;
    type Error<E> = libdav::dav::WebDavError<E>;

    fn prepare_request(&self) -> std::result::Result<PreparedRequest, http::Error> {
        let condition = match self.etag {
            Some(etag) => ("If-Match".to_string(), etag.to_string()),
            None => ("If-None-Match".to_string(), "*".to_string()),
        };
        Ok(PreparedRequest {
            method: Method::PUT,
            path: self.href.to_string(),
            body: self.body.to_string(),
            headers: vec![
                (
                    "Content-Type".to_string(),
                    "text/calendar; charset=utf-8".to_string(),
                ),
                condition,
            ],
        })
    }

    fn parse_response(
        &self,
        parts: &http::response::Parts,
        _body: &[u8],
    ) -> std::result::Result<Self::Response, ParseResponseError> {
        let etag = parts
            .headers
            .get(http::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty());
        Ok(PutTodoResponse {
            status: parts.status,
            etag,
        })
    }
}

pub struct DeleteTodo<'a> {
    href: &'a str,
}

impl<'a> DeleteTodo<'a> {
    pub fn new(href: &'a str) -> Self {
        Self { href }
    }
}

#[derive(Debug)]
pub struct DeleteTodoResponse {
    pub status: StatusCode,
}

impl DavRequest for DeleteTodo<'_> {
    type Response = DeleteTodoResponse;
    type ParseError = ParseResponseError;
    type Error<E> = libdav::dav::WebDavError<E>;

    fn prepare_request(&self) -> std::result::Result<PreparedRequest, http::Error> {
        Ok(PreparedRequest {
            method: Method::DELETE,
            path: self.href.to_string(),
            body: String::new(),
            headers: Vec::new(),
        })
    }

    fn parse_response(
        &self,
        parts: &http::response::Parts,
        _body: &[u8],
    ) -> std::result::Result<Self::Response, ParseResponseError> {
        Ok(DeleteTodoResponse {
            status: parts.status,
        })
    }
}

// ============================================================================
// Multistatus helpers
// ============================================================================

fn responses<'a, 'input>(
    doc: &'a roxmltree::Document<'input>,
) -> impl Iterator<Item = Node<'a, 'input>> {
    doc.root_element()
        .children()
        .filter(|n| n.tag_name().name() == "response")
}

/// `prop` elements of the propstats that reported success.
fn ok_props<'a, 'input>(response: Node<'a, 'input>) -> Vec<Node<'a, 'input>> {
    response
        .children()
        .filter(|n| n.tag_name().name() == "propstat")
        .filter(|propstat| {
            propstat
                .children()
                .find(|n| n.tag_name().name() == "status")
                .map(node_text)
                .is_none_or(|status| status.contains(" 200"))
        })
        .filter_map(|propstat| {
            propstat
                .children()
                .find(|n| n.tag_name().name() == "prop")
        })
        .collect()
}

fn descendant<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.descendants()
        .skip(1)
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn child_text(node: Node, name: &str) -> Option<String> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .map(node_text)
        .filter(|s| !s.is_empty())
}

/// All text below a node, which also joins split CDATA sections.
fn node_text(node: Node) -> String {
    node.descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect::<String>()
        .trim()
        .to_string()
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
