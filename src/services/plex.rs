//! Plex Media Server collection API
//!
//! [PlexCollectionApi] is the seam the reconciliation engine talks to;
//! [PlexClient] implements it against a real server over HTTP.
//!
//! Plex answers a successful "add item to collection" with the updated
//! collection metadata, and our own error path answers with a status object.
//! The two shapes are told apart here, at the boundary, by
//! [AddChildResponse::from_value].

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

use crate::db::MediaType;
use crate::error::{CollectionError, Result};
use crate::services::rate_limiter::{RateLimitedClient, ResponseExt};

/// Plex metadata type number for collections
const PLEX_COLLECTION_TYPE: u8 = 18;

/// A collection object as returned by Plex
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlexCollection {
    pub rating_key: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default, rename = "librarySectionID")]
    pub library_section_id: Option<i64>,
}

/// Outcome flag of a Plex mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NOK")]
    Nok,
}

impl RemoteStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RemoteStatus::Ok)
    }

    fn from_http(status: StatusCode) -> Self {
        if status.is_success() {
            RemoteStatus::Ok
        } else {
            RemoteStatus::Nok
        }
    }
}

/// Status-shaped response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicResponse {
    pub status: RemoteStatus,
    pub code: i32,
    pub message: String,
}

impl BasicResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Ok,
            code: 1,
            message: message.into(),
        }
    }

    pub fn nok(message: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Nok,
            code: 0,
            message: message.into(),
        }
    }
}

/// The two shapes Plex may answer an add-child call with
#[derive(Debug, Clone, PartialEq)]
pub enum AddChildResponse {
    /// Updated collection metadata; the item was added
    Collection(PlexCollection),
    /// Status object
    Status(BasicResponse),
    /// Neither shape; treated as a failure
    Unrecognized(String),
}

impl AddChildResponse {
    /// Classify a response body by structure.
    ///
    /// Accepts either a bare object or a `MediaContainer` wrapping a
    /// `Metadata` array (the first entry is inspected).
    pub fn from_value(value: &Value) -> Self {
        let candidate = value
            .get("MediaContainer")
            .and_then(|c| c.get("Metadata"))
            .and_then(|m| m.as_array())
            .and_then(|items| items.first())
            .unwrap_or(value);

        if candidate.get("ratingKey").is_some() {
            return match serde_json::from_value::<PlexCollection>(normalize_keys(candidate)) {
                Ok(collection) => AddChildResponse::Collection(collection),
                Err(e) => AddChildResponse::Unrecognized(format!("bad collection body: {}", e)),
            };
        }

        if candidate.get("status").is_some() {
            return match serde_json::from_value::<BasicResponse>(candidate.clone()) {
                Ok(status) => AddChildResponse::Status(status),
                Err(e) => AddChildResponse::Unrecognized(format!("bad status body: {}", e)),
            };
        }

        AddChildResponse::Unrecognized(truncate(&candidate.to_string(), 200))
    }

    /// Whether the remote side confirmed the add
    pub fn is_success(&self) -> bool {
        match self {
            AddChildResponse::Collection(_) => true,
            AddChildResponse::Status(status) => status.status.is_ok(),
            AddChildResponse::Unrecognized(_) => false,
        }
    }

    /// Human readable failure reason, `None` on success
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            AddChildResponse::Collection(_) => None,
            AddChildResponse::Status(status) if status.status.is_ok() => None,
            AddChildResponse::Status(status) => {
                Some(format!("status NOK ({}): {}", status.code, status.message))
            }
            AddChildResponse::Unrecognized(body) => Some(format!("unrecognized response: {}", body)),
        }
    }
}

/// External id reference on a Plex item (`tmdb://603`, `imdb://tt0133093`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlexGuid {
    pub id: String,
}

/// A library item (movie, show, season, episode) as returned by Plex
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlexLibraryItem {
    pub rating_key: String,
    #[serde(default)]
    pub parent_rating_key: Option<String>,
    #[serde(default)]
    pub grandparent_rating_key: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(rename = "Guid", default)]
    pub guids: Vec<PlexGuid>,
    #[serde(default)]
    pub added_at: Option<i64>,
}

/// Fields needed to create or retitle a remote collection
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRemoteCollection {
    pub library_id: i64,
    pub title: String,
    pub summary: Option<String>,
    pub media_type: MediaType,
}

/// Collection operations on the media server
#[async_trait]
pub trait PlexCollectionApi: Send + Sync {
    async fn create_collection(&self, input: &CreateRemoteCollection) -> Result<PlexCollection>;

    /// Push title and summary of an existing collection
    async fn update_collection(
        &self,
        remote_id: &str,
        input: &CreateRemoteCollection,
    ) -> Result<RemoteStatus>;

    async fn delete_collection(&self, remote_id: &str) -> Result<RemoteStatus>;

    async fn add_child(&self, remote_id: &str, item_key: &str) -> Result<AddChildResponse>;

    async fn remove_child(&self, remote_id: &str, item_key: &str) -> Result<RemoteStatus>;

    /// Current remote membership
    async fn collection_children(&self, remote_id: &str) -> Result<Vec<PlexLibraryItem>>;

    /// Metadata of a single item, `None` if Plex doesn't know it
    async fn item_metadata(&self, item_key: &str) -> Result<Option<PlexLibraryItem>>;
}

/// Connection settings for a Plex server
#[derive(Debug, Clone)]
pub struct PlexConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
}

/// HTTP client for a Plex Media Server
pub struct PlexClient {
    client: RateLimitedClient,
    base_url: Url,
    token: String,
    machine_id: OnceCell<String>,
}

impl PlexClient {
    pub fn new(config: PlexConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid PLEX_URL '{}'", config.base_url))?;

        Ok(Self {
            client: RateLimitedClient::for_plex(config.timeout)?,
            base_url,
            token: config.token,
            machine_id: OnceCell::new(),
        })
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path)
            .map_err(|e| CollectionError::remote("buildUrl", e.to_string()))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn call(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Response> {
        let url = self.url(path, query)?;
        debug!(operation, method = %method, path, "Plex request");

        let request = self
            .client
            .request(method, url.as_str())
            .header("Accept", "application/json")
            .header("X-Plex-Token", &self.token);

        self.client
            .send(request)
            .await
            .map_err(|e| CollectionError::remote(operation, format!("{:#}", e)))
    }

    async fn json(operation: &'static str, response: Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            return Err(CollectionError::remote(
                operation,
                format!("HTTP {}", status.as_u16()),
            ));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| CollectionError::remote(operation, format!("invalid JSON: {}", e)))
    }

    async fn status_call(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<RemoteStatus> {
        let response = self.call(operation, method, path, query).await?;
        let status = RemoteStatus::from_http(response.status());
        if !status.is_ok() {
            warn!(
                operation,
                path,
                http_status = response.status().as_u16(),
                transient = response.is_transient_error(),
                "Plex rejected request"
            );
        }
        Ok(status)
    }

    /// Server machine identifier, fetched once
    async fn machine_id(&self) -> Result<&str> {
        self.machine_id
            .get_or_try_init(|| async move {
                let response = self.call("identity", Method::GET, "/", &[]).await?;
                let body = Self::json("identity", response).await?;
                body.get("MediaContainer")
                    .and_then(|c| c.get("machineIdentifier"))
                    .and_then(|id| id.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| CollectionError::remote("identity", "missing machineIdentifier"))
            })
            .await
            .map(String::as_str)
    }
}

#[async_trait]
impl PlexCollectionApi for PlexClient {
    async fn create_collection(&self, input: &CreateRemoteCollection) -> Result<PlexCollection> {
        let media_type = input.media_type.plex_type().to_string();
        let section = input.library_id.to_string();
        let response = self
            .call(
                "createCollection",
                Method::POST,
                "/library/collections",
                &[
                    ("type", media_type.as_str()),
                    ("title", input.title.as_str()),
                    ("smart", "0"),
                    ("sectionId", section.as_str()),
                ],
            )
            .await?;
        let body = Self::json("createCollection", response).await?;

        let collection = metadata_array(&body)
            .into_iter()
            .next()
            .ok_or_else(|| CollectionError::remote("createCollection", "empty response"))
            .and_then(|value| {
                serde_json::from_value::<PlexCollection>(normalize_keys(&value))
                    .map_err(|e| CollectionError::remote("createCollection", e.to_string()))
            })?;

        // The collection exists from here on; the caller must get its key
        if input.summary.is_some() {
            match self.update_collection(&collection.rating_key, input).await {
                Ok(RemoteStatus::Ok) => {}
                Ok(RemoteStatus::Nok) => warn!(
                    remote_id = %collection.rating_key,
                    "Collection created but summary update was rejected"
                ),
                Err(e) => warn!(
                    remote_id = %collection.rating_key,
                    error = %e,
                    "Collection created but summary update failed"
                ),
            }
        }

        Ok(collection)
    }

    async fn update_collection(
        &self,
        remote_id: &str,
        input: &CreateRemoteCollection,
    ) -> Result<RemoteStatus> {
        let path = format!("/library/sections/{}/all", input.library_id);
        let collection_type = PLEX_COLLECTION_TYPE.to_string();
        let summary = input.summary.clone().unwrap_or_default();
        self.status_call(
            "updateCollection",
            Method::PUT,
            &path,
            &[
                ("type", collection_type.as_str()),
                ("id", remote_id),
                ("title.value", input.title.as_str()),
                ("summary.value", summary.as_str()),
            ],
        )
        .await
    }

    /// A collection Plex no longer knows counts as deleted
    async fn delete_collection(&self, remote_id: &str) -> Result<RemoteStatus> {
        let path = format!("/library/collections/{}", remote_id);
        let response = self
            .call("deleteCollection", Method::DELETE, &path, &[])
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(remote_id, "Plex collection already gone");
            return Ok(RemoteStatus::Ok);
        }
        let status = RemoteStatus::from_http(response.status());
        if !status.is_ok() {
            warn!(
                remote_id,
                http_status = response.status().as_u16(),
                transient = response.is_transient_error(),
                "Plex rejected collection delete"
            );
        }
        Ok(status)
    }

    async fn add_child(&self, remote_id: &str, item_key: &str) -> Result<AddChildResponse> {
        let machine_id = self.machine_id().await?;
        let uri = format!(
            "server://{}/com.plexapp.plugins.library/library/metadata/{}",
            machine_id, item_key
        );
        let path = format!("/library/collections/{}/items", remote_id);
        let response = self
            .call("addChildToCollection", Method::PUT, &path, &[("uri", uri.as_str())])
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Ok(AddChildResponse::Status(BasicResponse {
                status: RemoteStatus::Nok,
                code: i32::from(status.as_u16()),
                message: format!("HTTP {}", status.as_u16()),
            }));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| CollectionError::remote("addChildToCollection", e.to_string()))?;
        Ok(AddChildResponse::from_value(&body))
    }

    async fn remove_child(&self, remote_id: &str, item_key: &str) -> Result<RemoteStatus> {
        let path = format!("/library/collections/{}/children/{}", remote_id, item_key);
        self.status_call("deleteChildFromCollection", Method::DELETE, &path, &[])
            .await
    }

    async fn collection_children(&self, remote_id: &str) -> Result<Vec<PlexLibraryItem>> {
        let path = format!("/library/collections/{}/children", remote_id);
        let response = self
            .call("getCollectionChildren", Method::GET, &path, &[])
            .await?;
        let body = Self::json("getCollectionChildren", response).await?;
        parse_items("getCollectionChildren", &body)
    }

    async fn item_metadata(&self, item_key: &str) -> Result<Option<PlexLibraryItem>> {
        let path = format!("/library/metadata/{}", item_key);
        let response = self
            .call("getMetadata", Method::GET, &path, &[("includeGuids", "1")])
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::json("getMetadata", response).await?;
        Ok(parse_items("getMetadata", &body)?.into_iter().next())
    }
}

/// `MediaContainer.Metadata` entries, empty when absent
fn metadata_array(body: &Value) -> Vec<Value> {
    body.get("MediaContainer")
        .and_then(|c| c.get("Metadata"))
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default()
}

fn parse_items(operation: &'static str, body: &Value) -> Result<Vec<PlexLibraryItem>> {
    metadata_array(body)
        .iter()
        .map(|value| {
            serde_json::from_value::<PlexLibraryItem>(normalize_keys(value))
                .map_err(|e| CollectionError::remote(operation, e.to_string()))
        })
        .collect()
}

/// Plex is inconsistent about numeric keys; make rating keys strings
fn normalize_keys(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(object) = value.as_object_mut() {
        for key in ["ratingKey", "parentRatingKey", "grandparentRatingKey"] {
            if let Some(Value::Number(n)) = object.get(key) {
                let as_string = Value::String(n.to_string());
                object.insert(key.to_string(), as_string);
            }
        }
    }
    value
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Local HTTP server answering one request per connection, in order.
    /// `None` drops the connection without answering.
    async fn scripted_server(answers: Vec<Option<(u16, String)>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for answer in answers {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }

                if let Some((status, body)) = answer {
                    let response = format!(
                        "HTTP/1.1 {} OK\r\nContent-Type: application/json\r\n\
                         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    socket.write_all(response.as_bytes()).await.unwrap();
                    socket.shutdown().await.ok();
                }
            }
        });

        format!("http://{}", addr)
    }

    fn client_for(base_url: String) -> PlexClient {
        PlexClient::new(PlexConfig {
            base_url,
            token: "secret".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_survives_failed_summary_update() {
        let created = json!({
            "MediaContainer": { "Metadata": [{ "ratingKey": "5001", "title": "Kids" }] }
        });
        let base_url = scripted_server(vec![Some((200, created.to_string())), None]).await;
        let client = client_for(base_url);

        let collection = client
            .create_collection(&CreateRemoteCollection {
                library_id: 1,
                title: "Kids".to_string(),
                summary: Some("Family night".to_string()),
                media_type: MediaType::Movie,
            })
            .await
            .unwrap();

        assert_eq!(collection.rating_key, "5001");
    }

    #[tokio::test]
    async fn test_delete_of_missing_collection_is_ok() {
        let base_url = scripted_server(vec![
            Some((404, "{}".to_string())),
            Some((500, "{}".to_string())),
        ])
        .await;
        let client = client_for(base_url);

        assert_eq!(client.delete_collection("5001").await.unwrap(), RemoteStatus::Ok);
        assert_eq!(client.delete_collection("5001").await.unwrap(), RemoteStatus::Nok);
    }

    #[test]
    fn test_add_child_collection_shape() {
        let body = json!({
            "MediaContainer": {
                "size": 1,
                "Metadata": [{
                    "ratingKey": "5001",
                    "title": "Kids",
                    "subtype": "movie",
                    "librarySectionID": 1
                }]
            }
        });

        let response = AddChildResponse::from_value(&body);
        assert!(response.is_success());
        assert_matches!(
            response,
            AddChildResponse::Collection(ref c) if c.rating_key == "5001"
                && c.library_section_id == Some(1)
        );
        assert_eq!(response.failure_reason(), None);
    }

    #[test]
    fn test_add_child_numeric_rating_key() {
        let body = json!({ "ratingKey": 5001, "title": "Kids" });
        assert_matches!(
            AddChildResponse::from_value(&body),
            AddChildResponse::Collection(ref c) if c.rating_key == "5001"
        );
    }

    #[test]
    fn test_add_child_status_shape() {
        let body = json!({ "status": "NOK", "code": 0, "message": "Item not found" });

        let response = AddChildResponse::from_value(&body);
        assert!(!response.is_success());
        assert_matches!(response, AddChildResponse::Status(ref s) if s.status == RemoteStatus::Nok);
        assert_eq!(
            response.failure_reason().as_deref(),
            Some("status NOK (0): Item not found")
        );
    }

    #[test]
    fn test_add_child_ok_status_counts_as_success() {
        let body = serde_json::to_value(BasicResponse::ok("Success")).unwrap();
        assert!(AddChildResponse::from_value(&body).is_success());
    }

    #[test]
    fn test_add_child_unrecognized_shape() {
        let body = json!({ "MediaContainer": { "size": 0 } });
        let response = AddChildResponse::from_value(&body);
        assert_matches!(response, AddChildResponse::Unrecognized(_));
        assert!(!response.is_success());
    }

    #[test]
    fn test_parse_items_with_guids() {
        let body = json!({
            "MediaContainer": {
                "Metadata": [{
                    "ratingKey": "42",
                    "title": "The Matrix",
                    "type": "movie",
                    "guid": "plex://movie/5d776825880197001ec967c6",
                    "Guid": [
                        { "id": "imdb://tt0133093" },
                        { "id": "tmdb://603" }
                    ],
                    "addedAt": 1700000000
                }]
            }
        });

        let items = parse_items("test", &body).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].rating_key, "42");
        assert_eq!(items[0].item_type, "movie");
        assert_eq!(items[0].guids.len(), 2);
        assert_eq!(items[0].added_at, Some(1700000000));
    }

    #[test]
    fn test_parse_items_empty_container() {
        let body = json!({ "MediaContainer": { "size": 0 } });
        assert!(parse_items("test", &body).unwrap().is_empty());
    }

    #[test]
    fn test_url_building_encodes_query() {
        let client = PlexClient::new(PlexConfig {
            base_url: "http://plex.local:32400".to_string(),
            token: "secret".to_string(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();

        let url = client
            .url("/library/collections", &[("title", "Kids & Family")])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://plex.local:32400/library/collections?title=Kids+%26+Family"
        );
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        let result = PlexClient::new(PlexConfig {
            base_url: "not a url".to_string(),
            token: String::new(),
            timeout: Duration::from_secs(5),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_truncate_long_body() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }
}
