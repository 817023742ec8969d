//! Confluence REST content API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, RETRY_AFTER, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::{AncestorRef, PageSummary, RemotePage, RemoteStore};
use crate::config::RemoteConfig;
use crate::errors::RemoteError;

const PAGE_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct ContentResponse {
    id: String,
    title: String,
    version: VersionField,
    #[serde(default)]
    ancestors: Vec<AncestorField>,
    body: Option<BodyField>,
}

#[derive(Debug, Deserialize)]
struct VersionField {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct AncestorField {
    id: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct BodyField {
    storage: StorageField,
}

#[derive(Debug, Deserialize)]
struct StorageField {
    value: String,
}

#[derive(Debug, Deserialize)]
struct ChildListResponse {
    results: Vec<ContentResponse>,
    #[serde(default)]
    size: usize,
}

impl ContentResponse {
    fn into_page(self) -> RemotePage {
        let ancestors: Vec<AncestorRef> = self
            .ancestors
            .into_iter()
            .map(|a| AncestorRef {
                id: a.id,
                title: a.title,
            })
            .collect();
        RemotePage {
            page_id: self.id,
            title: self.title,
            body: self.body.map(|b| b.storage.value).unwrap_or_default(),
            version: self.version.number,
            parent_id: ancestors.last().map(|a| a.id.clone()),
            ancestors,
        }
    }
}

/// Asynchronous client for one wiki space.
#[derive(Clone)]
pub struct ConfluenceClient {
    http: reqwest::Client,
    base_url: String,
    space_key: String,
    username: String,
    token: String,
}

impl ConfluenceClient {
    pub fn new(
        base_url: impl Into<String>,
        space_key: impl Into<String>,
        username: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("wikisync/0.1"));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unreachable(format!("failed to build HTTP client: {}", e)))?;
        info!(base_url = %base_url, "created ConfluenceClient");
        Ok(Self {
            http,
            base_url,
            space_key: space_key.into(),
            username: username.into(),
            token: token.into(),
        })
    }

    /// Build a client from a resolved `[remote]` section.
    pub fn from_config(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let token = config
            .token
            .clone()
            .ok_or_else(|| RemoteError::Unauthorized("no API token configured".into()))?;
        Self::new(
            &config.base_url,
            &config.space_key,
            &config.username,
            token,
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn content_url(&self, page_id: &str) -> String {
        format!("{}/rest/api/content/{}", self.base_url, page_id)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .basic_auth(&self.username, Some(&self.token))
    }

    async fn send(
        &self,
        req: reqwest::RequestBuilder,
        page_id: &str,
    ) -> Result<reqwest::Response, RemoteError> {
        let resp = req.send().await.map_err(transport_error)?;
        check_response(resp, page_id).await
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Parse(err.to_string())
    } else {
        RemoteError::Unreachable(err.to_string())
    }
}

/// Map a non-success status onto the remote error taxonomy.
async fn check_response(
    resp: reqwest::Response,
    page_id: &str,
) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::NOT_FOUND => Err(RemoteError::NotFound {
            page_id: page_id.to_string(),
        }),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(RemoteError::Unauthorized(format!("HTTP {}", status)))
        }
        StatusCode::CONFLICT => Err(RemoteError::VersionConflict {
            page_id: page_id.to_string(),
            expected: 0,
            actual: None,
        }),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            Err(RemoteError::RateLimited { retry_after })
        }
        _ => {
            let body = resp.text().await.unwrap_or_default();
            Err(RemoteError::Api {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            })
        }
    }
}

#[async_trait]
impl RemoteStore for ConfluenceClient {
    #[instrument(skip(self))]
    async fn fetch(&self, page_id: &str) -> Result<RemotePage, RemoteError> {
        let req = self
            .request(reqwest::Method::GET, &self.content_url(page_id))
            .query(&[("expand", "body.storage,version,ancestors")]);
        let resp = self.send(req, page_id).await?;
        let content: ContentResponse = resp.json().await.map_err(transport_error)?;
        let page = content.into_page();
        debug!(version = page.version, "fetched page");
        Ok(page)
    }

    #[instrument(skip(self))]
    async fn list_children(&self, page_id: &str) -> Result<Vec<PageSummary>, RemoteError> {
        let url = format!("{}/child/page", self.content_url(page_id));
        let mut out = Vec::new();
        let mut start = 0usize;
        loop {
            let req = self.request(reqwest::Method::GET, &url).query(&[
                ("expand", "version,ancestors".to_string()),
                ("start", start.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ]);
            let resp = self.send(req, page_id).await?;
            let list: ChildListResponse = resp.json().await.map_err(transport_error)?;
            let received = list.size.max(list.results.len());
            out.extend(list.results.into_iter().map(|c| c.into_page().summary()));
            if received < PAGE_LIMIT {
                break;
            }
            start += received;
        }
        debug!(count = out.len(), "listed children");
        Ok(out)
    }

    #[instrument(skip(self, body))]
    async fn create(
        &self,
        parent_id: &str,
        title: &str,
        body: &str,
    ) -> Result<RemotePage, RemoteError> {
        let payload = serde_json::json!({
            "type": "page",
            "title": title,
            "space": { "key": self.space_key },
            "ancestors": [{ "id": parent_id }],
            "body": { "storage": { "value": body, "representation": "storage" } }
        });
        let req = self
            .request(reqwest::Method::POST, &format!("{}/rest/api/content", self.base_url))
            .json(&payload);
        let resp = self.send(req, parent_id).await?;
        let content: ContentResponse = resp.json().await.map_err(transport_error)?;
        let page = content.into_page();
        info!(page_id = %page.page_id, "created remote page");
        Ok(page)
    }

    #[instrument(skip(self, body))]
    async fn update(
        &self,
        page_id: &str,
        title: &str,
        body: &str,
        base_version: u64,
    ) -> Result<u64, RemoteError> {
        let new_version = base_version + 1;
        let payload = serde_json::json!({
            "id": page_id,
            "type": "page",
            "title": title,
            "version": { "number": new_version },
            "body": { "storage": { "value": body, "representation": "storage" } }
        });
        let req = self
            .request(reqwest::Method::PUT, &self.content_url(page_id))
            .json(&payload);
        match self.send(req, page_id).await {
            Ok(resp) => {
                let content: ContentResponse = resp.json().await.map_err(transport_error)?;
                info!(version = content.version.number, "updated remote page");
                Ok(content.version.number)
            }
            Err(RemoteError::VersionConflict { .. }) => Err(RemoteError::VersionConflict {
                page_id: page_id.to_string(),
                expected: base_version,
                actual: None,
            }),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn move_page(&self, page_id: &str, new_parent_id: &str) -> Result<(), RemoteError> {
        let url = format!("{}/move/append/{}", self.content_url(page_id), new_parent_id);
        self.send(self.request(reqwest::Method::PUT, &url), page_id)
            .await?;
        info!("moved remote page");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn trash(&self, page_id: &str) -> Result<(), RemoteError> {
        // A plain DELETE on a current page moves it to the space trash.
        self.send(
            self.request(reqwest::Method::DELETE, &self.content_url(page_id)),
            page_id,
        )
        .await?;
        info!("moved remote page to trash");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_response_maps_to_page() {
        let raw = r#"{
            "id": "123",
            "title": "Runbook",
            "version": { "number": 7 },
            "ancestors": [ { "id": "1", "title": "Home" }, { "id": "42", "title": "Ops" } ],
            "body": { "storage": { "value": "<p>hi</p>", "representation": "storage" } }
        }"#;
        let content: ContentResponse = serde_json::from_str(raw).unwrap();
        let page = content.into_page();
        assert_eq!(page.page_id, "123");
        assert_eq!(page.version, 7);
        assert_eq!(page.parent_id.as_deref(), Some("42"));
        assert_eq!(page.ancestors.len(), 2);
        assert_eq!(page.body, "<p>hi</p>");
    }

    #[test]
    fn test_child_listing_without_body() {
        let raw = r#"{ "results": [ { "id": "5", "title": "A", "version": { "number": 2 } } ], "size": 1 }"#;
        let list: ChildListResponse = serde_json::from_str(raw).unwrap();
        let summary = list.results.into_iter().next().unwrap().into_page().summary();
        assert_eq!(summary.page_id, "5");
        assert_eq!(summary.version, 2);
        assert!(summary.parent_id.is_none());
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = ConfluenceClient::new(
            "https://wiki.example.com/",
            "DOCS",
            "bot",
            "secret",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.content_url("9"),
            "https://wiki.example.com/rest/api/content/9"
        );
    }
}
