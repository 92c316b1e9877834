use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, ClientBuilder, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;

/// Failure taxonomy for remote calls. Transient covers network failures,
/// 429 and 5xx; Permanent covers 4xx rejections and remote-side
/// processing failures.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("remote rejected request ({status}): {detail}")]
    Permanent { status: u16, detail: String },
}

impl RemoteError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, RemoteError::Permanent { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Permanent { status: 404, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Pending,
    Completed,
    Failed,
    Unknown,
}

/// One entry of the remote collection listing. Duplicate display names
/// are possible and handled by the reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub display_name: String,
    pub object_id: String,
}

/// Capability the sync core consumes from the remote content store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Uploads file content under `display_name`, returning the new
    /// object id.
    async fn upload(&self, display_name: &str, path: &Path) -> Result<String, RemoteError>;
    async fn status(&self, object_id: &str) -> Result<ProcessingState, RemoteError>;
    async fn link(&self, object_id: &str) -> Result<(), RemoteError>;
    async fn unlink(&self, object_id: &str) -> Result<(), RemoteError>;
    async fn delete(&self, object_id: &str) -> Result<(), RemoteError>;
    async fn list(&self) -> Result<Vec<RemoteEntry>, RemoteError>;
}

/// Unlink the object from the collection and delete it from the store.
/// "Not found" counts as success on both steps: a concurrent
/// reconciliation pass or delete event may have removed the object first.
pub async fn remove_object(store: &dyn RemoteStore, object_id: &str) -> Result<(), RemoteError> {
    match store.unlink(object_id).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return Err(err),
    }
    match store.delete(object_id).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err),
    }
}

const LIST_PAGE_CAP: u32 = 1000;

/// HTTP client for the knowledge-collection API.
#[derive(Clone)]
pub struct ApiClient {
    base: String,
    collection_id: String,
    http: HttpClient,
}

impl ApiClient {
    pub fn new(base: &str, api_key: &str, collection_id: &str) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let value = format!("Bearer {api_key}");
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&value)?,
        );
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(10 * 60))
            .connect_timeout(Duration::from_secs(5))
            .user_agent("kbsync/0.1")
            .default_headers(headers)
            .build()?;
        Ok(ApiClient {
            base: base.trim_end_matches('/').to_string(),
            collection_id: collection_id.to_string(),
            http,
        })
    }

    async fn expect_ok(&self, resp: Response) -> Result<Response, RemoteError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, detail_from_body(&body, status.as_u16())))
    }
}

#[async_trait]
impl RemoteStore for ApiClient {
    async fn upload(&self, display_name: &str, path: &Path) -> Result<String, RemoteError> {
        let url = format!("{}/api/v1/files/", self.base);
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| RemoteError::Transient(format!("read {}: {err}", path.display())))?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(display_name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let resp = self
            .http
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(transient)?;
        let resp = self.expect_ok(resp).await?;
        let payload: Value = resp.json().await.map_err(transient)?;
        match payload.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(RemoteError::Transient(format!(
                "no object id in upload response for {display_name}"
            ))),
        }
    }

    async fn status(&self, object_id: &str) -> Result<ProcessingState, RemoteError> {
        let url = format!("{}/api/v1/files/{object_id}/process/status", self.base);
        let resp = self.http.get(url).send().await.map_err(transient)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(ProcessingState::Unknown);
        }
        let resp = self.expect_ok(resp).await?;
        let payload: Value = resp.json().await.map_err(transient)?;
        let raw = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(parse_processing_state(raw))
    }

    async fn link(&self, object_id: &str) -> Result<(), RemoteError> {
        let url = format!(
            "{}/api/v1/knowledge/{}/file/add",
            self.base, self.collection_id
        );
        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({ "file_id": object_id }))
            .send()
            .await
            .map_err(transient)?;
        self.expect_ok(resp).await.map(|_| ())
    }

    async fn unlink(&self, object_id: &str) -> Result<(), RemoteError> {
        let url = format!(
            "{}/api/v1/knowledge/{}/file/remove",
            self.base, self.collection_id
        );
        let resp = self
            .http
            .post(url)
            .json(&serde_json::json!({ "file_id": object_id }))
            .send()
            .await
            .map_err(transient)?;
        self.expect_ok(resp).await.map(|_| ())
    }

    async fn delete(&self, object_id: &str) -> Result<(), RemoteError> {
        let url = format!("{}/api/v1/files/{object_id}", self.base);
        let resp = self.http.delete(url).send().await.map_err(transient)?;
        self.expect_ok(resp).await.map(|_| ())
    }

    async fn list(&self) -> Result<Vec<RemoteEntry>, RemoteError> {
        let url = format!(
            "{}/api/v1/knowledge/{}/files",
            self.base, self.collection_id
        );
        let mut out = Vec::new();
        let mut page: u32 = 1;
        let mut total: Option<u64> = None;
        let mut last_signature: Option<(usize, Option<String>, Option<String>)> = None;

        loop {
            let resp = self
                .http
                .get(&url)
                .query(&[("page", page)])
                .send()
                .await
                .map_err(transient)?;
            let resp = self.expect_ok(resp).await?;
            let payload: Value = resp.json().await.map_err(transient)?;
            let (entries, page_total) = parse_list_page(&payload);
            if total.is_none() {
                total = page_total;
            }
            if entries.is_empty() {
                break;
            }

            // Servers that ignore the page parameter return the same page
            // forever; stop when a page repeats.
            let signature = (
                entries.len(),
                entries.first().map(|e| e.object_id.clone()),
                entries.last().map(|e| e.object_id.clone()),
            );
            if last_signature.as_ref() == Some(&signature) {
                break;
            }
            last_signature = Some(signature);

            out.extend(entries);
            if let Some(total) = total {
                if out.len() as u64 >= total {
                    break;
                }
            }
            page += 1;
            if page > LIST_PAGE_CAP {
                break;
            }
        }

        Ok(out)
    }
}

fn transient(err: reqwest::Error) -> RemoteError {
    RemoteError::Transient(err.to_string())
}

fn classify(status: StatusCode, detail: String) -> RemoteError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        RemoteError::Transient(format!("HTTP {status}: {detail}"))
    } else {
        RemoteError::Permanent {
            status: status.as_u16(),
            detail,
        }
    }
}

fn parse_processing_state(raw: &str) -> ProcessingState {
    match raw {
        "completed" | "done" => ProcessingState::Completed,
        "failed" | "error" => ProcessingState::Failed,
        "pending" | "processing" => ProcessingState::Pending,
        _ => ProcessingState::Unknown,
    }
}

/// Accepts either a bare array of entries or an object wrapping them
/// under `items`/`files`/`data`, with an optional `total`.
fn parse_list_page(payload: &Value) -> (Vec<RemoteEntry>, Option<u64>) {
    let (items, total) = match payload {
        Value::Array(items) => (items.as_slice(), None),
        Value::Object(map) => {
            let items = ["items", "files", "data"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_array))
                .map(|v| v.as_slice())
                .unwrap_or(&[]);
            (items, map.get("total").and_then(Value::as_u64))
        }
        _ => (&[][..], None),
    };

    let entries = items.iter().filter_map(parse_entry).collect();
    (entries, total)
}

fn parse_entry(item: &Value) -> Option<RemoteEntry> {
    let object_id = item.get("id").and_then(Value::as_str)?;
    let display_name = item
        .get("meta")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .or_else(|| item.get("filename").and_then(Value::as_str))?;
    if object_id.is_empty() || display_name.is_empty() {
        return None;
    }
    Some(RemoteEntry {
        display_name: display_name.to_string(),
        object_id: object_id.to_string(),
    })
}

/// Pulls a human-readable detail out of an error body: a JSON
/// `detail`/`message`/`error` field if present, otherwise the (truncated)
/// body text.
fn detail_from_body(body: &str, status: u16) -> String {
    if let Ok(payload) = serde_json::from_str::<Value>(body) {
        for key in ["detail", "message", "error"] {
            if let Some(detail) = payload.get(key).and_then(Value::as_str) {
                if !detail.is_empty() {
                    return detail.to_string();
                }
            }
        }
    }
    let text = body.trim().replace('\n', " ");
    if text.is_empty() {
        return format!("HTTP {status}");
    }
    if text.len() > 400 {
        let cut: String = text.chars().take(397).collect();
        return format!("{cut}...");
    }
    text
}
