//! Client for a job store served over HTTP.
//!
//! Transport failures, 429 and 5xx responses are treated as transient and
//! retried with bounded exponential backoff; 404 and 409 map onto the
//! store's logical errors.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument};

use crate::error::{SchedError, SchedResult};
use crate::persistence::JobStore;
use crate::persistence::rest_server::{DeleteResponse, ErrorResponse};
use crate::persistence::retry::{RetryPolicy, retry_transient};
use crate::record::{CalculationRecord, RecordFilter};

/// User agent sent with every request.
const USER_AGENT: &str = concat!("atomrun-sched/", env!("CARGO_PKG_VERSION"));

/// HTTP job store client.
#[derive(Clone)]
pub struct RestStore {
    /// HTTP client.
    client: Client,
    /// Service base URL, without trailing slash.
    base_url: String,
    /// Bearer token, if the service requires one.
    api_key: Option<String>,
    /// Retry budget for transient failures.
    retry: RetryPolicy,
}

impl std::fmt::Debug for RestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestStore")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("retry", &self.retry)
            .finish()
    }
}

impl RestStore {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>) -> SchedResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SchedError::Http(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            retry: RetryPolicy::default(),
        })
    }

    /// Authenticate with a bearer token.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Service base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.base_url, path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Check that the service is reachable.
    pub async fn health(&self) -> SchedResult<()> {
        let response = self
            .authorize(self.client.get(self.url("/health")))
            .send()
            .await?;
        handle_response(response).await.map(|_| ())
    }

    async fn add_record_once(&self, record: &CalculationRecord) -> SchedResult<()> {
        let url = self.url(&format!("/records/{}", record.style));
        debug!("Adding record at {}", url);

        let response = self
            .authorize(self.client.post(&url))
            .json(record)
            .send()
            .await?;
        if response.status() == StatusCode::CONFLICT {
            return Err(SchedError::duplicate(&record.style, &record.name));
        }
        handle_response(response).await.map(|_| ())
    }

    async fn get_record_once(
        &self,
        style: &str,
        name: &str,
    ) -> SchedResult<Option<CalculationRecord>> {
        let url = self.url(&format!("/records/{style}/{name}"));
        debug!("Getting record from {}", url);

        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = handle_response(response).await?;
        Ok(Some(response.json().await?))
    }

    async fn update_record_once(&self, record: &CalculationRecord) -> SchedResult<()> {
        let url = self.url(&format!("/records/{}/{}", record.style, record.name));
        debug!("Updating record at {}", url);

        let response = self
            .authorize(self.client.put(&url))
            .json(record)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SchedError::not_found(&record.style, &record.name));
        }
        handle_response(response).await.map(|_| ())
    }

    async fn query_once(
        &self,
        style: &str,
        filter: &RecordFilter,
    ) -> SchedResult<Vec<CalculationRecord>> {
        let url = self.url(&format!("/records/{style}/query"));
        debug!("Querying records at {}", url);

        let response = self
            .authorize(self.client.post(&url))
            .json(filter)
            .send()
            .await?;
        let response = handle_response(response).await?;
        Ok(response.json().await?)
    }

    async fn delete_once(&self, path: &str) -> SchedResult<bool> {
        let url = self.url(path);
        debug!("Deleting {}", url);

        let response = self.authorize(self.client.delete(&url)).send().await?;
        let response = handle_response(response).await?;
        let body: DeleteResponse = response.json().await?;
        Ok(body.deleted)
    }

    async fn add_blob_once(&self, style: &str, name: &str, data: &[u8]) -> SchedResult<()> {
        let url = self.url(&format!("/blobs/{style}/{name}"));
        debug!("Uploading {} byte archive to {}", data.len(), url);

        let response = self
            .authorize(self.client.put(&url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await?;
        handle_response(response).await.map(|_| ())
    }

    async fn get_blob_once(&self, style: &str, name: &str) -> SchedResult<Option<Vec<u8>>> {
        let url = self.url(&format!("/blobs/{style}/{name}"));
        debug!("Downloading archive from {}", url);

        let response = self.authorize(self.client.get(&url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = handle_response(response).await?;
        Ok(Some(response.bytes().await?.to_vec()))
    }
}

/// Pass successful responses through and classify failures.
async fn handle_response(response: Response) -> SchedResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|e| e.error)
        .unwrap_or(text);

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(SchedError::StoreTransient(format!("{status}: {message}")))
    } else {
        Err(SchedError::Http(format!("{status}: {message}")))
    }
}

#[async_trait]
impl JobStore for RestStore {
    #[instrument(skip(self, record), fields(name = %record.name))]
    async fn add_record(&self, record: &CalculationRecord) -> SchedResult<()> {
        retry_transient(&self.retry, "add_record", move || self.add_record_once(record)).await
    }

    async fn get_record(
        &self,
        style: &str,
        name: &str,
    ) -> SchedResult<Option<CalculationRecord>> {
        retry_transient(&self.retry, "get_record", move || {
            self.get_record_once(style, name)
        })
        .await
    }

    #[instrument(skip(self, record), fields(name = %record.name))]
    async fn update_record(&self, record: &CalculationRecord) -> SchedResult<()> {
        retry_transient(&self.retry, "update_record", move || {
            self.update_record_once(record)
        })
        .await
    }

    async fn get_records(
        &self,
        style: &str,
        filter: &RecordFilter,
    ) -> SchedResult<Vec<CalculationRecord>> {
        retry_transient(&self.retry, "get_records", move || {
            self.query_once(style, filter)
        })
        .await
    }

    async fn delete_record(&self, style: &str, name: &str) -> SchedResult<bool> {
        let path = format!("/records/{style}/{name}");
        let path = path.as_str();
        retry_transient(&self.retry, "delete_record", move || self.delete_once(path)).await
    }

    async fn add_blob(&self, style: &str, name: &str, data: &[u8]) -> SchedResult<()> {
        retry_transient(&self.retry, "add_blob", move || {
            self.add_blob_once(style, name, data)
        })
        .await
    }

    async fn get_blob(&self, style: &str, name: &str) -> SchedResult<Option<Vec<u8>>> {
        retry_transient(&self.retry, "get_blob", move || self.get_blob_once(style, name)).await
    }

    async fn delete_blob(&self, style: &str, name: &str) -> SchedResult<bool> {
        let path = format!("/blobs/{style}/{name}");
        let path = path.as_str();
        retry_transient(&self.retry, "delete_blob", move || self.delete_once(path)).await
    }
}
