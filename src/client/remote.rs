//! HTTP implementation of [`ResourceClient`] against the remote queue
//! service.
//!
//! Follows the shape of the teacher's `JiraClient`: a base URL plus a
//! per-call auth header, text-first response reading so error bodies can be
//! logged before any JSON decode is attempted, and `tracing` events at
//! `debug`/`warn`/`error` around each call. Retryable transport and API
//! errors (network/timeout, invalid body, 5xx, rate limit) are retried here
//! with exponential backoff before the coordinator ever sees them.

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::Request;

use super::{
    HeadItem, ListHeadResult, QueueInfo, RequestQueueOperationInfo, RequestsPage, ResourceClient,
};

const MAX_ATTEMPTS: u32 = 8;
const BASE_BACKOFF_MS: u64 = 500;

pub struct RemoteClient {
    base_url: String,
    token: String,
    queue_id: String,
    http: Client,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, queue_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            queue_id: queue_id.into(),
            http: Client::new(),
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/v2/request-queues/{}{}", self.base_url, self.queue_id, suffix)
    }

    /// Run `op` with exponential backoff (base 500ms, factor 2, jitter
    /// 0-100%, up to 8 attempts), retrying only retryable-transport and
    /// retryable-API errors. A `Client` or benign-not-found error returns
    /// immediately.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(BASE_BACKOFF_MS))
            .with_multiplier(2.0)
            .with_randomization_factor(1.0)
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(v) => return Ok(v),
                Err(e) if is_retryable(&e) && attempt < MAX_ATTEMPTS => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_millis(BASE_BACKOFF_MS));
                    tracing::warn!(attempt, error = %e, "retrying after {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        builder: reqwest::RequestBuilder,
        attempt: u32,
    ) -> Result<T> {
        let response = builder.bearer_auth(&self.token).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Network(format!("timeout: {e}"))
            } else {
                Error::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::InvalidResponseBody(e.to_string()))?;

        if !status.is_success() {
            let kind = error_kind(status, &body);
            tracing::debug!(%status, %kind, "remote queue API returned an error");
            return Err(Error::Api {
                status: status.as_u16(),
                kind,
                message: body,
                attempt,
            });
        }

        serde_json::from_str(&body).map_err(|e| Error::InvalidResponseBody(e.to_string()))
    }
}

fn error_kind(status: StatusCode, body: &str) -> String {
    if status == StatusCode::NOT_FOUND {
        #[derive(Deserialize)]
        struct ErrBody {
            #[serde(rename = "type")]
            kind: Option<String>,
        }
        if let Ok(parsed) = serde_json::from_str::<ErrBody>(body) {
            if let Some(kind) = parsed.kind {
                return kind;
            }
        }
        return "record-not-found".to_string();
    }
    status.to_string()
}

fn is_retryable(e: &Error) -> bool {
    matches!(
        e,
        Error::Network(_)
            | Error::InvalidResponseBody(_)
            | Error::Api { status: 429, .. }
            | Error::Api { status: 500..=599, .. }
    )
}

#[derive(Deserialize)]
struct RawHeadItem {
    id: String,
    #[serde(rename = "uniqueKey")]
    unique_key: String,
}

#[derive(Deserialize)]
struct RawListHeadResponse {
    items: Vec<RawHeadItem>,
    #[serde(rename = "queueModifiedAt")]
    queue_modified_at: DateTime<Utc>,
    #[serde(rename = "hadMultipleClients", default)]
    had_multiple_clients: bool,
}

#[derive(Deserialize)]
struct RawOperationInfo {
    #[serde(rename = "requestId")]
    request_id: String,
    #[serde(rename = "uniqueKey")]
    unique_key: String,
    #[serde(rename = "wasAlreadyPresent", default)]
    was_already_present: bool,
    #[serde(rename = "wasAlreadyHandled", default)]
    was_already_handled: bool,
}

impl From<RawOperationInfo> for RequestQueueOperationInfo {
    fn from(raw: RawOperationInfo) -> Self {
        Self {
            request_id: raw.request_id,
            unique_key: raw.unique_key,
            was_already_present: raw.was_already_present,
            was_already_handled: raw.was_already_handled,
        }
    }
}

#[async_trait]
impl ResourceClient for RemoteClient {
    async fn get(&self) -> Result<Option<QueueInfo>> {
        crate::error::or_not_found(
            self.with_retry(|attempt| async move {
                self.send_json(self.http.get(self.url("")), attempt).await
            })
            .await,
        )
    }

    async fn update(&self, name: Option<&str>) -> Result<QueueInfo> {
        let body = serde_json::json!({ "name": name });
        self.with_retry(|attempt| {
            let body = body.clone();
            async move { self.send_json(self.http.put(self.url("")).json(&body), attempt).await }
        })
        .await
    }

    async fn delete(&self) -> Result<()> {
        match self
            .with_retry(|attempt| async move {
                self.send_json::<serde_json::Value>(self.http.delete(self.url("")), attempt)
                    .await
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_head(&self, client_key: &str, limit: u32) -> Result<ListHeadResult> {
        self.with_retry(|attempt| async move {
            let raw: RawListHeadResponse = self
                .send_json(
                    self.http
                        .get(self.url("/head"))
                        .query(&[("limit", limit.to_string()), ("clientKey", client_key.to_string())]),
                    attempt,
                )
                .await?;
            Ok(ListHeadResult {
                items: raw
                    .items
                    .into_iter()
                    .map(|i| HeadItem { id: i.id, unique_key: i.unique_key })
                    .collect(),
                queue_modified_at: raw.queue_modified_at,
                had_multiple_clients: raw.had_multiple_clients,
            })
        })
        .await
    }

    async fn list_and_lock_head(
        &self,
        client_key: &str,
        lock_secs: u32,
        limit: u32,
    ) -> Result<ListHeadResult> {
        self.with_retry(|attempt| async move {
            let raw: RawListHeadResponse = self
                .send_json(
                    self.http.post(self.url("/head/lock")).query(&[
                        ("limit", limit.to_string()),
                        ("lockSecs", lock_secs.to_string()),
                        ("clientKey", client_key.to_string()),
                    ]),
                    attempt,
                )
                .await?;
            Ok(ListHeadResult {
                items: raw
                    .items
                    .into_iter()
                    .map(|i| HeadItem { id: i.id, unique_key: i.unique_key })
                    .collect(),
                queue_modified_at: raw.queue_modified_at,
                had_multiple_clients: raw.had_multiple_clients,
            })
        })
        .await
    }

    async fn add_request(
        &self,
        client_key: &str,
        request: &Request,
        forefront: bool,
    ) -> Result<RequestQueueOperationInfo> {
        self.with_retry(|attempt| async move {
            let raw: RawOperationInfo = self
                .send_json(
                    self.http
                        .post(self.url("/requests"))
                        .query(&[("clientKey", client_key), ("forefront", if forefront { "true" } else { "false" })])
                        .json(request),
                    attempt,
                )
                .await?;
            Ok(raw.into())
        })
        .await
    }

    async fn get_request(&self, id: &str) -> Result<Option<Request>> {
        crate::error::or_not_found(
            self.with_retry(|attempt| async move {
                self.send_json(self.http.get(self.url(&format!("/requests/{id}"))), attempt)
                    .await
            })
            .await,
        )
    }

    async fn update_request(
        &self,
        client_key: &str,
        request: &Request,
        forefront: bool,
    ) -> Result<RequestQueueOperationInfo> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| Error::client("update_request requires request.id"))?;
        self.with_retry(|attempt| async move {
            let raw: RawOperationInfo = self
                .send_json(
                    self.http
                        .put(self.url(&format!("/requests/{id}")))
                        .query(&[("clientKey", client_key), ("forefront", if forefront { "true" } else { "false" })])
                        .json(request),
                    attempt,
                )
                .await?;
            Ok(raw.into())
        })
        .await
    }

    async fn delete_request(&self, id: &str) -> Result<()> {
        match self
            .with_retry(|attempt| async move {
                self.send_json::<serde_json::Value>(self.http.delete(self.url(&format!("/requests/{id}"))), attempt)
                    .await
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn prolong_request_lock(
        &self,
        client_key: &str,
        id: &str,
        lock_secs: u32,
        forefront: bool,
    ) -> Result<()> {
        self.with_retry(|attempt| async move {
            self.send_json::<serde_json::Value>(
                self.http.post(self.url(&format!("/requests/{id}/lock"))).query(&[
                    ("clientKey", client_key.to_string()),
                    ("lockSecs", lock_secs.to_string()),
                    ("forefront", forefront.to_string()),
                ]),
                attempt,
            )
            .await
        })
        .await?;
        Ok(())
    }

    async fn delete_request_lock(&self, client_key: &str, id: &str, forefront: bool) -> Result<()> {
        self.with_retry(|attempt| async move {
            self.send_json::<serde_json::Value>(
                self.http.delete(self.url(&format!("/requests/{id}/lock"))).query(&[
                    ("clientKey", client_key.to_string()),
                    ("forefront", forefront.to_string()),
                ]),
                attempt,
            )
            .await
        })
        .await?;
        Ok(())
    }

    async fn batch_add_requests(
        &self,
        client_key: &str,
        requests: &[Request],
        forefront: bool,
    ) -> Result<Vec<RequestQueueOperationInfo>> {
        self.with_retry(|attempt| async move {
            let raws: Vec<RawOperationInfo> = self
                .send_json(
                    self.http
                        .post(self.url("/requests/batch"))
                        .query(&[("clientKey", client_key), ("forefront", if forefront { "true" } else { "false" })])
                        .json(requests),
                    attempt,
                )
                .await?;
            Ok(raws.into_iter().map(Into::into).collect())
        })
        .await
    }

    async fn batch_delete_requests(&self, ids: &[String]) -> Result<()> {
        self.with_retry(|attempt| async move {
            self.send_json::<serde_json::Value>(
                self.http.delete(self.url("/requests/batch")).json(ids),
                attempt,
            )
            .await
        })
        .await?;
        Ok(())
    }

    async fn list_requests(&self, limit: u32, exclusive_start_id: Option<&str>) -> Result<RequestsPage> {
        self.with_retry(|attempt| async move {
            let mut req = self.http.get(self.url("/requests")).query(&[("limit", limit.to_string())]);
            if let Some(start) = exclusive_start_id {
                req = req.query(&[("exclusiveStartId", start)]);
            }
            let items: Vec<Request> = self.send_json(req, attempt).await?;
            let exclusive_start_id = items.last().and_then(|r| r.id.clone());
            Ok(RequestsPage { items, exclusive_start_id })
        })
        .await
    }
}
