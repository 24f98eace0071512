//! The resource-client contract consumed by the coordinator.
//!
//! Two implementations exist — [`remote::RemoteClient`] (HTTP, against the
//! real queue service) and [`local::LocalClient`] (an on-disk emulator) —
//! both honoring the same [`ResourceClient`] trait so the coordinator never
//! needs to know which one it's talking to.

pub mod local;
pub mod remote;

use crate::error::Result;
use crate::model::Request;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Info about a request-queue, as returned by `get`/`update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub total_request_count: u64,
    pub handled_request_count: u64,
}

/// One item in a `listHead`/`listAndLockHead` page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeadItem {
    pub id: String,
    pub unique_key: String,
}

/// Result of `listHead`.
#[derive(Debug, Clone)]
pub struct ListHeadResult {
    pub items: Vec<HeadItem>,
    pub queue_modified_at: DateTime<Utc>,
    pub had_multiple_clients: bool,
}

/// Result of a single add/update-request call.
#[derive(Debug, Clone)]
pub struct RequestQueueOperationInfo {
    pub request_id: String,
    pub unique_key: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// A page from `listRequests`.
#[derive(Debug, Clone)]
pub struct RequestsPage {
    pub items: Vec<Request>,
    pub exclusive_start_id: Option<String>,
}

/// The operations the coordinator depends on. All calls pass `client_key`
/// where the remote API accepts it; that's threaded through by the caller
/// rather than baked into the trait, since the local emulator ignores it.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(&self) -> Result<Option<QueueInfo>>;
    async fn update(&self, name: Option<&str>) -> Result<QueueInfo>;
    async fn delete(&self) -> Result<()>;

    async fn list_head(&self, client_key: &str, limit: u32) -> Result<ListHeadResult>;
    async fn list_and_lock_head(
        &self,
        client_key: &str,
        lock_secs: u32,
        limit: u32,
    ) -> Result<ListHeadResult>;

    async fn add_request(
        &self,
        client_key: &str,
        request: &Request,
        forefront: bool,
    ) -> Result<RequestQueueOperationInfo>;
    async fn get_request(&self, id: &str) -> Result<Option<Request>>;
    async fn update_request(
        &self,
        client_key: &str,
        request: &Request,
        forefront: bool,
    ) -> Result<RequestQueueOperationInfo>;
    async fn delete_request(&self, id: &str) -> Result<()>;

    async fn prolong_request_lock(
        &self,
        client_key: &str,
        id: &str,
        lock_secs: u32,
        forefront: bool,
    ) -> Result<()>;
    async fn delete_request_lock(&self, client_key: &str, id: &str, forefront: bool) -> Result<()>;

    async fn batch_add_requests(
        &self,
        client_key: &str,
        requests: &[Request],
        forefront: bool,
    ) -> Result<Vec<RequestQueueOperationInfo>>;
    async fn batch_delete_requests(&self, ids: &[String]) -> Result<()>;

    async fn list_requests(
        &self,
        limit: u32,
        exclusive_start_id: Option<&str>,
    ) -> Result<RequestsPage>;
}
