//! The request-queue coordinator: the public surface application code talks
//! to. Owns all in-memory state for one queue instance — the head window,
//! the in-progress set, the caches, and the assumed counters — and is the
//! only place that decides when to fall back to the resource client.

pub mod head;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::cache::LruCache;
use crate::client::ResourceClient;
use crate::error::{self, Result};
use crate::model::{normalize_url, CachedRequestInfo, QueueOperationResult, Request};
use crate::request_id;
use crate::timers;
use head::{HeadCaches, HeadWindow, InflightQuery};

/// Default bound on the request cache (`§3`: `MAX_CACHED_REQUESTS`).
pub const MAX_CACHED_REQUESTS: usize = 1_000_000;
/// Default bound on the recently-handled LRU (`§3`: `RECENTLY_HANDLED_CACHE_SIZE`).
pub const RECENTLY_HANDLED_CACHE_SIZE: usize = 1000;
/// Default `internalTimeoutSecs`.
pub const DEFAULT_INTERNAL_TIMEOUT_SECS: u64 = 300;

fn random_client_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(17)
        .map(char::from)
        .collect()
}

/// One open queue instance. Cheap to clone — everything interior is an `Arc`
/// — so the storage-open façade can hand out clones from its registry
/// without the caller needing to wrap it themselves.
#[derive(Clone)]
pub struct RequestQueue {
    pub id: String,
    pub name: Option<String>,
    client_key: Arc<String>,
    client: Arc<dyn ResourceClient>,

    last_activity: Arc<SyncMutex<DateTime<Utc>>>,
    internal_timeout_secs: u64,

    assumed_total_count: Arc<AtomicU64>,
    assumed_handled_count: Arc<AtomicU64>,

    in_progress: Arc<SyncMutex<HashSet<String>>>,
    recently_handled: Arc<SyncMutex<LruCache<String, ()>>>,
    request_cache: Arc<SyncMutex<LruCache<String, CachedRequestInfo>>>,
    head_window: Arc<SyncMutex<HeadWindow>>,
    inflight: Arc<InflightQuery>,
}

impl RequestQueue {
    /// Construct a coordinator around an already-resolved resource client.
    /// Does not prime the head window — callers that just created a new
    /// queue should call [`RequestQueue::prime`] once, per `§4.6` step 5.
    pub fn new(id: impl Into<String>, name: Option<String>, client: Arc<dyn ResourceClient>) -> Self {
        Self {
            id: id.into(),
            name,
            client_key: Arc::new(random_client_key()),
            client,
            last_activity: Arc::new(SyncMutex::new(Utc::now())),
            internal_timeout_secs: DEFAULT_INTERNAL_TIMEOUT_SECS,
            assumed_total_count: Arc::new(AtomicU64::new(0)),
            assumed_handled_count: Arc::new(AtomicU64::new(0)),
            in_progress: Arc::new(SyncMutex::new(HashSet::new())),
            recently_handled: Arc::new(SyncMutex::new(LruCache::new(RECENTLY_HANDLED_CACHE_SIZE))),
            request_cache: Arc::new(SyncMutex::new(LruCache::new(MAX_CACHED_REQUESTS))),
            head_window: Arc::new(SyncMutex::new(HeadWindow::new())),
            inflight: Arc::new(InflightQuery::new()),
        }
    }

    /// Override `internalTimeoutSecs` (default 300s). Exposed for tests
    /// that exercise the stuck-state recovery path without waiting 5 minutes.
    pub fn with_internal_timeout_secs(mut self, secs: u64) -> Self {
        self.internal_timeout_secs = secs;
        self
    }

    fn caches(&self) -> HeadCaches {
        HeadCaches {
            head_window: self.head_window.clone(),
            in_progress: self.in_progress.clone(),
            recently_handled: self.recently_handled.clone(),
            request_cache: self.request_cache.clone(),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    /// `§4.6` step 5: prime the head window once, right after a new queue
    /// is created by the open façade.
    pub async fn prime(&self) {
        self.ensure_head_is_non_empty(false).await;
    }

    async fn ensure_head_is_non_empty(&self, consistency: bool) -> bool {
        head::ensure_head_is_non_empty(
            &self.inflight,
            &self.caches(),
            self.client.clone(),
            self.client_key.as_str(),
            self.assumed_total_count.load(Ordering::SeqCst),
            self.assumed_handled_count.load(Ordering::SeqCst),
            consistency,
        )
        .await
    }

    fn maybe_add_to_head(&self, id: String, forefront: bool) {
        let assumed_total_count = self.assumed_total_count.load(Ordering::SeqCst);
        let mut window = self.head_window.lock();
        head::maybe_add_to_head(&mut window, id, forefront, assumed_total_count);
    }

    /// `add(request, forefront=false)`.
    pub async fn add(&self, mut request: Request, forefront: bool) -> Result<QueueOperationResult> {
        if request.url.trim().is_empty() {
            return Err(error::Error::client("request.url must be a non-empty string"));
        }
        self.touch();

        if request.unique_key.is_none() {
            let normalized = normalize_url(&request.url, false)?;
            request.unique_key = Some(normalized);
        }
        let unique_key = request.unique_key.clone().unwrap();
        let cache_key = request_id::derive(&unique_key);

        if let Some(cached) = self.request_cache.lock().get(&cache_key) {
            return Ok(QueueOperationResult {
                request_id: cached.id.clone(),
                unique_key: cached.unique_key.clone(),
                was_already_present: true,
                was_already_handled: cached.is_handled,
            });
        }

        let info = self
            .client
            .add_request(&self.client_key, &request, forefront)
            .await?;

        self.request_cache.lock().put(
            cache_key,
            CachedRequestInfo {
                id: info.request_id.clone(),
                unique_key: unique_key.clone(),
                is_handled: info.was_already_handled,
                was_already_handled: info.was_already_handled,
            },
        );

        let already_dispatched = {
            let in_progress = self.in_progress.lock();
            let recently_handled = self.recently_handled.lock();
            in_progress.contains(&info.request_id) || recently_handled.contains(&info.request_id)
        };
        if !info.was_already_handled && !info.was_already_present && !already_dispatched {
            self.assumed_total_count.fetch_add(1, Ordering::SeqCst);
            self.maybe_add_to_head(info.request_id.clone(), forefront);
        }

        Ok(QueueOperationResult {
            request_id: info.request_id,
            unique_key,
            was_already_present: info.was_already_present,
            was_already_handled: info.was_already_handled,
        })
    }

    /// `get(requestId)`. Not-found is already translated to `None` by the
    /// resource client; anything else propagates.
    pub async fn get(&self, request_id: &str) -> Result<Option<Request>> {
        self.client.get_request(request_id).await
    }

    /// `fetchNext()`.
    pub async fn fetch_next(&self) -> Result<Option<Request>> {
        self.ensure_head_is_non_empty(false).await;

        let next_id = {
            let mut window = self.head_window.lock();
            match window.shift() {
                Some(id) => id,
                None => return Ok(None),
            }
        };

        let already_tracked = {
            let in_progress = self.in_progress.lock();
            let recently_handled = self.recently_handled.lock();
            in_progress.contains(&next_id) || recently_handled.contains(&next_id)
        };
        if already_tracked {
            tracing::warn!(id = %next_id, "head entry already in-progress or recently handled, self-healing");
            return Ok(None);
        }

        self.in_progress.lock().insert(next_id.clone());
        self.touch();

        let request = match self.get(&next_id).await {
            Ok(r) => r,
            Err(e) => {
                self.in_progress.lock().remove(&next_id);
                return Err(e);
            }
        };

        let request = match request {
            Some(r) => r,
            None => {
                let in_progress = self.in_progress.clone();
                let id = next_id.clone();
                timers::defer(head::STORAGE_CONSISTENCY_DELAY, async move {
                    in_progress.lock().remove(&id);
                });
                return Ok(None);
            }
        };

        if request.is_handled() {
            self.recently_handled.lock().put(next_id.clone(), ());
            return Ok(None);
        }

        Ok(Some(request))
    }

    /// `markHandled(request)`.
    pub async fn mark_handled(&self, mut request: Request) -> Result<Option<QueueOperationResult>> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| error::Error::client("request.id is required"))?;
        let unique_key = request
            .unique_key
            .clone()
            .ok_or_else(|| error::Error::client("request.uniqueKey is required"))?;
        self.touch();

        if !self.in_progress.lock().contains(&id) {
            tracing::warn!(id = %id, "markHandled called for a request not in progress");
            return Ok(None);
        }

        if request.handled_at.is_none() {
            request.handled_at = Some(Utc::now());
        }

        let info = self
            .client
            .update_request(&self.client_key, &request, false)
            .await?;

        self.in_progress.lock().remove(&id);
        self.recently_handled.lock().put(id.clone(), ());

        if !info.was_already_handled {
            self.assumed_handled_count.fetch_add(1, Ordering::SeqCst);
        }

        let cache_key = request_id::derive(&unique_key);
        self.request_cache.lock().put(
            cache_key,
            CachedRequestInfo {
                id: info.request_id.clone(),
                unique_key: unique_key.clone(),
                is_handled: true,
                was_already_handled: info.was_already_handled,
            },
        );

        Ok(Some(QueueOperationResult {
            request_id: info.request_id,
            unique_key,
            was_already_present: info.was_already_present,
            was_already_handled: info.was_already_handled,
        }))
    }

    /// `reclaim(request, forefront=false)`.
    pub async fn reclaim(
        &self,
        request: Request,
        forefront: bool,
    ) -> Result<Option<QueueOperationResult>> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| error::Error::client("request.id is required"))?;
        let unique_key = request
            .unique_key
            .clone()
            .ok_or_else(|| error::Error::client("request.uniqueKey is required"))?;

        if !self.in_progress.lock().contains(&id) {
            tracing::warn!(id = %id, "reclaim called for a request not in progress");
            return Ok(None);
        }

        let info = self
            .client
            .update_request(&self.client_key, &request, forefront)
            .await?;

        let cache_key = request_id::derive(&unique_key);
        self.request_cache.lock().put(
            cache_key,
            CachedRequestInfo {
                id: info.request_id.clone(),
                unique_key: unique_key.clone(),
                is_handled: info.was_already_handled,
                was_already_handled: info.was_already_handled,
            },
        );

        let in_progress = self.in_progress.clone();
        let head_window = self.head_window.clone();
        let assumed_total_count = self.assumed_total_count.clone();
        let deferred_id = id.clone();
        timers::defer(head::STORAGE_CONSISTENCY_DELAY, async move {
            if in_progress.lock().remove(&deferred_id) {
                let total = assumed_total_count.load(Ordering::SeqCst);
                let mut window = head_window.lock();
                head::maybe_add_to_head(&mut window, deferred_id, forefront, total);
            }
        });

        Ok(Some(QueueOperationResult {
            request_id: info.request_id,
            unique_key,
            was_already_present: info.was_already_present,
            was_already_handled: info.was_already_handled,
        }))
    }

    /// `isEmpty`.
    pub async fn is_empty(&self) -> bool {
        self.ensure_head_is_non_empty(false).await;
        self.head_window.lock().is_empty()
    }

    /// `isFinished`.
    pub async fn is_finished(&self) -> bool {
        let stuck = {
            let in_progress_non_empty = !self.in_progress.lock().is_empty();
            let idle_for = Utc::now() - *self.last_activity.lock();
            in_progress_non_empty
                && idle_for
                    > chrono::Duration::seconds(self.internal_timeout_secs as i64)
        };
        if stuck {
            tracing::warn!(
                id = %self.id,
                "in-progress requests stuck past internalTimeoutSecs, resetting local state"
            );
            self.reset_state();
        }

        if !self.head_window.lock().is_empty() || !self.in_progress.lock().is_empty() {
            return false;
        }

        self.ensure_head_is_non_empty(true).await
    }

    fn reset_state(&self) {
        self.head_window.lock().clear();
        self.in_progress.lock().clear();
        self.recently_handled.lock().clear();
        self.request_cache.lock().clear();
        self.assumed_total_count.store(0, Ordering::SeqCst);
        self.assumed_handled_count.store(0, Ordering::SeqCst);
        self.touch();
    }

    /// `drop()`: delete remote state. Removing the instance from the
    /// process-level registry is the caller's (the storage façade's) job.
    pub async fn drop_queue(&self) -> Result<()> {
        self.client.delete().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{
        HeadItem, ListHeadResult, QueueInfo, RequestQueueOperationInfo, RequestsPage,
    };
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// In-memory fake honoring the [`ResourceClient`] contract, for testing
    /// the coordinator's orchestration without a network or filesystem.
    struct FakeClient {
        requests: StdMutex<Vec<Request>>,
        next_numeric_id: AtomicU64,
    }

    impl FakeClient {
        fn new() -> Self {
            Self {
                requests: StdMutex::new(Vec::new()),
                next_numeric_id: AtomicU64::new(1),
            }
        }
    }

    #[async_trait]
    impl ResourceClient for FakeClient {
        async fn get(&self) -> Result<Option<QueueInfo>> {
            Ok(None)
        }
        async fn update(&self, _name: Option<&str>) -> Result<QueueInfo> {
            unimplemented!()
        }
        async fn delete(&self) -> Result<()> {
            Ok(())
        }

        async fn list_head(&self, _client_key: &str, limit: u32) -> Result<ListHeadResult> {
            let requests = self.requests.lock().unwrap();
            let items = requests
                .iter()
                .filter(|r| !r.is_handled())
                .take(limit as usize)
                .map(|r| HeadItem {
                    id: r.id.clone().unwrap(),
                    unique_key: r.unique_key.clone().unwrap(),
                })
                .collect();
            Ok(ListHeadResult {
                items,
                queue_modified_at: Utc::now() - chrono::Duration::seconds(30),
                had_multiple_clients: false,
            })
        }

        async fn list_and_lock_head(
            &self,
            _client_key: &str,
            _lock_secs: u32,
            _limit: u32,
        ) -> Result<ListHeadResult> {
            unimplemented!()
        }

        async fn add_request(
            &self,
            _client_key: &str,
            request: &Request,
            _forefront: bool,
        ) -> Result<RequestQueueOperationInfo> {
            let mut requests = self.requests.lock().unwrap();
            let unique_key = request.unique_key.clone().unwrap();
            if let Some(existing) = requests.iter().find(|r| r.unique_key.as_deref() == Some(&unique_key)) {
                return Ok(RequestQueueOperationInfo {
                    request_id: existing.id.clone().unwrap(),
                    unique_key,
                    was_already_present: true,
                    was_already_handled: existing.is_handled(),
                });
            }
            let id = format!("req-{}", self.next_numeric_id.fetch_add(1, Ordering::SeqCst));
            let mut stored = request.clone();
            stored.id = Some(id.clone());
            requests.push(stored);
            Ok(RequestQueueOperationInfo {
                request_id: id,
                unique_key,
                was_already_present: false,
                was_already_handled: false,
            })
        }

        async fn get_request(&self, id: &str) -> Result<Option<Request>> {
            Ok(self
                .requests
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.id.as_deref() == Some(id))
                .cloned())
        }

        async fn update_request(
            &self,
            _client_key: &str,
            request: &Request,
            _forefront: bool,
        ) -> Result<RequestQueueOperationInfo> {
            let mut requests = self.requests.lock().unwrap();
            let id = request.id.clone().unwrap();
            let was_already_handled = requests
                .iter()
                .find(|r| r.id.as_deref() == Some(id.as_str()))
                .map(|r| r.is_handled())
                .unwrap_or(false);
            if let Some(existing) = requests.iter_mut().find(|r| r.id.as_deref() == Some(id.as_str())) {
                existing.handled_at = request.handled_at;
            }
            Ok(RequestQueueOperationInfo {
                request_id: id,
                unique_key: request.unique_key.clone().unwrap(),
                was_already_present: true,
                was_already_handled,
            })
        }

        async fn delete_request(&self, _id: &str) -> Result<()> {
            Ok(())
        }

        async fn prolong_request_lock(
            &self,
            _client_key: &str,
            _id: &str,
            _lock_secs: u32,
            _forefront: bool,
        ) -> Result<()> {
            Ok(())
        }
        async fn delete_request_lock(&self, _client_key: &str, _id: &str, _forefront: bool) -> Result<()> {
            Ok(())
        }

        async fn batch_add_requests(
            &self,
            _client_key: &str,
            _requests: &[Request],
            _forefront: bool,
        ) -> Result<Vec<RequestQueueOperationInfo>> {
            unimplemented!()
        }
        async fn batch_delete_requests(&self, _ids: &[String]) -> Result<()> {
            unimplemented!()
        }

        async fn list_requests(
            &self,
            _limit: u32,
            _exclusive_start_id: Option<&str>,
        ) -> Result<RequestsPage> {
            unimplemented!()
        }
    }

    fn queue() -> RequestQueue {
        RequestQueue::new("q1", None, Arc::new(FakeClient::new()))
    }

    #[tokio::test]
    async fn dedup_on_add() {
        let q = queue();
        let r1 = q.add(Request::new("https://a/"), false).await.unwrap();
        assert!(!r1.was_already_present);
        let r2 = q.add(Request::new("https://a/"), false).await.unwrap();
        assert!(r2.was_already_present);
        assert_eq!(r1.request_id, r2.request_id);
    }

    #[tokio::test]
    async fn fetch_handle_empty_cycle() {
        let q = queue();
        let r1 = q.add(Request::new("https://a/"), false).await.unwrap();
        let r2 = q.add(Request::new("https://b/"), false).await.unwrap();

        let next = q.fetch_next().await.unwrap().unwrap();
        assert_eq!(next.id.as_deref(), Some(r1.request_id.as_str()));
        q.mark_handled(next).await.unwrap().unwrap();

        let next = q.fetch_next().await.unwrap().unwrap();
        assert_eq!(next.id.as_deref(), Some(r2.request_id.as_str()));
        q.mark_handled(next).await.unwrap().unwrap();

        assert!(q.is_empty().await);
        assert!(q.is_finished().await);
    }

    #[tokio::test]
    async fn reclaim_forefront_returns_same_request_next() {
        let q = queue();
        q.add(Request::new("https://a/"), false).await.unwrap();
        q.add(Request::new("https://b/"), false).await.unwrap();

        let first = q.fetch_next().await.unwrap().unwrap();
        q.reclaim(first.clone(), true).await.unwrap().unwrap();

        tokio::time::sleep(head::STORAGE_CONSISTENCY_DELAY + Duration::from_millis(50)).await;

        let next = q.fetch_next().await.unwrap().unwrap();
        assert_eq!(next.id, first.id);
    }
}
