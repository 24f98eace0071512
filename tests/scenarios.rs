//! End-to-end scenarios and boundary behaviors, exercised against an
//! in-memory fake resource client rather than the network or the on-disk
//! emulator, so the suite runs deterministically and fast.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use tokio::sync::Mutex;

use crawl_queue_coordinator::cache::LruCache;
use crawl_queue_coordinator::client::{
    HeadItem, ListHeadResult, QueueInfo, RequestQueueOperationInfo, RequestsPage, ResourceClient,
};
use crawl_queue_coordinator::error::Result;
use crawl_queue_coordinator::queue::head::{self, HeadCaches, HeadWindow, InflightQuery, STORAGE_CONSISTENCY_DELAY};
use crawl_queue_coordinator::queue::RequestQueue;
use crawl_queue_coordinator::Request;

/// Backed by a `HashMap` behind a `tokio::sync::Mutex`. `phantom_head_ids`
/// lets a test simulate a head entry whose backing record hasn't replicated
/// yet (scenario 5): `list_head` always offers them, independent of whether
/// they're in `requests` yet.
struct FakeClient {
    requests: Mutex<HashMap<String, Request>>,
    phantom_head_ids: Mutex<Vec<(String, String)>>,
    had_multiple_clients: Mutex<bool>,
    next_id: AtomicU64,
}

impl FakeClient {
    fn new() -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            phantom_head_ids: Mutex::new(Vec::new()),
            had_multiple_clients: Mutex::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    async fn push_phantom(&self, id: &str, unique_key: &str) {
        self.phantom_head_ids
            .lock()
            .await
            .push((id.to_string(), unique_key.to_string()));
    }

    async fn insert(&self, request: Request) {
        let id = request.id.clone().unwrap();
        self.requests.lock().await.insert(id, request);
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
        let requests = self.requests.lock().await;
        let mut items: Vec<HeadItem> = requests
            .values()
            .filter(|r| !r.is_handled())
            .map(|r| HeadItem {
                id: r.id.clone().unwrap(),
                unique_key: r.unique_key.clone().unwrap(),
            })
            .collect();
        for (id, unique_key) in self.phantom_head_ids.lock().await.iter() {
            if !items.iter().any(|i| &i.id == id) {
                items.push(HeadItem {
                    id: id.clone(),
                    unique_key: unique_key.clone(),
                });
            }
        }
        items.truncate(limit as usize);
        Ok(ListHeadResult {
            items,
            queue_modified_at: Utc::now() - chrono::Duration::seconds(30),
            had_multiple_clients: *self.had_multiple_clients.lock().await,
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
        let mut requests = self.requests.lock().await;
        let unique_key = request.unique_key.clone().unwrap();
        if let Some(existing) = requests.values().find(|r| r.unique_key.as_deref() == Some(&unique_key)) {
            return Ok(RequestQueueOperationInfo {
                request_id: existing.id.clone().unwrap(),
                unique_key,
                was_already_present: true,
                was_already_handled: existing.is_handled(),
            });
        }
        let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut stored = request.clone();
        stored.id = Some(id.clone());
        requests.insert(id.clone(), stored);
        Ok(RequestQueueOperationInfo {
            request_id: id,
            unique_key,
            was_already_present: false,
            was_already_handled: false,
        })
    }

    async fn get_request(&self, id: &str) -> Result<Option<Request>> {
        Ok(self.requests.lock().await.get(id).cloned())
    }

    async fn update_request(
        &self,
        _client_key: &str,
        request: &Request,
        _forefront: bool,
    ) -> Result<RequestQueueOperationInfo> {
        let mut requests = self.requests.lock().await;
        let id = request.id.clone().unwrap();
        let was_already_handled = requests.get(&id).map(|r| r.is_handled()).unwrap_or(false);
        requests.insert(id.clone(), request.clone());
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

    async fn list_requests(&self, _limit: u32, _exclusive_start_id: Option<&str>) -> Result<RequestsPage> {
        unimplemented!()
    }
}

fn queue() -> (RequestQueue, Arc<FakeClient>) {
    let fake = Arc::new(FakeClient::new());
    let queue = RequestQueue::new("q1", None, fake.clone() as Arc<dyn ResourceClient>);
    (queue, fake)
}

#[tokio::test]
async fn scenario_url_normalization_dedup() {
    let (q, _fake) = queue();
    let r1 = q
        .add(
            Request::new("https://A.example.com/p/?utm_source=x&b=2&a=1#frag"),
            false,
        )
        .await
        .unwrap();
    let r2 = q
        .add(Request::new("https://a.example.com/p?a=1&b=2"), false)
        .await
        .unwrap();
    assert_eq!(r1.request_id, r2.request_id);
    assert!(r2.was_already_present);
}

#[tokio::test]
async fn scenario_missing_request_self_heals() {
    let (q, fake) = queue();
    fake.push_phantom("ghost", "ghost-key").await;

    // First fetch: the head entry exists but the backing record hasn't
    // replicated yet, so fetchNext must return absent.
    let first = q.fetch_next().await.unwrap();
    assert!(first.is_none());

    // The remote catches up.
    fake.insert(Request {
        url: "https://ghost/".to_string(),
        unique_key: Some("ghost-key".to_string()),
        id: Some("ghost".to_string()),
        handled_at: None,
        user_data: Default::default(),
    })
    .await;

    tokio::time::sleep(STORAGE_CONSISTENCY_DELAY + Duration::from_millis(100)).await;

    let second = q.fetch_next().await.unwrap();
    assert_eq!(second.unwrap().id.as_deref(), Some("ghost"));
}

#[tokio::test]
async fn scenario_stuck_state_recovery_resets_and_refetches() {
    let (q, _fake) = queue();
    let q = q.with_internal_timeout_secs(1);

    q.add(Request::new("https://a/"), false).await.unwrap();
    let first = q.fetch_next().await.unwrap().unwrap();
    assert_eq!(first.url, "https://a/");

    // No mark_handled/reclaim happens; simulate a stalled worker.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    // isFinished must notice in-progress is stale, reset local state, and
    // re-derive its answer from a fresh head query rather than trusting
    // the stale in-progress entry.
    q.is_finished().await;

    // The reset cleared in-progress, so the same request is dispatchable
    // again.
    let again = q.fetch_next().await.unwrap().unwrap();
    assert_eq!(again.url, "https://a/");
}

#[tokio::test]
async fn boundary_mark_handled_twice_reports_already_handled_second_time() {
    // Two independent coordinator instances sharing one remote, the way two
    // crawler processes would. Neither instance's in-progress set is aware
    // of the other's, so both can legitimately dispatch the same request —
    // §5's "no ordering guarantee across instances."
    let fake = Arc::new(FakeClient::new());
    let a = RequestQueue::new("q1", None, fake.clone() as Arc<dyn ResourceClient>);
    let b = RequestQueue::new("q1", None, fake.clone() as Arc<dyn ResourceClient>);

    a.add(Request::new("https://a/"), false).await.unwrap();

    let seen_by_a = a.fetch_next().await.unwrap().unwrap();
    let seen_by_b = b.fetch_next().await.unwrap().unwrap();
    assert_eq!(seen_by_a.id, seen_by_b.id);

    let result_a = a.mark_handled(seen_by_a).await.unwrap().unwrap();
    assert!(!result_a.was_already_handled);

    let result_b = b.mark_handled(seen_by_b).await.unwrap().unwrap();
    assert!(result_b.was_already_handled);
}

/// `list_head` that never offers an item and always reports
/// `had_multiple_clients`, so neither database nor local consistency can
/// ever be reached — used to exercise the `MAX_QUERIES_FOR_CONSISTENCY`
/// exhaustion path.
struct NeverConsistentClient;

#[async_trait]
impl ResourceClient for NeverConsistentClient {
    async fn get(&self) -> Result<Option<QueueInfo>> {
        Ok(None)
    }
    async fn update(&self, _name: Option<&str>) -> Result<QueueInfo> {
        unimplemented!()
    }
    async fn delete(&self) -> Result<()> {
        Ok(())
    }

    async fn list_head(&self, _client_key: &str, _limit: u32) -> Result<ListHeadResult> {
        Ok(ListHeadResult {
            items: Vec::new(),
            queue_modified_at: Utc::now(),
            had_multiple_clients: true,
        })
    }

    async fn list_and_lock_head(&self, _: &str, _: u32, _: u32) -> Result<ListHeadResult> {
        unimplemented!()
    }
    async fn add_request(&self, _: &str, _: &Request, _: bool) -> Result<RequestQueueOperationInfo> {
        unimplemented!()
    }
    async fn get_request(&self, _: &str) -> Result<Option<Request>> {
        unimplemented!()
    }
    async fn update_request(&self, _: &str, _: &Request, _: bool) -> Result<RequestQueueOperationInfo> {
        unimplemented!()
    }
    async fn delete_request(&self, _: &str) -> Result<()> {
        unimplemented!()
    }
    async fn prolong_request_lock(&self, _: &str, _: &str, _: u32, _: bool) -> Result<()> {
        unimplemented!()
    }
    async fn delete_request_lock(&self, _: &str, _: &str, _: bool) -> Result<()> {
        unimplemented!()
    }
    async fn batch_add_requests(
        &self,
        _: &str,
        _: &[Request],
        _: bool,
    ) -> Result<Vec<RequestQueueOperationInfo>> {
        unimplemented!()
    }
    async fn batch_delete_requests(&self, _: &[String]) -> Result<()> {
        unimplemented!()
    }
    async fn list_requests(&self, _: u32, _: Option<&str>) -> Result<RequestsPage> {
        unimplemented!()
    }
}

#[tokio::test(start_paused = true)]
async fn boundary_consistency_retry_exhausts_and_returns_false() {
    let client: Arc<dyn ResourceClient> = Arc::new(NeverConsistentClient);
    let inflight = InflightQuery::new();
    let caches = HeadCaches {
        head_window: Arc::new(parking_lot::Mutex::new(HeadWindow::new())),
        in_progress: Arc::new(parking_lot::Mutex::new(std::collections::HashSet::new())),
        recently_handled: Arc::new(parking_lot::Mutex::new(LruCache::new(16))),
        request_cache: Arc::new(parking_lot::Mutex::new(LruCache::new(16))),
    };

    // consistency=true, had_multiple_clients=true, fresh queue_modified_at
    // every round: database and local consistency are unreachable, so the
    // retry loop must give up after MAX_QUERIES_FOR_CONSISTENCY rounds
    // rather than spin forever.
    let result = head::ensure_head_is_non_empty(&inflight, &caches, client, "ck", 0, 0, true).await;
    assert!(!result);
}
