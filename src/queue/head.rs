//! Head-window maintainer: the ordered mapping that buffers a prefix of the
//! remote queue, and the `ensureHeadIsNonEmpty`/`queryHead` algorithm that
//! keeps it populated.

use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex as SyncMutex;

use crate::client::ResourceClient;
use crate::model::CachedRequestInfo;

pub const QUERY_HEAD_MIN_LENGTH: u32 = 100;
pub const QUERY_HEAD_BUFFER: u32 = 3;
pub const API_PROCESSED_REQUESTS_DELAY: Duration = Duration::from_secs(10);
pub const MAX_QUERIES_FOR_CONSISTENCY: u32 = 6;
pub const REQUEST_QUEUE_HEAD_MAX_LIMIT: u32 = 1000;
pub const STORAGE_CONSISTENCY_DELAY: Duration = Duration::from_secs(3);

/// Ordered mapping with O(1) pop-oldest, append-newest, move-to-oldest, and
/// membership test. Implemented as a `VecDeque` for order plus a `HashSet`
/// index, per the design note that a doubly-linked-list-plus-hash-index (or
/// equivalent) is needed since the head window requires a forefront re-key
/// that a plain ordered map doesn't expose.
#[derive(Default)]
pub struct HeadWindow {
    order: VecDeque<String>,
    index: HashSet<String>,
}

impl HeadWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Remove and return the oldest entry.
    pub fn shift(&mut self) -> Option<String> {
        let id = self.order.pop_front()?;
        self.index.remove(&id);
        Some(id)
    }

    /// Append at the newest position. No-op if already present.
    pub fn push_newest(&mut self, id: String) {
        if self.index.insert(id.clone()) {
            self.order.push_back(id);
        }
    }

    /// Move (or insert) at the oldest position — the next `shift()` will
    /// return this id.
    pub fn push_oldest(&mut self, id: String) {
        if self.index.contains(&id) {
            self.order.retain(|x| x != &id);
        } else {
            self.index.insert(id.clone());
        }
        self.order.push_front(id);
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }
}

/// Outcome of one `queryHead` round-trip.
#[derive(Clone)]
pub struct QueryHeadOutcome {
    pub was_limit_reached: bool,
    pub prev_limit: u32,
    pub queue_modified_at: DateTime<Utc>,
    pub query_started_at: DateTime<Utc>,
    pub had_multiple_clients: bool,
}

type SharedQuery = Shared<std::pin::Pin<Box<dyn std::future::Future<Output = Result<QueryHeadOutcome, String>> + Send>>>;

/// Task-memoization for the in-flight `listHead` call: the first caller to
/// find none in flight starts one and stores the handle; everyone else
/// awaits the same handle, which clears itself on completion.
#[derive(Default)]
pub struct InflightQuery {
    current: SyncMutex<Option<(u64, SharedQuery)>>,
    generation: std::sync::atomic::AtomicU64,
}

impl InflightQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `queryHead(limit)` via `client`, sharing the in-flight call with
    /// any other concurrent caller that asked for the same fetch.
    async fn run(
        &self,
        client: Arc<dyn ResourceClient>,
        client_key: String,
        limit: u32,
        caches: HeadCaches,
    ) -> Result<QueryHeadOutcome, String> {
        let (gen, shared) = {
            let mut guard = self.current.lock();
            if let Some((gen, existing)) = guard.as_ref() {
                (*gen, existing.clone())
            } else {
                let fut: std::pin::Pin<Box<dyn std::future::Future<Output = Result<QueryHeadOutcome, String>> + Send>> =
                    Box::pin(query_head(client, client_key, limit, caches));
                let shared = fut.shared();
                let gen = self.generation.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                *guard = Some((gen, shared.clone()));
                (gen, shared)
            }
        };

        let result = shared.await;

        // Clear the slot only if no one has started a newer fetch since.
        let mut guard = self.current.lock();
        if matches!(guard.as_ref(), Some((g, _)) if *g == gen) {
            *guard = None;
        }
        result
    }
}

/// The caches the head-window maintainer touches, bundled so the coordinator
/// can hand them to [`InflightQuery::run`]/[`ensure_head_is_non_empty`] as a
/// unit instead of threading four `Arc`s through every call.
#[derive(Clone)]
pub struct HeadCaches {
    pub head_window: Arc<SyncMutex<HeadWindow>>,
    pub in_progress: Arc<SyncMutex<HashSet<String>>>,
    pub recently_handled: Arc<SyncMutex<crate::cache::LruCache<String, ()>>>,
    pub request_cache: Arc<SyncMutex<crate::cache::LruCache<String, CachedRequestInfo>>>,
}

async fn query_head(
    client: Arc<dyn ResourceClient>,
    client_key: String,
    limit: u32,
    caches: HeadCaches,
) -> Result<QueryHeadOutcome, String> {
    let query_started_at = Utc::now();
    let result = client
        .list_head(&client_key, limit)
        .await
        .map_err(|e| e.to_string())?;

    let was_limit_reached = result.items.len() as u32 >= limit;
    {
        let mut window = caches.head_window.lock();
        let in_progress = caches.in_progress.lock();
        let recently_handled = caches.recently_handled.lock();
        let mut request_cache = caches.request_cache.lock();
        for item in result.items {
            if in_progress.contains(&item.id) || recently_handled.contains(&item.id) {
                continue;
            }
            window.push_newest(item.id.clone());
            request_cache.put(
                item.id.clone(),
                CachedRequestInfo {
                    id: item.id.clone(),
                    unique_key: item.unique_key.clone(),
                    is_handled: false,
                    was_already_handled: false,
                },
            );
        }
    }

    Ok(QueryHeadOutcome {
        was_limit_reached,
        prev_limit: limit,
        queue_modified_at: result.queue_modified_at,
        query_started_at,
        had_multiple_clients: result.had_multiple_clients,
    })
}

/// `ensureHeadIsNonEmpty`: the retry loop that (re)populates the head window,
/// optionally waiting out replication lag when `consistency` is requested.
///
/// The source's recursive form passes `consistency` through unchanged on
/// every recursive call; we preserve that (rather than the mismatched
/// positional re-call the source actually contains) and implement the
/// recursion as a loop since every recursive call here is a tail call.
#[allow(clippy::too_many_arguments)]
pub async fn ensure_head_is_non_empty(
    inflight: &InflightQuery,
    caches: &HeadCaches,
    client: Arc<dyn ResourceClient>,
    client_key: &str,
    assumed_total_count: u64,
    assumed_handled_count: u64,
    consistency: bool,
) -> bool {
    if !caches.head_window.lock().is_empty() {
        return true;
    }

    let in_progress_count = caches.in_progress.lock().len() as u32;
    let mut limit = (in_progress_count * QUERY_HEAD_BUFFER).max(QUERY_HEAD_MIN_LENGTH);
    let mut iteration: u32 = 0;

    loop {
        let result = match inflight
            .run(client.clone(), client_key.to_string(), limit, caches.clone())
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "listHead failed while ensuring head window non-empty");
                return false;
            }
        };

        if result.prev_limit >= REQUEST_QUEUE_HEAD_MAX_LIMIT {
            tracing::warn!(limit = result.prev_limit, "listHead limit reached the configured maximum");
        }

        let head_empty = caches.head_window.lock().is_empty();
        let should_retry_higher_limit = head_empty
            && result.was_limit_reached
            && result.prev_limit < REQUEST_QUEUE_HEAD_MAX_LIMIT;

        let api_processed_requests_delay =
            chrono::Duration::from_std(API_PROCESSED_REQUESTS_DELAY).expect("fits in chrono::Duration");
        let database_consistent =
            (result.query_started_at - result.queue_modified_at) >= api_processed_requests_delay;
        let locally_consistent =
            !result.had_multiple_clients && assumed_total_count <= assumed_handled_count;
        let should_retry_for_consistency = consistency && !database_consistent && !locally_consistent;

        if !should_retry_higher_limit && !should_retry_for_consistency {
            return true;
        }

        if !should_retry_higher_limit && should_retry_for_consistency && iteration > MAX_QUERIES_FOR_CONSISTENCY {
            return false;
        }

        let next_limit = if should_retry_higher_limit {
            ((result.prev_limit as f64) * 1.5).round() as u32
        } else {
            result.prev_limit
        };

        if should_retry_for_consistency {
            let elapsed = Utc::now() - result.queue_modified_at;
            let remaining = api_processed_requests_delay - elapsed;
            if remaining > chrono::Duration::zero() {
                tokio::time::sleep(remaining.to_std().unwrap_or(Duration::ZERO)).await;
            }
        }

        limit = next_limit;
        iteration += 1;
    }
}

/// `maybeAddRequestToQueueHead`: decide whether a just-added/just-reclaimed
/// request should enter the local head window immediately, or wait for the
/// next `listHead` to pick it up.
pub fn maybe_add_to_head(
    window: &mut HeadWindow,
    id: String,
    forefront: bool,
    assumed_total_count: u64,
) {
    if forefront {
        window.push_oldest(id);
    } else if assumed_total_count < QUERY_HEAD_MIN_LENGTH as u64 {
        window.push_newest(id);
    }
    // otherwise: no-op, the next head query will pick it up.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_is_fifo() {
        let mut w = HeadWindow::new();
        w.push_newest("a".into());
        w.push_newest("b".into());
        assert_eq!(w.shift(), Some("a".to_string()));
        assert_eq!(w.shift(), Some("b".to_string()));
        assert_eq!(w.shift(), None);
    }

    #[test]
    fn forefront_insert_becomes_new_oldest() {
        let mut w = HeadWindow::new();
        w.push_newest("a".into());
        w.push_newest("b".into());
        w.push_oldest("c".into());
        assert_eq!(w.shift(), Some("c".to_string()));
        assert_eq!(w.shift(), Some("a".to_string()));
        assert_eq!(w.shift(), Some("b".to_string()));
    }

    #[test]
    fn forefront_move_of_existing_entry_relocates_it() {
        let mut w = HeadWindow::new();
        w.push_newest("a".into());
        w.push_newest("b".into());
        w.push_oldest("b".into());
        assert_eq!(w.shift(), Some("b".to_string()));
        assert_eq!(w.shift(), Some("a".to_string()));
    }

    #[test]
    fn membership_test() {
        let mut w = HeadWindow::new();
        w.push_newest("a".into());
        assert!(w.contains("a"));
        assert!(!w.contains("z"));
    }
}
