//! On-disk emulator used when no remote token is configured.
//!
//! One JSON file per request under `<root>/request_queues/<queueId>/`, plus
//! an optional `__metadata__.json`. Purges stage the target aside into a
//! `__OLD_<n>__` directory and delete it asynchronously so callers never
//! block on the removal — the same rename-then-delete shape as the
//! teacher's `shadow_git::cleanup::nuke_workspace` (count first, then
//! destroy under an explicit safety check).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::Request;

use super::{HeadItem, ListHeadResult, QueueInfo, RequestQueueOperationInfo, RequestsPage, ResourceClient};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Metadata {
    id: String,
    name: Option<String>,
    created_at: DateTime<Utc>,
    accessed_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    item_count: u64,
}

/// Per-queue state held in memory and mirrored to disk. A `Mutex` guards
/// it because every `ResourceClient` call is `&self` and may run
/// concurrently with a purge.
struct Inner {
    requests: HashMap<String, Request>,
    /// Insertion order, used to emulate head ordering.
    order: Vec<String>,
    name: Option<String>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

pub struct LocalClient {
    root: PathBuf,
    queue_id: String,
    write_metadata: bool,
    inner: Mutex<Inner>,
    staging_counter: AtomicU64,
}

impl LocalClient {
    /// Load (or create empty) state for `queue_id` rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>, queue_id: impl Into<String>, write_metadata: bool) -> Result<Self> {
        let root = root.into();
        let queue_id = queue_id.into();
        let dir = root.join("request_queues").join(&queue_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::LocalStorage(format!("failed to create {dir:?}: {e}")))?;

        let mut requests = HashMap::new();
        let mut order = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::LocalStorage(e.to_string()))?;
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| Error::LocalStorage(e.to_string()))? {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if name == "__metadata__.json" || !name.ends_with(".json") {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::LocalStorage(e.to_string()))?;
            let request: Request = serde_json::from_str(&contents)
                .map_err(|e| Error::LocalStorage(format!("corrupt request file {path:?}: {e}")))?;
            if let Some(id) = request.id.clone() {
                order.push(id.clone());
                requests.insert(id, request);
            }
        }

        let meta_path = dir.join("__metadata__.json");
        let (name, created_at) = match tokio::fs::read_to_string(&meta_path).await {
            Ok(contents) => match serde_json::from_str::<Metadata>(&contents) {
                Ok(m) => (m.name, m.created_at),
                Err(e) => {
                    log::warn!("failed to parse {meta_path:?}: {e}");
                    (None, Utc::now())
                }
            },
            Err(_) => (None, Utc::now()),
        };

        Ok(Self {
            root,
            queue_id,
            write_metadata,
            inner: Mutex::new(Inner {
                requests,
                order,
                name,
                created_at,
                modified_at: Utc::now(),
            }),
            staging_counter: AtomicU64::new(0),
        })
    }

    fn dir(&self) -> PathBuf {
        self.root.join("request_queues").join(&self.queue_id)
    }

    fn request_path(&self, id: &str) -> PathBuf {
        self.dir().join(format!("{id}.json"))
    }

    async fn persist_request(&self, request: &Request) -> Result<()> {
        let id = request.id.as_deref().ok_or_else(|| Error::client("request missing id"))?;
        let json = serde_json::to_string_pretty(request).map_err(|e| Error::LocalStorage(e.to_string()))?;
        tokio::fs::write(self.request_path(id), json)
            .await
            .map_err(|e| Error::LocalStorage(e.to_string()))
    }

    async fn write_metadata_file(&self, guard: &Inner) -> Result<()> {
        if !self.write_metadata {
            return Ok(());
        }
        let meta = Metadata {
            id: self.queue_id.clone(),
            name: guard.name.clone(),
            created_at: guard.created_at,
            accessed_at: Utc::now(),
            modified_at: guard.modified_at,
            item_count: guard.requests.len() as u64,
        };
        let json = serde_json::to_string_pretty(&meta).map_err(|e| Error::LocalStorage(e.to_string()))?;
        tokio::fs::write(self.dir().join("__metadata__.json"), json)
            .await
            .map_err(|e| Error::LocalStorage(e.to_string()))
    }

    /// Move `self.dir()` aside into `__OLD_<n>__` and delete it in the
    /// background, so the caller isn't blocked on the removal.
    pub async fn purge(&self) -> Result<()> {
        let n = self.staging_counter.fetch_add(1, Ordering::SeqCst);
        let old_dir = self.root.join(format!("__OLD_{n}__"));
        let dir = self.dir();
        if tokio::fs::metadata(&dir).await.is_ok() {
            tokio::fs::rename(&dir, &old_dir)
                .await
                .map_err(|e| Error::LocalStorage(format!("failed to stage purge of {dir:?}: {e}")))?;
            tokio::spawn(async move {
                if let Err(e) = tokio::fs::remove_dir_all(&old_dir).await {
                    log::warn!("background purge of {old_dir:?} failed: {e}");
                }
            });
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::LocalStorage(e.to_string()))?;
        let mut guard = self.inner.lock().await;
        guard.requests.clear();
        guard.order.clear();
        Ok(())
    }

}

fn is_handled(r: &Request) -> bool {
    r.handled_at.is_some()
}

#[async_trait]
impl ResourceClient for LocalClient {
    async fn get(&self) -> Result<Option<QueueInfo>> {
        let guard = self.inner.lock().await;
        let handled = guard.requests.values().filter(|r| is_handled(r)).count() as u64;
        Ok(Some(QueueInfo {
            id: self.queue_id.clone(),
            name: guard.name.clone(),
            total_request_count: guard.requests.len() as u64,
            handled_request_count: handled,
        }))
    }

    async fn update(&self, name: Option<&str>) -> Result<QueueInfo> {
        let mut guard = self.inner.lock().await;
        guard.name = name.map(|s| s.to_string());
        guard.modified_at = Utc::now();
        self.write_metadata_file(&guard).await?;
        let handled = guard.requests.values().filter(|r| is_handled(r)).count() as u64;
        Ok(QueueInfo {
            id: self.queue_id.clone(),
            name: guard.name.clone(),
            total_request_count: guard.requests.len() as u64,
            handled_request_count: handled,
        })
    }

    async fn delete(&self) -> Result<()> {
        self.purge().await
    }

    async fn list_head(&self, _client_key: &str, limit: u32) -> Result<ListHeadResult> {
        let guard = self.inner.lock().await;
        let items = guard
            .order
            .iter()
            .filter_map(|id| guard.requests.get(id))
            .filter(|r| !is_handled(r))
            .take(limit as usize)
            .map(|r| HeadItem {
                id: r.id.clone().unwrap_or_default(),
                unique_key: r.unique_key.clone().unwrap_or_default(),
            })
            .collect();
        Ok(ListHeadResult {
            items,
            queue_modified_at: guard.modified_at,
            had_multiple_clients: false,
        })
    }

    async fn list_and_lock_head(&self, client_key: &str, _lock_secs: u32, limit: u32) -> Result<ListHeadResult> {
        self.list_head(client_key, limit).await
    }

    async fn add_request(&self, _client_key: &str, request: &Request, forefront: bool) -> Result<RequestQueueOperationInfo> {
        let unique_key = request
            .unique_key
            .clone()
            .ok_or_else(|| Error::client("add_request requires unique_key"))?;

        let mut guard = self.inner.lock().await;
        if let Some(existing) = guard.requests.values().find(|r| r.unique_key.as_deref() == Some(unique_key.as_str())) {
            return Ok(RequestQueueOperationInfo {
                request_id: existing.id.clone().unwrap_or_default(),
                unique_key,
                was_already_present: true,
                was_already_handled: is_handled(existing),
            });
        }

        let id = crate::request_id::derive(&unique_key);
        let mut stored = request.clone();
        stored.id = Some(id.clone());
        stored.unique_key = Some(unique_key.clone());

        if forefront {
            guard.order.insert(0, id.clone());
        } else {
            guard.order.push(id.clone());
        }
        guard.requests.insert(id.clone(), stored.clone());
        guard.modified_at = Utc::now();
        drop(guard);

        self.persist_request(&stored).await?;

        Ok(RequestQueueOperationInfo {
            request_id: id,
            unique_key,
            was_already_present: false,
            was_already_handled: false,
        })
    }

    async fn get_request(&self, id: &str) -> Result<Option<Request>> {
        let guard = self.inner.lock().await;
        Ok(guard.requests.get(id).cloned())
    }

    async fn update_request(&self, _client_key: &str, request: &Request, forefront: bool) -> Result<RequestQueueOperationInfo> {
        let id = request.id.clone().ok_or_else(|| Error::client("update_request requires id"))?;
        let unique_key = request.unique_key.clone().unwrap_or_default();

        let mut guard = self.inner.lock().await;
        let was_already_handled = guard.requests.get(&id).map(is_handled).unwrap_or(false);
        guard.requests.insert(id.clone(), request.clone());
        if forefront {
            guard.order.retain(|x| x != &id);
            guard.order.insert(0, id.clone());
        }
        guard.modified_at = Utc::now();
        drop(guard);

        self.persist_request(request).await?;

        Ok(RequestQueueOperationInfo {
            request_id: id,
            unique_key,
            was_already_present: true,
            was_already_handled,
        })
    }

    async fn delete_request(&self, id: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard.requests.remove(id);
        guard.order.retain(|x| x != id);
        drop(guard);
        let path = self.request_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::LocalStorage(e.to_string())),
        }
    }

    async fn prolong_request_lock(&self, _client_key: &str, _id: &str, _lock_secs: u32, _forefront: bool) -> Result<()> {
        Ok(())
    }

    async fn delete_request_lock(&self, _client_key: &str, _id: &str, _forefront: bool) -> Result<()> {
        Ok(())
    }

    async fn batch_add_requests(&self, client_key: &str, requests: &[Request], forefront: bool) -> Result<Vec<RequestQueueOperationInfo>> {
        let mut out = Vec::with_capacity(requests.len());
        for r in requests {
            out.push(self.add_request(client_key, r, forefront).await?);
        }
        Ok(out)
    }

    async fn batch_delete_requests(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.delete_request(id).await?;
        }
        Ok(())
    }

    async fn list_requests(&self, limit: u32, exclusive_start_id: Option<&str>) -> Result<RequestsPage> {
        let guard = self.inner.lock().await;
        let start = match exclusive_start_id {
            Some(id) => guard.order.iter().position(|x| x == id).map(|p| p + 1).unwrap_or(0),
            None => 0,
        };
        let items: Vec<Request> = guard
            .order
            .iter()
            .skip(start)
            .take(limit as usize)
            .filter_map(|id| guard.requests.get(id).cloned())
            .collect();
        let exclusive_start_id = items.last().and_then(|r| r.id.clone());
        Ok(RequestsPage { items, exclusive_start_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_request_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalClient::open(dir.path(), "q1", false).await.unwrap();

        let mut request = Request::new("https://a/");
        request.unique_key = Some("https://a/".to_string());
        let info = client.add_request("ck", &request, false).await.unwrap();
        assert!(!info.was_already_present);

        // Reopening against the same directory must see the persisted file.
        let reopened = LocalClient::open(dir.path(), "q1", false).await.unwrap();
        let fetched = reopened.get_request(&info.request_id).await.unwrap().unwrap();
        assert_eq!(fetched.url, "https://a/");
    }

    #[tokio::test]
    async fn purge_clears_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let client = LocalClient::open(dir.path(), "q1", false).await.unwrap();

        let mut request = Request::new("https://a/");
        request.unique_key = Some("https://a/".to_string());
        client.add_request("ck", &request, false).await.unwrap();

        client.purge().await.unwrap();

        let info = client.get().await.unwrap().unwrap();
        assert_eq!(info.total_request_count, 0);

        let reopened = LocalClient::open(dir.path(), "q1", false).await.unwrap();
        let info = reopened.get().await.unwrap().unwrap();
        assert_eq!(info.total_request_count, 0);
    }
}

/// Purge the default queue on process start, preserving well-known input
/// files under the default key-value store (`INPUT`, `INPUT.json`,
/// `INPUT.bin`, `INPUT.txt`).
pub async fn purge_default_on_startup(kv_store_dir: &Path) -> Result<()> {
    const PRESERVED: &[&str] = &["INPUT", "INPUT.json", "INPUT.bin", "INPUT.txt"];

    if tokio::fs::metadata(kv_store_dir).await.is_err() {
        return Ok(());
    }

    let mut read_dir = tokio::fs::read_dir(kv_store_dir)
        .await
        .map_err(|e| Error::LocalStorage(e.to_string()))?;
    while let Some(entry) = read_dir.next_entry().await.map_err(|e| Error::LocalStorage(e.to_string()))? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if PRESERVED.contains(&name.as_ref()) {
            continue;
        }
        let path = entry.path();
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            tokio::fs::remove_dir_all(&path).await.ok();
        } else {
            tokio::fs::remove_file(&path).await.ok();
        }
    }
    Ok(())
}
