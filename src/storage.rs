//! The storage-open façade: resolves an id/name to a [`RequestQueue`],
//! choosing remote vs. local backing, and caches the instance at process
//! level so repeated opens of the same queue return the same coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::client::local::LocalClient;
use crate::client::remote::RemoteClient;
use crate::client::ResourceClient;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::queue::RequestQueue;

/// Which backend a queue instance is talking to — part of the registry key,
/// since the same id could in principle exist in both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    Local,
    Remote,
}

/// Credentials for the remote service. Read from the environment by
/// [`RemoteCredentials::from_env`], the same way the teacher reads its API
/// token — no `dotenvy` layer here, just `std::env::var`.
#[derive(Debug, Clone)]
pub struct RemoteCredentials {
    pub base_url: String,
    pub token: String,
}

impl RemoteCredentials {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("CRAWL_QUEUE_API_BASE_URL").ok()?;
        let token = std::env::var("CRAWL_QUEUE_API_TOKEN").ok()?;
        Some(Self { base_url, token })
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum QueueKey {
    Id(String),
    Name(String),
}

/// Process-level instance cache, keyed by `(ClientKind, QueueKey)`. Passed
/// explicitly rather than reached for as a global singleton, so tests can
/// create isolated registries; [`default_registry`] offers a convenience
/// shared one for callers who don't need isolation.
#[derive(Default)]
pub struct Registry {
    instances: parking_lot::Mutex<HashMap<(ClientKind, QueueKey), RequestQueue>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, kind: ClientKind, key: &QueueKey) -> Option<RequestQueue> {
        self.instances.lock().get(&(kind, key.clone())).cloned()
    }

    fn insert(&self, kind: ClientKind, key: QueueKey, queue: RequestQueue) {
        self.instances.lock().insert((kind, key), queue);
    }

    /// Remove every entry pointing at `queue.id`, called by `drop()`.
    pub fn remove(&self, id: &str) {
        self.instances.lock().retain(|_, q| q.id != id);
    }
}

static DEFAULT_REGISTRY: once_cell::sync::Lazy<Registry> = once_cell::sync::Lazy::new(Registry::new);

/// The shared process-wide registry, for callers that don't need isolated
/// instances (mirrors the teacher's `static SETTINGS: Lazy<Mutex<...>>`
/// pattern for process-wide defaults).
pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}

/// `open(id?, name?, forceCloud?, config?)` — §4.6.
pub async fn open(
    registry: &Registry,
    id: Option<&str>,
    name: Option<&str>,
    force_cloud: bool,
    config: &AppConfig,
) -> Result<RequestQueue> {
    let use_remote = force_cloud || config.storage.force_cloud || RemoteCredentials::from_env().is_some();

    let key = match (id, name) {
        (Some(id), _) => QueueKey::Id(id.to_string()),
        (None, Some(name)) => QueueKey::Name(name.to_string()),
        (None, None) => QueueKey::Id(config.storage.default_request_queue_id.clone()),
    };
    let kind = if use_remote { ClientKind::Remote } else { ClientKind::Local };

    if let Some(existing) = registry.lookup(kind, &key) {
        return Ok(existing);
    }

    let (client, resolved_id, is_new): (Arc<dyn ResourceClient>, String, bool) = if use_remote {
        let creds = RemoteCredentials::from_env()
            .ok_or_else(|| Error::client("remote storage requested but CRAWL_QUEUE_API_BASE_URL/CRAWL_QUEUE_API_TOKEN are not set"))?;
        let resolved_id = match &key {
            QueueKey::Id(id) => id.clone(),
            QueueKey::Name(_) => Uuid::new_v4().to_string(),
        };
        let remote = RemoteClient::new(creds.base_url, creds.token, resolved_id.clone());
        let existing = remote.get().await?;
        let is_new = existing.is_none();
        if is_new {
            if let QueueKey::Id(id) = &key {
                return Err(Error::client(format!("request queue '{id}' does not exist")));
            }
            remote.update(name).await?;
        }
        (Arc::new(remote), resolved_id, is_new)
    } else {
        let resolved_id = match &key {
            QueueKey::Id(id) => id.clone(),
            QueueKey::Name(name) => name.clone(),
        };
        let dir = std::path::Path::new(&config.storage.local_storage_dir)
            .join("request_queues")
            .join(&resolved_id);
        let existed_before = tokio::fs::metadata(&dir).await.is_ok();
        let local = LocalClient::open(
            config.storage.local_storage_dir.clone(),
            resolved_id.clone(),
            config.storage.write_metadata,
        )
        .await?;
        if name.is_none() && !existed_before {
            if let QueueKey::Id(id) = &key {
                // `LocalClient::open` above already `create_dir_all`'d `dir`
                // as a side effect of inspecting it; undo that so a failed
                // lookup doesn't leave a stray empty queue directory behind.
                tokio::fs::remove_dir_all(&dir).await.ok();
                return Err(Error::client(format!("request queue '{id}' does not exist")));
            }
        }
        let is_new = local.get().await?.map(|info| info.total_request_count == 0).unwrap_or(true);
        if name.is_some() {
            local.update(name).await?;
        }
        (Arc::new(local), resolved_id, is_new)
    };

    let queue = RequestQueue::new(resolved_id, name.map(str::to_string), client);
    if is_new {
        queue.prime().await;
    }

    registry.insert(kind, key, queue.clone());
    if let Some(name) = &queue.name {
        registry.insert(kind, QueueKey::Name(name.clone()), queue.clone());
    }
    registry.insert(kind, QueueKey::Id(queue.id.clone()), queue.clone());

    Ok(queue)
}

/// `drop()`: delete remote/local state and remove every registry entry
/// pointing at this instance.
pub async fn drop_queue(registry: &Registry, queue: &RequestQueue) -> Result<()> {
    queue.drop_queue().await?;
    registry.remove(&queue.id);
    Ok(())
}
