//! Drains a request queue to completion, printing each URL as it's handled.
//!
//! Seeds the default queue with a couple of URLs if it's empty, then loops
//! `fetchNext`/`markHandled` until `isFinished()` reports true. Talks to the
//! local on-disk emulator unless `CRAWL_QUEUE_API_BASE_URL`/
//! `CRAWL_QUEUE_API_TOKEN` are set in the environment.

use crawl_queue_coordinator::client::local::{purge_default_on_startup, LocalClient};
use crawl_queue_coordinator::config;
use crawl_queue_coordinator::logging;
use crawl_queue_coordinator::storage;
use crawl_queue_coordinator::storage::RemoteCredentials;
use crawl_queue_coordinator::Request;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging();

    let cfg = config::load_config();
    let use_remote = cfg.storage.force_cloud || RemoteCredentials::from_env().is_some();

    if !use_remote {
        // Process start: purge the default queue's local storage, preserving
        // any well-known input files under the default key-value store, and
        // clearing out the default request queue itself.
        let kv_store_dir = std::path::Path::new(&cfg.storage.local_storage_dir)
            .join("key_value_stores")
            .join("default");
        purge_default_on_startup(&kv_store_dir).await?;

        let default_queue = LocalClient::open(
            cfg.storage.local_storage_dir.clone(),
            cfg.storage.default_request_queue_id.clone(),
            cfg.storage.write_metadata,
        )
        .await?;
        default_queue.purge().await?;
    }

    let registry = storage::default_registry();
    let queue = storage::open(registry, None, None, false, &cfg).await?;

    if queue.is_empty().await {
        log::info!("queue is empty, seeding a couple of URLs");
        queue.add(Request::new("https://example.com/"), false).await?;
        queue.add(Request::new("https://example.com/about"), false).await?;
    }

    loop {
        if queue.is_finished().await {
            log::info!("queue drained");
            break;
        }

        match queue.fetch_next().await? {
            Some(mut request) => {
                log::info!("handling {}", request.url);
                // ... crawl logic would go here ...
                request.handled_at = Some(chrono::Utc::now());
                queue.mark_handled(request).await?;
            }
            None => {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        }
    }

    Ok(())
}
