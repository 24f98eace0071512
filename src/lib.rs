//! A client-side head-window coordinator for a distributed, eventually
//! consistent crawl request queue.
//!
//! A remote service holds the authoritative queue of URLs to crawl; this
//! crate sits between application code and that service, adding a
//! prefetched local "head window," in-progress tracking, deduplication
//! caches, and a consistency-aware termination protocol that converges
//! despite replication lag in the backing store.
//!
//! Library code logs through `tracing`; the [`logging`] module's
//! `simplelog`-based setup is only for binaries (see `examples_bin/`).

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod queue;
pub mod request_id;
pub mod storage;
pub mod timers;

pub use error::{Error, Result};
pub use model::Request;
pub use queue::RequestQueue;
