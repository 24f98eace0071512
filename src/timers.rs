//! Deferred-callback helper.
//!
//! Consistency delays (after reclaim, and after `fetchNext` returns absent
//! for a missing request) originate as fire-and-forget async tasks. Each
//! one is a timer that, once it fires, re-checks membership before mutating
//! — cancellation (instance teardown) must never leave the coordinator
//! inconsistent, so the closure passed to [`defer`] is expected to do that
//! check itself rather than assume its precondition still holds.

use std::future::Future;
use std::time::Duration;

/// Spawn `fut` to run after `delay`, detached from the caller. Dropping the
/// returned handle does not cancel the task — tasks here are meant to
/// outlive the call that scheduled them.
pub fn defer<F>(delay: Duration, fut: F) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        fut.await;
    })
}
