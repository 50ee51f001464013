//! Counter of in-flight tasks that can be awaited until it drains to zero.
//!
//! The relay uses it for connection tasks (graceful shutdown) and for the
//! two pump tasks behind each transcoding filter.
//!
//! # Example
//!
//! ```
//! use voice_relay::WaitGroup;
//!
//! #[tokio::main]
//! async fn main() {
//!     let wg = WaitGroup::new();
//!
//!     for _ in 0..3 {
//!         let guard = wg.add();
//!         tokio::spawn(async move {
//!             let _guard = guard;
//!         });
//!     }
//!
//!     wg.wait().await;
//!     assert_eq!(wg.count(), 0);
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Waits for a set of tasks, each holding a [`WaitGroupGuard`], to finish.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Default)]
struct WaitGroupInner {
    counter: AtomicUsize,
    notify: Notify,
}

/// Decrements its [`WaitGroup`] when dropped, including on panic.
pub struct WaitGroupGuard {
    inner: Arc<WaitGroupInner>,
}

impl Drop for WaitGroupGuard {
    fn drop(&mut self) {
        if self.inner.counter.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.notify.notify_waiters();
        }
    }
}

impl WaitGroup {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one task and returns its guard.
    pub fn add(&self) -> WaitGroupGuard {
        self.inner.counter.fetch_add(1, Ordering::SeqCst);
        WaitGroupGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns the number of live guards.
    pub fn count(&self) -> usize {
        self.inner.counter.load(Ordering::SeqCst)
    }

    /// Waits until every guard has been dropped.
    pub async fn wait(&self) {
        loop {
            // Register interest before checking, so a drop between the check
            // and the await is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}
