//! Once-until-success guards.
//!
//! Unlike [`std::sync::Once`], a failed attempt does not count: the action is retried by
//! the next caller until one attempt succeeds, after which every call is a no-op.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Runs a fallible action until it succeeds once.
///
/// Attempts are serialized; after the first success no further attempt is made.
#[derive(Debug, Default)]
pub struct SuccessOnce {
    done: AtomicBool,
    lock: Mutex<()>,
}

impl SuccessOnce {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            lock: parking_lot::const_mutex(()),
        }
    }

    /// Runs `f` unless a previous call already succeeded.
    ///
    /// Returns `f`'s error on failure; the next call will try again.
    pub fn call<F, E>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.lock.lock();
        if self.done.load(Ordering::Relaxed) {
            return Ok(());
        }
        f()?;
        self.done.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Async flavour of [`SuccessOnce`]; waiting callers yield instead of blocking a thread.
#[derive(Debug, Default)]
pub struct AsyncSuccessOnce {
    done: AtomicBool,
    lock: tokio::sync::Mutex<()>,
}

impl AsyncSuccessOnce {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn call<F, Fut, E>(&self, f: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        if self.done.load(Ordering::Relaxed) {
            return Ok(());
        }
        f().await?;
        self.done.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}
