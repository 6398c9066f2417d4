//! Shutdown coordination for independently developed subsystems.
//!
//! Subsystems register close callbacks with [`Closer::add`]. The first trigger, whether an
//! explicit [`Closer::close`]/[`Closer::close_all`], cancellation of the base context, or a
//! listened-for OS signal, freezes the registered set and runs every callback concurrently
//! on its own Tokio task. Once all of them returned, the joined failures become visible
//! through [`Closer::err`] and [`Closer::done`] resolves.
//!
//! ```no_run
//! use closer::{Closer, CloserOptions, Context, Signal};
//!
//! # async fn example() -> Result<(), closer::Error> {
//! let options = CloserOptions::new().with_signals([Signal::Interrupt, Signal::Terminate]);
//! let (_ctx, closer) = Closer::with_options(Context::background(), options)?;
//!
//! closer.add(|_ctx| async move {
//!     // flush buffers, close connections...
//!     Ok(())
//! });
//!
//! closer.done().await;
//! if let Some(err) = closer.err() {
//!     eprintln!("shutdown finished with errors:\n{err}");
//! }
//! # Ok(())
//! # }
//! ```

mod global;
mod options;
mod signal;
mod watcher;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Once, OnceLock};
use std::thread;
use std::time::Instant;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::{self, Handle};
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub use global::{add, close, close_all, done, err, global, set_context};
pub use options::CloserOptions;
pub use signal::Signal;

use crate::context::Context;
use crate::error::{Error, JoinedError};
use signal::SignalSet;

/// Future returned by a close callback.
pub type CloseFuture = BoxFuture<'static, anyhow::Result<()>>;

type CloseFn = Box<dyn FnOnce(Context) -> CloseFuture + Send>;

/// A registered callback; taken exactly once when the closer runs.
struct Callback(Mutex<Option<CloseFn>>);

impl Callback {
    fn take(&self) -> Option<CloseFn> {
        self.0.lock().take()
    }
}

/// Immutable snapshot of the registered callbacks.
enum Registry {
    Open(Vec<Arc<Callback>>),
    Frozen,
}

/// Handle to a shutdown coordinator. Clones share the same state.
#[derive(Clone)]
pub struct Closer {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: ArcSwap<Context>,
    registry: ArcSwap<Registry>,
    trigger: Once,
    triggered: CancellationToken,
    outcome: OnceLock<Option<Arc<JoinedError>>>,
    done: CancellationToken,
    tasks: TaskTracker,
}

impl Closer {
    /// Creates a closer that only runs on an explicit [`close`](Self::close) or
    /// [`close_all`](Self::close_all). Spawns nothing.
    pub fn new(ctx: Context) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx: ArcSwap::from_pointee(ctx),
                registry: ArcSwap::from_pointee(Registry::Open(Vec::new())),
                trigger: Once::new(),
                triggered: CancellationToken::new(),
                outcome: OnceLock::new(),
                done: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Creates a closer with additional triggers.
    ///
    /// Returns the context that callers should use for the rest of the program: when
    /// signals are requested it is a child of `ctx` that is cancelled by the first signal,
    /// otherwise it is `ctx` itself.
    ///
    /// Enabling a trigger outside a Tokio runtime fails with [`Error::NoRuntime`].
    pub fn with_options(ctx: Context, options: CloserOptions) -> Result<(Context, Self), Error> {
        let closer = Self::new(ctx.clone());
        if !options.cancels_on_context() {
            return Ok((ctx, closer));
        }
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let signals = SignalSet::listen(options.signals())?;
        if signals.is_empty() && !ctx.is_cancellable() {
            debug!("base context can never be cancelled; not starting closer watcher");
            return Ok((ctx, closer));
        }
        let (watched, signal_cancel) = if signals.is_empty() {
            (ctx, None)
        } else {
            let (derived, token) = ctx.with_cancel();
            (derived, Some(token))
        };
        debug!(signals = ?options.signals(), "starting closer watcher");

        closer.inner.tasks.spawn_on(
            watcher::watch(
                Arc::downgrade(&closer.inner),
                watched.clone(),
                closer.inner.triggered.clone(),
                signal_cancel,
                signals,
            ),
            &runtime,
        );
        Ok((watched, closer))
    }

    /// Replaces the context handed to callbacks. The value current at trigger time wins.
    pub fn set_context(&self, ctx: Context) {
        self.inner.ctx.store(Arc::new(ctx));
    }

    /// Registers a close callback.
    ///
    /// Lock-free: the snapshot is copied with the callback appended and swapped in with a
    /// compare-and-swap, retrying on contention. Callbacks added after the closer was
    /// triggered are dropped without being run.
    pub fn add<F, Fut>(&self, f: F)
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let close: CloseFn = Box::new(move |ctx: Context| -> CloseFuture { Box::pin(f(ctx)) });
        let callback = Arc::new(Callback(Mutex::new(Some(close))));

        let previous = self.inner.registry.rcu(|current| match &**current {
            Registry::Open(callbacks) => {
                let mut next = Vec::with_capacity(callbacks.len() + 1);
                next.extend(callbacks.iter().cloned());
                next.push(Arc::clone(&callback));
                Registry::Open(next)
            }
            Registry::Frozen => Registry::Frozen,
        });
        if matches!(*previous, Registry::Frozen) {
            debug!("closer already triggered; dropping late callback");
        }
    }

    /// Future that resolves once every callback has finished and [`err`](Self::err) is final.
    pub fn done(&self) -> WaitForCancellationFutureOwned {
        self.inner.done.clone().cancelled_owned()
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Whether the closer has been triggered, possibly still running callbacks.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.is_cancelled()
    }

    /// The joined callback failures, once [`done`](Self::done) has resolved.
    ///
    /// `None` both before completion and when no callback failed.
    pub fn err(&self) -> Option<Arc<JoinedError>> {
        if !self.inner.done.is_cancelled() {
            return None;
        }
        self.inner.outcome.get().cloned().flatten()
    }

    /// Triggers the closer without waiting. Only the first trigger has any effect.
    ///
    /// Callbacks run on the current Tokio runtime. Triggered from a thread without one,
    /// they run on a dedicated thread with its own single-threaded runtime.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.trigger.call_once(|| {
            let runtime = Handle::try_current();
            inner.triggered.cancel();
            let ctx = inner.ctx.load().without_cancel();
            let callbacks = match &*inner.registry.swap(Arc::new(Registry::Frozen)) {
                Registry::Open(callbacks) => callbacks.clone(),
                Registry::Frozen => Vec::new(),
            };
            info!(callbacks = callbacks.len(), "closer triggered");

            let total = callbacks.len();
            let run = inner.tasks.track_future(Arc::clone(inner).run(ctx, callbacks));
            match runtime {
                Ok(handle) => drop(handle.spawn(run)),
                Err(_) => inner.run_detached(run, total),
            }
        });
    }

    /// Triggers the closer and waits for it to finish.
    ///
    /// Dropping the returned future does not interrupt the callbacks.
    pub async fn close_all(&self) {
        self.close();
        self.inner.done.cancelled().await;
    }

    /// Waits for completion and for the closer's own background tasks to exit.
    pub async fn finished(&self) {
        self.inner.done.cancelled().await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

impl Inner {
    async fn run(self: Arc<Self>, ctx: Context, callbacks: Vec<Arc<Callback>>) {
        let started = Instant::now();
        let mut running = JoinSet::new();
        for callback in callbacks {
            if let Some(close) = callback.take() {
                running.spawn(close(ctx.clone()));
            }
        }
        let total = running.len();

        let mut errors = Vec::new();
        while let Some(joined) = running.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(err) if err.is_panic() => {
                    Err(Error::CallbackPanicked(panic_message(err.into_panic())).into())
                }
                Err(_) => Err(Error::CallbackAborted.into()),
            };
            if let Err(err) = result {
                warn!(error = ?err, "close callback failed");
                errors.push(err);
            }
        }

        self.finish(total, errors, started);
    }

    /// Drives `run` to completion on a new thread owning a current-thread runtime.
    ///
    /// Never panics: if the thread or runtime cannot be created, the failure becomes the
    /// outcome and `done` still resolves.
    fn run_detached<F>(self: &Arc<Self>, run: F, total: usize)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("no Tokio runtime on the triggering thread; closing on a dedicated thread");
        let started = Instant::now();
        let inner = Arc::clone(self);
        let spawned = thread::Builder::new().name("closer".into()).spawn(move || {
            match runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime.block_on(run),
                Err(err) => {
                    let err = anyhow::Error::from(Error::Io(err))
                        .context("starting closer runtime");
                    inner.finish(total, vec![err], started);
                }
            }
        });
        if let Err(err) = spawned {
            let err = anyhow::Error::from(Error::Io(err)).context("starting closer thread");
            self.finish(total, vec![err], started);
        }
    }

    fn finish(&self, total: usize, errors: Vec<anyhow::Error>, started: Instant) {
        let outcome = JoinedError::new(errors).map(Arc::new);
        match &outcome {
            Some(err) => error!(
                callbacks = total,
                failed = err.len(),
                elapsed = ?started.elapsed(),
                "closer finished with errors"
            ),
            None => info!(callbacks = total, elapsed = ?started.elapsed(), "closer finished"),
        }
        // the outcome must be visible before anyone observes `done`
        let _ = self.outcome.set(outcome);
        self.done.cancel();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.triggered.cancel();
    }
}

impl fmt::Debug for Closer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closer")
            .field("triggered", &self.is_triggered())
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
