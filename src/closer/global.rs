//! Process-wide default closer.
//!
//! Convenient for binaries that want a single shutdown point without threading a handle
//! through every subsystem. It is shared process state: libraries and tests should prefer
//! their own [`Closer`].

use std::future::Future;
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio_util::sync::WaitForCancellationFutureOwned;

use super::Closer;
use crate::context::Context;
use crate::error::JoinedError;

static GLOBAL: Lazy<Closer> = Lazy::new(|| Closer::new(Context::background()));

/// The process-wide closer, created on first use with [`Context::background`].
pub fn global() -> &'static Closer {
    &GLOBAL
}

pub fn set_context(ctx: Context) {
    GLOBAL.set_context(ctx);
}

pub fn add<F, Fut>(f: F)
where
    F: FnOnce(Context) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    GLOBAL.add(f);
}

pub fn done() -> WaitForCancellationFutureOwned {
    GLOBAL.done()
}

pub fn err() -> Option<Arc<JoinedError>> {
    GLOBAL.err()
}

pub fn close() {
    GLOBAL.close();
}

pub async fn close_all() {
    GLOBAL.close_all().await;
}
