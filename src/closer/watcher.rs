use std::sync::Weak;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::signal::SignalSet;
use super::{Closer, Inner};
use crate::context::Context;

/// Background task that triggers the closer on context cancellation or signal delivery.
///
/// Exits without triggering once `triggered` fires, which happens on the first trigger by
/// any path and when the closer is dropped. Signal subscriptions are released on exit, so
/// signals no other closer listens for get their default action again.
pub(super) async fn watch(
    closer: Weak<Inner>,
    watched: Context,
    triggered: CancellationToken,
    signal_cancel: Option<CancellationToken>,
    mut signals: SignalSet,
) {
    tokio::select! {
        _ = triggered.cancelled() => {
            debug!("closer already triggered; watcher exiting");
            return;
        }
        received = signals.recv() => {
            if let Some(signal) = received {
                info!(%signal, "signal received; closing");
            }
            if let Some(token) = &signal_cancel {
                token.cancel();
            }
        }
        _ = watched.cancelled() => {
            info!("context cancelled; closing");
        }
    }
    drop(signals);

    match closer.upgrade() {
        Some(inner) => Closer { inner }.close(),
        None => debug!("closer dropped before trigger; watcher exiting"),
    }
}
