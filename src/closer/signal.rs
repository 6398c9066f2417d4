use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::de::{self, Deserializer};

#[cfg(unix)]
use signal_hook_tokio::Signals;

use crate::error::Error;

/// OS termination signals a [`Closer`](super::Closer) can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
    User1,
    User2,
}

impl Signal {
    const ALL: &'static [Self] = &[
        Self::Interrupt,
        Self::Terminate,
        Self::Hangup,
        Self::Quit,
        Self::User1,
        Self::User2,
    ];
    const NAMES: &'static [&'static str] =
        &["SIGINT", "SIGTERM", "SIGHUP", "SIGQUIT", "SIGUSR1", "SIGUSR2"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup => "SIGHUP",
            Self::Quit => "SIGQUIT",
            Self::User1 => "SIGUSR1",
            Self::User2 => "SIGUSR2",
        }
    }

    #[cfg(unix)]
    fn raw(self) -> libc::c_int {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
        match self {
            Self::Interrupt => SIGINT,
            Self::Terminate => SIGTERM,
            Self::Hangup => SIGHUP,
            Self::Quit => SIGQUIT,
            Self::User1 => SIGUSR1,
            Self::User2 => SIGUSR2,
        }
    }

    #[cfg(unix)]
    fn from_raw(raw: libc::c_int) -> Option<Self> {
        Self::ALL.iter().copied().find(|signal| signal.raw() == raw)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `SIGTERM`, `TERM` or `term`.
impl FromStr for Signal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(upper.as_str());
        Self::ALL
            .iter()
            .find(|signal| &signal.as_str()[3..] == name)
            .copied()
            .ok_or_else(|| format!("unknown signal: {s}"))
    }
}

impl<'de> Deserialize<'de> for Signal {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| de::Error::unknown_variant(&raw, Self::NAMES))
    }
}

/// Subscriptions for a set of signals.
///
/// While any set holds a signal, its deliveries are routed to the sets listening for it.
/// Once the last set holding a signal is dropped, later deliveries get the signal's
/// default action again, e.g. a second Ctrl-C terminates the process.
#[cfg(unix)]
pub(crate) struct SignalSet {
    held: Vec<Signal>,
    stream: Option<Signals>,
}

#[cfg(unix)]
impl SignalSet {
    /// Subscribes to every distinct signal in `signals`.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn listen(signals: &[Signal]) -> Result<Self, Error> {
        let mut set = Self {
            held: Vec::with_capacity(signals.len()),
            stream: None,
        };
        for &signal in signals {
            if set.held.contains(&signal) {
                continue;
            }
            disposition::hold(signal)?;
            set.held.push(signal);

            let subscribed = match set.stream.as_ref().map(Signals::handle) {
                Some(handle) => handle.add_signal(signal.raw()),
                None => Signals::new([signal.raw()]).map(|stream| set.stream = Some(stream)),
            };
            subscribed.map_err(|source| Error::Signal { signal, source })?;
        }
        Ok(set)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Waits for the first delivered signal. Pends forever on an empty set.
    pub(crate) async fn recv(&mut self) -> Option<Signal> {
        use futures::StreamExt;

        let Some(stream) = self.stream.as_mut() else {
            return std::future::pending().await;
        };
        while let Some(raw) = stream.next().await {
            if let Some(signal) = Signal::from_raw(raw) {
                return Some(signal);
            }
        }
        None
    }
}

#[cfg(unix)]
impl Drop for SignalSet {
    fn drop(&mut self) {
        if let Some(stream) = &self.stream {
            stream.handle().close();
        }
        for &signal in &self.held {
            disposition::release(signal);
        }
    }
}

/// Process-wide bookkeeping of which signals are held by a live [`SignalSet`].
///
/// The first hold of a signal installs a handler that runs the default action whenever
/// its flag is set. The flag is cleared while at least one set holds the signal.
#[cfg(unix)]
mod disposition {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use once_cell::sync::Lazy;
    use parking_lot::Mutex;

    use super::Signal;
    use crate::error::Error;

    struct Holders {
        default_action: Arc<AtomicBool>,
        count: usize,
    }

    static HOLDERS: Lazy<Mutex<HashMap<Signal, Holders>>> = Lazy::new(Default::default);

    pub(super) fn hold(signal: Signal) -> Result<(), Error> {
        let mut holders = HOLDERS.lock();
        if let Some(entry) = holders.get_mut(&signal) {
            entry.count += 1;
            entry.default_action.store(false, Ordering::SeqCst);
            return Ok(());
        }

        let default_action = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register_conditional_default(
            signal.raw(),
            Arc::clone(&default_action),
        )
        .map_err(|source| Error::Signal { signal, source })?;
        holders.insert(
            signal,
            Holders {
                default_action,
                count: 1,
            },
        );
        Ok(())
    }

    pub(super) fn release(signal: Signal) {
        let mut holders = HOLDERS.lock();
        if let Some(entry) = holders.get_mut(&signal) {
            entry.count = entry.count.saturating_sub(1);
            if entry.count == 0 {
                entry.default_action.store(true, Ordering::SeqCst);
            }
        }
    }

    #[cfg(test)]
    pub(super) fn is_default(signal: Signal) -> bool {
        HOLDERS
            .lock()
            .get(&signal)
            .is_none_or(|entry| entry.default_action.load(Ordering::SeqCst))
    }
}

/// Only Ctrl-C is observable off Unix.
#[cfg(not(unix))]
pub(crate) struct SignalSet {
    interrupt: bool,
}

#[cfg(not(unix))]
impl SignalSet {
    pub(crate) fn listen(signals: &[Signal]) -> Result<Self, Error> {
        if let Some(&unsupported) = signals.iter().find(|s| **s != Signal::Interrupt) {
            return Err(Error::UnsupportedSignal(unsupported));
        }
        Ok(Self {
            interrupt: !signals.is_empty(),
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.interrupt
    }

    pub(crate) async fn recv(&mut self) -> Option<Signal> {
        if !self.interrupt {
            return std::future::pending().await;
        }
        tokio::signal::ctrl_c().await.ok()?;
        Some(Signal::Interrupt)
    }
}
