use super::Signal;

/// Optional triggers for [`Closer::with_options`](super::Closer::with_options).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloserOptions {
    cancel_on_context: bool,
    signals: Vec<Signal>,
}

impl CloserOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the closer when its base context is cancelled.
    #[must_use]
    pub fn with_context_cancel(mut self) -> Self {
        self.cancel_on_context = true;
        self
    }

    /// Trigger the closer when any of `signals` arrives. Implies
    /// [`with_context_cancel`](Self::with_context_cancel); repeated calls accumulate.
    #[must_use]
    pub fn with_signals<I>(mut self, signals: I) -> Self
    where
        I: IntoIterator<Item = Signal>,
    {
        self.cancel_on_context = true;
        self.signals.extend(signals);
        self
    }

    pub fn cancels_on_context(&self) -> bool {
        self.cancel_on_context
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }
}
