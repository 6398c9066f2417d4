//! A small cancellation context passed to close callbacks.
//!
//! A [`Context`] bundles an optional [`CancellationToken`], an optional deadline and a set
//! of typed values. Deriving a context never mutates the parent: values are shared
//! copy-on-write and child tokens are cancelled together with their parent.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

type Values = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

#[derive(Clone, Default)]
pub struct Context {
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
    values: Arc<Values>,
}

impl Context {
    /// A context that is never cancelled, has no deadline and carries no values.
    pub fn background() -> Self {
        Self::default()
    }

    /// Wraps an existing token; the context is cancelled when the token is.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            ..Self::default()
        }
    }

    /// Returns a copy of this context carrying `value`, keyed by its type.
    ///
    /// A value of the same type stored on an ancestor is shadowed.
    pub fn with_value<T>(&self, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let mut values = Values::clone(&self.values);
        values.insert(TypeId::of::<T>(), Arc::new(value));
        Self {
            cancel: self.cancel.clone(),
            deadline: self.deadline,
            values: Arc::new(values),
        }
    }

    pub fn value<T>(&self) -> Option<&T>
    where
        T: Any + Send + Sync,
    {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Derives a cancellable child. Cancelling the returned token cancels the child only;
    /// cancelling this context cancels both.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = match &self.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let ctx = Self {
            cancel: Some(token.clone()),
            deadline: self.deadline,
            values: Arc::clone(&self.values),
        };
        (ctx, token)
    }

    /// Derives a cancellable child that is also considered cancelled once `deadline` passes.
    /// An earlier deadline inherited from this context is kept.
    pub fn with_deadline(&self, deadline: Instant) -> (Self, CancellationToken) {
        let (mut ctx, token) = self.with_cancel();
        ctx.deadline = Some(match self.deadline {
            Some(inherited) if inherited < deadline => inherited,
            _ => deadline,
        });
        (ctx, token)
    }

    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancellationToken) {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a context with the same values but no cancellation and no deadline.
    pub fn without_cancel(&self) -> Self {
        Self {
            cancel: None,
            deadline: None,
            values: Arc::clone(&self.values),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether this context can ever become cancelled.
    pub fn is_cancellable(&self) -> bool {
        self.cancel.is_some() || self.deadline.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        let expired = self
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline);
        expired
            || self
                .cancel
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
    }

    /// Completes once the context is cancelled or its deadline passes.
    /// Never completes for a context that is not cancellable.
    pub async fn cancelled(&self) {
        let token = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match self.deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = token => {},
            _ = deadline => {},
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancellable", &self.cancel.is_some())
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .field("values", &self.values.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct RequestId(&'static str);

    #[test]
    fn values_are_inherited_and_shadowed() {
        let root = Context::background().with_value(RequestId("a"));
        let child = root.with_value(RequestId("b")).with_value(7u32);

        assert_eq!(root.value::<RequestId>(), Some(&RequestId("a")));
        assert_eq!(child.value::<RequestId>(), Some(&RequestId("b")));
        assert_eq!(child.value::<u32>(), Some(&7));
        assert!(root.value::<u32>().is_none());
    }

    #[test]
    fn cancelling_parent_cancels_child() {
        let (parent, parent_token) = Context::background().with_cancel();
        let (child, child_token) = parent.with_cancel();

        child_token.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let (sibling, _) = parent.with_cancel();
        parent_token.cancel();
        assert!(parent.is_cancelled());
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn without_cancel_keeps_values_only() {
        let (ctx, token) = Context::background()
            .with_value(RequestId("x"))
            .with_timeout(Duration::from_secs(60));
        token.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.deadline().is_some());

        let detached = ctx.without_cancel();
        assert!(!detached.is_cancelled());
        assert!(!detached.is_cancellable());
        assert!(detached.deadline().is_none());
        assert_eq!(detached.value::<RequestId>(), Some(&RequestId("x")));
    }

    #[test]
    fn earlier_inherited_deadline_wins() {
        let now = Instant::now();
        let (outer, _) = Context::background().with_deadline(now + Duration::from_secs(1));
        let (inner, _) = outer.with_deadline(now + Duration::from_secs(10));
        assert_eq!(inner.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn deadline_expiry_completes_cancelled() {
        let (ctx, _token) = Context::background().with_timeout(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(2), ctx.cancelled())
            .await
            .expect("deadline should cancel the context");
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn background_is_never_cancelled() {
        let ctx = Context::background();
        let res = tokio::time::timeout(Duration::from_millis(50), ctx.cancelled()).await;
        assert!(res.is_err());
        assert!(!ctx.is_cancellable());
    }
}
