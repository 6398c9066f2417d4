use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

use crate::closer::Signal;

/// Library error type for closer operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A close callback panicked instead of returning.
    #[error("close callback panicked: {0}")]
    CallbackPanicked(String),

    /// A close callback task was cancelled before it completed, e.g. by runtime shutdown.
    #[error("close callback was aborted before completion")]
    CallbackAborted,

    /// Subscribing to an OS signal failed.
    #[error("failed to listen for {signal}: {source}")]
    Signal {
        signal: Signal,
        #[source]
        source: std::io::Error,
    },

    /// Watching for context cancellation or signals needs a Tokio runtime.
    #[error("closer triggers require a Tokio runtime")]
    NoRuntime,

    /// The signal cannot be observed on this platform.
    #[error("signal {0} is not supported on this platform")]
    UnsupportedSignal(Signal),

    /// Configuration is well-formed YAML but semantically invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// YAML/serde configuration error.
    #[error(transparent)]
    Config(#[from] serde_yaml::Error),
}

/// Every error returned by the close callbacks of one shutdown.
///
/// Errors keep their concrete types, so callers can test whether a known error is
/// among them with [`JoinedError::contains`], [`JoinedError::is`] or [`JoinedError::find`].
/// Each check walks the full source chain of every joined error.
#[derive(Debug)]
pub struct JoinedError {
    errors: Vec<anyhow::Error>,
}

impl JoinedError {
    /// Joins `errors`, returning `None` when there is nothing to join.
    pub fn new<I>(errors: I) -> Option<Self>
    where
        I: IntoIterator<Item = anyhow::Error>,
    {
        let errors: Vec<_> = errors.into_iter().collect();
        if errors.is_empty() {
            None
        } else {
            Some(Self { errors })
        }
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &anyhow::Error> {
        self.errors.iter()
    }

    /// Whether an error equal to `target` was joined.
    pub fn contains<E>(&self, target: &E) -> bool
    where
        E: StdError + PartialEq + 'static,
    {
        self.causes()
            .any(|cause| cause.downcast_ref::<E>().is_some_and(|err| err == target))
    }

    /// Whether any joined error is of type `E`.
    pub fn is<E>(&self) -> bool
    where
        E: StdError + 'static,
    {
        self.find::<E>().is_some()
    }

    /// First joined error of type `E`, in completion order.
    pub fn find<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.causes().find_map(|cause| cause.downcast_ref::<E>())
    }

    fn causes(&self) -> impl Iterator<Item = &(dyn StdError + 'static)> {
        self.errors.iter().flat_map(|err| err.chain())
    }
}

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, err) in self.errors.iter().enumerate() {
            if idx > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err:#}")?;
        }
        Ok(())
    }
}

impl StdError for JoinedError {}

impl<'a> IntoIterator for &'a JoinedError {
    type Item = &'a anyhow::Error;
    type IntoIter = std::slice::Iter<'a, anyhow::Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context as _, anyhow};

    #[derive(Debug, Error, PartialEq)]
    #[error("step {0} failed")]
    struct StepError(u32);

    #[derive(Debug, Error)]
    #[error("disk full")]
    struct DiskFull;

    #[test]
    fn empty_join_is_none() {
        assert!(JoinedError::new(Vec::new()).is_none());
    }

    #[test]
    fn contains_matches_by_value() {
        let joined = JoinedError::new([
            anyhow::Error::from(StepError(1)),
            anyhow::Error::from(StepError(2)),
        ])
        .unwrap();
        assert!(joined.contains(&StepError(1)));
        assert!(joined.contains(&StepError(2)));
        assert!(!joined.contains(&StepError(3)));
        assert_eq!(joined.len(), 2);
    }

    #[test]
    fn matching_sees_through_context() {
        let wrapped = Err::<(), _>(DiskFull).context("flushing cache").unwrap_err();
        let joined = JoinedError::new([wrapped, anyhow!("plain")]).unwrap();
        assert!(joined.is::<DiskFull>());
        assert!(joined.find::<StepError>().is_none());
    }

    #[test]
    fn display_lists_each_error_on_its_own_line() {
        let joined = JoinedError::new([anyhow::Error::from(StepError(1)), anyhow!("boom")])
            .expect("two errors were joined");
        assert_eq!(joined.to_string(), "step 1 failed\nboom");
    }
}
