//! Shutdown coordination primitives.
//!
//! - [`Closer`] collects close callbacks from independent subsystems and runs them exactly
//!   once, on request, on context cancellation or on an OS signal.
//! - [`SuccessOnce`] and [`AsyncSuccessOnce`] run an action until it succeeds once.

pub mod closer;
pub mod config;
pub mod context;
pub mod error;
pub mod sync;

pub use closer::{CloseFuture, Closer, CloserOptions, Signal};
pub use context::Context;
pub use error::{Error, JoinedError};
pub use sync::{AsyncSuccessOnce, SuccessOnce};
