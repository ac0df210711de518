//! A concurrency substrate for server-class Linux applications: a fixed
//! thread-pool [`Executor`] for short-running work items and an
//! [`AsyncIo`] engine driving kernel completion-based I/O (`io_uring`),
//! wired so that an I/O completion can schedule a CPU-bound follow-up on
//! a worker thread without a user-space polling hop.
//!
//! All cross-thread handoff rides on bounded lock-free [`ring`]s;
//! shutdown is cooperative and coordinated through the [`Signal`]
//! controller's latch and rendezvous counter.
//!
//! Linux ≥ 6.8 on x86-64 or aarch64 only.

pub mod ring;

pub mod signal;
pub use signal::Signal;

pub mod executor;
pub use executor::{Executor, SubmitError};

pub mod uring;
pub use uring::{AsyncIo, IoBuffer, IoError, IoToken, Lifecycle, ShutdownHow, SqeMode, StatxReply};

#[cfg(test)]
pub(crate) mod test_utils;
