//! Asynchronous I/O engine: a single-issuer user-space driver over the
//! kernel's `io_uring` submission/completion rings.
//!
//! Producers on any thread stage operation records through a lock-free
//! MPSC ring and rouse the reaper by raising the wake signal; the reaper
//! (the one thread running [`AsyncIo::event_loop`]) owns all kernel ring
//! state, flushes staged records into the SQ, and dispatches completion
//! callbacks from the CQ.

pub(crate) mod sys;

pub(crate) mod version;

pub mod errors;
pub use errors::IoError;

pub mod buffer;
pub use buffer::{IoBuffer, StatxReply};

pub mod op;
pub use op::{Callback, ShutdownHow, SqeMode};

pub mod engine;
pub use engine::{AsyncIo, Builder, IoToken, Lifecycle};
