use crate::signal::Signal;
use crate::uring::engine::{AsyncIo, Builder};
use crate::uring::errors::IoError;
use std::io;

/// Build an engine, or skip the test when the environment cannot host
/// one (old kernel, or a sandbox seccomp policy denying `io_uring_setup`).
pub(crate) fn try_engine<const N: usize>(builder: Builder, signal: &Signal) -> Option<AsyncIo<N>> {
    match builder.build::<N>(signal.clone()) {
        Ok(io) => Some(io),
        Err(IoError::Unsupported(reason)) => {
            eprintln!("skipping io_uring test: {reason}");
            None
        }
        Err(IoError::Sys(e)) if io_uring_denied(&e) => {
            eprintln!("skipping io_uring test: {e}");
            None
        }
        Err(e) => panic!("engine init failed: {e}"),
    }
}

fn io_uring_denied(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ENOSYS) | Some(libc::EPERM) | Some(libc::EACCES) | Some(libc::ENOMEM)
    )
}
