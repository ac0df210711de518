//! Process shutdown latch, wake signal plumbing, and the worker-exit
//! rendezvous.
//!
//! Terminate signals (SIGINT, SIGTERM) latch a shutdown flag from an
//! async-signal-safe handler; components poll the latch cooperatively.
//! The wake signal (SIGUSR1) is blocked in the process mask and consumed
//! exclusively through the I/O engine's signal-fd, never delivered to a
//! handler.

use anyhow::Result;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal as Signo};
use nix::unistd::Pid;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

use crate::executor::Executor;

/// How long `terminate` sleeps between rendezvous checks.
const RENDEZVOUS_POLL: Duration = Duration::from_millis(500);

struct LatchState {
    /// 0 while no shutdown is pending, otherwise the received signal
    /// number.
    signal: AtomicI32,

    /// Incremented by each worker as it exits.
    participants: AtomicU32,
}

impl LatchState {
    const fn new() -> Self {
        Self {
            signal: AtomicI32::new(0),
            participants: AtomicU32::new(0),
        }
    }
}

static INSTALLED: AtomicBool = AtomicBool::new(false);
static GLOBAL: LatchState = LatchState::new();

// Async-signal-safe: a single relaxed store. No allocation, no locks, no
// formatted logging; anything worth reporting is logged by the reaper
// after it observes the latch.
extern "C" fn on_terminate(signo: libc::c_int) {
    GLOBAL.signal.store(signo, Ordering::Relaxed);
}

#[derive(Clone)]
enum Latch {
    /// Backed by the process-wide static the signal handler writes.
    Global,

    /// Private latch for tests and embedders with their own signal
    /// strategy; shares no global state, so tests don't serialize.
    Local(Arc<LatchState>),
}

/// Handle to the process shutdown state.
#[derive(Clone)]
pub struct Signal {
    latch: Latch,
}

impl Signal {
    /// Install the terminate-signal handlers, block the wake signal, and
    /// return the process-wide handle.
    ///
    /// Must run before any worker or reaper thread is spawned: the blocked
    /// wake mask is inherited at thread creation, which is what keeps
    /// SIGUSR1 out of every handler and inside the signal-fd.
    ///
    /// # Panics
    ///
    /// Panics on a second call; double-initialization of the process
    /// singleton is unrecoverable.
    pub fn init() -> Result<Self> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            panic!("Signal::init called twice");
        }

        // No SA_RESTART: a terminate signal must interrupt the reaper's
        // io_uring_enter wait with EINTR so the latch is noticed.
        let action = SigAction::new(
            SigHandler::Handler(on_terminate),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            signal::sigaction(Signo::SIGINT, &action)?;
            signal::sigaction(Signo::SIGTERM, &action)?;
        }

        Self::block_wake_signal()?;

        Ok(Self { latch: Latch::Global })
    }

    /// A latch with no handler installation and no global state. The
    /// embedder (or test) drives it through [`Signal::latch`].
    pub fn detached() -> Self {
        Self {
            latch: Latch::Local(Arc::new(LatchState::new())),
        }
    }

    /// Block SIGUSR1 in the calling thread's mask so it can only be
    /// consumed via a signal-fd. Threads spawned afterwards inherit the
    /// mask.
    pub(crate) fn block_wake_signal() -> Result<()> {
        let mut wake = SigSet::empty();
        wake.add(Signo::SIGUSR1);
        wake.thread_block()?;
        Ok(())
    }

    fn state(&self) -> &LatchState {
        match &self.latch {
            Latch::Global => &GLOBAL,
            Latch::Local(state) => state,
        }
    }

    /// The latched signal number, if shutdown is pending.
    pub fn raised(&self) -> Option<i32> {
        match self.state().signal.load(Ordering::Relaxed) {
            0 => None,
            signo => Some(signo),
        }
    }

    /// Latch the shutdown flag, exactly as the handler would.
    pub fn latch(&self, signo: i32) {
        debug_assert_ne!(signo, 0, "0 means no shutdown pending");
        self.state().signal.store(signo, Ordering::Relaxed);
    }

    /// Send SIGUSR1 to the process. The thread it lands on is irrelevant;
    /// the signal is blocked everywhere and observed through the engine's
    /// signal-fd.
    pub fn emit_wake(&self) -> Result<()> {
        signal::kill(Pid::this(), Signo::SIGUSR1)?;
        Ok(())
    }

    /// Record one worker's exit; returns the updated participant count.
    pub(crate) fn join_exit(&self) -> u32 {
        self.state().participants.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of workers that have drained and exited.
    pub fn participants(&self) -> u32 {
        self.state().participants.load(Ordering::Acquire)
    }

    /// Release the executor's parked workers and wait until every one of
    /// them has drained and checked out. The latch must already be raised
    /// (by a signal or by [`Signal::latch`]) or this never returns.
    pub fn terminate<const N: usize>(&self, executor: &Executor<N>) {
        debug_assert!(self.raised().is_some(), "terminate without a latched signal");

        executor.release_parked();
        while self.participants() < executor.worker_count() as u32 {
            std::thread::sleep(RENDEZVOUS_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_latch_roundtrip() {
        let signal = Signal::detached();
        assert_eq!(signal.raised(), None);

        signal.latch(libc::SIGTERM);
        assert_eq!(signal.raised(), Some(libc::SIGTERM));

        // Clones share the latch.
        assert_eq!(signal.clone().raised(), Some(libc::SIGTERM));
    }

    #[test]
    fn detached_latches_are_independent() {
        let a = Signal::detached();
        let b = Signal::detached();
        a.latch(libc::SIGINT);
        assert_eq!(b.raised(), None);
    }

    #[test]
    fn participants_accumulate() {
        let signal = Signal::detached();
        assert_eq!(signal.participants(), 0);
        assert_eq!(signal.join_exit(), 1);
        assert_eq!(signal.join_exit(), 2);
        assert_eq!(signal.participants(), 2);
    }
}
