use std::sync::Arc;

use crate::executor::Executor;

/// Worker event loop: drain the queue, check the shutdown latch, park.
///
/// Spurious wake-ups are harmless; the drain phase simply finds the queue
/// empty and the worker parks again.
pub(super) fn run<const N: usize>(executor: Arc<Executor<N>>) {
    loop {
        executor.drain();

        if executor.signal().raised().is_some() {
            let joined = executor.signal().join_exit();
            tracing::debug!(joined, "worker drained, checking out");
            return;
        }

        executor.park_until_work();
    }
}
