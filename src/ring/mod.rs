//! Bounded lock-free rings used for all cross-thread handoff.
//!
//! Three variants share one storage layout: a power-of-two array of
//! machine-word slots plus two `u32` cursors. A slot value of `0` means
//! "empty"; any non-zero value is a live payload (in practice the address
//! of a heap-allocated record, which is never null). The cursors are
//! advisory hints that shorten linear probing in the common case; the
//! *slot* is the synchronization point and the only source of truth.
//!
//! None of the variants preserve FIFO order under contention. Producers
//! and consumers that need ordering must enforce it at a higher layer.

pub(crate) mod slots;

pub mod mpmc;
pub use mpmc::MpmcRing;

pub mod mpsc;
pub use mpsc::MpscRing;

pub mod spmc;
pub use spmc::SpmcRing;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const PER_PRODUCER: usize = 4096;

    fn spawn_producer<F>(push: F, base: usize) -> thread::JoinHandle<()>
    where
        F: Fn(usize) -> Option<usize> + Send + 'static,
    {
        thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                let value = base + i;
                while push(value).is_none() {
                    thread::yield_now();
                }
            }
        })
    }

    fn spawn_consumer<F>(
        pop: F,
        taken: Arc<AtomicUsize>,
        total: usize,
    ) -> thread::JoinHandle<Vec<usize>>
    where
        F: Fn() -> Option<(usize, usize)> + Send + 'static,
    {
        thread::spawn(move || {
            let mut seen = Vec::new();
            while taken.load(Ordering::Acquire) < total {
                match pop() {
                    Some((_slot, value)) => {
                        taken.fetch_add(1, Ordering::AcqRel);
                        seen.push(value);
                    }
                    None => thread::yield_now(),
                }
            }
            seen
        })
    }

    /// The multiset popped must equal the multiset pushed: no duplication,
    /// no loss, for any producer/consumer mix.
    fn check_handoff(producers: usize, pushed_base: usize, consumed: Vec<Vec<usize>>) {
        let mut expected = BTreeMap::new();
        for p in 0..producers {
            for i in 0..PER_PRODUCER {
                *expected.entry(pushed_base * (p + 1) + i).or_insert(0usize) += 1;
            }
        }

        let mut actual = BTreeMap::new();
        for values in consumed {
            for v in values {
                *actual.entry(v).or_insert(0usize) += 1;
            }
        }

        assert_eq!(expected, actual);
    }

    #[test]
    fn mpmc_concurrent_handoff() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const BASE: usize = 1 << 20;

        let ring = Arc::new(MpmcRing::<256>::new());
        let taken = Arc::new(AtomicUsize::new(0));
        let total = PRODUCERS * PER_PRODUCER;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = ring.clone();
                spawn_producer(move |v| ring.push(v), BASE * (p + 1))
            })
            .collect();

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let ring = ring.clone();
                spawn_consumer(move || ring.pop(), taken.clone(), total)
            })
            .collect();

        for h in producers {
            h.join().unwrap();
        }
        let consumed = consumers.into_iter().map(|h| h.join().unwrap()).collect();

        check_handoff(PRODUCERS, BASE, consumed);
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn mpsc_concurrent_handoff() {
        const PRODUCERS: usize = 4;
        const BASE: usize = 1 << 20;

        let ring = Arc::new(MpscRing::<256>::new());
        let taken = Arc::new(AtomicUsize::new(0));
        let total = PRODUCERS * PER_PRODUCER;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = ring.clone();
                spawn_producer(move |v| ring.push(v), BASE * (p + 1))
            })
            .collect();

        let consumed = {
            let ring = ring.clone();
            spawn_consumer(move || ring.pop(), taken, total)
                .join()
                .unwrap()
        };

        for h in producers {
            h.join().unwrap();
        }

        check_handoff(PRODUCERS, BASE, vec![consumed]);
    }

    #[test]
    fn spmc_concurrent_handoff() {
        const CONSUMERS: usize = 4;
        const BASE: usize = 1 << 20;

        let ring = Arc::new(SpmcRing::<256>::new());
        let taken = Arc::new(AtomicUsize::new(0));

        let producer = {
            let ring = ring.clone();
            spawn_producer(move |v| ring.push(v), BASE)
        };

        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|_| {
                let ring = ring.clone();
                spawn_consumer(move || ring.pop(), taken.clone(), PER_PRODUCER)
            })
            .collect();

        producer.join().unwrap();
        let consumed = consumers.into_iter().map(|h| h.join().unwrap()).collect();

        check_handoff(1, BASE, consumed);
    }
}
