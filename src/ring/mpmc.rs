use crate::ring::slots::Slots;

/// Multi-producer, multi-consumer bounded ring. Backs the executor's task
/// queue: any worker may race any producer (and any other worker) for any
/// slot.
pub struct MpmcRing<const N: usize> {
    slots: Slots<N>,
}

impl<const N: usize> MpmcRing<N> {
    pub fn new() -> Self {
        Self { slots: Slots::new() }
    }

    /// Publish a non-zero payload. Returns the chosen slot index, or
    /// `None` when the ring is full.
    pub fn push(&self, entry: usize) -> Option<usize> {
        self.slots.push_multi(entry)
    }

    /// Extract the next payload as `(slot, payload)`, or `None` when the
    /// ring is empty.
    pub fn pop(&self) -> Option<(usize, usize)> {
        self.slots.pop_multi()
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.slots.live()
    }
}

impl<const N: usize> Default for MpmcRing<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn full_and_empty_are_reported() {
        let ring = MpmcRing::<4>::new();
        assert_eq!(ring.pop(), None);

        for v in 1..=4 {
            assert!(ring.push(v).is_some());
        }
        assert_eq!(ring.push(5), None);

        for _ in 0..4 {
            assert!(ring.pop().is_some());
        }
        assert_eq!(ring.pop(), None);
    }

    #[rstest]
    #[case::one(1)]
    #[case::half(8)]
    #[case::full(16)]
    fn balanced_interleaving_leaves_only_empty_slots(#[case] k: usize) {
        let ring = MpmcRing::<16>::new();

        for round in 0..3 {
            for i in 0..k {
                assert!(ring.push(round * 100 + i + 1).is_some());
            }
            for _ in 0..k {
                assert!(ring.pop().is_some());
            }
        }

        assert_eq!(ring.live(), 0);
    }

    #[test]
    fn sequential_pushes_up_to_capacity_all_succeed() {
        let ring = MpmcRing::<32>::new();
        for v in 1..=32 {
            assert!(ring.push(v).is_some(), "push {v} failed below capacity");
        }
    }
}
