/// The polymorphic task payload: either pure CPU work, or the
/// continuation of an I/O completion carrying its result.
///
/// A single tagged queue (instead of one queue per shape) lets an I/O
/// completion callback re-schedule CPU work with identical back-pressure.
pub(crate) enum TaskCall {
    Cpu(Box<dyn FnOnce() + Send>),
    IoCompletion {
        result: i32,
        run: Box<dyn FnOnce(i32) + Send>,
    },
}

/// One unit of work, heap-allocated by the producer, consumed by exactly
/// one worker, destroyed after the callback returns.
pub(crate) struct TaskRecord {
    call: TaskCall,
}

impl TaskRecord {
    pub(crate) fn cpu(f: impl FnOnce() + Send + 'static) -> Box<Self> {
        Box::new(Self {
            call: TaskCall::Cpu(Box::new(f)),
        })
    }

    pub(crate) fn completion(result: i32, f: impl FnOnce(i32) + Send + 'static) -> Box<Self> {
        Box::new(Self {
            call: TaskCall::IoCompletion {
                result,
                run: Box::new(f),
            },
        })
    }

    /// Dispatch on the tagged callback and consume the record.
    pub(crate) fn run(self: Box<Self>) {
        match self.call {
            TaskCall::Cpu(f) => f(),
            TaskCall::IoCompletion { result, run } => run(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn dispatches_on_the_tagged_callback() {
        let seen = Arc::new(AtomicI32::new(0));

        let s = seen.clone();
        TaskRecord::cpu(move || {
            s.store(1, Ordering::Relaxed);
        })
        .run();
        assert_eq!(seen.load(Ordering::Relaxed), 1);

        let s = seen.clone();
        TaskRecord::completion(-42, move |res| {
            s.store(res, Ordering::Relaxed);
        })
        .run();
        assert_eq!(seen.load(Ordering::Relaxed), -42);
    }
}
