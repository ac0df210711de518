use std::io;

/// Engine and submission errors.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    /// The staging queue is full. The operation record was reclaimed;
    /// the caller may retry after completions drain.
    #[error("staging queue is full, cannot submit IO")]
    Overflow,

    /// Submission attempted after the engine reached `Closed`.
    #[error("engine is closed, cannot submit IO")]
    Closed,

    /// The requested transfer length does not fit the supplied buffer.
    /// Rejected up front: the kernel would read or write past the
    /// allocation.
    #[error("requested length {requested} exceeds buffer capacity {capacity}")]
    BufferOverrun { requested: u32, capacity: usize },

    /// The running kernel or platform cannot host the engine.
    #[error("unsupported platform: {0}")]
    Unsupported(String),

    /// The kernel accepted the ring but lacks a feature the engine's
    /// memory layout depends on.
    #[error("missing required io_uring feature: {0}")]
    MissingFeature(&'static str),

    /// A syscall failed.
    #[error("I/O error: {0}")]
    Sys(#[from] io::Error),
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Overflow, Self::Overflow) => true,
            (Self::Closed, Self::Closed) => true,
            (
                Self::BufferOverrun {
                    requested: a,
                    capacity: b,
                },
                Self::BufferOverrun {
                    requested: c,
                    capacity: d,
                },
            ) => a == c && b == d,
            (Self::Unsupported(a), Self::Unsupported(b)) => a == b,
            (Self::MissingFeature(a), Self::MissingFeature(b)) => a == b,
            (Self::Sys(a), Self::Sys(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
