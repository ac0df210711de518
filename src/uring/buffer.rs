use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;

/// Byte buffer an in-flight operation reads from (`send`, `write`) or the
/// kernel writes into (`recv`, `read`).
///
/// Shared between the caller and the operation record via `Arc` so the
/// memory outlives the submission no matter which side drops first. The
/// contents must not be touched while an operation referencing the buffer
/// is in flight; reading after the completion callback has fired is safe.
pub struct IoBuffer {
    data: UnsafeCell<Box<[u8]>>,
}

// The in-flight exclusivity contract above is what makes sharing sound;
// the type itself only hands out raw views.
unsafe impl Send for IoBuffer {}
unsafe impl Sync for IoBuffer {}

impl IoBuffer {
    /// A zero-filled buffer of `len` bytes, ready to receive data.
    pub fn zeroed(len: usize) -> Arc<Self> {
        Arc::new(Self {
            data: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
        })
    }

    /// A buffer carrying `data`, ready to be sent or written.
    pub fn from_vec(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: UnsafeCell::new(data.into_boxed_slice()),
        })
    }

    pub fn len(&self) -> usize {
        unsafe { (&*self.data.get()).len() }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View of the contents. See the type-level in-flight contract.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { &*self.data.get() }
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr() }
    }
}

/// Result slot for a `status` (statx) submission, shared like
/// [`IoBuffer`]: the record keeps it alive for the kernel, the caller
/// reads it once the completion callback has fired.
pub struct StatxReply {
    data: UnsafeCell<libc::statx>,
}

unsafe impl Send for StatxReply {}
unsafe impl Sync for StatxReply {}

impl StatxReply {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            // Safety: statx is a plain C struct; all-zeroes is a valid
            // (empty) value the kernel overwrites.
            data: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
        })
    }

    /// Copy of the statx record. Meaningful only after a successful
    /// completion.
    pub fn get(&self) -> libc::statx {
        unsafe { *self.data.get() }
    }

    pub(crate) fn as_mut_ptr(&self) -> *mut libc::statx {
        self.data.get()
    }
}
