//! Raw kernel ABI for `io_uring`: syscall entry points, shared-memory
//! layout structs, and the flag constants the engine uses.
//!
//! The engine drives the SQ/CQ rings itself, so the structs here must
//! match the kernel layout byte for byte; sizes are pinned below.

use libc::{c_int, c_long, c_void};
use static_assertions::assert_eq_size;
use std::io;

// Direct syscall numbers. Identical on both supported architectures, but
// pinned per-arch because that is the support contract.
#[cfg(target_arch = "x86_64")]
mod nr {
    pub(super) const IO_URING_SETUP: libc::c_long = 425;
    pub(super) const IO_URING_ENTER: libc::c_long = 426;
    pub(super) const IO_URING_REGISTER: libc::c_long = 427;
}

#[cfg(target_arch = "aarch64")]
mod nr {
    pub(super) const IO_URING_SETUP: libc::c_long = 425;
    pub(super) const IO_URING_ENTER: libc::c_long = 426;
    pub(super) const IO_URING_REGISTER: libc::c_long = 427;
}

// io_uring_setup flags
pub(crate) const IORING_SETUP_SQPOLL: u32 = 1 << 1;
pub(crate) const IORING_SETUP_ATTACH_WQ: u32 = 1 << 5;
pub(crate) const IORING_SETUP_R_DISABLED: u32 = 1 << 6;
pub(crate) const IORING_SETUP_SINGLE_ISSUER: u32 = 1 << 12;

// io_uring_register opcodes
pub(crate) const IORING_REGISTER_ENABLE_RINGS: u32 = 12;

// io_uring_enter flags
pub(crate) const IORING_ENTER_GETEVENTS: u32 = 1 << 0;
pub(crate) const IORING_ENTER_SQ_WAKEUP: u32 = 1 << 1;
pub(crate) const IORING_ENTER_SQ_WAIT: u32 = 1 << 2;

// SQ ring flags (kernel-written)
pub(crate) const IORING_SQ_NEED_WAKEUP: u32 = 1 << 0;

// Feature bits reported by io_uring_setup
pub(crate) const IORING_FEAT_SINGLE_MMAP: u32 = 1 << 0;

// mmap offsets
pub(crate) const IORING_OFF_SQ_RING: i64 = 0;
pub(crate) const IORING_OFF_SQES: i64 = 0x1000_0000;

// Per-SQE flags
pub(crate) const IOSQE_IO_DRAIN: u8 = 1 << 1;
pub(crate) const IOSQE_IO_LINK: u8 = 1 << 2;
pub(crate) const IOSQE_ASYNC: u8 = 1 << 4;

// CQE flags
pub(crate) const IORING_CQE_F_MORE: u32 = 1 << 1;

// Opcodes
pub(crate) const IORING_OP_POLL_ADD: u8 = 6;
pub(crate) const IORING_OP_TIMEOUT: u8 = 11;
pub(crate) const IORING_OP_ACCEPT: u8 = 13;
pub(crate) const IORING_OP_ASYNC_CANCEL: u8 = 14;
pub(crate) const IORING_OP_OPENAT: u8 = 18;
pub(crate) const IORING_OP_CLOSE: u8 = 19;
pub(crate) const IORING_OP_STATX: u8 = 21;
pub(crate) const IORING_OP_READ: u8 = 22;
pub(crate) const IORING_OP_WRITE: u8 = 23;
pub(crate) const IORING_OP_SEND: u8 = 26;
pub(crate) const IORING_OP_RECV: u8 = 27;
pub(crate) const IORING_OP_SHUTDOWN: u8 = 34;

// Opcode-specific bits
pub(crate) const IORING_POLL_ADD_MULTI: u32 = 1 << 0;
pub(crate) const IORING_TIMEOUT_BOOTTIME: u32 = 1 << 2;
pub(crate) const IORING_ACCEPT_MULTISHOT: u16 = 1 << 0;
pub(crate) const IORING_RECVSEND_POLL_FIRST: u16 = 1 << 0;

/// `user_data` sentinel of the engine's long-lived self-poll submission.
pub(crate) const SELF_POLL_TOKEN: u64 = 1;

/// SQ ring offsets reported in [`Params`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SqOffsets {
    pub(crate) head: u32,
    pub(crate) tail: u32,
    pub(crate) ring_mask: u32,
    pub(crate) ring_entries: u32,
    pub(crate) flags: u32,
    pub(crate) dropped: u32,
    pub(crate) array: u32,
    pub(crate) resv1: u32,
    pub(crate) user_addr: u64,
}

/// CQ ring offsets reported in [`Params`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CqOffsets {
    pub(crate) head: u32,
    pub(crate) tail: u32,
    pub(crate) ring_mask: u32,
    pub(crate) ring_entries: u32,
    pub(crate) overflow: u32,
    pub(crate) cqes: u32,
    pub(crate) flags: u32,
    pub(crate) resv1: u32,
    pub(crate) user_addr: u64,
}

/// `struct io_uring_params`, filled in by `io_uring_setup`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Params {
    pub(crate) sq_entries: u32,
    pub(crate) cq_entries: u32,
    pub(crate) flags: u32,
    pub(crate) sq_thread_cpu: u32,
    pub(crate) sq_thread_idle: u32,
    pub(crate) features: u32,
    pub(crate) wq_fd: u32,
    pub(crate) resv: [u32; 3],
    pub(crate) sq_off: SqOffsets,
    pub(crate) cq_off: CqOffsets,
}

/// Submission queue entry. The kernel's three anonymous unions collapse
/// to the plain fields this engine assigns (`off`, `op_flags`,
/// `buf_index`); all other bytes stay zero.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Sqe {
    pub(crate) opcode: u8,
    pub(crate) flags: u8,
    pub(crate) ioprio: u16,
    pub(crate) fd: i32,
    pub(crate) off: u64,
    pub(crate) addr: u64,
    pub(crate) len: u32,
    pub(crate) op_flags: u32,
    pub(crate) user_data: u64,
    pub(crate) buf_index: u16,
    pub(crate) personality: u16,
    pub(crate) splice_fd_in: i32,
    pub(crate) __pad2: [u64; 2],
}

/// Completion queue entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Cqe {
    pub(crate) user_data: u64,
    pub(crate) res: i32,
    pub(crate) flags: u32,
}

/// `struct __kernel_timespec`; the libc `timespec` is not it on 32-bit
/// time_t layouts, so the engine carries its own.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct KernelTimespec {
    pub(crate) tv_sec: i64,
    pub(crate) tv_nsec: i64,
}

assert_eq_size!(Sqe, [u8; 64]);
assert_eq_size!(Cqe, [u8; 16]);
assert_eq_size!(Params, [u8; 120]);
assert_eq_size!(KernelTimespec, [u8; 16]);

// The kernel caps sigset sizes at _NSIG bits; io_uring_enter expects the
// byte count.
const NSIG: c_long = 64;

pub(crate) fn io_uring_setup(entries: u32, params: &mut Params) -> io::Result<c_int> {
    let ret = unsafe {
        libc::syscall(
            nr::IO_URING_SETUP,
            entries as c_long,
            params as *mut Params as c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as c_int)
}

/// One raw `io_uring_enter`. No retry: callers decide whether `EINTR` is
/// a spurious wake (block path) or must re-enter (submit path).
pub(crate) fn io_uring_enter(
    fd: c_int,
    to_submit: u32,
    min_complete: u32,
    flags: u32,
) -> io::Result<u32> {
    let ret = unsafe {
        libc::syscall(
            nr::IO_URING_ENTER,
            fd as c_long,
            to_submit as c_long,
            min_complete as c_long,
            flags as c_long,
            std::ptr::null_mut::<libc::sigset_t>() as c_long,
            NSIG / 8,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as u32)
}

pub(crate) fn io_uring_register(
    fd: c_int,
    opcode: u32,
    arg: *const c_void,
    nr_args: u32,
) -> io::Result<()> {
    let ret = unsafe {
        libc::syscall(
            nr::IO_URING_REGISTER,
            fd as c_long,
            opcode as c_long,
            arg as c_long,
            nr_args as c_long,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Map one ring region read/write, shared and pre-populated.
pub(crate) fn mmap_ring(len: usize, fd: c_int, offset: i64) -> io::Result<*mut c_void> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_POPULATE,
            fd,
            offset,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr)
}

pub(crate) fn munmap_ring(ptr: *mut c_void, len: usize) {
    // Teardown path; the worst failure mode is a leaked mapping.
    let ret = unsafe { libc::munmap(ptr, len) };
    debug_assert_eq!(ret, 0, "munmap failed");
}
