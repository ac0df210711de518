use bitflags::bitflags;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::uring::buffer::{IoBuffer, StatxReply};
use crate::uring::sys;

bitflags! {
    /// Per-submission relationship to the ring's ordering. `ASYNC` is the
    /// default; `DRAIN` waits for every prior SQE to complete first,
    /// `LINK` chains the next SQE to this one. These are the only
    /// ordering primitives the engine exposes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SqeMode: u8 {
        const ASYNC = sys::IOSQE_ASYNC;
        const DRAIN = sys::IOSQE_IO_DRAIN;
        const LINK = sys::IOSQE_IO_LINK;
    }
}

impl Default for SqeMode {
    fn default() -> Self {
        SqeMode::ASYNC
    }
}

/// Which half of the connection a `shutdown` submission closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

impl ShutdownHow {
    fn as_flag(self) -> u32 {
        match self {
            ShutdownHow::Read => libc::SHUT_RD as u32,
            ShutdownHow::Write => libc::SHUT_WR as u32,
            ShutdownHow::Both => libc::SHUT_RDWR as u32,
        }
    }
}

/// Completion callback: invoked with the raw `cqe.res` (negative values
/// carry `-errno`). `FnMut` because multi-shot submissions complete many
/// times.
pub type Callback = Box<dyn FnMut(i32) + Send>;

/// Peer-address scratch a multi-shot accept hands to the kernel. Owned by
/// the operation record so it stays pinned for the submission's lifetime.
pub(crate) struct PeerAddr {
    pub(crate) storage: libc::sockaddr_storage,
    pub(crate) len: libc::socklen_t,
}

impl PeerAddr {
    pub(crate) fn zeroed() -> Self {
        Self {
            // Safety: sockaddr_storage is plain bytes; zeroes are valid.
            storage: unsafe { MaybeUninit::zeroed().assume_init() },
            len: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }
}

/// Opcode-specific parameters. Everything the kernel dereferences
/// (paths, timespecs, address scratch, data buffers) is owned here, so a
/// record stays self-contained until its terminal completion.
pub(crate) enum Op {
    Timeout {
        ts: sys::KernelTimespec,
    },
    Accept {
        socket: RawFd,
        peer: PeerAddr,
    },
    Shutdown {
        socket: RawFd,
        how: ShutdownHow,
    },
    Open {
        path: CString,
        flags: OFlag,
        mode: Mode,
    },
    Close {
        fd: RawFd,
    },
    Send {
        socket: RawFd,
        buf: Arc<IoBuffer>,
        len: u32,
    },
    Recv {
        socket: RawFd,
        buf: Arc<IoBuffer>,
        len: u32,
    },
    Read {
        fd: RawFd,
        buf: Arc<IoBuffer>,
        count: u32,
        offset: u64,
    },
    Write {
        fd: RawFd,
        buf: Arc<IoBuffer>,
        count: u32,
        offset: u64,
    },
    Status {
        path: CString,
        flags: u32,
        mask: u32,
        reply: Arc<StatxReply>,
    },
    PollAdd {
        fd: RawFd,
        events: u32,
    },
    Cancel {
        target: u64,
    },
}

/// One submitted operation. Boxed at submission; the box address is the
/// kernel-visible `user_data` token and the record lives until the
/// terminal completion (the only one without `F_MORE` for multi-shot) is
/// dispatched.
pub(crate) struct OpRecord {
    pub(crate) op: Op,
    pub(crate) mode: SqeMode,
    pub(crate) on_complete: Option<Callback>,
}

impl OpRecord {
    pub(crate) fn new(op: Op, mode: SqeMode, on_complete: Option<Callback>) -> Box<Self> {
        Box::new(Self {
            op,
            mode,
            on_complete,
        })
    }

    /// Whether the kernel may post more than one completion for this
    /// record.
    pub(crate) fn is_multishot(&self) -> bool {
        matches!(self.op, Op::Accept { .. } | Op::PollAdd { .. })
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self.op {
            Op::Timeout { .. } => "timeout",
            Op::Accept { .. } => "accept",
            Op::Shutdown { .. } => "shutdown",
            Op::Open { .. } => "open",
            Op::Close { .. } => "close",
            Op::Send { .. } => "send",
            Op::Recv { .. } => "recv",
            Op::Read { .. } => "read",
            Op::Write { .. } => "write",
            Op::Status { .. } => "statx",
            Op::PollAdd { .. } => "poll-add",
            Op::Cancel { .. } => "cancel",
        }
    }

    /// Fill `sqe` for this record; all bytes not assigned stay zero.
    /// `user_data` is the kernel-visible token. The record must not move
    /// between `prep` and the terminal completion: the SQE carries
    /// addresses into it.
    pub(crate) fn prep(&mut self, sqe: &mut sys::Sqe, user_data: u64) {
        *sqe = sys::Sqe::default();
        sqe.flags = self.mode.bits();
        sqe.user_data = user_data;

        match &mut self.op {
            Op::Timeout { ts } => {
                sqe.opcode = sys::IORING_OP_TIMEOUT;
                sqe.addr = ts as *mut sys::KernelTimespec as u64;
                sqe.len = 1;
                sqe.op_flags = sys::IORING_TIMEOUT_BOOTTIME;
            }
            Op::Accept { socket, peer } => {
                sqe.opcode = sys::IORING_OP_ACCEPT;
                sqe.fd = *socket;
                sqe.addr = &mut peer.storage as *mut libc::sockaddr_storage as u64;
                sqe.off = &mut peer.len as *mut libc::socklen_t as u64;
                sqe.ioprio = sys::IORING_ACCEPT_MULTISHOT;
            }
            Op::Shutdown { socket, how } => {
                sqe.opcode = sys::IORING_OP_SHUTDOWN;
                sqe.fd = *socket;
                sqe.len = how.as_flag();
            }
            Op::Open { path, flags, mode } => {
                sqe.opcode = sys::IORING_OP_OPENAT;
                // dirfd is ignored for the absolute paths the API requires.
                sqe.fd = 0;
                sqe.addr = path.as_ptr() as u64;
                sqe.len = mode.bits();
                sqe.op_flags = flags.bits() as u32;
            }
            Op::Close { fd } => {
                sqe.opcode = sys::IORING_OP_CLOSE;
                sqe.fd = *fd;
            }
            Op::Send { socket, buf, len } => {
                sqe.opcode = sys::IORING_OP_SEND;
                sqe.fd = *socket;
                sqe.addr = buf.as_mut_ptr() as u64;
                sqe.len = *len;
            }
            Op::Recv { socket, buf, len } => {
                sqe.opcode = sys::IORING_OP_RECV;
                sqe.fd = *socket;
                sqe.addr = buf.as_mut_ptr() as u64;
                sqe.len = *len;
                sqe.ioprio = sys::IORING_RECVSEND_POLL_FIRST;
            }
            Op::Read {
                fd,
                buf,
                count,
                offset,
            } => {
                sqe.opcode = sys::IORING_OP_READ;
                sqe.fd = *fd;
                sqe.addr = buf.as_mut_ptr() as u64;
                sqe.len = *count;
                sqe.off = *offset;
            }
            Op::Write {
                fd,
                buf,
                count,
                offset,
            } => {
                sqe.opcode = sys::IORING_OP_WRITE;
                sqe.fd = *fd;
                sqe.addr = buf.as_mut_ptr() as u64;
                sqe.len = *count;
                sqe.off = *offset;
            }
            Op::Status {
                path,
                flags,
                mask,
                reply,
            } => {
                sqe.opcode = sys::IORING_OP_STATX;
                sqe.fd = 0;
                sqe.addr = path.as_ptr() as u64;
                sqe.off = reply.as_mut_ptr() as u64;
                sqe.len = *mask;
                sqe.op_flags = *flags;
            }
            Op::PollAdd { fd, events } => {
                sqe.opcode = sys::IORING_OP_POLL_ADD;
                sqe.fd = *fd;
                sqe.len = sys::IORING_POLL_ADD_MULTI;
                sqe.op_flags = *events;
            }
            Op::Cancel { target } => {
                sqe.opcode = sys::IORING_OP_ASYNC_CANCEL;
                sqe.addr = *target;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prep(op: Op, mode: SqeMode) -> (sys::Sqe, Box<OpRecord>) {
        let mut record = OpRecord::new(op, mode, None);
        let mut sqe = sys::Sqe::default();
        let user_data = &*record as *const OpRecord as u64;
        record.prep(&mut sqe, user_data);
        (sqe, record)
    }

    #[test]
    fn timeout_sqe_fields() {
        let (sqe, record) = prep(
            Op::Timeout {
                ts: sys::KernelTimespec {
                    tv_sec: 5,
                    tv_nsec: 0,
                },
            },
            SqeMode::default(),
        );

        assert_eq!(sqe.opcode, sys::IORING_OP_TIMEOUT);
        assert_eq!(sqe.fd, 0);
        assert_eq!(sqe.len, 1);
        assert_eq!(sqe.off, 0);
        assert_eq!(sqe.op_flags, sys::IORING_TIMEOUT_BOOTTIME);
        assert_eq!(sqe.flags, sys::IOSQE_ASYNC);
        assert_ne!(sqe.addr, 0);
        assert_eq!(sqe.user_data, &*record as *const OpRecord as u64);
    }

    #[test]
    fn accept_is_multishot_with_peer_scratch() {
        let (sqe, record) = prep(
            Op::Accept {
                socket: 7,
                peer: PeerAddr::zeroed(),
            },
            SqeMode::default(),
        );

        assert!(record.is_multishot());
        assert_eq!(sqe.opcode, sys::IORING_OP_ACCEPT);
        assert_eq!(sqe.fd, 7);
        assert_eq!(sqe.ioprio, sys::IORING_ACCEPT_MULTISHOT);
        assert_eq!(sqe.op_flags, 0);
        assert_ne!(sqe.addr, 0);
        assert_ne!(sqe.off, 0);
    }

    #[test]
    fn shutdown_direction_is_a_parameter() {
        for (how, flag) in [
            (ShutdownHow::Read, libc::SHUT_RD as u32),
            (ShutdownHow::Write, libc::SHUT_WR as u32),
            (ShutdownHow::Both, libc::SHUT_RDWR as u32),
        ] {
            let (sqe, _record) = prep(Op::Shutdown { socket: 3, how }, SqeMode::default());
            assert_eq!(sqe.opcode, sys::IORING_OP_SHUTDOWN);
            assert_eq!(sqe.fd, 3);
            assert_eq!(sqe.len, flag);
        }
    }

    #[test]
    fn open_carries_mode_in_len_and_flags_in_op_flags() {
        let (sqe, _record) = prep(
            Op::Open {
                path: CString::new("/tmp/spate-test").unwrap(),
                flags: OFlag::O_RDONLY,
                mode: Mode::from_bits_truncate(0o644),
            },
            SqeMode::default(),
        );

        assert_eq!(sqe.opcode, sys::IORING_OP_OPENAT);
        assert_eq!(sqe.fd, 0);
        assert_eq!(sqe.len, 0o644);
        assert_eq!(sqe.op_flags, OFlag::O_RDONLY.bits() as u32);
        assert_ne!(sqe.addr, 0);
    }

    #[test]
    fn read_and_write_carry_offset_in_off() {
        let buf = IoBuffer::zeroed(1024);

        let (sqe, _record) = prep(
            Op::Read {
                fd: 5,
                buf: buf.clone(),
                count: 1024,
                offset: 512,
            },
            SqeMode::default(),
        );
        assert_eq!(sqe.opcode, sys::IORING_OP_READ);
        assert_eq!(sqe.addr, buf.as_mut_ptr() as u64);
        assert_eq!(sqe.len, 1024);
        assert_eq!(sqe.off, 512);

        let (sqe, _record) = prep(
            Op::Write {
                fd: 5,
                buf: buf.clone(),
                count: 100,
                offset: 0,
            },
            SqeMode::default(),
        );
        assert_eq!(sqe.opcode, sys::IORING_OP_WRITE);
        assert_eq!(sqe.len, 100);
        assert_eq!(sqe.off, 0);
    }

    #[test]
    fn recv_sets_poll_first_and_send_does_not() {
        let buf = IoBuffer::zeroed(64);

        let (sqe, _record) = prep(
            Op::Recv {
                socket: 9,
                buf: buf.clone(),
                len: 64,
            },
            SqeMode::default(),
        );
        assert_eq!(sqe.opcode, sys::IORING_OP_RECV);
        assert_eq!(sqe.ioprio, sys::IORING_RECVSEND_POLL_FIRST);

        let (sqe, _record) = prep(
            Op::Send {
                socket: 9,
                buf,
                len: 64,
            },
            SqeMode::default(),
        );
        assert_eq!(sqe.opcode, sys::IORING_OP_SEND);
        assert_eq!(sqe.ioprio, 0);
        assert_eq!(sqe.op_flags, 0);
    }

    #[test]
    fn statx_points_off_at_the_reply() {
        let reply = StatxReply::new();
        let (sqe, _record) = prep(
            Op::Status {
                path: CString::new("/etc/hostname").unwrap(),
                flags: 0,
                mask: libc::STATX_SIZE,
                reply: reply.clone(),
            },
            SqeMode::default(),
        );

        assert_eq!(sqe.opcode, sys::IORING_OP_STATX);
        assert_eq!(sqe.fd, 0);
        assert_eq!(sqe.off, reply.as_mut_ptr() as u64);
        assert_eq!(sqe.len, libc::STATX_SIZE);
    }

    #[test]
    fn poll_add_is_multishot_on_len() {
        let (sqe, record) = prep(
            Op::PollAdd {
                fd: 4,
                events: libc::POLLIN as u32,
            },
            SqeMode::empty(),
        );

        assert!(record.is_multishot());
        assert_eq!(sqe.opcode, sys::IORING_OP_POLL_ADD);
        assert_eq!(sqe.len, sys::IORING_POLL_ADD_MULTI);
        assert_eq!(sqe.op_flags, libc::POLLIN as u32);
        assert_eq!(sqe.addr, 0);
        assert_eq!(sqe.off, 0);
    }

    #[test]
    fn cancel_targets_the_token_in_addr() {
        let (sqe, _record) = prep(Op::Cancel { target: 0xdead_beef }, SqeMode::empty());
        assert_eq!(sqe.opcode, sys::IORING_OP_ASYNC_CANCEL);
        assert_eq!(sqe.addr, 0xdead_beef);
    }

    #[test]
    fn drain_and_link_modes_land_in_sqe_flags() {
        let (sqe, _record) = prep(
            Op::Close { fd: 1 },
            SqeMode::ASYNC | SqeMode::DRAIN,
        );
        assert_eq!(sqe.flags, sys::IOSQE_ASYNC | sys::IOSQE_IO_DRAIN);

        let (sqe, _record) = prep(Op::Close { fd: 1 }, SqeMode::ASYNC | SqeMode::LINK);
        assert_eq!(sqe.flags, sys::IOSQE_ASYNC | sys::IOSQE_IO_LINK);
    }
}
