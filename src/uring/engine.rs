use nix::fcntl::OFlag;
use nix::sys::signal::{SigSet, Signal as Signo};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::stat::Mode;
use smallvec::SmallVec;
use std::cell::{Cell, UnsafeCell};
use std::collections::HashSet;
use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, AtomicU8, AtomicU32, Ordering};
use std::time::Duration;

use crate::ring::MpscRing;
use crate::signal::Signal;
use crate::uring::buffer::{IoBuffer, StatxReply};
use crate::uring::errors::IoError;
use crate::uring::op::{Callback, Op, OpRecord, PeerAddr, ShutdownHow, SqeMode};
use crate::uring::{sys, version};

/// Engine lifecycle. Submissions are accepted until `Closed`; the event
/// loop drives `Inactive → Running → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Inactive = 0,
    Running = 1,
    Closing = 2,
    Closed = 3,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Inactive,
            1 => Lifecycle::Running,
            2 => Lifecycle::Closing,
            _ => Lifecycle::Closed,
        }
    }
}

/// Opaque handle to an accepted submission; pass to [`AsyncIo::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(pub(crate) u64);

/// Configures and initializes an [`AsyncIo`] engine.
pub struct Builder {
    sq_thread_idle_ms: u32,
    attach_wq: Option<RawFd>,
    cancel_on_shutdown: bool,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            sq_thread_idle_ms: 0,
            attach_wq: None,
            cancel_on_shutdown: false,
        }
    }

    /// Milliseconds before the kernel SQ poller idles; 0 leaves the
    /// kernel default.
    pub fn sq_thread_idle(mut self, ms: u32) -> Self {
        self.sq_thread_idle_ms = ms;
        self
    }

    /// Share the kernel worker pool of an existing ring instead of
    /// creating a new one. `parent_ring_fd` must be a live io_uring fd.
    pub fn attach_wq(mut self, parent_ring_fd: RawFd) -> Self {
        self.attach_wq = Some(parent_ring_fd);
        self
    }

    /// Sweep-cancel every tracked in-flight operation when shutdown is
    /// latched, instead of waiting for natural completions. Cancelled
    /// callbacks observe `-ECANCELED`.
    pub fn cancel_on_shutdown(mut self, val: bool) -> Self {
        self.cancel_on_shutdown = val;
        self
    }

    /// Initialize the engine with a ring of `N` entries (power of two).
    pub fn build<const N: usize>(self, signal: Signal) -> Result<AsyncIo<N>, IoError> {
        AsyncIo::init(self, signal)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

struct MapRegion {
    ptr: *mut libc::c_void,
    len: usize,
}

/// A transfer length goes into `sqe.len` verbatim, so it must never
/// exceed the buffer the kernel will dereference.
fn bounded_len(buf: &IoBuffer, requested: u32) -> Result<u32, IoError> {
    if requested as usize > buf.len() {
        return Err(IoError::BufferOverrun {
            requested,
            capacity: buf.len(),
        });
    }
    Ok(requested)
}

/// Decoded pointers into the kernel SQ ring. Touched only by the single
/// issuer thread running the event loop.
struct Squeue {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    kflags: *const AtomicU32,
    array: *const AtomicU32,
    sqes: *mut sys::Sqe,
    entries: u32,
    mask: u32,

    /// Local mirror of the published tail.
    tail: Cell<u32>,
}

impl Squeue {
    unsafe fn decode(params: &sys::Params, rings: *mut libc::c_void, sqes: *mut libc::c_void) -> Self {
        let base = rings as *mut u8;
        unsafe {
            let ktail = base.add(params.sq_off.tail as usize) as *const AtomicU32;
            Self {
                khead: base.add(params.sq_off.head as usize) as *const AtomicU32,
                ktail,
                kflags: base.add(params.sq_off.flags as usize) as *const AtomicU32,
                array: base.add(params.sq_off.array as usize) as *const AtomicU32,
                sqes: sqes as *mut sys::Sqe,
                entries: params.sq_entries,
                mask: *(base.add(params.sq_off.ring_mask as usize) as *const u32),
                tail: Cell::new((*ktail).load(Ordering::Relaxed)),
            }
        }
    }

    /// Entries the kernel has not consumed yet leave this much room.
    fn free_space(&self) -> u32 {
        let head = unsafe { &*self.khead }.load(Ordering::Acquire);
        self.entries - self.tail.get().wrapping_sub(head)
    }

    fn need_wakeup(&self) -> bool {
        unsafe { &*self.kflags }.load(Ordering::Acquire) & sys::IORING_SQ_NEED_WAKEUP != 0
    }

    /// Prepare the SQE at `tail & mask`, publish its index, and advance
    /// the tail. Caller guarantees free space and single-issuer context.
    unsafe fn push(&self, record: &mut OpRecord, user_data: u64) {
        debug_assert!(self.free_space() > 0);

        let tail = self.tail.get();
        let idx = (tail & self.mask) as usize;
        unsafe {
            record.prep(&mut *self.sqes.add(idx), user_data);
            (*self.array.add(idx)).store(idx as u32, Ordering::Release);
        }

        let next = tail.wrapping_add(1);
        self.tail.set(next);
        unsafe { &*self.ktail }.store(next, Ordering::Release);
    }
}

/// Decoded pointers into the kernel CQ ring. Single issuer only.
struct Cqueue {
    khead: *const AtomicU32,
    ktail: *const AtomicU32,
    cqes: *const sys::Cqe,
    mask: u32,
}

impl Cqueue {
    unsafe fn decode(params: &sys::Params, rings: *mut libc::c_void) -> Self {
        let base = rings as *mut u8;
        unsafe {
            Self {
                khead: base.add(params.cq_off.head as usize) as *const AtomicU32,
                ktail: base.add(params.cq_off.tail as usize) as *const AtomicU32,
                cqes: base.add(params.cq_off.cqes as usize) as *const sys::Cqe,
                mask: *(base.add(params.cq_off.ring_mask as usize) as *const u32),
            }
        }
    }

    fn pop(&self) -> Option<sys::Cqe> {
        let head = unsafe { &*self.khead }.load(Ordering::Relaxed);
        if head == unsafe { &*self.ktail }.load(Ordering::Acquire) {
            return None;
        }

        let cqe = unsafe { *self.cqes.add((head & self.mask) as usize) };
        unsafe { &*self.khead }.store(head.wrapping_add(1), Ordering::Release);
        Some(cqe)
    }
}

/// Completion-based I/O engine over a single-issuer `io_uring`.
///
/// Any thread may submit; the one thread calling [`AsyncIo::event_loop`]
/// (the reaper) is the only one that touches kernel ring state.
/// Submissions funnel through a lock-free MPSC staging ring and the
/// reaper is roused through a signal-fd watched by a long-lived
/// multi-shot self-poll.
pub struct AsyncIo<const N: usize> {
    ring_fd: OwnedFd,
    sfd: SignalFd,

    sq: Squeue,
    cq: Cqueue,
    rings: MapRegion,
    sqes: MapRegion,

    staging: MpscRing<N>,
    ongoing_ios: AtomicU32,
    status: AtomicU8,
    signal: Signal,

    /// Long-lived multi-shot poll on the signal-fd; its `user_data` is
    /// the sentinel `1`, not a record address.
    self_poll: UnsafeCell<Box<OpRecord>>,

    cancel_on_shutdown: bool,

    /// Debug ledger of live operation records; asserted empty at
    /// teardown.
    live_records: AtomicIsize,
}

// Safety: `sq`, `cq`, and `self_poll` are touched only by the single
// issuer thread inside `event_loop`; every other field is atomic,
// immutable after init, or internally synchronized.
unsafe impl<const N: usize> Send for AsyncIo<N> {}
unsafe impl<const N: usize> Sync for AsyncIo<N> {}

impl<const N: usize> AsyncIo<N> {
    fn init(builder: Builder, signal: Signal) -> Result<Self, IoError> {
        const {
            assert!(N.is_power_of_two(), "ring capacity must be a power of two");
        }

        version::check_supported()?;

        // Signal::init already blocked the wake signal process-wide in
        // the common path; blocking again here covers embedders driving a
        // detached latch, and is idempotent.
        Signal::block_wake_signal()
            .map_err(|e| IoError::Unsupported(format!("cannot block wake signal: {e}")))?;

        let mut mask = SigSet::empty();
        mask.add(Signo::SIGUSR1);
        let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK)
            .map_err(|e| IoError::Sys(io::Error::from(e)))?;

        // Single-issuer, but the issuer is the thread that will run the
        // event loop, not necessarily this one: start the ring disabled
        // and let the reaper bind itself by enabling it.
        let mut params = sys::Params::default();
        params.flags = sys::IORING_SETUP_SQPOLL
            | sys::IORING_SETUP_SINGLE_ISSUER
            | sys::IORING_SETUP_R_DISABLED;
        params.sq_thread_idle = builder.sq_thread_idle_ms;
        if let Some(parent) = builder.attach_wq {
            params.flags |= sys::IORING_SETUP_ATTACH_WQ;
            params.wq_fd = parent as u32;
        }

        let raw_fd = sys::io_uring_setup(N as u32, &mut params)?;
        // Safety: a fresh fd the kernel just handed us.
        let ring_fd = unsafe { OwnedFd::from_raw_fd(raw_fd) };

        // The engine decodes one combined region for both rings.
        if params.features & sys::IORING_FEAT_SINGLE_MMAP == 0 {
            return Err(IoError::MissingFeature("IORING_FEAT_SINGLE_MMAP"));
        }

        let rings_len = std::cmp::max(
            params.sq_off.array as usize + params.sq_entries as usize * size_of::<u32>(),
            params.cq_off.cqes as usize + params.cq_entries as usize * size_of::<sys::Cqe>(),
        );
        let rings = MapRegion {
            ptr: sys::mmap_ring(rings_len, raw_fd, sys::IORING_OFF_SQ_RING)?,
            len: rings_len,
        };

        let sqes_len = params.sq_entries as usize * size_of::<sys::Sqe>();
        let sqes = match sys::mmap_ring(sqes_len, raw_fd, sys::IORING_OFF_SQES) {
            Ok(ptr) => MapRegion { ptr, len: sqes_len },
            Err(e) => {
                sys::munmap_ring(rings.ptr, rings.len);
                return Err(e.into());
            }
        };

        // Safety: both regions are mapped and stay mapped until Drop.
        let sq = unsafe { Squeue::decode(&params, rings.ptr, sqes.ptr) };
        let cq = unsafe { Cqueue::decode(&params, rings.ptr) };

        let self_poll = OpRecord::new(
            Op::PollAdd {
                fd: sfd.as_fd().as_raw_fd(),
                events: libc::POLLIN as u32,
            },
            SqeMode::empty(),
            None,
        );

        Ok(Self {
            ring_fd,
            sfd,
            sq,
            cq,
            rings,
            sqes,
            staging: MpscRing::new(),
            ongoing_ios: AtomicU32::new(0),
            status: AtomicU8::new(Lifecycle::Inactive as u8),
            signal,
            self_poll: UnsafeCell::new(self_poll),
            cancel_on_shutdown: builder.cancel_on_shutdown,
            live_records: AtomicIsize::new(0),
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        self.status.store(next as u8, Ordering::SeqCst);
    }

    /// In-flight submissions, the pinned self-poll included. Quiescent at
    /// exactly 1.
    pub fn ongoing(&self) -> u32 {
        self.ongoing_ios.load(Ordering::Acquire)
    }

    // ---- submission API ------------------------------------------------

    /// Fire once after `after` (kernel boot clock).
    pub fn timeout(
        &self,
        after: Duration,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        let ts = sys::KernelTimespec {
            tv_sec: after.as_secs() as i64,
            tv_nsec: after.subsec_nanos() as i64,
        };
        self.stage(Op::Timeout { ts }, mode, on_complete)
    }

    /// Multi-shot accept on a listening socket: the callback observes one
    /// connection fd per completion until the terminal one.
    pub fn accept(
        &self,
        socket: RawFd,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        self.stage(
            Op::Accept {
                socket,
                peer: PeerAddr::zeroed(),
            },
            mode,
            on_complete,
        )
    }

    /// Shut down one or both halves of a connection.
    pub fn shutdown(
        &self,
        socket: RawFd,
        how: ShutdownHow,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        self.stage(Op::Shutdown { socket, how }, mode, on_complete)
    }

    /// Open `path` (absolute); the completion result is the new fd.
    pub fn open(
        &self,
        path: &Path,
        flags: OFlag,
        perm: Mode,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        debug_assert!(path.is_absolute(), "open requires an absolute path");
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| IoError::Sys(io::Error::from(io::ErrorKind::InvalidInput)))?;
        self.stage(
            Op::Open {
                path,
                flags,
                mode: perm,
            },
            mode,
            on_complete,
        )
    }

    pub fn close(
        &self,
        fd: RawFd,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        self.stage(Op::Close { fd }, mode, on_complete)
    }

    /// Send the first `len` bytes of `buf`.
    pub fn send(
        &self,
        socket: RawFd,
        buf: Arc<IoBuffer>,
        len: u32,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        let len = bounded_len(&buf, len)?;
        self.stage(Op::Send { socket, buf, len }, mode, on_complete)
    }

    /// Receive up to `len` bytes into `buf`.
    pub fn recv(
        &self,
        socket: RawFd,
        buf: Arc<IoBuffer>,
        len: u32,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        let len = bounded_len(&buf, len)?;
        self.stage(Op::Recv { socket, buf, len }, mode, on_complete)
    }

    /// Read `count` bytes at `offset` into `buf`.
    pub fn read(
        &self,
        fd: RawFd,
        buf: Arc<IoBuffer>,
        count: u32,
        offset: u64,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        let count = bounded_len(&buf, count)?;
        self.stage(
            Op::Read {
                fd,
                buf,
                count,
                offset,
            },
            mode,
            on_complete,
        )
    }

    /// Write the first `count` bytes of `buf` at `offset`.
    pub fn write(
        &self,
        fd: RawFd,
        buf: Arc<IoBuffer>,
        count: u32,
        offset: u64,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        let count = bounded_len(&buf, count)?;
        self.stage(
            Op::Write {
                fd,
                buf,
                count,
                offset,
            },
            mode,
            on_complete,
        )
    }

    /// statx on an absolute `path`; `reply` holds the result once the
    /// callback has fired. `flags` are `AT_*` bits, `mask` is `STATX_*`.
    pub fn status(
        &self,
        path: &Path,
        flags: u32,
        mask: u32,
        reply: Arc<StatxReply>,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        debug_assert!(path.is_absolute(), "status requires an absolute path");
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| IoError::Sys(io::Error::from(io::ErrorKind::InvalidInput)))?;
        self.stage(
            Op::Status {
                path,
                flags,
                mask,
                reply,
            },
            mode,
            on_complete,
        )
    }

    /// Cancel an in-flight submission. The cancelled operation's own
    /// callback observes `-ECANCELED`; this submission's callback
    /// observes the kernel's cancel result.
    pub fn cancel(
        &self,
        target: IoToken,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        self.stage(Op::Cancel { target: target.0 }, mode, on_complete)
    }

    fn stage(
        &self,
        op: Op,
        mode: SqeMode,
        on_complete: Option<Callback>,
    ) -> Result<IoToken, IoError> {
        if self.lifecycle() == Lifecycle::Closed {
            return Err(IoError::Closed);
        }

        self.ledger_alloc();
        let addr = Box::into_raw(OpRecord::new(op, mode, on_complete)) as usize;

        match self.staging.push(addr) {
            Some(_slot) => {
                // Before the event loop runs there is nobody to wake; the
                // loop drains the staging ring on entry.
                if self.lifecycle() != Lifecycle::Inactive
                    && let Err(e) = self.signal.emit_wake()
                {
                    tracing::error!(error = %e, "failed to raise wake signal");
                }
                Ok(IoToken(addr as u64))
            }
            None => {
                // Safety: the push failed, so the address was never
                // published and we still own the record.
                drop(unsafe { Box::from_raw(addr as *mut OpRecord) });
                self.ledger_free();
                Err(IoError::Overflow)
            }
        }
    }

    // ---- event loop ----------------------------------------------------

    /// Run the reaper on the calling thread until shutdown completes.
    ///
    /// `exit_hooks` run exactly once, on this thread, when the shutdown
    /// latch is first observed.
    ///
    /// # Panics
    ///
    /// Panics if called more than once; the engine is single-issuer.
    pub fn event_loop(&self, exit_hooks: Vec<Box<dyn FnOnce() + Send>>) -> Result<(), IoError> {
        assert_eq!(
            self.lifecycle(),
            Lifecycle::Inactive,
            "event_loop entered twice"
        );

        let mut exit_hooks = Some(exit_hooks);
        let mut inflight: HashSet<u64> = HashSet::new();

        // Enabling the disabled ring binds this thread as the single
        // issuer; every io_uring_enter from here on must come from it.
        sys::io_uring_register(
            self.ring_fd.as_raw_fd(),
            sys::IORING_REGISTER_ENABLE_RINGS,
            std::ptr::null(),
            0,
        )?;

        // Safety (here and below): single issuer; only this thread
        // touches SQ/CQ state until the loop exits.
        unsafe { self.install_self_poll()? };
        self.set_lifecycle(Lifecycle::Running);

        loop {
            let batch = unsafe { self.flush(&mut inflight)? };

            if batch == 0 && self.may_block() {
                match sys::io_uring_enter(
                    self.ring_fd.as_raw_fd(),
                    0,
                    1,
                    sys::IORING_ENTER_GETEVENTS,
                ) {
                    Ok(_) => {}
                    // A terminate signal interrupted the wait; the state
                    // update below observes the latch.
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => tracing::error!(error = %e, "io_uring_enter(GETEVENTS) failed"),
                }
            }

            unsafe { self.reap(&mut inflight) };

            match self.lifecycle() {
                Lifecycle::Running => {
                    if let Some(signo) = self.signal.raised() {
                        tracing::debug!(signo, "shutdown latched, draining in-flight IO");
                        if let Some(hooks) = exit_hooks.take() {
                            for hook in hooks {
                                hook();
                            }
                        }
                        if self.cancel_on_shutdown {
                            unsafe { self.cancel_all(&inflight)? };
                        }
                        self.set_lifecycle(Lifecycle::Closing);
                        // Break the next completion wait; a lost wake here
                        // would leave shutdown stuck in io_uring_enter.
                        if let Err(e) = self.signal.emit_wake() {
                            tracing::error!(error = %e, "failed to raise shutdown wake");
                        }
                    }
                }
                Lifecycle::Closing => {
                    // Quiescence: nothing flushed and nothing in flight
                    // beyond the pinned self-poll.
                    if batch == 0 && self.ongoing() <= 1 {
                        self.set_lifecycle(Lifecycle::Closed);
                        tracing::debug!("event loop closed");
                        return Ok(());
                    }
                }
                Lifecycle::Inactive | Lifecycle::Closed => {
                    unreachable!("lifecycle cannot regress inside the loop")
                }
            }
        }
    }

    fn may_block(&self) -> bool {
        match self.lifecycle() {
            // Skip the wait when a latch is already pending processing.
            Lifecycle::Running => self.signal.raised().is_none(),
            // While more than the self-poll is in flight a terminal
            // completion must arrive; at exactly one, blocking would wait
            // on a completion that can never come.
            Lifecycle::Closing => self.ongoing() > 1,
            Lifecycle::Inactive | Lifecycle::Closed => false,
        }
    }

    /// Move staged records into the kernel SQ, bounded by free SQ space;
    /// the remainder stays staged for the next iteration.
    unsafe fn flush(&self, inflight: &mut HashSet<u64>) -> Result<u32, IoError> {
        let mut batch = 0u32;
        while self.sq.free_space() > 0 {
            let Some((_slot, addr)) = self.staging.pop() else {
                break;
            };
            // Safety: the record stays boxed at a stable address until
            // its terminal completion frees it.
            let record = unsafe { &mut *(addr as *mut OpRecord) };
            unsafe { self.sq.push(record, addr as u64) };
            inflight.insert(addr as u64);
            batch += 1;
        }

        if batch > 0 {
            self.submit_batch(batch)?;
        }
        Ok(batch)
    }

    /// Tell the kernel about `batch` new SQEs and account them in flight.
    fn submit_batch(&self, batch: u32) -> Result<(), IoError> {
        let mut flags = sys::IORING_ENTER_SQ_WAIT;
        if self.sq.need_wakeup() {
            flags |= sys::IORING_ENTER_SQ_WAKEUP;
        }

        loop {
            match sys::io_uring_enter(self.ring_fd.as_raw_fd(), batch, 0, flags) {
                Ok(_) => break,
                // A submission batch must reach the kernel.
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.ongoing_ios.fetch_add(batch, Ordering::Release);
        Ok(())
    }

    /// Drain the CQ, dispatching each completion on its `user_data`.
    unsafe fn reap(&self, inflight: &mut HashSet<u64>) {
        while let Some(cqe) = self.cq.pop() {
            let more = cqe.flags & sys::IORING_CQE_F_MORE != 0;
            if !more {
                self.ongoing_ios.fetch_sub(1, Ordering::Release);
            }

            match cqe.user_data {
                0 => {
                    // Every SQE this engine submits carries a record
                    // address or the self-poll sentinel.
                    debug_assert!(false, "completion with user_data 0");
                    if cqe.res < 0 {
                        tracing::error!(res = cqe.res, "unowned completion failed");
                    }
                }
                sys::SELF_POLL_TOKEN => {
                    self.drain_wake_signal();
                    if !more && self.lifecycle() != Lifecycle::Closing {
                        // The kernel retired the multi-shot poll (CQ
                        // pressure, races); re-arm or wake-ups die
                        // silently.
                        if let Err(e) = unsafe { self.install_self_poll() } {
                            tracing::error!(error = %e, "failed to re-arm self-poll");
                        }
                    }
                }
                addr => {
                    // Safety: the address came out of our own SQE and its
                    // record is alive until this terminal completion.
                    let record = unsafe { &mut *(addr as usize as *mut OpRecord) };
                    match record.on_complete.as_mut() {
                        Some(callback) => callback(cqe.res),
                        None if cqe.res < 0 => {
                            tracing::error!(
                                op = record.kind(),
                                res = cqe.res,
                                "completion failed"
                            );
                        }
                        None => {}
                    }

                    if !more {
                        inflight.remove(&addr);
                        drop(unsafe { Box::from_raw(addr as usize as *mut OpRecord) });
                        self.ledger_free();
                    }
                }
            }
        }
    }

    /// Prep and submit the pinned self-poll.
    unsafe fn install_self_poll(&self) -> Result<(), IoError> {
        let record = unsafe { &mut *self.self_poll.get() };
        unsafe { self.sq.push(record, sys::SELF_POLL_TOKEN) };
        self.submit_batch(1)
    }

    /// Consume one pending wake signal; coalesced wake-ups may leave
    /// nothing to read.
    fn drain_wake_signal(&self) {
        let mut info = MaybeUninit::<libc::signalfd_siginfo>::uninit();
        let n = unsafe {
            libc::read(
                self.sfd.as_fd().as_raw_fd(),
                info.as_mut_ptr() as *mut libc::c_void,
                size_of::<libc::signalfd_siginfo>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!(error = %err, "signal-fd drain failed");
            }
        }
    }

    /// Sweep-cancel every tracked in-flight operation.
    unsafe fn cancel_all(&self, inflight: &HashSet<u64>) -> Result<(), IoError> {
        let targets: SmallVec<[u64; 16]> = inflight.iter().copied().collect();
        tracing::debug!(count = targets.len(), "cancelling in-flight operations");

        let mut batch = 0u32;
        for target in targets {
            while self.sq.free_space() == 0 {
                // SQ_WAIT inside also waits for the kernel to free room.
                self.submit_batch(batch)?;
                batch = 0;
            }

            self.ledger_alloc();
            let record = Box::into_raw(OpRecord::new(
                Op::Cancel { target },
                SqeMode::empty(),
                None,
            ));
            // Safety: the record is boxed and freed by its own terminal
            // completion in `reap`.
            unsafe { self.sq.push(&mut *record, record as u64) };
            batch += 1;
        }

        if batch > 0 {
            self.submit_batch(batch)?;
        }
        Ok(())
    }

    fn ledger_alloc(&self) {
        if cfg!(debug_assertions) {
            self.live_records.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn ledger_free(&self) {
        if cfg!(debug_assertions) {
            self.live_records.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl<const N: usize> Drop for AsyncIo<N> {
    fn drop(&mut self) {
        // Submissions that raced shutdown into the staging ring were
        // never flushed; reclaim them.
        while let Some((_slot, addr)) = self.staging.pop() {
            drop(unsafe { Box::from_raw(addr as *mut OpRecord) });
            self.ledger_free();
        }

        sys::munmap_ring(self.sqes.ptr, self.sqes.len);
        sys::munmap_ring(self.rings.ptr, self.rings.len);
        // ring_fd and sfd close on drop; the self-poll record frees with
        // its box.

        debug_assert_eq!(
            self.live_records.load(Ordering::Relaxed),
            0,
            "operation records leaked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::try_engine;

    #[test]
    fn fresh_engine_is_inactive_with_nothing_in_flight() {
        let signal = Signal::detached();
        let Some(io) = try_engine::<64>(Builder::new(), &signal) else {
            return;
        };

        assert_eq!(io.lifecycle(), Lifecycle::Inactive);
        assert_eq!(io.ongoing(), 0);
    }

    #[test]
    fn staging_overflow_frees_the_record() {
        let signal = Signal::detached();
        let Some(io) = try_engine::<16>(Builder::new(), &signal) else {
            return;
        };

        // No reaper drains the staging ring, so the 17th submission must
        // overflow and reclaim its record.
        for _ in 0..16 {
            io.timeout(Duration::from_secs(60), SqeMode::default(), None)
                .unwrap();
        }
        let overflow = io.timeout(Duration::from_secs(60), SqeMode::default(), None);
        assert!(matches!(overflow, Err(IoError::Overflow)));
    }

    #[test]
    fn oversized_transfer_lengths_are_rejected() {
        let signal = Signal::detached();
        let Some(io) = try_engine::<16>(Builder::new(), &signal) else {
            return;
        };

        let buf = IoBuffer::zeroed(8);
        let err = io
            .read(0, buf.clone(), 16, 0, SqeMode::default(), None)
            .unwrap_err();
        assert_eq!(
            err,
            IoError::BufferOverrun {
                requested: 16,
                capacity: 8,
            }
        );

        let err = io
            .recv(0, buf.clone(), 9, SqeMode::default(), None)
            .unwrap_err();
        assert!(matches!(err, IoError::BufferOverrun { .. }));

        // Nothing was staged or leaked: a rejected length never reaches
        // the ring.
        assert!(io.send(0, buf, 8, SqeMode::default(), None).is_ok());
    }
}
