//! Connection records and socket operations.
//!
//! A [`Socket`] owns one file descriptor: a listener, the receiving end of a
//! pass-fd channel, or an accepted client. Client sockets carry the state
//! the loop drives: the gate-guarded pending-event mask, the zero-copy
//! threshold and in-flight bookkeeping, the inbound chunk queue toward the
//! application, and the outbound byte queue away from it.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::buffer::{BLOCK_SIZE, MemoryHandle, MemoryPool};
use crate::config::{Config, IO_VECTORS_PER_AIO_SOCKET, IO_VECTORS_PER_SEND, NO_ZERO_COPY};
use crate::error::Error;
use crate::metrics;
use crate::scheduler::Scheduler;
use crate::sys::{self, PosixResult};

// Not yet in every libc release this crate supports; values are fixed ABI.
const MSG_ZEROCOPY: libc::c_int = 0x4000000;
const SO_ZEROCOPY: libc::c_int = 60;
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;
const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;

pub(crate) const EV_IN: u32 = libc::EPOLLIN as u32;
pub(crate) const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub(crate) const EV_ERR: u32 = libc::EPOLLERR as u32;
pub(crate) const EV_READY: u32 = EV_IN | EV_OUT | EV_ERR;
/// A re-arm for this socket is queued on the loop; don't queue another.
pub(crate) const EV_CONTROL_PENDING: u32 = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketKind {
    /// Listening socket, level-triggered `EPOLLIN`.
    Listener,
    /// Receiving end of an acceptor-thread fd channel.
    PassFd,
    /// Accepted connection, armed `EPOLLONESHOT`.
    Client,
}

/// Epoll registration state, guarded by the socket gate. All epoll
/// mutations for the socket happen with this lock held.
pub(crate) struct EventState {
    pub(crate) pending: u32,
    pub(crate) registered: bool,
}

/// Outcome of consuming the socket error queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZeroCopyResult {
    /// Nothing queued yet; keep `EPOLLERR` armed.
    Again,
    /// Completions retired without a copy.
    Success,
    /// The kernel fell back to copying at least once.
    Copied,
    /// The error queue held something other than a zero-copy notification.
    Fatal(i32),
}

/// What the loop should do after a receive result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReceiveOutcome {
    /// Data delivered (or spurious wakeup); the socket wants `EPOLLIN` again.
    WantsMore,
    /// Peer closed its write half.
    Eof,
    /// Hard receive error; the socket was aborted.
    Failed,
}

struct ReceiveSide {
    tx: Option<Sender<Vec<u8>>>,
    closed: bool,
}

struct SendChunk {
    data: Vec<u8>,
    offset: usize,
}

struct SendSide {
    chunks: VecDeque<SendChunk>,
    /// `shutdown(SHUT_WR)` once everything queued has left.
    shutdown_after_flush: bool,
    completed: bool,
}

struct ZeroCopySide {
    /// Kernel-assigned sequence of the next `MSG_ZEROCOPY` send; mirrors
    /// the per-socket counter the kernel reports completions against.
    next_seq: u32,
    in_flight: VecDeque<(u32, Vec<Vec<u8>>)>,
}

impl ZeroCopySide {
    /// Retire every in-flight send whose sequence falls in `[lo, hi]`.
    fn retire(&mut self, lo: u32, hi: u32) {
        let span = hi.wrapping_sub(lo);
        while let Some((seq, _)) = self.in_flight.front() {
            if seq.wrapping_sub(lo) <= span {
                self.in_flight.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct Socket {
    fd: RawFd,
    fd_closed: AtomicBool,
    kind: SocketKind,
    defer_send: bool,
    defer_accept: bool,
    pub(crate) gate: Mutex<EventState>,
    zero_copy_threshold: AtomicU32,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    recv: Mutex<ReceiveSide>,
    inbound: Mutex<Option<Receiver<Vec<u8>>>>,
    send: Mutex<SendSide>,
    zc: Mutex<ZeroCopySide>,
    /// Serializes whole flush passes: a direct sender and the loop's
    /// writability path may race, and interleaved `writev`s would reorder
    /// the stream.
    flush_lock: Mutex<()>,
}

impl Socket {
    fn bare(fd: RawFd, kind: SocketKind) -> Self {
        Socket {
            fd,
            fd_closed: AtomicBool::new(false),
            kind,
            defer_send: false,
            defer_accept: false,
            gate: Mutex::new(EventState {
                pending: 0,
                registered: false,
            }),
            zero_copy_threshold: AtomicU32::new(NO_ZERO_COPY),
            local_addr: None,
            peer_addr: None,
            recv: Mutex::new(ReceiveSide {
                tx: None,
                closed: false,
            }),
            inbound: Mutex::new(None),
            send: Mutex::new(SendSide {
                chunks: VecDeque::new(),
                shutdown_after_flush: false,
                completed: false,
            }),
            zc: Mutex::new(ZeroCopySide {
                next_seq: 0,
                in_flight: VecDeque::new(),
            }),
            flush_lock: Mutex::new(()),
        }
    }

    // ── construction ─────────────────────────────────────────────────

    /// Create, configure, bind, and listen. `cpu_id` feeds
    /// `SO_INCOMING_CPU` when the config asks for it.
    pub(crate) fn listener(addr: SocketAddr, config: &Config, cpu_id: usize) -> Result<Self, Error> {
        let domain = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let fd = sys::socket(domain, libc::SOCK_STREAM);
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(-fd as i32).into());
        }
        let fd = fd as RawFd;

        let mut sock = Socket::bare(fd, SocketKind::Listener);
        sock.defer_send = config.defer_send;
        sock.defer_accept = config.defer_accept;
        sock.zero_copy_threshold
            .store(config.effective_zero_copy_threshold(), Ordering::Relaxed);

        if let Err(err) = sock.configure_listener(addr, config, cpu_id) {
            sock.close();
            return Err(err);
        }
        // With port 0 the kernel picked one; record what we actually bound.
        sock.local_addr = sys::getsockname(fd);
        Ok(sock)
    }

    fn configure_listener(
        &self,
        addr: SocketAddr,
        config: &Config,
        cpu_id: usize,
    ) -> Result<(), Error> {
        self.set_socket_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        self.set_socket_option(libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        if addr.is_ipv6() {
            // Accept IPv4-mapped peers on the same listener.
            self.try_set_socket_option(libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0);
        }
        if config.receive_on_incoming_cpu {
            self.try_set_socket_option(libc::SOL_SOCKET, libc::SO_INCOMING_CPU, cpu_id as i32);
        }
        if config.defer_accept {
            self.try_set_socket_option(libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, 1);
        }
        if config.zero_copy {
            self.try_set_socket_option(libc::SOL_SOCKET, SO_ZEROCOPY, 1);
        }

        let res = self.try_bind(addr);
        if res < 0 {
            return Err(Error::from_bind_errno(-res as i32, addr));
        }
        let res = self.listen(config.backlog);
        if res < 0 {
            return Err(io::Error::from_raw_os_error(-res as i32).into());
        }
        Ok(())
    }

    /// Wrap the receiving end of an acceptor-thread socketpair.
    pub(crate) fn pass_fd_receiver(fd: RawFd, config: &Config) -> Self {
        let mut sock = Socket::bare(fd, SocketKind::PassFd);
        sock.defer_send = config.defer_send;
        sock.defer_accept = config.defer_accept;
        sock.zero_copy_threshold
            .store(config.effective_zero_copy_threshold(), Ordering::Relaxed);
        sock
    }

    /// Build a client record from a freshly accepted (or passed) fd,
    /// inheriting send policy from the accept socket.
    pub(crate) fn client(fd: RawFd, accept_socket: &Socket, peer: Option<SocketAddr>) -> Self {
        let mut sock = Socket::bare(fd, SocketKind::Client);
        sock.defer_send = accept_socket.defer_send;
        sock.zero_copy_threshold.store(
            accept_socket.zero_copy_threshold.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        sock.local_addr = sys::getsockname(fd);
        // A peer that can't be resolved marks the socket non-IP; those skip
        // TCP-level options.
        sock.peer_addr = peer.or_else(|| sys::getpeername(fd));
        if sock.peer_addr.is_some() {
            sock.try_set_socket_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
        }
        if sock.zero_copy_threshold.load(Ordering::Relaxed) != NO_ZERO_COPY {
            // SO_ZEROCOPY does not survive accept; opt the child in again.
            sock.try_set_socket_option(libc::SOL_SOCKET, SO_ZEROCOPY, 1);
        }
        let (tx, rx) = unbounded();
        *sock.recv.get_mut() = ReceiveSide {
            tx: Some(tx),
            closed: false,
        };
        *sock.inbound.get_mut() = Some(rx);
        sock
    }

    #[cfg(test)]
    pub(crate) fn client_for_tests(fd: RawFd) -> Self {
        let template = Socket::bare(-1, SocketKind::Listener);
        let mut sock = Socket::client(fd, &template, None);
        sock.local_addr = None;
        sock
    }

    // ── plain accessors ──────────────────────────────────────────────

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn kind(&self) -> SocketKind {
        self.kind
    }

    pub(crate) fn defer_send(&self) -> bool {
        self.defer_send
    }

    pub(crate) fn defer_accept(&self) -> bool {
        self.defer_accept
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub(crate) fn zero_copy_threshold(&self) -> u32 {
        self.zero_copy_threshold.load(Ordering::Relaxed)
    }

    pub(crate) fn zero_copy_enabled(&self) -> bool {
        self.zero_copy_threshold() != NO_ZERO_COPY
    }

    /// Permanently stop using `MSG_ZEROCOPY` on this socket.
    pub(crate) fn disable_zero_copy(&self) {
        self.zero_copy_threshold.store(NO_ZERO_COPY, Ordering::Relaxed);
    }

    // ── socket options / listener ops ────────────────────────────────

    pub(crate) fn set_socket_option(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) -> Result<(), Error> {
        let res = sys::setsockopt(self.fd, level, name, value);
        if res < 0 {
            return Err(io::Error::from_raw_os_error(-res as i32).into());
        }
        Ok(())
    }

    pub(crate) fn try_set_socket_option(
        &self,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
    ) {
        let _ = sys::setsockopt(self.fd, level, name, value);
    }

    pub(crate) fn try_bind(&self, addr: SocketAddr) -> PosixResult {
        sys::bind(self.fd, addr)
    }

    pub(crate) fn listen(&self, backlog: i32) -> PosixResult {
        sys::listen(self.fd, backlog)
    }

    /// One `accept4`. Returns the new fd (or negative errno) and the peer
    /// address when the kernel produced a resolvable one.
    pub(crate) fn try_accept(&self) -> (PosixResult, Option<SocketAddr>) {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let res = sys::accept4(self.fd, &mut storage);
        if res < 0 {
            return (res, None);
        }
        (res, sys::sockaddr_to_socket_addr(&storage))
    }

    /// Receive one connection fd over `SCM_RIGHTS`. Returns the fd, `0`
    /// when the sending side closed, or negative errno.
    pub(crate) fn try_receive_fd(&self) -> PosixResult {
        let mut byte = 0u8;
        let mut iov = libc::iovec {
            iov_base: &mut byte as *mut u8 as *mut libc::c_void,
            iov_len: 1,
        };
        let mut control: [u64; 4] = [0; 4];
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = std::mem::size_of_val(&control);

        let res = sys::recvmsg(self.fd, &mut msg, 0);
        if res <= 0 {
            return res;
        }
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() {
            return -(libc::EPROTO as isize);
        }
        let c = unsafe { &*cmsg };
        if c.cmsg_level != libc::SOL_SOCKET || c.cmsg_type != libc::SCM_RIGHTS {
            return -(libc::EPROTO as isize);
        }
        let fd = unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd) };
        fd as isize
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// Request the first read. Returns whether data may already be waiting
    /// (the listener held the connection until bytes arrived).
    pub(crate) fn start(&self, data_may_be_available: bool) -> bool {
        self.gate.lock().pending |= EV_IN;
        data_may_be_available
    }

    /// Tear down both directions; queued output is dropped.
    pub(crate) fn abort(&self) {
        {
            let mut recv = self.recv.lock();
            recv.closed = true;
            recv.tx = None;
        }
        {
            let mut send = self.send.lock();
            send.chunks.clear();
            send.completed = true;
        }
        self.zc.lock().in_flight.clear();
        // No further events wanted: a re-arm after close would address a
        // recycled fd number.
        self.gate.lock().pending &= EV_CONTROL_PENDING;
    }

    /// Close the descriptor exactly once; the map entry must already be
    /// gone so a recycled fd number can't be misattributed.
    pub(crate) fn close(&self) {
        if !self.fd_closed.swap(true, Ordering::AcqRel) {
            sys::close(self.fd);
        }
    }

    /// Both directions done: nothing left to read, nothing left to flush.
    pub(crate) fn is_finished(&self) -> bool {
        if !self.recv.lock().closed {
            return false;
        }
        let send = self.send.lock();
        (send.completed || send.chunks.is_empty()) && self.zc.lock().in_flight.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn input_closed(&self) -> bool {
        self.recv.lock().closed
    }

    // ── receive path ─────────────────────────────────────────────────

    /// How many iovecs the next receive wants.
    pub(crate) fn determine_receive_alloc(&self, max_iov: usize) -> usize {
        max_iov.min(IO_VECTORS_PER_AIO_SOCKET)
    }

    /// Pin pool blocks for a receive and point `iovecs` at them. Returns
    /// `(iov_len, advanced)` — `advanced` is bytes pre-consumed before
    /// submission, threaded through result interpretation.
    pub(crate) fn fill_receive_iovecs(
        &self,
        pool: &mut MemoryPool,
        scratch: &mut Vec<MemoryHandle>,
        iovecs: &mut [libc::iovec],
    ) -> (usize, u32) {
        let want = self.determine_receive_alloc(iovecs.len());
        for iovec in iovecs.iter_mut().take(want) {
            let handle = pool.acquire();
            iovec.iov_base = handle.as_ptr() as *mut libc::c_void;
            iovec.iov_len = handle.len();
            scratch.push(handle);
        }
        (want, 0)
    }

    /// Fold one kernel result into the running receive. Returns
    /// `(done, retval)`; when not done the same iovecs are resubmitted.
    pub(crate) fn interpret_receive_result(
        &self,
        res: i64,
        received: &mut u32,
        advanced: u32,
    ) -> (bool, isize) {
        if res > 0 {
            *received += res as u32;
            (true, (advanced + *received) as isize)
        } else if res == 0 {
            let total = advanced + *received;
            (true, total as isize)
        } else if res == -(libc::EAGAIN as i64) {
            (false, 0)
        } else {
            (true, res as isize)
        }
    }

    /// Synchronous receive: pin blocks, `readv`, copy out, release.
    /// Returns the raw result plus the received bytes, if any.
    pub(crate) fn receive(
        &self,
        pool: &mut MemoryPool,
        scratch: &mut Vec<MemoryHandle>,
    ) -> (PosixResult, Option<Vec<u8>>) {
        let start = scratch.len();
        let mut iovecs = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; IO_VECTORS_PER_AIO_SOCKET];
        let (iov_len, _advanced) = self.fill_receive_iovecs(pool, scratch, &mut iovecs);

        let res = sys::readv(self.fd, iovecs.as_ptr(), iov_len);
        let chunk = if res > 0 {
            Some(Self::gather_chunk(&scratch[start..], res as usize))
        } else {
            None
        };
        for handle in scratch.drain(start..) {
            pool.release(handle);
        }
        (res, chunk)
    }

    /// Copy `len` received bytes out of consecutive pinned blocks.
    pub(crate) fn gather_chunk(handles: &[MemoryHandle], len: usize) -> Vec<u8> {
        let mut chunk = Vec::with_capacity(len);
        let mut remaining = len;
        for handle in handles {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(BLOCK_SIZE);
            chunk.extend_from_slice(unsafe { handle.filled(take) });
            remaining -= take;
        }
        debug_assert_eq!(remaining, 0);
        chunk
    }

    /// Hand a received chunk toward the application (dispatch mode).
    pub(crate) fn deliver(&self, chunk: Vec<u8>) {
        metrics::BYTES_RECEIVED.add(chunk.len() as u64);
        let recv = self.recv.lock();
        if let Some(tx) = &recv.tx {
            let _ = tx.send(chunk);
        }
    }

    /// React to a completed receive.
    pub(crate) fn on_receive_from_socket(&self, result: isize) -> ReceiveOutcome {
        if result > 0 || result == -(libc::EAGAIN as isize) {
            self.gate.lock().pending |= EV_IN;
            return ReceiveOutcome::WantsMore;
        }
        let mut recv = self.recv.lock();
        recv.closed = true;
        recv.tx = None;
        if result == 0 {
            ReceiveOutcome::Eof
        } else {
            ReceiveOutcome::Failed
        }
    }

    // ── send path ────────────────────────────────────────────────────

    /// Append application bytes to the outbound queue.
    pub(crate) fn queue_send(&self, data: &[u8]) -> io::Result<()> {
        let mut send = self.send.lock();
        if send.completed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        send.chunks.push_back(SendChunk {
            data: data.to_vec(),
            offset: 0,
        });
        Ok(())
    }

    /// Half-close the write side once everything queued has flushed.
    pub(crate) fn queue_shutdown(&self) {
        self.send.lock().shutdown_after_flush = true;
    }

    /// True when a scheduled send has nothing to do: the source errored or
    /// ran dry with a shutdown pending. Completes the output synchronously.
    pub(crate) fn take_send_completion(&self) -> bool {
        let mut send = self.send.lock();
        if send.completed {
            return true;
        }
        if send.chunks.is_empty() {
            if send.shutdown_after_flush && self.zc.lock().in_flight.is_empty() {
                sys::shutdown_write(self.fd);
                send.completed = true;
            }
            return true;
        }
        false
    }

    /// Number of iovecs the next send submission will occupy.
    pub(crate) fn calc_send_iovecs(&self) -> usize {
        self.send.lock().chunks.len().min(IO_VECTORS_PER_SEND)
    }

    /// Point `iovecs` at the front outbound chunks. The backing buffers are
    /// stable: chunk offsets only advance on this loop's thread, and heap
    /// data never moves when the deque reallocates.
    pub(crate) fn fill_send_iovecs(&self, iovecs: &mut [libc::iovec]) -> usize {
        let send = self.send.lock();
        let mut n = 0;
        for chunk in send.chunks.iter().take(iovecs.len()) {
            iovecs[n].iov_base = chunk.data[chunk.offset..].as_ptr() as *mut libc::c_void;
            iovecs[n].iov_len = chunk.data.len() - chunk.offset;
            n += 1;
        }
        n
    }

    /// Fold a send result into the queue. Returns `true` when the socket
    /// should be re-enqueued for another pass.
    pub(crate) fn handle_send_result(&self, res: isize) -> bool {
        if res == -(libc::EAGAIN as isize) {
            self.request_writable();
            return false;
        }
        if res < 0 {
            self.complete_output(Some(-res as i32));
            return false;
        }
        metrics::BYTES_SENT.add(res as u64);
        let drained = {
            let mut send = self.send.lock();
            Self::advance_chunks(&mut send.chunks, res as usize);
            send.chunks.is_empty()
        };
        if drained {
            let _ = self.take_send_completion();
            false
        } else {
            true
        }
    }

    fn advance_chunks(chunks: &mut VecDeque<SendChunk>, mut written: usize) {
        while written > 0 {
            let front = chunks.front_mut().expect("wrote more than was queued");
            let left = front.data.len() - front.offset;
            if written >= left {
                written -= left;
                chunks.pop_front();
            } else {
                front.offset += written;
                written = 0;
            }
        }
    }

    /// Arm `EPOLLOUT` on the next re-arm pass.
    pub(crate) fn request_writable(&self) {
        self.gate.lock().pending |= EV_OUT;
    }

    /// Bytes still queued for transmission.
    pub(crate) fn has_pending_output(&self) -> bool {
        !self.send.lock().chunks.is_empty()
    }

    /// Writability arrived (or the loop is stopping).
    pub(crate) fn on_writable(&self, stopped: bool) {
        if stopped {
            self.complete_output(Some(libc::ECANCELED));
            return;
        }
        self.flush_outbound();
    }

    /// Flush queued output: plain `writev`, or `sendmsg(MSG_ZEROCOPY)` for
    /// batches at or above the threshold. Runs on the loop thread for
    /// deferred sends and on the caller's thread otherwise; the send lock
    /// serializes the two.
    pub(crate) fn flush_outbound(&self) {
        let _flush = self.flush_lock.lock();
        if self.fd_closed.load(Ordering::Acquire) {
            self.complete_output(Some(libc::EBADF));
            return;
        }
        loop {
            if self.take_send_completion() {
                return;
            }
            let mut iovecs = [libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            }; IO_VECTORS_PER_SEND];
            let iov_len = self.fill_send_iovecs(&mut iovecs);
            let total: usize = iovecs[..iov_len].iter().map(|v| v.iov_len).sum();

            let threshold = self.zero_copy_threshold();
            let res = if threshold != NO_ZERO_COPY && total >= threshold as usize {
                self.send_zero_copy(&iovecs[..iov_len])
            } else {
                sys::writev(self.fd, iovecs.as_ptr(), iov_len)
            };

            if res == -(libc::EAGAIN as isize) {
                self.request_writable();
                return;
            }
            if res < 0 {
                self.complete_output(Some(-res as i32));
                return;
            }
            metrics::BYTES_SENT.add(res as u64);
            let mut send = self.send.lock();
            Self::advance_chunks(&mut send.chunks, res as usize);
        }
    }

    /// One `MSG_ZEROCOPY` submission. Fully-written chunks move into the
    /// in-flight table until the kernel's completion retires them; a
    /// partially-written tail is copied back onto the queue so the pinned
    /// pages stay alive untouched.
    fn send_zero_copy(&self, iovecs: &[libc::iovec]) -> PosixResult {
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = iovecs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iovecs.len();
        let res = sys::sendmsg(self.fd, &msg, MSG_ZEROCOPY);
        if res <= 0 {
            return res;
        }
        let written = res as usize;

        let mut send = self.send.lock();
        let mut zc = self.zc.lock();
        let seq = zc.next_seq;
        zc.next_seq = zc.next_seq.wrapping_add(1);

        let mut pinned = Vec::new();
        let mut remaining = written;
        while remaining > 0 {
            let front = send.chunks.front().expect("wrote more than was queued");
            let left = front.data.len() - front.offset;
            if remaining >= left {
                remaining -= left;
                pinned.push(send.chunks.pop_front().expect("checked front").data);
            } else {
                // Split: the sent prefix is pinned by the kernel, so the
                // whole buffer parks in-flight and the unsent tail requeues
                // as a fresh chunk.
                let chunk = send.chunks.pop_front().expect("checked front");
                let tail = chunk.data[chunk.offset + remaining..].to_vec();
                pinned.push(chunk.data);
                send.chunks.push_front(SendChunk {
                    data: tail,
                    offset: 0,
                });
                remaining = 0;
            }
        }
        zc.in_flight.push_back((seq, pinned));
        drop(zc);
        drop(send);

        // Completion arrives as EPOLLERR; nothing else re-arms it for us.
        self.gate.lock().pending |= EV_ERR;
        res
    }

    /// Flush failed or the loop is tearing the socket down.
    pub(crate) fn complete_output(&self, _error: Option<i32>) {
        {
            let mut send = self.send.lock();
            send.chunks.clear();
            send.completed = true;
        }
        {
            // A dead write side makes the read side unreachable too.
            let mut recv = self.recv.lock();
            recv.closed = true;
            recv.tx = None;
        }
        self.gate.lock().pending &= EV_CONTROL_PENDING;
    }

    // ── zero-copy completions ────────────────────────────────────────

    /// Drain the socket error queue and retire completed zero-copy sends.
    pub(crate) fn complete_zero_copy(&self) -> ZeroCopyResult {
        let mut reaped = false;
        let mut copied = false;
        loop {
            let mut control: [u64; 8] = [0; 8];
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = std::mem::size_of_val(&control);

            let res = sys::recvmsg(self.fd, &mut msg, libc::MSG_ERRQUEUE);
            if res == -(libc::EAGAIN as isize) {
                break;
            }
            if res < 0 {
                return ZeroCopyResult::Fatal(-res as i32);
            }

            let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
            while !cmsg.is_null() {
                let c = unsafe { &*cmsg };
                let is_recverr = (c.cmsg_level == libc::SOL_IP && c.cmsg_type == libc::IP_RECVERR)
                    || (c.cmsg_level == libc::SOL_IPV6 && c.cmsg_type == libc::IPV6_RECVERR);
                if is_recverr {
                    let serr = unsafe {
                        std::ptr::read_unaligned(
                            libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err
                        )
                    };
                    if serr.ee_errno != 0 || serr.ee_origin != SO_EE_ORIGIN_ZEROCOPY {
                        return ZeroCopyResult::Fatal(serr.ee_errno as i32);
                    }
                    if serr.ee_code & SO_EE_CODE_ZEROCOPY_COPIED != 0 {
                        copied = true;
                    }
                    self.zc.lock().retire(serr.ee_info, serr.ee_data);
                    metrics::ZERO_COPY_COMPLETIONS.increment();
                    reaped = true;
                }
                cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
            }
        }
        if !reaped {
            ZeroCopyResult::Again
        } else if copied {
            ZeroCopyResult::Copied
        } else {
            ZeroCopyResult::Success
        }
    }

    /// Buffers were retired; resume whatever the flush was waiting on.
    pub(crate) fn on_zero_copy_completed(&self) {
        self.flush_outbound();
    }

    // ── application surface plumbing ─────────────────────────────────

    fn pop_inbound_blocking(&self) -> Option<Vec<u8>> {
        let rx = self.inbound.lock();
        rx.as_ref()?.recv().ok()
    }

    fn pop_inbound(&self) -> Option<Vec<u8>> {
        let rx = self.inbound.lock();
        rx.as_ref()?.try_recv().ok()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // Error paths and never-registered sockets still own their fd.
        self.close();
    }
}

/// An accepted connection, handed to the application through the accept
/// queue.
pub struct Connection {
    pub(crate) sock: Arc<Socket>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) worker_id: usize,
}

impl Connection {
    /// Index of the event loop that accepted this connection.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Whether `MSG_ZEROCOPY` is still in play for this connection. Flips
    /// off permanently once the kernel reports a copied completion.
    pub fn zero_copy_enabled(&self) -> bool {
        self.sock.zero_copy_enabled()
    }

    /// Block for the next received chunk. `None` means end of stream.
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.sock.pop_inbound_blocking()
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.sock.pop_inbound()
    }

    /// Queue bytes for transmission. With defer-send the write coalesces on
    /// the loop thread; otherwise it is attempted here and falls back to
    /// `EPOLLOUT` on a short write.
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.sock.queue_send(data)?;
        if self.sock.defer_send() {
            self.scheduler.schedule_send(self.sock.clone());
        } else {
            self.sock.flush_outbound();
            if self.sock.has_pending_output() || self.sock.is_finished() {
                // Short write or teardown: the loop owns epoll, hand over.
                self.scheduler.schedule_send(self.sock.clone());
            }
        }
        Ok(())
    }

    /// Half-close the write side after all queued output has flushed.
    pub fn shutdown_write(&self) {
        self.sock.queue_shutdown();
        self.scheduler.schedule_send(self.sock.clone());
    }

    /// Abort the connection: queued output is dropped and the read side
    /// reports end-of-stream. The loop performs the actual removal and
    /// close on its own thread.
    pub fn close(&self) {
        self.sock.abort();
        self.scheduler.schedule_send(self.sock.clone());
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.sock.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sock.local_addr()
    }
}
