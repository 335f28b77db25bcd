//! The per-thread event loop.
//!
//! One OS thread runs [`EventLoop::run`]: it parks in `epoll_wait`,
//! classifies the returned batch under the fd-map mutex, then dispatches in
//! a fixed order — zero-copy completions, accepts, writes, reads, epoll
//! re-arms, pipe commands, scheduled sends. Foreign threads talk to the
//! loop only through the scheduler gate, the wakeup pipe, and the accept
//! queue.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::aio::{
    AioArena, AioContext, IOCB_CMD_NOOP, IOCB_CMD_PREADV, IOCB_CMD_PWRITEV, Iocb, pack_receive_data,
    unpack_receive_data,
};
use crate::buffer::{MemoryHandle, MemoryPool};
use crate::config::{Config, EVENT_BUFFER_LENGTH, MAX_EAGAIN_COUNT, SchedulingMode};
use crate::error::Error;
use crate::metrics;
use crate::pipe::{Command, PipeReader, wakeup_pipe};
use crate::scheduler::Scheduler;
use crate::socket::{
    Connection, EV_CONTROL_PENDING, EV_ERR, EV_IN, EV_OUT, EV_READY, ReceiveOutcome, Socket,
    SocketKind, ZeroCopyResult,
};
use crate::sys;

/// Callback invoked on the loop thread in [`SchedulingMode::Inline`].
pub type DataHandler = Arc<dyn Fn(&Connection, Vec<u8>) + Send + Sync>;

/// State reachable from foreign threads: the fd map and the scheduler.
pub(crate) struct LoopShared {
    sockets: Mutex<HashMap<RawFd, Arc<Socket>>>,
    pub(crate) scheduler: Arc<Scheduler>,
    accept_closed: AtomicBool,
}

impl LoopShared {
    /// Remove a socket from the map; only the caller that observes
    /// `removed == true` may close the fd afterwards. Removal precedes
    /// close so an epoll event carrying a recycled fd number can never be
    /// attributed to the wrong socket. Callable from any thread; returns
    /// `(removed, map_now_empty)`.
    pub(crate) fn remove_socket(&self, fd: RawFd) -> (bool, bool) {
        let mut map = self.sockets.lock();
        let removed = map.remove(&fd).is_some();
        (removed, map.is_empty())
    }
}

pub(crate) struct EventLoop {
    config: Config,
    worker_id: usize,
    shared: Arc<LoopShared>,
    pipe: PipeReader,
    epoll_fd: RawFd,
    pool: MemoryPool,
    aio_ctx: Option<AioContext>,
    arena: Option<AioArena>,
    accept_tx: Option<Sender<Connection>>,
    accept_sockets: Vec<Arc<Socket>>,
    inline_handler: Option<DataHandler>,
    running: bool,
    accept_closed: bool,
    // Reusable scratch, cleared every iteration.
    acceptable: Vec<Arc<Socket>>,
    readable: Vec<Arc<Socket>>,
    writable: Vec<Arc<Socket>>,
    rearm: Vec<Arc<Socket>>,
    zc_completed: Vec<Arc<Socket>>,
    running_sends: Vec<Arc<Socket>>,
    handles: Vec<MemoryHandle>,
    pipe_readable: bool,
}

impl EventLoop {
    pub(crate) fn new(
        config: Config,
        worker_id: usize,
        accept_sockets: Vec<Socket>,
        accept_tx: Sender<Connection>,
        inline_handler: Option<DataHandler>,
    ) -> Result<(Self, Arc<LoopShared>), Error> {
        let epoll_fd = sys::epoll_create1();
        if epoll_fd < 0 {
            return Err(std::io::Error::from_raw_os_error(-epoll_fd as i32).into());
        }
        let epoll_fd = epoll_fd as RawFd;

        let (pipe_reader, pipe_writer) = wakeup_pipe()?;
        let shared = Arc::new(LoopShared {
            sockets: Mutex::new(HashMap::new()),
            scheduler: Arc::new(Scheduler::new(pipe_writer)),
            accept_closed: AtomicBool::new(false),
        });

        let (aio_ctx, arena) = if config.aio_receive || config.aio_send {
            (
                Some(AioContext::setup(EVENT_BUFFER_LENGTH as u32)?),
                Some(AioArena::new()),
            )
        } else {
            (None, None)
        };

        let scratch = || Vec::with_capacity(EVENT_BUFFER_LENGTH);
        let event_loop = EventLoop {
            config,
            worker_id,
            shared: shared.clone(),
            pipe: pipe_reader,
            epoll_fd,
            pool: MemoryPool::new(),
            aio_ctx,
            arena,
            accept_tx: Some(accept_tx),
            accept_sockets: accept_sockets.into_iter().map(Arc::new).collect(),
            inline_handler,
            running: true,
            accept_closed: false,
            acceptable: Vec::with_capacity(4),
            readable: scratch(),
            writable: scratch(),
            rearm: scratch(),
            zc_completed: scratch(),
            running_sends: scratch(),
            handles: Vec::with_capacity(EVENT_BUFFER_LENGTH),
            pipe_readable: false,
        };
        Ok((event_loop, shared))
    }

    /// Drive the loop until a stop command arrives, then dispose.
    pub(crate) fn run(&mut self) -> Result<(), Error> {
        self.setup()?;
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; EVENT_BUFFER_LENGTH];

        while self.running {
            let n = sys::epoll_wait(self.epoll_fd, &mut events);
            if n < 0 {
                return Err(std::io::Error::from_raw_os_error(-n as i32).into());
            }
            // From here until the loop re-parks, producers see NotBlocked
            // and skip the wakeup byte.
            self.shared.scheduler.mark_unparked();

            self.classify(&events[..n as usize])?;
            self.dispatch()?;
            if self.pipe_readable {
                self.drain_pipe();
            }
            self.do_scheduled_work()?;
        }

        self.dispose();
        Ok(())
    }

    fn setup(&mut self) -> Result<(), Error> {
        let res = sys::epoll_ctl(
            self.epoll_fd,
            libc::EPOLL_CTL_ADD,
            self.pipe.fd,
            EV_IN,
        );
        if res < 0 {
            return Err(std::io::Error::from_raw_os_error(-res as i32).into());
        }
        for sock in &self.accept_sockets {
            self.shared.sockets.lock().insert(sock.fd(), sock.clone());
            let res = sys::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, sock.fd(), EV_IN);
            if res < 0 {
                return Err(std::io::Error::from_raw_os_error(-res as i32).into());
            }
        }
        Ok(())
    }

    // ── classification ───────────────────────────────────────────────

    /// One pass over the event batch under the map mutex. Stale fds (the
    /// socket was removed before we looked) are silently dropped.
    fn classify(&mut self, events: &[libc::epoll_event]) -> Result<(), Error> {
        self.acceptable.clear();
        self.readable.clear();
        self.writable.clear();
        self.rearm.clear();
        self.zc_completed.clear();
        self.pipe_readable = false;

        let shared = self.shared.clone();
        let map = shared.sockets.lock();
        for event in events {
            let fd = event.u64 as u32 as RawFd;
            if fd == self.pipe.fd {
                self.pipe_readable = true;
                continue;
            }
            let Some(sock) = map.get(&fd) else {
                continue;
            };
            match sock.kind() {
                SocketKind::Listener | SocketKind::PassFd => {
                    self.acceptable.push(sock.clone());
                }
                SocketKind::Client => {
                    self.classify_client(sock, event.events)?;
                }
            }
        }
        Ok(())
    }

    fn classify_client(&mut self, sock: &Arc<Socket>, raw_events: u32) -> Result<(), Error> {
        let mut state = sock.gate.lock();
        let mut events = raw_events & state.pending & EV_READY;

        if events & EV_ERR != 0 && sock.zero_copy_enabled() {
            match sock.complete_zero_copy() {
                ZeroCopyResult::Again => {
                    // No completion yet; EPOLLERR stays pending for re-arm.
                    events &= !EV_ERR;
                }
                ZeroCopyResult::Success => {
                    events &= !EV_ERR;
                    state.pending &= !EV_ERR;
                    self.zc_completed.push(sock.clone());
                }
                ZeroCopyResult::Copied => {
                    events &= !EV_ERR;
                    state.pending &= !EV_ERR;
                    sock.disable_zero_copy();
                    self.zc_completed.push(sock.clone());
                }
                ZeroCopyResult::Fatal(errno) => {
                    return Err(Error::AioInvariant(format!(
                        "unexpected error-queue state on fd {}: errno {errno}",
                        sock.fd()
                    )));
                }
            }
        }
        if events & EV_ERR != 0 {
            // A real error: the socket must drain both halves so the
            // application observes it.
            events |= EV_IN | EV_OUT;
            events &= !EV_ERR;
            state.pending &= !EV_ERR;
        }

        if events & EV_IN != 0 {
            state.pending &= !EV_IN;
            self.readable.push(sock.clone());
        }
        if events & EV_OUT != 0 {
            state.pending &= !EV_OUT;
            self.writable.push(sock.clone());
        }
        // The socket still wants events this batch didn't deliver.
        if state.pending & EV_READY != 0 && state.pending & EV_CONTROL_PENDING == 0 {
            state.pending |= EV_CONTROL_PENDING;
            self.rearm.push(sock.clone());
        }
        Ok(())
    }

    // ── dispatch ─────────────────────────────────────────────────────

    fn dispatch(&mut self) -> Result<(), Error> {
        for i in 0..self.zc_completed.len() {
            let sock = self.zc_completed[i].clone();
            sock.on_zero_copy_completed();
            self.maybe_finish(&sock);
        }

        for i in 0..self.acceptable.len() {
            let sock = self.acceptable[i].clone();
            self.handle_accept(&sock);
        }

        for i in 0..self.writable.len() {
            let sock = self.writable[i].clone();
            sock.on_writable(false);
            self.maybe_finish(&sock);
        }

        if self.config.aio_receive && !self.readable.is_empty() {
            self.aio_receive_batch()?;
        } else {
            for i in 0..self.readable.len() {
                let sock = self.readable[i].clone();
                let (res, chunk) = sock.receive(&mut self.pool, &mut self.handles);
                self.complete_receive(&sock, res, chunk);
            }
        }

        // Re-arm after the handlers: they request the next events they
        // want, so every touched socket is a candidate. Re-arming twice is
        // an idempotent EPOLL_CTL_MOD.
        for i in 0..self.rearm.len() {
            let sock = self.rearm[i].clone();
            self.rearm_socket(&sock);
        }
        for i in 0..self.zc_completed.len() {
            let sock = self.zc_completed[i].clone();
            self.rearm_socket(&sock);
        }
        for i in 0..self.writable.len() {
            let sock = self.writable[i].clone();
            self.rearm_socket(&sock);
        }
        for i in 0..self.readable.len() {
            let sock = self.readable[i].clone();
            self.rearm_socket(&sock);
        }
        Ok(())
    }

    /// Arm whatever the socket still wants, `EPOLLONESHOT` always set.
    /// Errors are ignored: a finished socket's fd is already closed and
    /// auto-deregistered, so `EPOLL_CTL_MOD` fails with `ENOENT`/`EBADF`.
    fn rearm_socket(&self, sock: &Arc<Socket>) {
        let mut state = sock.gate.lock();
        state.pending &= !EV_CONTROL_PENDING;
        let mask = state.pending & EV_READY;
        if mask == 0 {
            return;
        }
        let op = if state.registered {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let res = sys::epoll_ctl(
            self.epoll_fd,
            op,
            sock.fd(),
            mask | libc::EPOLLONESHOT as u32,
        );
        if res >= 0 {
            state.registered = true;
        }
    }

    // ── accept path ──────────────────────────────────────────────────

    /// Exactly one accept per event: draining aggressively would defeat
    /// `SO_REUSEPORT` balancing across sibling loops.
    fn handle_accept(&mut self, accept_socket: &Arc<Socket>) {
        let (fd, peer) = match accept_socket.kind() {
            SocketKind::Listener => accept_socket.try_accept(),
            SocketKind::PassFd => {
                let res = accept_socket.try_receive_fd();
                if res == 0 {
                    // The acceptor thread closed its end.
                    self.close_accept_socket(accept_socket);
                    return;
                }
                (res, None)
            }
            SocketKind::Client => unreachable!("clients are never in the accept list"),
        };
        if fd < 0 {
            return;
        }

        let client = Arc::new(Socket::client(fd as RawFd, accept_socket, peer));
        metrics::CONNECTIONS_ACCEPTED.increment();

        // Queue first (unbounded, cannot fail), then map, then start.
        if let Some(tx) = &self.accept_tx {
            let _ = tx.send(Connection {
                sock: client.clone(),
                scheduler: self.shared.scheduler.clone(),
                worker_id: self.worker_id,
            });
        }
        self.shared.sockets.lock().insert(client.fd(), client.clone());
        let data_may_be_available = client.start(accept_socket.defer_accept());
        self.rearm_socket(&client);
        if data_may_be_available {
            self.readable.push(client);
        }
    }

    fn close_accept_socket(&mut self, sock: &Arc<Socket>) {
        self.shared.sockets.lock().remove(&sock.fd());
        sock.close();
        self.accept_sockets.retain(|s| s.fd() != sock.fd());
    }

    // ── receive paths ────────────────────────────────────────────────

    fn complete_receive(&mut self, sock: &Arc<Socket>, result: isize, chunk: Option<Vec<u8>>) {
        if let Some(chunk) = chunk {
            match (&self.inline_handler, self.config.scheduling) {
                (Some(handler), SchedulingMode::Inline) => {
                    metrics::BYTES_RECEIVED.add(chunk.len() as u64);
                    let conn = Connection {
                        sock: sock.clone(),
                        scheduler: self.shared.scheduler.clone(),
                        worker_id: self.worker_id,
                    };
                    handler(&conn, chunk);
                }
                _ => sock.deliver(chunk),
            }
        }
        match sock.on_receive_from_socket(result) {
            ReceiveOutcome::WantsMore => {}
            ReceiveOutcome::Eof | ReceiveOutcome::Failed => self.maybe_finish(sock),
        }
    }

    /// Batched receive through `io_submit`/`io_getevents`.
    fn aio_receive_batch(&mut self) -> Result<(), Error> {
        let mut arena = self.arena.take().expect("aio_receive requires the arena");
        let ctx = self.aio_ctx.take().expect("aio_receive requires a context");

        let count = self.readable.len().min(EVENT_BUFFER_LENGTH);
        let mut results: Vec<Option<isize>> = vec![None; count];
        let mut handle_ranges: Vec<(usize, usize)> = Vec::with_capacity(count);

        {
            let (events, iocbs, ptrs, iovecs) = arena.tables();

            for i in 0..count {
                let sock = self.readable[i].clone();
                let start = self.handles.len();
                let slot = AioArena::iovec_slot(iovecs, i);
                let (iov_len, advanced) =
                    sock.fill_receive_iovecs(&mut self.pool, &mut self.handles, slot);
                handle_ranges.push((start, self.handles.len()));

                let iocb = &mut iocbs[i];
                *iocb = unsafe { std::mem::zeroed() };
                iocb.aio_data = pack_receive_data(0, advanced, iov_len as u32);
                iocb.aio_lio_opcode = IOCB_CMD_PREADV;
                iocb.aio_fildes = sock.fd() as u32;
                iocb.aio_buf = slot.as_ptr() as u64;
                iocb.aio_nbytes = iov_len as u64;
            }
            for i in 0..count {
                ptrs[i] = std::ptr::from_mut(&mut iocbs[i]);
            }

            let iocbs_base = iocbs.as_ptr() as usize;
            let mut active = count;
            let mut eagain_rounds: u32 = 0;

            while active > 0 {
                metrics::AIO_SUBMIT_BATCHES.increment();
                let submitted = ctx.submit(ptrs.as_mut_ptr(), active);
                if submitted != active as isize {
                    return Err(Error::AioInvariant(format!(
                        "io_submit returned {submitted}, expected {active}"
                    )));
                }
                let reaped = ctx.get_events(events.as_mut_ptr(), active);
                if reaped != active as isize {
                    return Err(Error::AioInvariant(format!(
                        "io_getevents returned {reaped}, expected {active}"
                    )));
                }

                let mut next_active = 0;
                let mut all_eagain = true;
                for e in 0..active {
                    let event = events[e];
                    let idx = (event.obj as usize - iocbs_base) / std::mem::size_of::<Iocb>();
                    let sock = &self.readable[idx];
                    let (mut received, advanced, iov_len) = unpack_receive_data(event.data);
                    let (done, retval) =
                        sock.interpret_receive_result(event.res, &mut received, advanced);
                    if done {
                        results[idx] = Some(retval);
                        // Excluded from the retry submission below.
                        iocbs[idx].aio_lio_opcode = IOCB_CMD_NOOP;
                    } else {
                        if event.res != -(libc::EAGAIN as i64) {
                            all_eagain = false;
                        }
                        iocbs[idx].aio_data = pack_receive_data(received, advanced, iov_len);
                        ptrs[next_active] = std::ptr::from_mut(&mut iocbs[idx]);
                        next_active += 1;
                    }
                }

                if next_active > 0 {
                    metrics::AIO_RETRY_ROUNDS.increment();
                    if all_eagain {
                        eagain_rounds += 1;
                        if eagain_rounds >= MAX_EAGAIN_COUNT {
                            return Err(Error::AioInvariant(format!(
                                "{MAX_EAGAIN_COUNT} consecutive all-EAGAIN aio rounds"
                            )));
                        }
                    } else {
                        eagain_rounds = 0;
                    }
                }
                active = next_active;
            }
        }

        // Deliver, then release exactly what was acquired.
        for i in 0..count {
            let sock = self.readable[i].clone();
            let result = results[i].unwrap_or(0);
            let (start, end) = handle_ranges[i];
            let chunk = if result > 0 {
                Some(Socket::gather_chunk(
                    &self.handles[start..end],
                    result as usize,
                ))
            } else {
                None
            };
            self.complete_receive(&sock, result, chunk);
        }
        for handle in self.handles.drain(..) {
            self.pool.release(handle);
        }

        self.arena = Some(arena);
        self.aio_ctx = Some(ctx);
        Ok(())
    }

    // ── scheduled sends ──────────────────────────────────────────────

    fn do_scheduled_work(&mut self) -> Result<(), Error> {
        let scheduler = self.shared.scheduler.clone();
        debug_assert!(self.running_sends.is_empty());
        scheduler.begin_run(&mut self.running_sends);

        if !self.running_sends.is_empty() {
            if self.config.aio_send {
                self.aio_send_batch()?;
            } else {
                while let Some(sock) = self.running_sends.pop() {
                    sock.on_writable(false);
                    self.rearm_socket(&sock);
                    self.maybe_finish(&sock);
                }
            }
        }
        self.running_sends.clear();

        if scheduler.finish_run() {
            // More sends arrived while we were processing; don't park.
            metrics::WAKEUP_WRITES.increment();
            scheduler.post(Command::ActionsPending);
        }
        Ok(())
    }

    /// Batched send through AIO `PWRITEV`. Sockets whose source has dried
    /// up or errored complete synchronously without a submission.
    fn aio_send_batch(&mut self) -> Result<(), Error> {
        let mut arena = self.arena.take().expect("aio_send requires the arena");
        let ctx = self.aio_ctx.take().expect("aio_send requires a context");

        while !self.running_sends.is_empty() {
            let batch = self.running_sends.len().min(EVENT_BUFFER_LENGTH);
            let mut requeue: Vec<Arc<Socket>> = Vec::new();
            {
                let (events, iocbs, ptrs, iovecs) = arena.tables();
                let mut send_count = 0;
                let mut completed_count = 0;

                for i in 0..batch {
                    let sock = self.running_sends[i].clone();
                    if sock.take_send_completion() {
                        completed_count += 1;
                        continue;
                    }
                    let slot = AioArena::iovec_slot(iovecs, send_count);
                    let wanted = sock.calc_send_iovecs();
                    let iov_len = sock.fill_send_iovecs(&mut slot[..wanted]);

                    let iocb = &mut iocbs[send_count];
                    *iocb = unsafe { std::mem::zeroed() };
                    iocb.aio_data = i as u64;
                    iocb.aio_lio_opcode = IOCB_CMD_PWRITEV;
                    iocb.aio_fildes = sock.fd() as u32;
                    iocb.aio_buf = slot.as_ptr() as u64;
                    iocb.aio_nbytes = iov_len as u64;
                    send_count += 1;
                }

                if send_count > 0 {
                    for i in 0..send_count {
                        ptrs[i] = std::ptr::from_mut(&mut iocbs[i]);
                    }
                    metrics::AIO_SUBMIT_BATCHES.increment();
                    let submitted = ctx.submit(ptrs.as_mut_ptr(), send_count);
                    if submitted != send_count as isize {
                        return Err(Error::AioInvariant(format!(
                            "io_submit returned {submitted}, expected {send_count}"
                        )));
                    }
                    let reaped = ctx.get_events(events.as_mut_ptr(), send_count);
                    if reaped != send_count as isize {
                        return Err(Error::AioInvariant(format!(
                            "io_getevents returned {reaped}, expected {send_count}"
                        )));
                    }
                    for e in 0..send_count {
                        let event = events[e];
                        let sock = self.running_sends[event.data as usize].clone();
                        if sock.handle_send_result(event.res as isize) {
                            requeue.push(sock);
                        }
                    }
                }
                debug_assert_eq!(send_count + completed_count, batch);
            }

            // Consume this batch from the front; residual entries loop.
            let consumed: Vec<Arc<Socket>> = self.running_sends.drain(..batch).collect();
            for sock in &consumed {
                self.rearm_socket(sock);
                self.maybe_finish(sock);
            }
            self.running_sends.extend(requeue);
        }

        self.arena = Some(arena);
        self.aio_ctx = Some(ctx);
        Ok(())
    }

    // ── pipe commands ────────────────────────────────────────────────

    fn drain_pipe(&mut self) {
        while let Some(cmd) = self.pipe.next_command() {
            match cmd {
                Command::StopThread => self.running = false,
                Command::ActionsPending => {}
                Command::StopSockets => self.stop_sockets(),
                Command::CloseAccept => self.close_accept(),
            }
        }
    }

    fn stop_sockets(&mut self) {
        let snapshot: Vec<Arc<Socket>> = self.shared.sockets.lock().values().cloned().collect();
        for sock in snapshot {
            match sock.kind() {
                SocketKind::Client => {
                    sock.abort();
                    self.maybe_finish(&sock);
                }
                SocketKind::Listener | SocketKind::PassFd => {
                    self.close_accept_socket(&sock);
                }
            }
        }
        if self.accept_sockets.is_empty() {
            self.complete_accept_queue();
        }
        if self.accept_closed && self.shared.sockets.lock().is_empty() {
            self.running = false;
        }
    }

    fn close_accept(&mut self) {
        for sock in std::mem::take(&mut self.accept_sockets) {
            self.shared.sockets.lock().remove(&sock.fd());
            sock.close();
        }
        self.complete_accept_queue();
        if self.shared.sockets.lock().is_empty() {
            self.running = false;
        }
    }

    fn complete_accept_queue(&mut self) {
        // Dropping the sender completes the queue: the reader sees
        // end-of-stream once the buffered connections drain.
        self.accept_tx = None;
        self.accept_closed = true;
        self.shared.accept_closed.store(true, Ordering::Release);
    }

    // ── teardown ─────────────────────────────────────────────────────

    fn maybe_finish(&mut self, sock: &Arc<Socket>) {
        if !sock.is_finished() {
            return;
        }
        let (removed, last) = self.shared.remove_socket(sock.fd());
        if !removed {
            return;
        }
        sock.close();
        metrics::CONNECTIONS_CLOSED.increment();
        if last && self.accept_closed {
            self.running = false;
        }
    }

    fn dispose(&mut self) {
        // Stop accepting wakeups before any fd is closed so a late
        // schedule_send never writes into a recycled descriptor.
        self.shared.scheduler.mark_closed();
        self.complete_accept_queue();

        let remaining: Vec<Arc<Socket>> = {
            let mut map = self.shared.sockets.lock();
            map.drain().map(|(_, s)| s).collect()
        };
        for sock in remaining {
            sock.abort();
            sock.close();
        }
        self.accept_sockets.clear();

        for handle in self.handles.drain(..) {
            self.pool.release(handle);
        }
        sys::close(self.epoll_fd);
        // Pipe reader, AIO context, arena, and pool are dropped with self.
    }
}
