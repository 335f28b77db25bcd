//! Launching loops and driving shutdown.
//!
//! The builder creates one listener per loop (`SO_REUSEPORT` mode) or a
//! single listener plus a fd-passing acceptor thread, spawns the loop
//! threads with optional CPU pinning, and hands back a [`Transport`]: the
//! accept queue, the resolved listen address, and the shutdown surface.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Select, unbounded};

use crate::acceptor::{AcceptorConfig, run_acceptor};
use crate::config::Config;
use crate::counter::bind_thread_shard;
use crate::error::Error;
use crate::event_loop::{DataHandler, EventLoop, LoopShared};
use crate::pipe::Command;
use crate::socket::{Connection, Socket};
use crate::sys;

/// Builder for launching aioline event loops.
pub struct AiolineBuilder {
    config: Config,
    bind_addr: Option<SocketAddr>,
    on_data: Option<DataHandler>,
}

impl AiolineBuilder {
    pub fn new(config: Config) -> Self {
        AiolineBuilder {
            config,
            bind_addr: None,
            on_data: None,
        }
    }

    /// Set the listen address.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Register the inline data callback used with
    /// [`SchedulingMode::Inline`](crate::config::SchedulingMode::Inline).
    pub fn on_data<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Connection, Vec<u8>) + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(handler));
        self
    }

    /// Create listeners, spawn the loop threads, and return the running
    /// transport.
    pub fn launch(self) -> Result<Transport, Error> {
        self.config.validate()?;
        let addr = self.bind_addr.ok_or_else(|| {
            Error::Config("a bind address is required; call .bind(addr)".into())
        })?;

        let num_threads = if self.config.worker.threads == 0 {
            num_cpus()
        } else {
            self.config.worker.threads
        };

        let mut loop_shareds: Vec<Arc<LoopShared>> = Vec::with_capacity(num_threads);
        let mut accept_rxs: Vec<Receiver<Connection>> = Vec::with_capacity(num_threads);
        let mut event_loops: Vec<EventLoop> = Vec::with_capacity(num_threads);
        let mut local_addr: Option<SocketAddr> = None;

        let acceptor = if self.config.acceptor_thread {
            // One blocking listener owned by the acceptor thread; each loop
            // gets the receiving end of a socketpair.
            let listen_fd = create_blocking_listener(addr, self.config.backlog)?;
            local_addr = sys::getsockname(listen_fd);

            let mut worker_channels = Vec::with_capacity(num_threads);
            for worker_id in 0..num_threads {
                let (send_end, recv_end) = fd_channel_pair()?;
                worker_channels.push(send_end);

                let (tx, rx) = unbounded();
                let accept_socket = Socket::pass_fd_receiver(recv_end, &self.config);
                let (event_loop, shared) = EventLoop::new(
                    self.config.clone(),
                    worker_id,
                    vec![accept_socket],
                    tx,
                    self.on_data.clone(),
                )?;
                loop_shareds.push(shared);
                accept_rxs.push(rx);
                event_loops.push(event_loop);
            }

            let shutdown_flag = Arc::new(AtomicBool::new(false));
            let listen_closed = Arc::new(AtomicBool::new(false));
            let acceptor_config = AcceptorConfig {
                listen_fd,
                worker_channels,
                shutdown_flag: shutdown_flag.clone(),
            };
            let closed = listen_closed.clone();
            thread::Builder::new()
                .name("aioline-acceptor".to_string())
                .spawn(move || {
                    run_acceptor(acceptor_config);
                    if !closed.swap(true, Ordering::AcqRel) {
                        sys::close(listen_fd);
                    }
                })
                .map_err(Error::Io)?;

            Some(AcceptorControl {
                shutdown_flag,
                listen_fd,
                listen_closed,
            })
        } else {
            // One SO_REUSEPORT listener per loop; the kernel balances
            // connections across them. Port 0 is resolved by the first bind
            // and reused for the siblings.
            let mut bind_addr = addr;
            for worker_id in 0..num_threads {
                let cpu = self.config.worker.core_offset + worker_id;
                let listener = Socket::listener(bind_addr, &self.config, cpu)?;
                if local_addr.is_none() {
                    local_addr = listener.local_addr();
                    if let Some(resolved) = local_addr {
                        bind_addr = resolved;
                    }
                }
                let (tx, rx) = unbounded();
                let (event_loop, shared) = EventLoop::new(
                    self.config.clone(),
                    worker_id,
                    vec![listener],
                    tx,
                    self.on_data.clone(),
                )?;
                loop_shareds.push(shared);
                accept_rxs.push(rx);
                event_loops.push(event_loop);
            }
            None
        };

        let pin = self.config.worker.pin_to_core;
        let core_offset = self.config.worker.core_offset;
        let mut handles = Vec::with_capacity(num_threads);
        for (worker_id, mut event_loop) in event_loops.into_iter().enumerate() {
            let handle = thread::Builder::new()
                .name(format!("aioline-worker-{worker_id}"))
                .spawn(move || {
                    if pin {
                        let _ = pin_to_core(core_offset + worker_id);
                    }
                    bind_thread_shard(worker_id);
                    if let Err(err) = event_loop.run() {
                        // The loop cannot partially survive an internal
                        // invariant break; take the process down.
                        eprintln!("aioline-worker-{worker_id}: fatal: {err}");
                        std::process::abort();
                    }
                })
                .map_err(Error::Io)?;
            handles.push(handle);
        }

        Ok(Transport {
            shutdown: ShutdownHandle {
                loops: Arc::new(loop_shareds),
                acceptor,
            },
            accepts: AcceptQueue {
                receivers: accept_rxs,
            },
            local_addr,
            handles,
        })
    }
}

/// Acceptor-thread control state shared with the shutdown handle.
#[derive(Clone)]
struct AcceptorControl {
    shutdown_flag: Arc<AtomicBool>,
    listen_fd: RawFd,
    listen_closed: Arc<AtomicBool>,
}

/// Cloneable handle posting control commands to every loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    loops: Arc<Vec<Arc<LoopShared>>>,
    acceptor: Option<AcceptorControl>,
}

impl ShutdownHandle {
    /// Stop ingress: close every listening socket and complete the accept
    /// queue. In-flight connections keep running.
    pub fn close_accept(&self) {
        if let Some(acceptor) = &self.acceptor {
            acceptor.shutdown_flag.store(true, Ordering::Release);
            // Unblock the acceptor's accept4.
            if !acceptor.listen_closed.swap(true, Ordering::AcqRel) {
                sys::close(acceptor.listen_fd);
            }
        }
        for shared in self.loops.iter() {
            shared.scheduler.post(Command::CloseAccept);
        }
    }

    /// Abort every connection on every loop.
    pub fn stop_sockets(&self) {
        for shared in self.loops.iter() {
            shared.scheduler.post(Command::StopSockets);
        }
    }

    /// Ask every loop to exit after its current iteration.
    pub fn stop(&self) {
        for shared in self.loops.iter() {
            shared.scheduler.post(Command::StopThread);
        }
    }

    /// The orderly sequence: close accept, abort what remains, stop.
    pub fn shutdown(&self) {
        self.close_accept();
        self.stop_sockets();
        self.stop();
    }
}

/// Single-reader handoff of accepted connections.
pub struct AcceptQueue {
    receivers: Vec<Receiver<Connection>>,
}

impl AcceptQueue {
    /// Block for the next accepted connection. `None` once every loop has
    /// closed its accept path and the buffered connections are drained.
    pub fn accept(&self) -> Option<Connection> {
        self.accept_inner(None)
    }

    /// [`accept`](Self::accept) with an overall timeout.
    pub fn accept_timeout(&self, timeout: Duration) -> Option<Connection> {
        self.accept_inner(Some(timeout))
    }

    fn accept_inner(&self, timeout: Option<Duration>) -> Option<Connection> {
        let mut live: Vec<&Receiver<Connection>> = self.receivers.iter().collect();
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        loop {
            if live.is_empty() {
                return None;
            }
            let mut select = Select::new();
            for rx in &live {
                select.recv(rx);
            }
            let op = match deadline {
                Some(deadline) => match select.select_deadline(deadline) {
                    Ok(op) => op,
                    Err(_) => return None,
                },
                None => select.select(),
            };
            let index = op.index();
            match op.recv(live[index]) {
                Ok(conn) => return Some(conn),
                Err(_) => {
                    live.remove(index);
                }
            }
        }
    }
}

/// A running transport: loops, accept queue, and shutdown surface.
pub struct Transport {
    shutdown: ShutdownHandle,
    accepts: AcceptQueue,
    local_addr: Option<SocketAddr>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Transport {
    /// The resolved listen address (meaningful when binding port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn accept_queue(&self) -> &AcceptQueue {
        &self.accepts
    }

    /// Block for the next accepted connection.
    pub fn accept(&self) -> Option<Connection> {
        self.accepts.accept()
    }

    pub fn accept_timeout(&self, timeout: Duration) -> Option<Connection> {
        self.accepts.accept_timeout(timeout)
    }

    /// A cloneable handle for triggering shutdown from other threads.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Stop ingress; see [`ShutdownHandle::close_accept`].
    pub fn close_accept(&self) {
        self.shutdown.close_accept();
    }

    /// Forceful orderly shutdown; see [`ShutdownHandle::shutdown`].
    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    /// Wait for every loop thread to exit.
    pub fn join(self) -> thread::Result<()> {
        for handle in self.handles {
            handle.join()?;
        }
        Ok(())
    }
}

// ── host plumbing ───────────────────────────────────────────────────

/// Create the blocking listener the acceptor thread owns. `SO_REUSEADDR`
/// only: with a single accept point there is nothing for the kernel to
/// balance.
fn create_blocking_listener(addr: SocketAddr, backlog: i32) -> Result<RawFd, Error> {
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

    let res = sys::setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
    if res < 0 {
        sys::close(fd);
        return Err(io::Error::from_raw_os_error(-res as i32).into());
    }
    if addr.is_ipv6() {
        let _ = sys::setsockopt(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 0);
    }
    let res = sys::bind(fd, addr);
    if res < 0 {
        sys::close(fd);
        return Err(Error::from_bind_errno(-res as i32, addr));
    }
    // accept4 on this fd should block; the loops' sockets stay nonblocking.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
    }
    let res = sys::listen(fd, backlog);
    if res < 0 {
        sys::close(fd);
        return Err(io::Error::from_raw_os_error(-res as i32).into());
    }
    Ok(fd)
}

/// Unix socketpair carrying accepted fds: the sending end blocks, the
/// loop-side end is nonblocking.
fn fd_channel_pair() -> Result<(RawFd, RawFd), Error> {
    let mut pair: [RawFd; 2] = [0; 2];
    let res = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            pair.as_mut_ptr(),
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    unsafe {
        let flags = libc::fcntl(pair[0], libc::F_GETFL);
        libc::fcntl(pair[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
    Ok((pair[1], pair[0]))
}

/// Pin the current thread to a specific CPU core.
fn pin_to_core(core: usize) -> Result<(), Error> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Number of online CPU cores.
fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 { 1 } else { ret as usize }
}
