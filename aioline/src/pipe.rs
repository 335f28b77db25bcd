//! Wakeup pipe.
//!
//! Each event loop owns one non-blocking pipe pair. Foreign threads post
//! single-byte commands to the write end; the loop drains the read end one
//! byte at a time after every `epoll_wait`. Writes after the loop has shut
//! down are silently dropped.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::sys;

/// One-byte loop commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Command {
    /// Exit the loop after the current iteration.
    StopThread = 0,
    /// Wake only; scheduled work is waiting in the gate.
    ActionsPending = 1,
    /// Abort every socket in the fd map.
    StopSockets = 2,
    /// Close listening sockets and complete the accept queue.
    CloseAccept = 3,
}

impl Command {
    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Command::StopThread),
            1 => Some(Command::ActionsPending),
            2 => Some(Command::StopSockets),
            3 => Some(Command::CloseAccept),
            _ => None,
        }
    }
}

/// The write half, shared with foreign threads.
///
/// `closed` is flipped before the loop tears its fds down so a late writer
/// never touches a reused descriptor number.
pub(crate) struct PipeWriter {
    fd: RawFd,
    closed: AtomicBool,
}

impl PipeWriter {
    /// Post a command. `EPIPE`, `EBADF`, and a full pipe are all fine: a
    /// full pipe means the loop is already guaranteed to wake, a dead pipe
    /// means there is no loop left to wake.
    pub(crate) fn post(&self, cmd: Command) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let _ = sys::write_byte(self.fd, cmd as u8);
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        sys::close(self.fd);
    }
}

/// The loop-owned read half.
pub(crate) struct PipeReader {
    pub(crate) fd: RawFd,
}

impl PipeReader {
    /// Pop the next queued command, or `None` once the pipe is dry.
    pub(crate) fn next_command(&self) -> Option<Command> {
        let res = sys::read_byte(self.fd);
        if res < 0 {
            return None;
        }
        Command::from_byte(res as u8)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        sys::close(self.fd);
    }
}

/// Create the pair. The read end belongs to the loop; the write end is
/// handed out behind an `Arc`.
pub(crate) fn wakeup_pipe() -> std::io::Result<(PipeReader, PipeWriter)> {
    let mut fds: [RawFd; 2] = [0; 2];
    let res = sys::pipe2(&mut fds);
    if res < 0 {
        return Err(std::io::Error::from_raw_os_error(-res as i32));
    }
    Ok((
        PipeReader { fd: fds[0] },
        PipeWriter {
            fd: fds[1],
            closed: AtomicBool::new(false),
        },
    ))
}
