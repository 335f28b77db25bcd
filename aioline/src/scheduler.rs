//! Cross-thread send scheduling.
//!
//! Producers append to the `adding` list; each loop turn swaps it with the
//! `running` list under the gate and processes the swapped-out entries. The
//! park-state CAS next to the list push is what bounds wakeup traffic: a
//! producer writes a pipe byte only when it is the one that observed the
//! loop parked, so a parked interval costs at most one byte no matter how
//! many sends are queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::metrics;
use crate::pipe::{Command, PipeWriter};
use crate::socket::Socket;

const PARK_BLOCKED: u8 = 0;
const PARK_NOT_BLOCKED: u8 = 1;

pub(crate) struct Scheduler {
    /// The producer-side list. The consumer-side `running` list lives in
    /// the event loop; `begin_run` swaps the two so producers never wait on
    /// a run in progress.
    adding: Mutex<Vec<Arc<Socket>>>,
    park: AtomicU8,
    writer: PipeWriter,
}

impl Scheduler {
    pub(crate) fn new(writer: PipeWriter) -> Self {
        Scheduler {
            adding: Mutex::new(Vec::new()),
            park: AtomicU8::new(PARK_NOT_BLOCKED),
            writer,
        }
    }

    /// Queue a socket for a send pass on the loop thread. Callable from any
    /// thread; never holds the gate across the pipe write.
    pub(crate) fn schedule_send(&self, sock: Arc<Socket>) {
        let was_blocked;
        {
            let mut adding = self.adding.lock();
            was_blocked = self
                .park
                .compare_exchange(
                    PARK_BLOCKED,
                    PARK_NOT_BLOCKED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
            adding.push(sock);
        }
        if was_blocked {
            metrics::WAKEUP_WRITES.increment();
            self.writer.post(Command::ActionsPending);
        }
    }

    /// The loop observed `epoll_wait` return; producers must now enqueue
    /// without waking.
    pub(crate) fn mark_unparked(&self) {
        self.park.store(PARK_NOT_BLOCKED, Ordering::Release);
    }

    /// Swap the pending list into the loop's (empty) running list.
    pub(crate) fn begin_run(&self, running: &mut Vec<Arc<Socket>>) {
        debug_assert!(running.is_empty());
        std::mem::swap(&mut *self.adding.lock(), running);
    }

    /// Re-enter the gate after a run. Parks the loop when nothing new
    /// arrived; otherwise the caller must post a self-wakeup so the next
    /// `epoll_wait` returns immediately.
    #[must_use]
    pub(crate) fn finish_run(&self) -> bool {
        let adding = self.adding.lock();
        if adding.is_empty() {
            self.park.store(PARK_BLOCKED, Ordering::Release);
            false
        } else {
            true
        }
    }

    pub(crate) fn post(&self, cmd: Command) {
        self.writer.post(cmd);
    }

    pub(crate) fn mark_closed(&self) {
        self.writer.mark_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::wakeup_pipe;

    fn test_socket() -> Arc<Socket> {
        let mut fds: [std::os::fd::RawFd; 2] = [0; 2];
        let res = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(res, 0);
        crate::sys::close(fds[1]);
        Arc::new(Socket::client_for_tests(fds[0]))
    }

    #[test]
    fn one_wakeup_byte_per_parked_interval() {
        let (reader, writer) = wakeup_pipe().unwrap();
        let sched = Scheduler::new(writer);
        sched.park.store(PARK_BLOCKED, Ordering::Release);

        let sock = test_socket();
        for _ in 0..1000 {
            sched.schedule_send(sock.clone());
        }

        // Exactly one byte regardless of how many sends were queued.
        assert_eq!(reader.next_command(), Some(Command::ActionsPending));
        assert_eq!(reader.next_command(), None);

        let mut running = Vec::new();
        sched.begin_run(&mut running);
        assert_eq!(running.len(), 1000);
    }

    #[test]
    fn no_wakeup_when_unparked() {
        let (reader, writer) = wakeup_pipe().unwrap();
        let sched = Scheduler::new(writer);
        sched.mark_unparked();
        sched.schedule_send(test_socket());
        assert_eq!(reader.next_command(), None);
    }

    #[test]
    fn finish_run_reparks_only_when_drained() {
        let (_reader, writer) = wakeup_pipe().unwrap();
        let sched = Scheduler::new(writer);
        sched.mark_unparked();

        sched.schedule_send(test_socket());
        let mut running = Vec::new();
        sched.begin_run(&mut running);
        assert_eq!(running.len(), 1);
        running.clear();

        // Nothing arrived while "processing" — loop parks.
        assert!(!sched.finish_run());
        assert_eq!(sched.park.load(Ordering::Acquire), PARK_BLOCKED);

        // Work arrives mid-run — loop must self-wake instead of parking.
        sched.mark_unparked();
        sched.schedule_send(test_socket());
        sched.begin_run(&mut running);
        running.clear();
        sched.schedule_send(test_socket());
        assert!(sched.finish_run());
    }
}
