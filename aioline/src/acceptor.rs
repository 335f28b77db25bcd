//! Centralized accept thread.
//!
//! One thread owns the listening socket and distributes accepted fds to the
//! loops round-robin over unix socketpairs with `SCM_RIGHTS`. Each loop
//! registers its receiving end as an accept socket; a worker whose pair has
//! died is pruned from the rotation.

use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::sys;

pub(crate) struct AcceptorConfig {
    /// The listening socket fd (blocking).
    pub(crate) listen_fd: RawFd,
    /// Sending ends of the per-loop socketpairs.
    pub(crate) worker_channels: Vec<RawFd>,
    /// Set by the shutdown handle to stop the rotation.
    pub(crate) shutdown_flag: Arc<AtomicBool>,
}

/// Send one fd over a unix socket with `SCM_RIGHTS`. Returns the sendmsg
/// result.
pub(crate) fn send_fd(channel: RawFd, fd: RawFd) -> isize {
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
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(std::mem::size_of::<RawFd>() as u32) } as usize;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(std::mem::size_of::<RawFd>() as u32) as usize;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd);
    }
    sys::sendmsg(channel, &msg, 0)
}

/// Run the acceptor loop. Terminates when the listener dies, shutdown is
/// requested, or every worker channel has closed.
pub(crate) fn run_acceptor(config: AcceptorConfig) {
    let num_workers = config.worker_channels.len();
    if num_workers == 0 {
        return;
    }

    let mut next_worker = 0usize;
    let mut alive = vec![true; num_workers];
    let mut alive_count = num_workers;
    let mut addr_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

    loop {
        if config.shutdown_flag.load(Ordering::Acquire) {
            break;
        }
        let fd = sys::accept4(config.listen_fd, &mut addr_storage);
        if fd < 0 {
            match -fd as i32 {
                libc::EINTR => continue,
                libc::EMFILE | libc::ENFILE => {
                    // Out of descriptors; back off briefly.
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    continue;
                }
                _ => break,
            }
        }
        let fd = fd as RawFd;

        // Round-robin over live workers; try each once.
        let mut sent = false;
        for _ in 0..num_workers {
            let idx = next_worker % num_workers;
            next_worker = next_worker.wrapping_add(1);
            if !alive[idx] {
                continue;
            }
            let res = send_fd(config.worker_channels[idx], fd);
            if res < 0 {
                alive[idx] = false;
                alive_count -= 1;
                if alive_count == 0 {
                    break;
                }
                continue;
            }
            sent = true;
            break;
        }
        // The receiving loop owns the fd now; our copy always closes.
        sys::close(fd);
        if !sent && alive_count == 0 {
            break;
        }
    }

    for &channel in &config.worker_channels {
        sys::close(channel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_fd_transfers_a_descriptor() {
        let mut pair: [RawFd; 2] = [0; 2];
        let res = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                pair.as_mut_ptr(),
            )
        };
        assert_eq!(res, 0);

        let mut payload: [RawFd; 2] = [0; 2];
        assert_eq!(unsafe { libc::pipe(payload.as_mut_ptr()) }, 0);

        assert!(send_fd(pair[1], payload[0]) > 0);

        // Receive manually and prove the duplicated fd is usable.
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
        assert_eq!(sys::recvmsg(pair[0], &mut msg, 0), 1);

        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        assert!(!cmsg.is_null());
        let received =
            unsafe { std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const RawFd) };
        assert!(received > 0);

        let wrote = unsafe { libc::write(payload[1], b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(wrote, 1);
        let mut buf = [0u8; 1];
        let read = unsafe { libc::read(received, buf.as_mut_ptr() as *mut libc::c_void, 1) };
        assert_eq!(read, 1);

        for fd in [pair[0], pair[1], payload[0], payload[1], received] {
            sys::close(fd);
        }
    }
}
