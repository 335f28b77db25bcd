//! Thin syscall wrappers.
//!
//! Every wrapper returns the syscall's value directly, or the negated errno
//! on failure. Nothing here allocates; callers decide what an error means.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;

/// Non-negative value, or negated errno.
pub type PosixResult = isize;

#[inline]
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Map a `-1` return to `-errno`.
#[inline]
pub(crate) fn cvt(ret: isize) -> PosixResult {
    if ret == -1 { -(errno() as isize) } else { ret }
}

#[inline]
pub(crate) fn cvt_i32(ret: i32) -> PosixResult {
    cvt(ret as isize)
}

// ── epoll ───────────────────────────────────────────────────────────

pub(crate) fn epoll_create1() -> PosixResult {
    cvt_i32(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })
}

/// Arm `fd` on `epfd` with `events`, using the fd itself as the key.
pub(crate) fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32) -> PosixResult {
    let mut ev = libc::epoll_event {
        events,
        u64: fd as u32 as u64,
    };
    cvt_i32(unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) })
}

/// Blocking wait; retries `EINTR` internally so the loop never sees it.
pub(crate) fn epoll_wait(epfd: RawFd, events: &mut [libc::epoll_event]) -> PosixResult {
    loop {
        let n = cvt_i32(unsafe {
            libc::epoll_wait(epfd, events.as_mut_ptr(), events.len() as libc::c_int, -1)
        });
        if n != -(libc::EINTR as isize) {
            return n;
        }
    }
}

// ── pipe ────────────────────────────────────────────────────────────

pub(crate) fn pipe2(fds: &mut [RawFd; 2]) -> PosixResult {
    cvt_i32(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) })
}

pub(crate) fn write_byte(fd: RawFd, byte: u8) -> PosixResult {
    cvt(unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) })
}

pub(crate) fn read_byte(fd: RawFd) -> PosixResult {
    let mut byte = 0u8;
    let res = cvt(unsafe { libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1) });
    match res {
        1 => byte as isize,
        0 => -(libc::EPIPE as isize),
        err => err,
    }
}

// ── sockets ─────────────────────────────────────────────────────────

pub(crate) fn socket(domain: libc::c_int, ty: libc::c_int) -> PosixResult {
    cvt_i32(unsafe { libc::socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0) })
}

pub(crate) fn setsockopt(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> PosixResult {
    cvt_i32(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
}

pub(crate) fn bind(fd: RawFd, addr: SocketAddr) -> PosixResult {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = socket_addr_to_sockaddr(addr, &mut storage);
    cvt_i32(unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) })
}

pub(crate) fn listen(fd: RawFd, backlog: libc::c_int) -> PosixResult {
    cvt_i32(unsafe { libc::listen(fd, backlog) })
}

pub(crate) fn accept4(fd: RawFd, storage: &mut libc::sockaddr_storage) -> PosixResult {
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt_i32(unsafe {
        libc::accept4(
            fd,
            storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })
}

pub(crate) fn getsockname(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res =
        cvt_i32(unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) });
    if res < 0 { None } else { sockaddr_to_socket_addr(&storage) }
}

pub(crate) fn getpeername(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res =
        cvt_i32(unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) });
    if res < 0 { None } else { sockaddr_to_socket_addr(&storage) }
}

pub(crate) fn readv(fd: RawFd, iov: *const libc::iovec, iovcnt: usize) -> PosixResult {
    cvt(unsafe { libc::readv(fd, iov, iovcnt as libc::c_int) })
}

pub(crate) fn writev(fd: RawFd, iov: *const libc::iovec, iovcnt: usize) -> PosixResult {
    cvt(unsafe { libc::writev(fd, iov, iovcnt as libc::c_int) })
}

pub(crate) fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: libc::c_int) -> PosixResult {
    cvt(unsafe { libc::sendmsg(fd, msg, flags | libc::MSG_NOSIGNAL) })
}

pub(crate) fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: libc::c_int) -> PosixResult {
    cvt(unsafe { libc::recvmsg(fd, msg, flags) })
}

pub(crate) fn shutdown_write(fd: RawFd) -> PosixResult {
    cvt_i32(unsafe { libc::shutdown(fd, libc::SHUT_WR) })
}

pub(crate) fn close(fd: RawFd) -> PosixResult {
    cvt_i32(unsafe { libc::close(fd) })
}

// ── Linux AIO (io_setup/io_submit/io_getevents/io_destroy) ──────────
//
// libc exposes only the syscall numbers; the control-block types live in
// crate::aio. These take raw pointers so this module stays type-agnostic.

pub(crate) unsafe fn io_setup(nr_events: u32, ctx: *mut u64) -> PosixResult {
    cvt(unsafe { libc::syscall(libc::SYS_io_setup, nr_events as libc::c_ulong, ctx) } as isize)
}

pub(crate) unsafe fn io_submit(ctx: u64, nr: usize, iocbpp: *mut *mut libc::c_void) -> PosixResult {
    cvt(unsafe { libc::syscall(libc::SYS_io_submit, ctx, nr as libc::c_long, iocbpp) } as isize)
}

pub(crate) unsafe fn io_getevents(
    ctx: u64,
    min_nr: usize,
    nr: usize,
    events: *mut libc::c_void,
) -> PosixResult {
    cvt(unsafe {
        libc::syscall(
            libc::SYS_io_getevents,
            ctx,
            min_nr as libc::c_long,
            nr as libc::c_long,
            events,
            std::ptr::null_mut::<libc::c_void>(),
        )
    } as isize)
}

pub(crate) unsafe fn io_destroy(ctx: u64) -> PosixResult {
    cvt(unsafe { libc::syscall(libc::SYS_io_destroy, ctx) } as isize)
}

// ── sockaddr conversion ─────────────────────────────────────────────

/// Fill `storage` from a `SocketAddr`; returns the populated length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr = libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                };
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

/// Convert a `sockaddr_storage` (from accept4/getsockname) to a `SocketAddr`.
/// Returns `None` for non-IP families.
pub(crate) fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sa.sin6_port))))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:9090".parse().unwrap();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        socket_addr_to_sockaddr(addr, &mut storage);
        assert_eq!(sockaddr_to_socket_addr(&storage), Some(addr));
    }

    #[test]
    fn unknown_family_is_none() {
        let storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        assert_eq!(sockaddr_to_socket_addr(&storage), None);
    }

    #[test]
    fn cvt_maps_negative_one() {
        unsafe { libc::close(-1) };
        assert_eq!(cvt(-1), -(libc::EBADF as isize));
    }
}
