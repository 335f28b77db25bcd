use std::io;

use thiserror::Error;

/// Errors returned by the aioline transport.
#[derive(Debug, Error)]
pub enum Error {
    /// Syscall or setup failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The requested listen address is already bound.
    #[error("address in use: {0}")]
    AddressInUse(std::net::SocketAddr),
    /// The requested listen address is not available on this host.
    #[error("address not available: {0}")]
    AddressNotAvailable(std::net::SocketAddr),
    /// Kernel AIO context setup failed (e.g., aio-max-nr exhausted).
    #[error("aio setup: {0}")]
    AioSetup(String),
    /// The kernel broke an AIO contract the loop relies on
    /// (short submit, short getevents, or a pathological EAGAIN spin).
    #[error("aio invariant violated: {0}")]
    AioInvariant(String),
    /// Configuration rejected by `Config::validate`.
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Map a negative errno from a bind attempt to a named error.
    pub(crate) fn from_bind_errno(errno: i32, addr: std::net::SocketAddr) -> Self {
        match errno {
            libc::EADDRINUSE => Error::AddressInUse(addr),
            libc::EADDRNOTAVAIL => Error::AddressNotAvailable(addr),
            e => Error::Io(io::Error::from_raw_os_error(e)),
        }
    }
}
