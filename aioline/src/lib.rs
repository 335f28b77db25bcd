//! aioline — epoll + Linux AIO thread-per-core TCP transport.
//!
//! Each worker thread owns one epoll instance; multiple workers listen on
//! the same port through `SO_REUSEPORT` so the kernel balances connections
//! across them. Client sockets are armed `EPOLLONESHOT`, reads can batch
//! through kernel AIO (`io_submit`/`io_getevents`), sends scheduled from
//! foreign threads coalesce on the loop via a swap-list gate, and
//! `MSG_ZEROCOPY` completions are reaped off the socket error queue.
//! Accepted connections reach the application through a single-reader
//! handoff queue.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use aioline::{AiolineBuilder, ConfigBuilder};
//!
//! fn main() -> Result<(), aioline::Error> {
//!     let config = ConfigBuilder::new().workers(2).build()?;
//!     let transport = AiolineBuilder::new(config)
//!         .bind("127.0.0.1:7878".parse().unwrap())
//!         .launch()?;
//!
//!     while let Some(conn) = transport.accept() {
//!         std::thread::spawn(move || {
//!             while let Some(chunk) = conn.recv() {
//!                 let _ = conn.send(&chunk);
//!             }
//!         });
//!     }
//!     transport.join().unwrap();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. Requires epoll, `pipe2`, `accept4`, kernel AIO, and (for the
//! zero-copy path) `SO_ZEROCOPY`/`MSG_ZEROCOPY` (Linux 4.14+).

// ── Internal modules ────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod aio;
pub(crate) mod buffer;
pub(crate) mod event_loop;
pub(crate) mod pipe;
pub(crate) mod scheduler;
pub(crate) mod socket;
pub(crate) mod sys;
pub(crate) mod worker;

// ── Public modules ──────────────────────────────────────────────────
pub mod config;
pub mod counter;
pub mod error;
pub mod metrics;

// ── Re-exports ──────────────────────────────────────────────────────

/// Transport configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;
/// Sentinel disabling `MSG_ZEROCOPY` on a socket.
pub use config::NO_ZERO_COPY;
/// Inline vs. dispatched delivery of received data.
pub use config::SchedulingMode;
/// Worker thread configuration.
pub use config::WorkerConfig;
/// Transport errors.
pub use error::Error;
/// Callback type for [`SchedulingMode::Inline`] delivery.
pub use event_loop::DataHandler;
/// An accepted connection.
pub use socket::Connection;
/// Builder for launching aioline event loops.
pub use worker::AiolineBuilder;
/// Single-reader handoff of accepted connections.
pub use worker::AcceptQueue;
/// Cloneable handle for triggering shutdown.
pub use worker::ShutdownHandle;
/// A running transport.
pub use worker::Transport;
