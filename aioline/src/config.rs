//! Transport configuration.

/// Events per `epoll_wait` batch and AIO submissions per pass.
pub const EVENT_BUFFER_LENGTH: usize = 512;

/// Maximum iovecs one socket contributes to an AIO receive submission.
pub const IO_VECTORS_PER_AIO_SOCKET: usize = 8;

/// Maximum iovecs gathered for one (deferred or batched) send.
pub const IO_VECTORS_PER_SEND: usize = 8;

/// Listen backlog for every listener the transport creates.
pub const LISTEN_BACKLOG: i32 = 128;

/// Alignment of the AIO arena and the buffer pool slabs.
pub const MEMORY_ALIGNMENT: usize = 8;

/// Consecutive all-EAGAIN AIO retry rounds tolerated before the loop aborts.
pub const MAX_EAGAIN_COUNT: u32 = 10;

/// Sentinel disabling `MSG_ZEROCOPY` on a socket.
pub const NO_ZERO_COPY: u32 = u32::MAX;

/// Where received data is handed to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingMode {
    /// Invoke the registered data callback on the loop thread.
    Inline,
    /// Push chunks onto the connection's inbound queue for a consumer thread.
    Dispatch,
}

/// Worker thread configuration.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Number of event loop threads. 0 = number of CPUs.
    pub threads: usize,
    /// Pin each loop to a CPU core.
    pub pin_to_core: bool,
    /// Starting core index for pinning.
    pub core_offset: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            pin_to_core: false,
            core_offset: 0,
        }
    }
}

/// Configuration for the epoll/AIO transport.
#[derive(Clone)]
pub struct Config {
    /// Batch receives through `io_submit`/`io_getevents` instead of per-socket
    /// `readv`.
    pub aio_receive: bool,
    /// Batch scheduled sends through AIO `PWRITEV`. Requires `defer_send`.
    pub aio_send: bool,
    /// Route application sends through the loop so consecutive writes
    /// coalesce into one vectored submission.
    pub defer_send: bool,
    /// Set `TCP_DEFER_ACCEPT` on listeners: the kernel completes the accept
    /// only once data has arrived.
    pub defer_accept: bool,
    /// Set `SO_INCOMING_CPU` on each listener to its loop's core.
    pub receive_on_incoming_cpu: bool,
    /// Enable `SO_ZEROCOPY` on listeners (inherited by accepted sockets).
    pub zero_copy: bool,
    /// Byte count at or above which sends use `MSG_ZEROCOPY`.
    /// [`NO_ZERO_COPY`] disables even when `zero_copy` is set.
    pub zero_copy_threshold: u32,
    /// How received data reaches the application.
    pub scheduling: SchedulingMode,
    /// Accept on a dedicated thread that passes fds to the loops over
    /// `SCM_RIGHTS`, instead of per-loop `SO_REUSEPORT` listeners.
    pub acceptor_thread: bool,
    /// Listen backlog.
    pub backlog: i32,
    /// Worker thread settings.
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aio_receive: false,
            aio_send: false,
            defer_send: true,
            defer_accept: false,
            receive_on_incoming_cpu: false,
            zero_copy: false,
            zero_copy_threshold: NO_ZERO_COPY,
            scheduling: SchedulingMode::Dispatch,
            acceptor_thread: false,
            backlog: LISTEN_BACKLOG,
            worker: WorkerConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.aio_send && !self.defer_send {
            return Err(crate::error::Error::Config(
                "aio_send requires defer_send".into(),
            ));
        }
        if self.zero_copy && self.zero_copy_threshold == 0 {
            return Err(crate::error::Error::Config(
                "zero_copy_threshold must be > 0 when zero_copy is enabled".into(),
            ));
        }
        if self.worker.threads > 1024 {
            return Err(crate::error::Error::Config(
                "worker.threads must be <= 1024".into(),
            ));
        }
        if self.backlog <= 0 {
            return Err(crate::error::Error::Config("backlog must be > 0".into()));
        }
        Ok(())
    }

    /// Effective zero-copy threshold: the sentinel unless enabled.
    pub(crate) fn effective_zero_copy_threshold(&self) -> u32 {
        if self.zero_copy {
            self.zero_copy_threshold
        } else {
            NO_ZERO_COPY
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Worker settings ──────────────────────────────────────────────

    /// Set the number of event loop threads. 0 = number of CPUs.
    pub fn workers(mut self, n: usize) -> Self {
        self.config.worker.threads = n;
        self
    }

    /// Enable or disable CPU core pinning.
    pub fn pin_to_core(mut self, enable: bool) -> Self {
        self.config.worker.pin_to_core = enable;
        self
    }

    /// Set the starting CPU core index for pinning.
    pub fn core_offset(mut self, offset: usize) -> Self {
        self.config.worker.core_offset = offset;
        self
    }

    // ── Data plane ───────────────────────────────────────────────────

    /// Batch receives through kernel AIO.
    pub fn aio_receive(mut self, enable: bool) -> Self {
        self.config.aio_receive = enable;
        self
    }

    /// Batch scheduled sends through kernel AIO.
    pub fn aio_send(mut self, enable: bool) -> Self {
        self.config.aio_send = enable;
        self
    }

    /// Coalesce application sends on the loop thread.
    pub fn defer_send(mut self, enable: bool) -> Self {
        self.config.defer_send = enable;
        self
    }

    /// Set `TCP_DEFER_ACCEPT` on listeners.
    pub fn defer_accept(mut self, enable: bool) -> Self {
        self.config.defer_accept = enable;
        self
    }

    /// Set `SO_INCOMING_CPU` on each listener.
    pub fn receive_on_incoming_cpu(mut self, enable: bool) -> Self {
        self.config.receive_on_incoming_cpu = enable;
        self
    }

    /// Enable `MSG_ZEROCOPY` sends at or above `threshold` bytes.
    pub fn zero_copy(mut self, threshold: u32) -> Self {
        self.config.zero_copy = true;
        self.config.zero_copy_threshold = threshold;
        self
    }

    /// Select inline or dispatched delivery of received data.
    pub fn scheduling(mut self, mode: SchedulingMode) -> Self {
        self.config.scheduling = mode;
        self
    }

    /// Accept on a dedicated thread passing fds to the loops.
    pub fn acceptor_thread(mut self, enable: bool) -> Self {
        self.config.acceptor_thread = enable;
        self
    }

    /// Set the TCP listen backlog.
    pub fn backlog(mut self, n: i32) -> Self {
        self.config.backlog = n;
        self
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn aio_send_needs_defer_send() {
        let cfg = ConfigBuilder::new().aio_send(true).defer_send(false).build();
        assert!(cfg.is_err());
        let cfg = ConfigBuilder::new().aio_send(true).defer_send(true).build();
        assert!(cfg.is_ok());
    }

    #[test]
    fn zero_threshold_rejected() {
        assert!(ConfigBuilder::new().zero_copy(0).build().is_err());
        assert!(ConfigBuilder::new().zero_copy(1024).build().is_ok());
    }

    #[test]
    fn threshold_sentinel_when_disabled() {
        let cfg = Config::default();
        assert_eq!(cfg.effective_zero_copy_threshold(), NO_ZERO_COPY);
        let cfg = ConfigBuilder::new().zero_copy(4096).build().unwrap();
        assert_eq!(cfg.effective_zero_copy_threshold(), 4096);
    }
}
