//! Transport metrics.
//!
//! Per-loop counters for connection lifecycle, bytes moved, wakeup traffic,
//! and AIO batching. Exposed through metriken for scraping by whatever admin
//! surface embeds the transport.

use crate::counter::{Counter, CounterGroup};
use metriken::metric;

static CONN: CounterGroup = CounterGroup::new();
static BYTES: CounterGroup = CounterGroup::new();
static LOOP_: CounterGroup = CounterGroup::new();

mod slot {
    pub const ACCEPTED: usize = 0;
    pub const CLOSED: usize = 1;

    pub const RECEIVED: usize = 0;
    pub const SENT: usize = 1;

    pub const WAKEUPS: usize = 0;
    pub const AIO_SUBMITS: usize = 1;
    pub const AIO_RETRIES: usize = 2;
    pub const ZC_COMPLETIONS: usize = 3;
}

#[metric(
    name = "aioline/connections/accepted",
    description = "Total connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new(&CONN, slot::ACCEPTED);

#[metric(
    name = "aioline/connections/closed",
    description = "Total connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new(&CONN, slot::CLOSED);

#[metric(name = "aioline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new(&BYTES, slot::RECEIVED);

#[metric(name = "aioline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new(&BYTES, slot::SENT);

#[metric(
    name = "aioline/wakeup/pipe_writes",
    description = "Wakeup bytes written to loop pipes"
)]
pub static WAKEUP_WRITES: Counter = Counter::new(&LOOP_, slot::WAKEUPS);

#[metric(
    name = "aioline/aio/submit_batches",
    description = "io_submit batches issued"
)]
pub static AIO_SUBMIT_BATCHES: Counter = Counter::new(&LOOP_, slot::AIO_SUBMITS);

#[metric(
    name = "aioline/aio/retry_rounds",
    description = "AIO resubmission rounds after partial completion"
)]
pub static AIO_RETRY_ROUNDS: Counter = Counter::new(&LOOP_, slot::AIO_RETRIES);

#[metric(
    name = "aioline/zerocopy/completions",
    description = "MSG_ZEROCOPY completions reaped"
)]
pub static ZERO_COPY_COMPLETIONS: Counter = Counter::new(&LOOP_, slot::ZC_COMPLETIONS);
