//! Linux kernel AIO: ABI structs, the context handle, and the arena.
//!
//! This is `io_setup`/`io_submit`/`io_getevents` AIO (`linux/aio_abi.h`),
//! not POSIX aio. The arena is a single owned allocation holding the
//! `io_event`, `iocb`, `iocb*`, and `iovec` tables, aligned once at
//! allocation and reused for every batch.

use std::alloc::{Layout, alloc_zeroed, dealloc};

use crate::config::{EVENT_BUFFER_LENGTH, IO_VECTORS_PER_AIO_SOCKET, MEMORY_ALIGNMENT};
use crate::error::Error;
use crate::sys;

pub(crate) const IOCB_CMD_NOOP: u16 = 6;
pub(crate) const IOCB_CMD_PREADV: u16 = 7;
pub(crate) const IOCB_CMD_PWRITEV: u16 = 8;

/// `struct iocb` from `linux/aio_abi.h` (little-endian field order).
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct Iocb {
    pub aio_data: u64,
    pub aio_key: u32,
    pub aio_rw_flags: i32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

/// `struct io_event` from `linux/aio_abi.h`.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct IoEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

// ── aio_data packing ────────────────────────────────────────────────
//
// Receive submissions thread three values through the kernel and back:
// bytes already received on earlier attempts, bytes the socket had
// pre-consumed before submission, and the iovec count of this submission.
// Layout: received in bits 63..32, advanced in bits 31..8, iov_len in 7..0.

#[inline]
pub(crate) fn pack_receive_data(received: u32, advanced: u32, iov_len: u32) -> u64 {
    debug_assert!(advanced < (1 << 24));
    debug_assert!(iov_len < (1 << 8));
    ((received as u64) << 32) | ((advanced as u64) << 8) | iov_len as u64
}

#[inline]
pub(crate) fn unpack_receive_data(data: u64) -> (u32, u32, u32) {
    (
        (data >> 32) as u32,
        ((data >> 8) & 0x00FF_FFFF) as u32,
        (data & 0xFF) as u32,
    )
}

// ── context ─────────────────────────────────────────────────────────

/// Owned `aio_context_t`, destroyed on drop.
pub(crate) struct AioContext {
    ctx: u64,
}

impl AioContext {
    pub(crate) fn setup(nr_events: u32) -> Result<Self, Error> {
        let mut ctx: u64 = 0;
        let res = unsafe { sys::io_setup(nr_events, &mut ctx) };
        if res < 0 {
            return Err(Error::AioSetup(format!(
                "io_setup({nr_events}) failed: {}",
                std::io::Error::from_raw_os_error(-res as i32)
            )));
        }
        Ok(AioContext { ctx })
    }

    /// Submit `nr` control blocks. Returns the submitted count or `-errno`.
    pub(crate) fn submit(&self, iocbpp: *mut *mut Iocb, nr: usize) -> isize {
        unsafe { sys::io_submit(self.ctx, nr, iocbpp as *mut *mut libc::c_void) }
    }

    /// Reap exactly `nr` completions into `events`.
    pub(crate) fn get_events(&self, events: *mut IoEvent, nr: usize) -> isize {
        unsafe { sys::io_getevents(self.ctx, nr, nr, events as *mut libc::c_void) }
    }
}

impl Drop for AioContext {
    fn drop(&mut self) {
        unsafe { sys::io_destroy(self.ctx) };
    }
}

// ── arena ───────────────────────────────────────────────────────────

const EVENTS_BYTES: usize = EVENT_BUFFER_LENGTH * std::mem::size_of::<IoEvent>();
const IOCBS_BYTES: usize = EVENT_BUFFER_LENGTH * std::mem::size_of::<Iocb>();
const PTRS_BYTES: usize = EVENT_BUFFER_LENGTH * std::mem::size_of::<*mut Iocb>();
const IOVECS_BYTES: usize =
    EVENT_BUFFER_LENGTH * IO_VECTORS_PER_AIO_SOCKET * std::mem::size_of::<libc::iovec>();

/// One contiguous allocation backing all four AIO tables.
pub(crate) struct AioArena {
    base: *mut u8,
    layout: Layout,
}

unsafe impl Send for AioArena {}

impl AioArena {
    pub(crate) fn new() -> Self {
        let layout = Layout::from_size_align(
            EVENTS_BYTES + IOCBS_BYTES + PTRS_BYTES + IOVECS_BYTES,
            MEMORY_ALIGNMENT,
        )
        .expect("static arena layout");
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "aio arena allocation failed");
        AioArena { base, layout }
    }

    /// Typed views over the four disjoint table regions.
    #[allow(clippy::type_complexity)]
    pub(crate) fn tables(
        &mut self,
    ) -> (
        &mut [IoEvent],
        &mut [Iocb],
        &mut [*mut Iocb],
        &mut [libc::iovec],
    ) {
        // The regions are disjoint sub-ranges of one allocation; each field
        // type is plain-old-data with alignment <= MEMORY_ALIGNMENT.
        unsafe {
            let events = self.base as *mut IoEvent;
            let iocbs = self.base.add(EVENTS_BYTES) as *mut Iocb;
            let ptrs = self.base.add(EVENTS_BYTES + IOCBS_BYTES) as *mut *mut Iocb;
            let iovecs =
                self.base.add(EVENTS_BYTES + IOCBS_BYTES + PTRS_BYTES) as *mut libc::iovec;
            (
                std::slice::from_raw_parts_mut(events, EVENT_BUFFER_LENGTH),
                std::slice::from_raw_parts_mut(iocbs, EVENT_BUFFER_LENGTH),
                std::slice::from_raw_parts_mut(ptrs, EVENT_BUFFER_LENGTH),
                std::slice::from_raw_parts_mut(iovecs, EVENT_BUFFER_LENGTH * IO_VECTORS_PER_AIO_SOCKET),
            )
        }
    }

    /// The iovec slice belonging to batch slot `i`.
    pub(crate) fn iovec_slot(iovecs: &mut [libc::iovec], i: usize) -> &mut [libc::iovec] {
        &mut iovecs[i * IO_VECTORS_PER_AIO_SOCKET..(i + 1) * IO_VECTORS_PER_AIO_SOCKET]
    }
}

impl Drop for AioArena {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_data_round_trip() {
        for received in [0u32, 1, 0xFFFF, u32::MAX] {
            for advanced in [0u32, 1, 0xABCDE, (1 << 24) - 1] {
                for iov_len in [0u32, 1, 8, 255] {
                    let packed = pack_receive_data(received, advanced, iov_len);
                    assert_eq!(unpack_receive_data(packed), (received, advanced, iov_len));
                }
            }
        }
    }

    #[test]
    fn receive_data_fields_do_not_bleed() {
        let packed = pack_receive_data(u32::MAX, 0, 0);
        assert_eq!(unpack_receive_data(packed), (u32::MAX, 0, 0));
        let packed = pack_receive_data(0, (1 << 24) - 1, 0);
        assert_eq!(unpack_receive_data(packed), (0, (1 << 24) - 1, 0));
        let packed = pack_receive_data(0, 0, 255);
        assert_eq!(unpack_receive_data(packed), (0, 0, 255));
    }

    #[test]
    fn abi_struct_sizes() {
        // Fixed by the kernel ABI.
        assert_eq!(std::mem::size_of::<Iocb>(), 64);
        assert_eq!(std::mem::size_of::<IoEvent>(), 32);
    }

    #[test]
    fn arena_tables_are_disjoint_and_aligned() {
        let mut arena = AioArena::new();
        let (events, iocbs, ptrs, iovecs) = arena.tables();
        assert_eq!(events.len(), EVENT_BUFFER_LENGTH);
        assert_eq!(iocbs.len(), EVENT_BUFFER_LENGTH);
        assert_eq!(ptrs.len(), EVENT_BUFFER_LENGTH);
        assert_eq!(iovecs.len(), EVENT_BUFFER_LENGTH * IO_VECTORS_PER_AIO_SOCKET);

        let ev_end = events.as_ptr() as usize + EVENTS_BYTES;
        assert_eq!(ev_end, iocbs.as_ptr() as usize);
        assert_eq!(events.as_ptr() as usize % MEMORY_ALIGNMENT, 0);
        assert_eq!(iocbs.as_ptr() as usize % MEMORY_ALIGNMENT, 0);
        assert_eq!(iovecs.as_ptr() as usize % MEMORY_ALIGNMENT, 0);
    }

    #[test]
    fn context_setup_and_teardown() {
        // A tiny context; dropped immediately (io_destroy).
        let ctx = AioContext::setup(4);
        assert!(ctx.is_ok());
    }
}
