//! The work queue context shared by send and receive queue creation.
//! (PRM Section 8.16: Work Queues)

use byteorder::BigEndian;
use static_assertions::const_assert_eq;
use volatile::Volatile;
use zerocopy::{AsBytes, FromBytes, U32};

type B32 = U32<BigEndian>;

/// Cyclic work queue, the only type this driver creates.
const WQ_TYPE_CYCLIC: u32 = 0x1;

/// Work queues place their entries at `counter & (size - 1)`; sizes must be
/// powers of two so 32-bit producer/consumer counters wrap transparently.
#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct WorkQueueContext {
    wq_type_signature: B32,
    page_offset_lwm: B32,
    pd: B32,
    uar_page: B32,
    dbr_addr_h: B32,
    dbr_addr_l: B32,
    hw_counter: B32,
    sw_counter: B32,
    log_wq_stride_pg_sz_sz: B32,
    single_stride_log_num_of_bytes: B32,
    _reserved0: [u8; 32],
    _reserved1: [u8; 32],
    _reserved2: [u8; 32],
    _reserved3: [u8; 32],
    _reserved4: [u8; 24],
}

const_assert_eq!(core::mem::size_of::<WorkQueueContext>(), 0xC0);

impl WorkQueueContext {
    pub(crate) fn init(
        pd: u32,
        uar_page: u32,
        dbr_addr: u64,
        log_wq_stride: u8,
        log_wq_pg_sz: u8,
        log_wq_size: u8,
    ) -> WorkQueueContext {
        let mut ctx = WorkQueueContext::default();
        ctx.wq_type_signature.set(WQ_TYPE_CYCLIC << 28);
        ctx.pd.set(pd & 0xFF_FFFF);
        ctx.uar_page.set(uar_page & 0xFF_FFFF);
        ctx.dbr_addr_h.set((dbr_addr >> 32) as u32);
        ctx.dbr_addr_l.set(dbr_addr as u32);
        ctx.log_wq_stride_pg_sz_sz.set(
            ((log_wq_stride as u32) << 16)
                | ((log_wq_pg_sz as u32 & 0x1F) << 8)
                | (log_wq_size as u32 & 0x1F),
        );
        ctx
    }

    /// Offset of this context within the create command, after the SQ/RQ
    /// context at 0x20.
    pub(crate) fn command_offset() -> usize {
        0x50
    }
}

/// The work queue doorbell record shared by a receive/send queue pair: two
/// producer counters, updated in place and read by the device.
#[repr(C)]
pub(crate) struct DoorbellRecord {
    pub(crate) rcv_counter: Volatile<B32>,
    pub(crate) send_counter: Volatile<B32>,
}

const_assert_eq!(core::mem::size_of::<DoorbellRecord>(), 8);
