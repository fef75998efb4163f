//! Completion queues and their entries.
//! (PRM Section 8.18: Completion Queues)

use byteorder::BigEndian;
use static_assertions::const_assert_eq;
use volatile::Volatile;
use zerocopy::{AsBytes, FromBytes, U32};

use crate::bits;
use crate::dma::DmaRegion;

type B32 = U32<BigEndian>;

pub const CQE_SIZE: usize = 64;

/// CQE opcode marking a never-written entry.
const CQE_OPCODE_INVALID: u32 = 0xF;
/// CQE opcodes flagging errored completions.
pub const CQE_OPCODE_REQUESTER_ERR: u8 = 0xD;
pub const CQE_OPCODE_RESPONDER_ERR: u8 = 0xE;

/// The completion queue context, staged in host memory and copied into the
/// CREATE_CQ command.
#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct CompletionQueueContext {
    status: B32,
    _reserved0: [u8; 4],
    page_offset: B32,
    uar_log_cq_size: B32,
    cq_max_count_period: B32,
    c_eqn: B32,
    log_page_size: B32,
    _reserved1: [u8; 4],
    last_notified_index: B32,
    last_solicit_index: B32,
    consumer_counter: B32,
    producer_counter: B32,
    _reserved2: [u8; 8],
    dbr_addr_h: B32,
    dbr_addr_l: B32,
}

const_assert_eq!(core::mem::size_of::<CompletionQueueContext>(), 0x40);

impl CompletionQueueContext {
    pub(crate) fn init(
        uar_page: u32,
        log_cq_size: u8,
        log_page_size: u8,
        c_eqn: u8,
        dbr_addr: u64,
    ) -> CompletionQueueContext {
        let mut ctx = CompletionQueueContext::default();
        let uar = uar_page & 0xFF_FFFF;
        let size = ((log_cq_size & 0x1F) as u32) << 24;
        ctx.uar_log_cq_size.set(uar | size);
        ctx.c_eqn.set(c_eqn as u32);
        ctx.log_page_size.set(((log_page_size & 0x1F) as u32) << 24);
        ctx.dbr_addr_h.set((dbr_addr >> 32) as u32);
        ctx.dbr_addr_l.set(dbr_addr as u32);
        ctx
    }

    pub(crate) fn command_offset() -> usize {
        0x10
    }
}

/// One completion queue entry, written by the device and read in place.
#[repr(C)]
pub(crate) struct CompletionQueueEntry {
    _reserved0: [u8; 44],
    byte_count: Volatile<B32>,
    _reserved1: [u8; 12],
    /// wqe_counter in [31:16], opcode in [7:4], ownership in bit 0.
    wqe_counter_op_own: Volatile<B32>,
}

const_assert_eq!(core::mem::size_of::<CompletionQueueEntry>(), CQE_SIZE);

impl CompletionQueueEntry {
    /// Marks the entry invalid and hardware-owned.
    fn init(&mut self) {
        self.byte_count.write(U32::new(0));
        self.wqe_counter_op_own.write(U32::new((CQE_OPCODE_INVALID << 4) | 0x1));
    }
}

/// The CQ doorbell record, read by the device to learn consumer progress.
#[repr(C)]
pub(crate) struct CompletionQueueDoorbellRecord {
    update_ci: Volatile<B32>,
    arm_ci: Volatile<B32>,
}

const_assert_eq!(core::mem::size_of::<CompletionQueueDoorbellRecord>(), 8);

/// One reaped completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub wqe_counter: u16,
    pub byte_count: u32,
    pub opcode: u8,
}

impl Completion {
    pub fn is_error(&self) -> bool {
        self.opcode == CQE_OPCODE_REQUESTER_ERR || self.opcode == CQE_OPCODE_RESPONDER_ERR
    }
}

/// A completion queue: entries written by the device, consumed in order by
/// the driver. Ownership alternates each lap of the ring, so the consumer
/// compares the entry's owner bit against the phase of its own counter.
pub struct CompletionQueue {
    cqn: u32,
    ring: DmaRegion,
    size: u32,
    log_size: u8,
    doorbell: DmaRegion,
    /// Consumer counter.
    pub ci: u32,
}

impl CompletionQueue {
    pub(crate) fn new(cqn: u32, ring: DmaRegion, log_size: u8, doorbell: DmaRegion) -> CompletionQueue {
        let mut cq = CompletionQueue {
            cqn,
            ring,
            size: 1 << log_size,
            log_size,
            doorbell,
            ci: 0,
        };
        let record = cq.doorbell_record();
        record.update_ci.write(U32::new(0));
        record.arm_ci.write(U32::new(0));
        cq
    }

    pub fn cqn(&self) -> u32 {
        self.cqn
    }

    /// Marks every entry invalid and hardware-owned. Run once before the
    /// queue is handed to the device.
    pub(crate) fn init_entries(ring: &DmaRegion) {
        for offset in (0..ring.len()).step_by(CQE_SIZE) {
            let entry = unsafe { &mut *(ring.virt().add(offset) as *mut CompletionQueueEntry) };
            entry.init();
        }
    }

    fn entry(&mut self, index: u32) -> &mut CompletionQueueEntry {
        let offset = ((index & (self.size - 1)) as usize) * CQE_SIZE;
        unsafe { &mut *(self.ring.virt().add(offset) as *mut CompletionQueueEntry) }
    }

    fn doorbell_record(&mut self) -> &mut CompletionQueueDoorbellRecord {
        unsafe { &mut *(self.doorbell.virt() as *mut CompletionQueueDoorbellRecord) }
    }

    /// Reaps the next completion, if the device has published one.
    pub fn poll(&mut self) -> Option<Completion> {
        let index = self.ci;
        let word = self.entry(index).wqe_counter_op_own.read().get();
        let opcode = bits::get_bits(word, 7, 4) as u8;
        let owner = word & 0x1;
        let phase = (self.ci >> self.log_size) & 0x1;
        if opcode == CQE_OPCODE_INVALID as u8 || owner != phase {
            return None;
        }
        let byte_count = self.entry(index).byte_count.read().get();
        let completion = Completion {
            wqe_counter: bits::get_bits(word, 31, 16) as u16,
            byte_count,
            opcode,
        };
        self.ci = self.ci.wrapping_add(1);
        Some(completion)
    }

    /// Publishes the consumer counter so the device can reuse reaped slots.
    pub fn update_doorbell(&mut self) {
        let ci = self.ci & 0xFF_FFFF;
        self.doorbell_record().update_ci.write(U32::new(ci));
    }
}
