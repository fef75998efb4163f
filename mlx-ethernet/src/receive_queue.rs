//! Receive queue: the TIR and RQ contexts passed at creation, and the
//! runtime ring of posted packet buffers.
//! (PRM Section 8.14: Receive Flow)

use std::rc::Rc;

use byteorder::BigEndian;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, U32};

use crate::dma::DmaRegion;
use crate::work_queue::DoorbellRecord;

type B32 = U32<BigEndian>;

/// Every receive WQE is a single 16-byte data segment.
pub const RQ_WQE_STRIDE: usize = 16;
pub const LOG_RQ_WQE_STRIDE: u8 = 4;

#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct ReceiveQueueContext {
    rlky_state: B32,
    user_index: B32,
    cqn: B32,
    counter_set_id: B32,
    rmpn: B32,
    _reserved0: [u8; 28],
}

const_assert_eq!(core::mem::size_of::<ReceiveQueueContext>(), 0x30);

impl ReceiveQueueContext {
    pub(crate) fn init(cqn: u32) -> ReceiveQueueContext {
        let mut ctx = ReceiveQueueContext::default();
        // reserved lkey | VLAN strip disable
        ctx.rlky_state.set((1 << 31) | (1 << 28));
        ctx.cqn.set(cqn & 0xFF_FFFF);
        ctx
    }

    pub(crate) fn command_offset() -> usize {
        0x20
    }
}

/// Transport Interface Receive context for a direct (non-RSS) TIR: packets
/// matching a flow rule that forwards here are dispatched straight to one RQ.
#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct TirContext {
    _reserved0: [u8; 4],
    disp_type: B32,
    _reserved1: [u8; 20],
    inline_rqn: B32,
    _reserved2: [u8; 4],
    transport_domain: B32,
    _reserved3: [u8; 32],
    _reserved4: [u8; 32],
    _reserved5: [u8; 32],
    _reserved6: [u8; 32],
    _reserved7: [u8; 32],
    _reserved8: [u8; 32],
    _reserved9: [u8; 8],
}

const_assert_eq!(core::mem::size_of::<TirContext>(), 0xF0);

impl TirContext {
    pub(crate) fn init_direct(rqn: u32, td: u32) -> TirContext {
        let mut ctx = TirContext::default();
        // disp_type 0 = direct dispatch, no RSS hashing
        ctx.disp_type.set(0);
        ctx.inline_rqn.set(rqn & 0xFF_FFFF);
        ctx.transport_domain.set(td & 0xFF_FFFF);
        ctx
    }

    pub(crate) fn command_offset() -> usize {
        0x20
    }
}

/// The runtime receive queue: a cyclic ring of data-segment WQEs in the
/// shared slab plus the shared doorbell record.
pub struct ReceiveQueue {
    rqn: u32,
    slab: Rc<DmaRegion>,
    /// Byte offset of the first WQE within the slab.
    base: usize,
    size: u32,
    doorbell: Rc<DmaRegion>,
    lkey: u32,
    /// Producer counter: buffers posted since creation.
    pub pc: u32,
    /// Consumer counter: completions reaped since creation.
    pub cc: u32,
}

impl ReceiveQueue {
    pub(crate) fn new(
        rqn: u32,
        slab: Rc<DmaRegion>,
        base: usize,
        size: u32,
        doorbell: Rc<DmaRegion>,
        lkey: u32,
    ) -> ReceiveQueue {
        assert!(size.is_power_of_two());
        ReceiveQueue {
            rqn,
            slab,
            base,
            size,
            doorbell,
            lkey,
            pc: 0,
            cc: 0,
        }
    }

    pub fn rqn(&self) -> u32 {
        self.rqn
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_full(&self) -> bool {
        self.pc.wrapping_sub(self.cc) >= self.size
    }

    /// Posts one empty buffer. Returns false when the ring is full.
    pub fn post(&mut self, phys: u64, len: u32) -> bool {
        if self.is_full() {
            return false;
        }
        let wqe = self.base + ((self.pc & (self.size - 1)) as usize) * RQ_WQE_STRIDE;
        self.slab.write_u32(wqe, len);
        self.slab.write_u32(wqe + 4, self.lkey);
        self.slab.write_u64(wqe + 8, phys);
        self.pc = self.pc.wrapping_add(1);
        true
    }

    fn doorbell_record(&mut self) -> &mut DoorbellRecord {
        unsafe { &mut *(self.doorbell.virt() as *mut DoorbellRecord) }
    }

    /// Publishes the producer counter in the doorbell record.
    pub fn ring_doorbell(&mut self) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        let pc = self.pc & 0xFFFF;
        self.doorbell_record().rcv_counter.write(U32::new(pc));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaAllocator, HeapDma};

    fn queue(size: u32) -> ReceiveQueue {
        let slab = Rc::new(HeapDma.alloc(size as usize * 64, 4096).unwrap());
        let db = Rc::new(HeapDma.alloc(64, 64).unwrap());
        ReceiveQueue::new(7, slab, 0, size, db, 0x1234)
    }

    #[test]
    fn cyclic_indexing_is_masking() {
        for n in [4u32, 64, 1024] {
            for p in [0u32, 1, n - 1, n, 3 * n + 2, u32::MAX] {
                assert_eq!(p % n, p & (n - 1));
            }
        }
    }

    #[test]
    fn ring_fills_and_wraps() {
        let mut rq = queue(4);
        for i in 0..4 {
            assert!(rq.post(0x1000 + i, 2048));
        }
        assert!(rq.is_full());
        assert!(!rq.post(0x5000, 2048));
        // consumer catches up; producer lands on the same slot again
        rq.cc = rq.cc.wrapping_add(2);
        assert!(rq.post(0x6000, 2048));
        assert_eq!(rq.pc & 3, 1);
        assert_eq!(rq.slab.read_u64(8), 0x6000);
    }

    #[test]
    fn wqe_is_a_single_data_segment() {
        let mut rq = queue(4);
        rq.post(0xAAAA_0000, 2048);
        assert_eq!(rq.slab.read_u32(0), 2048);
        assert_eq!(rq.slab.read_u32(4), 0x1234);
        assert_eq!(rq.slab.read_u64(8), 0xAAAA_0000);
        rq.ring_doorbell();
        assert_eq!(rq.doorbell.read_u32(0), 1);
    }
}
