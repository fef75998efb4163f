//! Send queue: the TIS and SQ contexts passed at creation, and the runtime
//! ring that turns packets into WQEs.
//! (PRM Section 8.15: Transmit Flow)

use std::rc::Rc;

use byteorder::BigEndian;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, U32};

use crate::dma::DmaRegion;
use crate::uar::UarPage;
use crate::work_queue::DoorbellRecord;

type B32 = U32<BigEndian>;

/// Bytes of L2 header carried inline in the Ethernet segment
/// (min_wqe_inline_mode = 1).
pub const INLINE_HEADER_SIZE: usize = 14;

/// Every send WQE is one basic block: control segment, Ethernet segment with
/// the inline header, and a single data pointer.
pub const SQ_WQE_STRIDE: usize = 64;
pub const LOG_SQ_WQE_STRIDE: u8 = 6;

const WQE_OPCODE_SEND: u32 = 0x0A;
/// fm_ce_se: request a CQE for every WQE.
const CE_CQE_ALWAYS: u32 = 0x08;
/// Data segments per WQE: ctrl + eth (two blocks) + data.
const DS_COUNT: u32 = 4;

#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct TransportInterfaceSendContext {
    prio_or_sl: B32,
    _reserved0: [u8; 32],
    transport_domain: B32,
    _reserved1: [u8; 4],
    pd: B32,
    _reserved2: [u8; 32],
    _reserved3: [u8; 32],
    _reserved4: [u8; 32],
    _reserved5: [u8; 16],
}

const_assert_eq!(core::mem::size_of::<TransportInterfaceSendContext>(), 0xA0);

impl TransportInterfaceSendContext {
    pub(crate) fn init(prio: u8, td: u32) -> TransportInterfaceSendContext {
        let mut ctx = TransportInterfaceSendContext::default();
        ctx.prio_or_sl.set(((prio as u32) & 0xF) << 16);
        ctx.transport_domain.set(td & 0xFF_FFFF);
        ctx
    }

    pub(crate) fn command_offset() -> usize {
        0x20
    }
}

#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct SendQueueContext {
    rlky: B32,
    user_index: B32,
    cqn: B32,
    hairpin_peer_rq: B32,
    hairpin_peer_vhca: B32,
    _reserved0: [u8; 8],
    packet_pacing_rate_limit_index: B32,
    tis_lst_sz: B32,
    _reserved1: [u8; 8],
    tis_num_0: B32,
}

const_assert_eq!(core::mem::size_of::<SendQueueContext>(), 0x30);

impl SendQueueContext {
    pub(crate) fn init(cqn: u32, tisn: u32) -> SendQueueContext {
        let mut ctx = SendQueueContext::default();
        // reserved lkey | fast register enable | flush in error | inline mode L2
        ctx.rlky.set((1 << 31) | (1 << 29) | (1 << 28) | (1 << 24));
        ctx.cqn.set(cqn & 0xFF_FFFF);
        ctx.tis_lst_sz.set(1 << 16);
        ctx.tis_num_0.set(tisn & 0xFF_FFFF);
        ctx
    }

    pub(crate) fn command_offset() -> usize {
        0x20
    }
}

/// The runtime send queue: a cyclic WQE ring in the shared slab, the shared
/// doorbell record, and the UAR doorbell page.
pub struct SendQueue {
    sqn: u32,
    slab: Rc<DmaRegion>,
    /// Byte offset of the first WQE within the slab.
    base: usize,
    size: u32,
    doorbell: Rc<DmaRegion>,
    uar: UarPage,
    lkey: u32,
    /// Producer counter: WQEs posted since creation.
    pub pc: u32,
    /// Consumer counter: completions reaped since creation.
    pub cc: u32,
    /// Control dwords of the most recent WQE, replayed into the BlueFlame
    /// register when the doorbell rings.
    last_ctrl: (u32, u32),
}

impl SendQueue {
    pub(crate) fn new(
        sqn: u32,
        slab: Rc<DmaRegion>,
        base: usize,
        size: u32,
        doorbell: Rc<DmaRegion>,
        uar: UarPage,
        lkey: u32,
    ) -> SendQueue {
        assert!(size.is_power_of_two());
        SendQueue {
            sqn,
            slab,
            base,
            size,
            doorbell,
            uar,
            lkey,
            pc: 0,
            cc: 0,
            last_ctrl: (0, 0),
        }
    }

    pub fn sqn(&self) -> u32 {
        self.sqn
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn is_full(&self) -> bool {
        self.pc.wrapping_sub(self.cc) >= self.size
    }

    pub fn outstanding(&self) -> u32 {
        self.pc.wrapping_sub(self.cc)
    }

    /// Posts one packet as a send WQE: the first [`INLINE_HEADER_SIZE`] bytes
    /// go inline in the Ethernet segment, the rest is pointed to by physical
    /// address. The caller must have checked [`SendQueue::is_full`] and that
    /// the frame covers at least the inline header.
    pub fn post(&mut self, headers: &[u8; INLINE_HEADER_SIZE], phys: u64, len: u32) {
        debug_assert!(!self.is_full());
        debug_assert!(len as usize >= INLINE_HEADER_SIZE);
        let wqe = self.base + ((self.pc & (self.size - 1)) as usize) * SQ_WQE_STRIDE;
        self.slab.zero_range(wqe, SQ_WQE_STRIDE);

        // Control segment.
        let ctrl0 = ((self.pc & 0xFFFF) << 8) | WQE_OPCODE_SEND;
        let ctrl1 = (self.sqn << 8) | DS_COUNT;
        self.slab.write_u32(wqe, ctrl0);
        self.slab.write_u32(wqe + 0x04, ctrl1);
        self.slab.write_u32(wqe + 0x08, CE_CQE_ALWAYS);

        // Ethernet segment: inline header size at +0x1C[31:16], then the
        // header bytes themselves.
        let sz = INLINE_HEADER_SIZE as u32;
        self.slab.write_u32(
            wqe + 0x1C,
            (sz << 16) | ((headers[0] as u32) << 8) | headers[1] as u32,
        );
        for (i, dword) in headers[2..].chunks_exact(4).enumerate() {
            self.slab
                .write_u32(wqe + 0x20 + i * 4, u32::from_be_bytes(dword.try_into().unwrap()));
        }

        // Data segment points past the inlined bytes.
        self.slab.write_u32(wqe + 0x30, len - sz);
        self.slab.write_u32(wqe + 0x34, self.lkey);
        self.slab.write_u64(wqe + 0x38, phys + sz as u64);

        self.last_ctrl = (ctrl0, ctrl1);
        self.pc = self.pc.wrapping_add(1);
    }

    fn doorbell_record(&mut self) -> &mut DoorbellRecord {
        unsafe { &mut *(self.doorbell.virt() as *mut DoorbellRecord) }
    }

    /// Publishes the producer counter in the doorbell record and rings the
    /// UAR doorbell with the head of the last WQE.
    pub fn ring_doorbell(&mut self) {
        let pc = self.pc & 0xFFFF;
        self.doorbell_record().send_counter.write(U32::new(pc));
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        self.uar.ring_send_doorbell(self.last_ctrl.0, self.last_ctrl.1);
    }
}
