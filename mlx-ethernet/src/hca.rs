//! The HCA command set: one method per firmware opcode, each a thin shell
//! over the command interface. Inputs and outputs are in host order; the
//! offset and bit-range encodings follow the PRM command reference.
//! (PRM Chapter 23, and Section 7.2: HCA Driver Start-up)

use log::trace;
use zerocopy::AsBytes;

use crate::capabilities::HcaCapabilities;
use crate::command_queue::{Clock, CommandOpcode, CommandQueue};
use crate::command_queue::{CommandInput, CommandOutput};
use crate::completion_queue::{CompletionQueue, CompletionQueueContext, CQE_SIZE};
use crate::dma::{DmaRegion, SharedDma};
use crate::error::Error;
use crate::event_queue::{EventQueue, EventQueueContext, EQE_SIZE, EQ_EVENT_BITMASK, LOG_EQ_SIZE};
use crate::flow_table::{
    DestinationEntry, DestinationType, FlowContext, FlowContextAction, FlowEntryInput, FlowGroupInput,
    FlowTable, FlowTableContext, FlowTableType, MatchCriteriaEnable,
};
use crate::initialization_segment::InitializationSegment;
use crate::log_page_size;
use crate::receive_queue::{ReceiveQueue, ReceiveQueueContext, TirContext, LOG_RQ_WQE_STRIDE, RQ_WQE_STRIDE};
use crate::send_queue::{SendQueue, SendQueueContext, TransportInterfaceSendContext, LOG_SQ_WQE_STRIDE, SQ_WQE_STRIDE};
use crate::uar::UarPage;
use crate::work_queue::WorkQueueContext;

use std::rc::Rc;

/// User Access Region handle: an index into the device's MMIO register pages.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Uar(pub u32);

/// Protection domain number.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Pd(pub u32);

/// Transport domain number.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransportDomain(pub u32);

/// Transport Interface Send number.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tis(pub u32);

/// Transport Interface Receive number.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tir(pub u32);

/// Which pool QUERY_PAGES / MANAGE_PAGES refer to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum PageClass {
    Boot = 1,
    Init = 2,
    Regular = 3,
}

/// QUERY_HCA_CAP opcode modifier bit 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum CapabilityMode {
    Max = 0,
    Current = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub enum TeardownMode {
    Graceful = 0,
    Panic = 1,
}

/// Work queue states and their legal transitions:
/// RST→RDY, RDY→ERR, ERR→RST.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum WqState {
    Reset = 0,
    Ready = 1,
    Error = 3,
}

/// Port Administrative and Operational Status register.
pub const REGISTER_PAOS: u32 = 0x5006;
/// Port Physical Loopback Register.
pub const REGISTER_PPLR: u32 = 0x5018;

const ACCESS_REGISTER_WRITE: u16 = 0;
const ACCESS_REGISTER_READ: u16 = 1;

/// PAOS status codes: 1 = up, 2 = down.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub admin_status: u8,
    pub oper_status: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VportState {
    pub admin_state: u8,
    pub oper_state: u8,
}

/// The device's command-plane persona: the initialization segment plus the
/// command queue, and ownership of every page handed to the firmware.
pub struct Hca {
    init_seg: InitializationSegment,
    cmdq: CommandQueue,
    dma: SharedDma,
    /// Pages transferred with MANAGE_PAGES. Once transferred they belong to
    /// the firmware and are only reclaimed by the device reset at teardown.
    firmware_pages: Vec<DmaRegion>,
}

impl Hca {
    /// Maps the command interface over BAR0: allocates the command queue,
    /// publishes its physical address (MSB dword first) and waits for the
    /// firmware to leave the initializing state.
    ///
    /// # Safety
    /// `bar` must be the mapped base of the device's BAR0.
    pub unsafe fn new(
        bar: *mut u8,
        dma: SharedDma,
        clock: Box<dyn Clock>,
        hexdump: bool,
    ) -> Result<Hca, Error> {
        let mut init_seg = InitializationSegment::new(bar);
        let (major, minor, subminor) = init_seg.fw_rev();
        trace!(
            "firmware {major}.{minor}.{subminor}, command interface rev {}",
            init_seg.cmd_interface_rev()
        );
        let mut cmdq = CommandQueue::new(dma.clone(), clock, hexdump)?;
        trace!(
            "command queue at {:#x} ({} entries, stride {})",
            cmdq.phys_addr(),
            1u32 << init_seg.log_cmdq_size(),
            1u32 << init_seg.log_cmdq_stride(),
        );
        init_seg.set_cmdq_phys_addr(cmdq.phys_addr());
        cmdq.wait_ready(&init_seg);
        Ok(Hca {
            init_seg,
            cmdq,
            dma,
            firmware_pages: Vec::new(),
        })
    }

    pub fn init_segment(&self) -> &InitializationSegment {
        &self.init_seg
    }

    pub fn set_hexdump(&mut self, enabled: bool) {
        self.cmdq.set_hexdump(enabled);
    }

    /// Signature the device wrote on the most recent command.
    pub fn command_signature(&self) -> u8 {
        self.cmdq.signature()
    }

    fn cmd<T>(
        &mut self,
        opcode: CommandOpcode,
        opmod: u16,
        in_len: usize,
        out_len: usize,
        fill: impl FnOnce(&mut CommandInput),
        read: impl FnOnce(&CommandOutput) -> T,
    ) -> Result<T, Error> {
        self.cmdq
            .execute(&mut self.init_seg, opcode, opmod, in_len, out_len, fill, read)
    }

    /// ENABLE_HCA: must be the first command after mapping.
    pub fn enable_hca(&mut self) -> Result<(), Error> {
        self.cmd(CommandOpcode::EnableHca, 0, 0x0C, 0x08, |_| (), |_| ())
    }

    pub fn disable_hca(&mut self) -> Result<(), Error> {
        self.cmd(CommandOpcode::DisableHca, 0, 0x0C, 0x08, |_| (), |_| ())
    }

    /// Current ISSI and the supported-version bitmask.
    pub fn query_issi(&mut self) -> Result<(u16, u32), Error> {
        self.cmd(
            CommandOpcode::QueryIssi,
            0,
            0x08,
            0x70,
            |_| (),
            |out| (out.get_bits(0x08, 15, 0) as u16, out.get_u32(0x20)),
        )
    }

    /// Selects the command-interface version.
    pub fn set_issi(&mut self, issi: u16) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::SetIssi,
            0,
            0x0C,
            0x08,
            |input| input.set_u32(0x08, issi as u32),
            |_| (),
        )
    }

    /// Number of pages the firmware wants for the given pool; negative means
    /// the firmware is returning pages.
    pub fn query_pages(&mut self, which: PageClass) -> Result<i32, Error> {
        let num = self.cmd(
            CommandOpcode::QueryPages,
            which as u16,
            0x0C,
            0x10,
            |_| (),
            |out| out.get_u32(0x0C) as i32,
        )?;
        trace!("firmware requests {num} {which:?} pages");
        Ok(num)
    }

    /// MANAGE_PAGES(allocate): DMA-allocates `num_pages` 4 KiB pages and
    /// hands their physical addresses to the firmware.
    pub fn alloc_pages(&mut self, num_pages: i32) -> Result<(), Error> {
        if num_pages <= 0 {
            return Ok(());
        }
        let n = num_pages as usize;
        let mut pages = Vec::with_capacity(n);
        for _ in 0..n {
            pages.push(self.dma.borrow_mut().alloc(4096, 4096)?);
        }
        self.cmd(
            CommandOpcode::ManagePages,
            1, // opmod 1: allocation success
            0x10 + n * 8,
            0x10,
            |input| {
                input.set_u32(0x0C, n as u32);
                for (i, page) in pages.iter().enumerate() {
                    input.set_u64(0x10 + i * 8, page.phys());
                }
            },
            |_| (),
        )?;
        self.firmware_pages.extend(pages);
        Ok(())
    }

    pub fn query_hca_cap(&mut self, mode: CapabilityMode) -> Result<HcaCapabilities, Error> {
        let caps = self.cmd(
            CommandOpcode::QueryHcaCap,
            mode as u16, // opmod bit 0: 0 = max, 1 = current; general device caps
            0x0C,
            0x10 + 0x1000,
            |_| (),
            HcaCapabilities::parse,
        )?;
        trace!("{mode:?} capabilities: {caps:?}");
        Ok(caps)
    }

    pub fn init_hca(&mut self) -> Result<(), Error> {
        self.cmd(CommandOpcode::InitHca, 0, 0x0C, 0x08, |_| (), |_| ())
    }

    pub fn teardown_hca(&mut self, mode: TeardownMode) -> Result<(), Error> {
        self.cmd(CommandOpcode::TeardownHca, mode as u16, 0x0C, 0x08, |_| (), |_| ())
    }

    /// Reserved lkey for Base Memory Management Extension, used in every WQE
    /// that addresses buffers physically.
    pub fn query_special_contexts(&mut self) -> Result<u32, Error> {
        self.cmd(
            CommandOpcode::QuerySpecialContexts,
            0,
            0x08,
            0x10,
            |_| (),
            |out| out.get_u32(0x0C),
        )
    }

    pub fn alloc_uar(&mut self) -> Result<Uar, Error> {
        let uar = self.cmd(
            CommandOpcode::AllocUar,
            0,
            0x08,
            0x10,
            |_| (),
            |out| Uar(out.get_bits(0x08, 23, 0)),
        )?;
        trace!("allocated {uar:?}");
        Ok(uar)
    }

    pub fn dealloc_uar(&mut self, uar: Uar) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::DeallocUar,
            0,
            0x0C,
            0x08,
            |input| input.set_bits(0x08, 23, 0, uar.0),
            |_| (),
        )
    }

    pub fn alloc_pd(&mut self) -> Result<Pd, Error> {
        self.cmd(
            CommandOpcode::AllocPd,
            0,
            0x08,
            0x10,
            |_| (),
            |out| Pd(out.get_bits(0x08, 23, 0)),
        )
    }

    pub fn dealloc_pd(&mut self, pd: Pd) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::DeallocPd,
            0,
            0x0C,
            0x08,
            |input| input.set_bits(0x08, 23, 0, pd.0),
            |_| (),
        )
    }

    pub fn alloc_transport_domain(&mut self) -> Result<TransportDomain, Error> {
        self.cmd(
            CommandOpcode::AllocTransportDomain,
            0,
            0x08,
            0x10,
            |_| (),
            |out| TransportDomain(out.get_bits(0x08, 23, 0)),
        )
    }

    pub fn dealloc_transport_domain(&mut self, td: TransportDomain) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::DeallocTransportDomain,
            0,
            0x0C,
            0x08,
            |input| input.set_bits(0x08, 23, 0, td.0),
            |_| (),
        )
    }

    /// CREATE_EQ: 128 entries in one physically contiguous allocation,
    /// subscribed to page-request events only. Every entry starts
    /// hardware-owned.
    pub fn create_eq(&mut self, uar: Uar) -> Result<EventQueue, Error> {
        let ring = self
            .dma
            .borrow_mut()
            .alloc((1usize << LOG_EQ_SIZE) * EQE_SIZE, 4096)?;
        EventQueue::init_entries(&ring);
        let ctx = EventQueueContext::init(uar.0, LOG_EQ_SIZE, log_page_size(ring.len()));
        let phys = ring.phys();
        let eqn = self.cmd(
            CommandOpcode::CreateEq,
            0,
            0x118,
            0x10,
            |input| {
                input.set_bytes(EventQueueContext::command_offset(), ctx.as_bytes());
                input.set_u64(0x58, EQ_EVENT_BITMASK);
                input.set_u64(0x110, phys);
            },
            |out| out.get_bits(0x08, 7, 0) as u8,
        )?;
        trace!("created eq {eqn}");
        Ok(EventQueue::new(eqn, ring, LOG_EQ_SIZE))
    }

    pub fn destroy_eq(&mut self, eq: EventQueue) -> Result<(), Error> {
        let eqn = eq.eqn();
        self.cmd(
            CommandOpcode::DestroyEq,
            0,
            0x0C,
            0x08,
            |input| input.set_bits(0x08, 7, 0, eqn as u32),
            |_| (),
        )
    }

    /// CREATE_CQ with an owned doorbell record; `entries` must be a power of
    /// two.
    pub fn create_cq(&mut self, entries: u32, uar: Uar, eqn: u8) -> Result<CompletionQueue, Error> {
        assert!(entries.is_power_of_two());
        let log_size = entries.ilog2() as u8;
        let ring = self.dma.borrow_mut().alloc(entries as usize * CQE_SIZE, 4096)?;
        CompletionQueue::init_entries(&ring);
        let doorbell = self.dma.borrow_mut().alloc(64, 64)?;
        let ctx = CompletionQueueContext::init(
            uar.0,
            log_size,
            log_page_size(ring.len()),
            eqn,
            doorbell.phys(),
        );
        let phys = ring.phys();
        let cqn = self.cmd(
            CommandOpcode::CreateCq,
            0,
            0x118,
            0x10,
            |input| {
                input.set_bytes(CompletionQueueContext::command_offset(), ctx.as_bytes());
                input.set_u64(0x110, phys);
            },
            |out| out.get_bits(0x08, 23, 0),
        )?;
        trace!("created cq {cqn} ({entries} entries)");
        Ok(CompletionQueue::new(cqn, ring, log_size, doorbell))
    }

    pub fn destroy_cq(&mut self, cq: CompletionQueue) -> Result<(), Error> {
        let cqn = cq.cqn();
        self.cmd(
            CommandOpcode::DestroyCq,
            0,
            0x0C,
            0x08,
            |input| input.set_bits(0x08, 23, 0, cqn),
            |_| (),
        )
    }

    pub fn create_tis(&mut self, prio: u8, td: TransportDomain) -> Result<Tis, Error> {
        let ctx = TransportInterfaceSendContext::init(prio, td.0);
        self.cmd(
            CommandOpcode::CreateTis,
            0,
            0xC0,
            0x10,
            |input| input.set_bytes(TransportInterfaceSendContext::command_offset(), ctx.as_bytes()),
            |out| Tis(out.get_bits(0x08, 23, 0)),
        )
    }

    pub fn destroy_tis(&mut self, tis: Tis) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::DestroyTis,
            0,
            0x0C,
            0x08,
            |input| input.set_bits(0x08, 23, 0, tis.0),
            |_| (),
        )
    }

    /// CREATE_TIR in direct dispatch mode: no RSS hash, every packet goes to
    /// the one receive queue.
    pub fn create_tir_direct(&mut self, rqn: u32, td: TransportDomain) -> Result<Tir, Error> {
        let ctx = TirContext::init_direct(rqn, td.0);
        self.cmd(
            CommandOpcode::CreateTir,
            0,
            0x110,
            0x10,
            |input| input.set_bytes(TirContext::command_offset(), ctx.as_bytes()),
            |out| Tir(out.get_bits(0x08, 23, 0)),
        )
    }

    pub fn destroy_tir(&mut self, tir: Tir) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::DestroyTir,
            0,
            0x0C,
            0x08,
            |input| input.set_bits(0x08, 23, 0, tir.0),
            |_| (),
        )
    }

    /// CREATE_SQ over `size` 64-byte strides of the shared WQE slab starting
    /// at `slab_offset`. The queue is created in RST state.
    #[allow(clippy::too_many_arguments)]
    pub fn create_sq(
        &mut self,
        cqn: u32,
        pd: Pd,
        size: u32,
        slab: Rc<DmaRegion>,
        slab_offset: usize,
        doorbell: Rc<DmaRegion>,
        tis: Tis,
        uar: Uar,
        uar_page: UarPage,
        lkey: u32,
    ) -> Result<SendQueue, Error> {
        assert!(size.is_power_of_two());
        let log_size = size.ilog2() as u8;
        let sqc = SendQueueContext::init(cqn, tis.0);
        let wq = WorkQueueContext::init(
            pd.0,
            uar.0,
            doorbell.phys(),
            LOG_SQ_WQE_STRIDE,
            log_page_size(size as usize * SQ_WQE_STRIDE),
            log_size,
        );
        let phys = slab.phys() + slab_offset as u64;
        let sqn = self.cmd(
            CommandOpcode::CreateSq,
            0,
            0x118,
            0x10,
            |input| {
                input.set_bytes(SendQueueContext::command_offset(), sqc.as_bytes());
                input.set_bytes(WorkQueueContext::command_offset(), wq.as_bytes());
                input.set_u64(0x110, phys);
            },
            |out| out.get_bits(0x08, 23, 0),
        )?;
        trace!("created sq {sqn} ({size} entries)");
        Ok(SendQueue::new(sqn, slab, slab_offset, size, doorbell, uar_page, lkey))
    }

    pub fn destroy_sq(&mut self, sq: SendQueue) -> Result<(), Error> {
        let sqn = sq.sqn();
        self.cmd(
            CommandOpcode::DestroySq,
            0,
            0x0C,
            0x08,
            |input| input.set_bits(0x08, 23, 0, sqn),
            |_| (),
        )
    }

    /// CREATE_RQ over `size` 16-byte strides of the shared WQE slab starting
    /// at `slab_offset`. The queue is created in RST state.
    #[allow(clippy::too_many_arguments)]
    pub fn create_rq(
        &mut self,
        cqn: u32,
        pd: Pd,
        size: u32,
        slab: Rc<DmaRegion>,
        slab_offset: usize,
        doorbell: Rc<DmaRegion>,
        uar: Uar,
        lkey: u32,
    ) -> Result<ReceiveQueue, Error> {
        assert!(size.is_power_of_two());
        let log_size = size.ilog2() as u8;
        let rqc = ReceiveQueueContext::init(cqn);
        let wq = WorkQueueContext::init(
            pd.0,
            uar.0,
            doorbell.phys(),
            LOG_RQ_WQE_STRIDE,
            log_page_size(size as usize * RQ_WQE_STRIDE),
            log_size,
        );
        let phys = slab.phys() + slab_offset as u64;
        let rqn = self.cmd(
            CommandOpcode::CreateRq,
            0,
            0x118,
            0x10,
            |input| {
                input.set_bytes(ReceiveQueueContext::command_offset(), rqc.as_bytes());
                input.set_bytes(WorkQueueContext::command_offset(), wq.as_bytes());
                input.set_u64(0x110, phys);
            },
            |out| out.get_bits(0x08, 23, 0),
        )?;
        trace!("created rq {rqn} ({size} entries)");
        Ok(ReceiveQueue::new(rqn, slab, slab_offset, size, doorbell, lkey))
    }

    pub fn destroy_rq(&mut self, rq: ReceiveQueue) -> Result<(), Error> {
        let rqn = rq.rqn();
        self.cmd(
            CommandOpcode::DestroyRq,
            0,
            0x0C,
            0x08,
            |input| input.set_bits(0x08, 23, 0, rqn),
            |_| (),
        )
    }

    pub fn modify_sq(&mut self, sqn: u32, curr: WqState, next: WqState) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::ModifySq,
            0,
            0x24,
            0x08,
            |input| {
                input.set_bits(0x08, 31, 28, curr as u32);
                input.set_bits(0x08, 23, 0, sqn);
                input.set_bits(0x20, 23, 20, next as u32);
            },
            |_| (),
        )
    }

    pub fn modify_rq(&mut self, rqn: u32, curr: WqState, next: WqState) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::ModifyRq,
            0,
            0x24,
            0x08,
            |input| {
                input.set_bits(0x08, 31, 28, curr as u32);
                input.set_bits(0x08, 23, 0, rqn);
                input.set_bits(0x20, 23, 20, next as u32);
            },
            |_| (),
        )
    }

    pub fn create_flow_table(&mut self, kind: FlowTableType, log_size: u8) -> Result<FlowTable, Error> {
        let ctx = FlowTableContext::init(log_size);
        let id = self.cmd(
            CommandOpcode::CreateFlowTable,
            0,
            0x40,
            0x10,
            |input| {
                input.set_bits(0x10, 31, 24, kind as u32);
                input.set_bytes(FlowTableContext::command_offset(), ctx.as_bytes());
            },
            |out| out.get_bits(0x08, 23, 0),
        )?;
        trace!("created {kind:?} flow table {id}");
        Ok(FlowTable { id, kind })
    }

    pub fn destroy_flow_table(&mut self, table: FlowTable) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::DestroyFlowTable,
            0,
            0x40,
            0x08,
            |input| {
                input.set_bits(0x10, 31, 24, table.kind as u32);
                input.set_bits(0x14, 23, 0, table.id);
            },
            |_| (),
        )
    }

    /// Creates the wildcard flow group covering `[start_index, end_index]`:
    /// no match criteria, so every packet belongs.
    pub fn create_flow_group_wildcard(
        &mut self,
        table: FlowTable,
        start_index: u32,
        end_index: u32,
    ) -> Result<u32, Error> {
        let input_ctx = FlowGroupInput::init(table, start_index, end_index, MatchCriteriaEnable::None);
        self.cmd(
            CommandOpcode::CreateFlowGroup,
            0,
            0x400,
            0x10,
            |input| input.set_bytes(FlowGroupInput::command_offset(), input_ctx.as_bytes()),
            |out| out.get_bits(0x08, 23, 0),
        )
    }

    /// Points flow `index` of the wildcard group at a TIR with FWD_DST.
    pub fn set_flow_table_entry_wildcard(
        &mut self,
        table: FlowTable,
        group_id: u32,
        index: u32,
        tir: Tir,
    ) -> Result<(), Error> {
        let entry = FlowEntryInput::init(table, index);
        let ctx = FlowContext::init(group_id, FlowContextAction::FwdDest, 1);
        let dest = DestinationEntry::init(DestinationType::Tir, tir.0);
        self.cmd(
            CommandOpcode::SetFlowTableEntry,
            0,
            0x70,
            0x08,
            |input| {
                input.set_bytes(FlowEntryInput::command_offset(), entry.as_bytes());
                input.set_bytes(FlowContext::command_offset(), ctx.as_bytes());
                input.set_bytes(DestinationEntry::command_offset(), dest.as_bytes());
            },
            |_| (),
        )
    }

    /// Makes `table` the root of its type's steering tree.
    pub fn set_flow_table_root(&mut self, table: FlowTable) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::SetFlowTableRoot,
            0,
            0x40,
            0x08,
            |input| {
                input.set_bits(0x10, 31, 24, table.kind as u32);
                input.set_bits(0x14, 23, 0, table.id);
            },
            |_| (),
        )
    }

    /// PAOS write: sets the port administrative status (1 = up, 2 = down)
    /// with the admin-state-event bit set.
    pub fn set_port_status(&mut self, up: bool) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::AccessRegister,
            ACCESS_REGISTER_WRITE,
            0x1C,
            0x1C,
            |input| {
                input.set_bits(0x08, 15, 0, REGISTER_PAOS);
                input.set_bits(0x0C, 23, 16, 1); // local port
                input.set_bits(0x0C, 11, 8, if up { 1 } else { 2 });
                input.set_bits(0x10, 31, 31, 1); // ase
            },
            |_| (),
        )
    }

    /// PAOS read: administrative and operational port status.
    pub fn port_status(&mut self) -> Result<PortStatus, Error> {
        self.cmd(
            CommandOpcode::AccessRegister,
            ACCESS_REGISTER_READ,
            0x1C,
            0x1C,
            |input| {
                input.set_bits(0x08, 15, 0, REGISTER_PAOS);
                input.set_bits(0x0C, 23, 16, 1);
            },
            |out| PortStatus {
                admin_status: out.get_bits(0x0C, 11, 8) as u8,
                oper_status: out.get_bits(0x10, 11, 8) as u8,
            },
        )
    }

    /// PPLR read: the loopback modes the port supports.
    pub fn loopback_capability(&mut self) -> Result<u8, Error> {
        self.cmd(
            CommandOpcode::AccessRegister,
            ACCESS_REGISTER_READ,
            0x18,
            0x18,
            |input| {
                input.set_bits(0x08, 15, 0, REGISTER_PPLR);
                input.set_bits(0x0C, 23, 16, 1);
            },
            |out| out.get_bits(0x10, 15, 8) as u8,
        )
    }

    /// PPLR write: enables or disables physical local loopback.
    pub fn set_loopback_mode(&mut self, enabled: bool) -> Result<(), Error> {
        self.cmd(
            CommandOpcode::AccessRegister,
            ACCESS_REGISTER_WRITE,
            0x18,
            0x18,
            |input| {
                input.set_bits(0x08, 15, 0, REGISTER_PPLR);
                input.set_bits(0x0C, 23, 16, 1);
                input.set_bits(0x10, 7, 0, enabled as u32);
            },
            |_| (),
        )
    }

    pub fn query_vport_state(&mut self) -> Result<VportState, Error> {
        self.cmd(
            CommandOpcode::QueryVportState,
            0,
            0x0C,
            0x10,
            |_| (),
            |out| VportState {
                admin_state: out.get_bits(0x0C, 7, 4) as u8,
                oper_state: out.get_bits(0x0C, 3, 0) as u8,
            },
        )
    }

    /// Permanent MAC address from the NIC vport context.
    pub fn query_vport_mac(&mut self) -> Result<[u8; 6], Error> {
        self.cmd(
            CommandOpcode::QueryNicVportContext,
            0,
            0x10,
            0x118,
            |_| (),
            |out| {
                let hi = out.get_u32(0x104);
                let lo = out.get_u32(0x108);
                [
                    (hi >> 8) as u8,
                    hi as u8,
                    (lo >> 24) as u8,
                    (lo >> 16) as u8,
                    (lo >> 8) as u8,
                    lo as u8,
                ]
            },
        )
    }
}
