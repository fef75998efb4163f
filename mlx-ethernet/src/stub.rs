//! A software HCA.
//!
//! Executes command entries from host memory exactly as the firmware contract
//! describes: it validates the transport fields, walks mailbox chains by
//! physical pointer, keeps object tables, enforces the work-queue state
//! machine and capability maxima, and delivers completions with the
//! phase-correct owner bit. Physical addresses are process virtual addresses
//! (see [`HeapDma`](crate::dma::HeapDma)), so the model chases DMA pointers by
//! dereferencing them.
//!
//! Driven from the command interface's polling loop via [`StubClock`], it
//! lets the whole bring-up and datapath run with no hardware, while tests
//! record opcode traces and raw command images for byte-exact checks.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use log::trace;

use crate::bits;
use crate::capabilities::{self, CapField, HcaCapabilities, CAP_BASE};
use crate::command_queue::{Clock, CommandDeliveryStatus, CommandReturnStatus};

const BAR_SIZE: usize = 0x10000;

// Logical-buffer dword helpers (big-endian, bit 31 = MSB).
fn get_dw(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

fn set_dw(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
}

fn get_field(buf: &[u8], off: usize, hi: u32, lo: u32) -> u32 {
    bits::get_bits(get_dw(buf, off), hi, lo)
}

fn set_field(buf: &mut [u8], off: usize, hi: u32, lo: u32, value: u32) {
    set_dw(buf, off, bits::set_bits(get_dw(buf, off), hi, lo, value));
}

fn get_qw(buf: &[u8], off: usize) -> u64 {
    ((get_dw(buf, off) as u64) << 32) | get_dw(buf, off + 4) as u64
}

/// Raw bytes of one executed command, for byte-exact golden checks.
pub struct CommandImage {
    pub opcode: u16,
    pub opmod: u16,
    pub entry: Vec<u8>,
    pub input_mailboxes: Vec<Vec<u8>>,
}

struct StubEq {
    ring: u64,
    log_size: u8,
    /// Producer counter for injected events.
    pc: u32,
}

struct StubCq {
    ring: u64,
    log_size: u8,
    #[allow(dead_code)]
    dbr: u64,
    /// Producer counter for delivered completions.
    pc: u32,
}

struct StubWq {
    wq_base: u64,
    size: u32,
    dbr: u64,
    cqn: u32,
    state: u32,
    /// Consumer counter: WQEs the device has used.
    cc: u32,
}

#[allow(dead_code)]
struct FlowEntry {
    table_id: u32,
    group_id: u32,
    index: u32,
    tirn: u32,
}

/// The software device. One instance models one NIC behind one BAR.
pub struct StubHca {
    bar: *mut u8,
    caps: HcaCapabilities,
    rlkey: u32,
    mac: [u8; 6],
    boot_pages: i32,
    init_pages: i32,
    regular_pages: i32,

    trace: Vec<(u16, u16)>,
    images: Vec<CommandImage>,
    /// When set, the device is wedged: the syndrome is visible in the
    /// initialization segment and no further commands complete.
    health_failure: Option<u8>,

    next_id: u32,
    enabled: bool,
    issi: u16,
    pages: Vec<u64>,
    eqs: HashMap<u8, StubEq>,
    cqs: HashMap<u32, StubCq>,
    sqs: HashMap<u32, StubWq>,
    rqs: HashMap<u32, StubWq>,
    tirs: HashMap<u32, u32>,
    tises: Vec<u32>,
    pds: Vec<u32>,
    tds: Vec<u32>,
    uars: Vec<u32>,
    flow_tables: HashMap<u32, u8>,
    flow_groups: HashMap<u32, u32>,
    flow_entries: Vec<FlowEntry>,
    flow_root: Option<u32>,
    port_admin_status: u8,
    loopback_enabled: bool,
    torn_down: bool,
}

impl StubHca {
    pub fn new() -> StubHca {
        let layout = Layout::from_size_align(BAR_SIZE, 4096).unwrap();
        let bar = unsafe { alloc_zeroed(layout) };
        assert!(!bar.is_null());
        let stub = StubHca {
            bar,
            caps: default_caps(),
            rlkey: 0x100,
            mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            boot_pages: 8,
            init_pages: 8,
            regular_pages: 8,
            trace: Vec::new(),
            images: Vec::new(),
            health_failure: None,
            next_id: 1,
            enabled: false,
            issi: 0,
            pages: Vec::new(),
            eqs: HashMap::new(),
            cqs: HashMap::new(),
            sqs: HashMap::new(),
            rqs: HashMap::new(),
            tirs: HashMap::new(),
            tises: Vec::new(),
            pds: Vec::new(),
            tds: Vec::new(),
            uars: Vec::new(),
            flow_tables: HashMap::new(),
            flow_groups: HashMap::new(),
            flow_entries: Vec::new(),
            flow_root: None,
            port_admin_status: 2,
            loopback_enabled: false,
            torn_down: false,
        };
        // firmware revision 16.26.1040, command interface rev 5
        stub.bar_wr(0x00, (26 << 16) | 16);
        stub.bar_wr(0x04, (5 << 16) | 1040);
        // 8 command entries of 64 bytes
        stub.bar_wr(0x14, (3 << 4) | 6);
        // still initializing until the command queue address is latched
        stub.bar_wr(0x1FC, 0x8000_0000);
        stub
    }

    pub fn shared() -> Rc<RefCell<StubHca>> {
        Rc::new(RefCell::new(StubHca::new()))
    }

    pub fn bar_ptr(&mut self) -> *mut u8 {
        self.bar
    }

    fn bar_rd(&self, off: usize) -> u32 {
        unsafe { bits::get_u32(self.bar, off) }
    }

    fn bar_wr(&self, off: usize, value: u32) {
        unsafe { bits::put_u32(self.bar, off, value) }
    }

    fn mem_rd(&self, phys: u64, off: usize) -> u32 {
        unsafe { bits::get_u32(phys as *const u8, off) }
    }

    fn mem_wr(&self, phys: u64, off: usize, value: u32) {
        unsafe { bits::put_u32(phys as *mut u8, off, value) }
    }

    fn mem_rd64(&self, phys: u64, off: usize) -> u64 {
        ((self.mem_rd(phys, off) as u64) << 32) | self.mem_rd(phys, off + 4) as u64
    }

    fn mem_copy_from(&self, phys: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        unsafe { core::ptr::copy_nonoverlapping(phys as *const u8, out.as_mut_ptr(), len) };
        out
    }

    fn mem_copy_to(&self, phys: u64, data: &[u8]) {
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), phys as *mut u8, data.len()) };
    }

    /// Opcode/opmod pairs of every executed command, in order.
    pub fn trace(&self) -> &[(u16, u16)] {
        &self.trace
    }

    pub fn images(&self) -> &[CommandImage] {
        &self.images
    }

    /// Simulates a fatal device error: the health syndrome appears in the
    /// initialization segment and command processing stops.
    pub fn set_health_syndrome(&mut self, code: u8) {
        self.health_failure = Some(code);
        self.bar_wr(0x1010, (code as u32) << 24);
    }

    pub fn set_caps(&mut self, caps: HcaCapabilities) {
        self.caps = caps;
    }

    pub fn set_page_counts(&mut self, boot: i32, init: i32, regular: i32) {
        self.boot_pages = boot;
        self.init_pages = init;
        self.regular_pages = regular;
    }

    pub fn num_eqs(&self) -> usize {
        self.eqs.len()
    }

    pub fn num_cqs(&self) -> usize {
        self.cqs.len()
    }

    pub fn num_sqs(&self) -> usize {
        self.sqs.len()
    }

    pub fn num_rqs(&self) -> usize {
        self.rqs.len()
    }

    pub fn num_tirs(&self) -> usize {
        self.tirs.len()
    }

    pub fn num_tises(&self) -> usize {
        self.tises.len()
    }

    pub fn num_flow_tables(&self) -> usize {
        self.flow_tables.len()
    }

    pub fn num_flow_entries(&self) -> usize {
        self.flow_entries.len()
    }

    pub fn flow_root(&self) -> Option<u32> {
        self.flow_root
    }

    pub fn pages_received(&self) -> usize {
        self.pages.len()
    }

    pub fn port_admin_status(&self) -> u8 {
        self.port_admin_status
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn sq_state(&self, sqn: u32) -> Option<u32> {
        self.sqs.get(&sqn).map(|wq| wq.state)
    }

    pub fn rq_state(&self, rqn: u32) -> Option<u32> {
        self.rqs.get(&rqn).map(|wq| wq.state)
    }

    /// One scheduling step of the device: latch the command queue address and
    /// execute the entry if software posted one.
    pub fn process(&mut self) {
        if self.health_failure.is_some() {
            return;
        }
        let cmdq = ((self.bar_rd(0x10) as u64) << 32) | self.bar_rd(0x14) as u64;
        if cmdq == 0 {
            return;
        }
        // address latched: firmware initialization finishes
        self.bar_wr(0x1FC, 0);
        if self.mem_rd(cmdq, 0x3C) & 0x1 == 0x1 {
            self.exec_entry(cmdq);
        }
    }

    fn finish(&self, cmdq: u64, token: u8, delivery: CommandDeliveryStatus) {
        let ctrl = ((token as u32) << 24) | ((delivery as u32) << 1);
        self.mem_wr(cmdq, 0x3C, ctrl);
    }

    /// Walks a mailbox chain validating tokens and block numbers, returning
    /// the page addresses.
    fn walk_chain(
        &self,
        first: u64,
        n: usize,
        token: u8,
    ) -> Result<Vec<u64>, CommandDeliveryStatus> {
        let mut pages = Vec::with_capacity(n);
        let mut ptr = first;
        for i in 0..n {
            if ptr == 0 {
                return Err(CommandDeliveryStatus::BadInputPointer);
            }
            if self.mem_rd(ptr, 0x238) != i as u32 {
                return Err(CommandDeliveryStatus::BadBlockNumber);
            }
            if bits::get_bits(self.mem_rd(ptr, 0x23C), 23, 16) as u8 != token {
                return Err(CommandDeliveryStatus::TokenErr);
            }
            pages.push(ptr);
            ptr = self.mem_rd64(ptr, 0x230);
        }
        Ok(pages)
    }

    fn exec_entry(&mut self, cmdq: u64) {
        let token = bits::get_bits(self.mem_rd(cmdq, 0x3C), 31, 24) as u8;
        if bits::get_bits(self.mem_rd(cmdq, 0x00), 31, 24) != 0x7 {
            self.finish(cmdq, token, CommandDeliveryStatus::BadCommandType);
            return;
        }
        let in_len = self.mem_rd(cmdq, 0x04) as usize;
        let out_len = self.mem_rd(cmdq, 0x38) as usize;
        let n_in = in_len.saturating_sub(16).div_ceil(0x200);
        let n_out = out_len.saturating_sub(16).div_ceil(0x200);

        let in_pages = match self.walk_chain(self.mem_rd64(cmdq, 0x08), n_in, token) {
            Ok(pages) => pages,
            Err(status) => {
                self.finish(cmdq, token, status);
                return;
            }
        };
        let out_pages = match self.walk_chain(self.mem_rd64(cmdq, 0x30), n_out, token) {
            Ok(pages) => pages,
            Err(status) => {
                let status = if status == CommandDeliveryStatus::BadInputPointer {
                    CommandDeliveryStatus::BadOutputPointer
                } else {
                    status
                };
                self.finish(cmdq, token, status);
                return;
            }
        };

        // assemble the logical input: inline window then mailbox data
        let mut input = vec![0u8; in_len.max(16)];
        input[..16].copy_from_slice(&self.mem_copy_from(cmdq + 0x10, 16));
        for (i, page) in in_pages.iter().enumerate() {
            let start = 16 + i * 0x200;
            let len = (input.len() - start).min(0x200);
            input[start..start + len].copy_from_slice(&self.mem_copy_from(*page, len));
        }

        let opcode = (get_dw(&input, 0x00) >> 16) as u16;
        let opmod = get_dw(&input, 0x04) as u16;
        self.trace.push((opcode, opmod));
        self.images.push(CommandImage {
            opcode,
            opmod,
            entry: self.mem_copy_from(cmdq, 64),
            input_mailboxes: in_pages.iter().map(|p| self.mem_copy_from(*p, 0x240)).collect(),
        });
        trace!("stub executing {opcode:#05x} opmod {opmod}");

        let mut output = vec![0u8; out_len.max(16)];
        self.dispatch(opcode, opmod, &input, &mut output);

        // scatter the logical output: inline window then mailbox data
        self.mem_copy_to(cmdq + 0x20, &output[..16]);
        for (i, page) in out_pages.iter().enumerate() {
            let start = 16 + i * 0x200;
            let len = (output.len() - start).min(0x200);
            self.mem_copy_to(*page, &output[start..start + len]);
        }
        self.finish(cmdq, token, CommandDeliveryStatus::Success);
    }

    fn fail(output: &mut [u8], status: CommandReturnStatus, syndrome: u32) {
        set_field(output, 0x00, 31, 24, status as u32);
        set_dw(output, 0x04, syndrome);
    }

    fn next(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn dispatch(&mut self, opcode: u16, opmod: u16, input: &[u8], output: &mut [u8]) {
        if !self.enabled && opcode != 0x104 {
            return Self::fail(output, CommandReturnStatus::BadSysState, opcode as u32);
        }
        match opcode {
            0x104 => self.enabled = true,
            0x105 => self.enabled = false,
            0x10A => {
                set_field(output, 0x08, 15, 0, self.issi as u32);
                set_dw(output, 0x20, 0x2); // version 1 supported
            }
            0x10B => self.issi = get_field(input, 0x08, 15, 0) as u16,
            0x107 => {
                let num = match opmod {
                    1 => self.boot_pages,
                    2 => self.init_pages,
                    3 => self.regular_pages,
                    _ => return Self::fail(output, CommandReturnStatus::BadParam, 0x107),
                };
                set_dw(output, 0x0C, num as u32);
            }
            0x108 => {
                if opmod != 1 {
                    return Self::fail(output, CommandReturnStatus::BadParam, 0x108);
                }
                let n = get_dw(input, 0x0C) as usize;
                if input.len() != 0x10 + n * 8 {
                    return Self::fail(output, CommandReturnStatus::BadInputLen, 0x108);
                }
                for i in 0..n {
                    let addr = get_qw(input, 0x10 + i * 8);
                    if addr & 0xFFF != 0 {
                        return Self::fail(output, CommandReturnStatus::BadParam, addr as u32);
                    }
                    self.pages.push(addr);
                }
            }
            0x100 => self.encode_caps(output),
            0x102 => {}
            0x103 => self.torn_down = true,
            0x203 => set_dw(output, 0x0C, self.rlkey),
            0x802 => {
                let uar = self.next();
                assert!(((uar + 1) as usize) * 4096 <= BAR_SIZE, "stub BAR exhausted");
                self.uars.push(uar);
                set_field(output, 0x08, 23, 0, uar);
            }
            0x803 => {
                let uar = get_field(input, 0x08, 23, 0);
                if !self.uars.contains(&uar) {
                    return Self::fail(output, CommandReturnStatus::BadResource, uar);
                }
                self.uars.retain(|&u| u != uar);
            }
            0x800 => {
                let pd = self.next();
                self.pds.push(pd);
                set_field(output, 0x08, 23, 0, pd);
            }
            0x801 => {
                let pd = get_field(input, 0x08, 23, 0);
                self.pds.retain(|&p| p != pd);
            }
            0x816 => {
                let td = self.next();
                self.tds.push(td);
                set_field(output, 0x08, 23, 0, td);
            }
            0x817 => {
                let td = get_field(input, 0x08, 23, 0);
                self.tds.retain(|&t| t != td);
            }
            0x301 => self.create_eq(input, output),
            0x302 => {
                let eqn = get_field(input, 0x08, 7, 0) as u8;
                if self.eqs.remove(&eqn).is_none() {
                    return Self::fail(output, CommandReturnStatus::BadResource, eqn as u32);
                }
            }
            0x400 => self.create_cq(input, output),
            0x401 => {
                let cqn = get_field(input, 0x08, 23, 0);
                if self.cqs.remove(&cqn).is_none() {
                    return Self::fail(output, CommandReturnStatus::BadResource, cqn);
                }
            }
            0x912 => {
                let td = get_field(input, 0x44, 23, 0);
                if !self.tds.contains(&td) {
                    return Self::fail(output, CommandReturnStatus::BadResource, td);
                }
                let tisn = self.next();
                self.tises.push(tisn);
                set_field(output, 0x08, 23, 0, tisn);
            }
            0x914 => {
                let tisn = get_field(input, 0x08, 23, 0);
                self.tises.retain(|&t| t != tisn);
            }
            0x900 => {
                let rqn = get_field(input, 0x3C, 23, 0);
                if !self.rqs.contains_key(&rqn) {
                    return Self::fail(output, CommandReturnStatus::BadResource, rqn);
                }
                let tirn = self.next();
                self.tirs.insert(tirn, rqn);
                set_field(output, 0x08, 23, 0, tirn);
            }
            0x902 => {
                let tirn = get_field(input, 0x08, 23, 0);
                if self.tirs.remove(&tirn).is_none() {
                    return Self::fail(output, CommandReturnStatus::BadResource, tirn);
                }
            }
            0x904 => self.create_wq(input, output, true),
            0x908 => self.create_wq(input, output, false),
            0x906 => {
                let sqn = get_field(input, 0x08, 23, 0);
                if self.sqs.remove(&sqn).is_none() {
                    return Self::fail(output, CommandReturnStatus::BadResource, sqn);
                }
            }
            0x90A => {
                let rqn = get_field(input, 0x08, 23, 0);
                if self.rqs.remove(&rqn).is_none() {
                    return Self::fail(output, CommandReturnStatus::BadResource, rqn);
                }
            }
            0x905 => self.modify_wq(input, output, true),
            0x909 => self.modify_wq(input, output, false),
            0x930 => {
                let kind = get_field(input, 0x10, 31, 24) as u8;
                let log_size = get_field(input, 0x18, 7, 0);
                if log_size > 24 {
                    return Self::fail(output, CommandReturnStatus::BadSize, log_size);
                }
                let id = self.next();
                self.flow_tables.insert(id, kind);
                set_field(output, 0x08, 23, 0, id);
            }
            0x931 => {
                let id = get_field(input, 0x14, 23, 0);
                if self.flow_tables.remove(&id).is_none() {
                    return Self::fail(output, CommandReturnStatus::BadResource, id);
                }
                if self.flow_root == Some(id) {
                    self.flow_root = None;
                }
                self.flow_entries.retain(|e| e.table_id != id);
            }
            0x933 => {
                let table_id = get_field(input, 0x14, 23, 0);
                if !self.flow_tables.contains_key(&table_id) {
                    return Self::fail(output, CommandReturnStatus::BadResource, table_id);
                }
                let id = self.next();
                self.flow_groups.insert(id, table_id);
                set_field(output, 0x08, 23, 0, id);
            }
            0x936 => {
                let table_id = get_field(input, 0x14, 23, 0);
                let index = get_dw(input, 0x20);
                let group_id = get_dw(input, 0x44);
                let action = get_dw(input, 0x4C);
                let dest_type = get_field(input, 0x68, 31, 24);
                let tirn = get_field(input, 0x68, 23, 0);
                if !self.flow_tables.contains_key(&table_id)
                    || self.flow_groups.get(&group_id) != Some(&table_id)
                {
                    return Self::fail(output, CommandReturnStatus::BadResource, table_id);
                }
                if action != 1 << 2 || dest_type != 0x2 || !self.tirs.contains_key(&tirn) {
                    return Self::fail(output, CommandReturnStatus::BadParam, action);
                }
                self.flow_entries.push(FlowEntry { table_id, group_id, index, tirn });
            }
            0x92F => {
                let id = get_field(input, 0x14, 23, 0);
                if !self.flow_tables.contains_key(&id) {
                    return Self::fail(output, CommandReturnStatus::BadResource, id);
                }
                self.flow_root = Some(id);
            }
            0x805 => self.access_register(opmod, input, output),
            0x751 => {
                let state = if self.port_admin_status == 1 { 1 } else { 0 };
                set_field(output, 0x0C, 7, 4, state);
                set_field(output, 0x0C, 3, 0, state);
            }
            0x754 => {
                set_field(output, 0x104, 15, 0, ((self.mac[0] as u32) << 8) | self.mac[1] as u32);
                set_dw(
                    output,
                    0x108,
                    u32::from_be_bytes(self.mac[2..6].try_into().unwrap()),
                );
            }
            _ => Self::fail(output, CommandReturnStatus::BadOp, opcode as u32),
        }
    }

    fn encode_caps(&self, output: &mut [u8]) {
        let caps = &self.caps;
        let mut put = |f: CapField, v: u32| set_field(output, CAP_BASE + f.offset, f.hi, f.lo, v);
        put(capabilities::LOG_MAX_QP_SZ, caps.log_max_qp_sz as u32);
        put(capabilities::LOG_MAX_QP, caps.log_max_qp as u32);
        put(capabilities::LOG_MAX_CQ_SZ, caps.log_max_cq_sz as u32);
        put(capabilities::LOG_MAX_CQ, caps.log_max_cq as u32);
        put(capabilities::LOG_MAX_EQ_SZ, caps.log_max_eq_sz as u32);
        put(capabilities::LOG_MAX_MKEY, caps.log_max_mkey as u32);
        put(capabilities::LOG_MAX_EQ, caps.log_max_eq as u32);
        put(capabilities::PORT_TYPE, caps.port_type as u32);
        put(capabilities::NUM_PORTS, caps.num_ports as u32);
        put(capabilities::LOG_MAX_MSG, caps.log_max_msg as u32);
        put(capabilities::MAX_TC, caps.max_tc as u32);
        put(capabilities::CQE_VERSION, caps.cqe_version as u32);
        put(capabilities::CMDIF_CHECKSUM, caps.cmdif_checksum as u32);
        put(capabilities::WQ_SIGNATURE, caps.wq_signature as u32);
        put(capabilities::ETH_NET_OFFLOADS, caps.eth_net_offloads as u32);
        put(capabilities::VPORT_GROUP_MANAGER, caps.vport_group_manager as u32);
        put(capabilities::NIC_FLOW_TABLE, caps.nic_flow_table as u32);
        put(capabilities::LOG_MAX_PD, caps.log_max_pd as u32);
        put(capabilities::LOG_MAX_RQ, caps.log_max_rq as u32);
        put(capabilities::LOG_MAX_SQ, caps.log_max_sq as u32);
        put(capabilities::LOG_MAX_TIR, caps.log_max_tir as u32);
        put(capabilities::LOG_MAX_TIS, caps.log_max_tis as u32);
        put(capabilities::LOG_MAX_TRANSPORT_DOMAIN, caps.log_max_transport_domain as u32);
        put(capabilities::LOG_MAX_WQ_SZ, caps.log_max_wq_sz as u32);
    }

    fn create_eq(&mut self, input: &[u8], output: &mut [u8]) {
        let uar = get_field(input, 0x1C, 23, 0);
        if !self.uars.contains(&uar) {
            return Self::fail(output, CommandReturnStatus::BadResource, uar);
        }
        let log_size = get_field(input, 0x1C, 28, 24) as u8;
        let bitmask = get_qw(input, 0x58);
        if bitmask != 1 << 0x0B {
            return Self::fail(output, CommandReturnStatus::BadParam, bitmask as u32);
        }
        let ring = get_qw(input, 0x110);
        let eqn = self.next() as u8;
        self.eqs.insert(eqn, StubEq { ring, log_size, pc: 0 });
        set_field(output, 0x08, 7, 0, eqn as u32);
    }

    fn create_cq(&mut self, input: &[u8], output: &mut [u8]) {
        let log_size = get_field(input, 0x1C, 28, 24) as u8;
        if log_size > self.caps.log_max_cq_sz {
            return Self::fail(output, CommandReturnStatus::ExceedLim, log_size as u32);
        }
        let eqn = get_field(input, 0x24, 7, 0) as u8;
        if !self.eqs.contains_key(&eqn) {
            return Self::fail(output, CommandReturnStatus::BadResource, eqn as u32);
        }
        let dbr = get_qw(input, 0x48);
        let ring = get_qw(input, 0x110);
        let cqn = self.next();
        self.cqs.insert(cqn, StubCq { ring, log_size, dbr, pc: 0 });
        set_field(output, 0x08, 23, 0, cqn);
    }

    fn create_wq(&mut self, input: &[u8], output: &mut [u8], send: bool) {
        let cqn = get_field(input, 0x28, 23, 0);
        if !self.cqs.contains_key(&cqn) {
            return Self::fail(output, CommandReturnStatus::BadResource, cqn);
        }
        let pd = get_field(input, 0x58, 23, 0);
        if !self.pds.contains(&pd) {
            return Self::fail(output, CommandReturnStatus::BadResource, pd);
        }
        let stride = get_field(input, 0x70, 19, 16);
        let log_wq_size = get_field(input, 0x70, 4, 0) as u8;
        let expected_stride = if send { 6 } else { 4 };
        if stride != expected_stride {
            return Self::fail(output, CommandReturnStatus::BadParam, stride);
        }
        let limit = if send { self.caps.log_max_sq } else { self.caps.log_max_rq };
        if log_wq_size > limit {
            return Self::fail(output, CommandReturnStatus::ExceedLim, log_wq_size as u32);
        }
        let dbr = get_qw(input, 0x60);
        let wq_base = get_qw(input, 0x110);
        let n = self.next();
        let wq = StubWq {
            wq_base,
            size: 1 << log_wq_size,
            dbr,
            cqn,
            state: 0,
            cc: 0,
        };
        if send {
            self.sqs.insert(n, wq);
        } else {
            self.rqs.insert(n, wq);
        }
        set_field(output, 0x08, 23, 0, n);
    }

    fn modify_wq(&mut self, input: &[u8], output: &mut [u8], send: bool) {
        let curr = get_field(input, 0x08, 31, 28);
        let n = get_field(input, 0x08, 23, 0);
        let next = get_field(input, 0x20, 23, 20);
        let wq = if send { self.sqs.get_mut(&n) } else { self.rqs.get_mut(&n) };
        let Some(wq) = wq else {
            return Self::fail(output, CommandReturnStatus::BadResource, n);
        };
        let legal = matches!((curr, next), (0, 1) | (1, 3) | (3, 0));
        if wq.state != curr || !legal {
            return Self::fail(output, CommandReturnStatus::BadResState, (curr << 4) | next);
        }
        wq.state = next;
    }

    fn access_register(&mut self, opmod: u16, input: &[u8], output: &mut [u8]) {
        let register = get_field(input, 0x08, 15, 0);
        match (register, opmod) {
            (0x5006, 0) => {
                // PAOS write requires the admin-state-event bit
                if get_field(input, 0x10, 31, 31) == 0 {
                    return Self::fail(output, CommandReturnStatus::BadParam, register);
                }
                self.port_admin_status = get_field(input, 0x0C, 11, 8) as u8;
            }
            (0x5006, 1) => {
                set_field(output, 0x0C, 11, 8, self.port_admin_status as u32);
                let oper = if self.port_admin_status == 1 { 1 } else { 2 };
                set_field(output, 0x10, 11, 8, oper);
            }
            (0x5018, 0) => {
                self.loopback_enabled = get_field(input, 0x10, 7, 0) != 0;
            }
            (0x5018, 1) => {
                set_field(output, 0x10, 15, 8, 0x1);
                set_field(output, 0x10, 7, 0, self.loopback_enabled as u32);
            }
            _ => Self::fail(output, CommandReturnStatus::BadParam, register),
        }
    }

    /// Delivers one received frame into the oldest posted RX buffer of `rqn`,
    /// copying the payload and publishing a phase-correct CQE. Returns the
    /// physical address of the buffer consumed, or None when the queue is not
    /// ready or has nothing posted.
    pub fn deliver_rx(&mut self, rqn: u32, frame: &[u8]) -> Option<u64> {
        let (wq_base, size, dbr, cqn, state, cc) = {
            let rq = self.rqs.get(&rqn)?;
            (rq.wq_base, rq.size, rq.dbr, rq.cqn, rq.state, rq.cc)
        };
        if state != 1 {
            return None;
        }
        let posted = self.mem_rd(dbr, 0) & 0xFFFF;
        if posted == cc & 0xFFFF {
            return None;
        }
        let slot = cc & (size - 1);
        let wqe = wq_base + (slot as u64) * 16;
        let capacity = self.mem_rd(wqe, 0) as usize;
        let addr = self.mem_rd64(wqe, 8);
        let len = frame.len().min(capacity);
        self.mem_copy_to(addr, &frame[..len]);
        self.rqs.get_mut(&rqn).unwrap().cc = cc.wrapping_add(1);
        self.complete(cqn, cc as u16, len as u32, 0x2); // responder-send opcode
        Some(addr)
    }

    /// Writes one CQE with the phase-correct owner bit.
    fn complete(&mut self, cqn: u32, wqe_counter: u16, byte_count: u32, opcode: u32) {
        let (ring, log_size, pc) = {
            let cq = self.cqs.get(&cqn).expect("wq without cq");
            (cq.ring, cq.log_size, cq.pc)
        };
        let cqe = ring + ((pc & ((1 << log_size) - 1)) as u64) * 64;
        let owner = (pc >> log_size) & 0x1;
        self.mem_wr(cqe, 0x2C, byte_count);
        self.mem_wr(cqe, 0x3C, ((wqe_counter as u32) << 16) | (opcode << 4) | owner);
        self.cqs.get_mut(&cqn).unwrap().pc = pc.wrapping_add(1);
    }

    /// Consumes WQEs the driver has published on `sqn`, reassembling each
    /// frame (inline header plus pointed payload) and completing it.
    pub fn pump_tx(&mut self, sqn: u32) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        loop {
            let (wq_base, size, dbr, cqn, state, cc) = match self.sqs.get(&sqn) {
                Some(sq) => (sq.wq_base, sq.size, sq.dbr, sq.cqn, sq.state, sq.cc),
                None => return frames,
            };
            if state != 1 {
                return frames;
            }
            let posted = self.mem_rd(dbr, 4) & 0xFFFF;
            if posted == cc & 0xFFFF {
                return frames;
            }
            let slot = cc & (size - 1);
            let wqe = wq_base + (slot as u64) * 64;
            let inline_len = bits::get_bits(self.mem_rd(wqe, 0x1C), 31, 16) as usize;
            let mut frame = self.mem_copy_from(wqe + 0x1E, inline_len);
            let byte_count = self.mem_rd(wqe, 0x30) as usize;
            let addr = self.mem_rd64(wqe, 0x38);
            frame.extend_from_slice(&self.mem_copy_from(addr, byte_count));
            self.sqs.get_mut(&sqn).unwrap().cc = cc.wrapping_add(1);
            self.complete(cqn, cc as u16, frame.len() as u32, 0x0); // requester opcode
            frames.push(frame);
        }
    }

    /// Publishes an asynchronous event on `eqn`.
    pub fn inject_event(&mut self, eqn: u8, event_type: u8, data0: u32, data1: u32) -> bool {
        let (ring, log_size, pc) = match self.eqs.get(&eqn) {
            Some(eq) => (eq.ring, eq.log_size, eq.pc),
            None => return false,
        };
        let eqe = ring + ((pc & ((1 << log_size) - 1)) as u64) * 64;
        self.mem_wr(eqe, 0x00, (event_type as u32) << 16);
        self.mem_wr(eqe, 0x20, data0);
        self.mem_wr(eqe, 0x24, data1);
        self.mem_wr(eqe, 0x3C, 0);
        self.eqs.get_mut(&eqn).unwrap().pc = pc.wrapping_add(1);
        true
    }
}

impl Drop for StubHca {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(BAR_SIZE, 4096).unwrap();
        unsafe { dealloc(self.bar, layout) };
    }
}

impl Default for StubHca {
    fn default() -> Self {
        StubHca::new()
    }
}

fn default_caps() -> HcaCapabilities {
    HcaCapabilities {
        log_max_qp_sz: 15,
        log_max_qp: 18,
        log_max_cq_sz: 22,
        log_max_cq: 24,
        log_max_eq_sz: 22,
        log_max_mkey: 24,
        log_max_eq: 7,
        port_type: 1,
        num_ports: 1,
        log_max_msg: 30,
        max_tc: 8,
        cqe_version: 1,
        cmdif_checksum: 0,
        wq_signature: false,
        eth_net_offloads: true,
        vport_group_manager: false,
        nic_flow_table: true,
        log_max_pd: 24,
        log_max_rq: 23,
        log_max_sq: 23,
        log_max_tir: 8,
        log_max_tis: 8,
        log_max_transport_domain: 16,
        log_max_wq_sz: 16,
    }
}

/// A [`Clock`] that advances the software device instead of sleeping. Every
/// polling pause in the command interface becomes one device scheduling step,
/// so command execution is deterministic and instant.
pub struct StubClock(pub Rc<RefCell<StubHca>>);

impl Clock for StubClock {
    fn sleep(&mut self, _duration: Duration) {
        self.0.borrow_mut().process();
    }
}
