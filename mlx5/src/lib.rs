//! A user-space driver app for Mellanox ConnectX-4/LX ethernet NICs.
//!
//! The driver takes the device away from the host kernel, maps BAR0, brings
//! the HCA up over its command interface (PRM Section 7.2: HCA Driver
//! Start-up), and then moves packets between the framework's links and one
//! send/receive queue pair. Everything runs on the framework's tick: `push`
//! and `pull` do bounded work and never block.

use std::rc::Rc;

use eui48::MacAddress;
use log::{debug, error, trace, warn};
use thiserror::Error as ThisError;

use mlx_ethernet::command_queue::{Clock, SystemClock};
use mlx_ethernet::completion_queue::CompletionQueue;
use mlx_ethernet::dma::{DmaRegion, SharedDma};
use mlx_ethernet::event_queue::{Event, EventQueue};
use mlx_ethernet::flow_table::{FlowTable, FlowTableType};
use mlx_ethernet::hca::{CapabilityMode, Hca, PageClass, Pd, TeardownMode, Tir, Tis, TransportDomain, Uar, WqState};
use mlx_ethernet::receive_queue::ReceiveQueue;
use mlx_ethernet::send_queue::{SendQueue, INLINE_HEADER_SIZE};
use mlx_ethernet::uar::{UarPage, UAR_PAGE_SIZE};

pub mod app;
pub mod dma;
pub mod link;
pub mod packet;
pub mod pci;

pub use app::App;
pub use link::{Link, SharedLink};
pub use packet::Packet;

/// Size of each posted receive/transmit buffer; covers any link packet.
const BUFFER_SIZE: usize = 2048;
/// log2 of the RX flow table size.
const FLOW_TABLE_LOG_SIZE: u8 = 4;
/// Completions reaped per pull.
const PULL_BUDGET: u32 = 128;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Hca(#[from] mlx_ethernet::Error),
    #[error("pci: {0}")]
    Pci(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PCI address of the device, e.g. `0000:01:00.0`. Required.
    pub pciaddress: String,
    /// Send queue entries; a power of two.
    pub sendq_size: u32,
    /// Receive queue entries; a power of two.
    pub recvq_size: u32,
    /// Station MAC. When absent the permanent address is queried from the
    /// NIC vport context on first use.
    pub mac: Option<MacAddress>,
    /// Query and check device capabilities during bring-up.
    pub query_capabilities: bool,
    /// Set the port administratively up after bring-up.
    pub admin_up: bool,
    /// Dump every command entry and mailbox page.
    pub hexdump: bool,
}

impl Config {
    pub fn new(pciaddress: impl Into<String>) -> Config {
        Config {
            pciaddress: pciaddress.into(),
            sendq_size: 1024,
            recvq_size: 1024,
            mac: None,
            query_capabilities: false,
            admin_up: false,
            hexdump: false,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.pciaddress.is_empty() {
            return Err(Error::InvalidConfig("pciaddress is required".into()));
        }
        for (name, size) in [("sendq_size", self.sendq_size), ("recvq_size", self.recvq_size)] {
            if !size.is_power_of_two() || size < 64 || size > 32768 {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be a power of two in 64..32768, got {size}"
                )));
            }
        }
        Ok(())
    }
}

/// The ConnectX NIC app: one send queue, one receive queue, one direct TIR
/// fed by a wildcard flow rule.
pub struct ConnectX {
    hca: Hca,
    uar: Uar,
    pd: Pd,
    td: TransportDomain,
    eq: Option<EventQueue>,
    cq_tx: Option<CompletionQueue>,
    cq_rx: Option<CompletionQueue>,
    sq: Option<SendQueue>,
    rq: Option<ReceiveQueue>,
    tir: Option<Tir>,
    tis: Option<Tis>,
    flow_table: Option<FlowTable>,
    /// WQE rings: first half RX, second half TX.
    _wqe_slab: Rc<DmaRegion>,
    _wq_doorbell: Rc<DmaRegion>,
    /// Packet buffers, one slot per ring entry.
    rx_pool: DmaRegion,
    tx_pool: DmaRegion,
    mac: Option<MacAddress>,
    /// Set on the hardware path; teardown resets the device through it.
    pciaddress: Option<String>,
    stopped: bool,
    /// Packets dropped because the output link was full or the frame was
    /// shorter than an Ethernet header.
    pub rxdrop: u64,
    pub txdrop: u64,
    pub input: Option<SharedLink>,
    pub output: Option<SharedLink>,
}

impl std::fmt::Debug for ConnectX {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectX")
            .field("mac", &self.mac)
            .field("pciaddress", &self.pciaddress)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl ConnectX {
    /// Brings up the device at `config.pciaddress`: takes it from the host
    /// kernel, resets it, and runs the full start-up sequence. On failure the
    /// device is reset so no half-initialized state lingers.
    pub fn new(config: &Config) -> Result<ConnectX, Error> {
        config.validate()?;
        if !pci::valid_address(&config.pciaddress) {
            return Err(Error::InvalidConfig(format!(
                "malformed pci address {:?}",
                config.pciaddress
            )));
        }
        let addr = &config.pciaddress;
        pci::unbind(addr)?;
        pci::reset(addr)?;
        pci::set_bus_master(addr, true)?;
        let bar = pci::Bar::map(addr, 0)?;
        let result = unsafe {
            ConnectX::with_device(config, bar.ptr(), dma::HugetlbDma::shared(), Box::new(SystemClock))
        };
        match result {
            Ok(mut nic) => {
                nic.pciaddress = Some(addr.clone());
                // the BAR mapping must outlive the driver; keep it by leaking
                // the handle, the device holds it until process exit
                std::mem::forget(bar);
                Ok(nic)
            }
            Err(e) => {
                error!("{addr}: bring-up failed: {e}");
                pci::try_reset(addr);
                Err(e)
            }
        }
    }

    /// Brings up a device whose BAR is already mapped at `bar`. This is the
    /// whole start-up sequence minus PCI plumbing; the software HCA enters
    /// here.
    ///
    /// # Safety
    /// `bar` must point to a mapping of the device's BAR0 that outlives the
    /// returned driver.
    pub unsafe fn with_device(
        config: &Config,
        bar: *mut u8,
        dma: SharedDma,
        clock: Box<dyn Clock>,
    ) -> Result<ConnectX, Error> {
        config.validate()?;
        let sendq_size = config.sendq_size;
        let recvq_size = config.recvq_size;

        let mut hca = Hca::new(bar, dma.clone(), clock, config.hexdump)?;
        hca.enable_hca()?;
        hca.set_issi(1)?;
        let boot = hca.query_pages(PageClass::Boot)?;
        hca.alloc_pages(boot)?;

        if config.query_capabilities {
            let caps = hca.query_hca_cap(CapabilityMode::Current)?;
            let log_sq = sendq_size.ilog2() as u8;
            let log_rq = recvq_size.ilog2() as u8;
            if !caps.supports_single_queue_bringup(log_sq, log_rq) {
                warn!("device capabilities look too small for the configured queues: {caps:?}");
            }
        }

        let init = hca.query_pages(PageClass::Init)?;
        hca.alloc_pages(init)?;
        hca.init_hca()?;
        let regular = hca.query_pages(PageClass::Regular)?;
        hca.alloc_pages(regular)?;

        let uar = hca.alloc_uar()?;
        let eq = hca.create_eq(uar)?;
        let pd = hca.alloc_pd()?;
        let td = hca.alloc_transport_domain()?;
        let rlkey = hca.query_special_contexts()?;

        let tis = hca.create_tis(0, td)?;
        let cq_tx = hca.create_cq(sendq_size, uar, eq.eqn())?;
        let cq_rx = hca.create_cq(recvq_size, uar, eq.eqn())?;

        // one contiguous WQE region, RX strides first, then TX
        let slab_size = (recvq_size + sendq_size) as usize * 64;
        let wqe_slab = Rc::new(dma.borrow_mut().alloc(slab_size, 4096)?);
        let wq_doorbell = Rc::new(dma.borrow_mut().alloc(64, 64)?);

        let rq = hca.create_rq(
            cq_rx.cqn(),
            pd,
            recvq_size,
            wqe_slab.clone(),
            0,
            wq_doorbell.clone(),
            uar,
            rlkey,
        )?;
        let uar_page = UarPage::new(bar.add(uar.0 as usize * UAR_PAGE_SIZE));
        let sq = hca.create_sq(
            cq_tx.cqn(),
            pd,
            sendq_size,
            wqe_slab.clone(),
            recvq_size as usize * 64,
            wq_doorbell.clone(),
            tis,
            uar,
            uar_page,
            rlkey,
        )?;
        let tir = hca.create_tir_direct(rq.rqn(), td)?;

        // RX dispatch: everything through one wildcard rule to the TIR
        let flow_table = hca.create_flow_table(FlowTableType::NicRx, FLOW_TABLE_LOG_SIZE)?;
        let group = hca.create_flow_group_wildcard(flow_table, 0, 0)?;
        hca.set_flow_table_entry_wildcard(flow_table, group, 0, tir)?;
        hca.set_flow_table_root(flow_table)?;

        hca.modify_rq(rq.rqn(), WqState::Reset, WqState::Ready)?;
        hca.modify_sq(sq.sqn(), WqState::Reset, WqState::Ready)?;

        if config.admin_up {
            hca.set_port_status(true)?;
        }

        let rx_pool = dma.borrow_mut().alloc(recvq_size as usize * BUFFER_SIZE, 4096)?;
        let tx_pool = dma.borrow_mut().alloc(sendq_size as usize * BUFFER_SIZE, 4096)?;

        let mut nic = ConnectX {
            hca,
            uar,
            pd,
            td,
            eq: Some(eq),
            cq_tx: Some(cq_tx),
            cq_rx: Some(cq_rx),
            sq: Some(sq),
            rq: Some(rq),
            tir: Some(tir),
            tis: Some(tis),
            flow_table: Some(flow_table),
            _wqe_slab: wqe_slab,
            _wq_doorbell: wq_doorbell,
            rx_pool,
            tx_pool,
            mac: config.mac,
            pciaddress: None,
            stopped: false,
            rxdrop: 0,
            txdrop: 0,
            input: None,
            output: None,
        };
        nic.refill_rx();
        debug!("bring-up complete: rq {:?} sq {:?}", nic.rq_number(), nic.sq_number());
        Ok(nic)
    }

    pub fn rq_number(&self) -> Option<u32> {
        self.rq.as_ref().map(|rq| rq.rqn())
    }

    pub fn sq_number(&self) -> Option<u32> {
        self.sq.as_ref().map(|sq| sq.sqn())
    }

    pub fn eq_number(&self) -> Option<u8> {
        self.eq.as_ref().map(|eq| eq.eqn())
    }

    /// The station MAC: the configured one, else the permanent address from
    /// the vport context (queried once and cached).
    pub fn mac(&mut self) -> Result<MacAddress, Error> {
        if let Some(mac) = self.mac {
            return Ok(mac);
        }
        let mac = MacAddress::new(self.hca.query_vport_mac()?);
        debug!("permanent MAC {mac}");
        self.mac = Some(mac);
        Ok(mac)
    }

    pub fn set_port_up(&mut self, up: bool) -> Result<(), Error> {
        Ok(self.hca.set_port_status(up)?)
    }

    /// Keeps the receive ring full of empty buffers. Slot i of the pool backs
    /// WQE slot i, so a completion's position names its buffer.
    fn refill_rx(&mut self) {
        let Some(rq) = self.rq.as_mut() else { return };
        let mask = rq.size() - 1;
        let mut posted = false;
        while !rq.is_full() {
            let slot = rq.pc & mask;
            let phys = self.rx_pool.phys() + (slot as usize * BUFFER_SIZE) as u64;
            rq.post(phys, BUFFER_SIZE as u32);
            posted = true;
        }
        if posted {
            rq.ring_doorbell();
        }
    }

    /// Receive path: reap RX completions, hand the frames to the output
    /// link, repost the buffers, and look in on the event queue.
    fn do_pull(&mut self) {
        if self.stopped {
            return;
        }
        if let (Some(cq), Some(rq), Some(output)) =
            (self.cq_rx.as_mut(), self.rq.as_mut(), self.output.as_ref())
        {
            let mut output = output.borrow_mut();
            let mask = rq.size() - 1;
            let mut reaped = false;
            for _ in 0..PULL_BUDGET {
                if output.full() {
                    break;
                }
                let Some(completion) = cq.poll() else { break };
                reaped = true;
                let slot = (rq.cc & mask) as usize;
                rq.cc = rq.cc.wrapping_add(1);
                if completion.is_error() {
                    warn!("rx completion error, opcode {:#x}", completion.opcode);
                    self.rxdrop += 1;
                    continue;
                }
                let len = (completion.byte_count as usize).min(BUFFER_SIZE);
                if len > packet::MAX_PAYLOAD {
                    self.rxdrop += 1;
                    continue;
                }
                let mut frame = Packet::new();
                self.rx_pool
                    .read_bytes(slot * BUFFER_SIZE, &mut frame.buffer_mut()[..len]);
                frame.set_len(len);
                output.transmit(frame);
            }
            if reaped {
                cq.update_doorbell();
            }
        }
        self.refill_rx();
        if let Some(eq) = self.eq.as_mut() {
            eq.poll(&mut |event| match event {
                Event::PageRequest { num_pages, .. } => {
                    // steady state is fully provisioned; just note it
                    warn!("firmware requests {num_pages} pages mid-run");
                }
                other => trace!("async event: {other:?}"),
            });
        }
    }

    /// Transmit path: recycle completed slots, then turn input packets into
    /// send WQEs and ring the doorbell once.
    fn do_push(&mut self) {
        if self.stopped {
            return;
        }
        let (Some(cq), Some(sq), Some(input)) =
            (self.cq_tx.as_mut(), self.sq.as_mut(), self.input.as_ref())
        else {
            return;
        };
        let mut reaped = false;
        while let Some(completion) = cq.poll() {
            if completion.is_error() {
                warn!("tx completion error, opcode {:#x}", completion.opcode);
            }
            sq.cc = sq.cc.wrapping_add(1);
            reaped = true;
        }
        if reaped {
            cq.update_doorbell();
        }

        let mut input = input.borrow_mut();
        let mask = sq.size() - 1;
        let mut posted = false;
        while !sq.is_full() {
            let Some(frame) = input.receive() else { break };
            if frame.len() < INLINE_HEADER_SIZE {
                self.txdrop += 1;
                continue;
            }
            let slot = (sq.pc & mask) as usize;
            self.tx_pool.write_bytes(slot * BUFFER_SIZE, frame.data());
            let headers: [u8; INLINE_HEADER_SIZE] =
                frame.data()[..INLINE_HEADER_SIZE].try_into().unwrap();
            let phys = self.tx_pool.phys() + (slot * BUFFER_SIZE) as u64;
            sq.post(&headers, phys, frame.len() as u32);
            posted = true;
        }
        if posted {
            sq.ring_doorbell();
        }
    }

    /// Tears everything down in reverse creation order, best-effort: queues
    /// to ERR then RST, objects destroyed, the HCA torn down and disabled,
    /// and the PCI device reset.
    fn do_stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        let attempt = |what: &str, result: Result<(), mlx_ethernet::Error>| {
            if let Err(e) = result {
                warn!("teardown {what}: {e}");
            }
        };

        if let Some(sq) = self.sq.as_ref() {
            let sqn = sq.sqn();
            attempt("sq to ERR", self.hca.modify_sq(sqn, WqState::Ready, WqState::Error));
            attempt("sq to RST", self.hca.modify_sq(sqn, WqState::Error, WqState::Reset));
        }
        if let Some(rq) = self.rq.as_ref() {
            let rqn = rq.rqn();
            attempt("rq to ERR", self.hca.modify_rq(rqn, WqState::Ready, WqState::Error));
            attempt("rq to RST", self.hca.modify_rq(rqn, WqState::Error, WqState::Reset));
        }
        // drain whatever the queues still complete
        if let Some(cq) = self.cq_rx.as_mut() {
            while cq.poll().is_some() {}
        }
        if let Some(cq) = self.cq_tx.as_mut() {
            while cq.poll().is_some() {}
        }

        if let Some(table) = self.flow_table.take() {
            attempt("flow table", self.hca.destroy_flow_table(table));
        }
        if let Some(tir) = self.tir.take() {
            attempt("tir", self.hca.destroy_tir(tir));
        }
        if let Some(sq) = self.sq.take() {
            attempt("sq", self.hca.destroy_sq(sq));
        }
        if let Some(rq) = self.rq.take() {
            attempt("rq", self.hca.destroy_rq(rq));
        }
        if let Some(cq) = self.cq_rx.take() {
            attempt("rx cq", self.hca.destroy_cq(cq));
        }
        if let Some(cq) = self.cq_tx.take() {
            attempt("tx cq", self.hca.destroy_cq(cq));
        }
        if let Some(tis) = self.tis.take() {
            attempt("tis", self.hca.destroy_tis(tis));
        }
        attempt("transport domain", self.hca.dealloc_transport_domain(self.td));
        attempt("pd", self.hca.dealloc_pd(self.pd));
        if let Some(eq) = self.eq.take() {
            attempt("eq", self.hca.destroy_eq(eq));
        }
        attempt("uar", self.hca.dealloc_uar(self.uar));
        attempt("teardown", self.hca.teardown_hca(TeardownMode::Graceful));
        attempt("disable", self.hca.disable_hca());
        if let Some(addr) = &self.pciaddress {
            pci::try_reset(addr);
        }
        debug!("teardown complete");
    }
}

impl App for ConnectX {
    fn push(&mut self) {
        self.do_push();
    }

    fn pull(&mut self) {
        self.do_pull();
    }

    fn stop(&mut self) {
        self.do_stop();
    }
}

impl Drop for ConnectX {
    fn drop(&mut self) {
        self.do_stop();
    }
}
