//! Device capabilities reported by QUERY_HCA_CAP.
//!
//! The output is a dense array of bit ranges starting at logical output
//! offset 0x10. Only the fields the driver acts on are decoded; the field
//! table is shared with the software HCA so encode and decode cannot drift.

use crate::command_queue::CommandOutput;

/// Logical output offset where the capability structure begins.
pub const CAP_BASE: usize = 0x10;

/// One capability field: dword offset from the capability base, plus the
/// inclusive bit range inside that dword.
#[derive(Clone, Copy)]
pub struct CapField {
    pub offset: usize,
    pub hi: u32,
    pub lo: u32,
}

macro_rules! cap_fields {
    ($($name:ident => ($off:expr, $hi:expr, $lo:expr)),+ $(,)?) => {
        $(pub const $name: CapField = CapField { offset: $off, hi: $hi, lo: $lo };)+
    };
}

// (PRM Section 23.3.2, QUERY_HCA_CAP general device capabilities)
cap_fields! {
    LOG_MAX_SRQ_SZ => (0x00, 31, 24),
    LOG_MAX_QP_SZ => (0x00, 23, 16),
    LOG_MAX_QP => (0x00, 4, 0),
    LOG_MAX_SRQ => (0x04, 4, 0),
    LOG_MAX_CQ_SZ => (0x08, 23, 16),
    LOG_MAX_CQ => (0x08, 4, 0),
    LOG_MAX_EQ_SZ => (0x0C, 31, 24),
    LOG_MAX_MKEY => (0x0C, 21, 16),
    LOG_MAX_EQ => (0x0C, 3, 0),
    MAX_INDIRECTION => (0x10, 31, 24),
    LOG_MAX_MRW_SZ => (0x10, 22, 16),
    LOG_MAX_KLM_LIST_SIZE => (0x10, 5, 0),
    END_PAD => (0x1C, 31, 31),
    START_PAD => (0x1C, 28, 28),
    CACHE_LINE_128BYTE => (0x1C, 27, 27),
    VPORT_COUNTERS => (0x20, 30, 30),
    PORT_TYPE => (0x24, 9, 8),
    NUM_PORTS => (0x24, 7, 0),
    LOG_MAX_MSG => (0x28, 28, 24),
    MAX_TC => (0x28, 19, 16),
    WOL_S => (0x28, 5, 5),
    CQE_VERSION => (0x2C, 3, 0),
    CMDIF_CHECKSUM => (0x30, 15, 14),
    WQ_SIGNATURE => (0x30, 13, 13),
    SCTR_DATA_CQE => (0x30, 12, 12),
    ETH_NET_OFFLOADS => (0x30, 3, 3),
    CQ_OI => (0x34, 31, 31),
    CQ_RESIZE => (0x34, 30, 30),
    CQ_MODERATION => (0x34, 29, 29),
    SCATTER_FCS => (0x34, 8, 8),
    VPORT_GROUP_MANAGER => (0x38, 31, 31),
    ETH_VIRT => (0x38, 30, 30),
    ETS => (0x38, 28, 28),
    NIC_FLOW_TABLE => (0x38, 25, 25),
    LOG_MAX_VLAN_LIST => (0x3C, 20, 16),
    LOG_MAX_CURRENT_MC_LIST => (0x3C, 12, 8),
    LOG_MAX_CURRENT_UC_LIST => (0x3C, 4, 0),
    LOG_MAX_TIS_PER_SQ => (0x40, 28, 24),
    LOG_MAX_PD => (0x44, 28, 24),
    LOG_MAX_XRCD => (0x44, 20, 16),
    LOG_MAX_RQ => (0x48, 28, 24),
    LOG_MAX_SQ => (0x48, 20, 16),
    LOG_MAX_TIR => (0x48, 12, 8),
    LOG_MAX_TIS => (0x48, 4, 0),
    BASIC_CYCLIC_RCV_WQE => (0x4C, 31, 31),
    LOG_MAX_RMP => (0x4C, 28, 24),
    LOG_MAX_RQT => (0x4C, 20, 16),
    LOG_MAX_RQT_SIZE => (0x4C, 12, 8),
    LOG_MAX_TRANSPORT_DOMAIN => (0x50, 28, 24),
    LOG_MAX_FLOW_COUNTER_BULK => (0x50, 7, 0),
    LOG_MAX_WQ_SZ => (0x54, 4, 0),
}

/// The decoded capability set, one value per table entry the driver reads.
#[derive(Debug, Default, Clone, Copy)]
pub struct HcaCapabilities {
    pub log_max_qp_sz: u8,
    pub log_max_qp: u8,
    pub log_max_cq_sz: u8,
    pub log_max_cq: u8,
    pub log_max_eq_sz: u8,
    pub log_max_mkey: u8,
    pub log_max_eq: u8,
    pub port_type: u8,
    pub num_ports: u8,
    pub log_max_msg: u8,
    pub max_tc: u8,
    pub cqe_version: u8,
    pub cmdif_checksum: u8,
    pub wq_signature: bool,
    pub eth_net_offloads: bool,
    pub vport_group_manager: bool,
    pub nic_flow_table: bool,
    pub log_max_pd: u8,
    pub log_max_rq: u8,
    pub log_max_sq: u8,
    pub log_max_tir: u8,
    pub log_max_tis: u8,
    pub log_max_transport_domain: u8,
    pub log_max_wq_sz: u8,
}

impl HcaCapabilities {
    pub fn parse(out: &CommandOutput) -> HcaCapabilities {
        let field = |f: CapField| out.get_bits(CAP_BASE + f.offset, f.hi, f.lo);
        HcaCapabilities {
            log_max_qp_sz: field(LOG_MAX_QP_SZ) as u8,
            log_max_qp: field(LOG_MAX_QP) as u8,
            log_max_cq_sz: field(LOG_MAX_CQ_SZ) as u8,
            log_max_cq: field(LOG_MAX_CQ) as u8,
            log_max_eq_sz: field(LOG_MAX_EQ_SZ) as u8,
            log_max_mkey: field(LOG_MAX_MKEY) as u8,
            log_max_eq: field(LOG_MAX_EQ) as u8,
            port_type: field(PORT_TYPE) as u8,
            num_ports: field(NUM_PORTS) as u8,
            log_max_msg: field(LOG_MAX_MSG) as u8,
            max_tc: field(MAX_TC) as u8,
            cqe_version: field(CQE_VERSION) as u8,
            cmdif_checksum: field(CMDIF_CHECKSUM) as u8,
            wq_signature: field(WQ_SIGNATURE) != 0,
            eth_net_offloads: field(ETH_NET_OFFLOADS) != 0,
            vport_group_manager: field(VPORT_GROUP_MANAGER) != 0,
            nic_flow_table: field(NIC_FLOW_TABLE) != 0,
            log_max_pd: field(LOG_MAX_PD) as u8,
            log_max_rq: field(LOG_MAX_RQ) as u8,
            log_max_sq: field(LOG_MAX_SQ) as u8,
            log_max_tir: field(LOG_MAX_TIR) as u8,
            log_max_tis: field(LOG_MAX_TIS) as u8,
            log_max_transport_domain: field(LOG_MAX_TRANSPORT_DOMAIN) as u8,
            log_max_wq_sz: field(LOG_MAX_WQ_SZ) as u8,
        }
    }

    /// True when the single-queue bring-up fits the reported maxima. The
    /// firmware is still the authority; a shortfall here just explains the
    /// EXCEED_LIM that the offending create command will earn.
    pub fn supports_single_queue_bringup(&self, log_sq_size: u8, log_rq_size: u8) -> bool {
        self.log_max_cq >= 1
            && self.log_max_eq >= 1
            && self.log_max_sq >= 1
            && self.log_max_rq >= 1
            && self.log_max_tir >= 1
            && self.log_max_tis >= 1
            && self.log_max_wq_sz >= log_sq_size.max(log_rq_size)
    }
}
