//! Flow tables set rules for forwarding packets to different queues.
//!
//! The driver builds the minimal RX dispatch tree: one table, one wildcard
//! group matching no header fields, and one entry forwarding everything to
//! the TIR. (PRM Section 23.17: Flow Tables)

use byteorder::BigEndian;
use num_enum::TryFromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, U32};

type B32 = U32<BigEndian>;

/// The table's role in packet processing.
/// (PRM Section 23.17.1, Table 1737)
#[derive(Debug, TryFromPrimitive, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowTableType {
    NicRx = 0x0,
    NicTx = 0x1,
}

/// Handle to a created flow table.
#[derive(Debug, Copy, Clone)]
pub struct FlowTable {
    pub id: u32,
    pub kind: FlowTableType,
}

/// Flow table initialization parameters, passed at creation.
/// (PRM Section 23.17.1, Table 1740)
#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct FlowTableContext {
    /// log2 of the table size in flows, bits [7:0].
    log_size: B32,
}

const_assert_eq!(core::mem::size_of::<FlowTableContext>(), 4);

impl FlowTableContext {
    pub(crate) fn init(log_size: u8) -> FlowTableContext {
        let mut ctx = FlowTableContext::default();
        ctx.log_size.set(log_size as u32);
        ctx
    }

    /// Logical input offset of the context within CREATE_FLOW_TABLE.
    pub(crate) fn command_offset() -> usize {
        0x18
    }
}

/// Which header and parameter sets a group's match criteria cover.
/// (PRM Section 23.17.6, Table 1759)
#[derive(Debug, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum MatchCriteriaEnable {
    /// The wildcard group: no fields are matched, every packet hits.
    None = 0,
    OuterHeaders = 1 << 0,
    MiscParameters = 1 << 1,
    InnerHeaders = 1 << 2,
}

/// Flow group initialization parameters.
/// (PRM Section 23.17.6, Table 1758)
#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct FlowGroupInput {
    /// Table type in bits [31:24].
    table_type: B32,
    table_id: B32,
    _reserved0: [u8; 4],
    start_flow_index: B32,
    _reserved1: [u8; 4],
    end_flow_index: B32,
    _reserved2: [u8; 20],
    /// Bitmask selecting which match_criteria sections define the flow.
    match_criteria_enable: B32,
}

const_assert_eq!(core::mem::size_of::<FlowGroupInput>(), 48);

impl FlowGroupInput {
    pub(crate) fn init(
        table: FlowTable,
        start_flow_index: u32,
        end_flow_index: u32,
        match_criteria_enable: MatchCriteriaEnable,
    ) -> FlowGroupInput {
        let mut input = FlowGroupInput::default();
        input.table_type.set((table.kind as u32) << 24);
        input.table_id.set(table.id & 0xFF_FFFF);
        input.start_flow_index.set(start_flow_index);
        input.end_flow_index.set(end_flow_index);
        input.match_criteria_enable.set(match_criteria_enable as u32);
        input
    }

    pub(crate) fn command_offset() -> usize {
        0x10
    }
}

/// Header of SET_FLOW_TABLE_ENTRY: which table and which index.
/// (PRM Section 23.17.9, Table 1788)
#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct FlowEntryInput {
    table_type: B32,
    table_id: B32,
    _reserved0: [u8; 8],
    flow_index: B32,
    _reserved1: [u8; 28],
}

const_assert_eq!(core::mem::size_of::<FlowEntryInput>(), 48);

impl FlowEntryInput {
    pub(crate) fn init(table: FlowTable, flow_index: u32) -> FlowEntryInput {
        let mut input = FlowEntryInput::default();
        input.table_type.set((table.kind as u32) << 24);
        input.table_id.set(table.id & 0xFF_FFFF);
        input.flow_index.set(flow_index);
        input
    }

    pub(crate) fn command_offset() -> usize {
        0x10
    }
}

/// Actions a flow entry can take on a matching packet.
/// (PRM Section 23.17.9, Table 1791)
#[derive(Debug, TryFromPrimitive, Copy, Clone)]
#[repr(u32)]
pub enum FlowContextAction {
    Allow = 1 << 0,
    Drop = 1 << 1,
    FwdDest = 1 << 2,
    Count = 1 << 3,
}

/// The flow context of an entry: group, action, destinations.
/// (PRM Section 23.17.9, Table 1790)
#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct FlowContext {
    _reserved0: [u8; 4],
    group_id: B32,
    _reserved1: [u8; 4],
    action: B32,
    dest_list_size: B32,
    _reserved2: [u8; 20],
}

const_assert_eq!(core::mem::size_of::<FlowContext>(), 40);

impl FlowContext {
    pub(crate) fn init(group_id: u32, action: FlowContextAction, dest_list_size: u32) -> FlowContext {
        let mut ctx = FlowContext::default();
        ctx.group_id.set(group_id);
        ctx.action.set(action as u32);
        ctx.dest_list_size.set(dest_list_size);
        ctx
    }

    pub(crate) fn command_offset() -> usize {
        0x40
    }
}

/// Destination kinds for FWD_DEST.
/// (PRM Section 23.17.9, Table 1801)
#[derive(Debug, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum DestinationType {
    Vport = 0x0,
    FlowTable = 0x1,
    Tir = 0x2,
    Qp = 0x3,
}

/// One element of an entry's destination list.
/// (PRM Section 23.17.9, Table 1800)
#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct DestinationEntry {
    id_and_type: B32,
    packet_reformat: B32,
}

const_assert_eq!(core::mem::size_of::<DestinationEntry>(), 8);

impl DestinationEntry {
    pub(crate) fn init(dest_type: DestinationType, dest_id: u32) -> DestinationEntry {
        let mut entry = DestinationEntry::default();
        entry.id_and_type.set(((dest_type as u32) << 24) | (dest_id & 0xFF_FFFF));
        entry
    }

    /// Logical input offset of the first destination, directly after the
    /// flow context.
    pub(crate) fn command_offset() -> usize {
        FlowContext::command_offset() + core::mem::size_of::<FlowContext>()
    }
}
