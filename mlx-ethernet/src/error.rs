//! Errors surfaced by the command interface and the driver layers above it.

use thiserror::Error;

use crate::command_queue::{CommandDeliveryStatus, CommandOpcode, CommandReturnStatus};

#[derive(Debug, Error)]
pub enum Error {
    /// The command was not delivered to the device; the delivery status names
    /// the transport fault (bad token, bad mailbox pointer, ...).
    #[error("{opcode:?} not delivered: {status:?}")]
    Delivery {
        opcode: CommandOpcode,
        status: CommandDeliveryStatus,
    },

    /// The device reported a delivery status outside the PRM's table.
    #[error("{opcode:?} returned unknown delivery status {status:#x}")]
    UnknownDeliveryStatus { opcode: CommandOpcode, status: u8 },

    /// The command was delivered and executed, and the firmware rejected it.
    #[error("{opcode:?} failed: {status:?}, syndrome {syndrome:#010x}")]
    Command {
        opcode: CommandOpcode,
        status: CommandReturnStatus,
        syndrome: u32,
    },

    /// The device reported a return status outside the PRM's table.
    #[error("{opcode:?} returned unknown status {status:#x}, syndrome {syndrome:#010x}")]
    UnknownReturnStatus {
        opcode: CommandOpcode,
        status: u8,
        syndrome: u32,
    },

    /// The health syndrome went non-zero while a command was in flight.
    #[error("device health syndrome {0:#04x}")]
    HcaHealth(u8),

    /// Command input too large for the mailbox chain.
    #[error("command input of {0} bytes overflows the input mailbox chain")]
    InputOverflow(usize),

    /// Command output too large for the mailbox chain.
    #[error("command output of {0} bytes overflows the output mailbox chain")]
    OutputOverflow(usize),

    #[error("DMA allocation of {0} bytes failed")]
    DmaAllocFailed(usize),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
