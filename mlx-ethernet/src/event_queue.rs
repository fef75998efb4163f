//! The asynchronous event queue.
//!
//! One EQ is created at bring-up, subscribed to page-request events only. It
//! is never interrupt-driven: the driver polls it opportunistically and must
//! keep running whatever event codes show up.
//! (PRM Section 8.19: Events and Interrupts)

use byteorder::BigEndian;
use log::{debug, warn};
use num_enum::TryFromPrimitive;
use static_assertions::const_assert_eq;
use volatile::Volatile;
use zerocopy::{AsBytes, FromBytes, U32};

use crate::bits;
use crate::dma::DmaRegion;

type B32 = U32<BigEndian>;

pub const EQE_SIZE: usize = 64;
/// 128 entries.
pub const LOG_EQ_SIZE: u8 = 7;
/// Event types the EQ subscribes to: PageRequest only, matching the
/// reference bring-up.
pub const EQ_EVENT_BITMASK: u64 = 1 << 0x0B;

/// Event type of an entry the driver has consumed and re-armed.
const EVENT_TYPE_NONE: u8 = 0xFF;

/// The event queue context, staged in host memory and copied into the
/// CREATE_EQ command.
#[derive(FromBytes, AsBytes, Default)]
#[repr(C)]
pub(crate) struct EventQueueContext {
    status: B32,
    _reserved0: [u8; 4],
    page_offset: B32,
    uar_log_eq_size: B32,
    _reserved1: [u8; 4],
    intr: B32,
    log_page_size: B32,
    _reserved2: [u8; 12],
    consumer_counter: B32,
    producer_counter: B32,
    _reserved3: [u8; 16],
}

const_assert_eq!(core::mem::size_of::<EventQueueContext>(), 0x40);

impl EventQueueContext {
    pub(crate) fn init(uar_page: u32, log_eq_size: u8, log_page_size: u8) -> EventQueueContext {
        let mut ctx = EventQueueContext::default();
        let uar = uar_page & 0xFF_FFFF;
        let size = ((log_eq_size & 0x1F) as u32) << 24;
        ctx.uar_log_eq_size.set(uar | size);
        ctx.log_page_size.set(((log_page_size & 0x1F) as u32) << 24);
        ctx
    }

    pub(crate) fn command_offset() -> usize {
        0x10
    }
}

/// One event queue entry, published by the device and re-armed in place.
#[repr(C)]
pub(crate) struct EventQueueEntry {
    /// Event type in [23:16].
    event_type: Volatile<B32>,
    _reserved0: [u8; 28],
    event_data: Volatile<[B32; 7]>,
    /// Ownership in bit 0: starts 1 (hardware) and flips when the device
    /// publishes an event.
    signature_owner: Volatile<B32>,
}

const_assert_eq!(core::mem::size_of::<EventQueueEntry>(), EQE_SIZE);

impl EventQueueEntry {
    /// Hardware-owned, no event: ready for the device's next pass.
    fn arm(&mut self) {
        self.event_type.write(U32::new((EVENT_TYPE_NONE as u32) << 16));
        self.event_data.write([U32::new(0); 7]);
        self.signature_owner.write(U32::new(0x1));
    }
}

#[derive(Debug, PartialEq, Eq, TryFromPrimitive, Copy, Clone)]
#[repr(u8)]
pub enum EventType {
    Completion = 0x00,
    CqError = 0x04,
    PortStateChange = 0x09,
    PageRequest = 0x0B,
}

/// A decoded asynchronous event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The firmware wants more (or returns) pages; negative counts mean
    /// reclaim.
    PageRequest { function_id: u16, num_pages: i32 },
    PortStateChange { port: u8 },
    Completion { cqn: u32 },
    CqError { cqn: u32 },
}

pub struct EventQueue {
    eqn: u8,
    ring: DmaRegion,
    size: u32,
    /// Polling cursor, advances modulo the ring size.
    cursor: u32,
}

impl EventQueue {
    pub(crate) fn new(eqn: u8, ring: DmaRegion, log_size: u8) -> EventQueue {
        EventQueue {
            eqn,
            ring,
            size: 1 << log_size,
            cursor: 0,
        }
    }

    pub fn eqn(&self) -> u8 {
        self.eqn
    }

    /// Arms every entry. Run once before the queue is handed to the device.
    pub(crate) fn init_entries(ring: &DmaRegion) {
        for offset in (0..ring.len()).step_by(EQE_SIZE) {
            let entry = unsafe { &mut *(ring.virt().add(offset) as *mut EventQueueEntry) };
            entry.arm();
        }
    }

    fn entry(&mut self, index: u32) -> &mut EventQueueEntry {
        let offset = ((index & (self.size - 1)) as usize) * EQE_SIZE;
        unsafe { &mut *(self.ring.virt().add(offset) as *mut EventQueueEntry) }
    }

    /// Walks published entries, dispatching each to `handler`. Unknown event
    /// codes are logged and skipped; the datapath never fails on them.
    pub fn poll(&mut self, handler: &mut dyn FnMut(Event)) {
        loop {
            let index = self.cursor;
            let entry = self.entry(index);
            let owner = entry.signature_owner.read().get() & 0x1;
            let event_type = bits::get_bits(entry.event_type.read().get(), 23, 16) as u8;
            if owner != 0 || event_type == EVENT_TYPE_NONE {
                break;
            }
            let data = entry.event_data.read();
            match EventType::try_from(event_type) {
                Ok(EventType::PageRequest) => {
                    let function_id = bits::get_bits(data[0].get(), 15, 0) as u16;
                    let num_pages = data[1].get() as i32;
                    debug!("eq {}: page request for {} pages", self.eqn, num_pages);
                    handler(Event::PageRequest { function_id, num_pages });
                }
                Ok(EventType::PortStateChange) => {
                    let port = bits::get_bits(data[0].get(), 31, 28) as u8;
                    handler(Event::PortStateChange { port });
                }
                Ok(EventType::Completion) => {
                    let cqn = bits::get_bits(data[0].get(), 23, 0);
                    handler(Event::Completion { cqn });
                }
                Ok(EventType::CqError) => {
                    let cqn = bits::get_bits(data[0].get(), 23, 0);
                    handler(Event::CqError { cqn });
                }
                Err(_) => {
                    warn!("eq {}: ignoring unknown event type {event_type:#x}", self.eqn);
                }
            }
            // re-arm the slot for the device's next lap
            self.entry(index).arm();
            self.cursor = self.cursor.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaAllocator, HeapDma};

    fn publish(ring: &DmaRegion, slot: usize, event_type: u8, data0: u32, data1: u32) {
        let off = slot * EQE_SIZE;
        ring.write_u32(off, (event_type as u32) << 16);
        ring.write_u32(off + 0x20, data0);
        ring.write_u32(off + 0x24, data1);
        ring.write_u32(off + 0x3C, 0);
    }

    #[test]
    fn poll_dispatches_and_rearms_in_order() {
        let ring = HeapDma.alloc(4 * EQE_SIZE, 4096).unwrap();
        EventQueue::init_entries(&ring);
        let mut eq = EventQueue::new(1, ring, 2);
        publish(&eq.ring, 0, EventType::PageRequest as u8, 3, 16);
        publish(&eq.ring, 1, EventType::PortStateChange as u8, 1 << 28, 0);

        let mut seen = Vec::new();
        eq.poll(&mut |e| seen.push(e));
        assert_eq!(
            seen,
            vec![
                Event::PageRequest { function_id: 3, num_pages: 16 },
                Event::PortStateChange { port: 1 },
            ]
        );
        assert_eq!(eq.cursor, 2);
        // consumed slots are hardware-owned again
        assert_eq!(eq.ring.read_u32(0x3C) & 1, 1);
    }

    #[test]
    fn unknown_events_do_not_stall_the_queue() {
        let ring = HeapDma.alloc(4 * EQE_SIZE, 4096).unwrap();
        EventQueue::init_entries(&ring);
        let mut eq = EventQueue::new(1, ring, 2);
        publish(&eq.ring, 0, 0x42, 0, 0);
        publish(&eq.ring, 1, EventType::PageRequest as u8, 0, 4);

        let mut seen = Vec::new();
        eq.poll(&mut |e| seen.push(e));
        assert_eq!(seen, vec![Event::PageRequest { function_id: 0, num_pages: 4 }]);
        assert_eq!(eq.cursor, 2);
    }
}
