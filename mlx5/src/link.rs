//! Links: bounded rings of packets connecting apps.
//!
//! A link never blocks. Transmitting onto a full link drops the packet and
//! counts it, the same contract the rest of the framework assumes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::packet::Packet;

pub const LINK_MAX_PACKETS: usize = 1024;

pub type SharedLink = Rc<RefCell<Link>>;

pub struct Link {
    queue: VecDeque<Packet>,
    capacity: usize,
    /// Packets accepted onto the link.
    pub txpackets: u64,
    /// Packets dropped because the link was full.
    pub txdrop: u64,
    /// Packets taken off the link.
    pub rxpackets: u64,
}

impl Link {
    pub fn new() -> Link {
        Link::with_capacity(LINK_MAX_PACKETS)
    }

    pub fn with_capacity(capacity: usize) -> Link {
        assert!(capacity > 0);
        Link {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            txpackets: 0,
            txdrop: 0,
            rxpackets: 0,
        }
    }

    pub fn shared() -> SharedLink {
        Rc::new(RefCell::new(Link::new()))
    }

    pub fn transmit(&mut self, packet: Packet) {
        if self.full() {
            self.txdrop += 1;
        } else {
            self.queue.push_back(packet);
            self.txpackets += 1;
        }
    }

    pub fn receive(&mut self) -> Option<Packet> {
        let packet = self.queue.pop_front();
        if packet.is_some() {
            self.rxpackets += 1;
        }
        packet
    }

    pub fn nreadable(&self) -> usize {
        self.queue.len()
    }

    pub fn full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    pub fn empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for Link {
    fn default() -> Self {
        Link::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_fifo_and_bounded() {
        let mut link = Link::with_capacity(2);
        link.transmit(Packet::from_slice(&[1]).unwrap());
        link.transmit(Packet::from_slice(&[2]).unwrap());
        assert!(link.full());
        link.transmit(Packet::from_slice(&[3]).unwrap());
        assert_eq!(link.txdrop, 1);
        assert_eq!(link.nreadable(), 2);
        assert_eq!(link.receive().unwrap().data(), &[1]);
        assert_eq!(link.receive().unwrap().data(), &[2]);
        assert!(link.empty());
        assert!(link.receive().is_none());
    }
}
