//! Datapath against the software HCA: receive ordering across wrap-around,
//! buffer recycling, and the transmit path.

use std::cell::RefCell;
use std::rc::Rc;

use mlx_ethernet::dma::HeapDma;
use mlx_ethernet::stub::{StubClock, StubHca};
use mlx5::{App, Config, ConnectX, Link, Packet};

fn bring_up(recvq: u32, sendq: u32) -> (Rc<RefCell<StubHca>>, ConnectX) {
    let stub = StubHca::shared();
    let bar = stub.borrow_mut().bar_ptr();
    let clock = Box::new(StubClock(stub.clone()));
    let mut config = Config::new("0000:01:00.0");
    config.recvq_size = recvq;
    config.sendq_size = sendq;
    let mut nic = unsafe { ConnectX::with_device(&config, bar, HeapDma::shared(), clock) }.unwrap();
    nic.input = Some(Link::shared());
    nic.output = Some(Link::shared());
    (stub, nic)
}

fn frame(seq: u32, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    data[..6].fill(0xFF);
    data[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 1]);
    data[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    data[14..18].copy_from_slice(&seq.to_be_bytes());
    data
}

#[test]
fn receive_returns_posted_buffers_in_submission_order() {
    let (stub, mut nic) = bring_up(1024, 1024);
    let rqn = nic.rq_number().unwrap();

    // the driver posted the whole ring at bring-up
    let mut delivered = Vec::new();
    for seq in 0..1024u32 {
        let addr = stub.borrow_mut().deliver_rx(rqn, &frame(seq, 128)).expect("a buffer is posted");
        delivered.push(addr);
    }
    // nothing more is posted until the driver reaps
    assert!(stub.borrow_mut().deliver_rx(rqn, &frame(9999, 128)).is_none());

    // one distinct buffer per ring slot, consumed in submission order
    let base = *delivered.iter().min().unwrap();
    for (i, addr) in delivered.iter().enumerate() {
        assert_eq!(*addr, base + (i * 2048) as u64);
    }

    let output = nic.output.clone().unwrap();
    let mut received = 0;
    while received < 1024 {
        nic.pull();
        let mut out = output.borrow_mut();
        while let Some(p) = out.receive() {
            assert_eq!(p.len(), 128);
            assert_eq!(&p.data()[14..18], &(received as u32).to_be_bytes());
            received += 1;
        }
    }
    nic.stop();
}

#[test]
fn receive_survives_ring_wraparound() {
    let (stub, mut nic) = bring_up(64, 64);
    let rqn = nic.rq_number().unwrap();
    let output = nic.output.clone().unwrap();

    let mut expected_seq = 0u32;
    // five laps of the 64-entry ring, phase bit flipping each lap
    for _lap in 0..5 {
        for _ in 0..64 {
            stub.borrow_mut()
                .deliver_rx(rqn, &frame(expected_seq + 10_000, 256))
                .expect("buffer posted");
            expected_seq += 1;
        }
        let mut lap_received = 0;
        while lap_received < 64 {
            nic.pull();
            let mut out = output.borrow_mut();
            while let Some(p) = out.receive() {
                lap_received += 1;
                assert_eq!(p.len(), 256);
            }
        }
    }
    nic.stop();
}

#[test]
fn oversized_completions_are_dropped_not_forwarded() {
    let (stub, mut nic) = bring_up(64, 64);
    let rqn = nic.rq_number().unwrap();
    // larger than a link packet but within the posted buffer
    stub.borrow_mut().deliver_rx(rqn, &vec![0xEE; 1600]).unwrap();
    stub.borrow_mut().deliver_rx(rqn, &frame(7, 100)).unwrap();
    let output = nic.output.clone().unwrap();
    for _ in 0..4 {
        nic.pull();
    }
    assert_eq!(nic.rxdrop, 1);
    let mut out = output.borrow_mut();
    let p = out.receive().unwrap();
    assert_eq!(p.len(), 100);
    assert!(out.receive().is_none());
    drop(out);
    nic.stop();
}

#[test]
fn transmit_reassembles_inline_header_and_payload() {
    let (stub, mut nic) = bring_up(64, 64);
    let sqn = nic.sq_number().unwrap();
    let input = nic.input.clone().unwrap();

    let frames: Vec<Vec<u8>> = (0..10).map(|i| frame(i, 60 + i as usize)).collect();
    for f in &frames {
        input.borrow_mut().transmit(Packet::from_slice(f).unwrap());
    }
    nic.push();

    let sent = stub.borrow_mut().pump_tx(sqn);
    assert_eq!(sent, frames);

    // completions recycle the slots on the next push
    nic.push();
    for f in &frames {
        input.borrow_mut().transmit(Packet::from_slice(f).unwrap());
    }
    nic.push();
    let sent = stub.borrow_mut().pump_tx(sqn);
    assert_eq!(sent, frames);
    nic.stop();
}

#[test]
fn transmit_fills_the_ring_and_resumes_after_completions() {
    let (stub, mut nic) = bring_up(64, 64);
    let sqn = nic.sq_number().unwrap();
    let input = nic.input.clone().unwrap();

    // two rings' worth of frames through a 64-deep queue
    for seq in 0..128 {
        input.borrow_mut().transmit(Packet::from_slice(&frame(seq, 64)).unwrap());
    }
    nic.push();
    // the ring bounds the first batch
    let first = stub.borrow_mut().pump_tx(sqn);
    assert_eq!(first.len(), 64);
    assert_eq!(input.borrow().nreadable(), 64);
    // completions free the slots; the rest follows
    nic.push();
    let second = stub.borrow_mut().pump_tx(sqn);
    assert_eq!(second.len(), 64);
    assert!(input.borrow().empty());
    nic.stop();
}

#[test]
fn runts_are_dropped_on_transmit() {
    let (stub, mut nic) = bring_up(64, 64);
    let sqn = nic.sq_number().unwrap();
    let input = nic.input.clone().unwrap();
    input.borrow_mut().transmit(Packet::from_slice(&[0xAB; 8]).unwrap());
    nic.push();
    assert_eq!(nic.txdrop, 1);
    assert!(stub.borrow_mut().pump_tx(sqn).is_empty());
    nic.stop();
}

#[test]
fn page_request_events_do_not_disturb_the_datapath() {
    let (stub, mut nic) = bring_up(64, 64);
    let rqn = nic.rq_number().unwrap();
    let eqn = nic.eq_number().unwrap();
    stub.borrow_mut().inject_event(eqn, 0x0B, 0, 4);
    stub.borrow_mut().inject_event(eqn, 0x42, 0, 0); // unknown event code
    stub.borrow_mut().deliver_rx(rqn, &frame(1, 100)).unwrap();
    let output = nic.output.clone().unwrap();
    nic.pull();
    assert_eq!(output.borrow().nreadable(), 1);
    nic.stop();
}
