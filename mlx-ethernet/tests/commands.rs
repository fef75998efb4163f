//! Wire-level command interface tests against the software HCA: byte-exact
//! entry encodings, mailbox chaining, token discipline, health failures and
//! the work-queue state machine.

use std::cell::RefCell;
use std::rc::Rc;

use mlx_ethernet::command_queue::CommandReturnStatus;
use mlx_ethernet::dma::HeapDma;
use mlx_ethernet::error::Error;
use mlx_ethernet::hca::{CapabilityMode, Hca, PageClass, WqState};
use mlx_ethernet::stub::{StubClock, StubHca};

fn setup() -> (Rc<RefCell<StubHca>>, Hca) {
    let stub = StubHca::shared();
    let bar = stub.borrow_mut().bar_ptr();
    let clock = Box::new(StubClock(stub.clone()));
    let hca = unsafe { Hca::new(bar, HeapDma::shared(), clock, false) }.unwrap();
    (stub, hca)
}

#[test]
fn enable_hca_entry_is_byte_exact() {
    let (stub, mut hca) = setup();
    hca.enable_hca().unwrap();

    let stub = stub.borrow();
    let image = &stub.images()[0];
    assert_eq!(image.opcode, 0x104);
    let mut expected = [0u8; 64];
    expected[0] = 0x07; // type: PCIe transport
    expected[7] = 0x0C; // input length
    expected[16] = 0x01; // opcode 0x0104 << 16
    expected[17] = 0x04;
    expected[59] = 0x08; // output length
    expected[60] = 0xAA; // first token
    expected[63] = 0x01; // hardware ownership
    assert_eq!(image.entry[..], expected[..]);
    assert!(image.input_mailboxes.is_empty());
}

#[test]
fn set_issi_carries_the_version_inline() {
    let (stub, mut hca) = setup();
    hca.enable_hca().unwrap();
    hca.set_issi(1).unwrap();

    let stub = stub.borrow();
    let image = &stub.images()[1];
    assert_eq!(image.opcode, 0x10B);
    assert_eq!(&image.entry[16..20], &[0x01, 0x0B, 0x00, 0x00]);
    assert_eq!(&image.entry[24..28], &[0x00, 0x00, 0x00, 0x01]);
}

#[test]
fn paos_write_carries_opcode_and_register_id_at_their_offsets() {
    let (stub, mut hca) = setup();
    hca.enable_hca().unwrap();
    hca.set_port_status(true).unwrap();

    let stub = stub.borrow();
    let image = stub.images().last().unwrap();
    assert_eq!(image.opcode, 0x805);
    // opcode dword: 08 05 00 00
    assert_eq!(&image.entry[16..20], &[0x08, 0x05, 0x00, 0x00]);
    // register id dword: 00 00 50 06
    assert_eq!(&image.entry[24..28], &[0x00, 0x00, 0x50, 0x06]);
    // local port 1, admin status 1 (up)
    assert_eq!(&image.entry[28..32], &[0x00, 0x01, 0x01, 0x00]);
    assert_eq!(stub.port_admin_status(), 1);
}

#[test]
fn mailbox_chains_carry_block_numbers_and_the_token() {
    let (stub, mut hca) = setup();
    hca.enable_hca().unwrap();
    // 130 pages: 16 + 130 * 8 = 1056 bytes of input, three mailboxes
    hca.alloc_pages(130).unwrap();

    let stub = stub.borrow();
    assert_eq!(stub.pages_received(), 130);
    let image = stub.images().last().unwrap();
    assert_eq!(image.opcode, 0x108);
    assert_eq!(image.input_mailboxes.len(), 3);
    let token = image.entry[60];
    for (i, mailbox) in image.input_mailboxes.iter().enumerate() {
        assert_eq!(mailbox[0x238..0x23C], (i as u32).to_be_bytes());
        assert_eq!(mailbox[0x23D], token);
        // every page but the last links to a successor
        let next = u64::from_be_bytes(mailbox[0x230..0x238].try_into().unwrap());
        if i + 1 < image.input_mailboxes.len() {
            assert_ne!(next, 0);
        } else {
            assert_eq!(next, 0);
        }
    }
}

#[test]
fn small_commands_use_no_mailboxes() {
    let (stub, mut hca) = setup();
    hca.enable_hca().unwrap();
    let stub = stub.borrow();
    let image = &stub.images()[0];
    // no chain: both mailbox pointers stay zero
    assert_eq!(&image.entry[8..16], &[0; 8]);
    assert_eq!(&image.entry[48..56], &[0; 8]);
}

#[test]
fn consecutive_commands_advance_the_token_by_one() {
    let (stub, mut hca) = setup();
    hca.enable_hca().unwrap();
    hca.set_issi(1).unwrap();
    for _ in 0..300 {
        hca.query_pages(PageClass::Regular).unwrap();
    }
    let stub = stub.borrow();
    let tokens: Vec<u8> = stub.images().iter().map(|i| i.entry[60]).collect();
    for pair in tokens.windows(2) {
        let expected = if pair[0] == 0xFF { 1 } else { pair[0] + 1 };
        assert_eq!(pair[1], expected, "token must advance by one, skipping zero");
        assert_ne!(pair[1], 0);
    }
}

#[test]
fn health_syndrome_fails_the_command_without_hanging() {
    let (stub, mut hca) = setup();
    hca.enable_hca().unwrap();
    stub.borrow_mut().set_health_syndrome(0xA5);
    match hca.query_pages(PageClass::Boot) {
        Err(Error::HcaHealth(0xA5)) => {}
        other => panic!("expected HcaHealth(0xA5), got {other:?}"),
    }
}

#[test]
fn capability_query_round_trips_through_the_output_chain() {
    let (_stub, mut hca) = setup();
    hca.enable_hca().unwrap();
    let caps = hca.query_hca_cap(CapabilityMode::Current).unwrap();
    // defaults of the software device
    assert_eq!(caps.log_max_cq_sz, 22);
    assert_eq!(caps.log_max_eq, 7);
    assert_eq!(caps.log_max_sq, 23);
    assert_eq!(caps.log_max_rq, 23);
    assert_eq!(caps.log_max_tir, 8);
    assert_eq!(caps.log_max_tis, 8);
    assert!(caps.supports_single_queue_bringup(10, 10));
}

#[test]
fn work_queue_state_machine_is_enforced() {
    let (_stub, mut hca) = setup();
    hca.enable_hca().unwrap();
    let uar = hca.alloc_uar().unwrap();
    let eq = hca.create_eq(uar).unwrap();
    let pd = hca.alloc_pd().unwrap();
    let cq = hca.create_cq(64, uar, eq.eqn()).unwrap();

    let slab = Rc::new(HeapDma::shared().borrow_mut().alloc(64 * 16, 4096).unwrap());
    let doorbell = Rc::new(HeapDma::shared().borrow_mut().alloc(64, 64).unwrap());
    let rq = hca
        .create_rq(cq.cqn(), pd, 64, slab, 0, doorbell, uar, 0x100)
        .unwrap();
    let rqn = rq.rqn();

    let rejected = |r: Result<(), Error>| {
        matches!(
            r,
            Err(Error::Command { status: CommandReturnStatus::BadResState, .. })
        )
    };

    // illegal transitions are rejected without changing state
    assert!(rejected(hca.modify_rq(rqn, WqState::Reset, WqState::Reset)));
    assert!(rejected(hca.modify_rq(rqn, WqState::Ready, WqState::Ready)));
    assert!(rejected(hca.modify_rq(rqn, WqState::Ready, WqState::Reset)));
    assert!(rejected(hca.modify_rq(rqn, WqState::Error, WqState::Ready)));

    // the legal cycle
    hca.modify_rq(rqn, WqState::Reset, WqState::Ready).unwrap();
    hca.modify_rq(rqn, WqState::Ready, WqState::Error).unwrap();
    hca.modify_rq(rqn, WqState::Error, WqState::Reset).unwrap();

    // the declared state must match the device's
    assert!(rejected(hca.modify_rq(rqn, WqState::Ready, WqState::Error)));
}

#[test]
fn port_and_loopback_registers_round_trip() {
    let (_stub, mut hca) = setup();
    hca.enable_hca().unwrap();

    let (current, supported) = hca.query_issi().unwrap();
    assert_eq!(current, 0);
    assert_eq!(supported & 0x2, 0x2);
    hca.set_issi(1).unwrap();

    let status = hca.port_status().unwrap();
    assert_eq!(status.admin_status, 2);
    hca.set_port_status(true).unwrap();
    let status = hca.port_status().unwrap();
    assert_eq!(status.admin_status, 1);
    assert_eq!(status.oper_status, 1);

    let vport = hca.query_vport_state().unwrap();
    assert_eq!(vport.oper_state, 1);

    assert_eq!(hca.loopback_capability().unwrap(), 1);
    hca.set_loopback_mode(true).unwrap();
}

#[test]
fn unknown_resources_are_rejected() {
    let (_stub, mut hca) = setup();
    hca.enable_hca().unwrap();
    match hca.modify_sq(42, WqState::Reset, WqState::Ready) {
        Err(Error::Command { status: CommandReturnStatus::BadResource, .. }) => {}
        other => panic!("expected BadResource, got {other:?}"),
    }
}
