//! Bring-up against the software HCA: the canonical command trace, the
//! objects it leaves behind, capability failures, and teardown.

use mlx_ethernet::command_queue::CommandReturnStatus;
use mlx_ethernet::dma::HeapDma;
use mlx_ethernet::stub::{StubClock, StubHca};
use mlx5::{App, Config, ConnectX};

fn bring_up(config: &Config) -> (std::rc::Rc<std::cell::RefCell<StubHca>>, Result<ConnectX, mlx5::Error>) {
    let stub = StubHca::shared();
    let bar = stub.borrow_mut().bar_ptr();
    let clock = Box::new(StubClock(stub.clone()));
    let nic = unsafe { ConnectX::with_device(config, bar, HeapDma::shared(), clock) };
    (stub, nic)
}

#[test]
fn bringup_issues_the_canonical_opcode_sequence() {
    let config = Config::new("0000:01:00.0");
    let (stub, nic) = bring_up(&config);
    let nic = nic.unwrap();

    let expected: &[(u16, u16)] = &[
        (0x104, 0), // ENABLE_HCA
        (0x10B, 0), // SET_ISSI
        (0x107, 1), // QUERY_PAGES boot
        (0x108, 1), // MANAGE_PAGES
        (0x107, 2), // QUERY_PAGES init
        (0x108, 1),
        (0x102, 0), // INIT_HCA
        (0x107, 3), // QUERY_PAGES regular
        (0x108, 1),
        (0x802, 0), // ALLOC_UAR
        (0x301, 0), // CREATE_EQ
        (0x800, 0), // ALLOC_PD
        (0x816, 0), // ALLOC_TRANSPORT_DOMAIN
        (0x203, 0), // QUERY_SPECIAL_CONTEXTS
        (0x912, 0), // CREATE_TIS
        (0x400, 0), // CREATE_CQ send
        (0x400, 0), // CREATE_CQ receive
        (0x908, 0), // CREATE_RQ
        (0x904, 0), // CREATE_SQ
        (0x900, 0), // CREATE_TIR
        (0x930, 0), // CREATE_FLOW_TABLE
        (0x933, 0), // CREATE_FLOW_GROUP
        (0x936, 0), // SET_FLOW_TABLE_ENTRY
        (0x92F, 0), // SET_FLOW_TABLE_ROOT
        (0x909, 0), // MODIFY_RQ RST->RDY
        (0x905, 0), // MODIFY_SQ RST->RDY
    ];
    assert_eq!(stub.borrow().trace(), expected);
    drop(nic);
}

#[test]
fn bringup_creates_exactly_the_single_queue_objects() {
    let config = Config::new("0000:01:00.0");
    let (stub, nic) = bring_up(&config);
    let nic = nic.unwrap();

    {
        let stub = stub.borrow();
        assert_eq!(stub.num_eqs(), 1);
        assert_eq!(stub.num_cqs(), 2);
        assert_eq!(stub.num_sqs(), 1);
        assert_eq!(stub.num_rqs(), 1);
        assert_eq!(stub.num_tirs(), 1);
        assert_eq!(stub.num_tises(), 1);
        assert_eq!(stub.num_flow_tables(), 1);
        assert_eq!(stub.num_flow_entries(), 1);
        assert!(stub.flow_root().is_some());
        assert_eq!(stub.rq_state(nic.rq_number().unwrap()), Some(1));
        assert_eq!(stub.sq_state(nic.sq_number().unwrap()), Some(1));
    }
    drop(nic);
}

#[test]
fn create_eq_subscribes_to_page_requests_only() {
    let config = Config::new("0000:01:00.0");
    let (stub, nic) = bring_up(&config);
    let _nic = nic.unwrap();

    let stub = stub.borrow();
    let image = stub
        .images()
        .iter()
        .find(|i| i.opcode == 0x301)
        .expect("CREATE_EQ was issued");
    // 64-bit event bitmask at logical input 0x58: only bit 0x0B
    let mailbox = &image.input_mailboxes[0];
    assert_eq!(&mailbox[0x48..0x50], &[0, 0, 0, 0, 0, 0, 0x08, 0x00]);
}

#[test]
fn undersized_capabilities_fail_bringup_at_create_sq() {
    let stub = StubHca::shared();
    {
        let mut stub = stub.borrow_mut();
        let mut caps = mlx_ethernet::capabilities::HcaCapabilities::default();
        caps.log_max_sq = 4;
        caps.log_max_rq = 23;
        caps.log_max_cq_sz = 22;
        stub.set_caps(caps);
    }
    let bar = stub.borrow_mut().bar_ptr();
    let clock = Box::new(StubClock(stub.clone()));
    let mut config = Config::new("0000:01:00.0");
    config.query_capabilities = true;
    let result = unsafe { ConnectX::with_device(&config, bar, HeapDma::shared(), clock) };

    match result {
        Err(mlx5::Error::Hca(mlx_ethernet::Error::Command { opcode, status, .. })) => {
            assert_eq!(opcode, mlx_ethernet::CommandOpcode::CreateSq);
            assert_eq!(status, CommandReturnStatus::ExceedLim);
        }
        other => panic!("expected ExceedLim at CREATE_SQ, got {other:?}"),
    }
}

#[test]
fn stop_tears_down_in_reverse_order_and_disables_the_hca() {
    let config = Config::new("0000:01:00.0");
    let (stub, nic) = bring_up(&config);
    let mut nic = nic.unwrap();
    nic.stop();

    let stub = stub.borrow();
    assert!(stub.is_torn_down());
    assert_eq!(stub.num_flow_tables(), 0);
    assert_eq!(stub.num_tirs(), 0);
    assert_eq!(stub.num_sqs(), 0);
    assert_eq!(stub.num_rqs(), 0);
    assert_eq!(stub.num_cqs(), 0);
    assert_eq!(stub.num_tises(), 0);
    assert_eq!(stub.num_eqs(), 0);

    let trace = stub.trace();
    let teardown = trace.iter().position(|&(op, _)| op == 0x103).unwrap();
    let disable = trace.iter().position(|&(op, _)| op == 0x105).unwrap();
    assert!(teardown < disable, "TEARDOWN_HCA must precede DISABLE_HCA");
    // every destroy lands between bring-up and TEARDOWN_HCA
    for destroy in [0x931, 0x902, 0x906, 0x90A, 0x401, 0x914, 0x302] {
        let at = trace.iter().position(|&(op, _)| op == destroy).unwrap();
        assert!(at < teardown, "{destroy:#x} must precede TEARDOWN_HCA");
    }
}

#[test]
fn invalid_configurations_are_rejected_before_touching_the_device() {
    let mut config = Config::new("0000:01:00.0");
    config.sendq_size = 1000; // not a power of two
    let (stub, nic) = bring_up(&config);
    assert!(matches!(nic, Err(mlx5::Error::InvalidConfig(_))));
    assert!(stub.borrow().trace().is_empty());
}

#[test]
fn mac_is_queried_lazily_from_the_vport_context() {
    let config = Config::new("0000:01:00.0");
    let (stub, nic) = bring_up(&config);
    let mut nic = nic.unwrap();
    assert!(!stub.borrow().trace().iter().any(|&(op, _)| op == 0x754));
    let mac = nic.mac().unwrap();
    assert_eq!(mac.as_bytes(), &[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    assert!(stub.borrow().trace().iter().any(|&(op, _)| op == 0x754));
    // cached: a second call issues no command
    let commands = stub.borrow().trace().len();
    let _ = nic.mac().unwrap();
    assert_eq!(stub.borrow().trace().len(), commands);
}
