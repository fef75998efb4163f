//! Hardware self-test: brings up the NIC named by `NIC_PCI_ADDRESS_0`,
//! transmits a couple of broadcast frames and reports link counters.
//!
//! Without the environment variable the test is skipped with exit code 77.

use std::process::exit;

use mlx5::{App, Config, ConnectX, Link, Packet};

const SKIP_EXIT_CODE: i32 = 77;

fn main() {
    env_logger::init();
    let pciaddress = match std::env::var("NIC_PCI_ADDRESS_0") {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("NIC_PCI_ADDRESS_0 not set; skipping selftest");
            exit(SKIP_EXIT_CODE);
        }
    };

    match run(&pciaddress) {
        Ok(()) => println!("selftest ok"),
        Err(e) => {
            eprintln!("selftest failed: {e}");
            exit(1);
        }
    }
}

fn run(pciaddress: &str) -> Result<(), mlx5::Error> {
    let mut config = Config::new(pciaddress);
    config.query_capabilities = true;
    config.admin_up = true;
    let mut nic = ConnectX::new(&config)?;
    let mac = nic.mac()?;
    println!("{pciaddress}: MAC {mac}");

    let input = Link::shared();
    let output = Link::shared();
    nic.input = Some(input.clone());
    nic.output = Some(output.clone());

    for _ in 0..2 {
        input.borrow_mut().transmit(broadcast_frame(mac.as_bytes()));
    }

    for _ in 0..100 {
        nic.push();
        nic.pull();
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    println!(
        "tx queued {} rx received {}",
        input.borrow().rxpackets,
        output.borrow().nreadable()
    );
    nic.stop();
    Ok(())
}

fn broadcast_frame(src: &[u8]) -> Packet {
    let mut frame = [0u8; 60];
    frame[..6].fill(0xFF);
    frame[6..12].copy_from_slice(src);
    frame[12..14].copy_from_slice(&0x002Eu16.to_be_bytes());
    frame[14..].fill(0x01);
    Packet::from_slice(&frame).expect("frame fits a packet")
}
