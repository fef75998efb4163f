//! PCI access through Linux sysfs: unbinding the kernel driver, function
//! reset, bus mastering, and mapping BAR0.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::{debug, warn};
use memmap2::MmapRaw;

/// Bit 2 of the config-space command register enables DMA.
const COMMAND_BUS_MASTER: u16 = 1 << 2;
const COMMAND_REGISTER_OFFSET: u64 = 4;

fn device_dir(pciaddress: &str) -> PathBuf {
    PathBuf::from("/sys/bus/pci/devices").join(pciaddress)
}

/// True for the canonical `0000:01:00.0` form.
pub fn valid_address(pciaddress: &str) -> bool {
    let bytes = pciaddress.as_bytes();
    if bytes.len() != 12 {
        return false;
    }
    pciaddress.char_indices().all(|(i, c)| match i {
        4 | 7 => c == ':',
        10 => c == '.',
        _ => c.is_ascii_hexdigit(),
    })
}

/// Detaches the device from whatever kernel driver claims it. Not an error
/// if it is already unbound.
pub fn unbind(pciaddress: &str) -> io::Result<()> {
    let unbind_path = device_dir(pciaddress).join("driver/unbind");
    match fs::write(&unbind_path, pciaddress) {
        Ok(()) => {
            debug!("{pciaddress}: unbound from kernel driver");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Function-level reset. The device re-runs firmware initialization, so the
/// caller must wait for the initialization segment to read ready.
pub fn reset(pciaddress: &str) -> io::Result<()> {
    fs::write(device_dir(pciaddress).join("reset"), "1")
}

/// Best-effort reset for teardown paths, where the original error matters
/// more than the cleanup's.
pub fn try_reset(pciaddress: &str) {
    if let Err(e) = reset(pciaddress) {
        warn!("{pciaddress}: reset failed: {e}");
    }
}

/// Sets or clears the bus-master bit in the config-space command register.
pub fn set_bus_master(pciaddress: &str, enable: bool) -> io::Result<()> {
    let mut config = OpenOptions::new()
        .read(true)
        .write(true)
        .open(device_dir(pciaddress).join("config"))?;
    let mut command = [0u8; 2];
    config.seek(SeekFrom::Start(COMMAND_REGISTER_OFFSET))?;
    config.read_exact(&mut command)?;
    let mut value = u16::from_le_bytes(command);
    if enable {
        value |= COMMAND_BUS_MASTER;
    } else {
        value &= !COMMAND_BUS_MASTER;
    }
    config.seek(SeekFrom::Start(COMMAND_REGISTER_OFFSET))?;
    config.write_all(&value.to_le_bytes())?;
    Ok(())
}

/// A mapped PCI memory BAR. The mapping lives as long as this value.
pub struct Bar {
    map: MmapRaw,
}

impl Bar {
    /// Maps BAR `index` of the device read-write.
    pub fn map(pciaddress: &str, index: u8) -> io::Result<Bar> {
        let path = device_dir(pciaddress).join(format!("resource{index}"));
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = MmapRaw::map_raw(&file)?;
        debug!("{pciaddress}: mapped BAR{index}, {} bytes", map.len());
        Ok(Bar { map })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_format() {
        assert!(valid_address("0000:01:00.0"));
        assert!(valid_address("0000:81:00.1"));
        assert!(!valid_address("01:00.0"));
        assert!(!valid_address("0000:01:00"));
        assert!(!valid_address("0000-01-00.0"));
    }
}
