//! DMA allocation for real hardware: hugetlbfs-backed mappings carved by a
//! bump allocator, with physical addresses resolved through
//! `/proc/self/pagemap`.
//!
//! Chunks handed to the device are never unmapped; the device forgets them
//! only at reset, so the mappings live for the process lifetime.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::rc::Rc;

use log::debug;
use mlx_ethernet::dma::{DmaAllocator, DmaRegion, SharedDma};
use mlx_ethernet::error::Error;

const HUGE_PAGE_SIZE: usize = 2 << 20;

/// PFN is bits 0-54 of a pagemap entry (see pagemap.txt in the Linux
/// Documentation); bit 63 flags the page present.
const PFN_MASK: u64 = 0x007F_FFFF_FFFF_FFFF;
const PAGE_PRESENT_BIT: u32 = 63;
const PAGE_SIZE_BITS: u32 = 12;

/// Resolves a virtual address of this process to its physical address.
pub fn virtual_to_physical(virt: *const u8) -> io::Result<u64> {
    let virt = virt as u64;
    let mut pagemap = File::open("/proc/self/pagemap")?;
    let offset = (virt >> PAGE_SIZE_BITS) * 8;
    pagemap.seek(SeekFrom::Start(offset))?;
    let mut entry = [0u8; 8];
    pagemap.read_exact(&mut entry)?;
    let entry = u64::from_ne_bytes(entry);
    if entry >> PAGE_PRESENT_BIT & 1 == 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "page not present in physical memory",
        ));
    }
    Ok(((entry & PFN_MASK) << PAGE_SIZE_BITS) + (virt & ((1 << PAGE_SIZE_BITS) - 1)))
}

struct Chunk {
    virt: *mut u8,
    phys: u64,
    used: usize,
    len: usize,
}

/// Bump allocator over pinned 2 MiB huge pages. Physical contiguity within a
/// chunk comes from the huge mapping itself.
#[derive(Default)]
pub struct HugetlbDma {
    chunks: Vec<Chunk>,
}

impl HugetlbDma {
    pub fn shared() -> SharedDma {
        Rc::new(RefCell::new(HugetlbDma::default()))
    }

    fn grow(&mut self, at_least: usize) -> Result<(), Error> {
        let len = at_least.max(HUGE_PAGE_SIZE).next_multiple_of(HUGE_PAGE_SIZE);
        let virt = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB | libc::MAP_LOCKED,
                -1,
                0,
            )
        };
        if virt == libc::MAP_FAILED {
            return Err(Error::DmaAllocFailed(len));
        }
        let virt = virt as *mut u8;
        // fault the pages in so pagemap reports them present
        unsafe { core::ptr::write_bytes(virt, 0, len) };
        let phys = virtual_to_physical(virt).map_err(|_| Error::DmaAllocFailed(len))?;
        debug!("new DMA chunk: virt {virt:p} phys {phys:#x} len {len:#x}");
        self.chunks.push(Chunk { virt, phys, used: 0, len });
        Ok(())
    }
}

impl DmaAllocator for HugetlbDma {
    fn alloc(&mut self, size: usize, align: usize) -> Result<DmaRegion, Error> {
        assert!(align.is_power_of_two());
        let fits = |chunk: &Chunk| chunk.used.next_multiple_of(align) + size <= chunk.len;
        if !self.chunks.last().map(fits).unwrap_or(false) {
            self.grow(size.next_multiple_of(align))?;
        }
        let chunk = self.chunks.last_mut().ok_or(Error::DmaAllocFailed(size))?;
        let offset = chunk.used.next_multiple_of(align);
        chunk.used = offset + size;
        let virt = unsafe { chunk.virt.add(offset) };
        // carved out of a permanent chunk: nothing to release
        Ok(unsafe { DmaRegion::from_raw(virt, size, chunk.phys + offset as u64, None) })
    }
}
