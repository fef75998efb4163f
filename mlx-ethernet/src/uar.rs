//! User Access Region: a page of MMIO doorbell registers.

use byteorder::BigEndian;
use static_assertions::const_assert_eq;
use volatile::Volatile;
use zerocopy::U32;

type B32 = U32<BigEndian>;

pub const UAR_PAGE_SIZE: usize = 4096;

/// The doorbell registers of one UAR page. Only the first BlueFlame buffer
/// is used; the rest of the page is left alone.
#[repr(C)]
pub(crate) struct UserAccessRegion {
    _reserved0: [u8; 0x800],
    db_blueflame: Volatile<[B32; 2]>,
    _reserved1: [u8; 0x7F8],
}

const_assert_eq!(core::mem::size_of::<UserAccessRegion>(), UAR_PAGE_SIZE);

/// A mapped UAR page. The page lives inside BAR0 at `uar_index * 4 KiB`.
pub struct UarPage {
    base: *mut u8,
}

impl UarPage {
    /// # Safety
    /// `base` must point to a mapped 4 KiB UAR page valid for the lifetime
    /// of this value.
    pub unsafe fn new(base: *mut u8) -> UarPage {
        UarPage { base }
    }

    fn region(&mut self) -> &mut UserAccessRegion {
        unsafe { &mut *(self.base as *mut UserAccessRegion) }
    }

    /// Writes the first two dwords of the just-posted WQE to the BlueFlame
    /// register. The doorbell record must already carry the new producer
    /// counter when this is written.
    pub fn ring_send_doorbell(&mut self, ctrl0: u32, ctrl1: u32) {
        self.region()
            .db_blueflame
            .write([U32::new(ctrl0), U32::new(ctrl1)]);
    }
}
