//! MSR permission map, see `15.11 MSR Intercepts`.

use crate::svm::msr::SVM_MSR_VM_HSAVE_PA;
use x86::{
    bits64::paging::BASE_PAGE_SIZE,
    msr::{IA32_EFER, IA32_LSTAR},
};

const CHAR_BIT: u32 = 8;
const BITS_PER_MSR: u32 = 2;
const RANGE_SIZE: u32 = 0x800 * CHAR_BIT;

/// MSRs that have to be intercepted to keep the hypervisor resident.
pub const INTERCEPTED_MSRS: [u32; 3] = [IA32_EFER, IA32_LSTAR, SVM_MSR_VM_HSAVE_PA];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MsrAccess {
    Read,
    Write,
}

impl MsrAccess {
    /// Decodes `EXITINFO1` of a `#VMEXIT(MSR)`.
    pub fn from_exit_info(exit_info1: u64) -> Self {
        if exit_info1 & 1 != 0 {
            MsrAccess::Write
        } else {
            MsrAccess::Read
        }
    }
}

#[repr(C)]
pub struct MsrBitmap {
    /// 0000_0000 to 0000_1FFF
    pub msr_bitmap_0: [u8; 0x800],
    /// C000_0000 to C000_1FFF
    pub msr_bitmap_1: [u8; 0x800],
    /// C001_0000 to C001_1FFF
    pub msr_bitmap_2: [u8; 0x800],
    /// Reserved
    pub msr_bitmap_3: [u8; 0x800],
}
const_assert_eq!(core::mem::size_of::<MsrBitmap>(), 2 * BASE_PAGE_SIZE);

impl MsrBitmap {
    /// Clears the map and intercepts reads and writes of [`INTERCEPTED_MSRS`].
    pub fn build(&mut self) {
        log::trace!("Building the msr permission map");

        self.as_bytes_mut().fill(0);

        for msr in INTERCEPTED_MSRS {
            self.hook_msr(msr);
        }
    }

    pub fn hook_msr(&mut self, msr: u32) {
        self.hook_rdmsr(msr);
        self.hook_wrmsr(msr);
    }

    pub fn hook_rdmsr(&mut self, msr: u32) {
        if let Some(offset) = Self::bit_offset(msr, MsrAccess::Read) {
            self.set_bit(offset);
        }
    }

    pub fn hook_wrmsr(&mut self, msr: u32) {
        if let Some(offset) = Self::bit_offset(msr, MsrAccess::Write) {
            self.set_bit(offset);
        }
    }

    /// Whether `access` to `msr` causes a `#VMEXIT` with this map. Accesses
    /// to MSRs outside of the mapped ranges always do.
    pub fn is_intercepted(&self, msr: u32, access: MsrAccess) -> bool {
        match Self::bit_offset(msr, access) {
            Some(offset) => self.bit(offset),
            None => true,
        }
    }

    /// Whether `msr` is covered by one of the three ranges of the map.
    pub fn is_mapped(msr: u32) -> bool {
        Self::msr_range(msr).is_some()
    }

    /// Bit index of the read or write intercept of `msr`, counted from the
    /// start of the map.
    pub fn bit_offset(msr: u32, access: MsrAccess) -> Option<u32> {
        let (range_base, range_offset) = Self::msr_range(msr)?;
        let read_bit = range_offset + (msr - range_base) * BITS_PER_MSR;

        Some(match access {
            MsrAccess::Read => read_bit,
            MsrAccess::Write => read_bit + 1,
        })
    }

    /// Returns the first MSR of the range `msr` belongs to and the bit offset
    /// of that range.
    #[allow(clippy::identity_op)]
    fn msr_range(msr: u32) -> Option<(u32, u32)> {
        if (0x0000_0000..=0x0000_1FFF).contains(&msr) {
            Some((0x0000_0000, 0))
        } else if (0xC000_0000..=0xC000_1FFF).contains(&msr) {
            Some((0xC000_0000, 1 * RANGE_SIZE))
        } else if (0xC001_0000..=0xC001_1FFF).contains(&msr) {
            Some((0xC001_0000, 2 * RANGE_SIZE))
        } else {
            None
        }
    }

    fn set_bit(&mut self, offset: u32) {
        let bytes = self.as_bytes_mut();
        bytes[(offset / CHAR_BIT) as usize] |= 1 << (offset % CHAR_BIT);
    }

    fn bit(&self, offset: u32) -> bool {
        let bytes = self.as_bytes();
        bytes[(offset / CHAR_BIT) as usize] & (1 << (offset % CHAR_BIT)) != 0
    }

    fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(self as *const _ as *const u8, core::mem::size_of::<Self>())
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(self as *mut _ as *mut u8, core::mem::size_of::<Self>())
        }
    }
}
