//! Physical addresses and the single place where they are turned back into
//! references.

use crate::platform::Platform;
use core::{fmt, marker::PhantomData};
use x86::bits64::paging::{PAddr, BASE_PAGE_SIZE};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct PhysicalAddress(PAddr);

impl PhysicalAddress {
    pub fn from_pa(pa: u64) -> Self {
        Self(PAddr::from(pa))
    }

    pub fn from_va(platform: &dyn Platform, va: *const u8) -> Self {
        platform.physical_address(va)
    }

    pub fn as_u64(self) -> u64 {
        self.0.as_u64()
    }

    pub fn is_page_aligned(self) -> bool {
        self.0.is_base_page_aligned()
    }

    pub fn align_down_to_base_page(self) -> Self {
        Self(self.0.align_down_to_base_page())
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.as_u64(), f)
    }
}

/// Typed handle to a `T` that lives in memory identified only by its physical
/// address, such as a control block authored by the guest.
pub struct PhysicalRef<T> {
    pa: PhysicalAddress,
    _marker: PhantomData<*mut T>,
}

impl<T> Clone for PhysicalRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PhysicalRef<T> {}

impl<T> fmt::Debug for PhysicalRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalRef({:#x})", self.pa)
    }
}

impl<T> PhysicalRef<T> {
    /// Returns `None` if `pa` cannot hold a page sized `T`.
    pub fn new(pa: PhysicalAddress) -> Option<Self> {
        if pa.as_u64() == 0 || !pa.is_page_aligned() {
            return None;
        }
        if core::mem::size_of::<T>() > BASE_PAGE_SIZE {
            return None;
        }

        Some(Self {
            pa,
            _marker: PhantomData,
        })
    }

    pub fn physical_address(&self) -> PhysicalAddress {
        self.pa
    }

    /// Maps the handle into the current address space.
    ///
    /// # Safety
    ///
    /// The page behind the handle must hold a valid `T` for `'a` and must not
    /// be referenced through any other path while the returned reference is
    /// alive.
    pub unsafe fn resolve<'a>(&self, platform: &dyn Platform) -> Option<&'a mut T> {
        let va = platform.virtual_address(self.pa)?;

        va.cast::<T>().as_ptr().as_mut()
    }
}
