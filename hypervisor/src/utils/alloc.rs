use crate::{
    error::{AllocationFailedSnafu, HypervisorError},
    platform::{MemoryKind, Platform},
    utils::addresses::PhysicalAddress,
};
use core::{
    alloc::Layout,
    mem::MaybeUninit,
    ops::{Deref, DerefMut},
    ptr::NonNull,
};
use snafu::OptionExt;
use x86::bits64::paging::BASE_PAGE_SIZE;

/// Owning pointer to zero-filled, page aligned memory allocated through the
/// [`Platform`]. The memory is released when the box is dropped.
pub struct PageBox<T> {
    ptr: NonNull<T>,
    kind: MemoryKind,
    platform: &'static dyn Platform,
}

unsafe impl<T: Send> Send for PageBox<T> {}
unsafe impl<T: Sync> Sync for PageBox<T> {}

impl<T> PageBox<T> {
    fn layout() -> Layout {
        let size = core::mem::size_of::<T>().max(BASE_PAGE_SIZE);
        let align = core::mem::align_of::<T>().max(BASE_PAGE_SIZE);

        // Size and alignment are both non-zero powers of two or page multiples.
        unsafe { Layout::from_size_align_unchecked(size, align) }
    }

    /// Allocates zero-filled memory for a `T`.
    pub fn try_new_zeroed(
        platform: &'static dyn Platform, kind: MemoryKind,
    ) -> Result<PageBox<MaybeUninit<T>>, HypervisorError> {
        let layout = Self::layout();
        let ptr = platform.allocate(layout, kind).context(AllocationFailedSnafu {
            size: layout.size(),
            kind,
        })?;

        Ok(PageBox {
            ptr: ptr.cast(),
            kind,
            platform,
        })
    }

    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn physical_address(&self) -> PhysicalAddress {
        self.platform.physical_address(self.ptr.as_ptr() as *const u8)
    }

    pub fn platform(&self) -> &'static dyn Platform {
        self.platform
    }
}

impl<T> PageBox<MaybeUninit<T>> {
    /// # Safety
    ///
    /// The memory must hold a valid `T`, either because all-zero bytes are a
    /// valid `T` or because every other field has been written.
    pub unsafe fn assume_init(self) -> PageBox<T> {
        let this = core::mem::ManuallyDrop::new(self);

        PageBox {
            ptr: this.ptr.cast(),
            kind: this.kind,
            platform: this.platform,
        }
    }
}

impl<T> Deref for PageBox<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for PageBox<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for PageBox<T> {
    fn drop(&mut self) {
        unsafe {
            core::ptr::drop_in_place(self.ptr.as_ptr());
            self.platform
                .deallocate(self.ptr.cast(), Self::layout(), self.kind);
        }
    }
}
