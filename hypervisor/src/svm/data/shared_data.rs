use crate::{
    error::HypervisorError,
    platform::{MemoryKind, Platform},
    svm::data::{msr_bitmap::MsrBitmap, nested_page_table::NestedPageTable},
    utils::{addresses::PhysicalAddress, alloc::PageBox},
};
use alloc::boxed::Box;

/// State shared by every virtualized processor. Built once before the first
/// processor is virtualized and only read afterwards.
pub struct SharedData {
    pub msr_bitmap: PageBox<MsrBitmap>,
    pub nested_page_table: PageBox<NestedPageTable>,
    platform: &'static dyn Platform,
}

impl SharedData {
    pub fn new(platform: &'static dyn Platform) -> Result<Box<Self>, HypervisorError> {
        log::info!("Creating shared data");

        // The processor reads the permission map through a single physical
        // address, so both of its pages have to be contiguous.
        let msr_bitmap = PageBox::<MsrBitmap>::try_new_zeroed(platform, MemoryKind::Contiguous)?;
        let mut msr_bitmap = unsafe { msr_bitmap.assume_init() };
        msr_bitmap.build();

        let nested_page_table =
            PageBox::<NestedPageTable>::try_new_zeroed(platform, MemoryKind::NonPaged)?;
        let mut nested_page_table = unsafe { nested_page_table.assume_init() };
        nested_page_table.build(platform);

        Ok(Box::new(Self {
            msr_bitmap,
            nested_page_table,
            platform,
        }))
    }

    pub fn msr_bitmap_pa(&self) -> PhysicalAddress {
        self.msr_bitmap.physical_address()
    }

    pub fn pml4_pa(&self) -> PhysicalAddress {
        PhysicalAddress::from_va(self.platform, self.nested_page_table.pml4.as_ptr() as *const u8)
    }

    pub fn platform(&self) -> &'static dyn Platform {
        self.platform
    }
}
