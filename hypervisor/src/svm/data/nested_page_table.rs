use crate::{
    platform::Platform,
    utils::addresses::{PhysicalAddress, PhysicalRef},
};
use x86::bits64::paging::{
    PAddr, PDEntry, PDFlags, PDPTEntry, PDPTFlags, PML4Entry, PML4Flags, BASE_PAGE_SIZE, PD, PDPT,
    PML4,
};

pub const _2MB: u64 = 2 * 1024 * 1024;
pub const _512GB: u64 = 512 * 1024 * 1024 * 1024;

/// Identity mapped nested page table covering the first 512 GB with 2 MB
/// pages.
///
/// 1 GB pages are not used since not every (virtualized) processor supports
/// them.
#[repr(C, align(4096))]
pub struct NestedPageTable {
    pub pml4: PML4,
    pub pdpt: PDPT,
    pub pd: [PD; 512],
}
const_assert_eq!(
    core::mem::size_of::<NestedPageTable>(),
    (2 + 512) * BASE_PAGE_SIZE
);

impl NestedPageTable {
    /// Maps every guest physical address below 512 GB to the same system
    /// physical address.
    ///
    /// All entries are writable and user accessible: protection is enforced
    /// by the guest's own page tables.
    pub fn build(&mut self, platform: &dyn Platform) {
        log::info!("Building nested page tables");

        let pdpt_pa = PhysicalAddress::from_va(platform, self.pdpt.as_ptr() as *const u8);
        self.pml4[0] = PML4Entry::new(
            PAddr::from(pdpt_pa.as_u64()),
            PML4Flags::P | PML4Flags::RW | PML4Flags::US,
        );

        // One PML4 entry controls 512 page directory pointer entries.
        //
        for (i, pd) in self.pd.iter_mut().enumerate() {
            let pd_pa = PhysicalAddress::from_va(platform, pd.as_ptr() as *const u8);
            self.pdpt[i] = PDPTEntry::new(
                PAddr::from(pd_pa.as_u64()),
                PDPTFlags::P | PDPTFlags::RW | PDPTFlags::US,
            );

            for (j, entry) in pd.iter_mut().enumerate() {
                let translation_pa = ((i as u64) * 512 + j as u64) * _2MB;

                *entry = PDEntry::new(
                    PAddr::from(translation_pa),
                    PDFlags::P | PDFlags::RW | PDFlags::US | PDFlags::PS,
                );
            }
        }
    }

    /// Translates `guest_pa` by walking the table like the processor does.
    /// Returns `None` if the address is not mapped.
    pub fn translate(&self, platform: &dyn Platform, guest_pa: u64) -> Option<u64> {
        let pml4_entry = self.pml4[((guest_pa >> 39) & 0x1ff) as usize];
        if !pml4_entry.is_present() {
            return None;
        }

        let pdpt = Self::resolve::<PDPT>(platform, pml4_entry.address().as_u64())?;
        let pdpt_entry = pdpt[((guest_pa >> 30) & 0x1ff) as usize];
        if !pdpt_entry.is_present() {
            return None;
        }

        let pd = Self::resolve::<PD>(platform, pdpt_entry.address().as_u64())?;
        let pd_entry = pd[((guest_pa >> 21) & 0x1ff) as usize];
        if !pd_entry.is_present() || !pd_entry.is_page() {
            return None;
        }

        Some(pd_entry.address().as_u64() + (guest_pa & (_2MB - 1)))
    }

    fn resolve<'a, T>(platform: &dyn Platform, pa: u64) -> Option<&'a T> {
        let table = PhysicalRef::<T>::new(PhysicalAddress::from_pa(pa))?;

        // The tables are owned by `self` and only read here.
        unsafe { table.resolve(platform) }.map(|table| &*table)
    }
}
