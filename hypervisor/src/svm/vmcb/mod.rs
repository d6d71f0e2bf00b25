//! See `Appendix B - Layout of VMCB` in AMD64 Architecture Programmer’s Manual Volume 2: System Programming.

use crate::svm::vmcb::{control_area::ControlArea, save_area::SaveArea};
use x86::bits64::paging::BASE_PAGE_SIZE;

pub mod control_area;
pub mod save_area;

const VMCB_RESERVED_SIZE: usize =
    BASE_PAGE_SIZE - core::mem::size_of::<ControlArea>() - core::mem::size_of::<SaveArea>();

/// # Layout
///
/// The VMCB is divided into two areas—the first one contains various control bits including the
/// intercept vectors and the second one contains saved guest state.
#[repr(C, align(4096))]
#[derive(Copy, Clone)]
pub struct Vmcb {
    /// Describes the layout of the control area of the VMCB, which starts at offset zero within the
    /// VMCB page. The control area is padded to a size of 1024 bytes. All unused bytes must be zero, as they
    /// are reserved for future expansion.
    pub control_area: ControlArea,

    /// Describes the fields within the state-save area; note that the table lists offsets
    /// relative to the state-save area (not the VMCB as a whole).
    pub save_area: SaveArea,

    pub reserved: [u8; VMCB_RESERVED_SIZE],
}
const_assert_eq!(core::mem::size_of::<Vmcb>(), BASE_PAGE_SIZE);

impl Vmcb {
    /// Advances the guest past the instruction that caused the `#VMEXIT`.
    pub fn skip_instruction(&mut self) {
        self.save_area.rip = self.control_area.nrip;
    }
}
