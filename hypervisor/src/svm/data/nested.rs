//! Bookkeeping for the virtualization the level 1 guest performs itself.
//!
//! Naming follows the usual nested virtualization convention: `01` is the
//! control block level 0 runs level 1 with, `12` is the control block level 1
//! authored for level 2 and `02` is the block that is actually handed to
//! `vmrun` once level 1 started to virtualize.

use crate::{
    error::HypervisorError,
    platform::{MemoryKind, Platform},
    svm::vmcb::{save_area::SaveArea, Vmcb},
    utils::{
        addresses::{PhysicalAddress, PhysicalRef},
        alloc::PageBox,
    },
};

/// Whether level 1 has started to use SVM.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CpuMode {
    /// Level 1 runs directly on the `01` block.
    ProtectedMode = 0,

    /// Level 1 executed `vmrun` at least once. From now on every level runs on
    /// the `02` block.
    VmxMode,
}

/// Which level currently occupies the `02` block.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxMode {
    /// Level 1 runs as the hypervisor of level 2.
    RootMode,

    /// Level 2 runs on behalf of level 1.
    GuestMode,
}

pub struct NestedData {
    pub cpu_mode: CpuMode,

    /// EFER as seen by level 1.
    pub guest_efer: u64,

    /// `VM_HSAVE_PA` as written by level 1. Never written to hardware.
    pub guest_hsave_pa: u64,

    /// Blocks handed over to [`NestedVmx`] on the first `vmrun` of level 1,
    /// so that nothing has to be allocated on the `#VMEXIT` path.
    pub standby: Option<NestedBlocks>,

    pub vmx: Option<NestedVmx>,
}

impl NestedData {
    pub fn new(standby: NestedBlocks) -> Self {
        Self {
            cpu_mode: CpuMode::ProtectedMode,
            guest_efer: 0,
            guest_hsave_pa: 0,
            standby: Some(standby),
            vmx: None,
        }
    }

    /// Returns the nested state, creating it from the standby blocks on the
    /// first `vmrun` of level 1.
    pub fn activate(
        &mut self, vmcb_guest_12: PhysicalRef<Vmcb>, l1_state: SaveArea,
    ) -> Option<&mut NestedVmx> {
        if self.vmx.is_none() {
            let blocks = self.standby.take()?;

            log::info!("Level 1 started to virtualize");
            self.vmx = Some(NestedVmx::new(blocks, vmcb_guest_12, l1_state));
            self.cpu_mode = CpuMode::VmxMode;
        }

        self.vmx.as_mut()
    }
}

pub struct NestedBlocks {
    pub vmcb_guest_02: PageBox<Vmcb>,
    pub vmcb_host_02: PageBox<Vmcb>,
}

impl NestedBlocks {
    pub fn new(platform: &'static dyn Platform) -> Result<Self, HypervisorError> {
        let vmcb_guest_02 = PageBox::<Vmcb>::try_new_zeroed(platform, MemoryKind::NonPaged)?;
        let vmcb_host_02 = PageBox::<Vmcb>::try_new_zeroed(platform, MemoryKind::NonPaged)?;

        // All-zero bytes are a valid `Vmcb`.
        unsafe {
            Ok(Self {
                vmcb_guest_02: vmcb_guest_02.assume_init(),
                vmcb_host_02: vmcb_host_02.assume_init(),
            })
        }
    }
}

/// Created when level 1 executes its first `vmrun`.
pub struct NestedVmx {
    pub vmcb_guest_02: PageBox<Vmcb>,

    /// Host state loaded with `vmload` on every `#VMEXIT` of the `02` block.
    pub vmcb_host_02: PageBox<Vmcb>,

    /// The block level 1 passed to its last `vmrun`.
    pub vmcb_guest_12: PhysicalRef<Vmcb>,

    pub mode: VmxMode,

    /// Level 1 state at its last `vmrun`, restored when level 2 exits to it.
    pub l1_state: SaveArea,
}

impl NestedVmx {
    pub fn new(blocks: NestedBlocks, vmcb_guest_12: PhysicalRef<Vmcb>, l1_state: SaveArea) -> Self {
        Self {
            vmcb_guest_02: blocks.vmcb_guest_02,
            vmcb_host_02: blocks.vmcb_host_02,
            vmcb_guest_12,
            mode: VmxMode::RootMode,
            l1_state,
        }
    }

    pub fn vmcb_guest_02_pa(&self) -> PhysicalAddress {
        self.vmcb_guest_02.physical_address()
    }

    pub fn vmcb_host_02_pa(&self) -> PhysicalAddress {
        self.vmcb_host_02.physical_address()
    }
}
