use crate::{
    error::HypervisorError,
    platform::{MemoryKind, Platform},
    svm::{
        cpu::{Context, Cpu},
        data::{
            nested::{CpuMode, NestedBlocks, NestedData, VmxMode},
            shared_data::SharedData,
        },
        msr::SVM_MSR_VM_HSAVE_PA,
        support::SvmFeatures,
        vmcb::{
            control_area::{
                InterceptMisc1, InterceptMisc2, NpEnable, VINTR_VIRTUAL_GIF_ENABLE,
                VIRTUAL_VMLOAD_VMSAVE_ENABLE,
            },
            Vmcb,
        },
    },
    utils::{addresses::PhysicalAddress, alloc::PageBox},
};
use x86::bits64::paging::BASE_PAGE_SIZE;

pub const KERNEL_STACK_SIZE: usize = 0x6000;
pub const STACK_CONTENTS_SIZE: usize = KERNEL_STACK_SIZE - (core::mem::size_of::<*mut u64>() * 6);

/// Value of [`HostStackLayout::reserved_1`] while the stack is intact.
pub const STACK_SENTINEL: u64 = u64::MAX;

#[repr(C, align(4096))]
pub struct HostStackLayout {
    pub stack_contents: [u8; STACK_CONTENTS_SIZE],

    /// HostRsp. The launch loop passes the value at this address to `vmrun`.
    pub guest_vmcb_pa: u64,
    pub host_vmcb_pa: u64,

    pub self_data: *mut VcpuData,
    pub shared_data: *const SharedData,

    /// To keep HostRsp 16 bytes aligned
    pub padding_1: u64,
    pub reserved_1: u64,
}
const_assert_eq!(core::mem::size_of::<HostStackLayout>(), KERNEL_STACK_SIZE);

/// The data for a single **virtual** processor.
#[repr(C, align(4096))]
pub struct VcpuData {
    /// Taken from SimpleSvm.
    ///
    /// ```text
    ///  Low     HostStackLimit[0]                        StackLimit
    ///  ^       ...
    ///  ^       HostStackLimit[KERNEL_STACK_SIZE - 2]    StackBase
    ///  High    HostStackLimit[KERNEL_STACK_SIZE - 1]    StackBase
    /// ```
    pub host_stack_layout: HostStackLayout,

    /// The `01` block.
    pub guest_vmcb: Vmcb,
    pub host_vmcb: Vmcb,
    pub(crate) host_state_area: [u8; BASE_PAGE_SIZE],

    pub nested: NestedData,
}

impl VcpuData {
    pub fn new(platform: &'static dyn Platform) -> Result<PageBox<Self>, HypervisorError> {
        let mut data = PageBox::<Self>::try_new_zeroed(platform, MemoryKind::NonPaged)?;
        let standby = NestedBlocks::new(platform)?;

        // Everything but the nested state is valid when zeroed.
        unsafe {
            let ptr = data.as_mut_ptr() as *mut VcpuData;
            core::ptr::addr_of_mut!((*ptr).nested).write(NestedData::new(standby));

            Ok(data.assume_init())
        }
    }

    pub fn prepare_for_virtualization<C: Cpu>(
        &mut self, cpu: &mut C, shared_data: &SharedData, context: &Context,
        acceleration: SvmFeatures,
    ) {
        // Based on this: https://github.com/tandasat/SimpleSvm/blob/master/SimpleSvm/SimpleSvm.cpp#L982

        let platform = shared_data.platform();

        // Get physical addresses of important data structures
        //
        let guest_vmcb_pa = PhysicalAddress::from_va(platform, &self.guest_vmcb as *const _ as _);
        let host_vmcb_pa = PhysicalAddress::from_va(platform, &self.host_vmcb as *const _ as _);
        let host_state_area_pa = PhysicalAddress::from_va(platform, self.host_state_area.as_ptr());
        let pml4_pa = shared_data.pml4_pa();
        let msr_pm_pa = shared_data.msr_bitmap_pa();

        log::trace!("Physical addresses:");
        log::trace!("guest_vmcb_pa: {:x}", guest_vmcb_pa);
        log::trace!("host_vmcb_pa: {:x}", host_vmcb_pa);
        log::trace!("host_state_area_pa: {:x}", host_state_area_pa);
        log::trace!("pml4_pa: {:x}", pml4_pa);
        log::trace!("msr_pm_pa: {:x}", msr_pm_pa);

        // Configure which instructions to intercept. `vmrun` and `vmmcall` have
        // to be intercepted, `vmrun` would fail otherwise.
        //
        log::trace!("Configuring instructions to intercept");
        let control_area = &mut self.guest_vmcb.control_area;
        control_area
            .intercept_misc1
            .insert(InterceptMisc1::INTERCEPT_CPUID | InterceptMisc1::INTERCEPT_MSR_PROT);
        control_area
            .intercept_misc2
            .insert(InterceptMisc2::INTERCEPT_VMRUN | InterceptMisc2::INTERCEPT_VMMCALL);

        // Trigger #VMEXIT on MSR exit as defined in msr permission map.
        //
        control_area.msrpm_base_pa = msr_pm_pa.as_u64();

        // Specify guest's address space ID (ASID). TLB is maintained by the ID for
        // guests. Use the same value for all processors since all of them run a
        // single guest in our case. Use 1 as the most likely supported ASID by the
        // processor. Zero of ASID is reserved and illegal.
        //
        control_area.guest_asid = 1;

        control_area.np_enable.insert(NpEnable::NESTED_PAGING);
        control_area.ncr3 = pml4_pa.as_u64();

        // Let level 1 run `vmload`, `vmsave`, `stgi` and `clgi` without exiting.
        //
        if acceleration.virtual_vmload_vmsave {
            control_area.lbr_virtualization_enable |= VIRTUAL_VMLOAD_VMSAVE_ENABLE;
        }
        if acceleration.virtual_gif {
            control_area.vintr |= VINTR_VIRTUAL_GIF_ENABLE;
        }

        // Setup guest state based on current system state.
        //
        log::trace!("Configuring guest state save area");
        self.guest_vmcb.save_area.build(cpu, context);
        self.nested.guest_efer = self.guest_vmcb.save_area.efer;

        // Save some of the current state on VMCB.
        //
        // See: 15.5.2 VMSAVE and VMLOAD Instructions
        //
        cpu.vmsave(guest_vmcb_pa);

        // Set the physical address for the `vmrun` instruction, which will save
        // the current host state.
        //
        cpu.write_msr(SVM_MSR_VM_HSAVE_PA, host_state_area_pa.as_u64());

        // Also save current state for the host.
        //
        cpu.vmsave(host_vmcb_pa);

        // Store data to stack so that the host (hypervisor) can use those values.
        //
        log::trace!("Setting up the stack layout");
        self.host_stack_layout.reserved_1 = STACK_SENTINEL;
        self.host_stack_layout.shared_data = shared_data as *const _;
        self.host_stack_layout.self_data = self as *mut _;
        self.host_stack_layout.host_vmcb_pa = host_vmcb_pa.as_u64();
        self.host_stack_layout.guest_vmcb_pa = guest_vmcb_pa.as_u64();
    }

    /// Initial stack pointer of the launch loop.
    pub fn host_rsp(&self) -> u64 {
        &self.host_stack_layout.guest_vmcb_pa as *const u64 as u64
    }

    pub fn is_stack_intact(&self) -> bool {
        self.host_stack_layout.reserved_1 == STACK_SENTINEL
    }

    pub fn shared_data(&self) -> &SharedData {
        // Shared data outlives every processor that references it.
        unsafe { &*self.host_stack_layout.shared_data }
    }

    pub fn platform(&self) -> &'static dyn Platform {
        self.shared_data().platform()
    }

    pub fn cpu_mode(&self) -> CpuMode {
        self.nested.cpu_mode
    }

    /// `None` as long as level 1 has not started to virtualize.
    pub fn vmx_mode(&self) -> Option<VmxMode> {
        self.nested.vmx.as_ref().map(|vmx| vmx.mode)
    }

    /// Physical address of the `01` block.
    pub fn guest_vmcb_pa(&self) -> PhysicalAddress {
        PhysicalAddress::from_va(self.platform(), &self.guest_vmcb as *const _ as _)
    }

    /// Host state that has to be loaded after a `#VMEXIT` of the block that is
    /// currently passed to `vmrun`.
    pub fn exit_host_vmcb_pa(&self) -> PhysicalAddress {
        match &self.nested.vmx {
            Some(vmx) => vmx.vmcb_host_02_pa(),
            None => PhysicalAddress::from_pa(self.host_stack_layout.host_vmcb_pa),
        }
    }

    /// The block that is passed to `vmrun`: `01` before level 1 started to
    /// virtualize, `02` afterwards.
    pub fn current_vmcb(&mut self) -> &mut Vmcb {
        match self.nested.vmx.as_mut() {
            Some(vmx) => &mut vmx.vmcb_guest_02,
            None => &mut self.guest_vmcb,
        }
    }

    pub fn set_vmrun_target(&mut self, vmcb_pa: PhysicalAddress) {
        self.host_stack_layout.guest_vmcb_pa = vmcb_pa.as_u64();
    }

    /// Whether `pa` is one of the control blocks owned by level 0.
    pub fn is_own_vmcb(&self, pa: PhysicalAddress) -> bool {
        let pa = pa.as_u64();
        let platform = self.platform();
        let own = |va: *const Vmcb| PhysicalAddress::from_va(platform, va as *const u8).as_u64();

        if pa == own(&self.guest_vmcb) || pa == own(&self.host_vmcb) {
            return true;
        }

        match &self.nested.vmx {
            Some(vmx) => pa == vmx.vmcb_guest_02_pa().as_u64() || pa == vmx.vmcb_host_02_pa().as_u64(),
            None => false,
        }
    }
}
