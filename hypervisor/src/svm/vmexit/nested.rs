//! Emulation of SVM for the level 1 guest.
//!
//! Once level 1 executed `vmrun`, both level 1 and level 2 run on the `02`
//! block. Every `#VMEXIT` of that block lands here first and is either handled
//! by level 0 on behalf of the level that caused it, or reflected to level 1
//! as if level 2 exited to it directly.

use crate::{
    platform::Platform,
    svm::{
        cpu::Cpu,
        data::{
            guest::GuestRegisters,
            msr_bitmap::{MsrAccess, MsrBitmap},
            nested::{NestedVmx, VmxMode},
            vcpu_data::VcpuData,
        },
        events::EventInjection,
        msr::EFER_SVME,
        vmcb::{
            control_area::{
                ControlArea, ExceptionVector, InterceptMisc1, InterceptMisc2, TlbControl,
                VmExitCode, VmcbClean,
            },
            save_area::SaveArea,
            Vmcb,
        },
        vmexit::{breakpoint, cpuid, msr, npf, unexpected_exit, vmmcall, vmrun, ExitType},
    },
    utils::addresses::{PhysicalAddress, PhysicalRef},
};
use x86::bits64::paging::BASE_PAGE_SIZE;

/// Intercepts level 1 may request for level 2 on top of the ones level 0
/// always has.
const FORWARDED_MISC1: InterceptMisc1 = InterceptMisc1::from_bits_truncate(
    InterceptMisc1::INTERCEPT_CPUID.bits() | InterceptMisc1::INTERCEPT_MSR_PROT.bits(),
);
const FORWARDED_MISC2: InterceptMisc2 = InterceptMisc2::from_bits_truncate(
    InterceptMisc2::INTERCEPT_VMRUN.bits() | InterceptMisc2::INTERCEPT_VMMCALL.bits(),
);
const FORWARDED_EXCEPTIONS: ExceptionVector = ExceptionVector::BREAKPOINT;

pub fn handle_exit<C: Cpu>(
    cpu: &mut C, data: &mut VcpuData, guest_regs: &mut GuestRegisters, mode: VmxMode,
    exit_code: VmExitCode,
) -> ExitType {
    match mode {
        VmxMode::RootMode => handle_root_exit(cpu, data, guest_regs, exit_code),
        VmxMode::GuestMode => handle_guest_exit(cpu, data, guest_regs, exit_code),
    }
}

/// Level 1 acting as a hypervisor exited.
fn handle_root_exit<C: Cpu>(
    cpu: &mut C, data: &mut VcpuData, guest_regs: &mut GuestRegisters, exit_code: VmExitCode,
) -> ExitType {
    match exit_code {
        VmExitCode::VMEXIT_CPUID => cpuid::handle_cpuid(cpu, data, guest_regs),
        VmExitCode::VMEXIT_MSR => msr::handle_msr(cpu, data, guest_regs),
        VmExitCode::VMEXIT_VMMCALL => vmmcall::handle_vmmcall(data, guest_regs),
        VmExitCode::VMEXIT_VMRUN => vmrun::handle_vmrun(cpu, data, guest_regs),
        VmExitCode::VMEXIT_EXCEPTION_BP => breakpoint::handle_breakpoint(data),
        VmExitCode::VMEXIT_NPF => npf::handle_nested_page_fault(cpu, data),
        _ => unexpected_exit(cpu, exit_code, true),
    }
}

/// Level 2 exited.
fn handle_guest_exit<C: Cpu>(
    cpu: &mut C, data: &mut VcpuData, guest_regs: &mut GuestRegisters, exit_code: VmExitCode,
) -> ExitType {
    let platform = data.platform();
    let VcpuData {
        guest_vmcb, nested, ..
    } = &mut *data;

    let Some(vmx) = nested.vmx.as_mut() else {
        unexpected_exit(cpu, exit_code, true)
    };
    let NestedVmx {
        vmcb_guest_02,
        vmcb_guest_12,
        mode,
        l1_state,
        ..
    } = vmx;

    // Level 1 may have released the page since its `vmrun`, nothing can be
    // reported to it in that case.
    //
    let vmcb_guest_12_pa = vmcb_guest_12.physical_address();
    let Some(vmcb12) = (unsafe { vmcb_guest_12.resolve(platform) }) else {
        log::error!("Level 1 control block {:x} is not accessible", vmcb_guest_12_pa);
        unexpected_exit(cpu, exit_code, true)
    };

    if is_intercepted_by_level1(platform, vmcb12, vmcb_guest_02, guest_regs, exit_code) {
        reflect_to_level1(guest_vmcb, vmcb_guest_02, vmcb12, l1_state, vmcb_guest_12_pa, guest_regs);
        *mode = VmxMode::RootMode;

        return ExitType::Continue;
    }

    // Level 1 did not ask for this exit, emulate what the hardware would have
    // done for level 2.
    //
    match exit_code {
        VmExitCode::VMEXIT_CPUID => cpuid::handle_cpuid(cpu, data, guest_regs),
        VmExitCode::VMEXIT_MSR => msr::handle_msr(cpu, data, guest_regs),
        VmExitCode::VMEXIT_VMMCALL | VmExitCode::VMEXIT_VMRUN => {
            EventInjection::ud().inject(data.current_vmcb());
            ExitType::Continue
        }
        VmExitCode::VMEXIT_EXCEPTION_BP => breakpoint::handle_breakpoint(data),
        VmExitCode::VMEXIT_NPF => npf::handle_nested_page_fault(cpu, data),
        _ => unexpected_exit(cpu, exit_code, true),
    }
}

fn is_intercepted_by_level1(
    platform: &dyn Platform, vmcb12: &Vmcb, vmcb02: &Vmcb, guest_regs: &GuestRegisters,
    exit_code: VmExitCode,
) -> bool {
    let control = &vmcb12.control_area;

    match exit_code {
        VmExitCode::VMEXIT_CPUID => control
            .intercept_misc1
            .contains(InterceptMisc1::INTERCEPT_CPUID),
        VmExitCode::VMEXIT_MSR => {
            let access = MsrAccess::from_exit_info(vmcb02.control_area.exit_info1);

            control
                .intercept_misc1
                .contains(InterceptMisc1::INTERCEPT_MSR_PROT)
                && is_msr_intercepted_by_level1(
                    platform,
                    control.msrpm_base_pa,
                    guest_regs.rcx as u32,
                    access,
                )
        }
        VmExitCode::VMEXIT_VMRUN => control
            .intercept_misc2
            .contains(InterceptMisc2::INTERCEPT_VMRUN),
        VmExitCode::VMEXIT_VMMCALL => control
            .intercept_misc2
            .contains(InterceptMisc2::INTERCEPT_VMMCALL),
        VmExitCode::VMEXIT_EXCEPTION_BP => control
            .intercept_exception
            .contains(ExceptionVector::BREAKPOINT),
        _ => false,
    }
}

/// Looks up the permission bit in the MSR permission map of level 1. Only the
/// page holding the bit is mapped.
fn is_msr_intercepted_by_level1(
    platform: &dyn Platform, msrpm_base_pa: u64, msr: u32, access: MsrAccess,
) -> bool {
    let Some(offset) = MsrBitmap::bit_offset(msr, access) else {
        return true;
    };

    let byte_pa = PhysicalAddress::from_pa(msrpm_base_pa + (offset / 8) as u64);
    let page_pa = byte_pa.align_down_to_base_page();
    let index = (byte_pa.as_u64() - page_pa.as_u64()) as usize;

    let page = PhysicalRef::<[u8; BASE_PAGE_SIZE]>::new(page_pa)
        .and_then(|page| unsafe { page.resolve(platform) });
    match page {
        Some(bytes) => bytes[index] & (1 << (offset % 8)) != 0,
        // An unreadable map intercepts everything.
        None => true,
    }
}

/// Handles the `vmrun` of level 1: level 2 is started on the `02` block
/// with the state level 1 put into its own block.
pub fn enter_level2<C: Cpu>(
    cpu: &mut C, data: &mut VcpuData, guest_regs: &mut GuestRegisters,
) -> ExitType {
    let platform = data.platform();
    let vmcb_guest_12_pa = PhysicalAddress::from_pa(guest_regs.rax);

    let vmcb_guest_12 = PhysicalRef::<Vmcb>::new(vmcb_guest_12_pa)
        .filter(|_| !data.is_own_vmcb(vmcb_guest_12_pa));
    let vmcb12 = vmcb_guest_12.and_then(|vmcb| unsafe { vmcb.resolve(platform) });
    let (Some(vmcb_guest_12), Some(vmcb12)) = (vmcb_guest_12, vmcb12) else {
        log::warn!("Invalid control block for vmrun: {:x}", vmcb_guest_12_pa);
        EventInjection::gp().inject(data.current_vmcb());

        return ExitType::Continue;
    };

    // Level 1 continues after its `vmrun` once level 2 exits to it.
    //
    let mut l1_state = data.current_vmcb().save_area;
    l1_state.rip = data.current_vmcb().control_area.nrip;
    l1_state.rax = guest_regs.rax;

    let VcpuData {
        guest_vmcb, nested, ..
    } = &mut *data;

    let Some(vmx) = nested.activate(vmcb_guest_12, l1_state) else {
        log::error!("No control blocks available for level 2");
        EventInjection::gp().inject(guest_vmcb);

        return ExitType::Continue;
    };
    vmx.vmcb_guest_12 = vmcb_guest_12;
    vmx.l1_state = l1_state;

    let vmcb02 = &mut *vmx.vmcb_guest_02;
    merge_control_area(&mut vmcb02.control_area, &guest_vmcb.control_area, &vmcb12.control_area);
    vmcb02.save_area = vmcb12.save_area;
    vmcb02.save_area.efer |= EFER_SVME;
    guest_regs.rax = vmcb12.save_area.rax;

    log::trace!(
        "Entering level 2 at {:#x} with {:x}",
        vmcb02.save_area.rip,
        vmcb_guest_12_pa
    );

    // The host state of the `02` block is the current host state.
    //
    cpu.vmsave(vmx.vmcb_host_02_pa());
    vmx.mode = VmxMode::GuestMode;

    let vmcb_guest_02_pa = vmx.vmcb_guest_02_pa();
    data.set_vmrun_target(vmcb_guest_02_pa);

    ExitType::Continue
}

/// Builds the control area level 2 runs with. Everything that protects level
/// 0 is taken from `01`, level 1 only adds the intercepts it is allowed to.
fn merge_control_area(control_02: &mut ControlArea, control_01: &ControlArea, control_12: &ControlArea) {
    *control_02 = *control_01;

    control_02.intercept_misc1 |= control_12.intercept_misc1 & FORWARDED_MISC1;
    control_02.intercept_misc2 |= control_12.intercept_misc2 & FORWARDED_MISC2;
    control_02.intercept_exception |= control_12.intercept_exception & FORWARDED_EXCEPTIONS;

    control_02.event_inj = control_12.event_inj;
    control_02.vmcb_clean = VmcbClean::empty();
    control_02.tlb_control = TlbControl::FLUSH_GUEST_TLB;
}

/// Emulates a `#VMEXIT` from level 2 to level 1.
fn reflect_to_level1(
    vmcb01: &Vmcb, vmcb02: &mut Vmcb, vmcb12: &mut Vmcb, l1_state: &SaveArea,
    vmcb_guest_12_pa: PhysicalAddress, guest_regs: &mut GuestRegisters,
) {
    log::trace!(
        "Reflecting #VMEXIT {:#x} at {:#x} to level 1",
        vmcb02.control_area.exit_code.bits(),
        vmcb02.save_area.rip
    );

    // Report the level 2 state and the exit to level 1. `SVME` is forced on
    // in `02` only, level 1 gets back the value it set.
    //
    let svme = vmcb12.save_area.efer & EFER_SVME;
    vmcb12.save_area = vmcb02.save_area;
    vmcb12.save_area.efer = (vmcb12.save_area.efer & !EFER_SVME) | svme;
    vmcb12.save_area.rax = guest_regs.rax;

    let (control_02, control_12) = (&vmcb02.control_area, &mut vmcb12.control_area);
    control_12.exit_code = control_02.exit_code;
    control_12.exit_info1 = control_02.exit_info1;
    control_12.exit_info2 = control_02.exit_info2;
    control_12.exit_int_info = control_02.exit_int_info;
    control_12.nrip = control_02.nrip;
    control_12.event_inj = control_02.event_inj;

    // Resume level 1 after its `vmrun`, returning the address of its block
    // in rax like the hardware does.
    //
    vmcb02.save_area = *l1_state;
    vmcb02.save_area.rax = vmcb_guest_12_pa.as_u64();
    guest_regs.rax = vmcb_guest_12_pa.as_u64();

    let control_02 = &mut vmcb02.control_area;
    control_02.intercept_misc1 = vmcb01.control_area.intercept_misc1;
    control_02.intercept_misc2 = vmcb01.control_area.intercept_misc2;
    control_02.intercept_exception = vmcb01.control_area.intercept_exception;
    control_02.event_inj = 0;
    control_02.vmcb_clean = VmcbClean::empty();
    control_02.tlb_control = TlbControl::FLUSH_GUEST_TLB;
}
