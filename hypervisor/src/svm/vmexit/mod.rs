//! `#VMEXIT` dispatcher.
//!
//! Entered from the launch loop with the processor data of the current
//! processor and the guest registers it pushed. Every exit either resumes the
//! guest, leaves the hypervisor on an unload request or halts the system.

use crate::svm::{
    cpu::{Cpu, FatalError},
    data::{guest::GuestRegisters, vcpu_data::VcpuData},
    hypercall::UnloadResponse,
    msr::EFER_SVME,
    vmcb::control_area::{TlbControl, VmExitCode},
};
use x86::msr::IA32_EFER;

pub mod breakpoint;
pub mod cpuid;
pub mod msr;
pub mod nested;
pub mod npf;
pub mod vmmcall;
pub mod vmrun;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitType {
    /// Leave the hypervisor and resume the guest natively.
    ExitHypervisor,

    /// The instruction has been emulated, continue after it.
    IncrementRIP,

    /// Resume the guest at the current `rip` of the current block, e.g.
    /// because an exception has been injected.
    Continue,
}

/// Handles a single `#VMEXIT`. Returns `true` if the hypervisor has to be left.
pub fn handle_vmexit<C: Cpu>(
    cpu: &mut C, data: &mut VcpuData, guest_regs: &mut GuestRegisters,
) -> bool {
    // Load host state that is not loaded on #VMEXIT.
    //
    cpu.vmload(data.exit_host_vmcb_pa());
    check_stack(cpu, data);

    // Guest's RAX is overwritten by the host's value on #VMEXIT and saved in
    // the VMCB instead. Reflect the guest RAX to the context.
    //
    let vmcb = data.current_vmcb();
    guest_regs.rax = vmcb.save_area.rax;
    let exit_code = vmcb.control_area.exit_code;

    let exit_type = match data.vmx_mode() {
        None => handle_direct(cpu, data, guest_regs, exit_code),
        Some(mode) => {
            // Flushes requested for the previous `vmrun` must not be repeated.
            data.current_vmcb().control_area.tlb_control = TlbControl::DO_NOTHING;

            nested::handle_exit(cpu, data, guest_regs, mode, exit_code)
        }
    };

    // Handle the exit status of the vmexit handlers
    //
    match exit_type {
        ExitType::ExitHypervisor => exit_hypervisor(cpu, data, guest_regs),
        ExitType::IncrementRIP => {
            // Reflect potentially updated guest's RAX to VMCB. Again, unlike other GPRs,
            // RAX is loaded from VMCB on VMRUN. Afterwards, advance RIP to "complete" the
            // instruction.
            //
            let vmcb = data.current_vmcb();
            vmcb.save_area.rax = guest_regs.rax;
            vmcb.skip_instruction();
        }
        ExitType::Continue => data.current_vmcb().save_area.rax = guest_regs.rax,
    }

    check_stack(cpu, data);

    exit_type == ExitType::ExitHypervisor
}

fn handle_direct<C: Cpu>(
    cpu: &mut C, data: &mut VcpuData, guest_regs: &mut GuestRegisters, exit_code: VmExitCode,
) -> ExitType {
    match exit_code {
        VmExitCode::VMEXIT_CPUID => cpuid::handle_cpuid(cpu, data, guest_regs),
        VmExitCode::VMEXIT_MSR => msr::handle_msr(cpu, data, guest_regs),
        VmExitCode::VMEXIT_VMRUN => vmrun::handle_vmrun(cpu, data, guest_regs),
        VmExitCode::VMEXIT_VMMCALL => vmmcall::handle_vmmcall(data, guest_regs),
        VmExitCode::VMEXIT_NPF => npf::handle_nested_page_fault(cpu, data),
        _ => unexpected_exit(cpu, exit_code, false),
    }
}

/// Invalid #VMEXIT. This should never happen.
pub(crate) fn unexpected_exit<C: Cpu>(cpu: &mut C, exit_code: VmExitCode, nested: bool) -> ! {
    log::error!(
        "Unhandled #VMEXIT {:#x} (nested: {})",
        exit_code.bits(),
        nested
    );

    cpu.debug_break();
    cpu.fatal(FatalError::UnexpectedExit {
        code: exit_code.bits(),
        nested,
    })
}

fn check_stack<C: Cpu>(cpu: &mut C, data: &VcpuData) {
    if !data.is_stack_intact() {
        let marker = data.host_stack_layout.reserved_1;
        log::error!("Host stack is corrupted, marker: {:#x}", marker);

        cpu.fatal(FatalError::StackCorruption { marker });
    }
}

fn exit_hypervisor<C: Cpu>(cpu: &mut C, data: &mut VcpuData, guest_regs: &mut GuestRegisters) {
    log::trace!("Leaving the hypervisor");

    // Set return values of cpuid as follows:
    // - rax, rdx = address of the processor data
    // - rbx = address to return
    // - rcx = stack pointer to restore
    //
    UnloadResponse {
        vcpu_data: data as *mut VcpuData as u64,
        resume_rip: data.guest_vmcb.control_area.nrip,
        resume_rsp: data.guest_vmcb.save_area.rsp,
    }
    .write(guest_regs);

    // Load guest state (currently host state is loaded)
    //
    cpu.vmload(data.guest_vmcb_pa());

    // Set the global interrupt flag (GIF) but still disable interrupts by
    // clearing IF. GIF must be set to return to the normal execution, but
    // interruptions are not desirable until SVM is disabled as it would
    // execute random kernel-code in the host context.
    //
    cpu.disable_interrupts();
    cpu.set_global_interrupt_flag();

    // Disable svm.
    //
    let efer = cpu.read_msr(IA32_EFER) & !EFER_SVME;
    cpu.write_msr(IA32_EFER, efer);

    // Restore guest eflags.
    //
    cpu.write_rflags(data.guest_vmcb.save_area.rflags);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        svm::{
            events::EventInjection,
            hypercall::{CPUID_UNLOAD_LEAF, CPUID_UNLOAD_SUBLEAF, HYPERVISOR_VENDOR},
            vmcb::Vmcb,
        },
        test_utils::{GuestExit, MockHardware, Op, TestVcpu},
    };
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_cpuid_vendor_and_present_bit() {
        let mut vcpu = TestVcpu::new();

        let regs = vcpu.run(GuestExit::cpuid(0x4000_0000, 0));
        assert_eq!(regs.rax, 0x4000_0001);
        assert_eq!([regs.rbx as u32, regs.rcx as u32, regs.rdx as u32], HYPERVISOR_VENDOR);

        let regs = vcpu.run(GuestExit::cpuid(1, 0));
        assert_ne!(regs.rcx & (1 << 31), 0);
    }

    #[test]
    fn test_rip_is_advanced() {
        let mut vcpu = TestVcpu::new();
        vcpu.data.guest_vmcb.save_area.rip = 0x1000;

        vcpu.run(GuestExit::cpuid(0, 0));

        assert_eq!(vcpu.data.guest_vmcb.save_area.rip, 0x1002);
        assert_eq!(vcpu.data.guest_vmcb.save_area.rax, 0x10);
    }

    #[test]
    fn test_host_state_is_loaded_first() {
        let mut vcpu = TestVcpu::new();
        let host_vmcb_pa = vcpu.data.host_stack_layout.host_vmcb_pa;

        vcpu.run(GuestExit::cpuid(0, 0));

        assert_eq!(vcpu.cpu.ops().first(), Some(&Op::Vmload(host_vmcb_pa)));
    }

    #[test]
    fn test_unload() {
        let mut vcpu = TestVcpu::new();
        vcpu.data.guest_vmcb.save_area.rsp = 0x7ff0;
        vcpu.data.guest_vmcb.save_area.rflags = 0x202;
        vcpu.cpu.write_msr(IA32_EFER, 0xd01 | EFER_SVME);

        let mut exit = GuestExit::cpuid(CPUID_UNLOAD_LEAF, CPUID_UNLOAD_SUBLEAF);
        exit.rip = Some(0x1000);
        let (leave, regs) = vcpu.dispatch(exit);
        assert!(leave);

        let data_address = &*vcpu.data as *const VcpuData as u64;
        assert_eq!(regs.rax, data_address & 0xffff_ffff);
        assert_eq!(regs.rdx, data_address >> 32);
        assert_eq!(regs.rbx, 0x1002);
        assert_eq!(regs.rcx, 0x7ff0);
        assert_eq!(vcpu.cpu.read_msr(IA32_EFER), 0xd01);

        let guest_vmcb_pa = vcpu.data.guest_vmcb_pa().as_u64();
        let ops = vcpu.cpu.ops();
        let tail = &ops[ops.len() - 5..];
        assert_eq!(tail[0], Op::Vmload(guest_vmcb_pa));
        assert_eq!(tail[1], Op::Cli);
        assert_eq!(tail[2], Op::Stgi);
        assert_eq!(tail[3], Op::WriteMsr(IA32_EFER, 0xd01));
        assert_eq!(tail[4], Op::WriteRflags(0x202));
    }

    #[test]
    fn test_unload_ignored_outside_ring0() {
        let mut vcpu = TestVcpu::new();

        let mut exit = GuestExit::cpuid(CPUID_UNLOAD_LEAF, CPUID_UNLOAD_SUBLEAF);
        exit.cpl = 3;
        let (leave, _) = vcpu.dispatch(exit);

        assert!(!leave);
        assert!(!vcpu.cpu.ops().contains(&Op::Stgi));
    }

    #[test]
    #[should_panic(expected = "UnexpectedExit")]
    fn test_unknown_exit_halts() {
        let mut vcpu = TestVcpu::new();
        vcpu.run(GuestExit::new(VmExitCode::VMEXIT_RDTSC));
    }

    #[test]
    fn test_unknown_exit_is_not_resumed() {
        let mut vcpu = TestVcpu::new();
        vcpu.data.guest_vmcb.save_area.rip = 0x1000;

        let result = catch_unwind(AssertUnwindSafe(|| {
            vcpu.run(GuestExit::new(VmExitCode::VMEXIT_HLT));
        }));

        assert!(result.is_err());
        assert_eq!(vcpu.data.guest_vmcb.save_area.rip, 0x1000);
        assert!(vcpu.cpu.ops().contains(&Op::DebugBreak));
    }

    #[test]
    fn test_stack_corruption_detected_before_mutation() {
        let mut vcpu = TestVcpu::new();
        vcpu.data.host_stack_layout.reserved_1 = 0x4141_4141;
        vcpu.data.guest_vmcb.save_area.rip = 0x1000;
        let event_inj = vcpu.data.guest_vmcb.control_area.event_inj;

        // A write to EFER would inject #GP if it got handled.
        let result = catch_unwind(AssertUnwindSafe(|| {
            vcpu.run(GuestExit::msr_write(IA32_EFER, 0xd01));
        }));

        let message = result.unwrap_err();
        let message = message.downcast_ref::<String>().unwrap();
        assert!(message.contains("StackCorruption"));
        assert_eq!(vcpu.data.guest_vmcb.save_area.rip, 0x1000);
        assert_eq!(vcpu.data.guest_vmcb.control_area.event_inj, event_inj);
        assert_eq!(vcpu.data.guest_vmcb.save_area.rax, 0xd01);
    }

    #[test]
    fn test_injected_exception_does_not_advance_rip() {
        let mut vcpu = TestVcpu::new();
        vcpu.data.guest_vmcb.save_area.rip = 0x1000;

        vcpu.run(GuestExit::msr_write(IA32_EFER, 0xd01));

        let vmcb: &Vmcb = &vcpu.data.guest_vmcb;
        assert_eq!(vmcb.save_area.rip, 0x1000);
        assert_eq!(vmcb.control_area.event_inj, EventInjection::gp().0);
    }

    #[test]
    fn test_nested_page_fault_halts() {
        let mut vcpu = TestVcpu::new();
        let mut exit = GuestExit::new(VmExitCode::VMEXIT_NPF);
        exit.exit_info2 = 0x80_0000_0000;

        let result = catch_unwind(AssertUnwindSafe(|| {
            vcpu.run(exit);
        }));

        let message = result.unwrap_err();
        assert!(message
            .downcast_ref::<String>()
            .unwrap()
            .contains("NestedPageFault"));
        assert!(vcpu.cpu.ops().contains(&Op::DebugBreak));
    }

    #[test]
    fn test_mock_hardware_is_not_virtualized() {
        let mut cpu = MockHardware::new();
        assert_eq!(cpu.cpuid(0x4000_0000, 0).ebx, 0);
    }
}
