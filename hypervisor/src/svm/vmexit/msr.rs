use crate::svm::{
    cpu::Cpu,
    data::{
        guest::GuestRegisters,
        msr_bitmap::{MsrAccess, MsrBitmap},
        nested::VmxMode,
        vcpu_data::VcpuData,
    },
    events::EventInjection,
    msr::SVM_MSR_VM_HSAVE_PA,
    vmexit::ExitType,
};
use x86::msr::{IA32_EFER, IA32_LSTAR};

pub fn handle_msr<C: Cpu>(
    cpu: &mut C, data: &mut VcpuData, guest_regs: &mut GuestRegisters,
) -> ExitType {
    let msr = guest_regs.rcx as u32;
    let access = MsrAccess::from_exit_info(data.current_vmcb().control_area.exit_info1);
    let in_level2 = data.vmx_mode() == Some(VmxMode::GuestMode);

    match (msr, access) {
        (IA32_EFER, MsrAccess::Read) => {
            let value = if in_level2 {
                data.current_vmcb().save_area.efer
            } else {
                data.nested.guest_efer
            };

            guest_regs.set_edx_eax(value);
        }
        (IA32_EFER, MsrAccess::Write) => {
            // Clearing EFER.SVME would turn off SVM underneath the
            // hypervisor, so EFER is read-only for the guest.
            //
            log::warn!("Denying EFER write: {:#x}", guest_regs.edx_eax());
            EventInjection::gp().inject(data.current_vmcb());

            return ExitType::Continue;
        }
        (IA32_LSTAR, MsrAccess::Read) => {
            // `vmsave` stored the guest's value on the `#VMEXIT`.
            guest_regs.set_edx_eax(data.current_vmcb().save_area.lstar);
        }
        (IA32_LSTAR, MsrAccess::Write) => {
            data.current_vmcb().save_area.lstar = guest_regs.edx_eax();
        }
        (SVM_MSR_VM_HSAVE_PA, MsrAccess::Read) => {
            guest_regs.set_edx_eax(data.nested.guest_hsave_pa);
        }
        (SVM_MSR_VM_HSAVE_PA, MsrAccess::Write) => {
            data.nested.guest_hsave_pa = guest_regs.edx_eax();
        }
        (msr, _) if !MsrBitmap::is_mapped(msr) => {
            // Accessing an unimplemented MSR on the host would raise #GP
            // inside the hypervisor. Raise it in the guest instead.
            //
            log::warn!("Injecting #GP for {:?} of msr {:#x}", access, msr);
            EventInjection::gp().inject(data.current_vmcb());

            return ExitType::Continue;
        }
        (msr, MsrAccess::Read) => guest_regs.set_edx_eax(cpu.read_msr(msr)),
        (msr, MsrAccess::Write) => cpu.write_msr(msr, guest_regs.edx_eax()),
    }

    ExitType::IncrementRIP
}
