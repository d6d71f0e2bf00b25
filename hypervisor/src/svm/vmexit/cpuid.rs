use crate::svm::{
    cpu::{Cpu, CpuIdResult},
    data::{guest::GuestRegisters, nested::CpuMode, vcpu_data::VcpuData},
    hypercall::{
        CpuidRequest, CPUID_FEATURE_IDENTIFIERS, CPUID_FN0000_0001_ECX_HYPERVISOR_PRESENT,
        CPUID_HV_MAX, CPUID_UNLOAD_LEAF, CPUID_UNLOAD_SUBLEAF, HYPERVISOR_INTERFACE,
        HYPERVISOR_VENDOR,
    },
    vmexit::ExitType,
};

pub fn handle_cpuid<C: Cpu>(
    cpu: &mut C, data: &mut VcpuData, guest_regs: &mut GuestRegisters,
) -> ExitType {
    let request = CpuidRequest::from_registers(guest_regs);

    // Unloading is only allowed from kernel mode and only while level 1 has not
    // started to virtualize on its own.
    //
    if request == CpuidRequest::Unload {
        let cpl = data.current_vmcb().save_area.cpl;
        if cpl == 0 && data.cpu_mode() == CpuMode::ProtectedMode {
            return ExitType::ExitHypervisor;
        }

        log::warn!("Ignoring unload request (cpl: {}, mode: {:?})", cpl, data.cpu_mode());
    }

    let result = emulate_cpuid(cpu, request);

    guest_regs.rax = result.eax as u64;
    guest_regs.rbx = result.ebx as u64;
    guest_regs.rcx = result.ecx as u64;
    guest_regs.rdx = result.edx as u64;

    ExitType::IncrementRIP
}

/// Executes `cpuid` on behalf of the guest.
pub fn emulate_cpuid<C: Cpu>(cpu: &mut C, request: CpuidRequest) -> CpuIdResult {
    match request {
        CpuidRequest::FeatureIdentifiers => {
            let mut result = cpu.cpuid(CPUID_FEATURE_IDENTIFIERS, 0);

            // Indicate presence of a hypervisor by setting the bit that are
            // reserved for use by hypervisor to indicate guest status.
            result.ecx |= CPUID_FN0000_0001_ECX_HYPERVISOR_PRESENT;
            result
        }
        CpuidRequest::VendorAndMaxFunctions => {
            let [ebx, ecx, edx] = HYPERVISOR_VENDOR;

            CpuIdResult {
                eax: CPUID_HV_MAX,
                ebx,
                ecx,
                edx,
            }
        }
        CpuidRequest::HypervisorInterface => {
            // Return non Hv#1 value. This indicate that our hypervisor does NOT
            // conform to the Microsoft hypervisor interface.
            CpuIdResult {
                eax: HYPERVISOR_INTERFACE,
                ebx: 0,
                ecx: 0,
                edx: 0,
            }
        }
        CpuidRequest::Unload => cpu.cpuid(CPUID_UNLOAD_LEAF, CPUID_UNLOAD_SUBLEAF),
        CpuidRequest::Passthrough { leaf, subleaf } => cpu.cpuid(leaf, subleaf),
    }
}
