//! Requests the guest can make to the hypervisor: the hypervisor CPUID leaves,
//! the unload back-channel and `vmmcall`.

use crate::svm::{cpu::CpuIdResult, data::guest::GuestRegisters};

pub const CPUID_FEATURE_IDENTIFIERS: u32 = 0x0000_0001;
pub const CPUID_HV_VENDOR_AND_MAX_FUNCTIONS: u32 = 0x4000_0000;
pub const CPUID_HV_INTERFACE: u32 = 0x4000_0001;
pub const CPUID_HV_MAX: u32 = CPUID_HV_INTERFACE;

/// `CPUID Fn0000_0001_ECX[31]`, reserved for use by hypervisors.
pub const CPUID_FN0000_0001_ECX_HYPERVISOR_PRESENT: u32 = 1 << 31;

/// "SvmNestedHv " in `ebx`, `ecx`, `edx` order.
pub const HYPERVISOR_VENDOR: [u32; 3] = [
    u32::from_le_bytes(*b"SvmN"),
    u32::from_le_bytes(*b"este"),
    u32::from_le_bytes(*b"dHv "),
];

/// "Hv#0", meaning the hypervisor does not implement the Microsoft interface.
pub const HYPERVISOR_INTERFACE: u32 = u32::from_le_bytes(*b"Hv#0");

pub const CPUID_UNLOAD_LEAF: u32 = 0x4141_4141;
pub const CPUID_UNLOAD_SUBLEAF: u32 = 0x4141_4141;

/// Returned in `ecx` once the processor left the hypervisor.
pub const UNLOAD_MAGIC: u32 = 0x4E53_564D;

/// A `cpuid` executed by the guest, decoded once at the dispatcher boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CpuidRequest {
    FeatureIdentifiers,
    VendorAndMaxFunctions,
    HypervisorInterface,
    Unload,
    Passthrough { leaf: u32, subleaf: u32 },
}

impl CpuidRequest {
    pub fn decode(leaf: u32, subleaf: u32) -> Self {
        match (leaf, subleaf) {
            (CPUID_FEATURE_IDENTIFIERS, _) => CpuidRequest::FeatureIdentifiers,
            (CPUID_HV_VENDOR_AND_MAX_FUNCTIONS, _) => CpuidRequest::VendorAndMaxFunctions,
            (CPUID_HV_INTERFACE, _) => CpuidRequest::HypervisorInterface,
            (CPUID_UNLOAD_LEAF, CPUID_UNLOAD_SUBLEAF) => CpuidRequest::Unload,
            (leaf, subleaf) => CpuidRequest::Passthrough { leaf, subleaf },
        }
    }

    pub fn from_registers(regs: &GuestRegisters) -> Self {
        Self::decode(regs.rax as u32, regs.rcx as u32)
    }
}

/// Register values handed back to the code that requested the unload. The
/// launch loop switches to `resume_rsp`, stores [`UNLOAD_MAGIC`] in `ecx` and
/// jumps to `resume_rip`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnloadResponse {
    pub vcpu_data: u64,
    pub resume_rip: u64,
    pub resume_rsp: u64,
}

impl UnloadResponse {
    pub fn write(&self, regs: &mut GuestRegisters) {
        regs.rax = self.vcpu_data as u32 as u64;
        regs.rdx = self.vcpu_data >> 32;
        regs.rbx = self.resume_rip;
        regs.rcx = self.resume_rsp;
    }

    /// Returns the address of the released processor data, if `result` is
    /// the answer to an unload request.
    pub fn from_cpuid(result: &CpuIdResult) -> Option<u64> {
        if result.ecx != UNLOAD_MAGIC {
            return None;
        }

        Some((result.edx as u64) << 32 | result.eax as u64)
    }
}

/// `vmmcall` numbers, passed in `rcx`.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HypercallNumber {
    TerminateVmm = 0,
    PingVmm = 1,
    EnablePageShadowing = 2,
    DisablePageShadowing = 3,
    HookSyscall = 4,
    UnhookSyscall = 5,
}

impl TryFrom<u64> for HypercallNumber {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => HypercallNumber::TerminateVmm,
            1 => HypercallNumber::PingVmm,
            2 => HypercallNumber::EnablePageShadowing,
            3 => HypercallNumber::DisablePageShadowing,
            4 => HypercallNumber::HookSyscall,
            5 => HypercallNumber::UnhookSyscall,
            _ => return Err(value),
        })
    }
}
