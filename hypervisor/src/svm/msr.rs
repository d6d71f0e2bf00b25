//! MSRs and bits that are not exported by the `x86` crate.

/// VM_CR, see `15.30.1 VM_CR MSR (C001_0114h)`.
pub const SVM_MSR_VM_CR: u32 = 0xC001_0114;
pub const SVM_VM_CR_SVMDIS: u64 = 1 << 4;

/// Physical address of the host state-save area used by `vmrun`.
pub const SVM_MSR_VM_HSAVE_PA: u32 = 0xC001_0117;

pub const EFER_SVME: u64 = 1 << 12;
