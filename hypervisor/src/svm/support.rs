//! Checks whether the current system is able to run the hypervisor.

use crate::{
    error::{HypervisorError, NestedPagingUnsupportedSnafu, SvmDisabledSnafu, SvmUnsupportedSnafu},
    svm::{
        cpu::Cpu,
        hypercall::{CPUID_HV_VENDOR_AND_MAX_FUNCTIONS, HYPERVISOR_VENDOR},
        msr::{SVM_MSR_VM_CR, SVM_VM_CR_SVMDIS},
    },
};
use snafu::ensure;

const CPUID_VENDOR: u32 = 0x0000_0000;
const CPUID_EXTENDED_FEATURES: u32 = 0x8000_0001;
const CPUID_SVM_FEATURES: u32 = 0x8000_000A;

/// `CPUID Fn8000_0001_ECX[SVM]`
const CPUID_ECX_SVM: u32 = 1 << 2;

/// `CPUID Fn8000_000A_EDX`
const CPUID_EDX_NP: u32 = 1 << 0;
const CPUID_EDX_SVML: u32 = 1 << 2;
const CPUID_EDX_VIRTUAL_VMLOAD_VMSAVE: u32 = 1 << 15;
const CPUID_EDX_VGIF: u32 = 1 << 16;

/// Optional SVM features the hypervisor makes use of.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SvmFeatures {
    pub virtual_vmload_vmsave: bool,
    pub virtual_gif: bool,
}

/// Checks whether svm is supported by the processor.
///
/// # Recommended Algorithm
/// This algorithm has been taken from section `15.4 Enabling SVM` from the AMD
/// manual.
/// ```pseudocode
/// if (CPUID Fn8000_0001_ECX[SVM] == 0)
///     return SVM_NOT_AVAIL;
///
/// if (VM_CR.SVMDIS == 0)
///     return SVM_ALLOWED;
///
/// if (CPUID Fn8000_000A_EDX[SVML]==0)
///     return SVM_DISABLED_AT_BIOS_NOT_UNLOCKABLE
///     // the user must change a platform firmware setting to enable SVM
/// else
///     return SVM_DISABLED_WITH_KEY;
///     // SVMLock may be unlockable; consult platform firmware or TPM to obtain the key.
/// ```
pub fn check_svm_support<C: Cpu>(cpu: &mut C) -> Result<SvmFeatures, HypervisorError> {
    // Check the vendor. The hypervisor only runs on AMD processors.
    //
    let vendor = cpu.cpuid(CPUID_VENDOR, 0);
    let is_amd = [vendor.ebx, vendor.edx, vendor.ecx] == [0x6874_7541, 0x6974_6e65, 0x444d_4163];
    if !is_amd {
        log::warn!("Processor is not an AMD processor");
    }
    ensure!(is_amd, SvmUnsupportedSnafu);

    // Check `CPUID Fn8000_0001_ECX[SVM] == 0`
    //
    let has_svm = cpu.cpuid(CPUID_EXTENDED_FEATURES, 0).ecx & CPUID_ECX_SVM != 0;
    if !has_svm {
        log::warn!("Processor does not support SVM");
    }
    ensure!(has_svm, SvmUnsupportedSnafu);

    // Check features that are used by this hypervisor
    //
    let svm_info = cpu.cpuid(CPUID_SVM_FEATURES, 0).edx;
    let features = SvmFeatures {
        virtual_vmload_vmsave: svm_info & CPUID_EDX_VIRTUAL_VMLOAD_VMSAVE != 0,
        virtual_gif: svm_info & CPUID_EDX_VGIF != 0,
    };
    log::info!("Nested paging: {}", svm_info & CPUID_EDX_NP != 0);
    log::info!("Virtual VMLOAD/VMSAVE: {}", features.virtual_vmload_vmsave);
    log::info!("Virtual GIF: {}", features.virtual_gif);

    ensure!(svm_info & CPUID_EDX_NP != 0, NestedPagingUnsupportedSnafu);

    // Check `VM_CR.SVMDIS == 0`
    //
    // See in the AMD Manual '15.30.1  VM_CR MSR (C001_0114h)'
    //
    let vm_cr = cpu.read_msr(SVM_MSR_VM_CR);
    if (vm_cr & SVM_VM_CR_SVMDIS) == 0 {
        return Ok(features);
    }

    // Check `CPUID Fn8000_000A_EDX[SVML]==0`
    //
    let unlockable = svm_info & CPUID_EDX_SVML != 0;
    if unlockable {
        log::warn!(
            "SVMLock may be unlockable; consult platform firmware or TPM to obtain the key."
        );
    } else {
        log::warn!(
            "SVM is locked at BIOS level. You must change a platform firmware setting to enable \
             SVM."
        );
    }

    SvmDisabledSnafu { unlockable }.fail()
}

/// Checks whether the current processor is already virtualized by this
/// hypervisor.
pub fn is_virtualized<C: Cpu>(cpu: &mut C) -> bool {
    let result = cpu.cpuid(CPUID_HV_VENDOR_AND_MAX_FUNCTIONS, 0);

    [result.ebx, result.ecx, result.edx] == HYPERVISOR_VENDOR
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::Status, test_utils::MockHardware};

    #[test]
    fn test_supported() {
        let mut cpu = MockHardware::new();

        let features = check_svm_support(&mut cpu).unwrap();
        assert!(features.virtual_gif);
        assert!(features.virtual_vmload_vmsave);
        assert!(!is_virtualized(&mut cpu));
    }

    #[test]
    fn test_not_amd() {
        let mut cpu = MockHardware::new();
        // "GenuineIntel"
        cpu.set_cpuid(0, 0x16, 0x756e_6547, 0x6c65_746e, 0x4965_6e69);

        let error = check_svm_support(&mut cpu).unwrap_err();
        assert!(matches!(error, HypervisorError::SvmUnsupported));
        assert_eq!(error.status(), Status::FeatureUnavailable);
    }

    #[test]
    fn test_no_nested_paging() {
        let mut cpu = MockHardware::new();
        cpu.set_cpuid(CPUID_SVM_FEATURES, 1, 0x40, 0, 0);

        assert!(matches!(
            check_svm_support(&mut cpu),
            Err(HypervisorError::NestedPagingUnsupported)
        ));
    }

    #[test]
    fn test_disabled_by_firmware() {
        let mut cpu = MockHardware::new();
        cpu.write_msr(SVM_MSR_VM_CR, SVM_VM_CR_SVMDIS);

        let error = check_svm_support(&mut cpu).unwrap_err();
        assert!(matches!(
            error,
            HypervisorError::SvmDisabled { unlockable: false }
        ));
        assert_eq!(error.status(), Status::FeatureUnavailable);
    }
}
