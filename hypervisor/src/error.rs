use crate::platform::MemoryKind;
use snafu::Snafu;

/// Errors reported by the setup and teardown paths.
///
/// Nothing on the `#VMEXIT` path returns one of these: the exit handlers
/// either resume the guest or halt through [`crate::svm::cpu::Cpu::fatal`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HypervisorError {
    #[snafu(display("Processor is not an AMD processor or does not support SVM"))]
    SvmUnsupported,

    #[snafu(display("Processor does not support nested paging"))]
    NestedPagingUnsupported,

    #[snafu(display("SVM is disabled by the platform firmware (unlockable: {unlockable})"))]
    SvmDisabled { unlockable: bool },

    #[snafu(display("Failed to allocate {size:#x} bytes of {kind:?} memory"))]
    AllocationFailed { size: usize, kind: MemoryKind },

    #[snafu(display("Failed to switch to processor {index}"))]
    ProcessorSwitchFailed { index: u32 },

    #[snafu(display("Processor {index} did not enter the guest"))]
    LaunchFailed { index: u32 },

    #[snafu(display("Failed to register the power state callback"))]
    PowerCallbackRegistrationFailed,

    #[snafu(display("A power state callback is already registered"))]
    PowerCallbackAlreadyRegistered,
}

/// Coarse status reported to whoever invoked a lifecycle entry point.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    ResourceExhausted,
    FeatureUnavailable,
    Unsuccessful,
}

impl HypervisorError {
    pub fn status(&self) -> Status {
        match self {
            HypervisorError::SvmUnsupported
            | HypervisorError::NestedPagingUnsupported
            | HypervisorError::SvmDisabled { .. } => Status::FeatureUnavailable,
            HypervisorError::AllocationFailed { .. } => Status::ResourceExhausted,
            HypervisorError::ProcessorSwitchFailed { .. }
            | HypervisorError::LaunchFailed { .. }
            | HypervisorError::PowerCallbackRegistrationFailed
            | HypervisorError::PowerCallbackAlreadyRegistered => Status::Unsuccessful,
        }
    }
}
