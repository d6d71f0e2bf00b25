use crate::svm::{data::vcpu_data::VcpuData, events::EventInjection, vmexit::ExitType};

/// Hands an intercepted `int3` back to the guest that executed it.
pub fn handle_breakpoint(data: &mut VcpuData) -> ExitType {
    let vmcb = data.current_vmcb();
    log::trace!("Re-injecting #BP at {:#x}", vmcb.save_area.rip);

    // `#BP` is a trap: the saved rip has to point after the `int3`.
    EventInjection::bp().inject(vmcb);

    ExitType::IncrementRIP
}
