use crate::svm::{
    cpu::Cpu,
    data::{guest::GuestRegisters, vcpu_data::VcpuData},
    events::EventInjection,
    vmexit::{nested, ExitType},
};

/// `vmrun` executed by level 1, either for the first time or to resume level
/// 2 after handling one of its exits.
pub fn handle_vmrun<C: Cpu>(
    cpu: &mut C, data: &mut VcpuData, guest_regs: &mut GuestRegisters,
) -> ExitType {
    let vmcb = data.current_vmcb();
    if vmcb.save_area.cpl != 0 {
        log::warn!("Denying vmrun from cpl {}", vmcb.save_area.cpl);
        EventInjection::gp().inject(vmcb);

        return ExitType::Continue;
    }

    nested::enter_level2(cpu, data, guest_regs)
}
