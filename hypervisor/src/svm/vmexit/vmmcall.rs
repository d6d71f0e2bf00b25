use crate::svm::{
    data::{guest::GuestRegisters, vcpu_data::VcpuData},
    events::EventInjection,
    hypercall::HypercallNumber,
    vmexit::ExitType,
};

pub fn handle_vmmcall(data: &mut VcpuData, guest_regs: &mut GuestRegisters) -> ExitType {
    let vmcb = data.current_vmcb();

    // Hypercalls are only allowed from kernel mode.
    //
    if vmcb.save_area.cpl != 0 {
        log::warn!("Denying vmmcall from cpl {}", vmcb.save_area.cpl);
        EventInjection::gp().inject(vmcb);

        return ExitType::Continue;
    }

    match HypercallNumber::try_from(guest_regs.rcx) {
        Ok(HypercallNumber::TerminateVmm | HypercallNumber::PingVmm) => {
            guest_regs.rax = 0;
            ExitType::IncrementRIP
        }
        Ok(number) => {
            log::warn!("Hypercall {:?} is not supported", number);
            EventInjection::gp().inject(vmcb);

            ExitType::Continue
        }
        Err(number) => {
            log::warn!("Invalid hypercall number: {:#x}", number);
            EventInjection::gp().inject(vmcb);

            ExitType::Continue
        }
    }
}
