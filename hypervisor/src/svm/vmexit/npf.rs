use crate::svm::{
    cpu::{Cpu, FatalError},
    data::vcpu_data::VcpuData,
    vmcb::control_area::NptExitInfo,
};

/// The nested page table maps the first 512 GB one to one, so the guest can
/// only fault on addresses above that. There is nothing sensible to map
/// there.
pub fn handle_nested_page_fault<C: Cpu>(cpu: &mut C, data: &mut VcpuData) -> ! {
    let vmcb = data.current_vmcb();
    let guest_physical_address = vmcb.control_area.exit_info2;
    let exit_info = NptExitInfo::from_bits_truncate(vmcb.control_area.exit_info1);
    let rip = vmcb.save_area.rip;

    let platform = data.platform();
    let translation = data
        .shared_data()
        .nested_page_table
        .translate(platform, guest_physical_address);

    log::error!(
        "Nested page fault at {:#x} (rip: {:#x}, info: {:?}, translation: {:x?})",
        guest_physical_address,
        rip,
        exit_info,
        translation
    );

    cpu.debug_break();
    cpu.fatal(FatalError::NestedPageFault {
        guest_physical_address,
    })
}
