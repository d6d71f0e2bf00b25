//! Instruction level operations the hypervisor performs on the processor.
//!
//! The setup path and the `#VMEXIT` handlers only talk to the processor
//! through [`Cpu`], so they can be exercised without SVM hardware.

use crate::{svm::data::guest::GuestRegisters, utils::addresses::PhysicalAddress};
pub use x86::cpuid::CpuIdResult;

/// Execution context captured right before the guest is launched. The guest
/// starts executing with exactly this state.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Context {
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub seg_cs: u16,
    pub seg_ds: u16,
    pub seg_es: u16,
    pub seg_ss: u16,

    /// General purpose registers at the time of the capture. The launch loop
    /// loads them before the first `vmrun`.
    pub registers: GuestRegisters,
}
const_assert_eq!(core::mem::size_of::<Context>(), 0xa0);

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ControlRegisters {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct DescriptorTables {
    pub gdt_base: u64,
    pub gdt_limit: u16,
    pub idt_base: u64,
    pub idt_limit: u16,
}

/// Conditions under which the hypervisor refuses to resume the guest.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// A `#VMEXIT` reason without a handler at the current nesting level.
    UnexpectedExit { code: u64, nested: bool },

    /// The marker at the top of the host stack has been overwritten.
    StackCorruption { marker: u64 },

    /// The identity mapped nested page table faulted.
    NestedPageFault { guest_physical_address: u64 },
}

impl FatalError {
    /// Bug check code reported to the operating system.
    pub fn code(&self) -> u32 {
        match self {
            FatalError::UnexpectedExit { .. } => 0x5356_0001,
            FatalError::StackCorruption { .. } => 0x5356_0002,
            FatalError::NestedPageFault { .. } => 0x5356_0003,
        }
    }
}

pub trait Cpu {
    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> CpuIdResult;

    fn read_msr(&mut self, msr: u32) -> u64;
    fn write_msr(&mut self, msr: u32, value: u64);

    fn vmload(&mut self, vmcb_pa: PhysicalAddress);
    fn vmsave(&mut self, vmcb_pa: PhysicalAddress);

    /// `cli`
    fn disable_interrupts(&mut self);

    /// `stgi`
    fn set_global_interrupt_flag(&mut self);

    /// `push value; popfq`
    fn write_rflags(&mut self, rflags: u64);

    fn control_registers(&mut self) -> ControlRegisters;
    fn descriptor_tables(&mut self) -> DescriptorTables;

    /// `lsl`
    fn segment_limit(&mut self, selector: u16) -> u32;

    /// Captures the current execution context into `context`.
    ///
    /// Returns a second time once [`Cpu::launch`] entered the guest with that
    /// context. The call has to be made from the frame that calls `launch`,
    /// so implementations must be inlined into their caller.
    fn capture_context(&mut self, context: &mut Context);

    /// Switches to the host stack at `host_rsp`, loads the registers of
    /// `context` and enters the guest. Does not return when the guest is
    /// entered: execution continues behind [`Cpu::capture_context`] instead.
    fn launch(&mut self, host_rsp: u64, context: &Context);

    fn debug_break(&mut self);

    /// Halts the system.
    fn fatal(&mut self, error: FatalError) -> !;
}
