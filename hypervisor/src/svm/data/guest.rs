/// General purpose registers of the guest, in the order the launch loop pushes
/// them. `rax` is only valid after it has been copied from the VMCB.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct GuestRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}
const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 16 * 8);

impl GuestRegisters {
    /// Value of `edx:eax`, as used by `wrmsr`.
    pub fn edx_eax(&self) -> u64 {
        (self.rdx as u32 as u64) << 32 | self.rax as u32 as u64
    }

    /// Splits `value` into `edx:eax`, as returned by `rdmsr`.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.rax = (value as u32) as u64;
        self.rdx = (value >> 32) as u64;
    }
}
