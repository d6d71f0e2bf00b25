use bitflags::bitflags;

// Size: 0x400
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ControlArea {
    pub intercept_cr_read: u16,               // +0x000
    pub intercept_cr_write: u16,              // +0x002
    pub intercept_dr_read: u16,               // +0x004
    pub intercept_dr_write: u16,              // +0x006
    pub intercept_exception: ExceptionVector, // +0x008

    pub intercept_misc1: InterceptMisc1,     // +0x00c
    pub intercept_misc2: InterceptMisc2,     // +0x010
    pub reserved1: [u8; 0x03c - 0x014],      // +0x014
    pub pause_filter_threshold: u16,         // +0x03c
    pub pause_filter_count: u16,             // +0x03e
    pub iopm_base_pa: u64,                   // +0x040
    pub msrpm_base_pa: u64,                  // +0x048
    pub tsc_offset: u64,                     // +0x050
    pub guest_asid: u32,                     // +0x058
    pub tlb_control: TlbControl,             // +0x05c
    pub vintr: u64,                          // +0x060
    pub interrupt_shadow: u64,               // +0x068
    pub exit_code: VmExitCode,               // +0x070
    pub exit_info1: u64,                     // +0x078
    pub exit_info2: u64,                     // +0x080
    pub exit_int_info: u64,                  // +0x088
    pub np_enable: NpEnable,                 // +0x090
    pub avic_apic_bar: u64,                  // +0x098
    pub guest_pa_of_ghcb: u64,               // +0x0a0
    pub event_inj: u64,                      // +0x0a8
    pub ncr3: u64,                           // +0x0b0
    pub lbr_virtualization_enable: u64,      // +0x0b8
    pub vmcb_clean: VmcbClean,               // +0x0c0
    pub nrip: u64,                           // +0x0c8
    pub num_of_bytes_fetched: u8,            // +0x0d0
    pub guest_instruction_bytes: [u8; 15],   // +0x0d1
    pub avic_apic_backing_page_pointer: u64, // +0x0e0
    pub reserved2: u64,                      // +0x0e8
    pub avic_logical_table_pointer: u64,     // +0x0f0
    pub avic_physical_table_pointer: u64,    // +0x0f8
    pub reserved3: u64,                      // +0x100
    pub vmcb_save_state_pointer: u64,        // +0x108
    pub reserved4: [u8; 0x400 - 0x110],      // +0x110
}
const_assert_eq!(core::mem::size_of::<ControlArea>(), 0x400);

/// `V_GIF_ENABLE` in the `vintr` field: the guest gets a virtual global interrupt flag, so `stgi`
/// and `clgi` no longer need to be intercepted.
pub const VINTR_VIRTUAL_GIF_ENABLE: u64 = 1 << 25;

/// Bit 1 of `lbr_virtualization_enable`: `vmload` and `vmsave` executed by the guest access guest
/// physical memory directly.
pub const VIRTUAL_VMLOAD_VMSAVE_ENABLE: u64 = 1 << 1;

bitflags! {
    /// See `15.15.3 VMCB Clean Field`
    ///
    /// **The hypervisor should write 0h to indicate that the VMCB is new or potentially inconsistent
    /// with the CPU's cached copy.** If any VMCB fields (excluding explicitly uncached fields) have
    /// been modified, all clean bits that are undefined (within the scope of the hypervisor) must be
    /// cleared to zero.
    pub struct VmcbClean: u64 {
        /// Intercepts: all the intercept vectors, TSC offset, Pause Filter Count
        const I = 1 << 0;

        /// IOMSRPM: IOPM_BASE, MSRPM_BASE
        const IOPM = 1 << 1;

        /// ASID
        const ASID = 1 << 2;

        /// V_TPR, V_IRQ, V_INTR_PRIO, V_IGN_TPR, V_INTR_MASKING, V_INTR_VECTOR (Offset 60h–67h)
        const TPR = 1 << 3;

        /// Nested Paging: NCR3, G_PAT
        const NP = 1 << 4;

        /// CR0, CR3, CR4, EFER
        const CR_X = 1 << 5;

        /// DR6, DR7
        const DR_X = 1 << 6;

        /// GDT/IDT Limit and Base
        const DT = 1 << 7;

        /// CS/DS/SS/ES Sel/Base/Limit/Attr, CPL
        const SEG = 1 << 8;

        /// CR2
        const CR2 = 1 << 9;

        /// DbgCtlMsr, br_from/to, lastint_from/to
        const LBR = 1 << 10;
    }

    pub struct TlbControl: u32 {
        /// 00h—Do nothing.
        const DO_NOTHING                        = 0;

        /// 01h—Flush entire TLB (all entries, all ASIDs) on VMRUN.
        /// Should only be used by legacy hypervisors.
        const FLUSH_ENTIRE_TLB                  = 1;

        /// 03h—Flush this guest’s TLB entries.
        const FLUSH_GUEST_TLB                   = 3;

        /// 07h—Flush this guest’s non-global TLB entries.
        const FLUSH_GUEST_NON_GLOBAL_TLB        = 7;
    }

    pub struct NpEnable: u64 {
        const NESTED_PAGING                     = 1 << 0;
        const SECURE_ENCRYPTED_VIRTUALIZATION   = 1 << 1;
        const ENCRYPTED_STATE                   = 1 << 2;
    }

    /// One bit per exception vector.
    pub struct ExceptionVector: u32 {
        const DIVIDE_ERROR = 1 << 0;
        const DEBUG = 1 << 1;
        const BREAKPOINT = 1 << 3;
        const INVALID_OPCODE = 1 << 6;
        const GENERAL_PROTECTION = 1 << 13;
        const PAGE_FAULT = 1 << 14;
    }

    pub struct InterceptMisc1: u32 {
        const INTERCEPT_INTR = 1 << 0;
        const INTERCEPT_NMI = 1 << 1;
        const INTERCEPT_SMI = 1 << 2;
        const INTERCEPT_INIT = 1 << 3;
        const INTERCEPT_VINTR = 1 << 4;
        const INTERCEPT_CR0 = 1 << 5;
        const INTERCEPT_RDTSC = 1 << 14;
        const INTERCEPT_RDPMC = 1 << 15;
        const INTERCEPT_CPUID = 1 << 18;
        const INTERCEPT_HLT = 1 << 24;
        const INTERCEPT_INVLPG = 1 << 25;
        const INTERCEPT_IOIO_PROT = 1 << 27;
        const INTERCEPT_MSR_PROT = 1 << 28;
        const INTERCEPT_SHUTDOWN = 1 << 31;
    }

    pub struct InterceptMisc2: u32 {
        const INTERCEPT_VMRUN = 1 << 0;
        const INTERCEPT_VMMCALL = 1 << 1;
        const INTERCEPT_VMLOAD = 1 << 2;
        const INTERCEPT_VMSAVE = 1 << 3;
        const INTERCEPT_STGI = 1 << 4;
        const INTERCEPT_CLGI = 1 << 5;
        const INTERCEPT_SKINIT = 1 << 6;
        const INTERCEPT_RDTSCP = 1 << 7;
        const INTERCEPT_XSETBV = 1 << 13;
    }

    /// See `Appendix C SVM Intercept Exit Codes`.
    pub struct VmExitCode: u64  {
        const VMEXIT_EXCEPTION_BP = 67;
        const VMEXIT_EXCEPTION_UD = 70;
        const VMEXIT_EXCEPTION_GP = 77;
        const VMEXIT_INTR = 96;
        const VMEXIT_NMI = 97;
        const VMEXIT_RDTSC = 110;
        const VMEXIT_CPUID = 114;
        const VMEXIT_HLT = 120;
        const VMEXIT_IOIO = 123;
        const VMEXIT_MSR = 124;
        const VMEXIT_SHUTDOWN = 127;
        const VMEXIT_VMRUN = 128;
        const VMEXIT_VMMCALL = 129;
        const VMEXIT_VMLOAD = 130;
        const VMEXIT_VMSAVE = 131;
        const VMEXIT_STGI = 132;
        const VMEXIT_CLGI = 133;
        const VMEXIT_NPF = 1024;
        const VMEXIT_INVALID = u64::MAX;
    }

    /// See "Nested versus Guest Page Faults, Fault Ordering"
    pub struct NptExitInfo: u64 {
        /// Bit 0 (P)—cleared to 0 if the nested page was not present, 1 otherwise
        const PRESENT           = 1 << 0;

        /// Bit 1 (RW)—set to 1 if the nested page table level access was a write.
        const RW                = 1 << 1;

        /// Bit 2 (US)—set to 1 if the nested page table level access was a user access.
        const US                = 1 << 2;

        /// Bit 3 (RSV)—set to 1 if reserved bits were set in the corresponding nested page table entry
        const RSV               = 1 << 3;

        /// Bit 4 (ID)—set to 1 if the nested page table level access was a code read.
        const ID                = 1 << 4;

        /// Bit 32—set to 1 if nested page fault occurred while translating the guest’s final physical address
        const GUEST_PA                    = 1 << 32;

        /// Bit 33—set to 1 if nested page fault occurred while translating the guest page tables
        const GUEST_PAGE_TABLES           = 1 << 33;
    }
}
