use crate::svm::{
    cpu::{Context, Cpu},
    segmentation::{descriptor_table, segment_access_right},
};
use x86::msr::{IA32_EFER, IA32_PAT};

// Size: 0x298
#[repr(C)]
#[derive(Copy, Clone)]
pub struct SaveArea {
    pub es_selector: u16,
    pub es_attrib: u16,
    pub es_limit: u32,
    pub es_base: u64,

    pub cs_selector: u16,
    pub cs_attrib: u16,
    pub cs_limit: u32,
    pub cs_base: u64,

    pub ss_selector: u16,
    pub ss_attrib: u16,
    pub ss_limit: u32,
    pub ss_base: u64,

    pub ds_selector: u16,
    pub ds_attrib: u16,
    pub ds_limit: u32,
    pub ds_base: u64,

    pub fs_selector: u16,
    pub fs_attrib: u16,
    pub fs_limit: u32,
    pub fs_base: u64,

    pub gs_selector: u16,
    pub gs_attrib: u16,
    pub gs_limit: u32,
    pub gs_base: u64,

    pub gdtr_selector: u16,
    pub gdtr_attrib: u16,
    pub gdtr_limit: u32,
    pub gdtr_base: u64,

    pub ldtr_selector: u16,
    pub ldtr_attrib: u16,
    pub ldtr_limit: u32,
    pub ldtr_base: u64,

    pub idtr_selector: u16,
    pub idtr_attrib: u16,
    pub idtr_limit: u32,
    pub idtr_base: u64,

    pub tr_selector: u16,
    pub tr_attrib: u16,
    pub tr_limit: u32,
    pub tr_base: u64,

    pub reserved1: [u8; 43],
    pub cpl: u8,
    pub reserved2: u32,
    pub efer: u64,
    pub reserved3: [u8; 112],
    pub cr4: u64,
    pub cr3: u64,
    pub cr0: u64,
    pub dr7: u64,
    pub dr6: u64,
    pub rflags: u64,
    pub rip: u64,
    pub reserved4: [u8; 88],
    pub rsp: u64,
    pub reserved5: [u8; 24],
    pub rax: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sf_mask: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub cr2: u64,
    pub reserved6: [u8; 32],
    pub gpat: u64,
    pub dbg_ctl: u64,
    pub br_from: u64,
    pub br_to: u64,
    pub last_excep_from: u64,
    pub last_excep_to: u64,
}
const_assert_eq!(core::mem::size_of::<SaveArea>(), 0x298);

impl SaveArea {
    /// Initializes the guest state from the current processor state, so that
    /// the guest continues exactly where `context` was captured.
    pub fn build<C: Cpu>(&mut self, cpu: &mut C, context: &Context) {
        // Like this: https://github.com/tandasat/SimpleSvm/blob/master/SimpleSvm/SimpleSvm.cpp#L1053
        let tables = cpu.descriptor_tables();

        self.gdtr_base = tables.gdt_base;
        self.gdtr_limit = tables.gdt_limit as _;

        self.idtr_base = tables.idt_base;
        self.idtr_limit = tables.idt_limit as _;

        self.cs_limit = cpu.segment_limit(context.seg_cs);
        self.ds_limit = cpu.segment_limit(context.seg_ds);
        self.es_limit = cpu.segment_limit(context.seg_es);
        self.ss_limit = cpu.segment_limit(context.seg_ss);

        self.cs_selector = context.seg_cs;
        self.ds_selector = context.seg_ds;
        self.es_selector = context.seg_es;
        self.ss_selector = context.seg_ss;

        let gdt = unsafe { descriptor_table(tables.gdt_base, tables.gdt_limit) };
        self.cs_attrib = segment_access_right(context.seg_cs, gdt);
        self.ds_attrib = segment_access_right(context.seg_ds, gdt);
        self.es_attrib = segment_access_right(context.seg_es, gdt);
        self.ss_attrib = segment_access_right(context.seg_ss, gdt);

        let control_registers = cpu.control_registers();
        self.gpat = cpu.read_msr(IA32_PAT);
        self.efer = cpu.read_msr(IA32_EFER);
        self.cr0 = control_registers.cr0;
        self.cr2 = control_registers.cr2;
        self.cr3 = control_registers.cr3;
        self.cr4 = control_registers.cr4;
        self.rflags = context.rflags;
        self.rsp = context.rsp;
        self.rip = context.rip;
        self.rax = context.registers.rax;
    }
}
