//! [`Cpu`] backed by the actual processor.

use crate::{
    svm::{
        cpu::{Context, ControlRegisters, Cpu, CpuIdResult, DescriptorTables, FatalError},
        data::{
            guest::GuestRegisters,
            vcpu_data::{HostStackLayout, VcpuData},
        },
        hypercall::UNLOAD_MAGIC,
        vmexit::handle_vmexit,
    },
    utils::addresses::PhysicalAddress,
};
use core::{
    arch::{asm, global_asm},
    mem::offset_of,
};
use x86::{
    controlregs,
    cpuid::cpuid,
    dtables::{self, DescriptorTablePointer},
    msr::{rdmsr, wrmsr},
};
use x86_64::instructions::{hlt, interrupts};

/// Size of the registers pushed by the launch loop.
const GUEST_REGISTERS_SIZE: usize = core::mem::size_of::<GuestRegisters>();

/// Offset of a general purpose register within [`Context`].
macro_rules! context_register {
    ($register:ident) => {
        offset_of!(Context, registers) + offset_of!(GuestRegisters, $register)
    };
}

// Out of line, like `RtlCaptureContext`: the captured state is the state right
// after this function returns. `rcx` holds the `Context` to fill.
global_asm!(
    r#"
    .globl svm_nest_capture_context
svm_nest_capture_context:
    mov [rcx + {rax}], rax
    mov [rcx + {rcx}], rcx
    mov [rcx + {rdx}], rdx
    mov [rcx + {rbx}], rbx
    mov [rcx + {rbp}], rbp
    mov [rcx + {rsi}], rsi
    mov [rcx + {rdi}], rdi
    mov [rcx + {r8}], r8
    mov [rcx + {r9}], r9
    mov [rcx + {r10}], r10
    mov [rcx + {r11}], r11
    mov [rcx + {r12}], r12
    mov [rcx + {r13}], r13
    mov [rcx + {r14}], r14
    mov [rcx + {r15}], r15

    lea rax, [rsp + 8]
    mov [rcx + {rsp}], rax
    mov [rcx + {context_rsp}], rax

    mov rax, [rsp]
    mov [rcx + {context_rip}], rax

    pushfq
    pop rax
    mov [rcx + {context_rflags}], rax

    mov ax, cs
    mov [rcx + {context_cs}], ax
    mov ax, ds
    mov [rcx + {context_ds}], ax
    mov ax, es
    mov [rcx + {context_es}], ax
    mov ax, ss
    mov [rcx + {context_ss}], ax

    mov rax, [rcx + {rax}]
    ret
"#,
    rax = const context_register!(rax),
    rcx = const context_register!(rcx),
    rdx = const context_register!(rdx),
    rbx = const context_register!(rbx),
    rsp = const context_register!(rsp),
    rbp = const context_register!(rbp),
    rsi = const context_register!(rsi),
    rdi = const context_register!(rdi),
    r8 = const context_register!(r8),
    r9 = const context_register!(r9),
    r10 = const context_register!(r10),
    r11 = const context_register!(r11),
    r12 = const context_register!(r12),
    r13 = const context_register!(r13),
    r14 = const context_register!(r14),
    r15 = const context_register!(r15),
    context_rsp = const offset_of!(Context, rsp),
    context_rip = const offset_of!(Context, rip),
    context_rflags = const offset_of!(Context, rflags),
    context_cs = const offset_of!(Context, seg_cs),
    context_ds = const offset_of!(Context, seg_ds),
    context_es = const offset_of!(Context, seg_es),
    context_ss = const offset_of!(Context, seg_ss),
);

// Based on SimpleSvm's `SvLaunchVm`:
//
// `rcx` holds `HostRsp`, which points to the physical address of the block to
// run next. The processor data pointer is stored 16 bytes above it. `rdx`
// holds the captured `Context`: its registers are loaded before the first
// `vmrun`, which only takes `rax`, `rsp`, `rip` and `rflags` from the VMCB.
//
// After `vmrun` returns, the guest registers are pushed in the reverse order
// of `GuestRegisters` so that `rsp` points to an instance of it. The `rsp`
// slot is a placeholder: the guest's value lives in the VMCB.
//
// If the dispatcher asks to leave, the popped registers hold the unload
// response: `rbx` is the address to return to and `rcx` the stack pointer
// to restore.
global_asm!(
    r#"
    .globl svm_nest_launch_vm
svm_nest_launch_vm:
    mov rsp, rcx

    mov rbx, [rdx + {rbx}]
    mov rbp, [rdx + {rbp}]
    mov rsi, [rdx + {rsi}]
    mov rdi, [rdx + {rdi}]
    mov r8, [rdx + {r8}]
    mov r9, [rdx + {r9}]
    mov r10, [rdx + {r10}]
    mov r11, [rdx + {r11}]
    mov r12, [rdx + {r12}]
    mov r13, [rdx + {r13}]
    mov r14, [rdx + {r14}]
    mov r15, [rdx + {r15}]
    mov rcx, [rdx + {rcx}]
    mov rdx, [rdx + {rdx}]

.Lsvm_nest_loop:
    mov rax, [rsp]
    vmload rax
    vmrun rax
    vmsave rax

    push rax
    push rcx
    push rdx
    push rbx
    push -1
    push rbp
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    mov rdx, rsp
    mov rcx, [rsp + {self_data}]
    sub rsp, 0x20
    call {handler}
    add rsp, 0x20

    test al, al

    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rbp
    lea rsp, [rsp + 8]
    pop rbx
    pop rdx
    pop rcx
    pop rax

    jnz .Lsvm_nest_exit
    jmp .Lsvm_nest_loop

.Lsvm_nest_exit:
    mov rsp, rcx
    mov ecx, {magic}
    jmp rbx
"#,
    rcx = const context_register!(rcx),
    rdx = const context_register!(rdx),
    rbx = const context_register!(rbx),
    rbp = const context_register!(rbp),
    rsi = const context_register!(rsi),
    rdi = const context_register!(rdi),
    r8 = const context_register!(r8),
    r9 = const context_register!(r9),
    r10 = const context_register!(r10),
    r11 = const context_register!(r11),
    r12 = const context_register!(r12),
    r13 = const context_register!(r13),
    r14 = const context_register!(r14),
    r15 = const context_register!(r15),
    self_data = const GUEST_REGISTERS_SIZE + offset_of!(HostStackLayout, self_data)
        - offset_of!(HostStackLayout, guest_vmcb_pa),
    handler = sym handle_vmexit_entry,
    magic = const UNLOAD_MAGIC,
);

extern "win64" {
    fn svm_nest_capture_context(context: *mut Context);
    fn svm_nest_launch_vm(host_rsp: u64, context: *const Context);
}

unsafe extern "win64" fn handle_vmexit_entry(data: *mut VcpuData, regs: *mut GuestRegisters) -> u8 {
    let (data, regs) = (&mut *data, &mut *regs);

    handle_vmexit(&mut HardwareCpu, data, regs) as u8
}

/// The processor the code is currently running on.
pub struct HardwareCpu;

impl Cpu for HardwareCpu {
    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> CpuIdResult {
        cpuid!(leaf, subleaf)
    }

    fn read_msr(&mut self, msr: u32) -> u64 {
        unsafe { rdmsr(msr) }
    }

    fn write_msr(&mut self, msr: u32, value: u64) {
        unsafe { wrmsr(msr, value) }
    }

    fn vmload(&mut self, vmcb_pa: PhysicalAddress) {
        unsafe { asm!("vmload rax", in("rax") vmcb_pa.as_u64()) };
    }

    fn vmsave(&mut self, vmcb_pa: PhysicalAddress) {
        unsafe { asm!("vmsave rax", in("rax") vmcb_pa.as_u64()) };
    }

    fn disable_interrupts(&mut self) {
        interrupts::disable();
    }

    fn set_global_interrupt_flag(&mut self) {
        unsafe { asm!("stgi") };
    }

    // See:
    // - https://docs.microsoft.com/en-us/cpp/intrinsics/writeeflags
    // - https://www.felixcloutier.com/x86/popf:popfd:popfq
    fn write_rflags(&mut self, rflags: u64) {
        unsafe { asm!("push {}; popfq", in(reg) rflags) };
    }

    fn control_registers(&mut self) -> ControlRegisters {
        unsafe {
            ControlRegisters {
                cr0: controlregs::cr0().bits() as u64,
                cr2: controlregs::cr2() as u64,
                cr3: controlregs::cr3(),
                cr4: controlregs::cr4().bits() as u64,
            }
        }
    }

    fn descriptor_tables(&mut self) -> DescriptorTables {
        let mut gdt = DescriptorTablePointer::<u64>::default();
        let mut idt = DescriptorTablePointer::<u64>::default();
        unsafe {
            dtables::sgdt(&mut gdt);
            dtables::sidt(&mut idt);
        }

        DescriptorTables {
            gdt_base: gdt.base as u64,
            gdt_limit: gdt.limit,
            idt_base: idt.base as u64,
            idt_limit: idt.limit,
        }
    }

    // See: https://www.felixcloutier.com/x86/lsl
    fn segment_limit(&mut self, selector: u16) -> u32 {
        let limit: u32;
        unsafe {
            asm!("lsl {0:e}, {1:x}", out(reg) limit, in(reg) selector, options(nostack, nomem));
        }
        limit
    }

    /// Inlined, so that the guest resumes in the frame of the caller.
    #[inline(always)]
    fn capture_context(&mut self, context: &mut Context) {
        unsafe { svm_nest_capture_context(context) };
    }

    fn launch(&mut self, host_rsp: u64, context: &Context) {
        unsafe { svm_nest_launch_vm(host_rsp, context) };
    }

    fn debug_break(&mut self) {
        #[cfg(feature = "debug-break")]
        x86_64::instructions::interrupts::int3();
    }

    fn fatal(&mut self, error: FatalError) -> ! {
        log::error!("Fatal error {:#x}: {:?}", error.code(), error);
        self.debug_break();

        loop {
            interrupts::disable();
            hlt();
        }
    }
}
