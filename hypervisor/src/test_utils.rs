//! Test doubles for the operating system and the processor.

use crate::{
    platform::{AffinityToken, MemoryKind, Platform, PowerCallbackHandle},
    svm::{
        cpu::{Context, ControlRegisters, Cpu, CpuIdResult, DescriptorTables, FatalError},
        data::{guest::GuestRegisters, shared_data::SharedData, vcpu_data::VcpuData},
        hypercall::UNLOAD_MAGIC,
        msr::{SVM_MSR_VM_CR, SVM_MSR_VM_HSAVE_PA},
        support::SvmFeatures,
        vmcb::{control_area::VmExitCode, Vmcb},
        vmexit::handle_vmexit,
    },
    utils::{addresses::PhysicalAddress, alloc::PageBox},
};
use core::{alloc::Layout, ptr::NonNull};
use std::{collections::HashMap, sync::Mutex};
use x86::{
    bits64::paging::BASE_PAGE_SIZE,
    msr::{IA32_EFER, IA32_LSTAR, IA32_PAT},
};

#[derive(Default)]
struct PlatformState {
    allocation_budget: Option<usize>,
    live_allocations: usize,
    current_processor: u32,
    pinned: bool,
    printed: Vec<String>,
    power_callbacks: usize,
    fail_power_registration: bool,
}

/// Identity mapped platform backed by the test process heap.
pub struct MockPlatform {
    processor_count: u32,
    state: Mutex<PlatformState>,
}

impl MockPlatform {
    pub fn leak(processor_count: u32) -> &'static Self {
        Box::leak(Box::new(Self {
            processor_count,
            state: Mutex::new(PlatformState::default()),
        }))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PlatformState> {
        self.state.lock().unwrap()
    }

    /// Lets the next `count` allocations succeed and fails every one after.
    pub fn set_allocation_budget(&self, count: usize) {
        self.state().allocation_budget = Some(count);
    }

    pub fn live_allocations(&self) -> usize {
        self.state().live_allocations
    }

    pub fn current_processor(&self) -> u32 {
        self.state().current_processor
    }

    pub fn is_pinned(&self) -> bool {
        self.state().pinned
    }

    pub fn printed(&self) -> Vec<String> {
        self.state().printed.clone()
    }

    pub fn power_callbacks(&self) -> usize {
        self.state().power_callbacks
    }

    pub fn fail_power_registration(&self) {
        self.state().fail_power_registration = true;
    }

    /// Guest memory that is not tracked as a hypervisor allocation.
    pub fn allocate_vmcb(&self) -> &'static mut Vmcb {
        Box::leak(unsafe { Box::<Vmcb>::new_zeroed().assume_init() })
    }

    /// Zeroed, page aligned guest memory. Returns its physical address.
    pub fn allocate_pages(&self, count: usize) -> u64 {
        let layout = Layout::from_size_align(count * BASE_PAGE_SIZE, BASE_PAGE_SIZE).unwrap();

        unsafe { std::alloc::alloc_zeroed(layout) as u64 }
    }
}

impl Platform for MockPlatform {
    fn allocate(&self, layout: Layout, _kind: MemoryKind) -> Option<NonNull<u8>> {
        let mut state = self.state();
        if let Some(budget) = state.allocation_budget.as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }

        let ptr = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })?;
        state.live_allocations += 1;

        Some(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout, _kind: MemoryKind) {
        self.state().live_allocations -= 1;
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }

    fn physical_address(&self, va: *const u8) -> PhysicalAddress {
        PhysicalAddress::from_pa(va as u64)
    }

    fn virtual_address(&self, pa: PhysicalAddress) -> Option<NonNull<u8>> {
        NonNull::new(pa.as_u64() as *mut u8)
    }

    fn processor_count(&self) -> u32 {
        self.processor_count
    }

    fn switch_to_processor(&self, index: u32) -> Option<AffinityToken> {
        let mut state = self.state();
        let previous = AffinityToken(state.current_processor as u64);
        state.current_processor = index;
        state.pinned = true;

        Some(previous)
    }

    fn restore_affinity(&self, _token: AffinityToken) {
        self.state().pinned = false;
    }

    fn register_power_callback(&self) -> Option<PowerCallbackHandle> {
        let mut state = self.state();
        if state.fail_power_registration {
            return None;
        }

        state.power_callbacks += 1;
        Some(PowerCallbackHandle(0x1000 + state.power_callbacks))
    }

    fn unregister_power_callback(&self, _handle: PowerCallbackHandle) {
        self.state().power_callbacks -= 1;
    }

    fn debug_print(&self, message: &str) {
        self.state().printed.push(message.to_owned());
    }
}

/// Processor operations with side effects, in the order they were executed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Op {
    Vmload(u64),
    Vmsave(u64),
    Cli,
    Stgi,
    WriteMsr(u32, u64),
    WriteRflags(u64),
    Launch(u64),
    DebugBreak,
}

/// GDT of a 64-bit kernel: null, kernel code and data, 32-bit user code,
/// user data and 64-bit user code.
const GDT: [u64; 7] = [
    0x0000_0000_0000_0000,
    0x0000_0000_0000_0000,
    0x0020_9b00_0000_0000,
    0x0040_9300_0000_0000,
    0x00cf_fb00_0000_ffff,
    0x00cf_f300_0000_ffff,
    0x0020_fb00_0000_0000,
];

/// An AMD processor with SVM, nested paging, virtual VMLOAD/VMSAVE and
/// virtual GIF that is not virtualized.
pub struct MockHardware {
    cpuid: HashMap<u32, CpuIdResult>,
    msrs: HashMap<u32, u64>,
    gdt: Box<[u64; 7]>,
    ops: Vec<Op>,
    launch_context: Option<Context>,
}

impl MockHardware {
    pub fn new() -> Self {
        let mut hardware = Self {
            cpuid: HashMap::new(),
            msrs: HashMap::new(),
            gdt: Box::new(GDT),
            ops: Vec::new(),
            launch_context: None,
        };

        // "AuthenticAMD"
        hardware.set_cpuid(0x0000_0000, 0x10, 0x6874_7541, 0x444d_4163, 0x6974_6e65);
        hardware.set_cpuid(0x0000_0001, 0x00a2_0f12, 0x0010_0800, 0x7ed8_320b, 0x178b_fbff);
        hardware.set_cpuid(0x8000_0000, 0x8000_0021, 0x6874_7541, 0x444d_4163, 0x6974_6e65);
        hardware.set_cpuid(0x8000_0001, 0x00a2_0f12, 0x2000_0000, 0x75c2_37ff, 0x2fd3_fbff);
        // NP, NRIPS, virtual VMLOAD/VMSAVE and virtual GIF, not locked.
        hardware.set_cpuid(0x8000_000A, 0x1, 0x8000, 0, 0x0001_8009);

        hardware.msrs.insert(IA32_EFER, 0xd01);
        hardware.msrs.insert(IA32_PAT, 0x0007_0406_0007_0406);
        hardware.msrs.insert(IA32_LSTAR, 0xffff_f800_0010_0000);
        hardware.msrs.insert(SVM_MSR_VM_CR, 0);
        hardware.msrs.insert(SVM_MSR_VM_HSAVE_PA, 0);

        hardware
    }

    pub fn set_cpuid(&mut self, leaf: u32, eax: u32, ebx: u32, ecx: u32, edx: u32) {
        self.cpuid.insert(leaf, CpuIdResult { eax, ebx, ecx, edx });
    }

    /// The context passed to the last `launch`.
    pub fn launch_context(&self) -> Option<Context> {
        self.launch_context
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.clone()
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }
}

impl Cpu for MockHardware {
    fn cpuid(&mut self, leaf: u32, _subleaf: u32) -> CpuIdResult {
        self.cpuid.get(&leaf).copied().unwrap_or(CpuIdResult {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
        })
    }

    fn read_msr(&mut self, msr: u32) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or_default()
    }

    fn write_msr(&mut self, msr: u32, value: u64) {
        self.ops.push(Op::WriteMsr(msr, value));
        self.msrs.insert(msr, value);
    }

    fn vmload(&mut self, vmcb_pa: PhysicalAddress) {
        self.ops.push(Op::Vmload(vmcb_pa.as_u64()));
    }

    fn vmsave(&mut self, vmcb_pa: PhysicalAddress) {
        self.ops.push(Op::Vmsave(vmcb_pa.as_u64()));
    }

    fn disable_interrupts(&mut self) {
        self.ops.push(Op::Cli);
    }

    fn set_global_interrupt_flag(&mut self) {
        self.ops.push(Op::Stgi);
    }

    fn write_rflags(&mut self, rflags: u64) {
        self.ops.push(Op::WriteRflags(rflags));
    }

    fn control_registers(&mut self) -> ControlRegisters {
        ControlRegisters {
            cr0: 0x8005_0033,
            cr2: 0,
            cr3: 0x001a_d000,
            cr4: 0x0035_06f8,
        }
    }

    fn descriptor_tables(&mut self) -> DescriptorTables {
        DescriptorTables {
            gdt_base: self.gdt.as_ptr() as u64,
            gdt_limit: (core::mem::size_of_val(&*self.gdt) - 1) as u16,
            idt_base: 0xffff_f800_0000_4000,
            idt_limit: 0xfff,
        }
    }

    fn segment_limit(&mut self, _selector: u16) -> u32 {
        u32::MAX
    }

    fn capture_context(&mut self, context: &mut Context) {
        *context = Context {
            rip: 0xffff_f800_0123_4560,
            rsp: 0xffff_a000_0000_7f00,
            rflags: 0x246,
            seg_cs: 0x10,
            seg_ds: 0x2b,
            seg_es: 0x2b,
            seg_ss: 0x18,
            registers: GuestRegisters {
                rax: 0x1,
                rbx: 0xffff_a000_0000_8000,
                ..Default::default()
            },
        };
    }

    fn launch(&mut self, host_rsp: u64, context: &Context) {
        self.ops.push(Op::Launch(host_rsp));
        self.launch_context = Some(*context);
    }

    fn debug_break(&mut self) {
        self.ops.push(Op::DebugBreak);
    }

    fn fatal(&mut self, error: FatalError) -> ! {
        panic!("fatal: {:?}", error)
    }
}

/// A `#VMEXIT` as the hardware would report it for the current block.
pub struct GuestExit {
    pub exit_code: VmExitCode,

    /// `None` keeps the current rip of the block.
    pub rip: Option<u64>,
    pub cpl: u8,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub exit_info1: u64,
    pub exit_info2: u64,
    pub exit_int_info: u64,
    pub instruction_length: u64,
}

impl GuestExit {
    pub fn new(exit_code: VmExitCode) -> Self {
        let instruction_length = match exit_code {
            VmExitCode::VMEXIT_CPUID | VmExitCode::VMEXIT_MSR => 2,
            VmExitCode::VMEXIT_VMRUN | VmExitCode::VMEXIT_VMMCALL => 3,
            VmExitCode::VMEXIT_EXCEPTION_BP => 1,
            _ => 0,
        };

        Self {
            exit_code,
            rip: None,
            cpl: 0,
            rax: 0,
            rcx: 0,
            rdx: 0,
            exit_info1: 0,
            exit_info2: 0,
            exit_int_info: 0,
            instruction_length,
        }
    }

    pub fn cpuid(leaf: u32, subleaf: u32) -> Self {
        let mut exit = Self::new(VmExitCode::VMEXIT_CPUID);
        exit.rax = leaf as u64;
        exit.rcx = subleaf as u64;
        exit
    }

    pub fn msr_read(msr: u32) -> Self {
        let mut exit = Self::new(VmExitCode::VMEXIT_MSR);
        exit.rcx = msr as u64;
        exit
    }

    pub fn msr_write(msr: u32, value: u64) -> Self {
        let mut exit = Self::new(VmExitCode::VMEXIT_MSR);
        exit.rcx = msr as u64;
        exit.rax = value as u32 as u64;
        exit.rdx = value >> 32;
        exit.exit_info1 = 1;
        exit
    }
}

/// A single processor that has been prepared for virtualization and takes
/// `#VMEXIT`s without the launch loop.
pub struct TestVcpu {
    pub cpu: MockHardware,
    pub data: PageBox<VcpuData>,

    /// Referenced by `data`, has to outlive it.
    pub shared_data: Box<SharedData>,
    pub platform: &'static MockPlatform,
}

impl TestVcpu {
    pub fn new() -> Self {
        let platform = MockPlatform::leak(1);
        let mut cpu = MockHardware::new();
        let shared_data = SharedData::new(platform).unwrap();
        let mut data = VcpuData::new(platform).unwrap();

        let mut context = Context::default();
        cpu.capture_context(&mut context);
        data.prepare_for_virtualization(&mut cpu, &shared_data, &context, SvmFeatures::default());
        cpu.clear_ops();

        Self {
            cpu,
            data,
            shared_data,
            platform,
        }
    }

    /// Reports `exit` in the current block and runs the dispatcher. Returns
    /// whether the hypervisor has to be left and the registers handed back
    /// to the guest.
    pub fn dispatch(&mut self, exit: GuestExit) -> (bool, GuestRegisters) {
        let vmcb = self.data.current_vmcb();
        let rip = exit.rip.unwrap_or(vmcb.save_area.rip);

        vmcb.save_area.rip = rip;
        vmcb.save_area.cpl = exit.cpl;
        vmcb.save_area.rax = exit.rax;
        vmcb.control_area.exit_code = exit.exit_code;
        vmcb.control_area.exit_info1 = exit.exit_info1;
        vmcb.control_area.exit_info2 = exit.exit_info2;
        vmcb.control_area.exit_int_info = exit.exit_int_info;
        vmcb.control_area.nrip = rip + exit.instruction_length;

        let mut regs = GuestRegisters {
            rcx: exit.rcx,
            rdx: exit.rdx,
            ..Default::default()
        };
        let leave = handle_vmexit(&mut self.cpu, &mut self.data, &mut regs);

        (leave, regs)
    }

    /// Like [`TestVcpu::dispatch`] for exits that resume the guest.
    pub fn run(&mut self, exit: GuestExit) -> GuestRegisters {
        let (leave, regs) = self.dispatch(exit);
        assert!(!leave);

        regs
    }

    /// A control block in level 1 memory. Returns its physical address.
    pub fn allocate_vmcb(&self) -> u64 {
        self.platform.allocate_vmcb() as *mut Vmcb as u64
    }

    /// A MSR permission map in level 1 memory.
    pub fn allocate_msr_bitmap(&self) -> u64 {
        self.platform.allocate_pages(2)
    }

    pub fn vmcb_at(&mut self, pa: u64) -> &mut Vmcb {
        unsafe { &mut *(pa as *mut Vmcb) }
    }

    pub fn byte_at(&mut self, pa: u64) -> &mut u8 {
        unsafe { &mut *(pa as *mut u8) }
    }
}

struct MockCore {
    hardware: MockHardware,
    host_rsp: Option<u64>,
    fail_launch: bool,
}

/// A multi-processor system on which `launch` enters the guest.
///
/// Once a processor has been launched, `cpuid` executed on it traps into the
/// dispatcher the same way the launch loop would route it, including the
/// exit path of an unload request.
pub struct MockGuestCpu {
    platform: &'static MockPlatform,
    cores: Vec<MockCore>,
}

impl MockGuestCpu {
    pub fn new(platform: &'static MockPlatform) -> Self {
        let cores = (0..platform.processor_count())
            .map(|_| MockCore {
                hardware: MockHardware::new(),
                host_rsp: None,
                fail_launch: false,
            })
            .collect();

        Self { platform, cores }
    }

    fn current(&mut self) -> &mut MockCore {
        &mut self.cores[self.platform.current_processor() as usize]
    }

    pub fn hardware(&mut self, index: u32) -> &mut MockHardware {
        &mut self.cores[index as usize].hardware
    }

    pub fn is_launched(&self, index: u32) -> bool {
        self.cores[index as usize].host_rsp.is_some()
    }

    /// `launch` returns without entering the guest on processor `index`.
    pub fn fail_launch(&mut self, index: u32) {
        self.cores[index as usize].fail_launch = true;
    }
}

impl Cpu for MockGuestCpu {
    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> CpuIdResult {
        let core = self.current();
        let Some(host_rsp) = core.host_rsp else {
            return core.hardware.cpuid(leaf, subleaf);
        };

        // The launch loop finds the processor data right above `HostRsp`.
        let data = unsafe { &mut **((host_rsp + 16) as *const *mut VcpuData) };

        let vmcb = data.current_vmcb();
        vmcb.save_area.rax = leaf as u64;
        vmcb.save_area.cpl = 0;
        vmcb.control_area.exit_code = VmExitCode::VMEXIT_CPUID;
        vmcb.control_area.nrip = vmcb.save_area.rip + 2;

        let mut regs = GuestRegisters {
            rcx: subleaf as u64,
            ..Default::default()
        };
        if handle_vmexit(&mut core.hardware, data, &mut regs) {
            core.host_rsp = None;

            return CpuIdResult {
                eax: regs.rax as u32,
                ebx: regs.rbx as u32,
                ecx: UNLOAD_MAGIC,
                edx: regs.rdx as u32,
            };
        }

        CpuIdResult {
            eax: data.current_vmcb().save_area.rax as u32,
            ebx: regs.rbx as u32,
            ecx: regs.rcx as u32,
            edx: regs.rdx as u32,
        }
    }

    fn read_msr(&mut self, msr: u32) -> u64 {
        self.current().hardware.read_msr(msr)
    }

    fn write_msr(&mut self, msr: u32, value: u64) {
        self.current().hardware.write_msr(msr, value)
    }

    fn vmload(&mut self, vmcb_pa: PhysicalAddress) {
        self.current().hardware.vmload(vmcb_pa)
    }

    fn vmsave(&mut self, vmcb_pa: PhysicalAddress) {
        self.current().hardware.vmsave(vmcb_pa)
    }

    fn disable_interrupts(&mut self) {
        self.current().hardware.disable_interrupts()
    }

    fn set_global_interrupt_flag(&mut self) {
        self.current().hardware.set_global_interrupt_flag()
    }

    fn write_rflags(&mut self, rflags: u64) {
        self.current().hardware.write_rflags(rflags)
    }

    fn control_registers(&mut self) -> ControlRegisters {
        self.current().hardware.control_registers()
    }

    fn descriptor_tables(&mut self) -> DescriptorTables {
        self.current().hardware.descriptor_tables()
    }

    fn segment_limit(&mut self, selector: u16) -> u32 {
        self.current().hardware.segment_limit(selector)
    }

    fn capture_context(&mut self, context: &mut Context) {
        self.current().hardware.capture_context(context)
    }

    fn launch(&mut self, host_rsp: u64, context: &Context) {
        let core = self.current();
        core.hardware.launch(host_rsp, context);

        if !core.fail_launch {
            core.host_rsp = Some(host_rsp);
        }
    }

    fn debug_break(&mut self) {
        self.current().hardware.debug_break()
    }

    fn fatal(&mut self, error: FatalError) -> ! {
        self.current().hardware.fatal(error)
    }
}
