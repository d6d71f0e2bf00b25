use crate::{
    error::{HypervisorError, LaunchFailedSnafu},
    platform::Platform,
    power::PowerTransition,
    svm::{
        cpu::{Cpu, Context},
        data::{shared_data::SharedData, vcpu_data::VcpuData},
        hypercall::{UnloadResponse, CPUID_UNLOAD_LEAF, CPUID_UNLOAD_SUBLEAF},
        msr::EFER_SVME,
        support::SvmFeatures,
    },
    utils::{alloc::PageBox, processor::execute_on_each_processor},
};
use alloc::{boxed::Box, vec::Vec};
use x86::msr::IA32_EFER;

pub mod cpu;
pub mod data;
pub mod events;
#[cfg(target_arch = "x86_64")]
pub mod hardware;
pub mod hypercall;
pub mod msr;
pub mod segmentation;
pub mod support;
pub mod vmcb;
pub mod vmexit;

pub struct HypervisorBuilder {
    nested_acceleration: bool,
}

impl Default for HypervisorBuilder {
    fn default() -> Self {
        Self {
            nested_acceleration: true,
        }
    }
}

impl HypervisorBuilder {
    /// Lets level 1 use virtual `vmload`/`vmsave` and the virtual global
    /// interrupt flag, if the processor supports them.
    #[must_use]
    pub fn nested_acceleration(mut self, enabled: bool) -> Self {
        self.nested_acceleration = enabled;
        self
    }

    pub fn build(self, platform: &'static dyn Platform) -> Hypervisor {
        Hypervisor {
            platform,
            nested_acceleration: self.nested_acceleration,
            shared_data: None,
            processors: Vec::new(),
            resume_on_wake: false,
        }
    }
}

pub struct Hypervisor {
    platform: &'static dyn Platform,
    nested_acceleration: bool,

    /// Present while at least one processor may be virtualized.
    shared_data: Option<Box<SharedData>>,

    /// Per processor data, indexed by processor number.
    processors: Vec<Option<PageBox<VcpuData>>>,

    /// Whether the processors were virtualized when the system left S0.
    resume_on_wake: bool,
}

impl Hypervisor {
    pub fn builder() -> HypervisorBuilder {
        HypervisorBuilder::default()
    }

    pub fn is_virtualized(&self) -> bool {
        self.shared_data.is_some()
    }

    /// Virtualizes every processor of the system. Either all processors are
    /// virtualized afterwards or, on error, none of them.
    pub fn virtualize_all<C: Cpu>(&mut self, cpu: &mut C) -> Result<(), HypervisorError> {
        if self.shared_data.is_some() {
            log::warn!("Processors are already virtualized");
            return Ok(());
        }

        log::info!("Virtualizing processors");

        let features = support::check_svm_support(cpu)?;
        let acceleration = if self.nested_acceleration {
            features
        } else {
            SvmFeatures::default()
        };

        let platform = self.platform;
        let shared_data: &SharedData = self.shared_data.insert(SharedData::new(platform)?);

        self.processors
            .resize_with(platform.processor_count() as usize, || None);
        let processors = &mut self.processors;

        let result = execute_on_each_processor(platform, |index| {
            let slot = &mut processors[index as usize];
            virtualize_processor(cpu, shared_data, slot, index, acceleration)
        });

        if let Err(error) = result.status {
            log::error!(
                "Failed to virtualize processors ({} completed): {}",
                result.completed,
                error
            );

            // Roll back the processors that have already been virtualized.
            //
            self.devirtualize_all(cpu);
            return Err(error);
        }

        log::info!("Virtualized {} processors", result.completed);
        Ok(())
    }

    /// Requests every processor to leave the hypervisor and releases the
    /// memory of the processors that did.
    pub fn devirtualize_all<C: Cpu>(&mut self, cpu: &mut C) {
        log::info!("Devirtualizing processors");

        let processors = &mut self.processors;
        let result = execute_on_each_processor(self.platform, |index| {
            match processors.get_mut(index as usize) {
                Some(slot) => devirtualize_processor(cpu, slot, index),
                None => log::warn!("Processor {} was never virtualized", index),
            }

            Ok(())
        });

        if let Err(error) = result.status {
            log::error!("Failed to devirtualize all processors: {}", error);
        }

        // Shared data is referenced by every processor that is still
        // virtualized.
        //
        if self.processors.iter().all(Option::is_none) {
            self.shared_data = None;
        } else {
            log::error!("Some processors are still virtualized, keeping shared data");
        }
    }

    /// Called from the power state callback.
    pub fn handle_power_transition<C: Cpu>(
        &mut self, cpu: &mut C, transition: PowerTransition,
    ) -> Result<(), HypervisorError> {
        log::info!("Power transition: {:?}", transition);

        match transition {
            PowerTransition::LeavingS0 => {
                self.resume_on_wake = self.is_virtualized();
                if self.resume_on_wake {
                    self.devirtualize_all(cpu);
                }

                Ok(())
            }
            PowerTransition::EnteringS0 if self.resume_on_wake => {
                self.resume_on_wake = false;
                self.virtualize_all(cpu)
            }
            PowerTransition::EnteringS0 => Ok(()),
        }
    }
}

impl Drop for Hypervisor {
    fn drop(&mut self) {
        // Virtualized processors still run on this memory.
        //
        if self.processors.iter().any(Option::is_some) {
            log::error!("Hypervisor dropped while processors are virtualized, leaking its memory");

            core::mem::forget(core::mem::take(&mut self.processors));
            core::mem::forget(self.shared_data.take());
        }
    }
}

fn virtualize_processor<C: Cpu>(
    cpu: &mut C, shared_data: &SharedData, slot: &mut Option<PageBox<VcpuData>>, index: u32,
    acceleration: SvmFeatures,
) -> Result<(), HypervisorError> {
    let mut launched = false;
    let mut context = Context::default();

    loop {
        // The guest starts executing right after this point, so we end up
        // here a second time once the launch succeeded.
        //
        cpu.capture_context(&mut context);

        if support::is_virtualized(cpu) {
            log::info!("Processor {} has been virtualized", index);
            return Ok(());
        }

        if launched {
            log::error!("Processor {} did not enter the guest", index);

            let efer = cpu.read_msr(IA32_EFER) & !EFER_SVME;
            cpu.write_msr(IA32_EFER, efer);

            return LaunchFailedSnafu { index }.fail();
        }
        launched = true;

        log::info!("Virtualizing processor {}", index);
        let data = slot.insert(VcpuData::new(shared_data.platform())?);

        // Enable SVM by setting EFER.SVME.
        //
        let efer = cpu.read_msr(IA32_EFER);
        cpu.write_msr(IA32_EFER, efer | EFER_SVME);

        data.prepare_for_virtualization(cpu, shared_data, &context, acceleration);

        log::info!("Launching processor {}", index);
        cpu.launch(data.host_rsp(), &context);
    }
}

fn devirtualize_processor<C: Cpu>(cpu: &mut C, slot: &mut Option<PageBox<VcpuData>>, index: u32) {
    let result = cpu.cpuid(CPUID_UNLOAD_LEAF, CPUID_UNLOAD_SUBLEAF);

    match UnloadResponse::from_cpuid(&result) {
        Some(address) => {
            let expected = slot.as_ref().map(|data| data.as_ptr() as u64);
            if expected != Some(address) {
                log::warn!(
                    "Processor {} released {:#x}, expected {:x?}",
                    index,
                    address,
                    expected
                );
            }

            log::info!("Processor {} has been devirtualized", index);
            *slot = None;
        }
        None if support::is_virtualized(cpu) => {
            log::error!("Processor {} refused to devirtualize", index);
        }
        None => *slot = None,
    }
}
