//! Services the hypervisor consumes from the operating system it is loaded
//! into: memory, address translation, processor affinity and power
//! notifications.
//!
//! The driver that embeds this crate implements [`Platform`] on top of the
//! kernel APIs and hands out a `&'static` reference to it.

use crate::utils::addresses::PhysicalAddress;
use core::{alloc::Layout, ptr::NonNull};

/// The kind of memory backing an allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryKind {
    /// Page aligned, non-paged pool memory.
    NonPaged,

    /// Physically contiguous memory, required by structures the processor
    /// reads through a single physical base address spanning more than one
    /// page (for example the MSR permission map).
    Contiguous,
}

/// Opaque token describing the affinity of the calling thread before it was
/// pinned to a processor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AffinityToken(pub u64);

/// Opaque registration handle of the power state callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PowerCallbackHandle(pub usize);

pub trait Platform: Send + Sync {
    /// Allocates zero-filled, page aligned memory. Returns `None` if the
    /// allocation could not be satisfied.
    fn allocate(&self, layout: Layout, kind: MemoryKind) -> Option<NonNull<u8>>;

    /// Frees memory returned by [`Platform::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` with the same `layout` and
    /// `kind`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout, kind: MemoryKind);

    /// Translates a virtual address of resident memory to its physical
    /// address.
    fn physical_address(&self, va: *const u8) -> PhysicalAddress;

    /// Translates a physical address to a virtual address mapped in the
    /// current address space, if any.
    fn virtual_address(&self, pa: PhysicalAddress) -> Option<NonNull<u8>>;

    /// Number of active processors in the system.
    fn processor_count(&self) -> u32;

    /// Pins the calling thread to the processor with the specified index.
    fn switch_to_processor(&self, index: u32) -> Option<AffinityToken>;

    /// Reverts a previous [`Platform::switch_to_processor`].
    fn restore_affinity(&self, token: AffinityToken);

    /// Registers the callback that gets notified about system power state
    /// changes. The callback is expected to call
    /// [`crate::Hypervisor::handle_power_transition`].
    fn register_power_callback(&self) -> Option<PowerCallbackHandle>;

    fn unregister_power_callback(&self, handle: PowerCallbackHandle);

    /// Writes a single, already formatted line to the debug output.
    fn debug_print(&self, message: &str);
}
