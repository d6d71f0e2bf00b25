//! AMD SVM hypervisor that virtualizes every processor of the running system
//! and emulates one level of nested virtualization for its guest.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate static_assertions;

pub mod error;
pub mod platform;
pub mod power;
pub mod svm;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use error::HypervisorError;
pub use svm::{Hypervisor, HypervisorBuilder};
