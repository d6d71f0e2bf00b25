//! Runs code on specific physical processors.

use crate::{
    error::{HypervisorError, ProcessorSwitchFailedSnafu},
    platform::{AffinityToken, Platform},
};
use snafu::OptionExt;

/// Pins the current thread to a processor until dropped.
pub struct ProcessorExecutor<'a> {
    platform: &'a dyn Platform,
    old_affinity: AffinityToken,
}

impl<'a> ProcessorExecutor<'a> {
    pub fn switch_to_processor(platform: &'a dyn Platform, index: u32) -> Option<Self> {
        if index >= platform.processor_count() {
            log::error!("Invalid processor index: {}", index);
            return None;
        }

        let old_affinity = platform.switch_to_processor(index)?;

        Some(Self {
            platform,
            old_affinity,
        })
    }
}

impl Drop for ProcessorExecutor<'_> {
    fn drop(&mut self) {
        self.platform.restore_affinity(self.old_affinity);
    }
}

/// Outcome of a sweep over every processor.
#[derive(Debug)]
pub struct SweepResult {
    /// Number of processors on which the callback completed successfully.
    pub completed: u32,
    pub status: Result<(), HypervisorError>,
}

/// Executes `callback` on every active processor, one at a time, and stops
/// at the first failure.
pub fn execute_on_each_processor<F>(platform: &dyn Platform, mut callback: F) -> SweepResult
where
    F: FnMut(u32) -> Result<(), HypervisorError>,
{
    let mut completed = 0;

    for index in 0..platform.processor_count() {
        let status = ProcessorExecutor::switch_to_processor(platform, index)
            .context(ProcessorSwitchFailedSnafu { index })
            .and_then(|_executor| callback(index));

        if let Err(error) = status {
            return SweepResult {
                completed,
                status: Err(error),
            };
        }

        completed += 1;
    }

    SweepResult {
        completed,
        status: Ok(()),
    }
}
