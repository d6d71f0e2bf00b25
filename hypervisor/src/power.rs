//! System power state notifications.
//!
//! SVM does not survive the processor leaving S0, so the hypervisor has to
//! be removed before the system sleeps and installed again once it resumed,
//! see [`crate::Hypervisor::handle_power_transition`].

use crate::{
    error::{
        HypervisorError, PowerCallbackAlreadyRegisteredSnafu,
        PowerCallbackRegistrationFailedSnafu,
    },
    platform::{Platform, PowerCallbackHandle},
};
use snafu::{ensure, OptionExt};
use spin::Mutex;

/// `PO_CB_SYSTEM_STATE_LOCK`
const SYSTEM_STATE_LOCK: usize = 3;

static REGISTRATION: Mutex<Option<PowerCallbackHandle>> = Mutex::new(None);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PowerTransition {
    /// The system is about to leave S0.
    LeavingS0,

    /// The system has just re-entered S0.
    EnteringS0,
}

impl PowerTransition {
    /// Decodes the arguments of the power state callback. Returns `None` for
    /// notifications that are not about an imminent system state change.
    pub fn from_callback(argument1: usize, argument2: usize) -> Option<Self> {
        if argument1 != SYSTEM_STATE_LOCK {
            return None;
        }

        Some(if argument2 != 0 {
            PowerTransition::EnteringS0
        } else {
            PowerTransition::LeavingS0
        })
    }
}

/// Registers the power state callback with the platform.
pub fn register(platform: &dyn Platform) -> Result<(), HypervisorError> {
    let mut registration = REGISTRATION.lock();
    ensure!(registration.is_none(), PowerCallbackAlreadyRegisteredSnafu);

    let handle = platform
        .register_power_callback()
        .context(PowerCallbackRegistrationFailedSnafu)?;
    log::trace!("Registered power state callback: {:?}", handle);

    *registration = Some(handle);
    Ok(())
}

/// Removes the callback registered by [`register`], if any.
pub fn unregister(platform: &dyn Platform) {
    if let Some(handle) = REGISTRATION.lock().take() {
        platform.unregister_power_callback(handle);
        log::trace!("Unregistered power state callback: {:?}", handle);
    }
}
