use crate::svm::vmcb::Vmcb;
use bitfield::bitfield;

bitfield! {
    /// See `15.20 Event Injection`.
    ///
    /// The VMM can inject exceptions or interrupts (collectively referred to as events) into the guest by
    /// setting bits in the VMCB’s EVENTINJ field prior to executing the VMRUN instruction.
    ///
    /// ## Fields
    ///
    /// - `Vector`: The 8-bit IDT vector of the interrupt or exception.
    /// - `Type`: 0 = INTR, 2 = NMI, 3 = Exception (fault or trap), 4 = Software interrupt (INTn).
    /// - `Error Code Valid` (`EV`): Set to 1 if the exception should push an error code onto the stack.
    /// - `Valid`: Set to 1 if an event is to be injected into the guest.
    /// - `Error Code`: If `EV` is set to 1, the error code to be pushed onto the stack.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct EventInjection(u64);
    impl Debug;
    pub get_vector, set_vector: 7, 0;                       // [0-7]
    pub get_type, set_type: 10, 8;                          // [8-10]
    pub get_error_code_valid, set_error_code_valid: 11, 11; // [11]
    // Reserved                                             // [12-30]
    pub get_valid, set_valid: 31, 31;                       // [31]
    pub get_error_code, set_error_code: 63, 32;             // [32-63]
}

const EXCEPTION: u64 = 3;

impl EventInjection {
    fn exception(vector: u64) -> Self {
        let mut event = EventInjection(0);
        event.set_vector(vector);
        event.set_type(EXCEPTION);
        event.set_valid(1);

        event
    }

    /// `#GP(0)`
    pub fn gp() -> Self {
        let mut event = Self::exception(13);
        event.set_error_code_valid(1);

        event
    }

    /// `#BP`
    pub fn bp() -> Self {
        Self::exception(3)
    }

    /// `#UD`
    pub fn ud() -> Self {
        Self::exception(6)
    }

    /// Queues the event in `vmcb`. It is delivered on the next `vmrun` of
    /// that control block.
    pub fn inject(&self, vmcb: &mut Vmcb) {
        vmcb.control_area.event_inj = self.0;
    }
}
