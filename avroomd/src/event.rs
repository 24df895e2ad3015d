//! Notifications published to observers.

use avroom_common::{ActivityMode, SystemState, TransitionState};

use crate::alert::AlertEvent;
use crate::driver::{Qualifier, Value};

/// A status change reported by a device driver
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub device_id: String,
    pub command: String,
    pub qualifier: Option<Qualifier>,
    pub value: Value,
}

/// Everything observers of the system controller can hear about
#[derive(Debug, Clone)]
pub enum SystemEvent {
    /// A countdown began towards the given target
    TransitionStarted(TransitionState),
    /// Power state changed; `activity` is the activity now in effect
    StateChanged {
        state: SystemState,
        activity: ActivityMode,
    },
    /// Activity changed without a power cycle
    ActivityChanged(ActivityMode),
    Feedback(StatusEvent),
    Alert(AlertEvent),
}
