//! Touch-panel facing contract.
//!
//! The core renders nothing itself; it only tells each [`UiHost`] what to show.

use avroom_common::tracing;
use std::time::Duration;
use tracing::debug;

use crate::model::Source;

/// Popup and page names the core drives
pub mod names {
    pub const POPUP_TRANSITION: &str = "Power-Transition";
    pub const POPUP_SHUTDOWN_CONFIRM: &str = "Shutdown-Confirmation";
    pub const POPUP_SOURCE_CONTROL: &str = "Source-Control";
    pub const POPUP_ADV_SOURCE_CONTROL: &str = "Adv-Source-Control";
    pub const PAGE_MAIN: &str = "Main";
    pub const PAGE_START: &str = "Start";
    pub const PAGE_SPLASH: &str = "Splash";
}

/// A touch panel or other user-facing display
pub trait UiHost: Send + Sync {
    fn id(&self) -> &str;

    /// Show a popup, hiding it again after `duration` if given
    fn show_popup(&self, name: &str, duration: Option<Duration>);
    fn hide_popup(&self, name: &str);
    fn show_page(&self, name: &str);

    fn set_transition_label(&self, text: &str);
    fn set_transition_level_range(&self, min: u32, max: u32);
    fn set_transition_level(&self, value: u32);
    fn set_transition_count(&self, text: &str);

    /// Reflect the source now shown on the room's outputs
    fn set_source_menu(&self, source: &Source);
    /// Offer "no source" as a selectable entry
    fn add_blank_source(&self);
    fn remove_blank_source(&self);
}

/// Headless host that only logs what it is asked to display
pub struct TracingUiHost {
    id: String,
}

impl TracingUiHost {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl UiHost for TracingUiHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn show_popup(&self, name: &str, duration: Option<Duration>) {
        debug!("[{}] show popup {} ({:?})", self.id, name, duration);
    }

    fn hide_popup(&self, name: &str) {
        debug!("[{}] hide popup {}", self.id, name);
    }

    fn show_page(&self, name: &str) {
        debug!("[{}] show page {}", self.id, name);
    }

    fn set_transition_label(&self, text: &str) {
        debug!("[{}] transition label: {}", self.id, text);
    }

    fn set_transition_level_range(&self, min: u32, max: u32) {
        debug!("[{}] transition range {}..{}", self.id, min, max);
    }

    fn set_transition_level(&self, value: u32) {
        debug!("[{}] transition level {}", self.id, value);
    }

    fn set_transition_count(&self, text: &str) {
        debug!("[{}] transition count {}", self.id, text);
    }

    fn set_source_menu(&self, source: &Source) {
        debug!("[{}] source menu -> {}", self.id, source);
    }

    fn add_blank_source(&self) {
        debug!("[{}] blank source entry added", self.id);
    }

    fn remove_blank_source(&self) {
        debug!("[{}] blank source entry removed", self.id);
    }
}
