//! Shared fixtures for unit tests

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::config::{DeviceConfig, RoomConfig};
use crate::device::{DeviceRegistry, DeviceSpec};
use crate::driver::SimulatedDriver;
use crate::event::SystemEvent;
use crate::model::Source;
use crate::ui::UiHost;
use crate::SystemController;

#[derive(Debug, Clone, PartialEq)]
pub enum UiCall {
    ShowPopup(String, Option<Duration>),
    HidePopup(String),
    ShowPage(String),
    Label(String),
    LevelRange(u32, u32),
    Level(u32),
    Count(String),
    /// Id of the source put on the menu
    SourceMenu(String),
    AddBlankSource,
    RemoveBlankSource,
}

/// UI host that remembers every call in order
pub struct RecordingUiHost {
    id: String,
    calls: Mutex<Vec<UiCall>>,
}

impl RecordingUiHost {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<UiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn last_source_menu(&self) -> Option<String> {
        self.calls().into_iter().rev().find_map(|c| match c {
            UiCall::SourceMenu(id) => Some(id),
            _ => None,
        })
    }

    fn push(&self, call: UiCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl UiHost for RecordingUiHost {
    fn id(&self) -> &str {
        &self.id
    }

    fn show_popup(&self, name: &str, duration: Option<Duration>) {
        self.push(UiCall::ShowPopup(name.to_string(), duration));
    }

    fn hide_popup(&self, name: &str) {
        self.push(UiCall::HidePopup(name.to_string()));
    }

    fn show_page(&self, name: &str) {
        self.push(UiCall::ShowPage(name.to_string()));
    }

    fn set_transition_label(&self, text: &str) {
        self.push(UiCall::Label(text.to_string()));
    }

    fn set_transition_level_range(&self, min: u32, max: u32) {
        self.push(UiCall::LevelRange(min, max));
    }

    fn set_transition_level(&self, value: u32) {
        self.push(UiCall::Level(value));
    }

    fn set_transition_count(&self, text: &str) {
        self.push(UiCall::Count(text.to_string()));
    }

    fn set_source_menu(&self, source: &Source) {
        self.push(UiCall::SourceMenu(source.id.clone()));
    }

    fn add_blank_source(&self) {
        self.push(UiCall::AddBlankSource);
    }

    fn remove_blank_source(&self) {
        self.push(UiCall::RemoveBlankSource);
    }
}

const EXTRA_DEVICES: &str = r#"
- id: CAM001
  name: Document Camera
  interface:
    driver: simulated
  options:
    source:
      input: 5
      icon: camera
- id: CONF001
  name: Confidence Monitor
  interface:
    driver: simulated
  options:
    destination:
      output: 3
      type: conf
      group_work_source: CAM001
      confidence_follow: PRJ001
"#;

/// The default room plus a document camera and a confidence monitor
pub fn room_config() -> RoomConfig {
    let mut config = RoomConfig::default();
    let extra: Vec<DeviceConfig> = serde_yaml::from_str(EXTRA_DEVICES).unwrap();
    config.devices.extend(extra);
    config
}

fn simulated_drivers(config: &RoomConfig) -> HashMap<String, Arc<SimulatedDriver>> {
    config
        .devices
        .iter()
        .map(|device| {
            let driver = match device.options.switch.as_ref().and_then(|s| s.outputs) {
                Some(outputs) => SimulatedDriver::matrix(1..=outputs),
                None => SimulatedDriver::new(),
            };
            (device.id.clone(), Arc::new(driver))
        })
        .collect()
}

/// Initialized registry for [`room_config`], with the switch's driver
pub fn registry_with_room() -> (DeviceRegistry, Arc<SimulatedDriver>) {
    let config = room_config();
    let drivers = simulated_drivers(&config);
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut registry = DeviceRegistry::new(tx);
    for device in &config.devices {
        let driver = Arc::clone(&drivers[&device.id]);
        registry.add_device(DeviceSpec::from_config(device, driver).unwrap()).unwrap();
    }
    registry.initialize().unwrap();
    (registry, Arc::clone(&drivers["SW001"]))
}

/// Started controller for [`room_config`] with one recording host
pub async fn started_controller() -> (
    Arc<SystemController>,
    Arc<RecordingUiHost>,
    HashMap<String, Arc<SimulatedDriver>>,
) {
    let config = room_config();
    let drivers = simulated_drivers(&config);
    let host = Arc::new(RecordingUiHost::new("TP001"));

    let mut builder = SystemController::builder(config).ui_host(host.clone());
    for (id, driver) in &drivers {
        builder = builder.driver(id.clone(), driver.clone());
    }
    let controller = Arc::new(builder.build().unwrap());
    controller.start().await.unwrap();
    (controller, host, drivers)
}

/// Drain what has been broadcast so far, leaving out driver feedback
pub fn non_feedback_events(events: &mut broadcast::Receiver<SystemEvent>) -> Vec<SystemEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(SystemEvent::Feedback(_)) => {}
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    out
}
