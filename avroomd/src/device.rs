use avroom_common::{tracing, DeviceInfo};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{yaml_to_qualifier, DeviceConfig};
use crate::driver::{commands, DeviceDriver, Qualifier, StatusCallback, Value};
use crate::error::{ControlError, ControlResult};
use crate::event::StatusEvent;
use crate::model::{Destination, DestinationType, MatrixTie, Source, BLANK_INPUT};

/// Role category. Declared in initialization order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoleKind {
    Source,
    Screen,
    Destination,
    Switch,
    Camera,
    Microphone,
    Light,
    Shade,
    None,
}

impl RoleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleKind::Source => "source",
            RoleKind::Screen => "screen",
            RoleKind::Destination => "destination",
            RoleKind::Switch => "switch",
            RoleKind::Camera => "camera",
            RoleKind::Microphone => "microphone",
            RoleKind::Light => "light",
            RoleKind::Shade => "shade",
            RoleKind::None => "none",
        }
    }
}

/// Role as declared at registration, before references are resolved
#[derive(Debug, Clone, PartialEq)]
pub enum RoleSpec {
    Source(Source),
    Destination {
        output: u16,
        kind: DestinationType,
        /// Id of the source shown during group work
        group_work_source: String,
        screen: Option<String>,
        confidence_follow: Option<String>,
    },
    Switch {
        outputs: u16,
    },
    Camera {
        presets: Vec<String>,
    },
    Microphone {
        number: Option<u16>,
    },
    Screen,
    Light,
    Shade,
    None,
}

impl RoleSpec {
    pub fn kind(&self) -> RoleKind {
        match self {
            RoleSpec::Source(_) => RoleKind::Source,
            RoleSpec::Destination { .. } => RoleKind::Destination,
            RoleSpec::Switch { .. } => RoleKind::Switch,
            RoleSpec::Camera { .. } => RoleKind::Camera,
            RoleSpec::Microphone { .. } => RoleKind::Microphone,
            RoleSpec::Screen => RoleKind::Screen,
            RoleSpec::Light => RoleKind::Light,
            RoleSpec::Shade => RoleKind::Shade,
            RoleSpec::None => RoleKind::None,
        }
    }
}

/// Role object attached to an initialized device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceRole {
    Source(Source),
    Destination(Destination),
    Switch { outputs: Vec<u16> },
    Camera { presets: Vec<String> },
    Microphone { number: Option<u16> },
    Screen,
    Light,
    Shade,
    None,
}

/// A status to poll, in polling-cycle cadences
#[derive(Debug, Clone, PartialEq)]
pub struct PollSpec {
    pub command: String,
    pub qualifier: Option<Qualifier>,
    pub active: u32,
    pub inactive: u32,
    /// Subscribe as well, so refreshed values come back as feedback
    pub feedback: bool,
}

/// Everything needed to register one device
#[derive(Clone)]
pub struct DeviceSpec {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub driver: Arc<dyn DeviceDriver>,
    pub role: RoleSpec,
    pub subscriptions: Vec<(String, Option<Qualifier>)>,
    pub polls: Vec<PollSpec>,
    pub assignment: Option<String>,
    pub virtual_assignment: Option<String>,
}

impl DeviceSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>, driver: Arc<dyn DeviceDriver>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            manufacturer: String::new(),
            model: String::new(),
            driver,
            role: RoleSpec::None,
            subscriptions: Vec::new(),
            polls: Vec::new(),
            assignment: None,
            virtual_assignment: None,
        }
    }

    pub fn with_role(mut self, role: RoleSpec) -> Self {
        self.role = role;
        self
    }

    pub fn with_poll(mut self, poll: PollSpec) -> Self {
        self.polls.push(poll);
        self
    }

    /// Validate a configuration record and pair it with its driver
    pub fn from_config(config: &DeviceConfig, driver: Arc<dyn DeviceDriver>) -> ControlResult<Self> {
        let id = config.id.as_str();
        let options = &config.options;

        let declared = [
            options.source.is_some(),
            options.destination.is_some(),
            options.switch.is_some(),
            options.camera.is_some(),
            options.microphone.is_some(),
            options.screen.is_some(),
            options.light.is_some(),
            options.shade.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        if declared > 1 {
            return Err(ControlError::invalid(id, "a device may hold at most one role"));
        }

        let role = if let Some(source) = &options.source {
            let input = source.input.ok_or(ControlError::MissingOption {
                device: id.to_string(),
                option: "source.input",
            })?;
            if input == BLANK_INPUT {
                return Err(ControlError::invalid(id, "input 0 is reserved for the blank source"));
            }
            RoleSpec::Source(Source {
                id: config.id.clone(),
                name: config.name.clone(),
                icon: source.icon.clone().unwrap_or_else(|| "generic".to_string()),
                input,
                source_control_page: source.source_control_page.clone(),
                advanced_control_page: source.advanced_control_page.clone(),
            })
        } else if let Some(dest) = &options.destination {
            let missing = |option| ControlError::MissingOption {
                device: id.to_string(),
                option,
            };
            let kind: DestinationType = dest.kind.as_deref().ok_or_else(|| missing("destination.type"))?.parse()?;
            RoleSpec::Destination {
                output: dest.output.ok_or_else(|| missing("destination.output"))?,
                kind,
                group_work_source: dest
                    .group_work_source
                    .clone()
                    .ok_or_else(|| missing("destination.group_work_source"))?,
                screen: dest.screen.clone(),
                confidence_follow: dest.confidence_follow.clone(),
            }
        } else if let Some(switch) = &options.switch {
            let outputs = switch.outputs.ok_or(ControlError::MissingOption {
                device: id.to_string(),
                option: "switch.outputs",
            })?;
            RoleSpec::Switch { outputs }
        } else if let Some(camera) = &options.camera {
            RoleSpec::Camera {
                presets: camera.presets.clone(),
            }
        } else if let Some(mic) = &options.microphone {
            RoleSpec::Microphone { number: mic.number }
        } else if options.screen.is_some() {
            RoleSpec::Screen
        } else if options.light.is_some() {
            RoleSpec::Light
        } else if options.shade.is_some() {
            RoleSpec::Shade
        } else {
            RoleSpec::None
        };

        let subscriptions = config
            .subscriptions
            .iter()
            .map(|s| Ok((s.command.clone(), yaml_to_qualifier(s.qualifier.as_ref())?)))
            .collect::<ControlResult<Vec<_>>>()?;

        let polls = config
            .polling
            .iter()
            .map(|p| {
                if p.active == 0 || p.inactive == 0 {
                    return Err(ControlError::invalid(
                        id,
                        format!("poll cadence for {} must be at least one cycle", p.command),
                    ));
                }
                Ok(PollSpec {
                    command: p.command.clone(),
                    qualifier: yaml_to_qualifier(p.qualifier.as_ref())?,
                    active: p.active,
                    inactive: p.inactive,
                    feedback: p.feedback,
                })
            })
            .collect::<ControlResult<Vec<_>>>()?;

        Ok(Self {
            id: config.id.clone(),
            name: config.name.clone(),
            manufacturer: config.manufacturer.clone(),
            model: config.model.clone(),
            driver,
            role,
            subscriptions,
            polls,
            assignment: options.assignment.clone(),
            virtual_assignment: options.virtual_assignment.clone(),
        })
    }
}

/// A registered hardware controller
pub struct DeviceRecord {
    spec: DeviceSpec,
    role: Option<DeviceRole>,
    connection_status: String,
    status_changed_at: SystemTime,
    members: Vec<String>,
}

impl DeviceRecord {
    fn new(spec: DeviceSpec) -> Self {
        Self {
            spec,
            role: None,
            connection_status: "Unknown".to_string(),
            status_changed_at: SystemTime::now(),
            members: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.spec.driver
    }

    pub fn polls(&self) -> &[PollSpec] {
        &self.spec.polls
    }

    pub fn role_kind(&self) -> RoleKind {
        self.spec.role.kind()
    }

    /// Role object, once the device has been initialized
    pub fn role(&self) -> Option<&DeviceRole> {
        self.role.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.role.is_some()
    }

    pub fn is_source(&self) -> bool {
        self.role_kind() == RoleKind::Source
    }

    pub fn is_destination(&self) -> bool {
        self.role_kind() == RoleKind::Destination
    }

    pub fn is_switch(&self) -> bool {
        self.role_kind() == RoleKind::Switch
    }

    pub fn is_camera(&self) -> bool {
        self.role_kind() == RoleKind::Camera
    }

    pub fn is_microphone(&self) -> bool {
        self.role_kind() == RoleKind::Microphone
    }

    pub fn is_screen(&self) -> bool {
        self.role_kind() == RoleKind::Screen
    }

    pub fn is_light(&self) -> bool {
        self.role_kind() == RoleKind::Light
    }

    pub fn is_shade(&self) -> bool {
        self.role_kind() == RoleKind::Shade
    }

    pub fn is_virtual(&self) -> bool {
        self.spec.virtual_assignment.is_some()
    }

    pub fn source(&self) -> Option<&Source> {
        match &self.role {
            Some(DeviceRole::Source(source)) => Some(source),
            _ => None,
        }
    }

    pub fn destination(&self) -> Option<&Destination> {
        match &self.role {
            Some(DeviceRole::Destination(dest)) => Some(dest),
            _ => None,
        }
    }

    /// Physical outputs of a switch
    pub fn switch_outputs(&self) -> Option<&[u16]> {
        match &self.role {
            Some(DeviceRole::Switch { outputs }) => Some(outputs),
            _ => None,
        }
    }

    /// Devices bound to this virtual device
    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn connection_status(&self) -> &str {
        &self.connection_status
    }

    pub fn status_changed_at(&self) -> SystemTime {
        self.status_changed_at
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            manufacturer: self.spec.manufacturer.clone(),
            model: self.spec.model.clone(),
            role: self.role_kind().as_str().to_string(),
            connection_status: self.connection_status.clone(),
            status_changed_at: self
                .status_changed_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }
}

/// In-memory collection of every device in the room
pub struct DeviceRegistry {
    devices: Vec<DeviceRecord>,
    initialized: bool,
    feedback: mpsc::UnboundedSender<StatusEvent>,
}

impl DeviceRegistry {
    /// Create an empty registry; driver status changes are posted to `feedback`
    pub fn new(feedback: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self {
            devices: Vec::new(),
            initialized: false,
            feedback,
        }
    }

    /// Register a device. Once the registry is initialized, the device is
    /// initialized immediately; until then it waits for [`initialize`](Self::initialize).
    pub fn add_device(&mut self, spec: DeviceSpec) -> ControlResult<()> {
        if self.get(&spec.id).is_some() {
            return Err(ControlError::DuplicateDevice(spec.id));
        }

        debug!("Registering device {} ({})", spec.id, spec.role.kind().as_str());
        self.devices.push(DeviceRecord::new(spec));

        if self.initialized {
            let index = self.devices.len() - 1;
            if let Err(e) = self.initialize_device(index) {
                self.devices.pop();
                return Err(e);
            }
            if self.devices.iter().any(DeviceRecord::is_virtual) {
                self.bind_virtual_devices();
            }
        }
        Ok(())
    }

    /// One-time initialization of every registered device, role by role,
    /// followed by virtual device binding
    pub fn initialize(&mut self) -> ControlResult<()> {
        if self.initialized {
            return Ok(());
        }

        let mut order: Vec<usize> = (0..self.devices.len()).collect();
        order.sort_by_key(|&i| self.devices[i].role_kind());

        for index in order {
            self.initialize_device(index)?;
        }
        self.bind_virtual_devices();

        self.initialized = true;
        info!("Initialized {} devices", self.devices.len());
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize_device(&mut self, index: usize) -> ControlResult<()> {
        let role = self.build_role(&self.devices[index])?;
        let record = &self.devices[index];
        let driver = Arc::clone(record.driver());
        let id = record.id().to_string();

        let mut subscriptions = vec![(commands::CONNECTION_STATUS.to_string(), None)];
        if record.is_destination() {
            subscriptions.push((commands::POWER.to_string(), None));
        }
        subscriptions.extend(record.spec.subscriptions.iter().cloned());

        for (command, qualifier) in subscriptions {
            if let Err(e) = driver.subscribe_status(&command, qualifier.as_ref(), self.status_callback(&id)) {
                warn!("Failed to subscribe {} on {}: {}", command, id, e);
            }
        }

        let record = &mut self.devices[index];
        if let Some(status) = driver.read_status(commands::CONNECTION_STATUS, None) {
            record.connection_status = status.to_string();
            record.status_changed_at = SystemTime::now();
        }
        record.role = Some(role);
        debug!("Initialized device {}", id);
        Ok(())
    }

    fn build_role(&self, record: &DeviceRecord) -> ControlResult<DeviceRole> {
        Ok(match &record.spec.role {
            RoleSpec::Source(source) => DeviceRole::Source(source.clone()),
            RoleSpec::Destination {
                output,
                kind,
                group_work_source,
                screen,
                confidence_follow,
            } => {
                let source = self.source_by_id(group_work_source).cloned().ok_or_else(|| {
                    ControlError::invalid(
                        record.id(),
                        format!("group work source '{}' is not a registered source", group_work_source),
                    )
                })?;
                let mut dest = Destination::new(record.id(), record.name(), *output, *kind, source);
                dest.screen = screen.clone();
                dest.confidence_follow = confidence_follow.clone();
                DeviceRole::Destination(dest)
            }
            RoleSpec::Switch { outputs } => DeviceRole::Switch {
                outputs: (1..=*outputs).collect(),
            },
            RoleSpec::Camera { presets } => DeviceRole::Camera {
                presets: presets.clone(),
            },
            RoleSpec::Microphone { number } => DeviceRole::Microphone { number: *number },
            RoleSpec::Screen => DeviceRole::Screen,
            RoleSpec::Light => DeviceRole::Light,
            RoleSpec::Shade => DeviceRole::Shade,
            RoleSpec::None => DeviceRole::None,
        })
    }

    fn bind_virtual_devices(&mut self) {
        let tags: Vec<(usize, String)> = self
            .devices
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.spec.virtual_assignment.clone().map(|tag| (i, tag)))
            .collect();

        for (index, tag) in tags {
            let members: Vec<String> = self
                .devices
                .iter()
                .filter(|d| d.spec.assignment.as_deref() == Some(tag.as_str()))
                .map(|d| d.id().to_string())
                .collect();
            let record = &mut self.devices[index];
            if record.members != members {
                info!("Bound {} device(s) to virtual device {}", members.len(), record.id());
                record.members = members;
            }
        }
    }

    /// Callback that forwards a driver's status changes for `device_id` to the feedback channel
    pub fn status_callback(&self, device_id: &str) -> StatusCallback {
        let sender = self.feedback.clone();
        let device_id = device_id.to_string();
        Arc::new(move |command: &str, qualifier: Option<&Qualifier>, value: &Value| {
            let event = StatusEvent {
                device_id: device_id.clone(),
                command: command.to_string(),
                qualifier: qualifier.cloned(),
                value: value.clone(),
            };
            if sender.send(event).is_err() {
                debug!("Feedback channel closed, dropping {} status", command);
            }
        })
    }

    pub fn get(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.id() == id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.devices.iter().filter_map(DeviceRecord::source)
    }

    /// Destinations ordered by output number
    pub fn destinations(&self) -> Vec<&Destination> {
        let mut dests: Vec<&Destination> = self.devices.iter().filter_map(DeviceRecord::destination).collect();
        dests.sort_by_key(|d| d.output);
        dests
    }

    /// The primary matrix switch: the first registered switch
    pub fn switch(&self) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.switch_outputs().is_some())
    }

    pub fn source_by_id(&self, id: &str) -> Option<&Source> {
        self.sources().find(|s| s.id == id)
    }

    /// Resolve a matrix input number. Input 0 always yields the blank source.
    pub fn source_by_input(&self, input: u16) -> ControlResult<Source> {
        if input == BLANK_INPUT {
            return Ok(Source::blank());
        }
        self.sources()
            .find(|s| s.input == input)
            .cloned()
            .ok_or(ControlError::UnknownSource(input))
    }

    /// Find a destination by id or name
    pub fn find_destination(&self, key: &str) -> ControlResult<&Destination> {
        self.devices
            .iter()
            .filter_map(DeviceRecord::destination)
            .find(|d| d.id == key || d.name == key)
            .ok_or_else(|| ControlError::UnknownDestination(key.to_string()))
    }

    /// Record the sources now tied to a destination
    pub(crate) fn set_destination_tie(&mut self, destination_id: &str, tie: MatrixTie) -> ControlResult<()> {
        let dest = self
            .devices
            .iter_mut()
            .find(|d| d.id() == destination_id)
            .and_then(|d| match &mut d.role {
                Some(DeviceRole::Destination(dest)) => Some(dest),
                _ => None,
            })
            .ok_or_else(|| ControlError::UnknownDestination(destination_id.to_string()))?;
        dest.assign(tie);
        Ok(())
    }

    /// Update a device's connection status. Returns true if it changed.
    pub fn set_connection_status(&mut self, device_id: &str, status: &str) -> ControlResult<bool> {
        let record = self
            .devices
            .iter_mut()
            .find(|d| d.id() == device_id)
            .ok_or_else(|| ControlError::UnknownDevice(device_id.to_string()))?;

        if record.connection_status == status {
            return Ok(false);
        }
        record.connection_status = status.to_string();
        record.status_changed_at = SystemTime::now();
        Ok(true)
    }

    pub fn device_info(&self) -> Vec<DeviceInfo> {
        self.devices.iter().map(DeviceRecord::info).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use crate::driver::SimulatedDriver;

    fn registry() -> (DeviceRegistry, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DeviceRegistry::new(tx), rx)
    }

    fn source_spec(id: &str, input: u16) -> DeviceSpec {
        let mut source = Source::blank();
        source.id = id.to_string();
        source.name = id.to_string();
        source.input = input;
        DeviceSpec::new(id, id, Arc::new(SimulatedDriver::new())).with_role(RoleSpec::Source(source))
    }

    fn destination_spec(id: &str, output: u16, group_work_source: &str) -> DeviceSpec {
        DeviceSpec::new(id, id, Arc::new(SimulatedDriver::new())).with_role(RoleSpec::Destination {
            output,
            kind: DestinationType::Monitor,
            group_work_source: group_work_source.to_string(),
            screen: None,
            confidence_follow: None,
        })
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let (mut registry, _rx) = registry();
        registry.add_device(source_spec("PC001", 1)).unwrap();

        let err = registry.add_device(source_spec("PC001", 7)).unwrap_err();
        assert!(matches!(err, ControlError::DuplicateDevice(id) if id == "PC001"));
        assert_eq!(registry.len(), 1);

        registry.initialize().unwrap();
        assert_eq!(registry.source_by_id("PC001").unwrap().input, 1);
    }

    #[test]
    fn test_destinations_initialize_after_sources() {
        let (mut registry, _rx) = registry();
        // Destination registered before the source it depends on
        registry.add_device(destination_spec("MON001", 1, "PC001")).unwrap();
        registry.add_device(source_spec("PC001", 3)).unwrap();
        assert!(registry.get("MON001").unwrap().destination().is_none());

        registry.initialize().unwrap();
        let dest = registry.find_destination("MON001").unwrap();
        assert_eq!(dest.group_work_source.input, 3);
        assert_eq!(dest.assigned(), &MatrixTie::blank());
    }

    #[test]
    fn test_unknown_group_work_source_fails() {
        let (mut registry, _rx) = registry();
        registry.add_device(destination_spec("MON001", 1, "PC404")).unwrap();
        assert!(matches!(registry.initialize(), Err(ControlError::InvalidOption { .. })));
    }

    #[test]
    fn test_add_after_initialize_is_immediate() {
        let (mut registry, _rx) = registry();
        registry.initialize().unwrap();

        registry.add_device(source_spec("PC001", 1)).unwrap();
        assert!(registry.get("PC001").unwrap().is_initialized());
        assert_eq!(registry.source_by_input(1).unwrap().id, "PC001");

        // A failed late initialization leaves no record behind
        assert!(registry.add_device(destination_spec("MON001", 1, "PC404")).is_err());
        assert!(registry.get("MON001").is_none());
    }

    #[test]
    fn test_blank_source_for_input_zero() {
        let (mut registry, _rx) = registry();
        assert!(registry.source_by_input(0).unwrap().is_blank());

        registry.add_device(source_spec("PC001", 1)).unwrap();
        registry.initialize().unwrap();
        assert!(registry.source_by_input(0).unwrap().is_blank());
        assert!(matches!(registry.source_by_input(9), Err(ControlError::UnknownSource(9))));
    }

    #[test]
    fn test_role_predicates() {
        let (mut registry, _rx) = registry();
        registry.add_device(source_spec("PC001", 1)).unwrap();
        let switch = DeviceSpec::new("SW001", "Switch", Arc::new(SimulatedDriver::new()))
            .with_role(RoleSpec::Switch { outputs: 3 });
        registry.add_device(switch).unwrap();
        registry.initialize().unwrap();

        let pc = registry.get("PC001").unwrap();
        assert!(pc.is_source() && !pc.is_destination() && !pc.is_switch());
        let sw = registry.switch().unwrap();
        assert_eq!(sw.id(), "SW001");
        assert_eq!(sw.switch_outputs(), Some(&[1, 2, 3][..]));
    }

    #[test]
    fn test_virtual_devices_bind_members() {
        let (mut registry, _rx) = registry();
        let mut virtual_switch = DeviceSpec::new("VMX001", "Virtual Matrix", Arc::new(SimulatedDriver::new()));
        virtual_switch.virtual_assignment = Some("room-a".to_string());
        registry.add_device(virtual_switch).unwrap();

        let mut encoder = source_spec("ENC001", 1);
        encoder.assignment = Some("room-a".to_string());
        registry.add_device(encoder).unwrap();
        registry.initialize().unwrap();
        assert!(registry.get("VMX001").unwrap().is_virtual());
        assert!(!registry.get("ENC001").unwrap().is_virtual());
        assert_eq!(registry.get("VMX001").unwrap().members(), &["ENC001".to_string()]);

        let mut decoder = destination_spec("DEC001", 1, "ENC001");
        decoder.assignment = Some("room-a".to_string());
        registry.add_device(decoder).unwrap();
        assert_eq!(registry.get("VMX001").unwrap().members().len(), 2);
    }

    #[tokio::test]
    async fn test_connection_status_reaches_feedback() {
        let (mut registry, mut rx) = registry();
        let driver = Arc::new(SimulatedDriver::new());
        registry
            .add_device(DeviceSpec::new("DSP001", "DSP", driver.clone()))
            .unwrap();
        registry.initialize().unwrap();
        assert_eq!(registry.get("DSP001").unwrap().connection_status(), "Connected");

        driver.set_offline(true);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.device_id, "DSP001");
        assert_eq!(event.command, commands::CONNECTION_STATUS);
        assert_eq!(event.value, Value::from("Disconnected"));

        assert!(registry.set_connection_status("DSP001", "Disconnected").unwrap());
        assert!(!registry.set_connection_status("DSP001", "Disconnected").unwrap());
        assert!(registry.set_connection_status("NOPE", "Connected").is_err());
    }

    #[test]
    fn test_spec_from_config_validation() {
        let config = RoomConfig::default();
        let driver: Arc<dyn DeviceDriver> = Arc::new(SimulatedDriver::new());

        let projector = config.devices.iter().find(|d| d.id == "PRJ001").unwrap();
        let spec = DeviceSpec::from_config(projector, driver.clone()).unwrap();
        assert!(matches!(spec.role, RoleSpec::Destination { output: 1, kind: DestinationType::ProjectorWithScreen, .. }));
        assert_eq!(spec.polls.len(), 1);

        let mut two_roles = projector.clone();
        two_roles.options.switch = Some(Default::default());
        assert!(matches!(DeviceSpec::from_config(&two_roles, driver.clone()), Err(ControlError::InvalidOption { .. })));

        let mut no_input = config.devices[0].clone();
        no_input.options.source.as_mut().unwrap().input = None;
        assert!(matches!(
            DeviceSpec::from_config(&no_input, driver.clone()),
            Err(ControlError::MissingOption { option: "source.input", .. })
        ));

        let mut bad_type = projector.clone();
        bad_type.options.destination.as_mut().unwrap().kind = Some("tv".to_string());
        assert!(matches!(DeviceSpec::from_config(&bad_type, driver.clone()), Err(ControlError::InvalidValue(_))));

        let mut zero_cadence = projector.clone();
        zero_cadence.polling[0].active = 0;
        assert!(DeviceSpec::from_config(&zero_cadence, driver).is_err());
    }
}
