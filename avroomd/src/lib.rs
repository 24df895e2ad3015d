//! avroom Daemon Library
//!
//! This library provides the control core for an AV room:
//! - Device registry and cadence-based status polling
//! - Matrix routing between sources and destinations
//! - Activity/state transitions with UI feedback
//! - Alerts on device status
//! - IPC communication

use avroom_common::{tracing, DeviceInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod alert;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod event;
pub mod ipc;
pub mod matrix;
pub mod model;
pub mod polling;
pub mod transition;
pub mod ui;

#[cfg(test)]
mod testutil;

// Re-export common types
pub use avroom_common::{ActivityMode, MatrixAction, MatrixOutput, SystemState, TieType, TransitionState};
pub use error::{ControlError, ControlResult};

use alert::{Alert, AlertMonitor};
use config::{ConfigError, DeviceConfig, RoomConfig};
use device::{DeviceRecord, DeviceRegistry, DeviceSpec};
use driver::{commands, DeviceDriver, DriverResult, SimulatedDriver};
use event::{StatusEvent, SystemEvent};
use matrix::{DestinationRef, DestinationTie, MatrixController};
use model::MatrixTie;
use polling::{PollObject, PollingDispatcher, PollingMode};
use transition::{EngineSettings, TransitionEngine};
use ui::UiHost;

const EVENT_CAPACITY: usize = 256;

/// Creates the driver for a device from its configuration record
pub type DriverFactory = Arc<dyn Fn(&DeviceConfig) -> DriverResult<Arc<dyn DeviceDriver>> + Send + Sync>;

/// Factory behind `interface.driver: simulated`
pub fn simulated_driver(config: &DeviceConfig) -> DriverResult<Arc<dyn DeviceDriver>> {
    let driver = match config.options.switch.as_ref().and_then(|s| s.outputs) {
        Some(outputs) => SimulatedDriver::matrix(1..=outputs),
        None => SimulatedDriver::new(),
    };
    Ok(Arc::new(driver))
}

/// Snapshot for status queries
#[derive(Debug, Clone)]
pub struct ControllerStatus {
    pub system_state: SystemState,
    pub activity: ActivityMode,
    pub transition: Option<TransitionState>,
    pub devices_count: usize,
    pub uptime: Duration,
}

/// Collects drivers and UI hosts before the controller is built
pub struct SystemControllerBuilder {
    config: RoomConfig,
    ui_hosts: Vec<Arc<dyn UiHost>>,
    drivers: HashMap<String, Arc<dyn DeviceDriver>>,
    factories: HashMap<String, DriverFactory>,
}

impl SystemControllerBuilder {
    pub fn ui_host(mut self, host: Arc<dyn UiHost>) -> Self {
        self.ui_hosts.push(host);
        self
    }

    /// Use this driver for the device, whatever its interface says
    pub fn driver(mut self, device_id: impl Into<String>, driver: Arc<dyn DeviceDriver>) -> Self {
        self.drivers.insert(device_id.into(), driver);
        self
    }

    /// Make a driver name available to `interface.driver`
    pub fn driver_factory(mut self, name: impl Into<String>, factory: DriverFactory) -> Self {
        self.factories.insert(name.into(), factory);
        self
    }

    /// Register every configured device and wire up the components.
    /// Nothing runs until [`SystemController::start`].
    pub fn build(mut self) -> ControlResult<SystemController> {
        let system = &self.config.system;
        if system.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be greater than zero".to_string()).into());
        }

        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        let mut registry = DeviceRegistry::new(feedback_tx);

        for device in &self.config.devices {
            let driver = match self.drivers.remove(&device.id) {
                Some(driver) => driver,
                None => {
                    let name = &device.interface.driver;
                    let factory = self
                        .factories
                        .get(name)
                        .ok_or_else(|| ControlError::invalid(&device.id, format!("unknown driver '{}'", name)))?;
                    factory(device).map_err(|e| ControlError::driver(&device.id, e))?
                }
            };
            registry.add_device(DeviceSpec::from_config(device, driver)?)?;
        }
        for id in self.drivers.keys() {
            warn!("Driver supplied for unconfigured device {}", id);
        }

        let alerts = self
            .config
            .alerts
            .iter()
            .map(|config| {
                if registry.get(&config.device).is_none() {
                    return Err(ControlError::UnknownDevice(config.device.clone()));
                }
                Alert::from_config(config)
            })
            .collect::<ControlResult<Vec<_>>>()?;

        let registry = Arc::new(RwLock::new(registry));
        let polling = Arc::new(PollingDispatcher::new(Duration::from_millis(system.poll_interval_ms)));
        let matrix = Arc::new(MatrixController::new(Arc::clone(&registry), self.ui_hosts.clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let engine = TransitionEngine::new(
            EngineSettings {
                timers: system.timers,
                default_source: system.default_source.clone(),
                primary_destination: system.primary_destination.clone(),
            },
            Arc::clone(&registry),
            Arc::clone(&matrix),
            Arc::clone(&polling),
            self.ui_hosts.clone(),
            events.clone(),
        );

        Ok(SystemController {
            config: self.config,
            started_at: Instant::now(),
            registry,
            polling,
            matrix,
            engine,
            alerts: Arc::new(Mutex::new(AlertMonitor::new(alerts))),
            events,
            feedback_rx: std::sync::Mutex::new(Some(feedback_rx)),
            feedback_task: std::sync::Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }
}

/// Owns the registry, polling, routing and transition engine of one room
pub struct SystemController {
    config: RoomConfig,
    started_at: Instant,
    registry: Arc<RwLock<DeviceRegistry>>,
    polling: Arc<PollingDispatcher>,
    matrix: Arc<MatrixController>,
    engine: TransitionEngine,
    alerts: Arc<Mutex<AlertMonitor>>,
    events: broadcast::Sender<SystemEvent>,
    feedback_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
    feedback_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SystemController {
    pub fn builder(config: RoomConfig) -> SystemControllerBuilder {
        let simulated: DriverFactory = Arc::new(simulated_driver);
        let mut factories = HashMap::new();
        factories.insert("simulated".to_string(), simulated);

        SystemControllerBuilder {
            config,
            ui_hosts: Vec::new(),
            drivers: HashMap::new(),
            factories,
        }
    }

    /// Initialize devices, start polling and feedback processing
    pub async fn start(&self) -> ControlResult<()> {
        if self.is_started() {
            return Ok(());
        }
        let feedback_rx = self
            .feedback_rx
            .lock()
            .map_err(|_| ControlError::ShutDown)?
            .take()
            .ok_or(ControlError::ShutDown)?;

        {
            let mut registry = self.registry.write().await;
            registry.initialize()?;

            let system = &self.config.system;
            if let Some(id) = &system.default_source {
                if registry.source_by_id(id).is_none() {
                    return Err(ControlError::invalid(id, "default source is not a registered source"));
                }
            }
            if let Some(primary) = &system.primary_destination {
                registry.find_destination(primary)?;
            }

            for record in registry.devices() {
                self.register_polls(&registry, record)?;
            }

            let raised = self.alerts.lock().await.evaluate_all(|alert| {
                registry
                    .get(&alert.device)
                    .and_then(|r| r.driver().read_status(&alert.command, alert.qualifier.as_ref()))
            });
            for alert in raised {
                let _ = self.events.send(SystemEvent::Alert(alert));
            }
        }

        let task = tokio::spawn(run_feedback(
            feedback_rx,
            Arc::clone(&self.registry),
            Arc::clone(&self.alerts),
            self.events.clone(),
        ));
        if let Ok(mut slot) = self.feedback_task.lock() {
            *slot = Some(task);
        }

        self.polling.set_polling_mode(PollingMode::Inactive);
        self.engine.start().await;
        self.started.store(true, Ordering::SeqCst);

        info!("System controller started with {} devices", self.registry.read().await.len());
        Ok(())
    }

    /// Stop timers, polling and feedback processing
    pub async fn shutdown(&self) {
        info!("Shutting down system controller");
        self.started.store(false, Ordering::SeqCst);
        self.engine.stop().await;
        self.polling.stop();
        if let Ok(mut slot) = self.feedback_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn ensure_started(&self) -> ControlResult<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(ControlError::NotStarted)
        }
    }

    fn register_polls(&self, registry: &DeviceRegistry, record: &DeviceRecord) -> ControlResult<()> {
        for poll in record.polls() {
            self.polling.add_poll(PollObject {
                device_id: record.id().to_string(),
                driver: Arc::clone(record.driver()),
                command: poll.command.clone(),
                qualifier: poll.qualifier.clone(),
                active: poll.active,
                inactive: poll.inactive,
                callback: poll.feedback.then(|| registry.status_callback(record.id())),
            })?;
        }
        Ok(())
    }

    /// Register a device at runtime. After start it is initialized and polled at once.
    pub async fn add_device(&self, spec: DeviceSpec) -> ControlResult<()> {
        let id = spec.id.clone();
        let mut registry = self.registry.write().await;
        registry.add_device(spec)?;

        if self.is_started() {
            if let Some(record) = registry.get(&id) {
                self.register_polls(&registry, record)?;
            }
        }
        info!("Added device {}", id);
        Ok(())
    }

    pub async fn request_activity(&self, activity: ActivityMode) -> ControlResult<Option<TransitionState>> {
        self.ensure_started()?;
        Ok(self.engine.request_activity(activity).await)
    }

    pub async fn prompt_shutdown(&self) -> ControlResult<bool> {
        self.ensure_started()?;
        Ok(self.engine.prompt_shutdown().await)
    }

    pub async fn state(&self) -> (SystemState, ActivityMode) {
        self.engine.state().await
    }

    pub async fn transition_state(&self) -> Option<TransitionState> {
        self.engine.transition_state().await
    }

    pub async fn status(&self) -> ControllerStatus {
        let (system_state, activity) = self.engine.state().await;
        ControllerStatus {
            system_state,
            activity,
            transition: self.engine.transition_state().await,
            devices_count: self.registry.read().await.len(),
            uptime: self.started_at.elapsed(),
        }
    }

    pub async fn current_sources(&self, update: bool) -> ControlResult<Vec<DestinationTie>> {
        self.ensure_started()?;
        self.matrix.current_sources(update).await
    }

    pub async fn current_source_for_destination<'a>(
        &self,
        dest: impl Into<DestinationRef<'a>>,
        update: bool,
    ) -> ControlResult<MatrixTie> {
        self.ensure_started()?;
        self.matrix.current_source_for_destination(dest, update).await
    }

    pub async fn apply_matrix_actions(&self, actions: &[MatrixAction]) -> ControlResult<Vec<DestinationTie>> {
        self.ensure_started()?;
        self.matrix.apply(actions).await
    }

    pub async fn devices(&self) -> Vec<DeviceInfo> {
        self.registry.read().await.device_info()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.events.subscribe()
    }

    pub fn engine(&self) -> &TransitionEngine {
        &self.engine
    }

    pub fn polling(&self) -> &PollingDispatcher {
        &self.polling
    }

    pub fn registry(&self) -> &Arc<RwLock<DeviceRegistry>> {
        &self.registry
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }
}

/// Single consumer of driver status changes
async fn run_feedback(
    mut feedback: mpsc::UnboundedReceiver<StatusEvent>,
    registry: Arc<RwLock<DeviceRegistry>>,
    alerts: Arc<Mutex<AlertMonitor>>,
    events: broadcast::Sender<SystemEvent>,
) {
    while let Some(event) = feedback.recv().await {
        debug!("Feedback {} {} = {}", event.device_id, event.command, event.value);

        if event.command == commands::CONNECTION_STATUS {
            let status = event.value.to_string();
            match registry.write().await.set_connection_status(&event.device_id, &status) {
                Ok(true) => info!("{} is now {}", event.device_id, status),
                Ok(false) => {}
                Err(e) => warn!("Connection status not recorded: {}", e),
            }
        }

        if event.command == commands::POWER {
            mirror_power(&registry, &event).await;
        }

        for alert in alerts.lock().await.process(&event) {
            let _ = events.send(SystemEvent::Alert(alert));
        }
        let _ = events.send(SystemEvent::Feedback(event));
    }
    debug!("Feedback channel closed");
}

/// Copy a display's power status onto destinations that follow it
async fn mirror_power(registry: &RwLock<DeviceRegistry>, event: &StatusEvent) {
    let followers: Vec<(String, Arc<dyn DeviceDriver>)> = {
        let registry = registry.read().await;
        registry
            .destinations()
            .into_iter()
            .filter(|d| d.confidence_follow.as_deref() == Some(event.device_id.as_str()))
            .filter_map(|d| registry.get(&d.id).map(|r| (d.id.clone(), Arc::clone(r.driver()))))
            .collect()
    };

    for (id, driver) in followers {
        if driver.read_status(commands::POWER, None).as_ref() == Some(&event.value) {
            continue;
        }
        debug!("{} follows {} power: {}", id, event.device_id, event.value);
        if let Err(e) = driver.set(commands::POWER, event.value.clone(), None).await {
            warn!("Failed to mirror power onto {}: {}", id, e);
        }
    }
}
