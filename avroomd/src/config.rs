use avroom_common::tracing;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::driver::{Qualifier, Value};

/// Default location of the room configuration
pub const DEFAULT_CONFIG_PATH: &str = "/etc/avroomd/room.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration manager for the avroom daemon
pub struct ConfigManager {
    pub config_path: PathBuf,
    pub config: RoomConfig,
}

/// Complete room configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub system: SystemSettings,
    #[serde(default)]
    pub ui_hosts: Vec<UiHostConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub alerts: Vec<AlertConfig>,
}

/// Daemon-specific settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    pub socket_path: String,
    pub log_level: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            socket_path: avroom_common::ipc_client::DEFAULT_SOCKET_PATH.to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Room-wide behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    /// Source shown everywhere when the room powers up
    pub default_source: Option<String>,
    /// Destination whose source is preserved across activity changes
    pub primary_destination: Option<String>,
    /// Wall-clock length of one polling cycle
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub timers: TransitionTimers,
}

fn default_poll_interval() -> u64 {
    1000
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            default_source: None,
            primary_destination: None,
            poll_interval_ms: default_poll_interval(),
            timers: TransitionTimers::default(),
        }
    }
}

/// Transition timer durations in seconds. Used as given.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransitionTimers {
    pub startup_max: u32,
    pub startup_min: u32,
    pub switch_max: u32,
    pub shutdown_max: u32,
    pub shutdown_min: u32,
    pub shutdown_confirmation: u32,
    /// Seconds in standby before panels fall back to the splash page; 0 disables
    pub splash_timeout: u32,
}

impl Default for TransitionTimers {
    fn default() -> Self {
        Self {
            startup_max: 20,
            startup_min: 5,
            switch_max: 3,
            shutdown_max: 15,
            shutdown_min: 3,
            shutdown_confirmation: 30,
            splash_timeout: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiHostConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// One device record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub model: String,
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
    #[serde(default)]
    pub polling: Vec<PollConfig>,
    #[serde(default)]
    pub options: DeviceOptions,
}

/// Which driver to load, plus whatever connection parameters it needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub driver: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

pub type QualifierConfig = BTreeMap<String, serde_yaml::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub command: String,
    #[serde(default)]
    pub qualifier: Option<QualifierConfig>,
}

/// A status to poll; cadences are in polling cycles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    pub command: String,
    #[serde(default)]
    pub qualifier: Option<QualifierConfig>,
    pub active: u32,
    pub inactive: u32,
    /// Also subscribe, so refreshed values flow back as feedback
    #[serde(default)]
    pub feedback: bool,
}

/// Role-specific options. At most one role block may be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<DestinationOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub switch: Option<SwitchOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<CameraOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub microphone: Option<MicrophoneOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<MarkerOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<MarkerOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shade: Option<MarkerOptions>,
    /// Tag matched against a virtual device's `virtual_assignment`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<String>,
    /// Marks this device as virtual; it is bound to every device with a matching `assignment`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_assignment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceOptions {
    pub input: Option<u16>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub source_control_page: Option<String>,
    #[serde(default)]
    pub advanced_control_page: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationOptions {
    pub output: Option<u16>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub group_work_source: Option<String>,
    #[serde(default)]
    pub screen: Option<String>,
    #[serde(default)]
    pub confidence_follow: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchOptions {
    pub outputs: Option<u16>,
    #[serde(default)]
    pub inputs: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CameraOptions {
    #[serde(default)]
    pub presets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MicrophoneOptions {
    #[serde(default)]
    pub number: Option<u16>,
}

/// Role block without settings of its own
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkerOptions {}

/// An alert condition watched on a device status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    pub id: String,
    pub device: String,
    pub command: String,
    #[serde(default)]
    pub qualifier: Option<QualifierConfig>,
    /// One of eq, neq, gt, gte, lt, lte, in, not_in, is, is_not
    pub operator: String,
    #[serde(default)]
    pub value: Option<serde_yaml::Value>,
    #[serde(default)]
    pub values: Vec<serde_yaml::Value>,
    pub message: String,
}

/// Convert a scalar YAML value into a driver value
pub fn yaml_to_value(value: &serde_yaml::Value) -> Result<Value, ConfigError> {
    match value {
        serde_yaml::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(ConfigError::Invalid(format!("unsupported number {}", n)))
            }
        }
        serde_yaml::Value::String(s) => Ok(Value::Text(s.clone())),
        other => Err(ConfigError::Invalid(format!("expected a scalar value, found {:?}", other))),
    }
}

/// Convert a YAML qualifier map
pub fn yaml_to_qualifier(qualifier: Option<&QualifierConfig>) -> Result<Option<Qualifier>, ConfigError> {
    qualifier
        .map(|q| {
            q.iter()
                .map(|(k, v)| Ok((k.clone(), yaml_to_value(v)?)))
                .collect::<Result<Qualifier, ConfigError>>()
        })
        .transpose()
}

impl RoomConfig {
    pub fn from_yaml(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Maximum log level from `daemon.log_level`, defaulting to INFO
    pub fn log_level(&self) -> tracing::Level {
        self.daemon.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

fn sim_device(id: &str, name: &str, options: DeviceOptions) -> DeviceConfig {
    DeviceConfig {
        id: id.to_string(),
        name: name.to_string(),
        manufacturer: "Simulated".to_string(),
        model: String::new(),
        interface: InterfaceConfig {
            driver: "simulated".to_string(),
            params: BTreeMap::new(),
        },
        subscriptions: Vec::new(),
        polling: Vec::new(),
        options,
    }
}

fn power_poll() -> PollConfig {
    PollConfig {
        command: "Power".to_string(),
        qualifier: None,
        active: 5,
        inactive: 60,
        feedback: true,
    }
}

impl Default for RoomConfig {
    /// A small simulated room: two sources, a projector with screen, a
    /// monitor and a four-output switch.
    fn default() -> Self {
        let mut projector = sim_device("PRJ001", "Front Projector", DeviceOptions {
            destination: Some(DestinationOptions {
                output: Some(1),
                kind: Some("proj+scn".to_string()),
                group_work_source: Some("PC001".to_string()),
                screen: Some("SCN001".to_string()),
                confidence_follow: None,
            }),
            ..Default::default()
        });
        projector.polling.push(power_poll());

        let mut monitor = sim_device("MON001", "Side Monitor", DeviceOptions {
            destination: Some(DestinationOptions {
                output: Some(2),
                kind: Some("mon".to_string()),
                group_work_source: Some("WPOD001".to_string()),
                screen: None,
                confidence_follow: None,
            }),
            ..Default::default()
        });
        monitor.polling.push(power_poll());

        Self {
            daemon: DaemonSettings::default(),
            system: SystemSettings {
                default_source: Some("PC001".to_string()),
                primary_destination: Some("PRJ001".to_string()),
                ..Default::default()
            },
            ui_hosts: vec![UiHostConfig {
                id: "TP001".to_string(),
                name: "Lectern Panel".to_string(),
            }],
            devices: vec![
                sim_device("PC001", "Lectern PC", DeviceOptions {
                    source: Some(SourceOptions {
                        input: Some(1),
                        icon: Some("pc".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                sim_device("WPOD001", "Wireless Pod", DeviceOptions {
                    source: Some(SourceOptions {
                        input: Some(2),
                        icon: Some("wireless".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                sim_device("SCN001", "Projection Screen", DeviceOptions {
                    screen: Some(MarkerOptions {}),
                    ..Default::default()
                }),
                projector,
                monitor,
                sim_device("SW001", "Matrix Switch", DeviceOptions {
                    switch: Some(SwitchOptions {
                        outputs: Some(4),
                        inputs: Some(4),
                    }),
                    ..Default::default()
                }),
            ],
            alerts: Vec::new(),
        }
    }
}

impl ConfigManager {
    /// Create a configuration manager for the given path, starting from defaults
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            config: RoomConfig::default(),
        }
    }

    /// Load configuration from disk, writing the defaults if no file exists
    pub async fn load_config(&mut self) -> Result<(), ConfigError> {
        info!("Loading configuration from {}", self.config_path.display());

        if self.config_path.exists() {
            let content = fs::read_to_string(&self.config_path).await?;
            self.config = RoomConfig::from_yaml(&content)?;
            debug!("Loaded {} devices from disk", self.config.devices.len());
        } else {
            warn!("Configuration file not found, using defaults");
            self.save_config().await?;
        }

        Ok(())
    }

    /// Save configuration to disk
    pub async fn save_config(&self) -> Result<(), ConfigError> {
        info!("Saving configuration to {}", self.config_path.display());

        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.config_path, self.config.to_yaml()?).await?;

        debug!("Configuration saved");
        Ok(())
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &RoomConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_config_writes_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("etc").join("room.yaml");

        let mut manager = ConfigManager::new(&config_path);
        manager.load_config().await.unwrap();
        assert!(config_path.exists());

        let mut reloaded = ConfigManager::new(&config_path);
        reloaded.config.devices.clear();
        reloaded.load_config().await.unwrap();
        assert_eq!(reloaded.config().devices.len(), manager.config().devices.len());
        assert_eq!(reloaded.config().system.timers, TransitionTimers::default());
    }

    #[test]
    fn test_parse_room_yaml() {
        let yaml = r#"
system:
  default_source: PC001
  primary_destination: PRJ001
  timers:
    startup_max: 30
ui_hosts:
  - id: TP001
devices:
  - id: PC001
    name: Lectern PC
    interface: { driver: simulated }
    options:
      source: { input: 1 }
  - id: SW001
    name: Switcher
    interface:
      driver: serial
      port: /dev/ttyUSB0
      baud: 9600
    polling:
      - command: OutputTieStatus
        qualifier: { Output: 1, Tie Type: Video }
        active: 2
        inactive: 10
    options:
      switch: { outputs: 8 }
"#;
        let config = RoomConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.system.timers.startup_max, 30);
        assert_eq!(config.system.timers.startup_min, 5);
        assert_eq!(config.system.poll_interval_ms, 1000);
        assert_eq!(config.devices.len(), 2);

        let switch = &config.devices[1];
        assert_eq!(switch.interface.driver, "serial");
        assert_eq!(switch.interface.params.get("baud"), Some(&serde_yaml::Value::from(9600)));
        assert_eq!(switch.options.switch.as_ref().unwrap().outputs, Some(8));

        let poll = &switch.polling[0];
        let qualifier = yaml_to_qualifier(poll.qualifier.as_ref()).unwrap().unwrap();
        assert_eq!(qualifier.get("Output"), Some(&Value::Int(1)));
        assert_eq!(qualifier.get("Tie Type"), Some(&Value::from("Video")));
        assert!(!poll.feedback);
    }

    #[test]
    fn test_non_scalar_qualifier_rejected() {
        let mut q = QualifierConfig::new();
        q.insert("Output".to_string(), serde_yaml::Value::Sequence(vec![]));
        assert!(matches!(yaml_to_qualifier(Some(&q)), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_log_level_fallback() {
        let mut config = RoomConfig::default();
        assert_eq!(config.log_level(), tracing::Level::INFO);
        config.daemon.log_level = "debug".to_string();
        assert_eq!(config.log_level(), tracing::Level::DEBUG);
        config.daemon.log_level = "chatty".to_string();
        assert_eq!(config.log_level(), tracing::Level::INFO);
    }
}
