use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// Re-export common dependencies
pub use serde;
pub use bincode;
pub use tokio;
pub use tracing;

// IPC client module
pub mod ipc_client;

/// Returned when a string does not name a known enum variant
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self { kind, value: value.to_string() }
    }
}

/// Raw power state of the room
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SystemState {
    Standby,
    Active,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SystemState::Standby => write!(f, "standby"),
            SystemState::Active => write!(f, "active"),
        }
    }
}

/// How the room is being used. Everything except `Standby` requires an active system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActivityMode {
    Standby,
    Share,
    AdvShare,
    GroupWork,
}

impl ActivityMode {
    /// Whether this activity needs the system powered up
    pub fn requires_active(&self) -> bool {
        !matches!(self, ActivityMode::Standby)
    }

    /// Human-readable label used on transition overlays
    pub fn label(&self) -> &'static str {
        match self {
            ActivityMode::Standby => "Standby",
            ActivityMode::Share => "Share",
            ActivityMode::AdvShare => "Adv. Share",
            ActivityMode::GroupWork => "Group Work",
        }
    }
}

impl fmt::Display for ActivityMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ActivityMode::Standby => "standby",
            ActivityMode::Share => "share",
            ActivityMode::AdvShare => "adv_share",
            ActivityMode::GroupWork => "group_work",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ActivityMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "standby" => Ok(ActivityMode::Standby),
            "share" => Ok(ActivityMode::Share),
            "adv_share" | "advshare" => Ok(ActivityMode::AdvShare),
            "group_work" | "groupwork" => Ok(ActivityMode::GroupWork),
            _ => Err(ParseEnumError::new("activity", s)),
        }
    }
}

/// One axis of a pending transition: whether it changes, and where it is heading.
///
/// `target` always holds the value the axis will have once the transition
/// completes, so it equals the current value when `pending` is false.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingChange<T> {
    pub pending: bool,
    pub target: T,
}

/// Snapshot of a requested transition across both axes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransitionState {
    pub state: PendingChange<SystemState>,
    pub activity: PendingChange<ActivityMode>,
}

impl TransitionState {
    /// Work out the combined transition implied by asking for `requested`
    /// while the room is at (`state`, `activity`).
    pub fn compute(state: SystemState, activity: ActivityMode, requested: ActivityMode) -> Self {
        let target_state = if requested.requires_active() {
            SystemState::Active
        } else {
            SystemState::Standby
        };

        Self {
            state: PendingChange {
                pending: target_state != state,
                target: target_state,
            },
            activity: PendingChange {
                pending: requested != activity,
                target: requested,
            },
        }
    }
}

/// Which signal planes a matrix tie affects
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TieType {
    Untie,
    Audio,
    Video,
    AudioVideo,
}

impl TieType {
    /// Wire name understood by switch drivers
    pub fn as_str(&self) -> &'static str {
        match self {
            TieType::Untie => "Untie",
            TieType::Audio => "Audio",
            TieType::Video => "Video",
            TieType::AudioVideo => "Audio/Video",
        }
    }

    pub fn carries_video(&self) -> bool {
        matches!(self, TieType::Video | TieType::AudioVideo)
    }

    pub fn carries_audio(&self) -> bool {
        matches!(self, TieType::Audio | TieType::AudioVideo)
    }
}

impl fmt::Display for TieType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TieType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "untie" => Ok(TieType::Untie),
            "audio" | "aud" => Ok(TieType::Audio),
            "video" | "vid" => Ok(TieType::Video),
            "audio/video" | "av" | "audiovideo" => Ok(TieType::AudioVideo),
            _ => Err(ParseEnumError::new("tie type", s)),
        }
    }
}

/// Target of a matrix tie: one output, or every output at once
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MatrixOutput {
    All,
    Output(u16),
}

impl fmt::Display for MatrixOutput {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MatrixOutput::All => write!(f, "all"),
            MatrixOutput::Output(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for MatrixOutput {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(MatrixOutput::All);
        }
        s.parse::<u16>()
            .map(MatrixOutput::Output)
            .map_err(|_| ParseEnumError::new("matrix output", s))
    }
}

/// A single routing command. Input 0 means "no source".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatrixAction {
    pub output: MatrixOutput,
    pub input: u16,
    pub tie_type: TieType,
}

impl MatrixAction {
    pub fn new(output: MatrixOutput, input: u16, tie_type: TieType) -> Self {
        Self { output, input, tie_type }
    }

    /// Audio/video tie of `input` to every output
    pub fn broadcast(input: u16) -> Self {
        Self::new(MatrixOutput::All, input, TieType::AudioVideo)
    }
}

impl fmt::Display for MatrixAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.input, self.output, self.tie_type)
    }
}

/// Information about a registered device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub role: String,
    pub connection_status: String,
    /// Seconds since the Unix epoch of the last connection status change
    pub status_changed_at: u64,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}] {} {} ({}, {})",
               self.id, self.role, self.manufacturer, self.model, self.name, self.connection_status)
    }
}

/// What one destination is currently showing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteInfo {
    pub destination_id: String,
    pub destination_name: String,
    pub output: u16,
    pub video_source: String,
    pub audio_source: String,
}

impl fmt::Display for RouteInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (out {}): video={} audio={}",
               self.destination_name, self.output, self.video_source, self.audio_source)
    }
}

/// IPC Requests from control clients (panels, schedulers, CLI) to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Get daemon status, current state and any pending transition
    GetStatus,

    /// Ask the room to move to an activity
    RequestActivity {
        activity: ActivityMode,
    },

    /// Read back destination -> source assignments
    GetCurrentSources {
        update: bool,
    },

    /// Apply routing commands directly
    MatrixAction {
        actions: Vec<MatrixAction>,
    },

    /// List all registered devices
    GetDevices,

    /// Show the shutdown confirmation prompt on every panel
    PromptShutdown,
}

/// IPC Responses from daemon to clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Status information
    Status {
        version: String,
        uptime_seconds: u64,
        system_state: SystemState,
        activity: ActivityMode,
        transition: Option<TransitionState>,
        devices_count: usize,
    },

    /// Destination routing after a query or action
    Routes(Vec<RouteInfo>),

    /// List of registered devices
    Devices(Vec<DeviceInfo>),

    /// Acknowledgment of successful operation
    Ack,

    /// Error response
    Error(String),
}

/// Serialization helpers for the IPC protocol
pub fn serialize<T: Serialize>(msg: &T) -> Vec<u8> {
    bincode::serialize(msg).unwrap_or_else(|e| {
        tracing::error!("Failed to serialize message: {:?}", e);
        Vec::new()
    })
}

pub fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}
