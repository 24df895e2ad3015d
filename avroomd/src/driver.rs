//! Device driver contract.
//!
//! The control core talks to hardware only through [`DeviceDriver`]. Transport
//! details (serial, SSH, HTTP) live in the driver implementations; the core
//! depends on nothing but these four methods.

use async_trait::async_trait;
use avroom_common::{tracing, MatrixOutput, TieType};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::debug;

// Type alias for driver errors that implement Send + Sync
pub type DriverResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Command names shared between the core and switch/display drivers
pub mod commands {
    pub const MATRIX_TIE: &str = "MatrixTieCommand";
    pub const OUTPUT_TIE_STATUS: &str = "OutputTieStatus";
    pub const CONNECTION_STATUS: &str = "ConnectionStatus";
    pub const POWER: &str = "Power";
    pub const SCREEN: &str = "Screen";

    pub const QUALIFIER_OUTPUT: &str = "Output";
    pub const QUALIFIER_TIE_TYPE: &str = "Tie Type";

    pub const POWER_ON: &str = "On";
    pub const POWER_OFF: &str = "Off";
    pub const SCREEN_DOWN: &str = "Down";
    pub const SCREEN_UP: &str = "Up";
}

/// A status or command value exchanged with a driver
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Value::Int(i as i64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<MatrixOutput> for Value {
    fn from(output: MatrixOutput) -> Self {
        match output {
            MatrixOutput::All => Value::Text("All".to_string()),
            MatrixOutput::Output(n) => Value::Int(n as i64),
        }
    }
}

/// Named arguments that select which instance of a command is meant
/// (for example `{"Output": 2, "Tie Type": "Video"}`)
pub type Qualifier = BTreeMap<String, Value>;

/// Build a qualifier from key/value pairs
pub fn qualifier<I, K, V>(pairs: I) -> Qualifier
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// Qualifier used to read one plane of an output's tie status
pub fn tie_status_qualifier(output: u16, plane: TieType) -> Qualifier {
    qualifier([
        (commands::QUALIFIER_OUTPUT, Value::from(output)),
        (commands::QUALIFIER_TIE_TYPE, Value::from(plane.as_str())),
    ])
}

/// Invoked by a driver when a subscribed status changes: (command, qualifier, value)
pub type StatusCallback = Arc<dyn Fn(&str, Option<&Qualifier>, &Value) + Send + Sync>;

/// Trait implemented by every hardware driver
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Issue a command
    async fn set(&self, command: &str, value: Value, qualifier: Option<&Qualifier>) -> DriverResult<()>;

    /// Ask the device to refresh a status; the result arrives via subscriptions
    async fn update(&self, command: &str, qualifier: Option<&Qualifier>) -> DriverResult<()>;

    /// Last known value of a status, without querying the device
    fn read_status(&self, command: &str, qualifier: Option<&Qualifier>) -> Option<Value>;

    /// Register for change notifications on a status
    fn subscribe_status(
        &self,
        command: &str,
        qualifier: Option<&Qualifier>,
        callback: StatusCallback,
    ) -> DriverResult<()>;
}

/// One call made against a [`SimulatedDriver`]
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Set {
        command: String,
        value: Value,
        qualifier: Option<Qualifier>,
    },
    Update {
        command: String,
        qualifier: Option<Qualifier>,
    },
}

type StatusKey = (String, String);

fn status_key(command: &str, qualifier: Option<&Qualifier>) -> StatusKey {
    let q = qualifier
        .map(|q| {
            q.iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(";")
        })
        .unwrap_or_default();
    (command.to_string(), q)
}

struct Subscription {
    command: String,
    qualifier: Option<Qualifier>,
    callback: StatusCallback,
}

impl Subscription {
    fn matches(&self, command: &str, qualifier: Option<&Qualifier>) -> bool {
        if self.command != command {
            return false;
        }
        match (&self.qualifier, qualifier) {
            (None, _) => true,
            (Some(mine), Some(theirs)) => status_key("", Some(mine)) == status_key("", Some(theirs)),
            (Some(_), None) => false,
        }
    }
}

#[derive(Default)]
struct SimState {
    status: HashMap<StatusKey, Value>,
    subscriptions: Vec<Subscription>,
    outputs: Vec<u16>,
    offline: bool,
    history: Vec<DriverCall>,
}

/// In-memory loopback driver.
///
/// Commands are stored as status and echoed to subscribers, so feedback
/// behaves as though the hardware acknowledged every command. A tie command
/// updates `OutputTieStatus` for the affected outputs and planes.
#[derive(Default)]
pub struct SimulatedDriver {
    state: Mutex<SimState>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        let driver = Self::default();
        driver.store(commands::CONNECTION_STATUS, None, Value::from("Connected"));
        driver
    }

    /// A simulated matrix switch with the given physical outputs
    pub fn matrix(outputs: impl IntoIterator<Item = u16>) -> Self {
        let driver = Self::new();
        if let Ok(mut state) = driver.state.lock() {
            state.outputs = outputs.into_iter().collect();
        }
        driver
    }

    /// Mark the device unreachable; updates fail until it comes back
    pub fn set_offline(&self, offline: bool) {
        let status = if offline { "Disconnected" } else { "Connected" };
        if let Ok(mut state) = self.state.lock() {
            state.offline = offline;
        }
        self.store(commands::CONNECTION_STATUS, None, Value::from(status));
    }

    /// Every call received so far, oldest first
    pub fn history(&self) -> Vec<DriverCall> {
        self.state.lock().map(|s| s.history.clone()).unwrap_or_default()
    }

    pub fn clear_history(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.history.clear();
        }
    }

    /// Store a status value and notify matching subscribers
    pub fn store(&self, command: &str, qualifier: Option<&Qualifier>, value: Value) {
        let callbacks: Vec<StatusCallback> = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.status.insert(status_key(command, qualifier), value.clone());
            state
                .subscriptions
                .iter()
                .filter(|s| s.matches(command, qualifier))
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };

        // Called without the lock held so callbacks may call back into the driver
        for callback in callbacks {
            callback(command, qualifier, &value);
        }
    }

    fn apply_tie(&self, input: i64, qualifier: Option<&Qualifier>) -> DriverResult<()> {
        let q = qualifier.ok_or("tie command requires a qualifier")?;
        let tie_type: TieType = q
            .get(commands::QUALIFIER_TIE_TYPE)
            .and_then(Value::as_str)
            .ok_or("tie command requires a tie type")?
            .parse()?;

        let outputs: Vec<u16> = match q.get(commands::QUALIFIER_OUTPUT) {
            Some(Value::Text(s)) if s.eq_ignore_ascii_case("all") => {
                self.state.lock().map(|s| s.outputs.clone()).unwrap_or_default()
            }
            Some(v) => {
                let n = v.as_i64().ok_or("tie output must be numeric or 'All'")?;
                vec![u16::try_from(n)?]
            }
            None => return Err("tie command requires an output".into()),
        };

        let input = if tie_type == TieType::Untie { 0 } else { input };
        for output in outputs {
            if tie_type.carries_video() || tie_type == TieType::Untie {
                let q = tie_status_qualifier(output, TieType::Video);
                self.store(commands::OUTPUT_TIE_STATUS, Some(&q), Value::Int(input));
            }
            if tie_type.carries_audio() || tie_type == TieType::Untie {
                let q = tie_status_qualifier(output, TieType::Audio);
                self.store(commands::OUTPUT_TIE_STATUS, Some(&q), Value::Int(input));
            }
        }
        Ok(())
    }

    fn record(&self, call: DriverCall) -> bool {
        match self.state.lock() {
            Ok(mut state) => {
                state.history.push(call);
                state.offline
            }
            Err(_) => true,
        }
    }
}

#[async_trait]
impl DeviceDriver for SimulatedDriver {
    async fn set(&self, command: &str, value: Value, qualifier: Option<&Qualifier>) -> DriverResult<()> {
        let offline = self.record(DriverCall::Set {
            command: command.to_string(),
            value: value.clone(),
            qualifier: qualifier.cloned(),
        });
        if offline {
            return Err(format!("{} failed: device offline", command).into());
        }

        debug!("Simulated set {} = {}", command, value);
        if command == commands::MATRIX_TIE {
            let input = value.as_i64().ok_or("tie input must be numeric")?;
            return self.apply_tie(input, qualifier);
        }

        self.store(command, qualifier, value);
        Ok(())
    }

    async fn update(&self, command: &str, qualifier: Option<&Qualifier>) -> DriverResult<()> {
        let offline = self.record(DriverCall::Update {
            command: command.to_string(),
            qualifier: qualifier.cloned(),
        });
        if offline {
            return Err(format!("{} update failed: device offline", command).into());
        }

        if let Some(value) = self.read_status(command, qualifier) {
            self.store(command, qualifier, value);
        }
        Ok(())
    }

    fn read_status(&self, command: &str, qualifier: Option<&Qualifier>) -> Option<Value> {
        let state = self.state.lock().ok()?;
        state.status.get(&status_key(command, qualifier)).cloned()
    }

    fn subscribe_status(
        &self,
        command: &str,
        qualifier: Option<&Qualifier>,
        callback: StatusCallback,
    ) -> DriverResult<()> {
        let mut state = self.state.lock().map_err(|_| "driver state poisoned")?;
        state.subscriptions.push(Subscription {
            command: command.to_string(),
            qualifier: qualifier.cloned(),
            callback,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tie_qualifier(output: Value, tie_type: TieType) -> Qualifier {
        qualifier([
            (commands::QUALIFIER_OUTPUT, output),
            (commands::QUALIFIER_TIE_TYPE, Value::from(tie_type.as_str())),
        ])
    }

    #[tokio::test]
    async fn test_set_stores_status_and_notifies() {
        let driver = SimulatedDriver::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        driver
            .subscribe_status(commands::POWER, None, Arc::new(move |_: &str, _: Option<&Qualifier>, value: &Value| {
                assert_eq!(value, &Value::from("On"));
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        driver.set(commands::POWER, Value::from("On"), None).await.unwrap();

        assert_eq!(driver.read_status(commands::POWER, None), Some(Value::from("On")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_tie_fans_out() {
        let driver = SimulatedDriver::matrix([1, 2, 3]);
        let q = tie_qualifier(Value::from("All"), TieType::AudioVideo);
        driver.set(commands::MATRIX_TIE, Value::Int(4), Some(&q)).await.unwrap();

        for output in 1..=3 {
            for plane in [TieType::Video, TieType::Audio] {
                let status = driver.read_status(
                    commands::OUTPUT_TIE_STATUS,
                    Some(&tie_status_qualifier(output, plane)),
                );
                assert_eq!(status, Some(Value::Int(4)));
            }
        }
    }

    #[tokio::test]
    async fn test_video_only_tie_leaves_audio() {
        let driver = SimulatedDriver::matrix([1, 2]);
        let av = tie_qualifier(Value::Int(2), TieType::AudioVideo);
        driver.set(commands::MATRIX_TIE, Value::Int(1), Some(&av)).await.unwrap();
        let video = tie_qualifier(Value::Int(2), TieType::Video);
        driver.set(commands::MATRIX_TIE, Value::Int(3), Some(&video)).await.unwrap();

        let read = |plane| {
            driver.read_status(commands::OUTPUT_TIE_STATUS, Some(&tie_status_qualifier(2, plane)))
        };
        assert_eq!(read(TieType::Video), Some(Value::Int(3)));
        assert_eq!(read(TieType::Audio), Some(Value::Int(1)));
    }

    #[tokio::test]
    async fn test_offline_driver_rejects_updates() {
        let driver = SimulatedDriver::new();
        driver.set_offline(true);

        assert!(driver.update(commands::POWER, None).await.is_err());
        assert_eq!(
            driver.read_status(commands::CONNECTION_STATUS, None),
            Some(Value::from("Disconnected"))
        );
        assert_eq!(driver.history().len(), 1);
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from("12").as_i64(), Some(12));
        assert_eq!(Value::Float(3.0).as_i64(), Some(3));
        assert_eq!(Value::Float(3.5).as_i64(), None);
        assert_eq!(Value::from(MatrixOutput::All), Value::from("All"));
        assert_eq!(Value::from(MatrixOutput::Output(7)), Value::Int(7));
    }
}
