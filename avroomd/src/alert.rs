//! Threshold alerts on device status.

use avroom_common::tracing;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{yaml_to_qualifier, yaml_to_value, AlertConfig, ConfigError};
use crate::driver::{Qualifier, Value};
use crate::error::{ControlError, ControlResult};
use crate::event::StatusEvent;

pub type AlertPredicate = Arc<dyn Fn(Option<&Value>) -> bool + Send + Sync>;

/// How a status value is tested
#[derive(Clone)]
pub enum AlertOperator {
    Eq(Value),
    Neq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    /// Strict identity: same kind and value, or both absent
    Is(Option<Value>),
    IsNot(Option<Value>),
    Predicate(AlertPredicate),
}

impl fmt::Debug for AlertOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertOperator::Eq(v) => write!(f, "Eq({:?})", v),
            AlertOperator::Neq(v) => write!(f, "Neq({:?})", v),
            AlertOperator::Gt(v) => write!(f, "Gt({:?})", v),
            AlertOperator::Gte(v) => write!(f, "Gte({:?})", v),
            AlertOperator::Lt(v) => write!(f, "Lt({:?})", v),
            AlertOperator::Lte(v) => write!(f, "Lte({:?})", v),
            AlertOperator::In(v) => write!(f, "In({:?})", v),
            AlertOperator::NotIn(v) => write!(f, "NotIn({:?})", v),
            AlertOperator::Is(v) => write!(f, "Is({:?})", v),
            AlertOperator::IsNot(v) => write!(f, "IsNot({:?})", v),
            AlertOperator::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Text(x), Value::Text(y)) => x == y,
        _ => matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x == y),
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

impl AlertOperator {
    /// Test a status value; `None` means the status is unknown
    pub fn evaluate(&self, actual: Option<&Value>) -> bool {
        match self {
            AlertOperator::Is(expected) => actual == expected.as_ref(),
            AlertOperator::IsNot(expected) => actual != expected.as_ref(),
            AlertOperator::Predicate(predicate) => predicate(actual),
            _ => {
                let Some(actual) = actual else {
                    return false;
                };
                match self {
                    AlertOperator::Eq(v) => loose_eq(actual, v),
                    AlertOperator::Neq(v) => !loose_eq(actual, v),
                    AlertOperator::Gt(v) => compare(actual, v) == Some(Ordering::Greater),
                    AlertOperator::Gte(v) => matches!(compare(actual, v), Some(Ordering::Greater | Ordering::Equal)),
                    AlertOperator::Lt(v) => compare(actual, v) == Some(Ordering::Less),
                    AlertOperator::Lte(v) => matches!(compare(actual, v), Some(Ordering::Less | Ordering::Equal)),
                    AlertOperator::In(values) => values.iter().any(|v| loose_eq(actual, v)),
                    AlertOperator::NotIn(values) => !values.iter().any(|v| loose_eq(actual, v)),
                    AlertOperator::Is(_) | AlertOperator::IsNot(_) | AlertOperator::Predicate(_) => false,
                }
            }
        }
    }
}

/// A condition watched on one device status
#[derive(Debug, Clone)]
pub struct Alert {
    pub id: String,
    pub device: String,
    pub command: String,
    pub qualifier: Option<Qualifier>,
    pub operator: AlertOperator,
    pub message: String,
}

impl Alert {
    pub fn from_config(config: &AlertConfig) -> ControlResult<Self> {
        let invalid = |message: String| ControlError::invalid(&config.device, message);
        let value = || -> ControlResult<Value> {
            let raw = config
                .value
                .as_ref()
                .ok_or_else(|| invalid(format!("alert {} needs a value", config.id)))?;
            Ok(yaml_to_value(raw)?)
        };
        let optional = || -> ControlResult<Option<Value>> {
            Ok(config.value.as_ref().map(yaml_to_value).transpose()?)
        };
        let values = || -> ControlResult<Vec<Value>> {
            Ok(config.values.iter().map(yaml_to_value).collect::<Result<Vec<_>, ConfigError>>()?)
        };

        let operator = match config.operator.to_ascii_lowercase().as_str() {
            "eq" => AlertOperator::Eq(value()?),
            "neq" => AlertOperator::Neq(value()?),
            "gt" => AlertOperator::Gt(value()?),
            "gte" => AlertOperator::Gte(value()?),
            "lt" => AlertOperator::Lt(value()?),
            "lte" => AlertOperator::Lte(value()?),
            "in" => AlertOperator::In(values()?),
            "not_in" => AlertOperator::NotIn(values()?),
            "is" => AlertOperator::Is(optional()?),
            "is_not" => AlertOperator::IsNot(optional()?),
            other => return Err(invalid(format!("alert {}: unknown operator '{}'", config.id, other))),
        };

        Ok(Self {
            id: config.id.clone(),
            device: config.device.clone(),
            command: config.command.clone(),
            qualifier: yaml_to_qualifier(config.qualifier.as_ref())?,
            operator,
            message: config.message.clone(),
        })
    }

    fn watches(&self, event: &StatusEvent) -> bool {
        self.device == event.device_id
            && self.command == event.command
            && (self.qualifier.is_none() || self.qualifier == event.qualifier)
    }
}

/// Alert state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertEvent {
    Raised { id: String, device: String, message: String },
    Cleared { id: String, device: String },
}

/// Tracks which alerts are raised and reports edges only
#[derive(Default)]
pub struct AlertMonitor {
    alerts: Vec<Alert>,
    raised: HashSet<String>,
}

impl AlertMonitor {
    pub fn new(alerts: Vec<Alert>) -> Self {
        Self {
            alerts,
            raised: HashSet::new(),
        }
    }

    pub fn is_raised(&self, id: &str) -> bool {
        self.raised.contains(id)
    }

    fn transition(&mut self, index: usize, value: Option<&Value>) -> Option<AlertEvent> {
        let alert = &self.alerts[index];
        let triggered = alert.operator.evaluate(value);
        let was_raised = self.raised.contains(&alert.id);

        match (triggered, was_raised) {
            (true, false) => {
                warn!("Alert {} raised on {}: {}", alert.id, alert.device, alert.message);
                self.raised.insert(alert.id.clone());
                Some(AlertEvent::Raised {
                    id: alert.id.clone(),
                    device: alert.device.clone(),
                    message: alert.message.clone(),
                })
            }
            (false, true) => {
                info!("Alert {} cleared on {}", alert.id, alert.device);
                self.raised.remove(&alert.id);
                Some(AlertEvent::Cleared {
                    id: alert.id.clone(),
                    device: alert.device.clone(),
                })
            }
            _ => None,
        }
    }

    /// Re-evaluate alerts watching the status carried by `event`
    pub fn process(&mut self, event: &StatusEvent) -> Vec<AlertEvent> {
        (0..self.alerts.len())
            .filter(|&i| self.alerts[i].watches(event))
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|i| self.transition(i, Some(&event.value)))
            .collect()
    }

    /// Evaluate every alert against current values, e.g. cached driver status at startup
    pub fn evaluate_all<F>(&mut self, mut read: F) -> Vec<AlertEvent>
    where
        F: FnMut(&Alert) -> Option<Value>,
    {
        (0..self.alerts.len())
            .filter_map(|i| {
                let value = read(&self.alerts[i]);
                self.transition(i, value.as_ref())
            })
            .collect()
    }
}
