//! Matrix routing: issues tie commands to the primary switch and reads back
//! which source each destination is showing.

use avroom_common::{tracing, MatrixAction, MatrixOutput, TieType};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::device::DeviceRegistry;
use crate::driver::{commands, qualifier, tie_status_qualifier, DeviceDriver, Value};
use crate::error::{ControlError, ControlResult};
use crate::model::{Destination, MatrixTie, Source};
use crate::ui::UiHost;

/// Ways a caller may name a destination
#[derive(Debug, Clone, Copy)]
pub enum DestinationRef<'a> {
    Output(u16),
    /// Destination id or name
    Name(&'a str),
    Destination(&'a Destination),
}

impl From<u16> for DestinationRef<'_> {
    fn from(output: u16) -> Self {
        DestinationRef::Output(output)
    }
}

impl<'a> From<&'a str> for DestinationRef<'a> {
    fn from(name: &'a str) -> Self {
        DestinationRef::Name(name)
    }
}

impl<'a> From<&'a Destination> for DestinationRef<'a> {
    fn from(dest: &'a Destination) -> Self {
        DestinationRef::Destination(dest)
    }
}

/// One destination and what it is showing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationTie {
    pub destination: Destination,
    pub tie: MatrixTie,
}

struct SwitchHandle {
    id: String,
    driver: Arc<dyn DeviceDriver>,
    outputs: Vec<u16>,
}

pub struct MatrixController {
    registry: Arc<RwLock<DeviceRegistry>>,
    ui_hosts: Vec<Arc<dyn UiHost>>,
}

impl MatrixController {
    pub fn new(registry: Arc<RwLock<DeviceRegistry>>, ui_hosts: Vec<Arc<dyn UiHost>>) -> Self {
        Self { registry, ui_hosts }
    }

    async fn switch(&self) -> ControlResult<SwitchHandle> {
        let registry = self.registry.read().await;
        let switch = registry.switch().ok_or(ControlError::NoSwitch)?;
        Ok(SwitchHandle {
            id: switch.id().to_string(),
            driver: Arc::clone(switch.driver()),
            outputs: switch.switch_outputs().map(<[u16]>::to_vec).unwrap_or_default(),
        })
    }

    async fn resolve_output(&self, dest: DestinationRef<'_>) -> ControlResult<u16> {
        match dest {
            DestinationRef::Output(output) => Ok(output),
            DestinationRef::Destination(d) => Ok(d.output),
            DestinationRef::Name(key) => Ok(self.registry.read().await.find_destination(key)?.output),
        }
    }

    async fn read_plane(&self, switch: &SwitchHandle, output: u16, plane: TieType, update: bool) -> ControlResult<Source> {
        let q = tie_status_qualifier(output, plane);
        if update {
            if let Err(e) = switch.driver.update(commands::OUTPUT_TIE_STATUS, Some(&q)).await {
                warn!("Failed to refresh {} tie status for output {}: {}", plane, output, e);
            }
        }

        let input = match switch.driver.read_status(commands::OUTPUT_TIE_STATUS, Some(&q)) {
            None => return Ok(Source::blank()),
            Some(value) => value
                .as_i64()
                .and_then(|n| u16::try_from(n).ok())
                .ok_or_else(|| ControlError::driver(&switch.id, format!("unexpected tie status {}", value)))?,
        };
        // A tie made outside the core may point at an input nothing is registered on
        match self.registry.read().await.source_by_input(input) {
            Err(ControlError::UnknownSource(input)) => {
                warn!("Output {} {} is tied to unregistered input {}", output, plane, input);
                Ok(Source::unregistered(input))
            }
            other => other,
        }
    }

    async fn read_tie(&self, switch: &SwitchHandle, output: u16, update: bool) -> ControlResult<MatrixTie> {
        // Video and audio are independent statuses even after an audio/video tie
        Ok(MatrixTie {
            video: self.read_plane(switch, output, TieType::Video, update).await?,
            audio: self.read_plane(switch, output, TieType::Audio, update).await?,
        })
    }

    /// Sources currently tied to one destination, optionally refreshing the switch first
    pub async fn current_source_for_destination<'a>(
        &self,
        dest: impl Into<DestinationRef<'a>>,
        update: bool,
    ) -> ControlResult<MatrixTie> {
        let output = self.resolve_output(dest.into()).await?;
        let switch = self.switch().await?;
        self.read_tie(&switch, output, update).await
    }

    /// Sources tied to every destination, ordered by output
    pub async fn current_sources(&self, update: bool) -> ControlResult<Vec<DestinationTie>> {
        let switch = self.switch().await?;
        let destinations: Vec<Destination> = self
            .registry
            .read()
            .await
            .destinations()
            .into_iter()
            .cloned()
            .collect();

        let mut ties = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let tie = self.read_tie(&switch, destination.output, update).await?;
            ties.push(DestinationTie { destination, tie });
        }
        Ok(ties)
    }

    /// Apply a single action
    pub async fn apply_action(&self, action: MatrixAction) -> ControlResult<Vec<DestinationTie>> {
        self.apply(std::slice::from_ref(&action)).await
    }

    /// Apply actions in order, then read back and record every destination's
    /// ties. An action naming an unregistered input is never issued; it and
    /// any action the switch rejects are logged and skipped.
    pub async fn apply(&self, actions: &[MatrixAction]) -> ControlResult<Vec<DestinationTie>> {
        let switch = self.switch().await?;

        for action in actions {
            let source = match self.registry.read().await.source_by_input(action.input) {
                Ok(source) => source,
                Err(e) => {
                    error!("Matrix tie {} rejected: {}", action, e);
                    continue;
                }
            };

            let q = qualifier([
                (commands::QUALIFIER_OUTPUT, Value::from(action.output)),
                (commands::QUALIFIER_TIE_TYPE, Value::from(action.tie_type.as_str())),
            ]);
            info!("Matrix tie {} on {}", action, switch.id);
            if let Err(e) = switch.driver.set(commands::MATRIX_TIE, Value::from(action.input), Some(&q)).await {
                error!("Matrix tie {} failed: {}", action, e);
                continue;
            }

            let follows_menu = match action.output {
                MatrixOutput::All => true,
                MatrixOutput::Output(n) => switch.outputs.contains(&n),
            };
            if follows_menu {
                for host in &self.ui_hosts {
                    host.set_source_menu(&source);
                }
            }
        }

        let ties = self.current_sources(true).await?;
        let mut registry = self.registry.write().await;
        let mut recorded = Vec::with_capacity(ties.len());
        for DestinationTie { mut destination, tie } in ties {
            registry.set_destination_tie(&destination.id, tie.clone())?;
            destination.assign(tie.clone());
            recorded.push(DestinationTie { destination, tie });
        }
        debug!("Recorded ties for {} destinations", recorded.len());
        Ok(recorded)
    }
}
