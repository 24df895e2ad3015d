//! Cadence-based status polling.
//!
//! Each poll entry fires every `n` cycles of whichever timer is running.
//! Two timers exist, one per [`PollingMode`]; only one runs at a time and
//! switching restarts the new one from cycle zero.

use avroom_common::tracing;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::driver::{DeviceDriver, Qualifier, StatusCallback};
use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingMode {
    /// Room in use
    Active,
    /// Room in standby
    Inactive,
}

/// One status to refresh periodically
#[derive(Clone)]
pub struct PollObject {
    pub device_id: String,
    pub driver: Arc<dyn DeviceDriver>,
    pub command: String,
    pub qualifier: Option<Qualifier>,
    /// Cadence in cycles while active
    pub active: u32,
    /// Cadence in cycles while inactive
    pub inactive: u32,
    pub callback: Option<StatusCallback>,
}

impl PollObject {
    fn cadence(&self, mode: PollingMode) -> u32 {
        match mode {
            PollingMode::Active => self.active,
            PollingMode::Inactive => self.inactive,
        }
    }
}

#[derive(Default)]
struct PollState {
    polls: BTreeMap<String, Vec<PollObject>>,
    active_cycles: u64,
    inactive_cycles: u64,
}

impl PollState {
    fn cycles(&mut self, mode: PollingMode) -> &mut u64 {
        match mode {
            PollingMode::Active => &mut self.active_cycles,
            PollingMode::Inactive => &mut self.inactive_cycles,
        }
    }
}

/// Periodically asks drivers to refresh their status
pub struct PollingDispatcher {
    state: Arc<Mutex<PollState>>,
    interval: Duration,
    timer: Mutex<Option<(PollingMode, JoinHandle<()>)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PollingDispatcher {
    /// Create a dispatcher whose timers tick every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(PollState::default())),
            interval,
            timer: Mutex::new(None),
        }
    }

    /// Add a poll entry. An entry with a callback also subscribes to the
    /// same status on the driver.
    pub fn add_poll(&self, poll: PollObject) -> ControlResult<()> {
        if poll.active == 0 || poll.inactive == 0 {
            return Err(ControlError::invalid(
                &poll.device_id,
                format!("poll cadence for {} must be at least one cycle", poll.command),
            ));
        }

        if let Some(callback) = &poll.callback {
            if let Err(e) = poll
                .driver
                .subscribe_status(&poll.command, poll.qualifier.as_ref(), Arc::clone(callback))
            {
                warn!("Failed to subscribe {} on {}: {}", poll.command, poll.device_id, e);
            }
        }

        debug!(
            "Polling {} on {} every {}/{} cycles",
            poll.command, poll.device_id, poll.active, poll.inactive
        );
        lock(&self.state)
            .polls
            .entry(poll.device_id.clone())
            .or_default()
            .push(poll);
        Ok(())
    }

    /// Remove every poll entry for a device, returning how many were removed
    pub fn remove_polls(&self, device_id: &str) -> ControlResult<usize> {
        lock(&self.state)
            .polls
            .remove(device_id)
            .map(|polls| polls.len())
            .ok_or_else(|| ControlError::UnknownDevice(device_id.to_string()))
    }

    pub fn poll_count(&self) -> usize {
        lock(&self.state).polls.values().map(Vec::len).sum()
    }

    /// Run `mode`'s timer, stopping the other one. The new timer starts from cycle zero.
    pub fn set_polling_mode(&self, mode: PollingMode) {
        let mut timer = lock(&self.timer);
        if let Some((_, handle)) = timer.take() {
            handle.abort();
        }

        *lock(&self.state).cycles(mode) = 0;
        info!("Polling mode set to {:?}", mode);

        let state = Arc::clone(&self.state);
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                run_cycle(&state, mode).await;
            }
        });
        *timer = Some((mode, handle));
    }

    /// The mode whose timer is currently running
    pub fn mode(&self) -> Option<PollingMode> {
        lock(&self.timer).as_ref().map(|(mode, _)| *mode)
    }

    /// Cycles completed by `mode`'s timer since it was last started
    pub fn cycle_count(&self, mode: PollingMode) -> u64 {
        *lock(&self.state).cycles(mode)
    }

    /// Run one cycle by hand, returning the number of entries that fired
    pub async fn run_cycle(&self, mode: PollingMode) -> usize {
        run_cycle(&self.state, mode).await
    }

    /// Stop whichever timer is running
    pub fn stop(&self) {
        if let Some((_, handle)) = lock(&self.timer).take() {
            handle.abort();
        }
    }
}

impl Drop for PollingDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_cycle(state: &Mutex<PollState>, mode: PollingMode) -> usize {
    let due: Vec<PollObject> = {
        let mut state = lock(state);
        let cycle = *state.cycles(mode);
        let due = state
            .polls
            .values()
            .flatten()
            .filter(|p| cycle % u64::from(p.cadence(mode)) == 0)
            .cloned()
            .collect();
        *state.cycles(mode) += 1;
        due
    };

    for poll in &due {
        if let Err(e) = poll.driver.update(&poll.command, poll.qualifier.as_ref()).await {
            warn!("Poll of {} on {} failed: {}", poll.command, poll.device_id, e);
        }
    }
    due.len()
}
