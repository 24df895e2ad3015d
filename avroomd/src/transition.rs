//! Activity/state transition engine.
//!
//! The room moves along two correlated axes, power state and activity. A
//! request computes a [`TransitionState`], runs a countdown with UI feedback,
//! and on completion applies the routing plan for the new activity.
//!
//! Only one transition is in flight at a time. A new request replaces the
//! running countdown; stale countdown tasks are recognised by their
//! generation number and stop on their next tick.

use avroom_common::{tracing, ActivityMode, MatrixAction, MatrixOutput, SystemState, TieType, TransitionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::config::TransitionTimers;
use crate::device::DeviceRegistry;
use crate::driver::{commands, DeviceDriver, Value};
use crate::error::ControlResult;
use crate::event::SystemEvent;
use crate::matrix::MatrixController;
use crate::model::{DestinationType, Source, BLANK_INPUT};
use crate::polling::{PollingDispatcher, PollingMode};
use crate::ui::{names, UiHost};

const TICK: Duration = Duration::from_secs(1);

/// Routing is released once this many seconds or fewer remain in a shutdown
const ROUTING_STANDBY_LEAD: u32 = 2;

/// Room-level settings the engine needs
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub timers: TransitionTimers,
    /// Source id shown everywhere after power-on
    pub default_source: Option<String>,
    /// Destination id or name whose source survives activity changes
    pub primary_destination: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Startup,
    Shutdown,
    Switch,
}

impl Phase {
    fn of(transition: &TransitionState) -> Self {
        match (transition.state.pending, transition.state.target) {
            (true, SystemState::Active) => Phase::Startup,
            (true, SystemState::Standby) => Phase::Shutdown,
            (false, _) => Phase::Switch,
        }
    }

    /// (minimum, maximum) seconds
    fn window(&self, timers: &TransitionTimers) -> (u32, u32) {
        match self {
            Phase::Startup => (timers.startup_min, timers.startup_max),
            Phase::Shutdown => (timers.shutdown_min, timers.shutdown_max),
            Phase::Switch => (0, timers.switch_max),
        }
    }
}

struct EngineState {
    system_state: SystemState,
    activity: ActivityMode,
    transition: Option<TransitionState>,
    generation: u64,
    countdown: Option<JoinHandle<()>>,
    splash: Option<JoinHandle<()>>,
    routing_released: bool,
}

impl EngineState {
    /// Where the room is heading: the in-flight target, or the committed state
    fn target(&self) -> (SystemState, ActivityMode) {
        match &self.transition {
            Some(t) => (t.state.target, t.activity.target),
            None => (self.system_state, self.activity),
        }
    }
}

struct Shared {
    settings: EngineSettings,
    registry: Arc<RwLock<DeviceRegistry>>,
    matrix: Arc<MatrixController>,
    polling: Arc<PollingDispatcher>,
    ui_hosts: Vec<Arc<dyn UiHost>>,
    events: broadcast::Sender<SystemEvent>,
    state: Mutex<EngineState>,
}

/// Owner of the room's power state and activity
#[derive(Clone)]
pub struct TransitionEngine {
    shared: Arc<Shared>,
}

impl TransitionEngine {
    pub fn new(
        settings: EngineSettings,
        registry: Arc<RwLock<DeviceRegistry>>,
        matrix: Arc<MatrixController>,
        polling: Arc<PollingDispatcher>,
        ui_hosts: Vec<Arc<dyn UiHost>>,
        events: broadcast::Sender<SystemEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                registry,
                matrix,
                polling,
                ui_hosts,
                events,
                state: Mutex::new(EngineState {
                    system_state: SystemState::Standby,
                    activity: ActivityMode::Standby,
                    transition: None,
                    generation: 0,
                    countdown: None,
                    splash: None,
                    routing_released: false,
                }),
            }),
        }
    }

    /// Committed power state and activity
    pub async fn state(&self) -> (SystemState, ActivityMode) {
        let st = self.shared.state.lock().await;
        (st.system_state, st.activity)
    }

    /// The transition currently in flight, if any
    pub async fn transition_state(&self) -> Option<TransitionState> {
        self.shared.state.lock().await.transition
    }

    /// Show the start page and arm the splash timer
    pub async fn start(&self) {
        let mut st = self.shared.state.lock().await;
        for host in &self.shared.ui_hosts {
            host.show_page(names::PAGE_START);
        }
        self.restart_splash(&mut st);
    }

    /// Cancel any running countdown and the splash timer
    pub async fn stop(&self) {
        let mut st = self.shared.state.lock().await;
        st.generation += 1;
        st.transition = None;
        if let Some(handle) = st.countdown.take() {
            handle.abort();
        }
        if let Some(handle) = st.splash.take() {
            handle.abort();
        }
    }

    /// Ask the room to move to `requested`.
    ///
    /// Returns the transition that was started, or `None` when the room is
    /// already at (or heading to) that activity.
    pub async fn request_activity(&self, requested: ActivityMode) -> Option<TransitionState> {
        let mut st = self.shared.state.lock().await;
        let (target_state, target_activity) = st.target();
        if requested == target_activity {
            debug!("Activity {} already current or pending", requested);
            return None;
        }

        let mut transition = TransitionState::compute(target_state, target_activity, requested);
        // Reversing an unfinished power cycle is still a power cycle
        transition.state.pending |= transition.state.target != st.system_state;

        info!(
            "Requested {}: state {} (pending {}), activity {} (pending {})",
            requested,
            transition.state.target,
            transition.state.pending,
            transition.activity.target,
            transition.activity.pending
        );
        self.begin(&mut st, transition);
        Some(transition)
    }

    /// Show the shutdown confirmation prompt. Only offered while active and idle.
    pub async fn prompt_shutdown(&self) -> bool {
        let st = self.shared.state.lock().await;
        if st.system_state != SystemState::Active || st.transition.is_some() {
            return false;
        }
        let duration = Duration::from_secs(self.shared.settings.timers.shutdown_confirmation.into());
        for host in &self.shared.ui_hosts {
            host.show_popup(names::POPUP_SHUTDOWN_CONFIRM, Some(duration));
        }
        true
    }

    fn emit(&self, event: SystemEvent) {
        // No subscribers is fine
        let _ = self.shared.events.send(event);
    }

    fn begin(&self, st: &mut EngineState, transition: TransitionState) {
        st.generation += 1;
        if let Some(handle) = st.countdown.take() {
            handle.abort();
        }
        st.routing_released = false;
        st.transition = Some(transition);

        let phase = Phase::of(&transition);
        let (_, max) = phase.window(&self.shared.settings.timers);
        let label = match phase {
            Phase::Startup => format!("Starting {}", transition.activity.target.label()),
            Phase::Shutdown => "Shutting down".to_string(),
            Phase::Switch => format!("Switching to {}", transition.activity.target.label()),
        };

        for host in &self.shared.ui_hosts {
            host.set_transition_label(&label);
            host.set_transition_level_range(0, max);
            host.set_transition_level(0);
            host.set_transition_count(&max.to_string());
            if phase == Phase::Shutdown {
                host.hide_popup(names::POPUP_SHUTDOWN_CONFIRM);
            }
            host.show_popup(names::POPUP_TRANSITION, None);
        }

        match phase {
            Phase::Startup => {
                if let Some(handle) = st.splash.take() {
                    handle.abort();
                }
                self.shared.polling.set_polling_mode(PollingMode::Active);
            }
            Phase::Switch => self.shared.polling.set_polling_mode(PollingMode::Active),
            Phase::Shutdown => {}
        }

        self.emit(SystemEvent::TransitionStarted(transition));
        st.countdown = Some(tokio::spawn(self.clone().run_countdown(st.generation, phase)));
    }

    async fn run_countdown(self, generation: u64, phase: Phase) {
        match phase {
            Phase::Startup => self.power_destinations(true).await,
            Phase::Shutdown => self.power_destinations(false).await,
            Phase::Switch => {}
        }

        let mut ticker = time::interval_at(Instant::now() + TICK, TICK);
        let mut elapsed = 0u32;
        loop {
            ticker.tick().await;
            elapsed += 1;
            if !self.tick(generation, phase, elapsed).await {
                break;
            }
        }
    }

    /// Advance a countdown by one second. Returns false once it has finished or been replaced.
    async fn tick(&self, generation: u64, phase: Phase, elapsed: u32) -> bool {
        let mut st = self.shared.state.lock().await;
        if st.generation != generation {
            return false;
        }
        let Some(transition) = st.transition else {
            return false;
        };

        let (min, max) = phase.window(&self.shared.settings.timers);
        let remaining = max.saturating_sub(elapsed);
        for host in &self.shared.ui_hosts {
            host.set_transition_level(elapsed.min(max));
            host.set_transition_count(&remaining.to_string());
        }

        let done = match phase {
            Phase::Switch => elapsed >= max,
            Phase::Startup => elapsed >= min && (elapsed >= max || self.destinations_ready(commands::POWER_ON).await),
            Phase::Shutdown => elapsed >= min && (elapsed >= max || self.destinations_ready(commands::POWER_OFF).await),
        };

        if phase == Phase::Shutdown && !st.routing_released && (done || remaining <= ROUTING_STANDBY_LEAD) {
            self.release_routing(&mut st).await;
        }
        if !done {
            return true;
        }

        debug!("{:?} countdown finished after {}s", phase, elapsed);
        // Completing from inside the countdown task: detach rather than abort
        st.countdown = None;
        match phase {
            Phase::Startup => self.complete_startup(&mut st, transition).await,
            Phase::Shutdown => self.complete_shutdown(&mut st).await,
            Phase::Switch => self.complete_switch(&mut st, transition).await,
        }
        false
    }

    async fn complete_startup(&self, st: &mut EngineState, transition: TransitionState) {
        let activity = transition.activity.target;
        // Not Standby when a shutdown was reversed before it completed
        let previous = st.activity;
        st.system_state = SystemState::Active;

        self.apply_plan(activity, true).await;
        self.update_blank_entries(previous, activity);

        st.activity = activity;
        st.transition = None;
        info!("System active in {}", activity);
        self.emit(SystemEvent::StateChanged {
            state: SystemState::Active,
            activity,
        });

        for host in &self.shared.ui_hosts {
            host.hide_popup(names::POPUP_TRANSITION);
            host.show_page(names::PAGE_MAIN);
        }
    }

    async fn complete_switch(&self, st: &mut EngineState, transition: TransitionState) {
        let previous = st.activity;
        let activity = transition.activity.target;

        if activity != previous {
            self.apply_plan(activity, false).await;
        }

        self.update_blank_entries(previous, activity);

        for host in &self.shared.ui_hosts {
            host.hide_popup(names::POPUP_TRANSITION);
            host.hide_popup(names::POPUP_SOURCE_CONTROL);
            host.hide_popup(names::POPUP_ADV_SOURCE_CONTROL);
        }

        st.activity = activity;
        st.transition = None;
        if activity != previous {
            info!("Activity changed to {}", activity);
            self.emit(SystemEvent::ActivityChanged(activity));
        }
    }

    async fn complete_shutdown(&self, st: &mut EngineState) {
        self.update_blank_entries(st.activity, ActivityMode::Standby);

        st.activity = ActivityMode::Standby;
        st.system_state = SystemState::Standby;
        st.transition = None;
        self.shared.polling.set_polling_mode(PollingMode::Inactive);

        info!("System in standby");
        self.emit(SystemEvent::StateChanged {
            state: SystemState::Standby,
            activity: ActivityMode::Standby,
        });

        for host in &self.shared.ui_hosts {
            host.hide_popup(names::POPUP_TRANSITION);
            host.show_page(names::PAGE_START);
        }
        self.restart_splash(st);
    }

    /// Offer the blank entry exactly while the room is in AdvShare
    fn update_blank_entries(&self, previous: ActivityMode, next: ActivityMode) {
        let was = previous == ActivityMode::AdvShare;
        let is = next == ActivityMode::AdvShare;
        if was == is {
            return;
        }
        for host in &self.shared.ui_hosts {
            if is {
                host.add_blank_source();
            } else {
                host.remove_blank_source();
            }
        }
    }

    async fn release_routing(&self, st: &mut EngineState) {
        st.routing_released = true;
        info!("Releasing matrix routing");
        let untie = MatrixAction::new(MatrixOutput::All, BLANK_INPUT, TieType::Untie);
        if let Err(e) = self.shared.matrix.apply_action(untie).await {
            error!("Failed to release routing: {}", e);
        }
    }

    fn restart_splash(&self, st: &mut EngineState) {
        if let Some(handle) = st.splash.take() {
            handle.abort();
        }
        let timeout = self.shared.settings.timers.splash_timeout;
        if timeout == 0 {
            return;
        }

        let engine = self.clone();
        st.splash = Some(tokio::spawn(async move {
            time::sleep(Duration::from_secs(timeout.into())).await;
            debug!("Standby timeout, showing splash page");
            for host in &engine.shared.ui_hosts {
                host.show_page(names::PAGE_SPLASH);
            }
        }));
    }

    async fn apply_plan(&self, activity: ActivityMode, after_power_on: bool) {
        match self.routing_plan(activity, after_power_on).await {
            Ok(Some(actions)) => {
                if let Err(e) = self.shared.matrix.apply(&actions).await {
                    error!("Routing for {} failed: {}", activity, e);
                }
            }
            Ok(None) => debug!("No routing plan for {}", activity),
            Err(e) => error!("Could not compute routing for {}: {}", activity, e),
        }
    }

    /// Source the primary destination should keep showing
    async fn primary_source(&self, after_power_on: bool) -> ControlResult<Option<Source>> {
        let settings = &self.shared.settings;
        if !after_power_on {
            if let Some(primary) = settings.primary_destination.as_deref() {
                let tie = self.shared.matrix.current_source_for_destination(primary, false).await?;
                return Ok(Some(tie.video));
            }
        }
        let registry = self.shared.registry.read().await;
        Ok(settings
            .default_source
            .as_deref()
            .and_then(|id| registry.source_by_id(id))
            .cloned())
    }

    /// Matrix actions that put the room into `activity`.
    ///
    /// After a power-on the default source is used; otherwise the source on
    /// the primary destination is carried over.
    pub async fn routing_plan(
        &self,
        activity: ActivityMode,
        after_power_on: bool,
    ) -> ControlResult<Option<Vec<MatrixAction>>> {
        match activity {
            ActivityMode::Standby => Ok(None),
            ActivityMode::Share | ActivityMode::AdvShare => match self.primary_source(after_power_on).await? {
                Some(source) => Ok(Some(vec![MatrixAction::broadcast(source.input)])),
                None => {
                    warn!("No default source configured, {} routing skipped", activity);
                    Ok(None)
                }
            },
            ActivityMode::GroupWork => {
                let primary_source = self.primary_source(after_power_on).await?;
                let primary = self.shared.settings.primary_destination.as_deref();
                let registry = self.shared.registry.read().await;

                let actions = registry
                    .destinations()
                    .into_iter()
                    .map(|dest| {
                        let is_primary = primary.map_or(false, |p| dest.id == p || dest.name == p);
                        let source = match &primary_source {
                            Some(source) if is_primary => source,
                            _ => &dest.group_work_source,
                        };
                        MatrixAction::new(MatrixOutput::Output(dest.output), source.input, TieType::AudioVideo)
                    })
                    .collect();
                Ok(Some(actions))
            }
        }
    }

    async fn power_destinations(&self, on: bool) {
        let (power, screen) = if on {
            (commands::POWER_ON, commands::SCREEN_DOWN)
        } else {
            (commands::POWER_OFF, commands::SCREEN_UP)
        };

        let targets: Vec<(String, Arc<dyn DeviceDriver>, &'static str, &'static str)> = {
            let registry = self.shared.registry.read().await;
            let mut targets = Vec::new();
            for dest in registry.destinations() {
                if let Some(record) = registry.get(&dest.id) {
                    targets.push((dest.id.clone(), Arc::clone(record.driver()), commands::POWER, power));
                }
                if dest.kind == DestinationType::ProjectorWithScreen {
                    if let Some(record) = dest.screen.as_deref().and_then(|id| registry.get(id)) {
                        targets.push((record.id().to_string(), Arc::clone(record.driver()), commands::SCREEN, screen));
                    }
                }
            }
            targets
        };

        for (device, driver, command, value) in targets {
            debug!("{} {} = {}", device, command, value);
            if let Err(e) = driver.set(command, Value::from(value), None).await {
                warn!("Failed to set {} on {}: {}", command, device, e);
            }
        }
    }

    /// Whether every destination reports the given power status
    async fn destinations_ready(&self, power: &str) -> bool {
        let registry = self.shared.registry.read().await;
        registry.destinations().iter().all(|dest| {
            registry
                .get(&dest.id)
                .and_then(|record| record.driver().read_status(commands::POWER, None))
                .map_or(false, |status| status.as_str().map_or(false, |s| s.eq_ignore_ascii_case(power)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverCall;
    use crate::testutil::{non_feedback_events, started_controller, RecordingUiHost, UiCall};
    use crate::SystemController;

    async fn go_active(controller: &SystemController, activity: ActivityMode) {
        controller.request_activity(activity).await.unwrap();
        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(controller.state().await, (SystemState::Active, activity));
    }

    fn blank_entries(host: &RecordingUiHost) -> i32 {
        host.calls().iter().fold(0, |n, c| match c {
            UiCall::AddBlankSource => n + 1,
            UiCall::RemoveBlankSource => n - 1,
            _ => n,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_to_share() {
        let (controller, host, _drivers) = started_controller().await;
        let mut events = controller.subscribe();

        let transition = controller.request_activity(ActivityMode::Share).await.unwrap().unwrap();
        assert!(transition.state.pending);
        assert_eq!(transition.state.target, SystemState::Active);
        assert!(transition.activity.pending);
        assert_eq!(transition.activity.target, ActivityMode::Share);
        assert_eq!(controller.transition_state().await, Some(transition));

        // Below the minimum floor nothing completes even though displays are on
        time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(controller.state().await, (SystemState::Standby, ActivityMode::Standby));

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.state().await, (SystemState::Active, ActivityMode::Share));
        assert_eq!(controller.transition_state().await, None);

        // Every destination shows the default source
        for route in controller.current_sources(false).await.unwrap() {
            assert_eq!(route.tie.video.id, "PC001");
            assert_eq!(route.tie.audio.id, "PC001");
        }

        let events = non_feedback_events(&mut events);
        assert!(matches!(events[0], SystemEvent::TransitionStarted(_)));
        let changes: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SystemEvent::StateChanged { .. } | SystemEvent::ActivityChanged(_)))
            .collect();
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            changes[0],
            SystemEvent::StateChanged { state: SystemState::Active, activity: ActivityMode::Share }
        ));

        let calls = host.calls();
        let label = calls.iter().position(|c| matches!(c, UiCall::Label(_))).unwrap();
        let popup = calls
            .iter()
            .position(|c| matches!(c, UiCall::ShowPopup(name, _) if name == names::POPUP_TRANSITION))
            .unwrap();
        assert!(label < popup);
        assert!(matches!(calls.last(), Some(UiCall::ShowPage(page)) if page == names::PAGE_MAIN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_waits_for_displays_until_max() {
        let (controller, _host, drivers) = started_controller().await;
        // The monitor never acknowledges power
        drivers["MON001"].set_offline(true);

        controller.request_activity(ActivityMode::Share).await.unwrap();
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(controller.state().await.0, SystemState::Standby);

        time::sleep(Duration::from_secs(11)).await;
        assert_eq!(controller.state().await.0, SystemState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_activity_is_noop() {
        let (controller, _host, drivers) = started_controller().await;
        go_active(&controller, ActivityMode::Share).await;

        let mut events = controller.subscribe();
        drivers["SW001"].clear_history();
        assert!(controller.request_activity(ActivityMode::Share).await.unwrap().is_none());
        time::sleep(Duration::from_secs(5)).await;

        assert!(controller.transition_state().await.is_none());
        assert!(drivers["SW001"].history().is_empty());
        assert!(non_feedback_events(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_switch_to_adv_share() {
        let (controller, host, _drivers) = started_controller().await;
        go_active(&controller, ActivityMode::Share).await;
        let mut events = controller.subscribe();

        let transition = controller.request_activity(ActivityMode::AdvShare).await.unwrap().unwrap();
        assert!(!transition.state.pending);
        assert!(transition.activity.pending);

        time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(controller.state().await.1, ActivityMode::Share);
        assert_eq!(blank_entries(&host), 0);

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.state().await, (SystemState::Active, ActivityMode::AdvShare));
        assert_eq!(blank_entries(&host), 1);

        let events = non_feedback_events(&mut events);
        assert!(!events.iter().any(|e| matches!(e, SystemEvent::StateChanged { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, SystemEvent::ActivityChanged(ActivityMode::AdvShare))));

        // Leaving AdvShare removes the entry again
        controller.request_activity(ActivityMode::Share).await.unwrap();
        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(blank_entries(&host), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_work_keeps_primary_source() {
        let (controller, _host, _drivers) = started_controller().await;
        go_active(&controller, ActivityMode::Share).await;

        // Presenter moves the main display to the wireless pod
        controller
            .apply_matrix_actions(&[MatrixAction::new(MatrixOutput::Output(1), 2, TieType::AudioVideo)])
            .await
            .unwrap();

        let plan = controller.engine().routing_plan(ActivityMode::GroupWork, false).await.unwrap().unwrap();
        assert_eq!(
            plan,
            vec![
                MatrixAction::new(MatrixOutput::Output(1), 2, TieType::AudioVideo),
                MatrixAction::new(MatrixOutput::Output(2), 2, TieType::AudioVideo),
                MatrixAction::new(MatrixOutput::Output(3), 5, TieType::AudioVideo),
            ]
        );

        go_active(&controller, ActivityMode::GroupWork).await;
        let routes = controller.current_sources(false).await.unwrap();
        let by_id = |id: &str| routes.iter().find(|r| r.destination.id == id).unwrap().tie.video.id.clone();
        assert_eq!(by_id("PRJ001"), "WPOD001");
        assert_eq!(by_id("MON001"), "WPOD001");
        assert_eq!(by_id("CONF001"), "CAM001");
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_after_power_on_uses_default_source() {
        let (controller, _host, _drivers) = started_controller().await;
        let plan = controller.engine().routing_plan(ActivityMode::Share, true).await.unwrap();
        assert_eq!(plan, Some(vec![MatrixAction::broadcast(1)]));
        assert_eq!(controller.engine().routing_plan(ActivityMode::Standby, true).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_routing_and_restarts_splash() {
        let (controller, host, drivers) = started_controller().await;
        go_active(&controller, ActivityMode::AdvShare).await;
        assert_eq!(blank_entries(&host), 1);

        assert!(controller.prompt_shutdown().await.unwrap());
        let transition = controller.request_activity(ActivityMode::Standby).await.unwrap().unwrap();
        assert!(transition.state.pending);
        assert_eq!(transition.state.target, SystemState::Standby);

        // Displays report off at once, so shutdown completes at its minimum
        time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(controller.state().await, (SystemState::Standby, ActivityMode::Standby));
        assert_eq!(blank_entries(&host), 0);
        assert_eq!(drivers["PRJ001"].read_status(commands::POWER, None), Some(Value::from("Off")));
        assert_eq!(drivers["SCN001"].read_status(commands::SCREEN, None), Some(Value::from("Up")));

        for route in controller.current_sources(false).await.unwrap() {
            assert!(route.tie.video.is_blank());
            assert!(route.tie.audio.is_blank());
        }

        // Confirmation prompt is no longer offered
        assert!(!controller.prompt_shutdown().await.unwrap());

        host.clear();
        time::sleep(Duration::from_secs(301)).await;
        assert!(host
            .calls()
            .iter()
            .any(|c| matches!(c, UiCall::ShowPage(page) if page == names::PAGE_SPLASH)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_request_restarts_countdown() {
        let (controller, _host, _drivers) = started_controller().await;
        controller.request_activity(ActivityMode::Share).await.unwrap();
        time::sleep(Duration::from_secs(3)).await;

        // Re-requesting the pending target changes nothing
        assert!(controller.request_activity(ActivityMode::Share).await.unwrap().is_none());

        let transition = controller.request_activity(ActivityMode::GroupWork).await.unwrap().unwrap();
        assert!(transition.state.pending);
        assert_eq!(transition.activity.target, ActivityMode::GroupWork);

        // The fresh countdown needs its own full minimum
        time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(controller.state().await.0, SystemState::Standby);
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(controller.state().await, (SystemState::Active, ActivityMode::GroupWork));
    }

    #[tokio::test(start_paused = true)]
    async fn test_standby_mid_startup_reverses() {
        let (controller, _host, _drivers) = started_controller().await;
        controller.request_activity(ActivityMode::Share).await.unwrap();
        time::sleep(Duration::from_secs(2)).await;

        let transition = controller.request_activity(ActivityMode::Standby).await.unwrap().unwrap();
        assert!(transition.state.pending);
        assert_eq!(transition.state.target, SystemState::Standby);

        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(controller.state().await, (SystemState::Standby, ActivityMode::Standby));
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_mid_shutdown_from_adv_share_drops_blank_entry() {
        let (controller, host, _drivers) = started_controller().await;
        go_active(&controller, ActivityMode::AdvShare).await;
        assert_eq!(blank_entries(&host), 1);

        controller.request_activity(ActivityMode::Standby).await.unwrap();
        time::sleep(Duration::from_millis(1500)).await;

        let transition = controller.request_activity(ActivityMode::Share).await.unwrap().unwrap();
        assert!(transition.state.pending);
        assert_eq!(transition.state.target, SystemState::Active);

        time::sleep(Duration::from_secs(25)).await;
        assert_eq!(controller.state().await, (SystemState::Active, ActivityMode::Share));
        assert_eq!(blank_entries(&host), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adv_share_mid_shutdown_keeps_single_blank_entry() {
        let (controller, host, _drivers) = started_controller().await;
        go_active(&controller, ActivityMode::AdvShare).await;

        controller.request_activity(ActivityMode::Standby).await.unwrap();
        time::sleep(Duration::from_millis(1500)).await;
        controller.request_activity(ActivityMode::AdvShare).await.unwrap();

        time::sleep(Duration::from_secs(25)).await;
        assert_eq!(controller.state().await, (SystemState::Active, ActivityMode::AdvShare));
        assert_eq!(blank_entries(&host), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_mid_shutdown_powers_back_on() {
        let (controller, host, drivers) = started_controller().await;
        go_active(&controller, ActivityMode::Share).await;
        let mut events = controller.subscribe();

        controller.request_activity(ActivityMode::Standby).await.unwrap();
        time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(drivers["PRJ001"].read_status(commands::POWER, None), Some(Value::from("Off")));

        controller.request_activity(ActivityMode::Share).await.unwrap();
        time::sleep(Duration::from_secs(25)).await;
        assert_eq!(controller.state().await, (SystemState::Active, ActivityMode::Share));
        assert_eq!(drivers["PRJ001"].read_status(commands::POWER, None), Some(Value::from("On")));
        assert_eq!(blank_entries(&host), 0);

        for route in controller.current_sources(false).await.unwrap() {
            assert_eq!(route.tie.video.id, "PC001");
        }

        // The aborted shutdown never committed Standby
        let events = non_feedback_events(&mut events);
        assert!(!events
            .iter()
            .any(|e| matches!(e, SystemEvent::StateChanged { state: SystemState::Standby, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_back_mid_switch_is_quiet() {
        let (controller, host, drivers) = started_controller().await;
        go_active(&controller, ActivityMode::Share).await;
        let mut events = controller.subscribe();

        controller.request_activity(ActivityMode::GroupWork).await.unwrap();
        time::sleep(Duration::from_secs(1)).await;

        drivers["SW001"].clear_history();
        host.clear();
        let transition = controller.request_activity(ActivityMode::Share).await.unwrap().unwrap();
        assert!(!transition.state.pending);
        assert_eq!(transition.activity.target, ActivityMode::Share);

        time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(controller.state().await, (SystemState::Active, ActivityMode::Share));
        assert!(controller.transition_state().await.is_none());

        // No plan was applied
        assert!(!drivers["SW001"]
            .history()
            .iter()
            .any(|c| matches!(c, DriverCall::Set { command, .. } if command == commands::MATRIX_TIE)));
        assert!(!non_feedback_events(&mut events)
            .iter()
            .any(|e| matches!(e, SystemEvent::ActivityChanged(_))));
        // Popups still close
        assert!(host
            .calls()
            .iter()
            .any(|c| matches!(c, UiCall::HidePopup(name) if name == names::POPUP_SOURCE_CONTROL)));
    }

    #[test]
    fn test_phase_from_transition() {
        let startup = TransitionState::compute(SystemState::Standby, ActivityMode::Standby, ActivityMode::Share);
        assert_eq!(Phase::of(&startup), Phase::Startup);
        let shutdown = TransitionState::compute(SystemState::Active, ActivityMode::Share, ActivityMode::Standby);
        assert_eq!(Phase::of(&shutdown), Phase::Shutdown);
        let switch = TransitionState::compute(SystemState::Active, ActivityMode::Share, ActivityMode::GroupWork);
        assert_eq!(Phase::of(&switch), Phase::Switch);

        let timers = TransitionTimers::default();
        assert_eq!(Phase::Switch.window(&timers), (0, 3));
    }
}
