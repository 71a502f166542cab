//! Dual-valve pressure state controller — the core of the platform.
//!
//! Owns the inlet and outlet valve endpoints and keeps the system at a
//! commanded setpoint:
//!
//! - a **poller** task reads pressure and both valve positions five times a
//!   second and appends them to bounded histories;
//! - an **adaptive** task evaluates the histories every three seconds and
//!   issues at most one outlet correction per tick (see [`adaptive`]);
//! - **`set_pressure`** runs on the caller's thread and arbitrates with the
//!   other two through the shared state.
//!
//! The inlet controller's own PID closes the inner pressure loop; this
//! layer positions the outlet so the inlet always has authority, and owns
//! every safety interlock (measurement hold, manual override, emergency
//! stop).

pub mod adaptive;
pub mod history;
pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::error::{ControlError, Result};
use crate::instrument::{self, Endpoint, ValveLink};
use adaptive::{Action, AdaptiveEngine, Observation, Reason, MOVE_DEADBAND};
use history::History;
use state::{AdaptiveSubstate, SetpointState};

/// Depth of the pressure and inlet-position histories.
pub const HISTORY_DEPTH: usize = 10;

/// Inlet output percent at which the (inverse) valve counts as closed.
const INLET_CLOSED_CONFIRM: f64 = 99.9;

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Loop periods and delays of the controller. Defaults are the plant's
/// operating values; tests shrink them to keep wall-clock time down.
#[derive(Debug, Clone, Copy)]
pub struct ControllerTiming {
    /// Pressure/position poll period.
    pub poll_interval: Duration,
    /// Adaptive outlet loop period.
    pub adaptive_interval: Duration,
    /// Wait after pre-positioning the outlet before engaging the inlet.
    pub settle_delay: Duration,
    /// Post-transition window during which slow conditions are ignored.
    pub blind_window: Duration,
    /// Deadline for the inlet to confirm closed during pump-down.
    pub pump_down_timeout: Duration,
    /// Adaptive pause after a manual valve action.
    pub manual_override_cooldown: Duration,
    /// Dwell per step of the vacuum outlet ramp.
    pub ramp_step_delay: Duration,
    /// Hold between the two ramp stages.
    pub ramp_hold: Duration,
    /// Settling delay after commanding both valves closed.
    pub close_delay: Duration,
}

impl Default for ControllerTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            adaptive_interval: Duration::from_secs(3),
            settle_delay: Duration::from_secs(3),
            blind_window: Duration::from_secs(10),
            pump_down_timeout: Duration::from_secs(15),
            manual_override_cooldown: Duration::from_secs(15),
            ramp_step_delay: Duration::from_secs(1),
            ramp_hold: Duration::from_secs(5),
            close_delay: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Emergency stop
// ---------------------------------------------------------------------------

/// Single-bit emergency-stop event, visible to every loop in the process.
#[derive(Clone, Default)]
pub struct EStop {
    flag: Arc<AtomicBool>,
}

impl EStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Raw flag for wait loops that only need to observe it.
    pub fn as_atomic(&self) -> &AtomicBool {
        &self.flag
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Scalar fields behind the controller's top-level mutex. Valve positions
/// and pressure start unknown; every consumer handles `None`.
struct ControlState {
    current_pressure: Option<f64>,
    inlet_position: Option<f64>,
    outlet_position: Option<f64>,
    system_setpoint: f64,
    previous_setpoint: f64,
    pressure_history: History<HISTORY_DEPTH>,
    inlet_history: History<HISTORY_DEPTH>,
    setpoint_state: SetpointState,
    blind_started: Option<Instant>,
    manual_override_until: Option<Instant>,
    engine: AdaptiveEngine,
    last_reason: Option<Reason>,
}

impl ControlState {
    fn new() -> Self {
        Self {
            current_pressure: None,
            inlet_position: None,
            outlet_position: None,
            system_setpoint: 0.0,
            previous_setpoint: 0.0,
            pressure_history: History::new(),
            inlet_history: History::new(),
            setpoint_state: SetpointState::Idle,
            blind_started: None,
            manual_override_until: None,
            engine: AdaptiveEngine::new(),
            last_reason: None,
        }
    }
}

struct Shared {
    full_scale: f64,
    timing: ControllerTiming,
    inlet: Endpoint,
    outlet: Endpoint,
    state: Mutex<ControlState>,
    e_stop: EStop,
    hold_outlet_valve: AtomicBool,
    hold_all_valves: AtomicBool,
    /// Poller and adaptive loops run only while set; cleared by e-stop.
    automatic: AtomicBool,
    /// Optional external readiness gate (the turbo monitor's); while it
    /// reads `false`, adaptive corrections are suspended.
    pump_gate: Mutex<Option<Arc<AtomicBool>>>,
    shutdown: AtomicBool,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().expect("controller state lock poisoned")
    }

    fn transition(&self, next: SetpointState) {
        let mut st = self.state();
        if st.setpoint_state != next {
            info!(
                "controller state: {} -> {}",
                st.setpoint_state.name(),
                next.name()
            );
            st.setpoint_state = next;
        }
    }

    /// Sleep in slices, aborting early on e-stop or shutdown.
    /// Returns `false` when interrupted.
    fn sleep_cancelable(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.e_stop.is_set() || self.shutdown.load(Ordering::Relaxed) {
                return false;
            }
            thread::sleep(SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
        true
    }

    /// One poll of pressure and both valve positions.
    fn poll_once(&self) {
        let process_value = self.inlet.read_process_value();
        let inlet_position = self.inlet.read_valve_position();
        let outlet_position = self.outlet.read_valve_position();

        let mut st = self.state();
        if let Some(percent) = process_value {
            let torr = percent / 100.0 * self.full_scale;
            st.current_pressure = Some(torr);
            st.pressure_history.push(torr);
        }
        if let Some(position) = inlet_position {
            st.inlet_position = Some(position);
            st.inlet_history.push(position);
        }
        if let Some(position) = outlet_position {
            st.outlet_position = Some(position);
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// The dual-valve pressure state controller. Uniquely owns the inlet and
/// outlet transports; higher layers hold shared views through the accessor
/// methods.
pub struct PressureController {
    shared: Arc<Shared>,
    poller: Option<JoinHandle<()>>,
    adaptive: Option<JoinHandle<()>>,
}

impl PressureController {
    /// Construct the controller and perform one-time hardware
    /// initialisation (full-scale range selection on both controllers).
    pub fn new(
        inlet: Box<dyn ValveLink>,
        outlet: Box<dyn ValveLink>,
        full_scale_torr: f64,
        timing: ControllerTiming,
        e_stop: EStop,
    ) -> Self {
        let inlet = Endpoint::new("inlet", inlet);
        let outlet = Endpoint::new("outlet", outlet);
        instrument::init_full_scale(&inlet, &outlet, full_scale_torr);

        Self {
            shared: Arc::new(Shared {
                full_scale: full_scale_torr,
                timing,
                inlet,
                outlet,
                state: Mutex::new(ControlState::new()),
                e_stop,
                hold_outlet_valve: AtomicBool::new(false),
                hold_all_valves: AtomicBool::new(false),
                automatic: AtomicBool::new(false),
                pump_gate: Mutex::new(None),
                shutdown: AtomicBool::new(false),
            }),
            poller: None,
            adaptive: None,
        }
    }

    /// Spawn the poller and adaptive tasks and enable automatic action.
    pub fn start(&mut self) {
        self.shared.automatic.store(true, Ordering::SeqCst);
        if self.poller.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        self.poller = Some(
            thread::Builder::new()
                .name("pressure-poll".to_string())
                .spawn(move || {
                    while !shared.shutdown.load(Ordering::Relaxed) {
                        if shared.automatic.load(Ordering::Relaxed) {
                            shared.poll_once();
                        }
                        thread::sleep(shared.timing.poll_interval);
                    }
                })
                .expect("spawn pressure poller"),
        );

        let shared = Arc::clone(&self.shared);
        self.adaptive = Some(
            thread::Builder::new()
                .name("adaptive-outlet".to_string())
                .spawn(move || {
                    while !shared.shutdown.load(Ordering::Relaxed) {
                        let hold_in_blind = adaptive_tick(&shared);
                        thread::sleep(shared.timing.adaptive_interval);
                        if hold_in_blind {
                            // Give a fresh transition extra time to settle
                            // before the next evaluation.
                            thread::sleep(shared.timing.adaptive_interval);
                        }
                    }
                })
                .expect("spawn adaptive loop"),
        );
    }

    /// Stop both tasks. Valves are left as commanded.
    pub fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.adaptive.take() {
            let _ = handle.join();
        }
    }

    // ── Setpoint command path ─────────────────────────────────

    /// Drive the system to `setpoint_torr`. `predicted_outlet` pre-positions
    /// the outlet (typically from the learned-position store); without it a
    /// transition from vacuum falls back to a coarse first guess.
    ///
    /// Not re-entrant: callers serialise their own invocations.
    pub fn set_pressure(&self, setpoint_torr: f64, predicted_outlet: Option<f64>) -> Result<()> {
        let shared = &self.shared;
        if shared.e_stop.is_set() {
            return Err(ControlError::EmergencyStop.into());
        }
        if !(0.0..=shared.full_scale).contains(&setpoint_torr) {
            return Err(ControlError::OutOfRange("setpoint outside 0..=full scale").into());
        }

        let previous = {
            let mut st = shared.state();
            shared.hold_all_valves.store(false, Ordering::SeqCst);
            st.previous_setpoint = st.system_setpoint;
            st.system_setpoint = setpoint_torr;
            st.pressure_history.clear();
            st.blind_started = None;
            st.last_reason = None;
            st.engine.reset_for_setpoint();
            st.previous_setpoint
        };
        info!(
            "setpoint {:.3} Torr commanded (previous {:.3})",
            setpoint_torr, previous
        );

        if setpoint_torr == 0.0 {
            self.pump_to_vacuum()
        } else {
            self.transition_to(setpoint_torr, previous, predicted_outlet)
        }
    }

    /// Pump-to-vacuum: close the inlet, stage the outlet open if the system
    /// is still near full scale, then open the outlet fully.
    fn pump_to_vacuum(&self) -> Result<()> {
        let shared = &self.shared;
        shared.transition(SetpointState::PumpingDown);
        shared.inlet.command_close();

        // Wait for the (inverse) inlet to confirm closed.
        let deadline = Instant::now() + shared.timing.pump_down_timeout;
        loop {
            if shared.e_stop.is_set() {
                return Err(ControlError::EmergencyStop.into());
            }
            if let Some(position) = shared.inlet.read_valve_position() {
                let mut st = shared.state();
                st.inlet_position = Some(position);
                st.inlet_history.push(position);
                if position >= INLET_CLOSED_CONFIRM {
                    break;
                }
            }
            if Instant::now() > deadline {
                error!("inlet valve did not confirm closed; aborting pump-down");
                shared.transition(SetpointState::Idle);
                return Err(ControlError::PumpDownTimeout.into());
            }
            if !shared.sleep_cancelable(Duration::from_millis(500)) {
                return Err(ControlError::EmergencyStop.into());
            }
        }

        // A chamber near full scale dumps too much gas for an immediately
        // open outlet; bleed it down in stages first.
        let near_full_scale = shared
            .state()
            .current_pressure
            .is_some_and(|p| p > 0.75 * shared.full_scale);
        if near_full_scale {
            info!("staged outlet ramp before full open");
            for step in 0..10u32 {
                if shared.e_stop.is_set() {
                    return Err(ControlError::EmergencyStop.into());
                }
                shared.outlet.apply_setpoint(2.0 + 2.0 * f64::from(step));
                if !shared.sleep_cancelable(shared.timing.ramp_step_delay) {
                    return Err(ControlError::EmergencyStop.into());
                }
            }
            if !shared.sleep_cancelable(shared.timing.ramp_hold) {
                return Err(ControlError::EmergencyStop.into());
            }
            for step in 1..=10u32 {
                if shared.e_stop.is_set() {
                    return Err(ControlError::EmergencyStop.into());
                }
                shared.outlet.apply_setpoint(20.0 + 0.5 * f64::from(step));
                if !shared.sleep_cancelable(shared.timing.ramp_step_delay) {
                    return Err(ControlError::EmergencyStop.into());
                }
            }
            if !shared.sleep_cancelable(shared.timing.ramp_step_delay) {
                return Err(ControlError::EmergencyStop.into());
            }
        }

        shared.outlet.apply_setpoint(100.0);
        shared.transition(SetpointState::VacuumHold);
        Ok(())
    }

    /// Transition to a non-zero setpoint.
    fn transition_to(
        &self,
        setpoint_torr: f64,
        previous: f64,
        predicted_outlet: Option<f64>,
    ) -> Result<()> {
        let shared = &self.shared;
        shared.transition(SetpointState::Transitioning);

        let initial = predicted_outlet.or_else(|| {
            (previous == 0.0)
                .then(|| adaptive::initial_outlet_position(setpoint_torr, shared.full_scale))
        });
        if let Some(target) = initial {
            info!("pre-positioning outlet at {:.1}%", target);
            shared.outlet.apply_setpoint(target);
            // Let the valve physically arrive before engaging the inlet.
            if !shared.sleep_cancelable(shared.timing.settle_delay) {
                return Err(ControlError::EmergencyStop.into());
            }
            shared.poll_once();
        }

        if previous == 0.0 {
            shared.state().blind_started = Some(Instant::now());
        }

        let percent = 100.0 * setpoint_torr / shared.full_scale;
        shared.inlet.apply_setpoint(percent);
        shared.transition(SetpointState::Holding);
        Ok(())
    }

    // ── Interlocks and safety ─────────────────────────────────

    /// Attach the pump-readiness flag. While the flag reads `false` the
    /// adaptive loop holds the outlet where it is.
    pub fn attach_pump_gate(&self, gate: Arc<AtomicBool>) {
        *self
            .shared
            .pump_gate
            .lock()
            .expect("pump gate lock poisoned") = Some(gate);
    }

    /// Freeze or release the outlet valve for a measurement window.
    pub fn set_hold_outlet(&self, hold: bool) {
        self.shared.hold_outlet_valve.store(hold, Ordering::SeqCst);
        let current = self.shared.state().setpoint_state;
        match (hold, current) {
            (true, SetpointState::Holding) => self.shared.transition(SetpointState::Measuring),
            (false, SetpointState::Measuring) => self.shared.transition(SetpointState::Holding),
            _ => {}
        }
    }

    /// Close both valves and hold them closed.
    pub fn close_valves(&self) {
        self.shared.hold_all_valves.store(true, Ordering::SeqCst);
        self.shared.inlet.command_close();
        self.shared.outlet.command_close();
        thread::sleep(self.shared.timing.close_delay);
    }

    /// Latch the emergency stop: close both valves and disable automatic
    /// action until [`resume`](Self::resume).
    pub fn trigger_e_stop(&self) {
        warn!("EMERGENCY STOP");
        self.shared.e_stop.trigger();
        self.shared.automatic.store(false, Ordering::SeqCst);
        self.shared.hold_all_valves.store(true, Ordering::SeqCst);
        self.shared.inlet.command_close();
        self.shared.outlet.command_close();
        self.shared.transition(SetpointState::Halted);
    }

    /// Clear the emergency stop and re-enable the poller and adaptive loop.
    pub fn resume(&self) {
        info!("resuming from emergency stop");
        self.shared.e_stop.clear();
        self.shared.hold_all_valves.store(false, Ordering::SeqCst);
        self.shared.automatic.store(true, Ordering::SeqCst);
        self.shared.transition(SetpointState::Idle);
    }

    // ── Manual actions ────────────────────────────────────────

    /// Nudge the outlet by `delta` percent. Pauses adaptive action for the
    /// manual-override cooldown.
    pub fn bump_outlet(&self, delta: f64) {
        if self.shared.hold_outlet_valve.load(Ordering::SeqCst) {
            warn!("outlet is held for a measurement; manual bump ignored");
            return;
        }
        let Some(current) = self.shared.state().outlet_position else {
            warn!("outlet position unknown; manual bump ignored");
            return;
        };
        self.activate_manual_override();
        let target = (current + delta).clamp(0.0, 100.0);
        self.shared.outlet.apply_setpoint(target);
    }

    /// Nudge the inlet by `delta` percent via its manual position setpoint.
    pub fn bump_inlet(&self, delta: f64) {
        let Some(current) = self.shared.state().inlet_position else {
            warn!("inlet position unknown; manual bump ignored");
            return;
        };
        self.activate_manual_override();
        let target = (current + delta).clamp(0.0, 100.0);
        self.shared.inlet.apply_manual_position(target);
    }

    /// Open the outlet fully (manual/vent path).
    pub fn open_outlet_fully(&self) {
        self.activate_manual_override();
        self.shared.outlet.apply_setpoint(100.0);
    }

    /// Open the inlet fully via its manual position setpoint (vent path —
    /// the inlet is inverse, so position 0 is wide open).
    pub fn open_inlet_fully(&self) {
        self.activate_manual_override();
        self.shared.inlet.apply_manual_position(0.0);
    }

    fn activate_manual_override(&self) {
        let cooldown = self.shared.timing.manual_override_cooldown;
        let mut st = self.shared.state();
        if st.manual_override_until.is_none() {
            info!(
                "manual override active; pausing adaptive logic for {}s",
                cooldown.as_secs()
            );
        }
        st.manual_override_until = Some(Instant::now() + cooldown);
    }

    // ── Views ─────────────────────────────────────────────────

    pub fn full_scale(&self) -> f64 {
        self.shared.full_scale
    }

    pub fn current_pressure(&self) -> Option<f64> {
        self.shared.state().current_pressure
    }

    /// `(mean, stdev)` of the pressure history once it is full.
    pub fn pressure_history_stats(&self) -> Option<(f64, f64)> {
        let st = self.shared.state();
        if !st.pressure_history.is_full() {
            return None;
        }
        Some((st.pressure_history.mean()?, st.pressure_history.stdev()?))
    }

    /// `(inlet, outlet)` valve output percents.
    pub fn valve_positions(&self) -> (Option<f64>, Option<f64>) {
        let st = self.shared.state();
        (st.inlet_position, st.outlet_position)
    }

    pub fn outlet_position(&self) -> Option<f64> {
        self.shared.state().outlet_position
    }

    pub fn system_setpoint(&self) -> f64 {
        self.shared.state().system_setpoint
    }

    pub fn setpoint_state(&self) -> SetpointState {
        self.shared.state().setpoint_state
    }

    pub fn adaptive_substate(&self) -> AdaptiveSubstate {
        let st = self.shared.state();
        let blind_active = st
            .blind_started
            .is_some_and(|t| t.elapsed() <= self.shared.timing.blind_window);
        st.engine.substate(blind_active)
    }

    pub fn e_stop(&self) -> EStop {
        self.shared.e_stop.clone()
    }

    /// Force one synchronous poll (used after manual moves and in tests).
    pub fn poll_now(&self) {
        self.shared.poll_once();
    }
}

impl Drop for PressureController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Adaptive tick
// ---------------------------------------------------------------------------

/// One pass of the adaptive loop. Returns `true` when the loop chose to
/// hold during the blind window, which earns the transition an extra tick
/// of settling time.
fn adaptive_tick(shared: &Shared) -> bool {
    if shared.e_stop.is_set()
        || !shared.automatic.load(Ordering::Relaxed)
        || shared.hold_all_valves.load(Ordering::SeqCst)
        || shared.hold_outlet_valve.load(Ordering::SeqCst)
    {
        return false;
    }
    let pump_held = shared
        .pump_gate
        .lock()
        .expect("pump gate lock poisoned")
        .as_ref()
        .is_some_and(|gate| !gate.load(Ordering::Relaxed));
    if pump_held {
        return false;
    }

    // Decide under the state lock, command after releasing it.
    let decision = {
        let mut st = shared.state();

        if let Some(until) = st.manual_override_until {
            if Instant::now() < until {
                return false;
            }
            st.manual_override_until = None;
            info!("manual override cooldown finished; resuming adaptive logic");
        }

        let blind_active = match st.blind_started {
            Some(started) if started.elapsed() <= shared.timing.blind_window => true,
            Some(_) => {
                st.blind_started = None;
                false
            }
            None => false,
        };

        let setpoint = st.system_setpoint;
        if setpoint <= 0.0 || !st.pressure_history.is_full() {
            return false;
        }
        let (Some(pressure), Some(inlet_position), Some(outlet_position)) =
            (st.current_pressure, st.inlet_position, st.outlet_position)
        else {
            return false;
        };
        let (Some(pressure_mean), Some(pressure_stdev)) =
            (st.pressure_history.mean(), st.pressure_history.stdev())
        else {
            return false;
        };

        let inlet_opening = st
            .inlet_history
            .previous()
            .zip(st.inlet_history.latest())
            .is_some_and(|(prev, latest)| prev - latest > 0.1);

        let observation = Observation {
            setpoint,
            previous_setpoint: st.previous_setpoint,
            full_scale: shared.full_scale,
            current_pressure: pressure,
            inlet_position,
            pressure_mean,
            pressure_stdev,
            inlet_stdev: st.inlet_history.is_full().then(|| st.inlet_history.stdev()).flatten(),
            inlet_opening,
            blind_active,
        };

        let action = state_action(&mut st, &observation, outlet_position);
        (action, blind_active)
    };

    let (action, blind_active) = decision;
    match action {
        Some(target) => {
            shared.outlet.apply_setpoint(target);
            false
        }
        None => blind_active,
    }
}

/// Run the engine, apply the clamp and deadband, and log reason changes.
/// Returns the commanded outlet target when a move is warranted.
fn state_action(st: &mut ControlState, obs: &Observation, outlet_position: f64) -> Option<f64> {
    let action = st.engine.evaluate(obs);
    match action {
        Action::Adjust { delta, reason } => {
            log_reason_change(st, reason);
            let target =
                adaptive::clamp_outlet(outlet_position + delta, obs.setpoint, obs.full_scale);
            if (target - outlet_position).abs() > MOVE_DEADBAND {
                info!(
                    "adaptive: {} -> outlet {:+.1}% to {:.2}%",
                    reason.describe(),
                    delta,
                    target
                );
                Some(target)
            } else {
                None
            }
        }
        Action::Engage(reason) => {
            log_reason_change(st, reason);
            None
        }
        Action::Hold => None,
    }
}

fn log_reason_change(st: &mut ControlState, reason: Reason) {
    if st.last_reason != Some(reason) {
        info!("adaptive condition: {}", reason.describe());
        st.last_reason = Some(reason);
    }
}
