//! Adaptive outlet decision engine.
//!
//! Pure logic, no I/O: each tick the controller's adaptive loop builds an
//! [`Observation`] from the shared state and asks the engine for at most
//! one outlet correction. The inlet controller's own PID closes the inner
//! loop; this engine only repositions the outlet so that the inlet has
//! authority to do its job.
//!
//! Conditions handled, in priority order (first match wins):
//!
//! 1. Pressure oscillation — step the outlet closed; a large positive
//!    error escalates to an emergency descent.
//! 2. Inlet-valve oscillation — step the outlet closed.
//! 3. Leak-up: inlet closed but pressure rising — step the outlet open.
//! 4. Stuck high: pressure stable above setpoint — step the outlet open.
//! 5. Overworked inlet: inlet driven too far open — freeze the outlet
//!    while the inlet is still opening, otherwise step closed.
//! 6. Near-closed inlet — step the outlet open to restore authority.

use super::state::AdaptiveSubstate;

/// Counter value at which a pressure oscillation triggers a correction.
const OSCILLATION_TRIGGER: u8 = 2;

/// Pressure-oscillation counter saturates here while accumulating.
const OSCILLATION_CAP: u8 = 5;

/// Counter value at which inlet oscillation triggers a correction.
const INLET_OSCILLATION_TRIGGER: u8 = 3;

/// Inlet-position stdev (percent) treated as inlet oscillation.
const INLET_OSCILLATION_STDEV: f64 = 2.0;

/// Consecutive polls above 99.5 % before the inlet counts as near-closed.
const NEAR_CLOSED_TRIGGER: u8 = 5;

/// Inlet position (percent, inverse scale) above which it is near-closed.
const NEAR_CLOSED_POSITION: f64 = 99.5;

/// Inlet position below which the inlet is considered overworked.
const INLET_OVERWORKED_POSITION: f64 = 75.0;

/// Outlet move smaller than this is not worth a serial command.
pub const MOVE_DEADBAND: f64 = 0.1;

// ---------------------------------------------------------------------------
// Observation and action
// ---------------------------------------------------------------------------

/// Snapshot of everything one adaptive tick looks at.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub setpoint: f64,
    pub previous_setpoint: f64,
    pub full_scale: f64,
    pub current_pressure: f64,
    /// Inlet valve output percent (inverse scale: 100 = closed).
    pub inlet_position: f64,
    /// Mean of the full pressure history.
    pub pressure_mean: f64,
    /// Sample stdev of the full pressure history.
    pub pressure_stdev: f64,
    /// Sample stdev of the inlet-position history, when that history is full.
    pub inlet_stdev: Option<f64>,
    /// Inlet position fell by more than 0.1 % since the previous poll
    /// (the valve is opening).
    pub inlet_opening: bool,
    /// Post-transition blind window is active.
    pub blind_active: bool,
}

/// Why a correction was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    EmergencyDescent,
    PressureOscillation,
    InletOscillation,
    LeakUp,
    StuckHigh,
    InletOverworked,
    MaxSlopeHold,
    InletNearClosed,
}

impl Reason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::EmergencyDescent => "emergency descent",
            Self::PressureOscillation => "pressure oscillation",
            Self::InletOscillation => "inlet oscillation",
            Self::LeakUp => "leak-up with inlet closed",
            Self::StuckHigh => "stable above setpoint",
            Self::InletOverworked => "inlet overworked",
            Self::MaxSlopeHold => "holding for inlet recovery",
            Self::InletNearClosed => "inlet near closed",
        }
    }
}

/// Outcome of one adaptive tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Move the outlet by `delta` percent (before clamping).
    Adjust { delta: f64, reason: Reason },
    /// No move, but a sub-state change worth reporting.
    Engage(Reason),
    /// Leave the outlet where it is.
    Hold,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Counter and sub-state holder for the adaptive loop.
#[derive(Debug, Default)]
pub struct AdaptiveEngine {
    oscillation: u8,
    inlet_oscillation: u8,
    near_closed: u8,
    cooldown: bool,
    max_slope_hold: bool,
}

impl AdaptiveEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry actions of a new setpoint command: release the max-slope hold
    /// and the oscillation cooldown. Counters persist; the cleared pressure
    /// history keeps them from acting until fresh statistics exist.
    pub fn reset_for_setpoint(&mut self) {
        self.max_slope_hold = false;
        self.cooldown = false;
    }

    pub fn substate(&self, blind_active: bool) -> AdaptiveSubstate {
        if blind_active {
            AdaptiveSubstate::BlindAfterTransition
        } else if self.max_slope_hold {
            AdaptiveSubstate::MaxSlopeHold
        } else if self.cooldown {
            AdaptiveSubstate::OscillationCooldown
        } else {
            AdaptiveSubstate::Quiescent
        }
    }

    /// Evaluate one tick. The caller has already verified that the pressure
    /// history is full and that pressure and valve positions are known.
    pub fn evaluate(&mut self, obs: &Observation) -> Action {
        let fs = obs.full_scale;
        let sp = obs.setpoint;
        let error = obs.current_pressure - sp;
        let near_setpoint = (obs.pressure_mean - sp).abs() < 0.02 * fs;
        let pressure_stable = obs.pressure_stdev < 0.005 + sp * 0.001;

        // ── Counters ─────────────────────────────────────────────
        if near_setpoint && !obs.blind_active {
            let oscillation_threshold = sp * 0.003 + fs * 0.0008;
            if obs.pressure_stdev > oscillation_threshold {
                self.oscillation = (self.oscillation + 1).min(OSCILLATION_CAP);
                self.cooldown = true;
            } else if self.oscillation > 0 {
                self.oscillation -= 1;
                if self.oscillation == 0 {
                    self.cooldown = false;
                }
            }

            if let Some(inlet_stdev) = obs.inlet_stdev {
                if inlet_stdev > INLET_OSCILLATION_STDEV {
                    self.inlet_oscillation = self.inlet_oscillation.saturating_add(1);
                } else {
                    self.inlet_oscillation = 0;
                }
            }
        }

        if obs.inlet_position > NEAR_CLOSED_POSITION {
            self.near_closed = self.near_closed.saturating_add(1);
        } else {
            self.near_closed = 0;
        }

        // ── Decisions, first match wins ──────────────────────────
        if self.oscillation >= OSCILLATION_TRIGGER {
            self.oscillation = 0;
            return if error > 0.05 * fs {
                Action::Adjust {
                    delta: -2.0,
                    reason: Reason::EmergencyDescent,
                }
            } else {
                Action::Adjust {
                    delta: -0.2,
                    reason: Reason::PressureOscillation,
                }
            };
        }

        if self.inlet_oscillation >= INLET_OSCILLATION_TRIGGER {
            self.inlet_oscillation = 0;
            return Action::Adjust {
                delta: -0.2,
                reason: Reason::InletOscillation,
            };
        }

        if obs.inlet_position < 1.0 && error > 0.1 {
            return Action::Adjust {
                delta: 0.2,
                reason: Reason::LeakUp,
            };
        }

        if pressure_stable && error > 0.2 && !obs.blind_active && !self.cooldown {
            return Action::Adjust {
                delta: 0.5,
                reason: Reason::StuckHigh,
            };
        }

        if obs.inlet_position < INLET_OVERWORKED_POSITION
            && !self.cooldown
            && !obs.blind_active
            && !self.max_slope_hold
        {
            if obs.inlet_opening {
                self.max_slope_hold = true;
                return Action::Engage(Reason::MaxSlopeHold);
            }
            return Action::Adjust {
                delta: -0.5,
                reason: Reason::InletOverworked,
            };
        }

        if self.near_closed >= NEAR_CLOSED_TRIGGER && sp > 0.0 && obs.previous_setpoint != 0.0 {
            self.near_closed = 0;
            let delta = if error > 0.01 * fs { 1.0 } else { 0.5 };
            return Action::Adjust {
                delta,
                reason: Reason::InletNearClosed,
            };
        }

        if self.max_slope_hold {
            if pressure_stable && error > 0.1 {
                self.max_slope_hold = false;
            }
            return Action::Hold;
        }

        Action::Hold
    }
}

// ---------------------------------------------------------------------------
// Outlet position limits
// ---------------------------------------------------------------------------

/// Safe outlet clamp for the current setpoint / full-scale ratio.
pub fn outlet_clamp(setpoint: f64, full_scale: f64) -> (f64, f64) {
    let ratio = setpoint / full_scale;
    if ratio <= 0.10 {
        (5.0, 85.0)
    } else if ratio <= 0.40 {
        (15.0, 50.0)
    } else if ratio < 0.90 {
        (22.0, 35.0)
    } else {
        (22.0, 40.0)
    }
}

/// Clamp a candidate outlet position into the safe band.
pub fn clamp_outlet(candidate: f64, setpoint: f64, full_scale: f64) -> f64 {
    let (lo, hi) = outlet_clamp(setpoint, full_scale);
    candidate.clamp(lo, hi)
}

/// First-guess outlet position when transitioning up from vacuum with no
/// learned prediction available.
pub fn initial_outlet_position(setpoint: f64, full_scale: f64) -> f64 {
    let percent = 100.0 * setpoint / full_scale;
    if percent >= 90.0 {
        24.0
    } else if percent > 40.0 {
        28.0
    } else if percent > 10.0 {
        40.0
    } else {
        70.0
    }
}
