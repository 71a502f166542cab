//! Explicit lifecycle states of the pressure controller.
//!
//! ```text
//! Idle ──set_pressure(v>0)──▶ Transitioning ──settle──▶ Holding
//! Holding ──set_pressure(0)──▶ PumpingDown ──ramp done──▶ VacuumHold
//! Any ──e-stop──▶ Halted ──resume──▶ Idle
//! Holding ──measurement hold──▶ Measuring ──release──▶ Holding
//! ```

/// Setpoint lifecycle of the whole controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetpointState {
    /// No setpoint active.
    Idle,
    /// Moving towards a new non-zero setpoint.
    Transitioning,
    /// Holding a non-zero setpoint under adaptive control.
    Holding,
    /// Holding with the outlet frozen for a measurement window.
    Measuring,
    /// Executing the pump-to-vacuum sequence.
    PumpingDown,
    /// Inlet closed, outlet fully open, system at base pressure.
    VacuumHold,
    /// Emergency stop latched; all valves closed.
    Halted,
}

impl SetpointState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Transitioning => "Transitioning",
            Self::Holding => "Holding",
            Self::Measuring => "Measuring",
            Self::PumpingDown => "PumpingDown",
            Self::VacuumHold => "VacuumHold",
            Self::Halted => "Halted",
        }
    }
}

/// Sub-state of the adaptive outlet loop while the controller is holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveSubstate {
    /// Normal operation.
    Quiescent,
    /// Oscillation detected recently; upward corrections suppressed.
    OscillationCooldown,
    /// Outlet frozen while the inlet recovers from being driven too far open.
    MaxSlopeHold,
    /// Post-transition window during which slow-settling conditions are ignored.
    BlindAfterTransition,
}
