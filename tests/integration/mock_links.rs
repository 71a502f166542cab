//! Mock transports and ports for integration tests.
//!
//! [`MockValve`] records every command written to a valve controller so
//! tests can assert on the full command history, and answers `R5`/`R6`
//! queries from a scriptable plant model. [`ScriptedControl`] and
//! [`LinkedSampler`] fake the whole pressure loop for sequencer tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use presscal::control::EStop;
use presscal::daq::DutSampler;
use presscal::error::TransportError;
use presscal::events::{EventSink, OperatorPrompt, RunEvent};
use presscal::instrument::ValveLink;
use presscal::sequence::PressureControl;

// ── MockValve ─────────────────────────────────────────────────

/// Scriptable plant state behind one valve controller.
pub struct ValvePlant {
    /// `R5` reply: process value in percent of full scale.
    pub process_value: Mutex<f64>,
    /// `R6` reply: valve output percent.
    pub position: Mutex<f64>,
    /// Every command written (both fire-and-forget and queries).
    pub writes: Mutex<Vec<String>>,
}

impl ValvePlant {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            process_value: Mutex::new(0.0),
            position: Mutex::new(0.0),
            writes: Mutex::new(Vec::new()),
        })
    }

    pub fn set_process_value(&self, percent: f64) {
        *self.process_value.lock().unwrap() = percent;
    }

    pub fn set_position(&self, percent: f64) {
        *self.position.lock().unwrap() = percent;
    }

    /// Commands written so far, excluding queries.
    pub fn commands(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    pub fn command_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    pub fn has_command(&self, cmd: &str) -> bool {
        self.writes.lock().unwrap().iter().any(|c| c == cmd)
    }

    /// Last `S1` target written, if any.
    pub fn last_setpoint(&self) -> Option<f64> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|c| c.strip_prefix("S1 ").and_then(|v| v.parse().ok()))
    }
}

pub struct MockValve {
    plant: Arc<ValvePlant>,
}

impl MockValve {
    pub fn new() -> (Self, Arc<ValvePlant>) {
        let plant = ValvePlant::new();
        (
            Self {
                plant: Arc::clone(&plant),
            },
            plant,
        )
    }
}

impl ValveLink for MockValve {
    fn write(&mut self, cmd: &str) -> Result<(), TransportError> {
        self.plant.writes.lock().unwrap().push(cmd.to_string());
        Ok(())
    }

    fn query(&mut self, cmd: &str) -> Option<String> {
        match cmd {
            "R5" => Some(format!("{:.3}", *self.plant.process_value.lock().unwrap())),
            "R6" => Some(format!("{:.3}", *self.plant.position.lock().unwrap())),
            _ => Some(String::new()),
        }
    }
}

// ── ScriptedControl ───────────────────────────────────────────

/// Fake pressure controller that is instantly stable at `setpoint +
/// offset`, for sequencer tests.
pub struct ScriptedControl {
    pub full_scale: f64,
    /// Pressure reads back as `setpoint + offset`.
    pub offset: Mutex<f64>,
    pub setpoint: Mutex<f64>,
    pub set_calls: Mutex<Vec<(f64, Option<f64>)>>,
    pub hold_state: AtomicBool,
    pub hold_transitions: Mutex<Vec<bool>>,
    pub closed: AtomicBool,
    pub outlet_position: Mutex<f64>,
}

impl ScriptedControl {
    pub fn new(full_scale: f64) -> Arc<Self> {
        Arc::new(Self {
            full_scale,
            offset: Mutex::new(0.0),
            setpoint: Mutex::new(0.0),
            set_calls: Mutex::new(Vec::new()),
            hold_state: AtomicBool::new(false),
            hold_transitions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            outlet_position: Mutex::new(28.0),
        })
    }

    pub fn pressure(&self) -> f64 {
        *self.setpoint.lock().unwrap() + *self.offset.lock().unwrap()
    }
}

impl PressureControl for ScriptedControl {
    fn full_scale(&self) -> f64 {
        self.full_scale
    }

    fn set_pressure(
        &self,
        setpoint_torr: f64,
        predicted_outlet: Option<f64>,
    ) -> presscal::error::Result<()> {
        *self.setpoint.lock().unwrap() = setpoint_torr;
        self.set_calls
            .lock()
            .unwrap()
            .push((setpoint_torr, predicted_outlet));
        Ok(())
    }

    fn current_pressure(&self) -> Option<f64> {
        Some(self.pressure())
    }

    fn pressure_history_stats(&self) -> Option<(f64, f64)> {
        Some((self.pressure(), 0.0))
    }

    fn valve_positions(&self) -> (Option<f64>, Option<f64>) {
        (Some(90.0), Some(*self.outlet_position.lock().unwrap()))
    }

    fn set_hold_outlet(&self, hold: bool) {
        self.hold_state.store(hold, Ordering::SeqCst);
        self.hold_transitions.lock().unwrap().push(hold);
    }

    fn close_valves(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── LinkedSampler ─────────────────────────────────────────────

/// DAQ fake whose voltages track the scripted controller's pressure, so a
/// device reads back exactly the standard (a perfectly calibrated DUT).
pub struct LinkedSampler {
    pub control: Arc<ScriptedControl>,
    pub divider_factor: f64,
    /// Per-channel DUT full scale; 0 disables the channel.
    pub channel_fs: [f64; 4],
    /// Additive pressure error injected per channel (Torr).
    pub channel_error: [f64; 4],
}

impl DutSampler for LinkedSampler {
    fn read(&self, channel: usize) -> f64 {
        let fs = self.channel_fs[channel];
        if fs == 0.0 {
            return 0.0;
        }
        let target_torr = self.control.pressure() + self.channel_error[channel];
        // Invert pressure = volts * divider * fs / 10.
        target_torr * 10.0 / (self.divider_factor * fs)
    }
}

// ── Sinks and prompts ─────────────────────────────────────────

#[derive(Default)]
pub struct CollectingSink {
    pub events: Vec<RunEvent>,
}

impl EventSink for CollectingSink {
    fn emit(&mut self, event: &RunEvent) {
        self.events.push(event.clone());
    }
}

/// Prompt that rejects the first `rejections` requests, then accepts.
pub struct ScriptedPrompt {
    pub rejections: usize,
    pub calls: usize,
}

impl ScriptedPrompt {
    pub fn accepting() -> Self {
        Self {
            rejections: 0,
            calls: 0,
        }
    }

    pub fn rejecting_first(rejections: usize) -> Self {
        Self {
            rejections,
            calls: 0,
        }
    }
}

impl OperatorPrompt for ScriptedPrompt {
    fn accept_out_of_tolerance(&mut self, _sp: f64, _pressure: f64, _tolerance: f64) -> bool {
        self.calls += 1;
        self.calls > self.rejections
    }
}

/// Convenience: an e-stop plus cancel flag pair for sequencer construction.
pub fn run_flags() -> (Arc<std::sync::atomic::AtomicBool>, EStop) {
    (Arc::new(AtomicBool::new(false)), EStop::new())
}
