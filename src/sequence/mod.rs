//! Automated calibration sequencer.
//!
//! Walks the composite setpoint list, confirms stability at each point,
//! logs averaged readings for the standard and every device under test,
//! feeds the learned-position store, and emits a per-device diagnosis at
//! the end of the run.
//!
//! The sequencer drives the pressure controller and the DAQ reader through
//! the [`PressureControl`] and [`DutSampler`] ports, so the whole walk is
//! testable against scripted fakes.

pub mod analysis;
pub mod report;
pub mod store;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::DutConfig;
use crate::control::{EStop, PressureController};
use crate::daq::DutSampler;
use crate::error::{ControlError, Error};
use crate::events::{EventSink, OperatorPrompt, RunEvent};
use analysis::DutReport;
use report::{DebugTrace, ResultRow, ResultTable, TraceSample};
use store::LearnedStore;

/// Fraction of a DUT's full scale above which it is done for the run.
const RANGE_COMPLETE_FACTOR: f64 = 1.05;

/// Stability gate: pressure-history stdev must be below this fraction of
/// the standard's full scale.
const STABILITY_STDEV_FRACTION: f64 = 0.0003;

/// Per-device tolerance as a fraction of its full scale.
const TOLERANCE_FRACTION: f64 = 0.005;

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// The sequencer's view of the pressure controller.
pub trait PressureControl {
    fn full_scale(&self) -> f64;
    fn set_pressure(&self, setpoint_torr: f64, predicted_outlet: Option<f64>)
    -> crate::error::Result<()>;
    fn current_pressure(&self) -> Option<f64>;
    /// `(mean, stdev)` of the pressure history once it is full.
    fn pressure_history_stats(&self) -> Option<(f64, f64)>;
    /// `(inlet, outlet)` valve output percents.
    fn valve_positions(&self) -> (Option<f64>, Option<f64>);
    fn set_hold_outlet(&self, hold: bool);
    fn close_valves(&self);
}

impl PressureControl for PressureController {
    fn full_scale(&self) -> f64 {
        Self::full_scale(self)
    }

    fn set_pressure(
        &self,
        setpoint_torr: f64,
        predicted_outlet: Option<f64>,
    ) -> crate::error::Result<()> {
        Self::set_pressure(self, setpoint_torr, predicted_outlet)
    }

    fn current_pressure(&self) -> Option<f64> {
        Self::current_pressure(self)
    }

    fn pressure_history_stats(&self) -> Option<(f64, f64)> {
        Self::pressure_history_stats(self)
    }

    fn valve_positions(&self) -> (Option<f64>, Option<f64>) {
        Self::valve_positions(self)
    }

    fn set_hold_outlet(&self, hold: bool) {
        Self::set_hold_outlet(self, hold);
    }

    fn close_valves(&self) {
        Self::close_valves(self);
    }
}

// ---------------------------------------------------------------------------
// Setpoint generation
// ---------------------------------------------------------------------------

/// Compose the run's setpoint list: every 10 % step of the standard's full
/// scale and of each active device's full scale, deduplicated at two
/// decimals, ascending.
pub fn setpoint_list(standard_fs_torr: f64, duts: &[DutConfig]) -> Vec<f64> {
    let mut keys: BTreeSet<i64> = BTreeSet::new();
    let mut add_steps = |full_scale: f64| {
        for percent in (0..=100).step_by(10) {
            let value = full_scale * f64::from(percent) / 100.0;
            keys.insert((value * 100.0).round() as i64);
        }
    };
    add_steps(standard_fs_torr);
    for dut in duts {
        add_steps(dut.full_scale_torr);
    }
    keys.into_iter().map(|key| key as f64 / 100.0).collect()
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Sequencer wait periods. Defaults are the operating values; tests shrink
/// them.
#[derive(Debug, Clone, Copy)]
pub struct SequencerTiming {
    /// Stability-wait poll period.
    pub stability_poll: Duration,
    /// Continuous in-tolerance time required before logging.
    pub stability_confirm: Duration,
    /// Stable-but-out-of-tolerance time before the operator is asked.
    pub override_after: Duration,
    /// Length of the averaged sample window.
    pub sample_window: Duration,
    /// Sample period inside the window.
    pub sample_period: Duration,
}

impl Default for SequencerTiming {
    fn default() -> Self {
        Self {
            stability_poll: Duration::from_millis(500),
            stability_confirm: Duration::from_secs(3),
            override_after: Duration::from_secs(20),
            sample_window: Duration::from_secs(5),
            sample_period: Duration::from_millis(200),
        }
    }
}

// ---------------------------------------------------------------------------
// Sequencer
// ---------------------------------------------------------------------------

/// Output of one calibration run.
pub struct RunOutput {
    pub table: ResultTable,
    pub trace: DebugTrace,
    pub reports: Vec<DutReport>,
    /// `false` when the run was canceled or stopped early.
    pub completed: bool,
}

/// The automated calibration sequencer.
pub struct CalibrationSequencer<'a> {
    controller: &'a dyn PressureControl,
    sampler: &'a dyn DutSampler,
    store: &'a mut LearnedStore,
    duts: Vec<DutConfig>,
    divider_factor: f64,
    timing: SequencerTiming,
    cancel: Arc<AtomicBool>,
    e_stop: EStop,
}

impl<'a> CalibrationSequencer<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        controller: &'a dyn PressureControl,
        sampler: &'a dyn DutSampler,
        store: &'a mut LearnedStore,
        duts: Vec<DutConfig>,
        divider_factor: f64,
        timing: SequencerTiming,
        cancel: Arc<AtomicBool>,
        e_stop: EStop,
    ) -> Self {
        Self {
            controller,
            sampler,
            store,
            duts,
            divider_factor,
            timing,
            cancel,
            e_stop,
        }
    }

    fn stopped(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || self.e_stop.is_set()
    }

    /// A DUT's own 10 % setpoints, as two-decimal keys.
    fn dut_setpoint_keys(full_scale: f64) -> BTreeSet<i64> {
        (0..=100)
            .step_by(10)
            .map(|percent| (full_scale * f64::from(percent)).round() as i64)
            .collect()
    }

    /// Run the full calibration sequence.
    pub fn run(&mut self, sink: &mut dyn EventSink, prompt: &mut dyn OperatorPrompt) -> RunOutput {
        let full_scale = self.controller.full_scale();
        let setpoints = setpoint_list(full_scale, &self.duts);
        info!("generated composite setpoints: {setpoints:?}");

        let dut_keys: Vec<(usize, BTreeSet<i64>)> = self
            .duts
            .iter()
            .map(|dut| (dut.channel, Self::dut_setpoint_keys(dut.full_scale_torr)))
            .collect();

        let channels: Vec<usize> = self.duts.iter().map(|d| d.channel).collect();
        let mut table = ResultTable::new(channels);
        let mut trace = DebugTrace::new();
        let mut completed_channels: BTreeSet<usize> = BTreeSet::new();
        let run_start = Instant::now();
        let mut ran_to_end = true;

        for &setpoint in &setpoints {
            if self.stopped() {
                ran_to_end = false;
                break;
            }
            if !self.sampler.link_ok() {
                warn!("acquisition link lost; halting run");
                ran_to_end = false;
                break;
            }

            // ── Prune completed DUTs ─────────────────────────────
            for dut in &self.duts {
                if setpoint > dut.full_scale_torr * RANGE_COMPLETE_FACTOR
                    && completed_channels.insert(dut.channel)
                {
                    sink.emit(&RunEvent::DutRangeComplete {
                        channel: dut.channel,
                    });
                }
            }
            if completed_channels.len() == self.duts.len() && !self.duts.is_empty() {
                info!("all devices have completed their ranges; ending run early");
                break;
            }

            let setpoint_start = Instant::now();
            sink.emit(&RunEvent::SetpointStarted {
                setpoint_torr: setpoint,
            });

            // ── Command ──────────────────────────────────────────
            let command = if setpoint == 0.0 {
                self.controller.set_pressure(0.0, None)
            } else {
                let predicted = self.store.predict(setpoint);
                self.controller.set_pressure(setpoint, predicted)
            };
            match command {
                Ok(()) => {}
                Err(Error::Control(ControlError::EmergencyStop)) => {
                    ran_to_end = false;
                    break;
                }
                Err(e) => {
                    warn!("setpoint {setpoint} Torr could not be commanded ({e}); skipping");
                    continue;
                }
            }

            // ── Stability wait ───────────────────────────────────
            let key = (setpoint * 100.0).round() as i64;
            let relevant_tolerance = dut_keys
                .iter()
                .filter(|(_, keys)| keys.contains(&key))
                .filter_map(|(channel, _)| {
                    self.duts
                        .iter()
                        .find(|d| d.channel == *channel)
                        .map(|d| d.full_scale_torr * TOLERANCE_FRACTION)
                })
                .fold(f64::INFINITY, f64::min);
            let priority_tolerance = if relevant_tolerance.is_finite() {
                relevant_tolerance
            } else {
                full_scale * TOLERANCE_FRACTION
            };

            if !self.wait_for_stability(setpoint, priority_tolerance, full_scale, run_start, &mut trace, prompt)
            {
                ran_to_end = false;
                break;
            }

            // ── Sample window ────────────────────────────────────
            let (standard_readings, dut_readings) =
                self.sample_window(run_start, &completed_channels, &mut trace);

            if self.stopped() {
                ran_to_end = false;
                break;
            }

            let mean_standard = mean(&standard_readings);
            if mean_standard.is_nan() {
                warn!("no standard readings captured at {setpoint} Torr; skipping point");
                continue;
            }

            // ── Learn ────────────────────────────────────────────
            if setpoint > 0.0 {
                if let (_, Some(outlet)) = self.controller.valve_positions() {
                    self.store.record(setpoint, outlet);
                }
            }

            // ── Record ───────────────────────────────────────────
            let mut dut_torr = [f64::NAN; 4];
            for dut in &self.duts {
                dut_torr[dut.channel] = mean(&dut_readings[dut.channel]);
            }
            table.push(ResultRow {
                setpoint_torr: setpoint,
                standard_torr: mean_standard,
                dut_torr,
            });
            sink.emit(&RunEvent::SetpointLogged {
                setpoint_torr: setpoint,
                standard_torr: mean_standard,
                elapsed_secs: setpoint_start.elapsed().as_secs_f64(),
            });

            // ── Per-point tolerance check ────────────────────────
            for dut in &self.duts {
                let reading = dut_torr[dut.channel];
                if reading.is_nan() {
                    continue;
                }
                let is_own_point = dut_keys
                    .iter()
                    .any(|(channel, keys)| *channel == dut.channel && keys.contains(&key));
                let error = reading - mean_standard;
                if is_own_point && error.abs() > dut.full_scale_torr * TOLERANCE_FRACTION {
                    sink.emit(&RunEvent::OutOfTolerance {
                        channel: dut.channel,
                        error_torr: error,
                    });
                }
            }
        }

        // ── Post-run analysis ────────────────────────────────────
        let mut reports = Vec::new();
        if ran_to_end {
            for dut in &self.duts {
                let pairs = table.pairs_for(dut.channel);
                let report = analysis::diagnose(dut.channel, dut.full_scale_torr, &pairs);
                let text = analysis::recommendation_text(&report);
                if report.passed() {
                    sink.emit(&RunEvent::CertificateReady {
                        channel: dut.channel,
                    });
                }
                sink.emit(&RunEvent::DiagnosisReady {
                    channel: dut.channel,
                    passed: report.passed(),
                    report: text,
                });
                reports.push(report);
            }
        }

        self.controller.close_valves();
        sink.emit(&RunEvent::RunFinished {
            rows: table.rows().len(),
        });

        RunOutput {
            table,
            trace,
            reports,
            completed: ran_to_end,
        }
    }

    /// Block until the pressure is stable and in tolerance for the
    /// confirmation period. Stable-but-out-of-tolerance for the waiting
    /// period asks the operator; acceptance proceeds, rejection restarts
    /// the wait. Returns `false` when the run was stopped.
    fn wait_for_stability(
        &self,
        setpoint: f64,
        tolerance: f64,
        full_scale: f64,
        run_start: Instant,
        trace: &mut DebugTrace,
        prompt: &mut dyn OperatorPrompt,
    ) -> bool {
        info!("waiting for pressure to stabilize at {setpoint} Torr");
        let stdev_gate = full_scale * STABILITY_STDEV_FRACTION;
        let mut confirmed_since: Option<Instant> = None;
        let mut out_of_tolerance_since: Option<Instant> = None;

        loop {
            if self.stopped() {
                return false;
            }
            self.record_trace(run_start, trace);

            let Some((_, stdev)) = self.controller.pressure_history_stats() else {
                thread::sleep(self.timing.stability_poll);
                continue;
            };
            let Some(pressure) = self.controller.current_pressure() else {
                thread::sleep(self.timing.stability_poll);
                continue;
            };

            if stdev < stdev_gate {
                if (pressure - setpoint).abs() <= tolerance {
                    out_of_tolerance_since = None;
                    let since = *confirmed_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= self.timing.stability_confirm {
                        info!("pressure locked at {pressure:.3} Torr; proceeding to log");
                        return true;
                    }
                } else {
                    confirmed_since = None;
                    match out_of_tolerance_since {
                        None => {
                            info!(
                                "pressure stable at {pressure:.3} Torr but outside tolerance (±{tolerance:.4})"
                            );
                            out_of_tolerance_since = Some(Instant::now());
                        }
                        Some(since) if since.elapsed() >= self.timing.override_after => {
                            if prompt.accept_out_of_tolerance(setpoint, pressure, tolerance) {
                                info!("operator accepted out-of-tolerance reading");
                                return true;
                            }
                            out_of_tolerance_since = None;
                        }
                        Some(_) => {}
                    }
                }
            } else {
                confirmed_since = None;
                out_of_tolerance_since = None;
            }
            thread::sleep(self.timing.stability_poll);
        }
    }

    /// Freeze the outlet and accumulate averaged readings for the window.
    fn sample_window(
        &self,
        run_start: Instant,
        completed_channels: &BTreeSet<usize>,
        trace: &mut DebugTrace,
    ) -> (Vec<f64>, [Vec<f64>; 4]) {
        info!("starting data log; locking outlet valve");
        self.controller.set_hold_outlet(true);

        let mut standard_readings = Vec::new();
        let mut dut_readings: [Vec<f64>; 4] = Default::default();
        let window_start = Instant::now();
        while window_start.elapsed() < self.timing.sample_window && !self.stopped() {
            if let Some(pressure) = self.controller.current_pressure() {
                standard_readings.push(pressure);
            }
            for dut in &self.duts {
                if completed_channels.contains(&dut.channel) {
                    continue;
                }
                let volts = self.sampler.read(dut.channel);
                let torr = volts * self.divider_factor * (dut.full_scale_torr / 10.0);
                dut_readings[dut.channel].push(torr);
            }
            self.record_trace(run_start, trace);
            thread::sleep(self.timing.sample_period);
        }

        self.controller.set_hold_outlet(false);
        info!("data log complete; unlocking outlet valve");
        (standard_readings, dut_readings)
    }

    fn record_trace(&self, run_start: Instant, trace: &mut DebugTrace) {
        let (inlet, outlet) = self.controller.valve_positions();
        let mut dut_torr = [f64::NAN; 4];
        for dut in &self.duts {
            let volts = self.sampler.read(dut.channel);
            dut_torr[dut.channel] = volts * self.divider_factor * (dut.full_scale_torr / 10.0);
        }
        trace.push(TraceSample {
            elapsed_secs: run_start.elapsed().as_secs_f64(),
            standard_torr: self.controller.current_pressure().unwrap_or(f64::NAN),
            inlet_position: inlet.unwrap_or(f64::NAN),
            outlet_position: outlet.unwrap_or(f64::NAN),
            dut_torr,
        });
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
