//! Outbound run events and operator interaction ports.
//!
//! The sequencer emits structured [`RunEvent`]s through the [`EventSink`]
//! port. Adapters on the other side decide what to do with them — write to
//! the terminal log, feed an operator GUI, or hand a passing device to the
//! certificate generator. The [`OperatorPrompt`] port covers the one
//! decision the platform cannot make alone: accepting a stable but
//! out-of-tolerance pressure point.

use log::{info, warn};

/// Structured events emitted during a calibration run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A new setpoint is being commanded.
    SetpointStarted { setpoint_torr: f64 },

    /// A setpoint was logged with its averaged readings.
    SetpointLogged {
        setpoint_torr: f64,
        standard_torr: f64,
        elapsed_secs: f64,
    },

    /// A DUT reading deviated from the standard beyond its tolerance.
    OutOfTolerance { channel: usize, error_torr: f64 },

    /// A DUT has passed the top of its range; its readings are done.
    DutRangeComplete { channel: usize },

    /// A DUT passed analysis; an external collaborator should generate its
    /// certificate.
    CertificateReady { channel: usize },

    /// Post-run diagnosis for one DUT.
    DiagnosisReady {
        channel: usize,
        passed: bool,
        report: String,
    },

    /// The run ended (normally or early) with this many logged rows.
    RunFinished { rows: usize },
}

/// Where run events go. Adapters decide the transport.
pub trait EventSink {
    fn emit(&mut self, event: &RunEvent);
}

/// Default sink: forward everything to the process log.
#[derive(Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&mut self, event: &RunEvent) {
        match event {
            RunEvent::SetpointStarted { setpoint_torr } => {
                info!("--- setting {setpoint_torr} Torr ---");
            }
            RunEvent::SetpointLogged {
                setpoint_torr,
                standard_torr,
                elapsed_secs,
            } => {
                info!(
                    "logged setpoint {setpoint_torr:.2} Torr | standard (avg) {standard_torr:.3} Torr ({elapsed_secs:.1}s)"
                );
            }
            RunEvent::OutOfTolerance {
                channel,
                error_torr,
            } => {
                warn!(
                    "device {} outside tolerance, error {:+.4} Torr",
                    channel + 1,
                    error_torr
                );
            }
            RunEvent::DutRangeComplete { channel } => {
                info!("device {} range completed", channel + 1);
            }
            RunEvent::CertificateReady { channel } => {
                info!("device {} passed; certificate generation requested", channel + 1);
            }
            RunEvent::DiagnosisReady {
                channel,
                passed,
                report,
            } => {
                if *passed {
                    info!("device {} diagnosis:\n{report}", channel + 1);
                } else {
                    warn!("device {} diagnosis:\n{report}", channel + 1);
                }
            }
            RunEvent::RunFinished { rows } => {
                info!("calibration run finished with {rows} logged setpoints");
            }
        }
    }
}

/// Operator decisions surfaced by the sequencer.
pub trait OperatorPrompt {
    /// The pressure has been stable but outside tolerance for the waiting
    /// period. `true` accepts the reading; `false` keeps waiting.
    fn accept_out_of_tolerance(
        &mut self,
        setpoint_torr: f64,
        pressure_torr: f64,
        tolerance_torr: f64,
    ) -> bool;
}

/// Console prompt for headless operation: asks on stdin.
#[derive(Default)]
pub struct ConsolePrompt;

impl OperatorPrompt for ConsolePrompt {
    fn accept_out_of_tolerance(
        &mut self,
        setpoint_torr: f64,
        pressure_torr: f64,
        tolerance_torr: f64,
    ) -> bool {
        println!(
            "Pressure stable at {pressure_torr:.4} Torr but outside tolerance \
             (setpoint {setpoint_torr:.3} ± {tolerance_torr:.4}). Accept this reading? [y/N]"
        );
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}
