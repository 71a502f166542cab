//! Turbo-molecular pump monitor.
//!
//! Polls the pump controller's status frame every 500 ms and exposes a
//! stable ready / standby / decelerating / fault view to the rest of the
//! platform. Commands are framed as `#000<CMD>\r`; the status reply is a
//! comma-separated record whose fields of interest are the status bit
//! string, the fault bit string, the rotor RPM, and the pump and
//! controller temperatures.
//!
//! Flags are derived fresh on every poll — nothing latches except the
//! RPM-drop warning, which is set on a sudden large drop and cleared once
//! the speed recovers.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info, warn};
use serialport::SerialPort;

/// RPM at which the controller holds the rotor in standby.
pub const STANDBY_RPM_THRESHOLD: u32 = 12_000;

/// RPM at which the controller holds the rotor at nominal speed.
pub const NOMINAL_RPM_THRESHOLD: u32 = 27_000;

/// A sudden drop larger than this (from above 20 kRPM) latches the warning.
const RPM_DROP_LATCH: u32 = 4_500;

/// The warning clears once the per-poll drop falls below this.
const RPM_DROP_CLEAR: u32 = 1_000;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Decoded pump status, recomputed each poll.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TurboStatus {
    pub is_on: bool,
    pub at_speed: bool,
    pub standby: bool,
    pub accelerating: bool,
    pub decelerating: bool,
    pub fault: bool,
    /// Latched: sudden large RPM drop observed, rotor under stress.
    pub rpm_warning: bool,
    pub rpm: u32,
    pub pump_temp_c: i32,
    pub controller_temp_c: i32,
}

impl TurboStatus {
    /// Ready for pressure control: at speed and not parked in standby.
    pub fn is_ready(&self) -> bool {
        self.at_speed && !self.standby
    }
}

/// High-level pump commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurboCommand {
    Start,
    Stop,
    Standby,
    NominalSpeed,
}

impl TurboCommand {
    fn wire(self) -> &'static str {
        match self {
            Self::Start => "TMPON",
            Self::Stop => "TMPOFF",
            Self::Standby => "SBY",
            Self::NominalSpeed => "NSP",
        }
    }
}

/// Outcome of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    Canceled,
    EmergencyStop,
}

// ---------------------------------------------------------------------------
// Frame decoding (pure — exercised directly by tests)
// ---------------------------------------------------------------------------

/// Decode one status frame against the previous status. Returns `None` when
/// the frame is too short or a numeric field is malformed.
pub fn decode_status(frame: &str, prev: &TurboStatus) -> Option<TurboStatus> {
    let parts: Vec<&str> = frame.split(',').collect();
    if parts.len() < 9 {
        return None;
    }
    let status_bits = parts[1].as_bytes();
    if status_bits.len() < 5 {
        return None;
    }
    let fault_bits = parts[2];

    let is_on = status_bits[2] == b'1';
    let speed_reached = status_bits[3] == b'1';
    let standby_selected = status_bits[4] == b'1';

    let rpm: u32 = parts[4].trim().parse().ok()?;
    let pump_temp_c: i32 = parts[7].trim().parse().ok()?;
    let controller_temp_c: i32 = parts[8].trim().parse().ok()?;

    let mut accelerating = false;
    let mut at_speed = false;
    let mut decelerating = false;
    if is_on {
        // Standby selected while the rotor is still above the standby band
        // means it is spinning down towards it.
        let standby_band = f64::from(STANDBY_RPM_THRESHOLD) * 1.015;
        if standby_selected && f64::from(rpm) > standby_band {
            decelerating = true;
        } else if speed_reached {
            at_speed = true;
        } else {
            accelerating = true;
        }
    }

    // RPM-drop warning: latch on a sudden large drop, clear on recovery.
    let drop = prev.rpm.saturating_sub(rpm);
    let rpm_warning = if prev.rpm > 20_000 && drop > RPM_DROP_LATCH {
        true
    } else if prev.rpm_warning && drop < RPM_DROP_CLEAR {
        false
    } else {
        prev.rpm_warning
    };

    Some(TurboStatus {
        is_on,
        at_speed,
        standby: standby_selected,
        accelerating,
        decelerating,
        fault: fault_bits.contains('1'),
        rpm_warning,
        rpm,
        pump_temp_c,
        controller_temp_c,
    })
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// One framed request/response exchange with the pump controller.
pub trait TurboLink: Send {
    fn exchange(&mut self, cmd: &str) -> Option<String>;
}

/// Serial adapter for the pump controller.
pub struct SerialTurbo {
    port: Box<dyn SerialPort>,
}

impl SerialTurbo {
    pub fn open(path: &str) -> Result<Self, serialport::Error> {
        let port = serialport::new(path, crate::instrument::BAUD_RATE)
            .timeout(crate::instrument::LINK_TIMEOUT)
            .open()?;
        Ok(Self { port })
    }
}

impl TurboLink for SerialTurbo {
    fn exchange(&mut self, cmd: &str) -> Option<String> {
        let _ = self.port.clear(serialport::ClearBuffer::Input);
        let frame = format!("#000{cmd}\r");
        self.port.write_all(frame.as_bytes()).ok()?;
        self.port.flush().ok()?;

        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(n) if n > 0 => {
                    if byte[0] == b'\r' || byte[0] == b'\n' {
                        if reply.is_empty() {
                            continue;
                        }
                        return Some(String::from_utf8_lossy(&reply).trim().to_string());
                    }
                    reply.push(byte[0]);
                }
                _ => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

struct MonitorShared {
    link: Mutex<Box<dyn TurboLink>>,
    status: Mutex<TurboStatus>,
    /// At speed, out of standby, and not under RPM stress. Shared with the
    /// pressure controller, which suspends outlet corrections while the
    /// pump is not ready.
    ready: Arc<AtomicBool>,
    connected: AtomicBool,
    stop: AtomicBool,
}

/// Background status poller plus the command surface of the pump.
pub struct TurboMonitor {
    shared: Arc<MonitorShared>,
    poll_interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl TurboMonitor {
    pub fn new(link: Box<dyn TurboLink>, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                link: Mutex::new(link),
                status: Mutex::new(TurboStatus::default()),
                ready: Arc::new(AtomicBool::new(false)),
                connected: AtomicBool::new(true),
                stop: AtomicBool::new(false),
            }),
            poll_interval,
            handle: None,
        }
    }

    /// Start the background polling thread.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let interval = self.poll_interval;
        self.handle = Some(
            thread::Builder::new()
                .name("turbo-poll".to_string())
                .spawn(move || poll_loop(&shared, interval))
                .expect("spawn turbo poller"),
        );
    }

    /// Latest decoded status (copy).
    pub fn status(&self) -> TurboStatus {
        *self.shared.status.lock().expect("turbo status lock poisoned")
    }

    /// Whether the link is still answering.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    /// Live readiness flag, maintained by the poller: at speed, out of
    /// standby, and no RPM warning latched. Hand this to the pressure
    /// controller so it holds the outlet while the pump is not ready.
    pub fn ready_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shared.ready)
    }

    /// Fire-and-forget pump command.
    pub fn send(&self, command: TurboCommand) {
        let mut link = self.shared.link.lock().expect("turbo link lock poisoned");
        info!("turbo command: {}", command.wire());
        let _ = link.exchange(command.wire());
    }

    /// Block until the pump is at speed and out of standby, re-issuing the
    /// nominal-speed command as needed. `cancel` aborts with `Canceled`;
    /// `e_stop` aborts with `EmergencyStop`.
    pub fn wait_ready(
        &self,
        operation: &str,
        cancel: &AtomicBool,
        e_stop: &AtomicBool,
    ) -> WaitOutcome {
        let flags = self.status();
        if flags.is_ready() {
            return WaitOutcome::Ready;
        }
        info!("waiting for turbo pump to be ready for {operation}");

        if !flags.is_on {
            info!("pump is off, sending start command");
            self.send(TurboCommand::Start);
            thread::sleep(Duration::from_secs(1));
        }
        self.send(TurboCommand::NominalSpeed);

        loop {
            if e_stop.load(Ordering::Relaxed) {
                return WaitOutcome::EmergencyStop;
            }
            if cancel.load(Ordering::Relaxed) {
                info!("{operation} canceled while waiting for turbo");
                return WaitOutcome::Canceled;
            }
            if self.status().is_ready() {
                info!("turbo pump ready, starting {operation}");
                return WaitOutcome::Ready;
            }
            thread::sleep(Duration::from_secs(2));
        }
    }

    /// Stop the polling thread and release the link.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TurboMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_loop(shared: &MonitorShared, interval: Duration) {
    let mut misses: u32 = 0;
    while !shared.stop.load(Ordering::Relaxed) {
        let reply = {
            let mut link = shared.link.lock().expect("turbo link lock poisoned");
            link.exchange("STA")
        };
        match reply {
            Some(frame) => {
                misses = 0;
                shared.connected.store(true, Ordering::Relaxed);
                let mut status = shared.status.lock().expect("turbo status lock poisoned");
                if let Some(next) = decode_status(&frame, &status) {
                    if next.rpm_warning && !status.rpm_warning {
                        warn!(
                            "turbo warning: sudden RPM drop of {} detected, pump under stress",
                            status.rpm.saturating_sub(next.rpm)
                        );
                    } else if !next.rpm_warning && status.rpm_warning {
                        info!("turbo RPM recovered, resuming normal outlet control");
                    }
                    shared
                        .ready
                        .store(next.is_ready() && !next.rpm_warning, Ordering::Relaxed);
                    *status = next;
                } else {
                    // Malformed frame: keep the flags, zero the readings.
                    status.rpm = 0;
                    status.pump_temp_c = 0;
                }
            }
            None => {
                misses += 1;
                if misses == 5 {
                    error!("turbo link not answering, reporting disconnected");
                    shared.connected.store(false, Ordering::Relaxed);
                }
            }
        }
        thread::sleep(interval);
    }
}
