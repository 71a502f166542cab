//! Serial transport to the inlet and outlet valve controllers.
//!
//! Line-oriented ASCII protocol at 9600 8N1. Every command is terminated
//! with a carriage return; replies are read until a carriage return. A
//! blank reply (bare CR) is valid. Numeric replies are extracted with a
//! scan for the first signed decimal, since the controllers pad replies
//! with unit text and whitespace.
//!
//! Command set used by the platform:
//!
//! | Code    | Direction | Effect                                    |
//! |---------|-----------|-------------------------------------------|
//! | `C`     | write     | Command valve closed.                     |
//! | `R5`    | query     | Read process value (percent of FS).       |
//! | `R6`    | query     | Read current valve output (percent).      |
//! | `S1 v`  | write     | Load pressure setpoint with `v` percent.  |
//! | `D1`    | write     | Activate pressure setpoint.               |
//! | `S5 v`  | write     | Load position setpoint with `v` percent.  |
//! | `D5`    | write     | Activate position setpoint.               |
//! | `En`    | write     | Select full-scale range code `n`.         |

use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};
use serialport::SerialPort;

use crate::error::TransportError;

/// Baud rate of both valve controllers.
pub const BAUD_RATE: u32 = 9600;

/// Serial timeout in each direction.
pub const LINK_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Port trait — the boundary between control logic and the wire
// ---------------------------------------------------------------------------

/// One request/response serial link. Implementations are not required to be
/// thread-safe; [`Endpoint`] serialises access with its own lock.
pub trait ValveLink: Send {
    /// Fire-and-forget command write.
    fn write(&mut self, cmd: &str) -> Result<(), TransportError>;

    /// Write a command, then read the reply up to the terminating CR.
    /// `None` on timeout or port error.
    fn query(&mut self, cmd: &str) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Serial adapter
// ---------------------------------------------------------------------------

/// A real serial link to one valve controller.
pub struct SerialValve {
    port: Box<dyn SerialPort>,
}

impl SerialValve {
    /// Open the given serial port at the controller's fixed settings.
    pub fn open(path: &str) -> Result<Self, serialport::Error> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(LINK_TIMEOUT)
            .open()?;
        Ok(Self { port })
    }

    /// Read bytes until a carriage return or timeout. Replies never use a
    /// newline terminator, and an empty reply is valid.
    fn read_until_cr(&mut self) -> Option<String> {
        let mut reply = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => return None,
                Ok(_) => {
                    if byte[0] == b'\r' {
                        return Some(String::from_utf8_lossy(&reply).trim().to_string());
                    }
                    reply.push(byte[0]);
                }
                Err(_) => return None,
            }
        }
    }
}

impl ValveLink for SerialValve {
    fn write(&mut self, cmd: &str) -> Result<(), TransportError> {
        let frame = format!("{cmd}\r");
        self.port
            .write_all(frame.as_bytes())
            .map_err(|_| TransportError::WriteTimeout)?;
        self.port.flush().map_err(|_| TransportError::WriteTimeout)
    }

    fn query(&mut self, cmd: &str) -> Option<String> {
        // Stale bytes from a previous timed-out exchange would otherwise be
        // matched to this request.
        let _ = self.port.clear(serialport::ClearBuffer::Input);
        self.write(cmd).ok()?;
        self.read_until_cr()
    }
}

// ---------------------------------------------------------------------------
// Endpoint — one controller, serialised access
// ---------------------------------------------------------------------------

/// A valve-controller endpoint with per-link locking. Concurrent calls from
/// the polling loop and the control loop are serialised here; a timeout on
/// either direction is logged and recoverable.
pub struct Endpoint {
    name: &'static str,
    link: Mutex<Box<dyn ValveLink>>,
}

impl Endpoint {
    pub fn new(name: &'static str, link: Box<dyn ValveLink>) -> Self {
        Self {
            name,
            link: Mutex::new(link),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fire-and-forget write; failures are logged, never fatal.
    pub fn write(&self, cmd: &str) {
        let mut link = self.link.lock().expect("valve link lock poisoned");
        if let Err(e) = link.write(cmd) {
            warn!("{} write '{}' failed: {}", self.name, cmd, e);
        }
    }

    /// Query and return the raw reply text.
    pub fn query(&self, cmd: &str) -> Option<String> {
        let mut link = self.link.lock().expect("valve link lock poisoned");
        let reply = link.query(cmd);
        if reply.is_none() {
            warn!("{} query '{}' timed out", self.name, cmd);
        }
        reply
    }

    /// Query and scan the reply for its first signed decimal.
    pub fn query_value(&self, cmd: &str) -> Option<f64> {
        let reply = self.query(cmd)?;
        let value = parse_number(&reply);
        if value.is_none() {
            warn!("{} reply '{}' had no numeric field", self.name, reply);
        }
        value
    }

    /// Command the valve closed.
    pub fn command_close(&self) {
        self.write("C");
    }

    /// Load and activate setpoint A (`S1`/`D1`) — the controller's working
    /// setpoint, in percent.
    pub fn apply_setpoint(&self, percent: f64) {
        self.write(&format!("S1 {percent:.2}"));
        self.write("D1");
    }

    /// Load and activate setpoint E (`S5`/`D5`) — the manual position
    /// setpoint. Distinct from setpoint A: this drives the valve to a
    /// position, bypassing the controller's own pressure loop.
    pub fn apply_manual_position(&self, percent: f64) {
        self.write(&format!("S5 {percent:.2}"));
        self.write("D5");
    }

    /// Read the process value as a percent of full scale.
    pub fn read_process_value(&self) -> Option<f64> {
        self.query_value("R5")
    }

    /// Read the current valve output percent.
    pub fn read_valve_position(&self) -> Option<f64> {
        self.query_value("R6")
    }
}

// ---------------------------------------------------------------------------
// Full-scale range selection
// ---------------------------------------------------------------------------

/// Map a full-scale pressure to the controller's discrete range code.
pub fn range_code(full_scale_torr: f64) -> Option<&'static str> {
    const TABLE: [(f64, &str); 5] = [
        (0.1, "E0"),
        (1.0, "E3"),
        (10.0, "E6"),
        (100.0, "E9"),
        (1000.0, "E12"),
    ];
    TABLE
        .iter()
        .find(|(fs, _)| (full_scale_torr - fs).abs() < 1e-9)
        .map(|(_, code)| *code)
}

/// One-time hardware initialisation: select the full-scale range on both
/// controllers. An unrecognised full scale is logged but not fatal — the
/// controllers keep their previous range.
pub fn init_full_scale(inlet: &Endpoint, outlet: &Endpoint, full_scale_torr: f64) {
    match range_code(full_scale_torr) {
        Some(code) => {
            inlet.write(code);
            outlet.write(code);
            info!("range code {code} selected for {full_scale_torr} Torr full scale");
        }
        None => warn!("no range code for {full_scale_torr} Torr full scale; range unchanged"),
    }
}

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

/// Scan `text` for its first signed decimal number.
pub fn parse_number(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let mut start = None;
    for (i, &b) in bytes.iter().enumerate() {
        if b.is_ascii_digit() || ((b == b'+' || b == b'-') && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            start = Some(i);
            break;
        }
    }
    let start = start?;
    let mut end = start;
    let mut seen_dot = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        match b {
            b'0'..=b'9' => end = i + 1,
            b'+' | b'-' if i == start => end = i + 1,
            b'.' if !seen_dot => {
                seen_dot = true;
                end = i + 1;
            }
            _ => break,
        }
    }
    text[start..end].parse().ok()
}
