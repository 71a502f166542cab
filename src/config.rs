//! System configuration parameters.
//!
//! All tunable parameters for a calibration session. Loaded from an
//! operator-provided JSON file at startup and validated before any
//! instrument is opened; immutable for the rest of the session.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One device under test, occupying a DAQ channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DutConfig {
    /// DAQ channel index (0–3).
    pub channel: usize,
    /// Full-scale pressure of the device (Torr).
    pub full_scale_torr: f64,
}

/// Core system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    // --- Reference standard ---
    /// Full-scale pressure of the standard (Torr).
    pub standard_fs_torr: f64,

    // --- Instrument endpoints ---
    /// Serial port of the inlet valve controller.
    pub inlet_port: String,
    /// Serial port of the outlet valve controller.
    pub outlet_port: String,
    /// Serial port of the turbo pump controller.
    pub turbo_port: String,

    // --- DAQ ---
    /// Host of the DAQ server.
    pub daq_host: String,
    /// TCP port of the DAQ server.
    pub daq_port: u16,
    /// Multiplexer channel routed to the reference standard (1–3).
    pub daq_standard_channel: u8,
    /// Voltage-divider compensation applied to raw DAQ voltages.
    pub divider_factor: f64,

    // --- Devices under test ---
    pub duts: Vec<DutConfig>,

    // --- Timing ---
    /// Pressure/valve-position poll interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Adaptive outlet loop interval (milliseconds).
    pub adaptive_interval_ms: u64,
    /// Turbo status poll interval (milliseconds).
    pub turbo_poll_interval_ms: u64,
    /// DAQ sample interval (milliseconds).
    pub daq_poll_interval_ms: u64,

    // --- Output ---
    /// Directory for the result table, debug trace, and analysis reports.
    pub output_dir: String,
    /// Path of the learned outlet-position store.
    pub learned_positions_file: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            // Standard
            standard_fs_torr: 100.0,

            // Endpoints
            inlet_port: "/dev/ttyUSB0".to_string(),
            outlet_port: "/dev/ttyUSB1".to_string(),
            turbo_port: "/dev/ttyUSB2".to_string(),

            // DAQ
            daq_host: "127.0.0.1".to_string(),
            daq_port: 65432,
            daq_standard_channel: 1,
            divider_factor: 4.9,

            // DUTs
            duts: Vec::new(),

            // Timing
            poll_interval_ms: 200,     // 5 Hz
            adaptive_interval_ms: 3000, // 0.33 Hz
            turbo_poll_interval_ms: 500, // 2 Hz
            daq_poll_interval_ms: 100, // 10 Hz

            // Output
            output_dir: "Analysis".to_string(),
            learned_positions_file: "learned_positions.json".to_string(),
        }
    }
}

impl SystemConfig {
    /// Load configuration from a JSON file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|_| Error::Config("config file unreadable"))?;
        let config: Self =
            serde_json::from_str(&text).map_err(|_| Error::Config("config file malformed"))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid values rather than silently clamping them. A bad DUT
    /// channel or a non-positive full scale must never reach the control
    /// loops.
    pub fn validate(&self) -> Result<()> {
        if self.standard_fs_torr <= 0.0 {
            return Err(Error::Config("standard full scale must be positive"));
        }
        if self.divider_factor <= 0.0 {
            return Err(Error::Config("divider factor must be positive"));
        }
        if self.duts.len() > 4 {
            return Err(Error::Config("at most 4 DUTs are supported"));
        }
        for dut in &self.duts {
            if dut.channel > 3 {
                return Err(Error::Config("DUT channel must be 0-3"));
            }
            if dut.full_scale_torr <= 0.0 {
                return Err(Error::Config("DUT full scale must be positive"));
            }
        }
        let mut channels: Vec<usize> = self.duts.iter().map(|d| d.channel).collect();
        channels.sort_unstable();
        channels.dedup();
        if channels.len() != self.duts.len() {
            return Err(Error::Config("duplicate DUT channel"));
        }
        if !(1..=3).contains(&self.daq_standard_channel) {
            return Err(Error::Config("DAQ standard channel must be 1-3"));
        }
        Ok(())
    }
}
