//! Run artifacts: the calibration result table and the debug trace.
//!
//! Both are plain tabular files. The result table is the contract with the
//! downstream certificate tooling; the debug trace captures every sample
//! of the run for after-the-fact tuning work.

use std::fs;
use std::io::Write;
use std::path::Path;

use log::info;

/// One logged setpoint: averaged standard and per-device pressures.
/// Missing device readings are `NaN`.
#[derive(Debug, Clone, Copy)]
pub struct ResultRow {
    pub setpoint_torr: f64,
    pub standard_torr: f64,
    pub dut_torr: [f64; 4],
}

/// The calibration result table, one row per logged setpoint.
#[derive(Debug, Clone)]
pub struct ResultTable {
    /// Channels that were active this run, in column order.
    channels: Vec<usize>,
    rows: Vec<ResultRow>,
}

impl ResultTable {
    pub fn new(channels: Vec<usize>) -> Self {
        Self {
            channels,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: ResultRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    /// Valid (standard, device) pairs for one channel, NaN rows dropped.
    pub fn pairs_for(&self, channel: usize) -> Vec<(f64, f64)> {
        self.rows
            .iter()
            .filter_map(|row| {
                let dut = row.dut_torr[channel];
                (!dut.is_nan() && !row.standard_torr.is_nan()).then_some((row.standard_torr, dut))
            })
            .collect()
    }

    /// Write the table as CSV with the agreed column names.
    pub fn write_csv(&self, path: &Path) -> std::io::Result<()> {
        let mut file = fs::File::create(path)?;
        write!(file, "Setpoint_Torr,Standard_Pressure_Torr")?;
        for channel in &self.channels {
            write!(file, ",Device_{}_Pressure_Torr", channel + 1)?;
        }
        writeln!(file)?;
        for row in &self.rows {
            write!(file, "{},{}", row.setpoint_torr, row.standard_torr)?;
            for channel in &self.channels {
                write!(file, ",{}", row.dut_torr[*channel])?;
            }
            writeln!(file)?;
        }
        info!("result table written to {}", path.display());
        Ok(())
    }
}

/// One debug-trace sample.
#[derive(Debug, Clone, Copy)]
pub struct TraceSample {
    pub elapsed_secs: f64,
    pub standard_torr: f64,
    pub inlet_position: f64,
    pub outlet_position: f64,
    pub dut_torr: [f64; 4],
}

/// Full-run per-sample trace of pressure and valve positions.
#[derive(Debug, Default)]
pub struct DebugTrace {
    samples: Vec<TraceSample>,
}

impl DebugTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: TraceSample) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn write_csv(&self, path: &Path) -> std::io::Result<()> {
        let mut file = fs::File::create(path)?;
        writeln!(
            file,
            "Time_s,Standard_Pressure_Torr,Inlet_Position_pct,Outlet_Position_pct,\
             Device_1_Pressure_Torr,Device_2_Pressure_Torr,Device_3_Pressure_Torr,\
             Device_4_Pressure_Torr"
        )?;
        for s in &self.samples {
            writeln!(
                file,
                "{:.2},{},{},{},{},{},{},{}",
                s.elapsed_secs,
                s.standard_torr,
                s.inlet_position,
                s.outlet_position,
                s.dut_torr[0],
                s.dut_torr[1],
                s.dut_torr[2],
                s.dut_torr[3],
            )?;
        }
        info!("debug trace written to {}", path.display());
        Ok(())
    }
}
