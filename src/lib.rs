//! Presscal — automated multi-device pressure transducer calibration.
//!
//! A reference standard is held at a series of setpoints by a dual-valve
//! flow controller pumped by a turbo-molecular pump; up to four devices
//! under test are read in parallel against it and characterised for zero,
//! span, and linearity errors.
//!
//! The library exposes every subsystem for integration testing against
//! mock transports; the binary in `main.rs` wires them to real serial
//! ports and the DAQ server.

#![deny(unused_must_use)]

pub mod config;
pub mod control;
pub mod daq;
pub mod error;
pub mod events;
pub mod instrument;
pub mod sequence;
pub mod turbo;
