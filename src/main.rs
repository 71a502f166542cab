//! Presscal — calibration run entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  SerialValve ×2     SerialTurbo      DaqReader    ConsolePrompt│
//! │  (valve links)      (pump link)      (DUT volts)  (operator)   │
//! │                                                                │
//! │  ──────────────── Port trait boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │  PressureController · TurboMonitor · Sequencer         │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{info, warn};

use presscal::config::SystemConfig;
use presscal::control::{ControllerTiming, EStop, PressureController};
use presscal::daq::{DaqReader, GainRange};
use presscal::events::{ConsolePrompt, LogEventSink};
use presscal::instrument::SerialValve;
use presscal::sequence::store::LearnedStore;
use presscal::sequence::{CalibrationSequencer, SequencerTiming};
use presscal::turbo::{SerialTurbo, TurboCommand, TurboMonitor, WaitOutcome};

/// Automated multi-device pressure transducer calibration platform.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to the system configuration file.
    #[arg(long, default_value = "presscal.json")]
    config: PathBuf,

    /// Skip the turbo readiness gate (bench work without a pump).
    #[arg(long)]
    no_turbo_wait: bool,
}

/// Signal-conditioner gain for the standard's full scale.
fn gain_for_full_scale(full_scale_torr: f64) -> GainRange {
    if full_scale_torr >= 100.0 {
        GainRange::X1
    } else if full_scale_torr >= 10.0 {
        GainRange::X0_1
    } else {
        GainRange::X0_01
    }
}

fn main() -> Result<()> {
    // ── 1. Bootstrap ──────────────────────────────────────────
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    info!("presscal v{}", env!("CARGO_PKG_VERSION"));

    // ── 2. Configuration ──────────────────────────────────────
    let config = SystemConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if config.duts.is_empty() {
        bail!("no DUTs configured; nothing to calibrate");
    }
    info!(
        "standard {} Torr FS, {} DUT(s) active",
        config.standard_fs_torr,
        config.duts.len()
    );

    // ── 3. Instrument links ───────────────────────────────────
    let inlet = SerialValve::open(&config.inlet_port)
        .with_context(|| format!("opening inlet controller on {}", config.inlet_port))?;
    let outlet = SerialValve::open(&config.outlet_port)
        .with_context(|| format!("opening outlet controller on {}", config.outlet_port))?;
    let turbo_link = SerialTurbo::open(&config.turbo_port)
        .with_context(|| format!("opening turbo controller on {}", config.turbo_port))?;
    let mut daq = DaqReader::connect(&config.daq_host, config.daq_port).with_context(|| {
        format!("connecting to DAQ at {}:{}", config.daq_host, config.daq_port)
    })?;
    info!(
        "connected to controllers on {} & {}, turbo on {}",
        config.inlet_port, config.outlet_port, config.turbo_port
    );

    daq.select_channel(config.daq_standard_channel);
    daq.set_range(gain_for_full_scale(config.standard_fs_torr));

    // ── 4. Component construction ─────────────────────────────
    let e_stop = EStop::new();
    let timing = ControllerTiming {
        poll_interval: Duration::from_millis(config.poll_interval_ms),
        adaptive_interval: Duration::from_millis(config.adaptive_interval_ms),
        ..ControllerTiming::default()
    };
    let mut controller = PressureController::new(
        Box::new(inlet),
        Box::new(outlet),
        config.standard_fs_torr,
        timing,
        e_stop.clone(),
    );
    controller.start();

    let mut turbo = TurboMonitor::new(
        Box::new(turbo_link),
        Duration::from_millis(config.turbo_poll_interval_ms),
    );
    turbo.start();

    let mut store = LearnedStore::load(
        std::path::Path::new(&config.learned_positions_file),
        config.standard_fs_torr,
    );

    // Give the first turbo poll a chance to land, then make sure the pump
    // is coming up to nominal speed.
    std::thread::sleep(Duration::from_millis(1200));
    let flags = turbo.status();
    if !flags.is_on {
        info!("turbo pump is off; sending start command");
        turbo.send(TurboCommand::Start);
    } else if flags.standby {
        info!("turbo in standby; setting nominal speed");
        turbo.send(TurboCommand::NominalSpeed);
    }

    // ── 5. Turbo readiness gate ───────────────────────────────
    let cancel = Arc::new(AtomicBool::new(false));
    if args.no_turbo_wait {
        warn!("turbo readiness gate skipped by request");
    } else {
        controller.attach_pump_gate(turbo.ready_handle());
        match turbo.wait_ready("auto calibration", &cancel, e_stop.as_atomic()) {
            WaitOutcome::Ready => {}
            WaitOutcome::Canceled => bail!("turbo wait canceled"),
            WaitOutcome::EmergencyStop => bail!("emergency stop during turbo wait"),
        }
    }

    // ── 6. Calibration run ────────────────────────────────────
    let mut sink = LogEventSink;
    let mut prompt = ConsolePrompt;
    let output = {
        let mut sequencer = CalibrationSequencer::new(
            &controller,
            &daq,
            &mut store,
            config.duts.clone(),
            config.divider_factor,
            SequencerTiming::default(),
            Arc::clone(&cancel),
            e_stop.clone(),
        );
        sequencer.run(&mut sink, &mut prompt)
    };

    // ── 7. Artifacts ──────────────────────────────────────────
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating output directory {}", config.output_dir))?;
    let output_dir = PathBuf::from(&config.output_dir);
    output
        .table
        .write_csv(&output_dir.join("calibration_results.csv"))
        .context("writing result table")?;
    output
        .trace
        .write_csv(&output_dir.join("debug_trace.csv"))
        .context("writing debug trace")?;
    if let Err(e) = store.save() {
        warn!("could not save learned positions: {e}");
    }

    if !output.completed {
        warn!("run ended early; artifacts contain the partial data");
    }

    // ── 8. Shutdown ───────────────────────────────────────────
    daq.close();
    turbo.shutdown();
    controller.shutdown();
    info!("shutdown complete");
    Ok(())
}
