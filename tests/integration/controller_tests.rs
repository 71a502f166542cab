//! Pressure-controller integration tests against mock valve links.
//!
//! Loop periods are shrunk far below the operating values so each test
//! completes in well under a second of wall-clock per phase.

use std::thread;
use std::time::Duration;

use presscal::control::state::{AdaptiveSubstate, SetpointState};
use presscal::control::{ControllerTiming, EStop, PressureController};
use presscal::error::{ControlError, Error};

use crate::mock_links::MockValve;

fn fast_timing() -> ControllerTiming {
    ControllerTiming {
        poll_interval: Duration::from_millis(10),
        adaptive_interval: Duration::from_millis(30),
        settle_delay: Duration::from_millis(10),
        blind_window: Duration::ZERO,
        pump_down_timeout: Duration::from_millis(300),
        manual_override_cooldown: Duration::from_millis(250),
        ramp_step_delay: Duration::from_millis(5),
        ramp_hold: Duration::from_millis(10),
        close_delay: Duration::from_millis(5),
    }
}

/// Build a controller over mock links, with a plant that reads stable at
/// `process_percent` of full scale.
fn build(
    timing: ControllerTiming,
) -> (
    PressureController,
    std::sync::Arc<crate::mock_links::ValvePlant>,
    std::sync::Arc<crate::mock_links::ValvePlant>,
) {
    let (inlet, inlet_plant) = MockValve::new();
    let (outlet, outlet_plant) = MockValve::new();
    inlet_plant.set_position(90.0);
    outlet_plant.set_position(28.0);
    let controller = PressureController::new(
        Box::new(inlet),
        Box::new(outlet),
        100.0,
        timing,
        EStop::new(),
    );
    (controller, inlet_plant, outlet_plant)
}

#[test]
fn construction_selects_full_scale_range_on_both() {
    let (_controller, inlet, outlet) = build(fast_timing());
    assert!(inlet.has_command("E9"));
    assert!(outlet.has_command("E9"));
}

#[test]
fn vacuum_start_prepositions_outlet_and_engages_blind() {
    let timing = ControllerTiming {
        blind_window: Duration::from_secs(10),
        ..fast_timing()
    };
    let (controller, inlet, outlet) = build(timing);
    inlet.set_process_value(0.1);

    controller.set_pressure(50.0, None).unwrap();

    // From vacuum with no prediction, a mid-range setpoint starts at 28 %.
    assert!(outlet.has_command("S1 28.00"));
    assert!(outlet.has_command("D1"));
    // Inlet engaged at the setpoint's percent of full scale.
    assert!(inlet.has_command("S1 50.00"));
    assert_eq!(controller.setpoint_state(), SetpointState::Holding);
    assert_eq!(
        controller.adaptive_substate(),
        AdaptiveSubstate::BlindAfterTransition
    );
}

#[test]
fn prediction_overrides_first_guess() {
    let (controller, _inlet, outlet) = build(fast_timing());
    controller.set_pressure(50.0, Some(31.7)).unwrap();
    assert!(outlet.has_command("S1 31.70"));
    assert!(!outlet.has_command("S1 28.00"));
}

#[test]
fn stuck_high_correction_after_blind_expires() {
    let timing = ControllerTiming {
        blind_window: Duration::from_millis(400),
        ..fast_timing()
    };
    let (mut controller, inlet, outlet) = build(timing);
    // Stable 0.4 Torr above a 50 Torr setpoint.
    inlet.set_process_value(50.4);
    controller.start();

    controller.set_pressure(50.0, Some(28.0)).unwrap();
    // Inside the blind window nothing should move beyond the pre-position.
    thread::sleep(Duration::from_millis(250));
    assert_eq!(outlet.last_setpoint(), Some(28.0));

    // After the window, the stuck-high step lands: 28 + 0.5.
    thread::sleep(Duration::from_millis(600));
    assert_eq!(outlet.last_setpoint(), Some(28.5));
    controller.shutdown();
}

#[test]
fn hold_outlet_freezes_adaptive_writes() {
    let (mut controller, inlet, outlet) = build(fast_timing());
    inlet.set_process_value(50.4);
    controller.start();

    controller.set_pressure(50.0, Some(28.0)).unwrap();
    controller.set_hold_outlet(true);
    assert_eq!(controller.setpoint_state(), SetpointState::Measuring);

    let frozen_count = outlet.command_count();
    thread::sleep(Duration::from_millis(300));
    assert_eq!(
        outlet.command_count(),
        frozen_count,
        "no outlet writes may happen during a measurement window"
    );

    controller.set_hold_outlet(false);
    assert_eq!(controller.setpoint_state(), SetpointState::Holding);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(outlet.last_setpoint(), Some(28.5));
    controller.shutdown();
}

#[test]
fn pump_unreadiness_suspends_adaptive_action() {
    let (mut controller, inlet, outlet) = build(fast_timing());
    inlet.set_process_value(50.4);
    let pump_ready = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    controller.attach_pump_gate(std::sync::Arc::clone(&pump_ready));
    controller.start();
    controller.set_pressure(50.0, Some(28.0)).unwrap();

    thread::sleep(Duration::from_millis(300));
    assert_eq!(
        outlet.last_setpoint(),
        Some(28.0),
        "no corrections while the pump is not ready"
    );

    pump_ready.store(true, std::sync::atomic::Ordering::Relaxed);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(outlet.last_setpoint(), Some(28.5));
    controller.shutdown();
}

#[test]
fn e_stop_closes_both_valves_and_silences_commands() {
    let (mut controller, inlet, outlet) = build(fast_timing());
    inlet.set_process_value(50.4);
    controller.start();
    controller.set_pressure(50.0, Some(28.0)).unwrap();

    controller.trigger_e_stop();
    assert!(inlet.has_command("C"));
    assert!(outlet.has_command("C"));
    assert_eq!(controller.setpoint_state(), SetpointState::Halted);

    let inlet_count = inlet.command_count();
    let outlet_count = outlet.command_count();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(inlet.command_count(), inlet_count);
    assert_eq!(outlet.command_count(), outlet_count);

    // Setpoint commands are rejected until resume.
    assert!(matches!(
        controller.set_pressure(10.0, None),
        Err(Error::Control(ControlError::EmergencyStop))
    ));

    controller.resume();
    assert_eq!(controller.setpoint_state(), SetpointState::Idle);
    controller.set_pressure(10.0, None).unwrap();
    controller.shutdown();
}

#[test]
fn pump_down_ramps_outlet_when_near_full_scale() {
    let (controller, inlet, outlet) = build(fast_timing());
    inlet.set_process_value(80.0); // 80 Torr > 0.75 * FS
    inlet.set_position(100.0); // inlet confirms closed immediately
    controller.poll_now();

    controller.set_pressure(0.0, None).unwrap();

    assert!(inlet.has_command("C"));
    let commands = outlet.commands();
    let s1: Vec<&str> = commands
        .iter()
        .filter(|c| c.starts_with("S1 "))
        .map(String::as_str)
        .collect();
    // First stage 2 → 20 in ten steps, second stage 20.5 → 25, then open.
    assert_eq!(s1.first(), Some(&"S1 2.00"));
    assert!(s1.contains(&"S1 20.00"));
    assert!(s1.contains(&"S1 20.50"));
    assert!(s1.contains(&"S1 25.00"));
    assert_eq!(s1.last(), Some(&"S1 100.00"));
    assert_eq!(controller.setpoint_state(), SetpointState::VacuumHold);
}

#[test]
fn pump_down_skips_ramp_at_low_pressure() {
    let (controller, inlet, outlet) = build(fast_timing());
    inlet.set_process_value(5.0);
    inlet.set_position(100.0);
    controller.poll_now();

    controller.set_pressure(0.0, None).unwrap();

    let commands = outlet.commands();
    assert!(!commands.iter().any(|c| c == "S1 2.00"));
    assert!(commands.iter().any(|c| c == "S1 100.00"));
}

#[test]
fn pump_down_times_out_when_inlet_never_closes() {
    let (controller, inlet, _outlet) = build(fast_timing());
    inlet.set_position(50.0); // stuck partly open

    let result = controller.set_pressure(0.0, None);
    assert!(matches!(
        result,
        Err(Error::Control(ControlError::PumpDownTimeout))
    ));
    assert_eq!(controller.setpoint_state(), SetpointState::Idle);
}

#[test]
fn setpoint_above_full_scale_is_rejected() {
    let (controller, _inlet, _outlet) = build(fast_timing());
    assert!(matches!(
        controller.set_pressure(150.0, None),
        Err(Error::Control(ControlError::OutOfRange(_)))
    ));
    assert!(matches!(
        controller.set_pressure(-1.0, None),
        Err(Error::Control(ControlError::OutOfRange(_)))
    ));
}

#[test]
fn manual_bump_moves_outlet_and_pauses_adaptive() {
    let (mut controller, inlet, outlet) = build(fast_timing());
    inlet.set_process_value(50.4);
    controller.start();
    controller.set_pressure(50.0, Some(28.0)).unwrap();

    // Let the poller learn the outlet position before bumping.
    thread::sleep(Duration::from_millis(50));
    controller.bump_outlet(2.0);
    assert!(outlet.has_command("S1 30.00"));

    // The override cooldown keeps the stuck-high step away for a while.
    thread::sleep(Duration::from_millis(150));
    assert_eq!(outlet.last_setpoint(), Some(30.0));

    // After the cooldown the adaptive loop resumes.
    thread::sleep(Duration::from_millis(400));
    assert_eq!(outlet.last_setpoint(), Some(28.5));
    controller.shutdown();
}

#[test]
fn manual_bump_respects_measurement_hold() {
    let (mut controller, inlet, outlet) = build(fast_timing());
    inlet.set_process_value(50.0);
    controller.start();
    controller.set_pressure(50.0, Some(28.0)).unwrap();
    thread::sleep(Duration::from_millis(50));

    controller.set_hold_outlet(true);
    let count = outlet.command_count();
    controller.bump_outlet(2.0);
    assert_eq!(outlet.command_count(), count, "bump must be ignored while held");
    controller.shutdown();
}

#[test]
fn inlet_bump_uses_manual_position_setpoint() {
    let (mut controller, inlet, _outlet) = build(fast_timing());
    controller.start();
    thread::sleep(Duration::from_millis(50));

    controller.bump_inlet(-2.0);
    assert!(inlet.has_command("S5 88.00"));
    assert!(inlet.has_command("D5"));
    controller.shutdown();
}
