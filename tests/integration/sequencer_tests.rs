//! Calibration-sequencer integration tests against scripted ports.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use presscal::config::DutConfig;
use presscal::events::RunEvent;
use presscal::sequence::store::LearnedStore;
use presscal::sequence::{CalibrationSequencer, SequencerTiming};

use crate::mock_links::{CollectingSink, LinkedSampler, ScriptedControl, ScriptedPrompt, run_flags};

const DIVIDER: f64 = 4.9;

fn fast_timing() -> SequencerTiming {
    SequencerTiming {
        stability_poll: Duration::from_millis(1),
        stability_confirm: Duration::from_millis(5),
        override_after: Duration::from_millis(50),
        sample_window: Duration::from_millis(20),
        sample_period: Duration::from_millis(5),
    }
}

fn dut(channel: usize, fs: f64) -> DutConfig {
    DutConfig {
        channel,
        full_scale_torr: fs,
    }
}

fn fresh_store(name: &str, full_scale: f64) -> LearnedStore {
    let path = std::env::temp_dir().join(format!("presscal-seq-{name}.json"));
    let _ = std::fs::remove_file(&path);
    LearnedStore::load(&path, full_scale)
}

#[test]
fn perfect_dut_walks_all_setpoints_and_passes() {
    let control = ScriptedControl::new(10.0);
    let sampler = LinkedSampler {
        control: Arc::clone(&control),
        divider_factor: DIVIDER,
        channel_fs: [10.0, 0.0, 0.0, 0.0],
        channel_error: [0.0; 4],
    };
    let mut store = fresh_store("perfect", 10.0);
    let (cancel, e_stop) = run_flags();
    let mut sink = CollectingSink::default();
    let mut prompt = ScriptedPrompt::accepting();

    let output = CalibrationSequencer::new(
        &*control,
        &sampler,
        &mut store,
        vec![dut(0, 10.0)],
        DIVIDER,
        fast_timing(),
        cancel,
        e_stop,
    )
    .run(&mut sink, &mut prompt);

    assert!(output.completed);
    assert_eq!(output.table.rows().len(), 11, "0..=10 Torr in 1 Torr steps");
    assert_eq!(output.reports.len(), 1);
    assert!(output.reports[0].passed());
    assert!(
        sink.events
            .iter()
            .any(|e| matches!(e, RunEvent::CertificateReady { channel: 0 })),
        "a passing device must request a certificate"
    );
    assert!(control.closed.load(Ordering::SeqCst), "valves closed at end");
    assert_eq!(prompt.calls, 0, "in-tolerance run never prompts");

    // Every held setpoint was sampled under an outlet hold that was
    // released afterwards.
    let holds = control.hold_transitions.lock().unwrap().clone();
    assert_eq!(holds.len(), 22);
    assert!(holds.chunks(2).all(|pair| pair == [true, false]));

    // Non-zero setpoints fed the learned store, and later transitions used
    // its predictions.
    assert_eq!(store.len(), 10);
    let calls = control.set_calls.lock().unwrap().clone();
    assert_eq!(calls[0], (0.0, None));
    assert!(calls[1].1.is_none(), "nothing learned before the first point");
    assert!(calls[2].1.is_some(), "second point predicted from the first");
}

#[test]
fn dut_past_its_range_is_recorded_as_nan() {
    let control = ScriptedControl::new(100.0);
    let sampler = LinkedSampler {
        control: Arc::clone(&control),
        divider_factor: DIVIDER,
        channel_fs: [100.0, 10.0, 0.0, 0.0],
        channel_error: [0.0; 4],
    };
    let mut store = fresh_store("pruning", 100.0);
    let (cancel, e_stop) = run_flags();
    let mut sink = CollectingSink::default();
    let mut prompt = ScriptedPrompt::accepting();

    let output = CalibrationSequencer::new(
        &*control,
        &sampler,
        &mut store,
        vec![dut(0, 100.0), dut(1, 10.0)],
        DIVIDER,
        fast_timing(),
        cancel,
        e_stop,
    )
    .run(&mut sink, &mut prompt);

    assert!(output.completed);
    // Composite list: 0..=10 by 1, then 20..=100 by 10.
    assert_eq!(output.table.rows().len(), 20);

    let complete_events: Vec<usize> = sink
        .events
        .iter()
        .filter_map(|e| match e {
            RunEvent::DutRangeComplete { channel } => Some(*channel),
            _ => None,
        })
        .collect();
    assert_eq!(complete_events, vec![1], "only the 10 Torr device completes");

    for row in output.table.rows() {
        if row.setpoint_torr > 10.0 * 1.05 {
            assert!(
                row.dut_torr[1].is_nan(),
                "no sample beyond 1.05 x full scale may be recorded"
            );
        } else {
            assert!(!row.dut_torr[1].is_nan());
        }
    }

    // The completed device's regression only ever sees its own range.
    let pairs = output.table.pairs_for(1);
    assert!(pairs.iter().all(|(std_p, _)| *std_p <= 10.5));
    assert!(output.reports.iter().all(presscal::sequence::analysis::DutReport::passed));
}

#[test]
fn stable_out_of_tolerance_asks_operator() {
    let control = ScriptedControl::new(100.0);
    // Stable a full Torr above every setpoint: outside the 0.5 Torr
    // tolerance of a 100 Torr device.
    *control.offset.lock().unwrap() = 1.0;
    let sampler = LinkedSampler {
        control: Arc::clone(&control),
        divider_factor: DIVIDER,
        channel_fs: [100.0, 0.0, 0.0, 0.0],
        channel_error: [0.0; 4],
    };
    let mut store = fresh_store("override", 100.0);
    let (cancel, e_stop) = run_flags();
    let mut sink = CollectingSink::default();
    let mut prompt = ScriptedPrompt::rejecting_first(1);

    let output = CalibrationSequencer::new(
        &*control,
        &sampler,
        &mut store,
        vec![dut(0, 100.0)],
        DIVIDER,
        fast_timing(),
        cancel,
        e_stop,
    )
    .run(&mut sink, &mut prompt);

    assert!(output.completed);
    assert!(
        prompt.calls >= 2,
        "first rejection must restart the wait and prompt again"
    );
    assert_eq!(output.table.rows().len(), 11, "accepted readings are logged");
}

#[test]
fn canceled_run_stops_early_and_still_closes_valves() {
    let control = ScriptedControl::new(100.0);
    let sampler = LinkedSampler {
        control: Arc::clone(&control),
        divider_factor: DIVIDER,
        channel_fs: [100.0, 0.0, 0.0, 0.0],
        channel_error: [0.0; 4],
    };
    let mut store = fresh_store("cancel", 100.0);
    let (cancel, e_stop) = run_flags();
    cancel.store(true, Ordering::SeqCst);
    let mut sink = CollectingSink::default();
    let mut prompt = ScriptedPrompt::accepting();

    let output = CalibrationSequencer::new(
        &*control,
        &sampler,
        &mut store,
        vec![dut(0, 100.0)],
        DIVIDER,
        fast_timing(),
        cancel,
        e_stop,
    )
    .run(&mut sink, &mut prompt);

    assert!(!output.completed);
    assert!(output.table.rows().is_empty());
    assert!(output.reports.is_empty());
    assert!(control.closed.load(Ordering::SeqCst));
    assert!(
        sink.events
            .iter()
            .any(|e| matches!(e, RunEvent::RunFinished { rows: 0 }))
    );
}

#[test]
fn miscalibrated_dut_fails_with_diagnosis() {
    let control = ScriptedControl::new(100.0);
    let sampler = LinkedSampler {
        control: Arc::clone(&control),
        divider_factor: DIVIDER,
        channel_fs: [100.0, 0.0, 0.0, 0.0],
        // Constant +2 Torr: a zero-offset error well past 0.1 Torr.
        channel_error: [2.0, 0.0, 0.0, 0.0],
    };
    let mut store = fresh_store("offset", 100.0);
    let (cancel, e_stop) = run_flags();
    let mut sink = CollectingSink::default();
    let mut prompt = ScriptedPrompt::accepting();

    let output = CalibrationSequencer::new(
        &*control,
        &sampler,
        &mut store,
        vec![dut(0, 100.0)],
        DIVIDER,
        fast_timing(),
        cancel,
        e_stop,
    )
    .run(&mut sink, &mut prompt);

    assert!(output.completed);
    assert!(!output.reports[0].passed());
    assert!(
        !sink.events
            .iter()
            .any(|e| matches!(e, RunEvent::CertificateReady { .. })),
        "a failing device must not request a certificate"
    );
    let diagnosis = sink.events.iter().find_map(|e| match e {
        RunEvent::DiagnosisReady { passed, report, .. } => Some((*passed, report.clone())),
        _ => None,
    });
    let (passed, report) = diagnosis.expect("diagnosis emitted");
    assert!(!passed);
    assert!(report.contains("Zero offset"));
    // Per-point tolerance warnings fired along the way (error 2 > 0.5).
    assert!(
        sink.events
            .iter()
            .any(|e| matches!(e, RunEvent::OutOfTolerance { channel: 0, .. }))
    );
}
