//! End-to-end scenarios for the trigger buffer driven by a replay source.

use scope_daq::config::{AdapterKind, Direction, Settings};
use scope_daq::data::capture::read_capture;
use scope_daq::data::trigger::{SweepWindow, TriggerKind};
use scope_daq::data::{BufferEvent, TriggerBuffer};
use scope_daq::error::DaqError;
use scope_daq::source::ReplaySource;
use tokio::sync::broadcast::Receiver;

/// Single channel on hardware input 0, zero offset, 1 V/div.
fn single_channel(rate_hz: f64, delay_div: f64) -> Settings {
    let mut settings = Settings::default();
    settings.hardware.acq_rate_hz = rate_hz;
    settings.horizontal.s_div = 0.01;
    settings.horizontal.xlim = [0.0, 10.0];
    settings.channels[0].offset_div = 0.0;
    settings.channels[0].unit_div = 1.0;
    settings.channels[1].hw = None;
    settings.trigger.enabled = true;
    settings.trigger.source = 0;
    settings.trigger.level_div = 0.0;
    settings.trigger.direction = Direction::Up;
    settings.trigger.delay_div = delay_div;
    settings
}

fn running_buffer(settings: Settings, signal: &[f64]) -> TriggerBuffer {
    let mut source = ReplaySource::new(1);
    source.push_rows(signal);
    let mut buffer = TriggerBuffer::with_source(settings, Box::new(source));
    buffer.reconfigure().expect("reconfigure");
    assert!(buffer.run().expect("run"));
    buffer
}

fn triggers(events: &mut Receiver<BufferEvent>) -> Vec<(u64, TriggerKind)> {
    let mut found = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let BufferEvent::TriggerAvailable { index, kind } = event {
            found.push((index, kind));
        }
    }
    found
}

/// Alternate 250 scans at -1 V and 250 scans at +1 V.
fn square_wave(len: usize) -> Vec<f64> {
    (0..len)
        .map(|k| if (k / 250) % 2 == 0 { -1.0 } else { 1.0 })
        .collect()
}

#[test]
fn test_ramp_at_8khz_triggers_at_5000() {
    let settings = single_channel(8000.0, 2.5);
    let ramp: Vec<f64> = (0..8000).map(|k| (k as f64 - 4999.5) * 0.01).collect();
    let mut buffer = running_buffer(settings, &ramp);
    let mut events = buffer.subscribe();

    assert_eq!(buffer.per_scans(), 800);
    assert_eq!(buffer.window(), SweepWindow::new(200, 800));

    buffer.import_data().expect("import");
    assert_eq!(triggers(&mut events), vec![(5000, TriggerKind::Natural)]);
    assert_eq!(buffer.trig_idx(), Some(5000));

    let mut dst = vec![0.0; 4096];
    let rows = buffer.get_data(&mut dst).expect("read");
    assert_eq!(rows, 800);
    assert_eq!(&dst[..rows], &ramp[4800..5600]);
    assert_eq!(buffer.get_data(&mut dst).expect("read"), 0);
    assert_eq!(buffer.trig_idx(), None);
}

#[test]
fn test_every_sweep_spans_its_window() {
    let settings = single_channel(1000.0, 2.0);
    let signal = square_wave(5000);
    let mut buffer = running_buffer(settings, &signal);
    let mut events = buffer.subscribe();
    let window = buffer.window();
    assert_eq!(window, SweepWindow::new(20, 100));

    let mut sweeps = Vec::new();
    let mut dst = vec![0.0; 37];
    loop {
        let imported = buffer.import_data().expect("import");
        let found = triggers(&mut events);
        let mut delivered = Vec::new();
        loop {
            let n = buffer.get_data(&mut dst).expect("read");
            if n == 0 {
                break;
            }
            delivered.extend_from_slice(&dst[..n]);
        }
        if let Some(&(index, _)) = found.last() {
            sweeps.push((index, delivered));
        } else {
            assert!(delivered.is_empty());
        }
        if imported == 0 {
            break;
        }
    }

    let indices: Vec<u64> = sweeps.iter().map(|(t, _)| *t).collect();
    let expected: Vec<u64> = (0..10).map(|m| 250 + 500 * m).collect();
    assert_eq!(indices, expected);
    for (trig, delivered) in &sweeps {
        let start = (*trig - 20) as usize;
        assert_eq!(
            delivered.as_slice(),
            &signal[start..start + 100],
            "sweep at {trig}"
        );
    }
}

#[test]
fn test_noise_near_level_does_not_retrigger() {
    let settings = single_channel(1000.0, 0.0);
    // prime, trigger at 100, then chatter between +0.5 V and -0.1 V for good
    let mut signal = vec![-1.0; 100];
    signal.extend((0..2000).map(|k| if k % 2 == 0 { 0.5 } else { -0.1 }));
    let mut buffer = running_buffer(settings, &signal);
    let mut events = buffer.subscribe();

    let mut dst = vec![0.0; 512];
    for _ in 0..20 {
        buffer.import_data().expect("import");
        while buffer.get_data(&mut dst).expect("read") > 0 {}
    }
    assert_eq!(triggers(&mut events), vec![(100, TriggerKind::Natural)]);
}

#[test]
fn test_auto_trigger_without_crossing() {
    let mut settings = single_channel(1000.0, 2.0);
    settings.trigger.auto = true;
    settings.trigger.auto_margin_s = 0.1;
    // never below the revert level, so never primed
    let flat = vec![0.5; 3000];
    let mut buffer = running_buffer(settings, &flat);
    let mut events = buffer.subscribe();

    buffer.import_data().expect("import");
    // due at 0 + 100 scans per sweep + 100 scans margin
    assert_eq!(triggers(&mut events), vec![(200, TriggerKind::Auto)]);
    assert_eq!(buffer.read_idx(), 180);

    let mut dst = vec![0.0; 1000];
    assert_eq!(buffer.get_data(&mut dst).expect("read"), 100);

    // the next one comes two periods plus the margin later
    buffer.import_data().expect("import");
    assert_eq!(triggers(&mut events), vec![(500, TriggerKind::Auto)]);
}

#[test]
fn test_falling_edge_trigger() {
    let mut settings = single_channel(1000.0, 1.0);
    settings.trigger.direction = Direction::Down;
    let signal: Vec<f64> = square_wave(1000).into_iter().map(|v| -v).collect();
    let mut buffer = running_buffer(settings, &signal);
    let mut events = buffer.subscribe();

    buffer.import_data().expect("import");
    assert_eq!(triggers(&mut events), vec![(250, TriggerKind::Natural)]);
    let mut dst = vec![0.0; 200];
    assert_eq!(buffer.get_data(&mut dst).expect("read"), 100);
    assert_eq!(&dst[..10], &[1.0; 10]);
    assert_eq!(&dst[10..100], &[-1.0; 90]);
}

#[test]
fn test_capture_mirrors_delivered_scans() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut settings = single_channel(1000.0, 2.0);
    settings.channels[1].hw = Some(1);
    settings.capture.directory = dir.path().to_path_buf();

    let signal: Vec<f64> = (0..3000)
        .flat_map(|k| {
            let trig = if (k / 250) % 2 == 0 { -1.0 } else { 1.0 };
            [trig, k as f64 * 1e-3]
        })
        .collect();
    let mut source = ReplaySource::new(2);
    source.push_rows(&signal);
    let mut buffer = TriggerBuffer::with_source(settings, Box::new(source));
    buffer.reconfigure().expect("reconfigure");
    let path = buffer.start_capture("exact").expect("capture");
    assert!(buffer.run().expect("run"));

    let mut delivered = Vec::new();
    let mut dst = vec![0.0; 2 * 64];
    for _ in 0..20 {
        buffer.import_data().expect("import");
        loop {
            let n = buffer.get_data(&mut dst).expect("read");
            if n == 0 {
                break;
            }
            delivered.extend_from_slice(&dst[..2 * n]);
        }
    }
    buffer.stop();
    assert!(buffer.capture_path().is_none());
    assert_eq!(delivered.len(), 2 * 100 * 6);

    let expected: Vec<f32> = delivered.iter().map(|&v| v as f32).collect();
    assert_eq!(read_capture(&path, 2).expect("read back"), expected);
}

#[test]
fn test_continuous_mode_streams_in_order() {
    let mut settings = single_channel(1000.0, 2.0);
    settings.trigger.enabled = false;
    let signal: Vec<f64> = (0..1000).map(f64::from).collect();
    let mut buffer = running_buffer(settings, &signal);
    assert!(!buffer.is_triggered());

    let mut out = Vec::new();
    let mut dst = vec![0.0; 70];
    for _ in 0..10 {
        buffer.import_data().expect("import");
        loop {
            let n = buffer.get_data(&mut dst).expect("read");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&dst[..n]);
        }
    }
    assert_eq!(out, signal);
    assert!(buffer.write_idx() - buffer.read_idx() <= 300);
}

#[test]
fn test_device_error_is_surfaced_once() {
    let mut source = ReplaySource::new(1);
    source.push_rows(&[0.0; 10]);
    source.fail_next("analog input overrun");
    let mut buffer = TriggerBuffer::with_source(single_channel(1000.0, 2.0), Box::new(source));
    buffer.reconfigure().expect("reconfigure");
    buffer.run().expect("run");
    let mut events = buffer.subscribe();

    match buffer.import_data() {
        Err(DaqError::Device(message)) => assert_eq!(message, "analog input overrun"),
        other => panic!("expected device error, got {other:?}"),
    }
    assert!(!buffer.is_running());
    assert_eq!(
        events.try_recv().expect("event"),
        BufferEvent::DeviceError("analog input overrun".to_string())
    );
    assert_eq!(buffer.import_data().expect("stopped"), 0);
    assert!(events.try_recv().is_err());
}

#[test]
fn test_unsupported_adapter_is_configuration_error() {
    let mut settings = Settings::default();
    settings.hardware.adapter = AdapterKind::Picodaq;
    let err = TriggerBuffer::new(settings).expect_err("no picodaq driver");
    assert!(matches!(err, DaqError::Configuration(_)));
}
