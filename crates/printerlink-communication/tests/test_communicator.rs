//! Printer communicator against the simulated Marlin board

use parking_lot::Mutex;
use printerlink_communication::communication::CoolingConfig;
use printerlink_communication::{EngineConfig, LinkMode, MockDevice, PrinterCommunicator};
use printerlink_core::{
    Error, FirmwareError, LinkState, PrintPhase, PrinterEvent, PrinterListener, PrinterStatus,
    ProtocolError, TelemetryKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const PORT: &str = "/dev/ttyMOCK0";

fn engine_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.port = PORT.to_string();
    config.controller.reset_pulse = Duration::ZERO;
    config.controller.settle_delay = Duration::ZERO;
    config.controller.ack_timeout = Duration::from_secs(5);
    config.detection_delay = Duration::from_millis(100);
    config.probe_timeout = Duration::from_secs(2);
    config.rearm_cooldown = Duration::from_secs(60);
    config.cooling = CoolingConfig {
        hotend_c: 50.0,
        bed_c: 40.0,
        stable: Duration::from_millis(50),
        check_interval: Duration::from_millis(20),
        timeout: Duration::from_secs(5),
    };
    config
}

fn communicator(device: &MockDevice) -> PrinterCommunicator {
    PrinterCommunicator::with_opener(engine_config(), Arc::new(device.clone()))
}

fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Connect and wait for detection to install a handler
fn connected_marlin() -> (MockDevice, PrinterCommunicator) {
    let device = MockDevice::marlin();
    let comm = communicator(&device);
    comm.connect(None, None).unwrap();
    assert!(wait_until(
        || comm.get_capabilities().is_ok(),
        Duration::from_secs(3)
    ));
    assert!(wait_until(|| comm.in_flight() == 0, Duration::from_secs(3)));
    (device, comm)
}

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<LinkState>>,
    errors: Mutex<Vec<String>>,
    temperatures: AtomicUsize,
}

impl PrinterListener for Recorder {
    fn on_state_change(&self, status: &PrinterStatus) {
        self.states.lock().push(status.state);
    }

    fn on_temperature_update(&self, _sample: &printerlink_core::TemperatureSample) {
        self.temperatures.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().push(message.to_string());
    }
}

struct Panicking;

impl PrinterListener for Panicking {
    fn on_state_change(&self, _status: &PrinterStatus) {
        panic!("listener failure");
    }
}

#[test]
fn test_connect_runs_detection() {
    let device = MockDevice::marlin();
    let comm = communicator(&device);
    let mut events = comm.subscribe();

    comm.connect(None, None).unwrap();
    assert!(comm.is_connected());
    assert_eq!(comm.state(), LinkState::Operational);
    assert_eq!(comm.link_mode(), Some(LinkMode::Primary));
    assert_eq!(comm.port().as_deref(), Some(PORT));

    assert!(wait_until(
        || comm.get_capabilities().is_ok(),
        Duration::from_secs(3)
    ));
    let info = comm.get_printer_type_info();
    assert_eq!(info.printer_type, "fdm");
    assert_eq!(info.firmware_type, "marlin");
    assert_eq!(info.firmware_name, "Marlin");
    assert_eq!(comm.get_firmware_info().machine_type.as_deref(), Some("Ender-3"));

    let written = device.written_lines();
    for command in ["M115", "M503", "M105", "M114"] {
        assert!(written.iter().any(|l| l == command), "{} not sent", command);
    }

    let mut detected = None;
    while let Ok(event) = events.try_recv() {
        if let PrinterEvent::Detected {
            printer_type,
            firmware,
        } = event
        {
            detected = Some((printer_type, firmware));
        }
    }
    assert_eq!(detected, Some(("fdm".to_string(), "marlin".to_string())));
}

#[test]
fn test_query_waits_return_report_lines() {
    let (_device, comm) = connected_marlin();

    let reply = comm
        .send_command_and_wait("M105", Duration::from_secs(2))
        .unwrap()
        .unwrap();
    assert!(reply.contains("T:"), "{}", reply);

    let reply = comm
        .send_command_and_wait("M114", Duration::from_secs(2))
        .unwrap()
        .unwrap();
    assert!(reply.contains("X:"), "{}", reply);

    let reply = comm
        .send_command_and_wait("G90", Duration::from_secs(2))
        .unwrap();
    assert!(reply.is_some());

    let temperature = comm.get_temperature().unwrap();
    assert!(temperature.bed.is_some());
    assert!(!comm.is_stale(TelemetryKind::Temperature));
    assert!(comm.get_position().is_some());
}

#[test]
fn test_fallback_mode_queries() {
    let device = MockDevice::marlin();
    device.set_splittable(false);
    let comm = communicator(&device);
    comm.connect(None, None).unwrap();
    assert_eq!(comm.link_mode(), Some(LinkMode::Fallback));

    let reply = comm
        .send_command_and_wait("M105", Duration::from_secs(2))
        .unwrap()
        .unwrap();
    assert!(reply.contains("T:"), "{}", reply);
    assert!(comm.get_temperature_info().is_some());
}

#[test]
fn test_device_error_and_recovery() {
    let (device, comm) = connected_marlin();
    let recorder = Arc::new(Recorder::default());
    comm.add_listener(recorder.clone());

    device.push_line("Error:Printer halted. kill() called!");
    assert!(wait_until(
        || comm.state() == LinkState::Error,
        Duration::from_secs(2)
    ));
    let status = comm.get_printer_status();
    assert!(status.error_message.unwrap().contains("Printer halted"));
    assert!(status.flags.error);
    assert_eq!(recorder.errors.lock().len(), 1);

    assert!(comm.recover().unwrap());
    assert_eq!(comm.state(), LinkState::Operational);
    assert!(comm.get_printer_status().error_message.is_none());
}

#[test]
fn test_heartbeat_reconnects_once() {
    let device = MockDevice::new();
    let mut config = engine_config();
    config.max_consecutive_timeouts = 2;
    let comm = PrinterCommunicator::with_opener(config, Arc::new(device.clone()));
    comm.connect(None, None).unwrap();

    let wait = Duration::from_millis(100);
    assert_eq!(comm.send_command_and_wait("M105", wait).unwrap(), None);
    assert_eq!(comm.consecutive_timeouts(), 1);
    assert_eq!(comm.send_command_and_wait("M105", wait).unwrap(), None);

    assert!(wait_until(
        || device.open_count() == 2 && comm.state() == LinkState::Operational,
        Duration::from_secs(3)
    ));

    // no second reconnect until something is acknowledged
    assert_eq!(comm.send_command_and_wait("M105", wait).unwrap(), None);
    assert_eq!(comm.send_command_and_wait("M105", wait).unwrap(), None);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(device.open_count(), 2);
}

#[test]
fn test_disconnect_cancels_pending_reconnect() {
    let device = MockDevice::new();
    let mut config = engine_config();
    config.controller.settle_delay = Duration::from_millis(400);
    config.max_consecutive_timeouts = 1;
    let comm = PrinterCommunicator::with_opener(config, Arc::new(device.clone()));
    comm.connect(None, None).unwrap();

    assert_eq!(
        comm.send_command_and_wait("M105", Duration::from_millis(100))
            .unwrap(),
        None
    );
    thread::sleep(Duration::from_millis(100));
    comm.disconnect();
    assert_eq!(comm.state(), LinkState::Disconnected);
    assert!(!comm.is_connected());

    thread::sleep(Duration::from_millis(800));
    assert_eq!(comm.state(), LinkState::Disconnected);
    assert!(!comm.is_connected());
    assert!(device.open_count() <= 2);
}

#[test]
fn test_capabilities_require_detection() {
    let device = MockDevice::new();
    let comm = communicator(&device);
    comm.connect(None, None).unwrap();

    match comm.get_capabilities() {
        Err(Error::Firmware(FirmwareError::NotDetected)) => {}
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(comm.poll_status().unwrap_err().is_firmware_error());
}

#[test]
fn test_poll_status_uses_handler_queries() {
    let (device, comm) = connected_marlin();
    assert!(wait_until(
        || comm.queue_len() == 0 && comm.in_flight() == 0,
        Duration::from_secs(3)
    ));
    device.clear_written();

    let ids = comm.poll_status().unwrap();
    assert_eq!(ids.len(), 4);
    assert!(wait_until(
        || device.written_lines() == ["M105", "M114", "M119", "M27"],
        Duration::from_secs(2)
    ));
}

#[test]
fn test_cancel_print_cools_down() {
    let (device, comm) = connected_marlin();
    comm.set_temperature(0, 210.0).unwrap();

    comm.cancel_print().unwrap();
    assert_eq!(comm.state(), LinkState::Cancelling);
    assert!(wait_until(
        || comm.state() == LinkState::Operational,
        Duration::from_secs(5)
    ));
    assert_eq!(comm.get_phase_snapshot().phase, PrintPhase::Idle);

    let written = device.written_lines();
    for line in ["G91", "G1 Z10 F600", "M104 S0", "M140 S0", "M106 S0"] {
        assert!(written.iter().any(|l| l == line), "{} not sent", line);
    }
}

#[test]
fn test_invalid_state_is_rejected() {
    let device = MockDevice::marlin();
    let comm = communicator(&device);
    assert!(comm.pause_print().is_err());

    comm.connect(None, None).unwrap();
    comm.sd_print("CUBE~1.GCO").unwrap();
    assert_eq!(comm.state(), LinkState::Printing);

    match comm.sd_print("BENCHY.GCO") {
        Err(Error::Protocol(ProtocolError::InvalidState { operation, state })) => {
            assert_eq!(operation, "sd_print");
            assert_eq!(state, "Printing");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(comm.sd_upload("PART.GCO", "G28\n".as_bytes()).is_err());
}

#[test]
fn test_listener_panic_is_isolated() {
    let device = MockDevice::marlin();
    let comm = communicator(&device);
    let recorder = Arc::new(Recorder::default());
    comm.add_listener(Arc::new(Panicking));
    let handle = comm.add_listener(recorder.clone());
    assert_eq!(comm.listener_count(), 2);

    comm.connect(None, None).unwrap();
    let states = recorder.states.lock().clone();
    assert!(states.contains(&LinkState::Connecting));
    assert!(states.contains(&LinkState::Operational));
    assert!(wait_until(
        || recorder.temperatures.load(Ordering::SeqCst) > 0,
        Duration::from_secs(2)
    ));

    assert!(comm.remove_listener(&handle));
    assert!(!comm.remove_listener(&handle));
    assert_eq!(comm.listener_count(), 1);
}

#[test]
fn test_sd_listing() {
    let (_device, comm) = connected_marlin();
    let files = comm.sd_list(Duration::from_secs(2)).unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].name, "CUBE~1.GCO");
    assert_eq!(files[0].display_name, "calibration cube.gcode");
    assert_eq!(files[0].size, Some(12345));
    assert_eq!(files[1].name, "BENCHY.GCO");
    assert_eq!(comm.sd_files(), files);
}

#[test]
fn test_sd_print_progress_and_finish() {
    let (device, comm) = connected_marlin();
    comm.sd_print("CUBE~1.GCO").unwrap();
    assert!(wait_until(
        || device.written_lines().iter().any(|l| l == "M23 CUBE~1.GCO"),
        Duration::from_secs(2)
    ));

    device.push_line("SD printing byte 500/1000");
    assert!(wait_until(
        || comm.get_print_progress().sd.printed_bytes == 500,
        Duration::from_secs(2)
    ));
    let progress = comm.get_print_progress();
    assert!(progress.sd.active);
    assert!((progress.sd.completion - 0.5).abs() < 1e-9);
    assert_eq!(comm.state(), LinkState::Printing);

    device.push_line("SD printing byte 1000/1000");
    assert!(wait_until(
        || comm.state() == LinkState::Finishing,
        Duration::from_secs(2)
    ));
    assert_eq!(comm.get_phase_snapshot().phase, PrintPhase::Finishing);

    device.push_line("Not SD printing");
    device.push_line("Not SD printing");
    assert!(wait_until(
        || comm.state() == LinkState::Operational,
        Duration::from_secs(2)
    ));
    assert!(!comm.get_print_progress().sd.active);
    assert_eq!(comm.get_print_progress().eta, "--:--:--");
}

#[test]
fn test_sd_cancel_returns_to_operational() {
    let (device, comm) = connected_marlin();
    comm.sd_print("CUBE~1.GCO").unwrap();
    comm.sd_cancel().unwrap();
    assert_eq!(comm.state(), LinkState::Operational);
    assert!(wait_until(
        || device.written_lines().iter().any(|l| l == "M21"),
        Duration::from_secs(2)
    ));
    let written = device.written_lines();
    let start = written.iter().position(|l| l == "M25").unwrap();
    assert_eq!(written[start..start + 4], ["M25", "M26 S0", "M22", "M21"]);
}

#[test]
fn test_probe_autoreport_and_rearm() {
    let (device, comm) = connected_marlin();
    let support = comm.probe_autoreport().unwrap();
    assert_eq!(support.get(&TelemetryKind::Temperature), Some(&true));
    assert_eq!(support.get(&TelemetryKind::Position), Some(&false));
    assert_eq!(support.get(&TelemetryKind::SdStatus), Some(&true));
    assert_eq!(
        comm.autoreport_supported(TelemetryKind::Position),
        Some(false)
    );

    device.clear_written();
    assert!(comm.rearm_autoreport(TelemetryKind::Temperature).unwrap());
    assert!(!comm.rearm_autoreport(TelemetryKind::Temperature).unwrap());
    assert!(!comm.rearm_autoreport(TelemetryKind::Position).unwrap());
    assert!(wait_until(
        || device.written_lines() == ["M155 S0", "M155 S1"],
        Duration::from_secs(2)
    ));
}

#[test]
fn test_emergency_stop() {
    let (device, comm) = connected_marlin();
    let mut events = comm.subscribe();
    comm.emergency_stop().unwrap();

    assert!(wait_until(
        || device.written_lines().iter().any(|l| l == "M112"),
        Duration::from_secs(2)
    ));
    assert_eq!(comm.state(), LinkState::Error);
    assert_eq!(comm.queue_len(), 0);

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PrinterEvent::Error(ref message) if message == "Emergency stop") {
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[test]
fn test_auto_port_selection() {
    let device = MockDevice::marlin();
    let comm = communicator(&device);
    comm.connect(Some("Auto"), Some(250000)).unwrap();
    assert_eq!(comm.port().as_deref(), Some(PORT));
    comm.disconnect();
    assert_eq!(comm.state(), LinkState::Disconnected);
    assert!(!comm.is_connected());
}

#[test]
fn test_connect_failure_reports_error() {
    let device = MockDevice::marlin();
    device.set_fail_open(true);
    let comm = communicator(&device);
    let recorder = Arc::new(Recorder::default());
    comm.add_listener(recorder.clone());

    let err = comm.connect(None, None).unwrap_err();
    assert!(err.is_connection_error());
    assert_eq!(comm.state(), LinkState::Error);
    assert!(comm.get_printer_status().error_message.is_some());
    assert!(!recorder.errors.lock().is_empty());
    assert!(comm.send_command("M105", false).is_err());
}
