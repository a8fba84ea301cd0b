//! Port discovery on the host running the tests

use printerlink_communication::communication::serial::{is_printer_port, list_ports};

#[test]
fn test_listed_ports_are_printer_ports() {
    // CI machines may have no serial subsystem at all
    let Ok(ports) = list_ports() else {
        return;
    };
    for port in ports {
        assert!(
            is_printer_port(&port.port_name),
            "{} should have been filtered out",
            port.port_name
        );
    }
}

#[test]
fn test_printer_port_names() {
    assert!(is_printer_port("/dev/ttyUSB0"));
    assert!(is_printer_port("/dev/ttyACM1"));
    assert!(is_printer_port("/dev/cu.usbmodem14101"));
    assert!(is_printer_port("COM3"));
    assert!(!is_printer_port("/dev/ttyS0"));
    assert!(!is_printer_port("/dev/ttyGRBL"));
    assert!(!is_printer_port("COM"));
}
