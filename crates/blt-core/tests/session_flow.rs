//! End-to-end update runs against the simulated XCP target.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use blt_core::events::{BltEvent, BltObserver, Operation};
use blt_core::protocol::xcp::packet::Endianness;
use blt_core::protocol::xcp::{SimConfig, SimTarget};
use blt_core::{
    BltSession, Firmware, MockTransport, ParserKind, SessionError, SessionKind, SessionSettings,
    SessionState, Transport, TransportKind, XcpSettings,
};

#[derive(Default)]
struct ProgressLog {
    events: Mutex<Vec<(Operation, u64, u64)>>,
}

impl BltObserver for ProgressLog {
    fn on_event(&self, event: &BltEvent) {
        if let BltEvent::Progress {
            operation,
            current,
            total,
        } = event
        {
            self.events.lock().unwrap().push((*operation, *current, *total));
        }
    }
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("blt-{}-{}", std::process::id(), name))
}

fn settings() -> Option<SessionSettings> {
    Some(SessionSettings::XcpV10(XcpSettings {
        retry_backoff_ms: 0,
        ..Default::default()
    }))
}

/// Two separate regions, the second one longer than a progress block.
fn firmware_text() -> String {
    let mut image = Firmware::new(ParserKind::SRecord);
    image
        .add_data(0x0800_0000, &(0u8..=255).collect::<Vec<_>>())
        .unwrap();
    image
        .add_data(0x0800_4000, &[0x5A; 1500])
        .unwrap();
    let path = temp_path("source.srec");
    image.save_to_file(&path).unwrap();
    let text = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).ok();
    text
}

#[test]
fn program_srecord_image_over_can_sized_link() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let path = temp_path("flow.srec");
    std::fs::write(&path, firmware_text()).unwrap();
    let mut firmware = Firmware::new(ParserKind::SRecord);
    firmware.load_from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(firmware.segment_count(), 2);

    let mock = MockTransport::with_kind(TransportKind::XcpV10Can, 8);
    let target = SimTarget::new(SimConfig {
        byte_order: Endianness::Motorola,
        flash: 0x0800_0000..0x0801_0000,
        ..Default::default()
    });
    target.attach(&mock);

    let log = Arc::new(ProgressLog::default());
    let mut session = BltSession::with_observer(Arc::clone(&log));
    session
        .init_with_transport(SessionKind::XcpV10, settings(), Box::new(mock.clone()))
        .unwrap();
    session.start().unwrap();
    session.program_image(firmware.store()).unwrap();

    for segment in firmware.store().segments() {
        assert_eq!(target.read(segment.base(), segment.len()), segment.data());
        session.verify_data(segment.base(), segment.data()).unwrap();
    }

    session.terminate();
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert_eq!(target.resets(), 1);
    assert!(!mock.is_open());

    let events = log.events.lock().unwrap();
    assert!(events.contains(&(Operation::Erase, 1756, 1756)));
    assert!(events.contains(&(Operation::Program, 1756, 1756)));
    // Every request fit a classic CAN frame.
    assert!(mock.requests().iter().all(|r| r.len() <= 8));
}

#[test]
fn failed_erase_stops_the_run_before_programming() {
    let mut firmware = Firmware::new(ParserKind::SRecord);
    firmware.add_data(0x1000, &[1; 32]).unwrap();
    firmware.add_data(0x9000, &[2; 32]).unwrap();

    let mock = MockTransport::new();
    let target = SimTarget::new(SimConfig {
        flash: 0x0000..0x8000,
        ..Default::default()
    });
    target.attach(&mock);

    let mut session = BltSession::with_observer(Arc::new(blt_core::NullObserver));
    session
        .init_with_transport(SessionKind::XcpV10, settings(), Box::new(mock))
        .unwrap();
    session.start().unwrap();

    assert!(matches!(
        session.program_image(firmware.store()),
        Err(SessionError::CommunicationError(_))
    ));
    // Nothing is programmed until every segment has been erased.
    assert_eq!(target.read(0x1000, 32), vec![0xFF; 32]);
    assert_eq!(target.read(0x9000, 4), vec![0xFF; 4]);
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn read_back_into_new_image() {
    let mock = MockTransport::new();
    let target = SimTarget::default();
    target.write(0x2000, b"bootloader");
    target.attach(&mock);

    let mut session = BltSession::with_observer(Arc::new(blt_core::NullObserver));
    session
        .init_with_transport(SessionKind::XcpV10, settings(), Box::new(mock))
        .unwrap();
    session.start().unwrap();

    let mut buf = [0u8; 10];
    session.read_data(0x2000, &mut buf).unwrap();
    session.stop();

    let mut image = Firmware::new(ParserKind::SRecord);
    image.add_data(0x2000, &buf).unwrap();
    let path = temp_path("readback.srec");
    image.save_to_file(&path).unwrap();

    let mut reloaded = Firmware::new(ParserKind::SRecord);
    reloaded.load_from_file(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(reloaded.segment(0).unwrap().data(), b"bootloader");
}
