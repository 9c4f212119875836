// Session manager tests over the virtual transport

use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use super::*;
use crate::library::{PatchFilter, PatchLibrary};
use crate::midi::VirtualTransport;

const NOTE_ON: [u8; 3] = [0x90, 60, 100];
const CONTROL_CHANGE: [u8; 3] = [0xB0, 7, 90];
const PROGRAM_CHANGE: [u8; 2] = [0xC0, 5];
const CLOCK: [u8; 1] = [0xF8];
const SHORT_DUMP: [u8; 4] = [0xF0, 0x41, 0x10, 0xF7];

// Roland identity reply: F0 7E 10 06 02 41 <family> <model> <version> F7
const IDENTITY_REPLY: [u8; 15] = [
    0xF0, 0x7E, 0x10, 0x06, 0x02, 0x41, 0x0E, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0xF7,
];

fn setup() -> (VirtualTransport, DeviceSessionManager, Receiver<SessionEvent>) {
    let transport = VirtualTransport::new();
    let (tx, rx) = mpsc::channel();
    let manager = DeviceSessionManager::new(
        Arc::new(transport.clone()),
        Arc::new(ChannelSink::new(tx)),
    );
    (transport, manager, rx)
}

fn with_library(manager: &DeviceSessionManager) -> Arc<PatchLibrary> {
    let library = Arc::new(PatchLibrary::in_memory().unwrap());
    manager.attach_library(Arc::clone(&library));
    library
}

fn drain(rx: &Receiver<SessionEvent>) -> Vec<SessionEvent> {
    rx.try_iter().collect()
}

fn import_statuses(events: &[SessionEvent]) -> Vec<(ImportStatus, usize)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Import(p) => Some((p.status, p.count)),
            _ => None,
        })
        .collect()
}

fn thru_statuses(events: &[SessionEvent]) -> Vec<ThruStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Thru(t) => Some(t.status),
            _ => None,
        })
        .collect()
}

// ----- Connections -----

#[test]
fn test_connect_pairs_by_port_name_and_requests_identity() {
    let (transport, manager, _rx) = setup();
    let (input, output) = transport.add_device("JD-Xi");

    let status = manager.connect(&output, ConnectOptions::default()).unwrap();
    assert_eq!(status.input_id.as_deref(), Some(input.as_str()));
    assert_eq!(status.state, VerificationState::ConnectedUnverified);
    assert!(transport.is_open(&output, PortKind::Output));
    assert!(transport.is_open(&input, PortKind::Input));
    assert_eq!(transport.sent_to(&output), vec![IDENTITY_REQUEST.to_vec()]);
}

#[test]
fn test_explicit_input_wins() {
    let (transport, manager, _rx) = setup();
    let (_, output) = transport.add_device("JD-Xi");
    transport.add_port("usb-in", "USB MIDI", PortKind::Input);

    let status = manager
        .connect(&output, ConnectOptions::with_input("usb-in"))
        .unwrap();
    assert_eq!(status.input_id.as_deref(), Some("usb-in"));
}

#[test]
fn test_inbound_message_verifies_and_records_identity() {
    let (transport, manager, rx) = setup();
    let (input, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();

    transport.inject(&input, &IDENTITY_REPLY);

    let status = manager.status(&output);
    assert!(status.is_verified());
    assert!(status.verified_at.is_some());
    let identity = status.identity.unwrap();
    assert_eq!(identity.manufacturer_id, vec![0x41]);

    let activity: Vec<MidiActivity> = drain(&rx)
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::Activity(a) => Some(a),
            _ => None,
        })
        .collect();
    assert_eq!(activity.len(), 1);
    assert_eq!(activity[0].device_id, output);
    assert_eq!(activity[0].kind, crate::midi::ActivityKind::IdentityReply);
    assert_eq!(activity[0].delta_time_us, 0);
}

#[test]
fn test_any_message_verifies() {
    let (transport, manager, _rx) = setup();
    let (input, output) = transport.add_device("DX7");
    manager.connect(&output, ConnectOptions::default()).unwrap();

    transport.inject(&input, &NOTE_ON);
    let status = manager.status(&output);
    assert!(status.is_verified());
    assert!(status.identity.is_none());
}

#[test]
fn test_open_failure_leaves_disconnected() {
    let (transport, manager, _rx) = setup();
    let (input, output) = transport.add_device("JD-Xi");
    transport.fail_opens_of(&input);

    let err = manager.connect(&output, ConnectOptions::default()).unwrap_err();
    assert!(matches!(err, AtlasError::Transport(_)));
    assert_eq!(manager.status(&output).state, VerificationState::Disconnected);
    assert!(manager.connections().is_empty());
}

#[test]
fn test_identity_request_failure_is_swallowed() {
    let (transport, manager, _rx) = setup();
    let (_, output) = transport.add_device("JD-Xi");
    transport.fail_sends_to(&output);

    let status = manager.connect(&output, ConnectOptions::default()).unwrap();
    assert_eq!(status.state, VerificationState::ConnectedUnverified);
}

#[test]
fn test_reconnect_same_pairing_is_noop() {
    let (transport, manager, _rx) = setup();
    let (input, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();
    manager.connect(&output, ConnectOptions::default()).unwrap();

    assert_eq!(transport.listener_count(&input), 1);
    assert_eq!(transport.sent_to(&output).len(), 1);
}

#[test]
fn test_disconnect_closes_ports() {
    let (transport, manager, _rx) = setup();
    let (input, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();

    manager.disconnect(&output).unwrap();
    assert!(!transport.is_open(&output, PortKind::Output));
    assert!(!transport.is_open(&input, PortKind::Input));
    assert_eq!(transport.listener_count(&input), 0);
    assert_eq!(manager.status(&output).state, VerificationState::Disconnected);

    let err = manager.disconnect(&output).unwrap_err();
    assert!(matches!(err, AtlasError::NotFound(_)));
}

// ----- Sending -----

#[test]
fn test_send_sysex_rejects_unterminated_frame() {
    let (transport, manager, _rx) = setup();
    let (_, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();
    transport.clear_sent();

    let err = manager.send_sysex(&output, &[0xF0, 0x43, 0x12]).unwrap_err();
    assert!(matches!(err, AtlasError::InvalidInput(_)));
    assert!(transport.sent().is_empty());

    manager.send_sysex(&output, &SHORT_DUMP).unwrap();
    assert_eq!(transport.sent_to(&output), vec![SHORT_DUMP.to_vec()]);
}

#[test]
fn test_send_patch_splits_frames_and_marks_used() {
    let (transport, manager, _rx) = setup();
    let library = with_library(&manager);
    let (_, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();
    transport.clear_sent();

    let mut dump = SHORT_DUMP.to_vec();
    dump.extend_from_slice(&[0xF0, 0x41, 0x20, 0x01, 0xF7]);
    let patch = library
        .save_patch(crate::library::NewPatch::hardware("Pad", "JD-Xi").with_sysex(dump))
        .unwrap();

    assert_eq!(manager.send_patch(&output, &patch.id).unwrap(), 2);
    assert_eq!(
        transport.sent_to(&output),
        vec![SHORT_DUMP.to_vec(), vec![0xF0, 0x41, 0x20, 0x01, 0xF7]]
    );
    assert!(library.get_patch(&patch.id).unwrap().last_used.is_some());
}

#[test]
fn test_send_patch_without_sysex() {
    let (transport, manager, _rx) = setup();
    let library = with_library(&manager);
    let (_, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();

    let patch = library
        .save_patch(crate::library::NewPatch::hardware("Empty", "JD-Xi"))
        .unwrap();
    let err = manager.send_patch(&output, &patch.id).unwrap_err();
    assert!(matches!(err, AtlasError::InvalidInput(_)));
}

// ----- Import capture -----

#[test]
fn test_capture_and_save() {
    let (transport, manager, rx) = setup();
    let library = with_library(&manager);
    transport.add_port("X", "X", PortKind::Input);

    let snapshot = manager.start_import("X").unwrap();
    assert_eq!(snapshot.device_name, "X");
    assert!(snapshot.started);

    transport.inject("X", &SHORT_DUMP);
    transport.inject("X", &NOTE_ON);
    transport.inject("X", &[0xF0, 0x01]);
    transport.inject("X", &[0xF0, 0x42, 0x30, 0x00, 0xF7]);
    transport.inject("X", &SHORT_DUMP);
    assert_eq!(manager.import_count("X"), 3);

    let summary = manager.save_import("X", &ImportOptions::default()).unwrap();
    assert_eq!(summary.saved, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(manager.import_count("X"), 0);
    assert!(manager.import_status("X").is_none());

    let patches = library.list_patches(&PatchFilter::device("X")).unwrap();
    let names: Vec<&str> = patches.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Imported X #001", "Imported X #002", "Imported X #003"]);
    assert!(patches.iter().all(|p| p.category == "Imported"));
    assert!(patches.iter().all(|p| p.tags.contains(&"sysex".to_string())));
    assert_eq!(patches[1].sysex.as_deref(), Some(&[0xF0, 0x42, 0x30, 0x00, 0xF7][..]));

    let statuses = import_statuses(&drain(&rx));
    assert_eq!(
        statuses,
        vec![
            (ImportStatus::Started, 0),
            (ImportStatus::Capturing, 1),
            (ImportStatus::Capturing, 2),
            (ImportStatus::Capturing, 3),
            (ImportStatus::Saved, 3),
        ]
    );
}

#[test]
fn test_capture_reports_frame_length() {
    let (transport, manager, rx) = setup();
    transport.add_port("X", "X", PortKind::Input);
    manager.start_import("X").unwrap();
    transport.inject("X", &[0xF0, 0x42, 0x30, 0x00, 0xF7]);

    let last_bytes = drain(&rx).into_iter().find_map(|e| match e {
        SessionEvent::Import(p) if p.status == ImportStatus::Capturing => p.last_bytes,
        _ => None,
    });
    assert_eq!(last_bytes, Some(5));
}

#[test]
fn test_stop_keeps_buffer_and_ignores_later_frames() {
    let (transport, manager, _rx) = setup();
    transport.add_port("X", "X", PortKind::Input);
    manager.start_import("X").unwrap();
    transport.inject("X", &SHORT_DUMP);

    let snapshot = manager.stop_import("X").unwrap();
    assert!(!snapshot.started);
    assert_eq!(snapshot.count, 1);

    transport.inject("X", &SHORT_DUMP);
    assert_eq!(manager.import_count("X"), 1);
}

#[test]
fn test_restart_discards_previous_frames() {
    let (transport, manager, _rx) = setup();
    transport.add_port("X", "X", PortKind::Input);
    manager.start_import("X").unwrap();
    transport.inject("X", &SHORT_DUMP);

    manager.start_import("X").unwrap();
    assert_eq!(manager.import_count("X"), 0);
    assert_eq!(transport.listener_count("X"), 1);

    transport.inject("X", &SHORT_DUMP);
    assert_eq!(manager.import_count("X"), 1);
}

#[test]
fn test_import_uses_paired_input_and_device_name() {
    let (transport, manager, _rx) = setup();
    let library = with_library(&manager);
    let (input, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();

    let snapshot = manager.start_import(&output).unwrap();
    assert_eq!(snapshot.device_name, "JD-Xi");
    transport.inject(&input, &SHORT_DUMP);

    let options = ImportOptions {
        base_name: Some("Factory".to_string()),
        extra_tags: vec!["bank-a".to_string()],
    };
    let summary = manager.save_import(&output, &options).unwrap();
    let patch = library.get_patch(&summary.patch_ids[0]).unwrap();
    assert_eq!(patch.name, "Factory #001");
    assert_eq!(patch.device, "JD-Xi");
    assert!(patch.tags.contains(&"bank-a".to_string()));
}

#[test]
fn test_save_without_library_keeps_session() {
    let (transport, manager, _rx) = setup();
    transport.add_port("X", "X", PortKind::Input);
    manager.start_import("X").unwrap();
    transport.inject("X", &SHORT_DUMP);

    let err = manager.save_import("X", &ImportOptions::default()).unwrap_err();
    assert!(matches!(err, AtlasError::NotInitialized));
    assert_eq!(manager.import_count("X"), 1);
}

#[test]
fn test_save_unknown_session() {
    let (_transport, manager, _rx) = setup();
    with_library(&manager);
    let err = manager.save_import("nope", &ImportOptions::default()).unwrap_err();
    assert!(matches!(err, AtlasError::NotFound(_)));
}

// ----- Audition thru -----

#[test]
fn test_thru_forwards_channel_voice_only() {
    let (transport, manager, rx) = setup();
    let (input, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();
    transport.clear_sent();

    let status = manager.start_thru(&output, ThruOptions::default()).unwrap();
    assert!(status.active);
    assert_eq!(status.input_id.as_deref(), Some(input.as_str()));
    assert_eq!(status.duration_ms, Some(25_000));

    for message in [&NOTE_ON[..], &SHORT_DUMP[..], &PROGRAM_CHANGE[..], &CLOCK[..], &CONTROL_CHANGE[..]] {
        transport.inject(&input, message);
    }
    assert_eq!(
        transport.sent_to(&output),
        vec![NOTE_ON.to_vec(), CONTROL_CHANGE.to_vec()]
    );
    assert_eq!(thru_statuses(&drain(&rx)), vec![ThruStatus::Started]);
}

#[test]
fn test_thru_duration_is_clamped() {
    let (transport, manager, _rx) = setup();
    let (_, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();

    let status = manager
        .start_thru(&output, ThruOptions::duration(5_000_000))
        .unwrap();
    assert_eq!(status.duration_ms, Some(120_000));
}

#[test]
fn test_thru_prefers_recently_active_input() {
    let (transport, manager, _rx) = setup();
    let (_, out_a) = transport.add_device("A");
    let (in_b, out_b) = transport.add_device("B");
    manager.connect(&out_a, ConnectOptions::default()).unwrap();
    manager.connect(&out_b, ConnectOptions::default()).unwrap();

    transport.inject(&in_b, &NOTE_ON);
    let status = manager.start_thru(&out_a, ThruOptions::default()).unwrap();
    assert_eq!(status.input_id.as_deref(), Some(in_b.as_str()));
}

#[test]
fn test_thru_without_candidate_input_fails() {
    let (transport, manager, _rx) = setup();
    let (_, output) = transport.add_device("JD-Xi");

    let err = manager.start_thru(&output, ThruOptions::default()).unwrap_err();
    assert!(matches!(err, AtlasError::NotFound(_)));
    assert!(!manager.thru_status().active);
}

#[test]
fn test_stop_thru_removes_forwarding() {
    let (transport, manager, rx) = setup();
    let (input, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();
    manager.start_thru(&output, ThruOptions::default()).unwrap();
    assert_eq!(transport.listener_count(&input), 2);

    assert!(manager.stop_thru());
    assert!(!manager.stop_thru());
    assert_eq!(transport.listener_count(&input), 1);

    transport.clear_sent();
    transport.inject(&input, &NOTE_ON);
    assert!(transport.sent_to(&output).is_empty());
    assert_eq!(
        thru_statuses(&drain(&rx)),
        vec![ThruStatus::Started, ThruStatus::Stopped]
    );
}

#[test]
fn test_stale_expiry_leaves_newer_session_running() {
    let (transport, manager, rx) = setup();
    let (_, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();

    manager.start_thru(&output, ThruOptions::default()).unwrap();
    let first = manager.current_thru_generation().unwrap();
    manager.start_thru(&output, ThruOptions::default()).unwrap();
    let second = manager.current_thru_generation().unwrap();
    assert_ne!(first, second);

    assert!(!manager.expire_thru_generation(first));
    assert!(manager.thru_status().active);

    assert!(manager.expire_thru_generation(second));
    assert!(!manager.thru_status().active);
    assert_eq!(
        thru_statuses(&drain(&rx)),
        vec![
            ThruStatus::Started,
            ThruStatus::Stopped,
            ThruStatus::Started,
            ThruStatus::Expired
        ]
    );
}

#[test]
fn test_disconnect_stops_thru_on_that_output() {
    let (transport, manager, _rx) = setup();
    let (_, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();
    manager.start_thru(&output, ThruOptions::default()).unwrap();

    manager.disconnect(&output).unwrap();
    assert!(!manager.thru_status().active);
}

#[test]
fn test_disconnect_keeps_shared_input_for_capture_and_thru() {
    let (transport, manager, rx) = setup();
    let (in_a, out_a) = transport.add_device("A");
    let (_, out_b) = transport.add_device("B");
    manager.connect(&out_a, ConnectOptions::default()).unwrap();
    manager.connect(&out_b, ConnectOptions::default()).unwrap();

    manager.start_import(&out_a).unwrap();
    transport.inject(&in_a, &CONTROL_CHANGE);
    let status = manager.start_thru(&out_b, ThruOptions::default()).unwrap();
    assert_eq!(status.input_id.as_deref(), Some(in_a.as_str()));

    manager.disconnect(&out_a).unwrap();
    assert!(!transport.is_open(&out_a, PortKind::Output));
    assert!(transport.is_open(&in_a, PortKind::Input));

    transport.clear_sent();
    transport.inject(&in_a, &SHORT_DUMP);
    transport.inject(&in_a, &NOTE_ON);
    assert_eq!(manager.import_count(&out_a), 1);
    assert_eq!(transport.sent_to(&out_b), vec![NOTE_ON.to_vec()]);
    assert!(manager.thru_status().active);
    assert_eq!(thru_statuses(&drain(&rx)), vec![ThruStatus::Started]);
}

// ----- Event sink -----

#[test]
fn test_panicking_sink_does_not_break_capture() {
    let transport = VirtualTransport::new();
    let sink: Arc<dyn EventSink> = Arc::new(|_event: &SessionEvent| {
        panic!("sink failure");
    });
    let manager = DeviceSessionManager::new(Arc::new(transport.clone()), sink);
    transport.add_port("X", "X", PortKind::Input);

    manager.start_import("X").unwrap();
    transport.inject("X", &SHORT_DUMP);
    transport.inject("X", &SHORT_DUMP);
    assert_eq!(manager.import_count("X"), 2);
}

#[test]
fn test_shutdown_releases_everything() {
    let (transport, manager, _rx) = setup();
    let (input, output) = transport.add_device("JD-Xi");
    manager.connect(&output, ConnectOptions::default()).unwrap();
    manager.start_import(&output).unwrap();
    manager.start_thru(&output, ThruOptions::default()).unwrap();
    assert_eq!(transport.listener_count(&input), 3);

    manager.shutdown();
    assert_eq!(transport.listener_count(&input), 0);
    assert!(manager.connections().is_empty());
    assert!(!transport.is_open(&output, PortKind::Output));
}
