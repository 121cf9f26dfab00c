//! End-to-end replay: capture file -> mock controller -> decoder -> listfile
//! and consumer.

use daq_core::listfile::END_MARKER;
use daq_core::{ControllerKind, DaqError};
use daq_readout::{MockController, NoopScriptExecutor};
use daq_storage::{ListfileFormat, ListfileWriter};
use std::path::Path;
use vme_daq::{encode_capture, inspect_listfile, replay_file, run_session, Settings};

fn settings_toml(output_dir: &Path, format: &str) -> String {
    format!(
        r#"
controller = "mvlc_usb"

[pool]
buffer_count = 4
buffer_size = 65536

[readout]
read_buffer_size = 16384
read_timeout_ms = 20
drain_timeout_ms = 5
timetick_interval_ms = 0

[listfile]
output_dir = "{}"
run_name = "replay"
format = "{}"

[[events]]
name = "trigger"
stack_id = 1
trigger = {{ kind = "nim1" }}

[[events.modules]]
name = "mdpp16"
module_type = 10
"#,
        output_dir.display(),
        format
    )
}

fn words(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Three events on stack 1; the first straddles the two records.
fn capture() -> Vec<u8> {
    let first = words(&[0xf301_0004, 0xf500_0003, 0xa1, 0xa2]);
    let second = words(&[
        0xa3,
        0xf301_0003,
        0xf500_0002,
        0xb1,
        0xb2,
        0xf301_0002,
        0xf500_0001,
        0xc1,
    ]);
    encode_capture([first.as_slice(), second.as_slice()])
}

#[test]
fn test_replay_writes_listfile_and_feeds_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::from_toml(&settings_toml(dir.path(), "zip")).unwrap();
    let input = dir.path().join("run.capture");
    std::fs::write(&input, capture()).unwrap();

    let report = replay_file(&settings, &input, None).unwrap();
    let stats = &report.summary.stats;
    assert_eq!(stats.buffers_read, 2);
    assert_eq!(stats.events_decoded, 3);
    assert_eq!(stats.buffers_with_errors, 0);
    // The first record completes no event and produces no output buffer.
    assert_eq!(report.delivered.buffers, 1);
    assert_eq!(report.delivered.events[0], 3);

    let listfile = report.summary.listfile.unwrap();
    assert_eq!(listfile.format, ListfileFormat::Zip);
    let overview = inspect_listfile(&listfile.path).unwrap();
    assert_eq!(overview.events[0], 3);
    assert_eq!(overview.malformed_events, 0);
    assert!(overview.has_end);
    assert!(overview.config_bytes > 0);
    assert!(overview.messages.unwrap().contains("finished"));
}

#[test]
fn test_replay_plain_listfile_drains_on_stop() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::from_toml(&settings_toml(dir.path(), "plain")).unwrap();
    let input = dir.path().join("run.capture");
    std::fs::write(&input, capture()).unwrap();

    // One cycle reads the first record; the drain after stopping picks up
    // the second one.
    let report = replay_file(&settings, &input, Some(1)).unwrap();
    assert_eq!(report.summary.stats.buffers_read, 2);
    assert_eq!(report.summary.stats.events_decoded, 3);
    assert_eq!(report.summary.stats.read_timeouts, 0);

    let path = report.summary.listfile.unwrap().path;
    assert_eq!(path.extension().unwrap(), "mvmelst");
    assert!(path.with_extension("log").exists());
    let overview = inspect_listfile(&path).unwrap();
    assert_eq!(overview.total_events(), 3);
    assert!(overview.has_end);
}

#[test]
fn test_controller_kind_must_match_settings() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::from_toml(&settings_toml(dir.path(), "zip")).unwrap();
    let setup = settings.run_setup().unwrap();
    let err = run_session(
        &settings,
        Box::new(MockController::new(ControllerKind::Vmusb)),
        Box::new(NoopScriptExecutor),
        setup,
        Some(1),
        || false,
    )
    .unwrap_err();
    assert!(matches!(err, DaqError::Configuration(_)), "{err}");
}

#[test]
fn test_inspect_reports_missing_end_section() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aborted.mvmelst");
    let mut writer = ListfileWriter::create(&path, ListfileFormat::Plain, None).unwrap();
    writer.write_preamble().unwrap();
    writer.write_config(b"{}").unwrap();
    let event = words(&[0x4000_0004, 0x0200_0002, 0x42, END_MARKER, END_MARKER]);
    writer.write_buffer(&event).unwrap();
    writer.finish("", None).unwrap();

    let overview = inspect_listfile(&path).unwrap();
    assert_eq!(overview.events[0], 1);
    assert!(!overview.has_end);
    assert!(overview.to_string().contains("missing end section"));
}
