//! Run lifecycle tests against the scripted mock controller.

use daq_core::listfile::{SectionType, END_MARKER, PAUSE_ACTION_PAUSE, PAUSE_ACTION_RESUME};
use daq_core::{
    ControllerKind, DaqError, DaqState, EventConfig, HardwareErrorKind, ModuleConfig,
    TriggerCondition,
};
use daq_pool::BufferPool;
use daq_readout::{
    spawn_consumer, ControllerCall, ListfileSetup, MockController, MockHandle, MockOperation,
    MockRead, MockScriptExecutor, ReadoutSettings, ReadoutWorker, RunSetup, SectionCounter,
};
use daq_storage::{ListfileFormat, ListfileReader};
use std::path::Path;
use std::time::{Duration, Instant};

fn events() -> Vec<EventConfig> {
    vec![
        EventConfig::new("main", 0, TriggerCondition::Nim1)
            .with_module(ModuleConfig::new("adc", 3)),
        EventConfig::new("scaler", 1, TriggerCondition::Periodic)
            .with_module(ModuleConfig::new("counter", 7)),
    ]
}

/// VMUSB buffer with one event on stack 0 and one on stack 1.
fn vmusb_buffer() -> Vec<u8> {
    let mut bytes = (0x8000u16 | 2).to_le_bytes().to_vec();
    for (stack, words) in [(0u16, vec![0x11, 0x22, END_MARKER]), (1, vec![0x33, END_MARKER])] {
        let header = (stack << 13) | (words.len() as u16 * 2);
        bytes.extend_from_slice(&header.to_le_bytes());
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
    }
    bytes.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
    bytes
}

fn settings() -> ReadoutSettings {
    ReadoutSettings {
        read_buffer_size: 4096,
        read_timeout: Duration::from_millis(20),
        drain_timeout: Duration::from_millis(5),
        acquire_timeout: Duration::from_millis(10),
        timetick_interval: None,
        ..ReadoutSettings::default()
    }
}

fn worker(pool_size: usize, settings: ReadoutSettings) -> (ReadoutWorker, MockHandle) {
    let mock = MockController::new(ControllerKind::Vmusb);
    let handle = mock.handle();
    let scripts = MockScriptExecutor::new(handle.clone());
    let pool = BufferPool::new(pool_size, 16 * 1024);
    let worker = ReadoutWorker::new(Box::new(mock), Box::new(scripts), pool, settings);
    (worker, handle)
}

fn setup(name: &str) -> RunSetup {
    RunSetup {
        run_name: name.to_string(),
        events: events(),
        config: br#"{"events": 2}"#.to_vec(),
        ..RunSetup::default()
    }
}

fn zip_listfile(path: &Path) -> Option<ListfileSetup> {
    Some(ListfileSetup {
        path: path.to_path_buf(),
        format: ListfileFormat::Zip,
        compression_level: Some(1),
    })
}

fn wait_for_state(worker: &ReadoutWorker, state: DaqState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while worker.state() != state {
        assert!(Instant::now() < deadline, "timed out waiting for {:?}", state);
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn test_start_stop_returns_to_idle() {
    let (worker, handle) = worker(4, settings());
    worker.start(setup("start_stop")).unwrap();
    assert_eq!(worker.state(), DaqState::Running);
    assert!(handle.in_daq_mode());

    let summary = worker.stop_and_wait().unwrap();
    assert_eq!(worker.state(), DaqState::Idle);
    assert!(!handle.in_daq_mode());
    assert!(summary.listfile.is_none());
    assert!(summary.stats.end_time.is_some());
    assert_eq!(handle.count(&ControllerCall::UploadStack(0)), 1);
    assert_eq!(handle.count(&ControllerCall::UploadStack(1)), 1);
}

#[test]
fn test_trigger_conflict_rejected_before_hardware_access() {
    let (worker, handle) = worker(4, settings());
    let mut run = setup("conflict");
    run.events[1].trigger = TriggerCondition::Nim1;

    let err = worker.start(run).unwrap_err();
    assert!(matches!(err, DaqError::TriggerConflict { .. }), "{err}");
    assert_eq!(worker.state(), DaqState::Idle);
    assert!(handle.calls().iter().all(|call| !call.is_mutation()));
}

#[test]
fn test_start_while_running_is_rejected() {
    let (worker, _handle) = worker(4, settings());
    worker.start(setup("first")).unwrap();
    let err = worker.start(setup("second")).unwrap_err();
    assert!(matches!(err, DaqError::InvalidStateTransition { .. }));
    worker.stop_and_wait().unwrap();
}

#[test]
fn test_init_script_failure_leaves_worker_usable() {
    let (worker, handle) = worker(4, settings());
    handle.fail(MockOperation::RunScript);
    let mut run = setup("broken");
    run.init_scripts = vec!["global_init".to_string()];

    match worker.start(run.clone()) {
        Err(DaqError::Hardware(err)) => assert_eq!(err.kind, HardwareErrorKind::InitScript),
        other => panic!("unexpected start result: {other:?}"),
    }
    assert_eq!(worker.state(), DaqState::Idle);
    assert!(!handle.in_daq_mode());
    assert!(worker.log().joined().contains("Run start failed"));

    handle.clear_failures();
    worker.start(run).unwrap();
    worker.stop_and_wait().unwrap();
    assert_eq!(handle.count(&ControllerCall::RunScript("global_init".into())), 2);
}

#[test]
fn test_pause_and_resume_only_in_matching_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("paused.zip");
    let (worker, handle) = worker(4, settings());
    assert!(!worker.pause());
    assert!(!worker.resume());

    let mut run = setup("paused");
    run.listfile = zip_listfile(&path);
    worker.start(run).unwrap();
    assert!(!worker.resume());

    assert!(worker.pause());
    wait_for_state(&worker, DaqState::Paused);
    assert!(!handle.in_daq_mode());
    assert!(!worker.pause());

    assert!(worker.resume());
    wait_for_state(&worker, DaqState::Running);
    assert!(handle.in_daq_mode());
    worker.stop_and_wait().unwrap();

    let reader = ListfileReader::open(&path).unwrap();
    let actions: Vec<u32> = reader
        .sections()
        .unwrap()
        .iter()
        .filter(|s| s.header.section_type == SectionType::Pause)
        .map(|s| s.body[0])
        .collect();
    assert_eq!(actions, vec![PAUSE_ACTION_PAUSE, PAUSE_ACTION_RESUME]);
}

#[test]
fn test_read_timeout_recovers_and_drains_late_data() {
    let (worker, handle) = worker(4, ReadoutSettings {
        max_cycles: Some(1),
        ..settings()
    });
    handle.push_read(MockRead::Timeout);
    handle.push_data(vmusb_buffer());

    worker.start(setup("slow")).unwrap();
    let summary = worker.wait().unwrap();

    assert_eq!(summary.stats.read_timeouts, 1);
    assert_eq!(summary.stats.buffers_read, 1);
    assert_eq!(summary.stats.events_decoded, 2);
    // start + re-enter after the timeout
    assert_eq!(handle.count(&ControllerCall::EnterDaqMode), 2);
    // timeout recovery + stop
    assert_eq!(handle.count(&ControllerCall::LeaveDaqMode), 2);
    assert!(!worker.log().joined().contains("No data from controller"));
    worker.pool().recycle_filled();
}

#[test]
fn test_repeated_timeouts_warn_once_and_keep_running() {
    let (worker, handle) = worker(4, ReadoutSettings {
        error_log_interval: Duration::from_secs(3600),
        ..settings()
    });

    worker.start(setup("silent")).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while worker.stats().read_timeouts < 3 {
        assert!(Instant::now() < deadline, "timed out waiting for read timeouts");
        std::thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(worker.state(), DaqState::Running);
    assert!(handle.in_daq_mode());
    let summary = worker.stop_and_wait().unwrap();
    assert!(summary.stats.read_timeouts >= 3);
    assert_eq!(summary.stats.buffers_read, 0);
    assert_eq!(worker.log().joined().matches("No data from controller").count(), 1);
}

#[test]
fn test_stop_while_paused_closes_listfile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stopped_paused.zip");
    let (worker, handle) = worker(4, settings());
    handle.push_data(vmusb_buffer());

    let mut run = setup("stopped_paused");
    run.listfile = zip_listfile(&path);
    worker.start(run).unwrap();
    assert!(worker.pause());
    wait_for_state(&worker, DaqState::Paused);

    assert!(worker.stop());
    let summary = worker.wait().unwrap();
    assert_eq!(worker.state(), DaqState::Idle);
    assert!(!handle.in_daq_mode());
    assert!(summary.listfile.is_some());
    worker.pool().recycle_filled();

    let reader = ListfileReader::open(&path).unwrap();
    let sections = reader.sections().unwrap();
    assert_eq!(sections.last().unwrap().header.section_type, SectionType::End);
    let actions: Vec<u32> = sections
        .iter()
        .filter(|s| s.header.section_type == SectionType::Pause)
        .map(|s| s.body[0])
        .collect();
    assert_eq!(actions, vec![PAUSE_ACTION_PAUSE]);
}

#[test]
fn test_bounded_run_writes_complete_zip_listfile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run042.zip");
    let (worker, handle) = worker(8, ReadoutSettings {
        max_cycles: Some(3),
        ..settings()
    });
    for _ in 0..3 {
        handle.push_data(vmusb_buffer());
    }

    let consumer = spawn_consumer(
        worker.pool().clone(),
        SectionCounter::new(),
        Duration::from_millis(5),
    )
    .unwrap();

    let mut run = setup("run042");
    run.listfile = zip_listfile(&path);
    run.analysis = Some(b"{\"histograms\": []}".to_vec());
    worker.start(run).unwrap();
    let summary = worker.wait().unwrap();
    let counter = consumer.shutdown().unwrap();

    assert_eq!(summary.stats.buffers_read, 3);
    assert_eq!(summary.stats.events_decoded, 6);
    assert_eq!(summary.stats.dropped_buffers, 0);
    assert_eq!(counter.buffers, 3);
    assert_eq!(counter.events[0], 3);
    assert_eq!(counter.events[1], 3);
    assert_eq!(counter.malformed_buffers, 0);
    assert_eq!(worker.pool().available(), 8);

    let listfile = summary.listfile.unwrap();
    assert_eq!(listfile.path, path);
    let reader = ListfileReader::open(&path).unwrap();
    assert_eq!(reader.read_config().unwrap(), br#"{"events": 2}"#.to_vec());
    let sections = reader.sections().unwrap();
    assert_eq!(sections.first().unwrap().header.section_type, SectionType::Config);
    assert_eq!(sections.last().unwrap().header.section_type, SectionType::End);

    let event_sections: Vec<_> = sections
        .iter()
        .filter(|s| s.header.section_type == SectionType::Event)
        .collect();
    assert_eq!(event_sections.len(), 6);
    let adc = event_sections[0].modules().unwrap();
    assert_eq!(adc.len(), 1);
    assert_eq!(adc[0].header.module_type, 3);
    assert_eq!(adc[0].payload, vec![0x11, 0x22]);

    assert!(reader.messages().unwrap().contains("finished"));
    assert_eq!(reader.analysis().unwrap(), b"{\"histograms\": []}");
}

#[test]
fn test_exhausted_pool_counts_dropped_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dropped.zip");
    let (worker, handle) = worker(1, ReadoutSettings {
        max_cycles: Some(3),
        ..settings()
    });
    for _ in 0..3 {
        handle.push_data(vmusb_buffer());
    }

    let mut run = setup("dropped");
    run.listfile = zip_listfile(&path);
    worker.start(run).unwrap();
    let summary = worker.wait().unwrap();

    assert_eq!(summary.stats.buffers_read, 3);
    assert_eq!(summary.stats.dropped_buffers, 2);
    assert_eq!(worker.pool().filled_len(), 1);

    // Dropped buffers are still persisted.
    let reader = ListfileReader::open(&path).unwrap();
    let events = reader
        .sections()
        .unwrap()
        .iter()
        .filter(|s| s.header.section_type == SectionType::Event)
        .count();
    assert_eq!(events, 6);
    assert_eq!(worker.pool().recycle_filled(), 1);
}

#[test]
fn test_fatal_read_error_aborts_run() {
    let (worker, handle) = worker(4, settings());
    handle.push_read(MockRead::Error("usb disconnected".into()));

    worker.start(setup("fatal")).unwrap();
    match worker.wait() {
        Err(DaqError::Hardware(err)) => assert_eq!(err.kind, HardwareErrorKind::Read),
        other => panic!("unexpected run result: {other:?}"),
    }
    assert_eq!(worker.state(), DaqState::Idle);
    assert!(worker.log().joined().contains("Run aborted"));
}

#[test]
fn test_state_changes_are_published() {
    let (worker, _handle) = worker(4, settings());
    let mut rx = worker.subscribe();
    assert_eq!(*rx.borrow_and_update(), DaqState::Idle);

    worker.start(setup("watched")).unwrap();
    assert!(rx.has_changed().unwrap());
    assert_ne!(*rx.borrow_and_update(), DaqState::Idle);

    worker.stop_and_wait().unwrap();
    assert_eq!(*rx.borrow_and_update(), DaqState::Idle);
}
