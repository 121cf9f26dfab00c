//! One complete run: pool, readout worker and downstream consumer wired
//! together.
//!
//! [`run_session`] drives any [`VmeController`]. [`replay_controller`] builds
//! a mock controller that plays back a raw capture, which is how the CLI
//! exercises the full pipeline without hardware.

use crate::config::Settings;
use daq_core::{ControllerKind, DaqError, DaqResult, DaqState};
use daq_pool::BufferPool;
use daq_readout::{
    spawn_consumer, MockController, NoopScriptExecutor, ReadoutWorker, RunSetup, RunSummary,
    ScriptExecutor, SectionCounter, VmeController,
};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Poll interval of the consumer thread.
const CONSUMER_POLL: Duration = Duration::from_millis(50);

/// Result of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub summary: RunSummary,
    /// What the downstream consumer saw.
    pub delivered: SectionCounter,
}

/// Run one session to completion.
///
/// With `max_cycles` the run stops by itself; without it the run lasts
/// until `stop` returns `true` (polled every 100 ms).
pub fn run_session(
    settings: &Settings,
    controller: Box<dyn VmeController>,
    scripts: Box<dyn ScriptExecutor>,
    setup: RunSetup,
    max_cycles: Option<u64>,
    stop: impl Fn() -> bool,
) -> DaqResult<SessionReport> {
    if controller.kind() != settings.controller {
        return Err(DaqError::Configuration(format!(
            "settings select {} but the controller is {}",
            settings.controller,
            controller.kind()
        )));
    }
    if let Some(listfile) = &setup.listfile {
        if let Some(dir) = listfile.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let pool = BufferPool::new(settings.pool.buffer_count, settings.pool.buffer_size);
    let readout = daq_readout::ReadoutSettings {
        max_cycles,
        ..settings.readout.to_settings()
    };
    let worker = ReadoutWorker::new(controller, scripts, pool.clone(), readout);
    let consumer = spawn_consumer(pool.clone(), SectionCounter::new(), CONSUMER_POLL)?;

    let result = worker.start(setup).and_then(|()| {
        if max_cycles.is_none() {
            while worker.state() != DaqState::Idle {
                if stop() {
                    worker.stop();
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        worker.wait()
    });
    let delivered = consumer.shutdown()?;
    let summary = result?;

    info!(
        buffers = summary.stats.buffers_read,
        events = summary.stats.events_decoded,
        delivered = delivered.buffers,
        dropped = summary.stats.dropped_buffers,
        "session finished"
    );
    Ok(SessionReport { summary, delivered })
}

/// Mock controller replaying `capture`, one scripted read per record.
///
/// A capture is a sequence of records, each a little-endian `u32` byte
/// length followed by that many bytes of raw controller data.
pub fn replay_controller(kind: ControllerKind, capture: &[u8]) -> DaqResult<(MockController, usize)> {
    let controller = MockController::new(kind);
    let handle = controller.handle();
    let mut records = 0;
    let mut pos = 0;
    while pos < capture.len() {
        let Some(len_bytes) = capture.get(pos..pos + 4) else {
            return Err(DaqError::Configuration(format!(
                "capture truncated in record header at byte {}",
                pos
            )));
        };
        let len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        let Some(data) = capture.get(pos + 4..pos + 4 + len) else {
            return Err(DaqError::Configuration(format!(
                "capture record at byte {} claims {} bytes, only {} left",
                pos,
                len,
                capture.len() - pos - 4
            )));
        };
        handle.push_data(data.to_vec());
        records += 1;
        pos += 4 + len;
    }
    Ok((controller, records))
}

/// Encode buffers in the capture format read by [`replay_controller`].
pub fn encode_capture<'a>(buffers: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for buffer in buffers {
        out.extend_from_slice(&(buffer.len() as u32).to_le_bytes());
        out.extend_from_slice(buffer);
    }
    out
}

/// Replay a capture file through the full pipeline, one cycle per record
/// unless `cycles` is given.
pub fn replay_file(settings: &Settings, input: &Path, cycles: Option<u64>) -> DaqResult<SessionReport> {
    let capture = std::fs::read(input)?;
    let (controller, records) = replay_controller(settings.controller, &capture)?;
    info!(records, input = %input.display(), "replaying capture");
    let setup = settings.run_setup()?;
    run_session(
        settings,
        Box::new(controller),
        Box::new(NoopScriptExecutor),
        setup,
        Some(cycles.unwrap_or(records as u64)),
        || false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_readout::ControllerCall;

    #[test]
    fn test_capture_records_become_reads() {
        let capture = encode_capture([&[1u8, 2, 3, 4][..], &[5, 6, 7, 8, 9, 10, 11, 12][..]]);
        let (controller, records) = replay_controller(ControllerKind::Vmusb, &capture).unwrap();
        assert_eq!(records, 2);
        assert_eq!(controller.handle().pending_reads(), 2);
        assert!(controller.handle().calls().is_empty());
        assert_eq!(controller.handle().count(&ControllerCall::BulkRead), 0);
    }

    #[test]
    fn test_truncated_capture_rejected() {
        let mut capture = encode_capture([&[1u8, 2, 3, 4][..]]);
        capture.truncate(6);
        assert!(replay_controller(ControllerKind::MvlcUsb, &capture).is_err());
        assert!(replay_controller(ControllerKind::MvlcUsb, &[1, 0]).is_err());
    }
}
