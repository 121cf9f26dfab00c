//! Readout worker and DAQ state machine.
//!
//! [`ReadoutWorker::start`] runs the `Starting` sequence on the calling
//! thread so configuration and hardware errors are returned directly, then
//! hands the controller to a dedicated readout thread:
//!
//! ```text
//!  Idle ──start──▶ Starting ──ok──▶ Running ◀──resume── Paused
//!   ▲                 │               │  └────pause────────▲
//!   │               error            stop / cycle limit
//!   │                 │               ▼
//!   └─────────────────┴──────────── Stopping
//! ```
//!
//! The readout thread is the only writer of the listfile, the run statistics
//! and the published state. Every decoded buffer is written to the listfile
//! in read order; buffers that could not get a pool buffer are decoded into a
//! local overflow buffer, still persisted, and counted as dropped (not
//! delivered downstream).

use crate::controller::{read_or_timeout, ScriptExecutor, VmeController};
use crate::decoder::{DecodeSummary, FrameDecoder};
use daq_core::{
    DaqControl, DaqError, DaqRequest, DaqResult, DaqState, DecodeError, EventConfig,
    HardwareErrorKind, LogThrottle, RunContext, RunLog, RunStatistics, SharedStats,
};
use daq_pool::{BufferFormat, BufferPool, RawBuffer};
use daq_storage::{ListfileFormat, ListfileSummary, ListfileWriter};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Poll interval of the readout thread while paused.
const PAUSE_POLL: Duration = Duration::from_millis(20);

/// Runtime knobs of the readout loop.
#[derive(Debug, Clone)]
pub struct ReadoutSettings {
    /// Size of the raw read buffer (largest single bulk read).
    pub read_buffer_size: usize,
    pub read_timeout: Duration,
    /// Read timeout while draining after leaving DAQ mode.
    pub drain_timeout: Duration,
    /// How long to wait for a free pool buffer before using the local
    /// overflow buffer.
    pub acquire_timeout: Duration,
    /// Minimum interval between repeated soft-error log messages.
    pub error_log_interval: Duration,
    /// Timetick section interval; `None` disables timeticks.
    pub timetick_interval: Option<Duration>,
    /// Consecutive failed buffers before a health warning (0 disables).
    pub health_warning_threshold: u64,
    /// VMUSB buffer header words (1 or 2).
    pub vmusb_header_words: usize,
    /// Stop after this many readout cycles (bounded test and replay runs).
    pub max_cycles: Option<u64>,
}

impl Default for ReadoutSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: 256 * 1024,
            read_timeout: Duration::from_millis(500),
            drain_timeout: Duration::from_millis(100),
            acquire_timeout: Duration::from_millis(250),
            error_log_interval: Duration::from_secs(5),
            timetick_interval: Some(Duration::from_secs(1)),
            health_warning_threshold: 100,
            vmusb_header_words: 1,
            max_cycles: None,
        }
    }
}

/// Where and how to write the run's listfile.
#[derive(Debug, Clone)]
pub struct ListfileSetup {
    pub path: PathBuf,
    pub format: ListfileFormat,
    pub compression_level: Option<i64>,
}

/// Everything needed to start one run.
#[derive(Debug, Clone, Default)]
pub struct RunSetup {
    pub run_name: String,
    pub events: Vec<EventConfig>,
    /// Global init scripts, run before the per-module scripts.
    pub init_scripts: Vec<String>,
    /// `None` runs without a listfile.
    pub listfile: Option<ListfileSetup>,
    /// Serialized run configuration stored in the listfile's config sections.
    pub config: Vec<u8>,
    /// Serialized analysis configuration stored at run end.
    pub analysis: Option<Vec<u8>>,
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stats: RunStatistics,
    pub listfile: Option<ListfileSummary>,
}

type ControllerSlot = Arc<Mutex<Option<Box<dyn VmeController>>>>;

/// Owns the controller between runs and the readout thread during a run.
pub struct ReadoutWorker {
    control: Arc<DaqControl>,
    stats: SharedStats,
    log: RunLog,
    pool: BufferPool,
    settings: ReadoutSettings,
    controller: ControllerSlot,
    scripts: Mutex<Box<dyn ScriptExecutor>>,
    thread: Mutex<Option<JoinHandle<DaqResult<RunSummary>>>>,
}

impl std::fmt::Debug for ReadoutWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadoutWorker")
            .field("state", &self.control.state())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ReadoutWorker {
    pub fn new(
        controller: Box<dyn VmeController>,
        scripts: Box<dyn ScriptExecutor>,
        pool: BufferPool,
        settings: ReadoutSettings,
    ) -> Self {
        Self {
            control: Arc::new(DaqControl::new()),
            stats: SharedStats::new(),
            log: RunLog::new(),
            pool,
            settings,
            controller: Arc::new(Mutex::new(Some(controller))),
            scripts: Mutex::new(scripts),
            thread: Mutex::new(None),
        }
    }

    /// Use `log` (e.g. one with a UI callback) for run messages.
    pub fn with_log(mut self, log: RunLog) -> Self {
        self.log = log;
        self
    }

    pub fn state(&self) -> DaqState {
        self.control.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<DaqState> {
        self.control.subscribe()
    }

    /// Snapshot of the current (or last) run's statistics.
    pub fn stats(&self) -> RunStatistics {
        self.stats.snapshot()
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn settings(&self) -> &ReadoutSettings {
        &self.settings
    }

    /// Start a run. Only valid while `Idle`.
    ///
    /// Validation, stack upload, init scripts, listfile creation and entering
    /// DAQ mode happen before this returns; any failure leaves the worker
    /// `Idle` and is returned here.
    pub fn start(&self, setup: RunSetup) -> DaqResult<()> {
        let state = self.control.state();
        if state != DaqState::Idle {
            return Err(DaqError::InvalidStateTransition {
                state,
                action: "start",
            });
        }
        if let Some(previous) = self.thread.lock().take() {
            // Previous run finished without anyone waiting for it.
            if let Ok(Err(err)) = previous.join() {
                debug!(%err, "previous run ended with error");
            }
        }
        let Some(mut controller) = self.controller.lock().take() else {
            return Err(DaqError::ReadoutThread(
                "controller is still owned by a previous run".to_string(),
            ));
        };

        self.control.clear_request();
        self.control.set_state(DaqState::Starting);
        self.stats.reset();
        self.log.clear();

        let prepared = match self.prepare(controller.as_mut(), setup) {
            Ok(prepared) => prepared,
            Err(err) => {
                self.log.error(format!("Run start failed: {}", err));
                *self.controller.lock() = Some(controller);
                self.control.set_state(DaqState::Idle);
                return Err(err);
            }
        };
        *self.controller.lock() = Some(controller);

        self.control.set_state(DaqState::Running);
        let slot = Arc::clone(&self.controller);
        let control = Arc::clone(&self.control);
        let pool = self.pool.clone();
        let settings = self.settings.clone();
        let spawned = thread::Builder::new()
            .name("vme-readout".to_string())
            .spawn(move || {
                let Some(controller) = slot.lock().take() else {
                    control.set_state(DaqState::Idle);
                    return Err(DaqError::ReadoutThread("controller missing".to_string()));
                };
                let mut readout =
                    ReadoutLoop::new(controller, prepared, pool, settings, Arc::clone(&control));
                let result = readout.run();
                *slot.lock() = Some(readout.controller);
                control.set_state(DaqState::Idle);
                result
            });

        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                if let Some(controller) = self.controller.lock().as_mut() {
                    if let Err(leave_err) = controller.leave_daq_mode() {
                        warn!(%leave_err, "leaving DAQ mode failed");
                    }
                }
                self.control.set_state(DaqState::Idle);
                Err(DaqError::ReadoutThread(err.to_string()))
            }
        }
    }

    fn prepare(&self, controller: &mut dyn VmeController, setup: RunSetup) -> DaqResult<PreparedRun> {
        let kind = controller.kind();
        // No hardware access before the configuration is known to be valid.
        let ctx = RunContext::prepare(
            kind,
            setup.run_name,
            setup.events,
            self.stats.clone(),
            self.log.clone(),
        )?;
        self.log.info(format!(
            "Starting run '{}' on {} with {} events",
            ctx.run_name,
            kind,
            ctx.events.len()
        ));

        if !controller.is_open() {
            controller
                .open()
                .map_err(|e| e.into_hardware(kind, HardwareErrorKind::Open))?;
        }

        for event in ctx.events.iter() {
            controller
                .upload_stack(event.stack_id, &event.stack_commands)
                .map_err(|e| e.into_hardware(kind, HardwareErrorKind::StackUpload))?;
        }

        {
            let mut scripts = self.scripts.lock();
            let module_scripts = ctx
                .events
                .iter()
                .flat_map(|event| event.modules.iter())
                .filter_map(|module| module.init_script.as_deref());
            for name in setup.init_scripts.iter().map(String::as_str).chain(module_scripts) {
                debug!(script = name, "running init script");
                scripts
                    .run_script(controller, name)
                    .map_err(|e| e.into_hardware(kind, HardwareErrorKind::InitScript))?;
            }
        }

        let writer = match &setup.listfile {
            Some(listfile) => {
                let mut writer =
                    ListfileWriter::create(&listfile.path, listfile.format, listfile.compression_level)?;
                writer.write_preamble()?;
                writer.write_config(&setup.config)?;
                self.log
                    .info(format!("Writing listfile {}", listfile.path.display()));
                Some(writer)
            }
            None => None,
        };

        controller
            .enter_daq_mode()
            .map_err(|e| e.into_hardware(kind, HardwareErrorKind::DaqMode))?;
        self.log.info("Entered DAQ mode");

        Ok(PreparedRun {
            ctx,
            writer,
            analysis: setup.analysis,
        })
    }

    /// Request a pause. No-op unless `Running`.
    pub fn pause(&self) -> bool {
        self.control.request_pause()
    }

    /// Request a resume. No-op unless `Paused`.
    pub fn resume(&self) -> bool {
        self.control.request_resume()
    }

    /// Request a stop. No-op while `Idle` or already `Stopping`.
    pub fn stop(&self) -> bool {
        self.control.request_stop()
    }

    /// Block until the readout thread has finished the run.
    pub fn wait(&self) -> DaqResult<RunSummary> {
        let handle = self
            .thread
            .lock()
            .take()
            .ok_or_else(|| DaqError::ReadoutThread("no run to wait for".to_string()))?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => {
                self.control.set_state(DaqState::Idle);
                Err(DaqError::ReadoutThread("readout thread panicked".to_string()))
            }
        }
    }

    pub fn stop_and_wait(&self) -> DaqResult<RunSummary> {
        self.stop();
        self.wait()
    }
}

impl Drop for ReadoutWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.get_mut().take() {
            self.control.request_stop();
            if handle.join().is_err() {
                warn!("readout thread panicked during shutdown");
            }
        }
    }
}

/// Output of the `Starting` sequence, moved into the readout thread.
struct PreparedRun {
    ctx: RunContext,
    writer: Option<ListfileWriter>,
    analysis: Option<Vec<u8>>,
}

/// State owned by the readout thread for one run.
struct ReadoutLoop {
    controller: Box<dyn VmeController>,
    ctx: RunContext,
    decoder: FrameDecoder,
    writer: Option<ListfileWriter>,
    analysis: Option<Vec<u8>>,
    pool: BufferPool,
    control: Arc<DaqControl>,
    settings: ReadoutSettings,
    read_buffer: RawBuffer,
    overflow: RawBuffer,
    buffer_number: u64,
    cycles: u64,
    failed_buffers_in_row: u64,
    last_timetick: Instant,
    timeout_throttle: LogThrottle,
    decode_throttle: LogThrottle,
    dropped_throttle: LogThrottle,
}

impl ReadoutLoop {
    fn new(
        controller: Box<dyn VmeController>,
        prepared: PreparedRun,
        pool: BufferPool,
        settings: ReadoutSettings,
        control: Arc<DaqControl>,
    ) -> Self {
        let decoder = FrameDecoder::for_run(&prepared.ctx, settings.vmusb_header_words);
        let interval = settings.error_log_interval;
        Self {
            controller,
            decoder,
            writer: prepared.writer,
            analysis: prepared.analysis,
            read_buffer: RawBuffer::new(usize::MAX, settings.read_buffer_size),
            overflow: RawBuffer::new(usize::MAX, pool.buffer_capacity()),
            ctx: prepared.ctx,
            pool,
            control,
            settings,
            buffer_number: 0,
            cycles: 0,
            failed_buffers_in_row: 0,
            last_timetick: Instant::now(),
            timeout_throttle: LogThrottle::new(interval),
            decode_throttle: LogThrottle::new(interval),
            dropped_throttle: LogThrottle::new(interval),
        }
    }

    fn run(&mut self) -> DaqResult<RunSummary> {
        match self.acquire() {
            Ok(()) => self.stop_run(),
            Err(err) => {
                self.abort(&err);
                Err(err)
            }
        }
    }

    /// Main loop; returns when a stop was requested or the cycle limit hit.
    fn acquire(&mut self) -> DaqResult<()> {
        info!(run = %self.ctx.run_name, "readout loop started");
        loop {
            match self.control.take_request() {
                DaqRequest::Stop => {
                    self.ctx.log.info("Stop requested");
                    return Ok(());
                }
                DaqRequest::Pause if self.control.state() == DaqState::Running => self.pause()?,
                DaqRequest::Resume if self.control.state() == DaqState::Paused => self.resume()?,
                _ => {}
            }

            self.maybe_timetick()?;

            if self.control.state() == DaqState::Paused {
                thread::sleep(PAUSE_POLL);
                continue;
            }

            if let Some(max_cycles) = self.settings.max_cycles {
                if self.cycles >= max_cycles {
                    self.ctx
                        .log
                        .info(format!("Cycle limit of {} reached", max_cycles));
                    return Ok(());
                }
            }
            self.cycles += 1;

            let bytes = self.read(self.settings.read_timeout)?;
            if bytes == 0 {
                self.recover_from_timeout()?;
            } else {
                self.process_buffer(bytes)?;
            }
        }
    }

    fn read(&mut self, timeout: Duration) -> DaqResult<usize> {
        let kind = self.ctx.controller;
        read_or_timeout(
            self.controller.as_mut(),
            self.read_buffer.as_mut_capacity(),
            timeout,
        )
        .map_err(|e| e.into_hardware(kind, HardwareErrorKind::Read).into())
    }

    fn leave_daq_mode(&mut self) -> DaqResult<()> {
        let kind = self.ctx.controller;
        self.controller
            .leave_daq_mode()
            .map_err(|e| e.into_hardware(kind, HardwareErrorKind::DaqMode).into())
    }

    fn enter_daq_mode(&mut self) -> DaqResult<()> {
        let kind = self.ctx.controller;
        self.controller
            .enter_daq_mode()
            .map_err(|e| e.into_hardware(kind, HardwareErrorKind::DaqMode).into())
    }

    /// A read returned no data: leave DAQ mode, drain, re-enter. Data
    /// showing up during the drain means the controller was just slow.
    fn recover_from_timeout(&mut self) -> DaqResult<()> {
        self.ctx.stats.update(|s| s.read_timeouts += 1);
        self.leave_daq_mode()?;
        let drained = self.drain()?;
        self.enter_daq_mode()?;

        if drained > 0 {
            debug!(drained, "data arrived while draining after read timeout");
            return Ok(());
        }
        if let Some(suppressed) = self.timeout_throttle.check(Instant::now()) {
            let timeouts = self.ctx.stats.snapshot().read_timeouts;
            let mut message = format!(
                "No data from controller within {} ms ({} read timeouts this run)",
                self.settings.read_timeout.as_millis(),
                timeouts
            );
            if suppressed > 0 {
                message.push_str(&format!(", {} similar messages suppressed", suppressed));
            }
            self.ctx.log.warn(message);
        }
        Ok(())
    }

    /// Read until the controller has nothing left. Returns the drained byte count.
    fn drain(&mut self) -> DaqResult<usize> {
        let mut total = 0;
        loop {
            let bytes = self.read(self.settings.drain_timeout)?;
            if bytes == 0 {
                return Ok(total);
            }
            total += bytes;
            self.process_buffer(bytes)?;
        }
    }

    /// Decode the freshly read bytes, persist and hand them downstream.
    fn process_buffer(&mut self, bytes: usize) -> DaqResult<()> {
        self.buffer_number += 1;
        let now = Instant::now();
        self.read_buffer.set_used(bytes);
        self.read_buffer.set_buffer_number(self.buffer_number);
        self.read_buffer
            .set_format(self.ctx.controller.buffer_format());
        self.ctx.stats.update(|s| s.record_read(bytes, now));

        let pooled = self.pool.acquire_free(self.settings.acquire_timeout);
        let is_pooled = pooled.is_some();
        let mut output = match pooled {
            Some(buffer) => buffer,
            None => std::mem::replace(&mut self.overflow, RawBuffer::new(usize::MAX, 0)),
        };
        output.clear();
        output.set_format(BufferFormat::Listfile);
        output.set_buffer_number(self.buffer_number);

        match self.decoder.decode(&self.read_buffer, &mut output) {
            Ok(summary) => self.record_decode(&summary),
            Err(err) => self.record_decode_error(&err),
        }

        let persisted = self.persist(&output);

        if is_pooled {
            if output.is_empty() || persisted.is_err() {
                self.pool.release(output);
            } else {
                self.pool.enqueue_filled(output);
            }
        } else {
            if !output.is_empty() {
                self.ctx.stats.update(|s| s.dropped_buffers += 1);
                if let Some(suppressed) = self.dropped_throttle.check(now) {
                    warn!(
                        buffer_number = self.buffer_number,
                        suppressed, "buffer pool exhausted, buffer not delivered downstream"
                    );
                }
            }
            self.overflow = output;
        }
        persisted
    }

    fn persist(&mut self, output: &RawBuffer) -> DaqResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        if output.is_empty() {
            return Ok(());
        }
        writer.write_buffer(output.as_slice())?;
        let written = writer.bytes_written();
        self.ctx.stats.update(|s| s.bytes_written = written);
        Ok(())
    }

    fn record_decode(&mut self, summary: &DecodeSummary) {
        self.ctx.stats.update(|s| {
            s.events_decoded += summary.events;
            s.skipped_events += summary.skipped_events;
            s.partial_events += summary.partial_events;
            s.frame_errors += summary.frame_errors;
            s.lost_packets += summary.lost_packets;
            s.system_events += summary.system_events;
            s.stack_errors += summary.stack_errors;
        });
        let problems = summary.skipped_events + summary.partial_events + summary.frame_errors;
        if summary.events == 0 && problems > 0 {
            self.note_failed_buffer();
        } else {
            self.failed_buffers_in_row = 0;
        }
    }

    fn record_decode_error(&mut self, err: &DecodeError) {
        self.ctx.stats.update(|s| s.buffers_with_errors += 1);
        if let Some(suppressed) = self.decode_throttle.check(Instant::now()) {
            let mut message = err.to_string();
            if suppressed > 0 {
                message.push_str(&format!(" ({} similar errors suppressed)", suppressed));
            }
            self.ctx.log.warn(message);
        }
        self.note_failed_buffer();
    }

    fn note_failed_buffer(&mut self) {
        self.failed_buffers_in_row += 1;
        let threshold = self.settings.health_warning_threshold;
        if threshold > 0 && self.failed_buffers_in_row == threshold {
            self.ctx.log.warn(format!(
                "The last {} buffers all failed to decode; check the readout configuration",
                threshold
            ));
        }
    }

    fn maybe_timetick(&mut self) -> DaqResult<()> {
        let Some(interval) = self.settings.timetick_interval else {
            return Ok(());
        };
        if self.last_timetick.elapsed() < interval {
            return Ok(());
        }
        self.last_timetick = Instant::now();
        if let Some(writer) = self.writer.as_mut() {
            writer.write_timetick()?;
        }
        Ok(())
    }

    fn pause(&mut self) -> DaqResult<()> {
        self.leave_daq_mode()?;
        self.drain()?;
        if let Some(writer) = self.writer.as_mut() {
            writer.write_pause(true)?;
        }
        self.control.set_state(DaqState::Paused);
        self.ctx.log.info("DAQ paused");
        Ok(())
    }

    fn resume(&mut self) -> DaqResult<()> {
        // The controller restarts its stream on entering DAQ mode.
        self.decoder.reset();
        self.enter_daq_mode()?;
        if let Some(writer) = self.writer.as_mut() {
            writer.write_pause(false)?;
        }
        self.control.set_state(DaqState::Running);
        self.ctx.log.info("DAQ resumed");
        Ok(())
    }

    /// Orderly end of run: leave DAQ mode, drain, close the listfile.
    fn stop_run(&mut self) -> DaqResult<RunSummary> {
        self.control.set_state(DaqState::Stopping);
        match self.leave_daq_mode() {
            Ok(()) => match self.drain() {
                Ok(bytes) => debug!(bytes, "drained after leaving DAQ mode"),
                Err(err @ DaqError::Hardware(_)) => {
                    self.ctx.log.warn(format!("Drain after stop failed: {}", err));
                }
                Err(err) => {
                    self.abort(&err);
                    return Err(err);
                }
            },
            Err(err) => self.ctx.log.warn(format!("Leaving DAQ mode failed: {}", err)),
        }

        self.ctx.stats.update(|s| s.finalize());
        let stats = self.ctx.stats.snapshot();
        self.ctx.log.info(format!(
            "Run '{}' finished: {} buffers, {} events, {} errors",
            self.ctx.run_name,
            stats.buffers_read,
            stats.events_decoded,
            stats.buffers_with_errors
        ));

        let listfile = match self.writer.take() {
            Some(mut writer) => {
                writer.write_end_section()?;
                let summary = writer.finish(&self.ctx.log.joined(), self.analysis.as_deref())?;
                let written = summary.bytes_written;
                self.ctx.stats.update(|s| s.bytes_written = written);
                Some(summary)
            }
            None => None,
        };

        Ok(RunSummary {
            stats: self.ctx.stats.snapshot(),
            listfile,
        })
    }

    /// Fatal error: leave DAQ mode and close the listfile, both best-effort.
    fn abort(&mut self, err: &DaqError) {
        self.control.set_state(DaqState::Stopping);
        self.ctx.log.error(format!("Run aborted: {}", err));
        if let Err(leave_err) = self.controller.leave_daq_mode() {
            warn!(%leave_err, "leaving DAQ mode after fatal error failed");
        }
        self.ctx.stats.update(|s| s.finalize());
        if let Some(mut writer) = self.writer.take() {
            let closed = writer
                .write_end_section()
                .and_then(|()| writer.finish(&self.ctx.log.joined(), self.analysis.as_deref()));
            if let Err(close_err) = closed {
                warn!(%close_err, "closing listfile after fatal error failed");
            }
        }
    }
}
