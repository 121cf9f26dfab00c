//! Explicit per-run context.
//!
//! Built once while the DAQ is `Starting` and handed by reference to every
//! component taking part in the run.

use crate::error::DaqResult;
use crate::run_config::{validate_triggers, ControllerKind, EventConfig, StackMap};
use crate::run_log::RunLog;
use crate::stats::SharedStats;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct RunContext {
    pub controller: ControllerKind,
    pub run_name: String,
    pub events: Arc<Vec<EventConfig>>,
    pub stack_map: StackMap,
    pub started_at: DateTime<Utc>,
    pub stats: SharedStats,
    pub log: RunLog,
}

impl RunContext {
    /// Validate the event configuration and derive the stack map. Does not
    /// touch hardware, so configuration errors surface before any register
    /// write.
    pub fn prepare(
        controller: ControllerKind,
        run_name: impl Into<String>,
        events: Vec<EventConfig>,
        stats: SharedStats,
        log: RunLog,
    ) -> DaqResult<Self> {
        validate_triggers(&events)?;
        let stack_map = StackMap::build(controller, &events)?;
        Ok(Self {
            controller,
            run_name: run_name.into(),
            events: Arc::new(events),
            stack_map,
            started_at: Utc::now(),
            stats,
            log,
        })
    }

    /// Event configuration for a hardware stack id.
    pub fn event_for_stack(&self, stack_id: u8) -> Option<(usize, &EventConfig)> {
        let index = self.stack_map.event_index(stack_id)?;
        self.events.get(index).map(|event| (index, event))
    }
}
