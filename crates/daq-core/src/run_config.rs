//! Run configuration: events, triggers, module readout layout and the
//! stack id to event index mapping.
//!
//! These values come from the VME configuration, which is owned elsewhere;
//! this module only validates them and derives what the readout needs.

use crate::error::{DaqError, DaqResult};
use crate::listfile::MAX_EVENT_INDEX;
use daq_pool::BufferFormat;
use serde::{Deserialize, Serialize};

/// Controller family (and transport) used for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    Vmusb,
    MvlcUsb,
    MvlcEth,
}

impl ControllerKind {
    /// Number of command stacks the controller provides.
    pub fn stack_count(&self) -> u8 {
        match self {
            ControllerKind::Vmusb => 8,
            ControllerKind::MvlcUsb | ControllerKind::MvlcEth => 16,
        }
    }

    /// Lowest stack id usable for readout. MVLC stack 0 is reserved for
    /// direct command execution.
    pub fn first_readout_stack(&self) -> u8 {
        match self {
            ControllerKind::Vmusb => 0,
            ControllerKind::MvlcUsb | ControllerKind::MvlcEth => 1,
        }
    }

    pub fn buffer_format(&self) -> BufferFormat {
        match self {
            ControllerKind::Vmusb => BufferFormat::Vmusb,
            ControllerKind::MvlcUsb => BufferFormat::MvlcUsb,
            ControllerKind::MvlcEth => BufferFormat::MvlcEth,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControllerKind::Vmusb => "vmusb",
            ControllerKind::MvlcUsb => "mvlc_usb",
            ControllerKind::MvlcEth => "mvlc_eth",
        }
    }
}

impl std::fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Condition starting an event's readout stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerCondition {
    Interrupt { level: u8, vector: u8 },
    Nim1,
    Periodic,
    Timer { index: u8 },
    External { input: u8 },
}

impl TriggerCondition {
    /// Whether two events using these conditions would fight over one
    /// hardware trigger.
    pub fn conflicts_with(&self, other: &TriggerCondition) -> bool {
        match (self, other) {
            (
                TriggerCondition::Interrupt { level: l1, vector: v1 },
                TriggerCondition::Interrupt { level: l2, vector: v2 },
            ) => l1 == l2 && v1 == v2,
            (a, b) => a == b,
        }
    }
}

impl std::fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerCondition::Interrupt { level, vector } => {
                write!(f, "IRQ{} (vector {})", level, vector)
            }
            TriggerCondition::Nim1 => write!(f, "NIM1"),
            TriggerCondition::Periodic => write!(f, "periodic"),
            TriggerCondition::Timer { index } => write!(f, "timer {}", index),
            TriggerCondition::External { input } => write!(f, "external input {}", input),
        }
    }
}

/// Word layout of one module's data inside an MVLC stack frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleReadoutStructure {
    /// Fixed number of single-word reads before the block transfer.
    pub prefix_len: usize,
    /// Whether the module performs a block transfer.
    pub has_dynamic: bool,
    /// Fixed number of single-word reads after the block transfer.
    pub suffix_len: usize,
}

impl Default for ModuleReadoutStructure {
    fn default() -> Self {
        Self {
            prefix_len: 0,
            has_dynamic: true,
            suffix_len: 0,
        }
    }
}

impl ModuleReadoutStructure {
    pub fn is_empty(&self) -> bool {
        self.prefix_len == 0 && !self.has_dynamic && self.suffix_len == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub name: String,
    /// Module type id written to the sub-event header.
    pub module_type: u8,
    #[serde(default)]
    pub readout: ModuleReadoutStructure,
    /// Name of the module's init script, run before the DAQ starts.
    #[serde(default)]
    pub init_script: Option<String>,
}

impl ModuleConfig {
    pub fn new(name: impl Into<String>, module_type: u8) -> Self {
        Self {
            name: name.into(),
            module_type,
            readout: ModuleReadoutStructure::default(),
            init_script: None,
        }
    }

    pub fn with_readout(mut self, readout: ModuleReadoutStructure) -> Self {
        self.readout = readout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventConfig {
    pub name: String,
    /// Controller stack executing this event's readout.
    pub stack_id: u8,
    pub trigger: TriggerCondition,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    /// Opaque readout stack commands uploaded to the controller.
    #[serde(default)]
    pub stack_commands: Vec<u32>,
}

impl EventConfig {
    pub fn new(name: impl Into<String>, stack_id: u8, trigger: TriggerCondition) -> Self {
        Self {
            name: name.into(),
            stack_id,
            trigger,
            modules: Vec::new(),
            stack_commands: Vec::new(),
        }
    }

    pub fn with_module(mut self, module: ModuleConfig) -> Self {
        self.modules.push(module);
        self
    }
}

/// Reject events sharing a trigger condition. Reports the first conflicting
/// pair found, naming both events.
pub fn validate_triggers(events: &[EventConfig]) -> DaqResult<()> {
    for (i, first) in events.iter().enumerate() {
        for second in &events[i + 1..] {
            if first.trigger.conflicts_with(&second.trigger) {
                return Err(DaqError::TriggerConflict {
                    first: first.name.clone(),
                    second: second.name.clone(),
                    condition: first.trigger.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Bijective mapping of controller stack ids to logical event indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMap {
    by_stack: [Option<u8>; 16],
}

impl StackMap {
    /// Build the map for `events`, in configuration order (event index =
    /// position in `events`).
    pub fn build(kind: ControllerKind, events: &[EventConfig]) -> DaqResult<Self> {
        if events.len() > MAX_EVENT_INDEX + 1 {
            return Err(DaqError::Configuration(format!(
                "{} events configured, the listfile format allows at most {}",
                events.len(),
                MAX_EVENT_INDEX + 1
            )));
        }

        let mut by_stack = [None; 16];
        for (index, event) in events.iter().enumerate() {
            let stack = event.stack_id;
            if stack < kind.first_readout_stack() || stack >= kind.stack_count() {
                return Err(DaqError::Configuration(format!(
                    "event '{}' uses stack {} but {} readout stacks are {}..{}",
                    event.name,
                    stack,
                    kind,
                    kind.first_readout_stack(),
                    kind.stack_count()
                )));
            }
            if let Some(existing) = by_stack[stack as usize] {
                return Err(DaqError::DuplicateStackId {
                    stack_id: stack,
                    first: events[existing as usize].name.clone(),
                    second: event.name.clone(),
                });
            }
            by_stack[stack as usize] = Some(index as u8);
        }
        Ok(Self { by_stack })
    }

    pub fn event_index(&self, stack_id: u8) -> Option<usize> {
        self.by_stack
            .get(stack_id as usize)
            .copied()
            .flatten()
            .map(usize::from)
    }

    pub fn len(&self) -> usize {
        self.by_stack.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
