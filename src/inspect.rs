//! Listfile summary for the `inspect` command.

use daq_core::listfile::{SectionType, MAX_EVENT_INDEX};
use daq_core::DaqResult;
use daq_storage::ListfileReader;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListfileOverview {
    pub config_bytes: usize,
    pub events: [u64; MAX_EVENT_INDEX + 1],
    /// Event sections whose module framing could not be parsed.
    pub malformed_events: u64,
    pub timeticks: u64,
    pub pauses: u64,
    pub has_end: bool,
    pub messages: Option<String>,
}

impl ListfileOverview {
    pub fn total_events(&self) -> u64 {
        self.events.iter().sum()
    }
}

/// Walk every section of the listfile at `path`.
pub fn inspect_listfile(path: &Path) -> DaqResult<ListfileOverview> {
    let reader = ListfileReader::open(path)?;
    let mut overview = ListfileOverview {
        config_bytes: reader.read_config()?.len(),
        messages: reader.messages().map(str::to_string),
        ..ListfileOverview::default()
    };
    for section in reader.sections()? {
        match section.header.section_type {
            SectionType::Event => {
                overview.events[section.header.event_index as usize] += 1;
                if section.modules().is_none() {
                    overview.malformed_events += 1;
                }
            }
            SectionType::Timetick => overview.timeticks += 1,
            SectionType::Pause => overview.pauses += 1,
            SectionType::End => overview.has_end = true,
            SectionType::Config => {}
        }
    }
    Ok(overview)
}

impl fmt::Display for ListfileOverview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "config:     {} bytes", self.config_bytes)?;
        writeln!(f, "events:     {}", self.total_events())?;
        for (index, count) in self.events.iter().enumerate().filter(|(_, c)| **c > 0) {
            writeln!(f, "  event {:>2}: {}", index, count)?;
        }
        if self.malformed_events > 0 {
            writeln!(f, "malformed:  {}", self.malformed_events)?;
        }
        writeln!(f, "timeticks:  {}", self.timeticks)?;
        writeln!(f, "pauses:     {}", self.pauses)?;
        write!(f, "complete:   {}", if self.has_end { "yes" } else { "no (missing end section)" })
    }
}
