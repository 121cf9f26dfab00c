//! Listfile reader.
//!
//! Loads a listfile (plain or from a zip archive) and walks its sections.
//! Used for replay/inspection and to verify what the writer produced.

use crate::error::{ListfileError, Result};
use crate::listfile_writer::{ANALYSIS_ENTRY, LISTFILE_ENTRY, MESSAGES_ENTRY};
use daq_core::listfile::{
    ModuleHeader, SectionHeader, SectionType, END_MARKER, LISTFILE_VERSION, PREAMBLE_MAGIC,
};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// One section: decoded header plus body words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub header: SectionHeader,
    /// Byte offset of the header word within the listfile stream.
    pub offset: usize,
    pub body: Vec<u32>,
}

/// One module sub-event inside an event section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleData {
    pub header: ModuleHeader,
    /// Payload words without the trailing end marker.
    pub payload: Vec<u32>,
}

impl Section {
    /// Body as bytes (config sections carry raw bytes).
    pub fn body_bytes(&self) -> Vec<u8> {
        self.body.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Split an event section body into its module sub-events. Returns `None`
    /// for non-event sections or a malformed body.
    pub fn modules(&self) -> Option<Vec<ModuleData>> {
        if self.header.section_type != SectionType::Event {
            return None;
        }
        let mut modules = Vec::new();
        let mut pos = 0;
        while pos < self.body.len() {
            let word = self.body[pos];
            if word == END_MARKER && pos + 1 == self.body.len() {
                return Some(modules);
            }
            let header = ModuleHeader::decode(word);
            let end = pos + 1 + header.size_words;
            if header.size_words == 0 || end > self.body.len() || self.body[end - 1] != END_MARKER {
                return None;
            }
            modules.push(ModuleData {
                header,
                payload: self.body[pos + 1..end - 1].to_vec(),
            });
            pos = end;
        }
        // Missing event end marker
        None
    }
}

/// In-memory listfile with auxiliary archive entries.
#[derive(Debug, Clone)]
pub struct ListfileReader {
    data: Vec<u8>,
    messages: Option<String>,
    analysis: Option<Vec<u8>>,
}

impl ListfileReader {
    /// Open a plain listfile or a zip archive (detected by the `PK` magic).
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|source| ListfileError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let mut magic = [0u8; 2];
        let is_zip = file.read_exact(&mut magic).is_ok() && &magic == b"PK";
        drop(file);

        if !is_zip {
            return Self::from_bytes(std::fs::read(path)?);
        }

        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(file)?;
        let mut data = Vec::new();
        archive.by_name(LISTFILE_ENTRY)?.read_to_end(&mut data)?;

        let messages = match archive.by_name(MESSAGES_ENTRY) {
            Ok(mut entry) => {
                let mut text = String::new();
                entry.read_to_string(&mut text)?;
                Some(text)
            }
            Err(_) => None,
        };
        let analysis = match archive.by_name(ANALYSIS_ENTRY) {
            Ok(mut entry) => {
                let mut bytes = Vec::new();
                entry.read_to_end(&mut bytes)?;
                Some(bytes)
            }
            Err(_) => None,
        };

        let mut reader = Self::from_bytes(data)?;
        reader.messages = messages;
        reader.analysis = analysis;
        Ok(reader)
    }

    /// Wrap an in-memory listfile stream, checking the preamble.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < 8 || &data[..4] != PREAMBLE_MAGIC {
            return Err(ListfileError::BadPreamble);
        }
        let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if version != LISTFILE_VERSION {
            return Err(ListfileError::UnsupportedVersion(version));
        }
        Ok(Self {
            data,
            messages: None,
            analysis: None,
        })
    }

    /// `messages.log` contents when read from an archive.
    pub fn messages(&self) -> Option<&str> {
        self.messages.as_deref()
    }

    /// Analysis configuration when read from an archive.
    pub fn analysis(&self) -> Option<&[u8]> {
        self.analysis.as_deref()
    }

    /// Parse every section after the preamble, stopping after the end section.
    pub fn sections(&self) -> Result<Vec<Section>> {
        let mut sections = Vec::new();
        let mut offset = 8;
        while offset + 4 <= self.data.len() {
            let word = self.word_at(offset);
            let header =
                SectionHeader::decode(word).ok_or(ListfileError::BadSection { word, offset })?;
            let body_start = offset + 4;
            let body_end = body_start + header.size_words * 4;
            if body_end > self.data.len() {
                return Err(ListfileError::Truncated { offset });
            }
            let body = (body_start..body_end)
                .step_by(4)
                .map(|o| self.word_at(o))
                .collect();
            sections.push(Section {
                header,
                offset,
                body,
            });
            offset = body_end;
            if header.section_type == SectionType::End {
                break;
            }
        }
        Ok(sections)
    }

    /// Concatenated bodies of all config sections, with the zero padding of
    /// the last section removed.
    pub fn read_config(&self) -> Result<Vec<u8>> {
        let mut config: Vec<u8> = self
            .sections()?
            .iter()
            .filter(|s| s.header.section_type == SectionType::Config)
            .flat_map(|s| s.body_bytes())
            .collect();
        while config.last() == Some(&0) {
            config.pop();
        }
        Ok(config)
    }

    fn word_at(&self, offset: usize) -> u32 {
        let b = &self.data[offset..offset + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}
