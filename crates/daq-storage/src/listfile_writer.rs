//! Listfile writer.
//!
//! Writes the preamble, configuration sections, normalized event buffers and
//! the end section to one of two sinks chosen when the run starts:
//!
//! - [`ListfileFormat::Plain`]: a single `.mvmelst` file
//! - [`ListfileFormat::Zip`]: a zip archive whose `listfile.mvmelst` entry is
//!   the only open entry while the run is active; `messages.log` and
//!   `analysis.analysis` are added by [`ListfileWriter::finish`]
//!
//! # Example
//!
//! ```no_run
//! use daq_storage::{ListfileFormat, ListfileWriter};
//! use std::path::Path;
//!
//! # fn main() -> daq_storage::Result<()> {
//! let mut writer = ListfileWriter::create(Path::new("run001.zip"), ListfileFormat::Zip, None)?;
//! writer.write_preamble()?;
//! writer.write_config(br#"{"vme": {}}"#)?;
//! // ... write_buffer() for every decoded buffer ...
//! writer.write_end_section()?;
//! writer.finish("run log\n", Some(b"{}"))?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ListfileError, Result};
use daq_core::listfile::{
    preamble_bytes, SectionHeader, SectionType, PAUSE_ACTION_PAUSE, PAUSE_ACTION_RESUME,
    SECTION_MAX_WORDS,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Name of the framed section stream inside a zip archive.
pub const LISTFILE_ENTRY: &str = "listfile.mvmelst";
/// Name of the run log inside a zip archive.
pub const MESSAGES_ENTRY: &str = "messages.log";
/// Name of the analysis configuration inside a zip archive.
pub const ANALYSIS_ENTRY: &str = "analysis.analysis";

const WRITE_BUFFER_SIZE: usize = 1 << 20;

/// Listfile container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListfileFormat {
    Plain,
    #[default]
    Zip,
}

impl ListfileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ListfileFormat::Plain => "mvmelst",
            ListfileFormat::Zip => "zip",
        }
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Zip(ZipWriter<File>),
}

impl Sink {
    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => w.write_all(bytes),
            Sink::Zip(w) => w.write_all(bytes),
        }
    }
}

/// Result of a finished listfile.
#[derive(Debug, Clone)]
pub struct ListfileSummary {
    pub path: PathBuf,
    pub format: ListfileFormat,
    pub bytes_written: u64,
}

/// Writer for one run's listfile.
pub struct ListfileWriter {
    sink: Option<Sink>,
    path: PathBuf,
    format: ListfileFormat,
    zip_options: SimpleFileOptions,
    bytes_written: u64,
    max_section_words: usize,
}

impl std::fmt::Debug for ListfileWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListfileWriter")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

impl ListfileWriter {
    /// Create the output file. For zip archives the listfile entry is opened
    /// immediately. `compression_level` applies to zip entries only
    /// (`None` = library default, `Some(0)` = stored).
    pub fn create(path: &Path, format: ListfileFormat, compression_level: Option<i64>) -> Result<Self> {
        let file = File::create(path).map_err(|source| ListfileError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let zip_options = match compression_level {
            Some(0) => SimpleFileOptions::default().compression_method(CompressionMethod::Stored),
            level => SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(level),
        }
        .large_file(true);

        let sink = match format {
            ListfileFormat::Plain => Sink::Plain(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file)),
            ListfileFormat::Zip => {
                let mut zip = ZipWriter::new(file);
                zip.start_file(LISTFILE_ENTRY, zip_options.clone())?;
                Sink::Zip(zip)
            }
        };

        info!(path = %path.display(), ?format, "Opened listfile");

        Ok(Self {
            sink: Some(sink),
            path: path.to_path_buf(),
            format,
            zip_options,
            bytes_written: 0,
            max_section_words: SECTION_MAX_WORDS,
        })
    }

    /// Limit the size of config sections (defaults to the format maximum).
    pub fn with_max_section_words(mut self, words: usize) -> Self {
        self.max_section_words = words.clamp(1, SECTION_MAX_WORDS);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ListfileFormat {
        self.format
    }

    /// Bytes written to the listfile stream so far (uncompressed).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let sink = self.sink.as_mut().ok_or(ListfileError::Finished)?;
        sink.write_all(bytes)?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    fn write_word(&mut self, word: u32) -> Result<()> {
        self.write_raw(&word.to_le_bytes())
    }

    /// Magic and format version.
    pub fn write_preamble(&mut self) -> Result<()> {
        self.write_raw(&preamble_bytes())
    }

    /// Write a configuration blob as one or more config sections. Each section
    /// carries at most `max_section_words` words; the last one is padded with
    /// zero bytes to a word boundary.
    pub fn write_config(&mut self, config: &[u8]) -> Result<()> {
        let max_bytes = self.max_section_words * 4;
        let mut sections = 0usize;
        for chunk in config.chunks(max_bytes) {
            let padded_len = chunk.len().div_ceil(4) * 4;
            let header = SectionHeader::new(SectionType::Config, padded_len / 4);
            self.write_word(header.encode())?;
            self.write_raw(chunk)?;
            let padding = padded_len - chunk.len();
            if padding > 0 {
                self.write_raw(&[0u8; 3][..padding])?;
            }
            sections += 1;
        }
        debug!(bytes = config.len(), sections, "Wrote config sections");
        Ok(())
    }

    /// Append an already framed buffer of normalized sections.
    pub fn write_buffer(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_raw(bytes)
    }

    /// Empty timetick section.
    pub fn write_timetick(&mut self) -> Result<()> {
        self.write_word(SectionHeader::new(SectionType::Timetick, 0).encode())
    }

    /// Pause section; `paused == false` records a resume.
    pub fn write_pause(&mut self, paused: bool) -> Result<()> {
        self.write_word(SectionHeader::new(SectionType::Pause, 1).encode())?;
        self.write_word(if paused {
            PAUSE_ACTION_PAUSE
        } else {
            PAUSE_ACTION_RESUME
        })
    }

    pub fn write_end_section(&mut self) -> Result<()> {
        self.write_word(SectionHeader::new(SectionType::End, 0).encode())
    }

    /// Close the listfile. Zip archives additionally receive the run log and
    /// the analysis configuration; plain listfiles get them as side files
    /// next to the listfile.
    pub fn finish(mut self, messages: &str, analysis: Option<&[u8]>) -> Result<ListfileSummary> {
        let sink = self.sink.take().ok_or(ListfileError::Finished)?;
        match sink {
            Sink::Plain(mut writer) => {
                writer.flush()?;
                writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
                std::fs::write(self.path.with_extension("log"), messages)?;
                if let Some(analysis) = analysis {
                    std::fs::write(self.path.with_extension("analysis"), analysis)?;
                }
            }
            Sink::Zip(mut zip) => {
                zip.start_file(MESSAGES_ENTRY, self.zip_options.clone())?;
                zip.write_all(messages.as_bytes())?;
                if let Some(analysis) = analysis {
                    zip.start_file(ANALYSIS_ENTRY, self.zip_options.clone())?;
                    zip.write_all(analysis)?;
                }
                zip.finish()?.sync_all()?;
            }
        }

        info!(
            path = %self.path.display(),
            bytes_written = self.bytes_written,
            "Closed listfile"
        );

        Ok(ListfileSummary {
            path: self.path.clone(),
            format: self.format,
            bytes_written: self.bytes_written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_words(path: &Path) -> Vec<u32> {
        std::fs::read(path)
            .unwrap()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_plain_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.mvmelst");

        let mut writer = ListfileWriter::create(&path, ListfileFormat::Plain, None).unwrap();
        writer.write_preamble().unwrap();
        writer.write_config(b"abcde").unwrap();
        writer.write_pause(true).unwrap();
        writer.write_end_section().unwrap();
        assert_eq!(writer.bytes_written(), 8 + 4 + 8 + 8 + 4);
        writer.finish("log line\n", None).unwrap();

        let words = read_words(&path);
        assert_eq!(&std::fs::read(&path).unwrap()[..4], b"MVME");
        assert_eq!(words[1], 1);
        let config = SectionHeader::decode(words[2]).unwrap();
        assert_eq!(config.section_type, SectionType::Config);
        assert_eq!(config.size_words, 2);
        assert_eq!(
            SectionHeader::decode(words[5]).unwrap().section_type,
            SectionType::Pause
        );
        assert_eq!(words[6], PAUSE_ACTION_PAUSE);
        assert_eq!(words[7], 0);

        let log = std::fs::read_to_string(path.with_extension("log")).unwrap();
        assert_eq!(log, "log line\n");
    }

    #[test]
    fn test_config_split_into_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("split.mvmelst");
        let mut writer = ListfileWriter::create(&path, ListfileFormat::Plain, None)
            .unwrap()
            .with_max_section_words(2);
        writer.write_config(&[7u8; 19]).unwrap();
        writer.finish("", None).unwrap();

        // 19 bytes in 8-byte chunks: 8 + 8 + 3 (padded to 4)
        let words = read_words(&path);
        let sizes: Vec<usize> = [0usize, 3, 6]
            .iter()
            .map(|&i| SectionHeader::decode(words[i]).unwrap().size_words)
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(words.len(), 3 + 5);
    }

    #[test]
    fn test_open_failure_names_path() {
        let err = ListfileWriter::create(
            Path::new("/nonexistent-dir/sub/run.zip"),
            ListfileFormat::Zip,
            None,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("/nonexistent-dir/sub/run.zip"));
    }
}
