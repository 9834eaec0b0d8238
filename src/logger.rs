use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{io::Write, path::PathBuf};

use crate::error::Em2Error;
use crate::readout::ReadoutBuffer;
use crate::types::{StatusReport, SyncMode};

/// One converted readout slice as written to the data log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadoutRecord {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub sync_mode: SyncMode,
    pub integration_time: f64,
    pub status: StatusReport,
    /// Row 0 is time, row `n` is instrument channel `n`
    pub rows: Vec<Vec<f64>>,
}

impl ReadoutRecord {
    pub fn new(
        cycle: u64,
        sync_mode: SyncMode,
        integration_time: f64,
        status: StatusReport,
        buffer: &ReadoutBuffer,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            cycle,
            sync_mode,
            integration_time,
            status,
            rows: buffer.to_rows(),
        }
    }
}

/// Buffered JSONL writer.
///
/// Records are appended one JSON document per line. Transient write failures
/// are logged and retried on the next flush; after `max_flush_failures`
/// consecutive failures the error is returned.
#[derive(Debug)]
pub struct Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    flush_failures: usize,
    max_flush_failures: usize,
}

impl<T> Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize, final_format_json: bool) -> Self {
        let mut path = file_path.into();
        let extension = if final_format_json { "json" } else { "jsonl" };
        if path.extension() != Some(std::ffi::OsStr::new(extension)) {
            path.set_extension(extension);
        }

        Self {
            buffer: Vec::with_capacity(buffer_size),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            flush_failures: 0,
            max_flush_failures: 10,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.file_path
    }

    pub fn add(&mut self, data: T) -> Result<(), Em2Error> {
        self.buffer.push(data);

        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }

        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Em2Error> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let result = self.write_buffer();
        match result {
            Ok(()) => {
                self.flush_failures = 0;
                info!(
                    "Flushed {} record(s) to {}",
                    self.buffer.len(),
                    self.file_path.display()
                );
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                error!(
                    "Flush failure {}/{}: {}",
                    self.flush_failures, self.max_flush_failures, e
                );
                if self.flush_failures % 3 == 0 {
                    warn!(
                        "Experiencing intermittent flush failures ({}/{})",
                        self.flush_failures, self.max_flush_failures
                    );
                }

                if self.flush_failures >= self.max_flush_failures {
                    return Err(Em2Error::Io {
                        source: std::io::Error::other(e.to_string()),
                        context: format!(
                            "Too many consecutive flush failures ({}) for {:?}",
                            self.max_flush_failures, self.file_path
                        ),
                    });
                }

                // keep the records for the next attempt
                Ok(())
            }
        }
    }

    fn write_buffer(&self) -> Result<(), Em2Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .map_err(|source| Em2Error::Io {
                source,
                context: format!("Could not open log file {:?}", self.file_path),
            })?;

        let mut writer = std::io::BufWriter::new(file);
        for data in &self.buffer {
            let json_line = serde_json::to_string(data)?;
            writeln!(writer, "{}", json_line)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Rewrite the JSONL file as one pretty-printed JSON array.
    pub fn finalize_as_json(&mut self) -> Result<(), Em2Error> {
        if !self.final_format_json {
            return Ok(());
        }

        self.flush()?;
        if !self.file_path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&self.file_path).map_err(|source| Em2Error::Io {
            source,
            context: format!("Could not read JSONL file at {:?}", self.file_path),
        })?;

        // already converted
        if content.trim_start().starts_with('[') {
            return Ok(());
        }

        let mut entries = Vec::new();
        for line in content.lines() {
            if !line.trim().is_empty() {
                let data: T = serde_json::from_str(line)?;
                entries.push(data);
            }
        }

        let json_output = serde_json::to_string_pretty(&entries)?;
        std::fs::write(&self.file_path, json_output).map_err(|source| Em2Error::Io {
            source,
            context: format!("Could not write JSON file at {:?}", self.file_path),
        })?;

        info!("Converted {} entries from JSONL to JSON format", entries.len());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for Logger<T>
where
    T: Serialize + Clone + DeserializeOwned,
{
    fn drop(&mut self) {
        let _ = self.flush();
        let _ = self.finalize_as_json();
    }
}
