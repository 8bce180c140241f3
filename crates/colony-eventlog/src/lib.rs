#![forbid(unsafe_code)]

//! Append-only JSONL event log shared by every agent process.
//!
//! Each line is one sealed [`EventRecord`]. Writers serialize through an
//! exclusive advisory lock and emit a record with a single `write_all`;
//! readers never lock and treat any line that fails to parse or verify as
//! corrupt.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colony_domain::{
    now_utc, project, AggregateState, ColonyConfig, ColonyError, DecodedRecord, ErrorKind, Event,
    EventRecord, Finding, ScanReport, SequencedEvent,
};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventLogStats {
    pub total_events: usize,
    pub file_size_bytes: u64,
    pub corrupt_records: usize,
    pub last_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LineProblem {
    pub line: usize,
    pub seq: Option<u64>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct VerifyReport {
    pub total_lines: usize,
    pub valid_records: usize,
    pub unknown_records: usize,
    pub problems: Vec<LineProblem>,
}

impl VerifyReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Position of the file tail as last observed by this process.
#[derive(Debug, Clone, Copy)]
struct Tail {
    file_len: u64,
    last_seq: u64,
    ends_clean: bool,
}

#[derive(Debug, Clone)]
struct Projection {
    file_len: u64,
    state: AggregateState,
    report: ScanReport,
    events: Vec<SequencedEvent>,
    valid_records: usize,
    last_seq: u64,
}

/// Result of parsing the raw bytes of the log once.
struct Scan {
    events: Vec<SequencedEvent>,
    valid_records: usize,
    unknown: usize,
    problems: Vec<LineProblem>,
    total_lines: usize,
    max_seq: u64,
    ends_clean: bool,
}

pub struct EventLog {
    path: PathBuf,
    fsync_appends: bool,
    tail: Option<Tail>,
    projection: Option<Projection>,
}

impl EventLog {
    /// Bind to a log file. Nothing is created until the first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fsync_appends: false,
            tail: None,
            projection: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &ColonyConfig) -> Self {
        Self::new(&config.event_log_path).with_fsync(config.fsync_appends)
    }

    #[must_use]
    pub fn with_fsync(mut self, fsync_appends: bool) -> Self {
        self.fsync_appends = fsync_appends;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event and return its sequence number.
    ///
    /// # Errors
    /// Returns a [`ColonyError::Storage`] chain when the file cannot be
    /// opened, locked or written.
    pub fn append_event(&mut self, event: &Event) -> Result<u64> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| storage_error("create event log directory", &err))
                    .with_context(|| format!("failed to prepare {}", parent.display()))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| storage_error("open event log", &err))
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        FileExt::lock_exclusive(&file)
            .map_err(|err| storage_error("lock event log", &err))
            .with_context(|| format!("failed to lock {}", self.path.display()))?;

        let outcome = self.append_locked(&mut file, event);

        if let Err(err) = FileExt::unlock(&file) {
            tracing::warn!(path = %self.path.display(), error = %err, "event log unlock failed");
        }
        outcome
    }

    fn append_locked(&mut self, file: &mut File, event: &Event) -> Result<u64> {
        let file_len = file
            .metadata()
            .map_err(|err| storage_error("stat event log", &err))?
            .len();

        let tail = match self.tail {
            Some(tail) if tail.file_len == file_len => tail,
            _ => {
                let bytes = read_all(file)?;
                let scan = scan_bytes(&bytes);
                Tail {
                    file_len,
                    last_seq: scan.max_seq,
                    ends_clean: scan.ends_clean,
                }
            }
        };

        let seq = tail.last_seq.checked_add(1).ok_or_else(|| {
            ColonyError::Corruption(format!(
                "event log {} has exhausted its sequence space",
                self.path.display()
            ))
        })?;
        let record = EventRecord::seal(seq, event, now_utc())?;
        let encoded = serde_json::to_string(&record)
            .map_err(|err| ColonyError::Storage(format!("failed to encode seq {seq}: {err}")))?;

        let mut line = String::with_capacity(encoded.len() + 2);
        if !tail.ends_clean {
            tracing::warn!(path = %self.path.display(), seq, "event log ends in a torn line; starting a fresh line");
            line.push('\n');
        }
        line.push_str(&encoded);
        line.push('\n');

        file.write_all(line.as_bytes())
            .map_err(|err| storage_error("append event", &err))?;
        if self.fsync_appends {
            file.sync_data()
                .map_err(|err| storage_error("fsync event log", &err))?;
        }

        self.tail = Some(Tail {
            file_len: file_len + line.len() as u64,
            last_seq: seq,
            ends_clean: true,
        });
        self.projection = None;

        tracing::debug!(seq, event_type = record.event_type.as_str(), "event appended");
        Ok(seq)
    }

    /// # Errors
    /// Returns an error when the log exists but cannot be read.
    pub fn get_current_state(&mut self) -> Result<AggregateState> {
        Ok(self.projection()?.state.clone())
    }

    /// Findings with `seq > cursor`, in seq order.
    ///
    /// # Errors
    /// Returns an error when the log exists but cannot be read.
    pub fn get_findings_since(&mut self, cursor: u64) -> Result<Vec<Finding>> {
        Ok(self.projection()?.state.findings_since(cursor))
    }

    /// # Errors
    /// Returns an error when the log exists but cannot be read.
    pub fn get_stats(&mut self) -> Result<EventLogStats> {
        let projection = self.projection()?;
        Ok(EventLogStats {
            total_events: projection.valid_records,
            file_size_bytes: projection.file_len,
            corrupt_records: projection.report.corrupt,
            last_seq: projection.last_seq,
        })
    }

    /// Counters of the projection currently served.
    ///
    /// # Errors
    /// Returns an error when the log exists but cannot be read.
    pub fn scan_report(&mut self) -> Result<ScanReport> {
        Ok(self.projection()?.report)
    }

    /// Verified typed events with `seq > after_seq`, in file order.
    ///
    /// # Errors
    /// Returns an error when the log exists but cannot be read.
    pub fn read_events(&mut self, after_seq: u64) -> Result<Vec<SequencedEvent>> {
        Ok(self
            .projection()?
            .events
            .iter()
            .filter(|item| item.seq > after_seq)
            .cloned()
            .collect())
    }

    /// Line-by-line integrity report. Never served from cache.
    ///
    /// # Errors
    /// Returns an error when the log exists but cannot be read.
    pub fn verify(&self) -> Result<VerifyReport> {
        let bytes = self.read_file()?;
        let scan = scan_bytes(&bytes);
        Ok(VerifyReport {
            total_lines: scan.total_lines,
            valid_records: scan.valid_records,
            unknown_records: scan.unknown,
            problems: scan.problems,
        })
    }

    fn projection(&mut self) -> Result<&Projection> {
        let current_len = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to stat {}", self.path.display()))
            }
        };

        let stale = self
            .projection
            .as_ref()
            .map_or(true, |cached| cached.file_len != current_len);
        if stale {
            let rebuilt = self.rebuild()?;
            self.projection = Some(rebuilt);
        }

        self.projection
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("event log projection unavailable"))
    }

    fn rebuild(&mut self) -> Result<Projection> {
        let bytes = self.read_file()?;
        let scan = scan_bytes(&bytes);
        let (state, mut report) = project(&scan.events);
        report.corrupt = scan.problems.len();
        report.unknown = scan.unknown;

        if report.corrupt > 0 {
            tracing::warn!(
                path = %self.path.display(),
                corrupt = report.corrupt,
                "skipped corrupt event log records"
            );
        }
        if report.rejected > 0 {
            tracing::info!(rejected = report.rejected, "events rejected by transition rules");
        }

        let file_len = bytes.len() as u64;
        self.tail = Some(Tail {
            file_len,
            last_seq: scan.max_seq,
            ends_clean: scan.ends_clean,
        });

        Ok(Projection {
            file_len,
            state,
            report,
            events: scan.events,
            valid_records: scan.valid_records,
            last_seq: scan.max_seq,
        })
    }

    fn read_file(&self) -> Result<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        }
    }
}

fn storage_error(action: &str, err: &std::io::Error) -> ColonyError {
    ColonyError::Storage(format!("failed to {action}: {err}"))
}

fn read_all(file: &mut File) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut bytes))
        .map_err(|err| storage_error("rescan event log", &err))?;
    Ok(bytes)
}

fn scan_bytes(bytes: &[u8]) -> Scan {
    let mut scan = Scan {
        events: Vec::new(),
        valid_records: 0,
        unknown: 0,
        problems: Vec::new(),
        total_lines: 0,
        max_seq: 0,
        ends_clean: bytes.last().map_or(true, |last| *last == b'\n'),
    };

    for (index, raw) in bytes.split(|byte| *byte == b'\n').enumerate() {
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        scan.total_lines += 1;
        let line = index + 1;

        let record: EventRecord = match serde_json::from_slice(raw) {
            Ok(record) => record,
            Err(err) => {
                tracing::debug!(line, error = %err, "unparseable event log line");
                scan.problems.push(LineProblem {
                    line,
                    seq: None,
                    kind: ErrorKind::Corruption,
                    message: format!("malformed record: {err}"),
                });
                continue;
            }
        };
        // Only a sealed record may advance the sequence; a forged seq is just a bad line.
        if record.verify_checksum() {
            scan.max_seq = scan.max_seq.max(record.seq);
        }

        match record.decode() {
            Ok(DecodedRecord::Known(event)) => {
                scan.valid_records += 1;
                scan.events.push(event);
            }
            Ok(DecodedRecord::Unknown { seq, event_type }) => {
                tracing::debug!(line, seq, event_type = %event_type, "ignoring unknown event type");
                scan.valid_records += 1;
                scan.unknown += 1;
            }
            Err(err) => {
                tracing::debug!(line, seq = record.seq, error = %err, "rejected event log record");
                scan.problems.push(LineProblem {
                    line,
                    seq: Some(record.seq),
                    kind: err.kind(),
                    message: err.to_string(),
                });
            }
        }
    }

    scan
}

#[cfg(test)]
mod tests {
    use super::scan_bytes;
    use colony_domain::{Event, EventRecord, SystemReset};

    fn sealed_line(seq: u64) -> String {
        let record = EventRecord::seal(
            seq,
            &Event::SystemReset(SystemReset::default()),
            colony_domain::now_utc(),
        )
        .unwrap_or_else(|_| unreachable!());
        serde_json::to_string(&record).unwrap_or_else(|_| unreachable!())
    }

    #[test]
    fn torn_tail_is_reported_and_flagged() {
        let content = format!("{}\n{}\n{{\"seq\":3,\"ty", sealed_line(1), sealed_line(2));
        let scan = scan_bytes(content.as_bytes());
        assert_eq!(scan.events.len(), 2);
        assert_eq!(scan.problems.len(), 1);
        assert_eq!(scan.problems[0].line, 3);
        assert_eq!(scan.max_seq, 2);
        assert!(!scan.ends_clean);
    }

    #[test]
    fn unsealed_records_do_not_advance_max_seq() {
        let forged = sealed_line(3).replacen("\"seq\":3", &format!("\"seq\":{}", u64::MAX), 1);
        let content = format!("{}\n{forged}\n{}\n", sealed_line(1), sealed_line(2));
        let scan = scan_bytes(content.as_bytes());
        assert_eq!(scan.events.len(), 2);
        assert_eq!(scan.problems.len(), 1);
        assert_eq!(scan.problems[0].seq, Some(u64::MAX));
        assert_eq!(scan.max_seq, 2);
    }

    #[test]
    fn blank_lines_are_not_records() {
        let content = format!("\n{}\n\n", sealed_line(7));
        let scan = scan_bytes(content.as_bytes());
        assert_eq!(scan.total_lines, 1);
        assert_eq!(scan.max_seq, 7);
        assert!(scan.ends_clean);
    }

    #[test]
    fn empty_file_scans_clean() {
        let scan = scan_bytes(&[]);
        assert!(scan.events.is_empty());
        assert_eq!(scan.max_seq, 0);
        assert!(scan.ends_clean);
    }
}
