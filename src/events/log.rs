//! Append-only event log.
//!
//! Each [`EventLog::emit`] writes one canonical NDJSON line, flushes it and
//! syncs it to disk before returning. Readers are tolerant: a line that is
//! not a valid event (torn write, unknown type, bad payload) is skipped with a
//! warning and the remaining lines are still returned.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{Event, EventKind};
use crate::context::RunContext;
use crate::error::{Result, StewardError};

/// Result of reading an event log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogRead {
    /// Decoded events, in append order.
    pub events: Vec<Event>,
    /// Number of malformed lines that were skipped.
    pub skipped: usize,
    /// Number of non-blank lines in the whole log.
    pub total_lines: u64,
}

/// Writer for one run's `events.ndjson`.
pub struct EventLog {
    ctx: RunContext,
    path: PathBuf,
    file: File,
    lines: u64,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("path", &self.path)
            .field("lines", &self.lines)
            .finish_non_exhaustive()
    }
}

impl EventLog {
    /// Open (creating if needed) the event log of the run in `ctx`.
    ///
    /// If the previous process died mid-write and left a partial last line,
    /// a newline is appended so the torn record stays isolated on its own
    /// line.
    pub fn open(ctx: &RunContext) -> Result<Self> {
        let path = ctx.layout().events_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        if ends_with_partial_line(&mut file)? {
            warn!("Event log {} ends with a partial line; sealing it", path.display());
            file.write_all(b"\n")?;
            file.sync_data()?;
        }

        let lines = count_lines(&path)?;
        debug!("Opened event log {} ({} lines)", path.display(), lines);

        Ok(Self {
            ctx: ctx.clone(),
            path,
            file,
            lines,
        })
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of non-blank lines in the log.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.lines
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines == 0
    }

    /// Create an event with fresh identifiers and append it.
    pub fn emit(&mut self, kind: EventKind) -> Result<Event> {
        let event = Event::new(
            self.ctx.ids().event_id(),
            self.ctx.run_id(),
            self.ctx.now(),
            kind,
            self.ctx.trace_id(),
            self.ctx.ids().span_id(),
        );
        self.append(&event)?;
        Ok(event)
    }

    /// Append a fully built event.
    pub fn append(&mut self, event: &Event) -> Result<()> {
        let line = event.to_line()?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.lines += 1;
        debug!("{} {}", event.kind.type_name(), event.event_id);
        Ok(())
    }

    /// Record a terminal `RUN_FAILED` for `err`.
    pub fn emit_failure(&mut self, err: &StewardError) -> Result<Event> {
        self.emit_failure_message(err.kind(), err)
    }

    /// Record a terminal `RUN_FAILED` with an explicit kind.
    pub fn emit_failure_message(
        &mut self,
        error_kind: &str,
        message: impl std::fmt::Display,
    ) -> Result<Event> {
        self.emit(EventKind::RunFailed {
            error_kind: error_kind.to_string(),
            message: message.to_string(),
        })
    }
}

/// Read every event in the log at `path`.
///
/// A missing log reads as empty.
pub fn read_events(path: &Path) -> Result<LogRead> {
    read_from(path, 0)
}

/// Read the events at or after the 0-based non-blank line `position`.
pub fn read_from(path: &Path, position: u64) -> Result<LogRead> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LogRead::default()),
        Err(e) => return Err(e.into()),
    };

    let mut read = LogRead::default();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                warn!("Skipping non-UTF-8 line {} in {}", index + 1, path.display());
                read.total_lines += 1;
                read.skipped += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        let position_of_line = read.total_lines;
        read.total_lines += 1;
        if position_of_line < position {
            continue;
        }
        match Event::from_line(&line) {
            Ok(event) => read.events.push(event),
            Err(e) => {
                warn!(
                    "Skipping malformed event at line {} in {}: {}",
                    index + 1,
                    path.display(),
                    e
                );
                read.skipped += 1;
            }
        }
    }
    Ok(read)
}

/// Count the non-blank lines of the log at `path` (0 when missing).
pub fn count_lines(path: &Path) -> Result<u64> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut count = 0;
    for line in BufReader::new(file).split(b'\n') {
        if line?.iter().any(|b| !b.is_ascii_whitespace()) {
            count += 1;
        }
    }
    Ok(count)
}

fn ends_with_partial_line(file: &mut File) -> Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

// ============================================================================
// Tests
// ============================================================================
