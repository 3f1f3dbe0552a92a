//! Durable per-run log
//!
//! One timestamped line per command, response and phase boundary, framed
//! by `RUN START` and `RUN COMPLETE` / `RUN FAILED`. Lines are written
//! through immediately so a crash leaves everything up to the last line.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::Path;

use chrono::Local;
use tracing::warn;

/// Line categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Run start and end markers
    Run,
    /// Phase and trial boundaries
    Phase,
    /// Command sent to the arena or a plugin
    Command,
    /// Outcome of a command
    Response,
    /// Anything else worth keeping
    Note,
    /// Errors
    Error,
}

impl LineKind {
    fn tag(self) -> &'static str {
        match self {
            LineKind::Run => "RUN",
            LineKind::Phase => "PHASE",
            LineKind::Command => "CMD",
            LineKind::Response => "RSP",
            LineKind::Note => "NOTE",
            LineKind::Error => "ERROR",
        }
    }
}

/// Append-only run log
pub struct RunLog {
    sink: Box<dyn Write + Send>,
    write_failed: bool,
}

impl RunLog {
    /// Open (or create) a log file for appending
    pub fn create(path: &Path) -> io::Result<Self> {
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(Box::new(LineWriter::new(file))))
    }

    /// Log into any writer
    pub fn from_writer(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink,
            write_failed: false,
        }
    }

    /// Append one line
    ///
    /// A failed write is reported once through `tracing` and never stops
    /// the run.
    pub fn line(&mut self, kind: LineKind, text: impl fmt::Display) {
        let stamp = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f");
        let result = writeln!(self.sink, "{} {:<5} {}", stamp, kind.tag(), text)
            .and_then(|_| self.sink.flush());
        if let Err(e) = result {
            if !self.write_failed {
                warn!("Run log write failed: {}", e);
            }
            self.write_failed = true;
        }
    }

    /// Check if any line was lost
    pub fn write_failed(&self) -> bool {
        self.write_failed
    }

    pub fn start(&mut self, text: impl fmt::Display) {
        self.line(LineKind::Run, format_args!("RUN START {}", text));
    }

    pub fn complete(&mut self) {
        self.line(LineKind::Run, "RUN COMPLETE");
    }

    pub fn failed(&mut self, reason: impl fmt::Display) {
        self.line(LineKind::Run, format_args!("RUN FAILED {}", reason));
    }

    pub fn phase(&mut self, text: impl fmt::Display) {
        self.line(LineKind::Phase, text);
    }

    pub fn command(&mut self, text: impl fmt::Display) {
        self.line(LineKind::Command, text);
    }

    pub fn response(&mut self, text: impl fmt::Display) {
        self.line(LineKind::Response, text);
    }

    pub fn note(&mut self, text: impl fmt::Display) {
        self.line(LineKind::Note, text);
    }

    pub fn error(&mut self, text: impl fmt::Display) {
        self.line(LineKind::Error, text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Arc, Mutex};

    /// Writer that keeps its bytes for inspection
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_line_format() {
        let shared = Shared::default();
        let mut log = RunLog::from_writer(Box::new(shared.clone()));
        log.start("optomotor seed=5");
        log.command("all_on");
        log.response("all_on ok");
        log.complete();

        let text = String::from_utf8(shared.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("RUN   RUN START optomotor seed=5"));
        assert!(lines[1].ends_with("CMD   all_on"));
        assert!(lines[2].ends_with("RSP   all_on ok"));
        assert!(lines[3].ends_with("RUN COMPLETE"));
        // 2026-01-02T03:04:05.678
        assert_eq!(lines[0].split(' ').next().unwrap().len(), 23);
    }

    #[test]
    fn test_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");

        let mut log = RunLog::create(&path).unwrap();
        log.start("first");
        drop(log);

        let mut log = RunLog::create(&path).unwrap();
        log.failed("connection lost");
        drop(log);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.contains("RUN START first"));
        assert!(text.contains("RUN FAILED connection lost"));
    }

    #[test]
    fn test_write_failure_does_not_panic() {
        let mut log = RunLog::from_writer(Box::new(Broken));
        log.note("lost");
        log.note("also lost");
        assert!(log.write_failed());
    }
}
