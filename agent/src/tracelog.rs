//! Trace log output
//!
//! Writes one [`Record`] per line to stdout, stderr or a file. Writes are
//! serialised by a mutex; a failed write is reported and the record lost.

use crate::channel::EventSummary;
use crate::config::{OutputStream, TraceLogConfig};
use crate::error::{AgentError, Result};
use rtprof_shared::{InternalId, Record};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

pub struct TraceLog {
    out: Mutex<Box<dyn Write + Send>>,
}

impl TraceLog {
    /// Open the destination named by `config`
    pub fn new(config: &TraceLogConfig) -> Result<Self> {
        let out: Box<dyn Write + Send> = match config.output {
            OutputStream::Stdout => Box::new(io::stdout()),
            OutputStream::Stderr => Box::new(io::stderr()),
            OutputStream::File => {
                let path = config.file_name.as_ref().ok_or(AgentError::Config(
                    crate::config::ConfigError::Invalid("trace log file name is not specified"),
                ))?;
                let file = File::create(path).map_err(|source| AgentError::TraceLogOpen {
                    path: path.display().to_string(),
                    source,
                })?;
                info!("Writing trace log to {}", path.display());
                Box::new(BufWriter::new(file))
            }
        };
        Ok(Self::from_writer(out))
    }

    pub fn from_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dump(&self, record: &Record) {
        let mut out = self.lock();
        if let Err(e) = writeln!(out, "{}", record) {
            warn!("Failed to write trace log record: {}", e);
        }
    }

    /// Write the samples carried by `summary` for thread `thread`
    pub fn dump_sample(&self, thread: InternalId, summary: &EventSummary) {
        let (stack, alloc) = summary.to_records(thread);
        let mut out = self.lock();
        let result = stack
            .map_or(Ok(()), |sample| writeln!(out, "{}", sample))
            .and_then(|_| alloc.map_or(Ok(()), |sample| writeln!(out, "{}", sample)));
        if let Err(e) = result {
            warn!("Failed to write sample: {}", e);
        }
    }

    pub fn flush(&self) {
        if let Err(e) = self.lock().flush() {
            warn!("Failed to flush trace log: {}", e);
        }
    }
}

impl std::fmt::Debug for TraceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceLog").finish_non_exhaustive()
    }
}

/// In-memory trace log destination
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        let data = self.data.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&data).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Frame;
    use std::path::PathBuf;

    #[test]
    fn test_dump_records() {
        let buffer = SharedBuffer::new();
        let log = TraceLog::from_writer(Box::new(buffer.clone()));
        log.dump(&Record::TracingPause { ticks: 12 });
        log.dump(&Record::ThreadDestroyed { iid: InternalId(3) });
        assert_eq!(buffer.lines(), vec!["prf tps 12", "thr dst 0x00000003"]);
    }

    #[test]
    fn test_dump_sample_writes_both_kinds() {
        let buffer = SharedBuffer::new();
        let log = TraceLog::from_writer(Box::new(buffer.clone()));

        let mut summary = EventSummary::new(0);
        summary.ticks = 40;
        summary.count = 2;
        summary.new_frames.push(Frame::new(0x10, InternalId(2)));
        summary
            .alloc_table
            .entry(InternalId(5))
            .or_default()
            .entry(0)
            .or_default()
            .count = 1;
        log.dump_sample(InternalId(1), &summary);

        assert_eq!(
            buffer.lines(),
            vec!["sam str 0x00000001 40 2 0:0 0x2", "sam mem 0x00000001 40 0x5:1:0"]
        );
    }

    #[test]
    fn test_empty_summary_writes_nothing() {
        let buffer = SharedBuffer::new();
        let log = TraceLog::from_writer(Box::new(buffer.clone()));
        log.dump_sample(InternalId(1), &EventSummary::new(4));
        assert!(buffer.contents().is_empty());
    }

    #[test]
    fn test_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let config = TraceLogConfig {
            output: OutputStream::File,
            file_name: Some(path.clone()),
        };
        let log = TraceLog::new(&config).unwrap();
        log.dump(&Record::TracingResume { ticks: 1 });
        log.flush();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "prf trs 1\n");
    }

    #[test]
    fn test_missing_file_name() {
        let config = TraceLogConfig {
            output: OutputStream::File,
            file_name: None,
        };
        assert!(TraceLog::new(&config).is_err());

        let config = TraceLogConfig {
            output: OutputStream::File,
            file_name: Some(PathBuf::from("/nonexistent/dir/trace.log")),
        };
        assert!(matches!(
            TraceLog::new(&config),
            Err(AgentError::TraceLogOpen { .. })
        ));
    }
}
