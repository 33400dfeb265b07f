//! Structured telemetry records and the sinks that receive them.
//!
//! Every protocol event (reply sent, request ignored, reply received,
//! request timed out, keepalive) produces one [`Record`]. Storage and
//! formatting belong to the sink.

use chrono::{DateTime, Local};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// What happened to a request, or what arrived without one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Frame payload, without its newline.
    Response(String),
    /// Superseded by a later reply or unresolved at session end.
    Timeout,
    /// Discarded by simulated loss.
    Ignored,
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Response(_) => "response",
            Outcome::Timeout => "timeout",
            Outcome::Ignored => "ignored",
        }
    }
}

/// One protocol event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub request_at: Option<DateTime<Local>>,
    pub request: Option<String>,
    pub response_at: DateTime<Local>,
    pub outcome: Outcome,
}

impl Record {
    /// A frame that answers no particular request (keepalive, stale reply).
    pub fn unsolicited(response_at: DateTime<Local>, payload: impl Into<String>) -> Self {
        Self {
            request_at: None,
            request: None,
            response_at,
            outcome: Outcome::Response(payload.into()),
        }
    }

    pub fn answered(
        request_at: DateTime<Local>,
        request: impl Into<String>,
        response_at: DateTime<Local>,
        outcome: Outcome,
    ) -> Self {
        Self {
            request_at: Some(request_at),
            request: Some(request.into()),
            response_at,
            outcome,
        }
    }
}

/// `date;time;request;time;response;`, request columns omitted when absent.
impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (Some(at), Some(request)) = (&self.request_at, &self.request) {
            write!(
                f,
                "{};{};{};",
                at.format("%Y-%m-%d"),
                at.format("%H:%M:%S%.6f"),
                request
            )?;
        }
        match &self.outcome {
            Outcome::Ignored => write!(f, "(ignored);"),
            Outcome::Timeout => write!(f, "{};(timeout);", self.response_at.format("%H:%M:%S%.6f")),
            Outcome::Response(payload) => {
                write!(f, "{};{};", self.response_at.format("%H:%M:%S%.6f"), payload)
            }
        }
    }
}

/// Receiver of telemetry records.
pub trait TelemetrySink {
    fn record(&mut self, record: Record);

    /// Called once an agent learns its client id.
    fn attach(&mut self, _client_id: u32) {}
}

impl<S: TelemetrySink + ?Sized> TelemetrySink for Box<S> {
    fn record(&mut self, record: Record) {
        (**self).record(record)
    }

    fn attach(&mut self, client_id: u32) {
        (**self).attach(client_id)
    }
}

/// Emits each record as a structured `tracing` event.
#[derive(Debug, Clone)]
pub struct TracingSink {
    component: String,
}

impl TracingSink {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }
}

impl TelemetrySink for TracingSink {
    fn record(&mut self, record: Record) {
        info!(
            component = %self.component,
            kind = record.outcome.kind(),
            request = record.request.as_deref().unwrap_or(""),
            "{record}"
        );
    }

    fn attach(&mut self, client_id: u32) {
        self.component = format!("client{client_id}");
    }
}

/// Appends records to `server.log` or `client<id>.log` under a directory,
/// and forwards them to tracing.
pub struct FileSink {
    dir: PathBuf,
    file: Option<LineWriter<File>>,
    tracing: TracingSink,
}

impl FileSink {
    /// Sink for the server, writing `<dir>/server.log`.
    pub fn server(dir: &Path) -> io::Result<Self> {
        let file = open_append(&dir.join("server.log"))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            file: Some(file),
            tracing: TracingSink::new("server"),
        })
    }

    /// Sink for an agent; the file is opened once the client id is known.
    pub fn client(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            file: None,
            tracing: TracingSink::new("client_unknown"),
        }
    }
}

fn open_append(path: &Path) -> io::Result<LineWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LineWriter::new(file))
}

impl TelemetrySink for FileSink {
    fn record(&mut self, record: Record) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = writeln!(file, "{record}") {
                warn!(dir = %self.dir.display(), error = %e, "Telemetry write failed, disabling file");
                self.file = None;
            }
        }
        self.tracing.record(record);
    }

    fn attach(&mut self, client_id: u32) {
        self.tracing.attach(client_id);
        let path = self.dir.join(format!("client{client_id}.log"));
        match open_append(&path) {
            Ok(file) => self.file = Some(file),
            Err(e) => warn!(path = %path.display(), error = %e, "Cannot open telemetry file"),
        }
    }
}

/// Boxed sink handed to a server or agent thread.
pub type BoxedSink = Box<dyn TelemetrySink + Send>;

/// File-backed sink when a directory is configured, tracing otherwise.
pub fn server_sink(dir: Option<&Path>) -> io::Result<BoxedSink> {
    Ok(match dir {
        Some(dir) => Box::new(FileSink::server(dir)?),
        None => Box::new(TracingSink::new("server")),
    })
}

/// Agent counterpart of [`server_sink`].
pub fn client_sink(dir: Option<&Path>) -> BoxedSink {
    match dir {
        Some(dir) => Box::new(FileSink::client(dir)),
        None => Box::new(TracingSink::new("client_unknown")),
    }
}

/// Collects records in memory. Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
    client_id: Arc<Mutex<Option<u32>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn client_id(&self) -> Option<u32> {
        self.client_id.lock().ok().and_then(|id| *id)
    }
}

impl TelemetrySink for MemorySink {
    fn record(&mut self, record: Record) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }

    fn attach(&mut self, client_id: u32) {
        if let Ok(mut id) = self.client_id.lock() {
            *id = Some(client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_display_response() {
        let record = Record::answered(
            at(10, 0, 0),
            "[3] PING",
            at(10, 0, 1),
            Outcome::Response("[8/3] PONG (1)".to_string()),
        );
        assert_eq!(
            record.to_string(),
            "2024-03-01;10:00:00.000000;[3] PING;10:00:01.000000;[8/3] PONG (1);"
        );
    }

    #[test]
    fn test_display_markers() {
        let timeout = Record::answered(at(9, 0, 0), "[1] PING", at(9, 0, 2), Outcome::Timeout);
        assert!(timeout.to_string().ends_with(";[1] PING;09:00:02.000000;(timeout);"));

        let ignored = Record::answered(at(9, 0, 0), "[2] PING", at(9, 0, 0), Outcome::Ignored);
        assert!(ignored.to_string().ends_with(";[2] PING;(ignored);"));

        let keepalive = Record::unsolicited(at(9, 0, 5), "[4] keepalive");
        assert_eq!(keepalive.to_string(), "09:00:05.000000;[4] keepalive;");
    }

    #[test]
    fn test_memory_sink_shared_between_clones() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.attach(5);
        writer.record(Record::unsolicited(at(1, 2, 3), "[0] keepalive"));
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.client_id(), Some(5));
    }

    #[test]
    fn test_file_sink_writes_client_log() {
        let dir = std::env::temp_dir().join(format!("pingmux-telemetry-{}", std::process::id()));
        let mut sink = FileSink::client(&dir);
        sink.attach(3);
        sink.record(Record::unsolicited(at(1, 2, 3), "[0] keepalive"));
        drop(sink);

        let contents = std::fs::read_to_string(dir.join("client3.log")).unwrap();
        assert_eq!(contents, "01:02:03.000000;[0] keepalive;\n");
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
