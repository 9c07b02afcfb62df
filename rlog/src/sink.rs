//! Local sinks: render events and write them to byte writers.

use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use crate::error::{Error, Result};
use crate::event::{Event, Level};

/// How an event is rendered before it reaches a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// `<rfc3339> [level] prefix/sub: message {metadata}`
    #[default]
    Text,
    /// One JSON object per line.
    Json,
    /// Length-prefixed (u32 big endian) wire encoding.
    Binary,
}

impl Format {
    pub fn render(self, event: &Event) -> Result<Vec<u8>> {
        match self {
            Format::Text => Ok(render_text(event).into_bytes()),
            Format::Json => {
                let mut buf = serde_json::to_vec(event).map_err(io::Error::from)?;
                buf.push(b'\n');
                Ok(buf)
            }
            Format::Binary => {
                let body = event.encode();
                let mut buf = Vec::with_capacity(body.len() + 4);
                buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
                buf.extend_from_slice(&body);
                Ok(buf)
            }
        }
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            "binary" => Ok(Format::Binary),
            other => Err(format!("unknown format: {other}")),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Text => "text",
            Format::Json => "json",
            Format::Binary => "binary",
        })
    }
}

fn render_text(event: &Event) -> String {
    let mut line = format!(
        "{} [{}] {}",
        event.time().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        event.level(),
        event.prefix()
    );
    if !event.sub().is_empty() {
        line.push('/');
        line.push_str(event.sub());
    }
    line.push_str(": ");
    line.push_str(event.message());
    if !event.metadata().is_empty() {
        line.push(' ');
        line.push_str(&serde_json::Value::Object(event.metadata().clone()).to_string());
    }
    line.push('\n');
    line
}

/// A writer with a format and a minimum level.
pub struct Sink {
    writer: Mutex<Box<dyn Write + Send>>,
    format: Format,
    level: Level,
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("format", &self.format)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

impl Sink {
    pub fn new(writer: impl Write + Send + 'static, format: Format) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
            format,
            level: Level::Trace,
        }
    }

    pub fn stdout(format: Format) -> Self {
        Self::new(io::stdout(), format)
    }

    pub fn stderr(format: Format) -> Self {
        Self::new(io::stderr(), format)
    }

    /// Append to `path`, creating it when missing.
    pub fn file(path: impl AsRef<Path>, format: Format) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file, format))
    }

    /// Skip events below `level`.
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn accepts(&self, level: Level) -> bool {
        level >= self.level
    }

    /// Render and write `event`. Returns the number of bytes written, zero
    /// when the event is filtered out.
    pub fn write_event(&self, event: &Event) -> Result<usize> {
        if !self.accepts(event.level()) {
            return Ok(0);
        }
        let buf = self.format.render(event)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(buf.len())
    }
}

/// A logger writing to local sinks.
#[derive(Debug, Default)]
pub struct LocalLogger {
    sinks: Vec<Sink>,
}

impl LocalLogger {
    pub fn new(sinks: Vec<Sink>) -> Self {
        Self { sinks }
    }

    /// A logger that drops everything.
    pub fn discard() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Sink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Write `event` to every sink. Every sink is attempted; failures are
    /// combined.
    pub fn write_event(&self, event: &Event) -> Result<usize> {
        let mut total = 0;
        let mut errors = Vec::new();
        for sink in &self.sinks {
            match sink.write_event(event) {
                Ok(n) => total += n,
                Err(e) => errors.push(e),
            }
        }
        match Error::combine(errors) {
            Some(e) => Err(e),
            None => Ok(total),
        }
    }

    /// Write raw bytes: an encoded event, or anything else as a plain text
    /// message.
    pub fn write_bytes(&self, buf: &[u8]) -> Result<usize> {
        self.write_event(&Event::from_bytes_lossy(buf))
    }
}
