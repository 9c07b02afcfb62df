use anyhow::{Context, Result};
use rlog::{Event, Level, Scope};
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::shipper::map_level;

/// Keys a JSON line may carry its level in, by preference.
const LEVEL_KEYS: [&str; 2] = ["level", "PRIORITY"];

/// Keys a JSON line may carry its message in, by preference.
const MESSAGE_KEYS: [&str; 2] = ["message", "msg"];

/// Reads lines from stdin or a file and yields events
pub struct LineSource {
    path: Option<PathBuf>,
    scope: Scope,
}

impl LineSource {
    /// `None` reads from stdin
    pub fn new(path: Option<PathBuf>, scope: Scope) -> Self {
        Self { path, scope }
    }

    pub async fn run(&self, sender: mpsc::Sender<Event>) -> Result<u64> {
        match &self.path {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("Failed to open input {}", path.display()))?;
                self.pump(BufReader::new(file), sender).await
            }
            None => self.pump(BufReader::new(tokio::io::stdin()), sender).await,
        }
    }

    async fn pump<R>(&self, reader: R, sender: mpsc::Sender<Event>) -> Result<u64>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut line_count: u64 = 0;

        while let Some(line) = lines.next_line().await? {
            let event = match parse_line(&line, &self.scope) {
                Some(e) => e,
                None => continue,
            };
            if sender.send(event).await.is_err() {
                break;
            }
            line_count += 1;
        }

        tracing::debug!(lines = line_count, "Input exhausted");
        Ok(line_count)
    }
}

/// Turn one input line into an event.
///
/// JSON objects use `level` (or a syslog `PRIORITY`) and `message`/`msg`;
/// every other key becomes metadata. Anything else is an info message.
/// Blank lines yield nothing.
pub fn parse_line(line: &str, scope: &Scope) -> Option<Event> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    let mut object = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(object)) => object,
        _ => return Some(scope.event(Level::Info, line)),
    };

    let level = LEVEL_KEYS
        .iter()
        .find_map(|key| object.remove(*key))
        .map(|v| match v {
            Value::String(s) => map_level(&s),
            other => map_level(&other.to_string()),
        })
        .unwrap_or(Level::Info);

    // Only a string is taken as the message; anything else stays metadata.
    let message = MESSAGE_KEYS
        .iter()
        .find(|key| object.get(**key).is_some_and(Value::is_string))
        .and_then(|key| object.remove(*key))
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    Some(
        scope
            .builder()
            .level(level)
            .message(message)
            .metadata(object)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        Scope {
            prefix: "shipper".into(),
            ..Scope::default()
        }
    }

    #[test]
    fn parse_json_line() {
        let line = r#"{"level":"error","message":"disk full","device":"sda","used":97}"#;
        let event = parse_line(line, &scope()).unwrap();
        assert_eq!(event.level(), Level::Error);
        assert_eq!(event.message(), "disk full");
        assert_eq!(event.prefix(), "shipper");
        assert_eq!(event.metadata()["device"], "sda");
        assert_eq!(event.metadata()["used"], 97);
        assert!(!event.metadata().contains_key("level"));
    }

    #[test]
    fn parse_msg_and_priority() {
        let line = r#"{"msg":"link down","PRIORITY":"4"}"#;
        let event = parse_line(line, &scope()).unwrap();
        assert_eq!(event.level(), Level::Warn);
        assert_eq!(event.message(), "link down");
        assert!(event.metadata().is_empty());
    }

    #[test]
    fn unused_message_keys_stay_in_metadata() {
        let line = r#"{"message":"upload done","msg":"legacy text"}"#;
        let event = parse_line(line, &scope()).unwrap();
        assert_eq!(event.message(), "upload done");
        assert_eq!(event.metadata()["msg"], "legacy text");

        let line = r#"{"message":{"code":7},"msg":"fallback"}"#;
        let event = parse_line(line, &scope()).unwrap();
        assert_eq!(event.message(), "fallback");
        assert_eq!(event.metadata()["message"]["code"], 7);

        let line = r#"{"message":42}"#;
        let event = parse_line(line, &scope()).unwrap();
        assert_eq!(event.message(), "");
        assert_eq!(event.metadata()["message"], 42);
    }

    #[test]
    fn parse_plain_text_is_info() {
        let event = parse_line("service started\r\n", &scope()).unwrap();
        assert_eq!(event.level(), Level::Info);
        assert_eq!(event.message(), "service started");
    }

    #[test]
    fn parse_json_array_is_plain_text() {
        let event = parse_line("[1,2,3]", &scope()).unwrap();
        assert_eq!(event.message(), "[1,2,3]");
    }

    #[test]
    fn parse_blank_line_returns_none() {
        assert!(parse_line("", &scope()).is_none());
        assert!(parse_line("   \n", &scope()).is_none());
    }

    #[tokio::test]
    async fn reads_every_line_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.log");
        std::fs::write(&path, "one\n\n{\"message\":\"two\"}\nthree\n").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let source = LineSource::new(Some(path), scope());
        assert_eq!(source.run(tx).await.unwrap(), 3);

        let mut messages = Vec::new();
        while let Some(event) = rx.recv().await {
            messages.push(event.message().to_string());
        }
        assert_eq!(messages, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let source = LineSource::new(Some(dir.path().join("missing")), scope());
        assert!(source.run(tx).await.is_err());
    }
}
