use anyhow::Result;
use rlog::{Error, Event, Level, LogClient};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Maps a level name or a syslog priority (0-7) to a Level
pub fn map_level(raw: &str) -> Level {
    let raw = raw.trim();
    match raw.parse::<u8>() {
        Ok(priority) => match priority {
            0 => Level::Panic,
            1 | 2 => Level::Fatal,
            3 => Level::Error,
            4 => Level::Warn,
            5 | 6 => Level::Info,
            7 => Level::Debug,
            _ => Level::Info,
        },
        Err(_) => raw.parse().unwrap_or(Level::Info),
    }
}

/// Log errors the client reports in the background until it closes
pub async fn report_errors(mut errors: mpsc::Receiver<Error>) {
    while let Some(e) = errors.recv().await {
        warn!(error = %e, "Delivery problem");
    }
}

/// Forward events to the collectors until the input is exhausted
pub async fn run_shipper(client: &LogClient, mut receiver: mpsc::Receiver<Event>) -> Result<u64> {
    let mut shipped: u64 = 0;

    while let Some(event) = receiver.recv().await {
        if let Err(e) = client.output(event).await {
            warn!(error = %e, "Client closed, stopping");
            return Err(e.into());
        }
        shipped += 1;
    }

    debug!(shipped, "Shipper finished");
    Ok(shipped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_mapping() {
        assert_eq!(map_level("0"), Level::Panic);
        assert_eq!(map_level("1"), Level::Fatal);
        assert_eq!(map_level("2"), Level::Fatal);
        assert_eq!(map_level("3"), Level::Error);
        assert_eq!(map_level("4"), Level::Warn);
        assert_eq!(map_level("5"), Level::Info);
        assert_eq!(map_level("6"), Level::Info);
        assert_eq!(map_level("7"), Level::Debug);
    }

    #[test]
    fn unknown_priority_defaults_to_info() {
        assert_eq!(map_level("255"), Level::Info);
        assert_eq!(map_level("8"), Level::Info);
    }

    #[test]
    fn level_names() {
        assert_eq!(map_level("warning"), Level::Warn);
        assert_eq!(map_level(" ERROR "), Level::Error);
        assert_eq!(map_level("trace"), Level::Trace);
    }

    #[test]
    fn unknown_name_defaults_to_info() {
        assert_eq!(map_level("verbose"), Level::Info);
        assert_eq!(map_level(""), Level::Info);
    }
}
