//! The logger abstraction shared by clients and composites.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::config::Scope;
use crate::error::Result;
use crate::event::{Event, Level, Metadata};
use crate::remote::AddressSink;

/// Something events can be handed to.
#[async_trait]
pub trait Logger: Send + Sync {
    /// Enqueue an event for delivery.
    async fn output(&self, event: Event) -> Result<()>;

    /// Write raw bytes. Bytes holding an encoded event are forwarded as that
    /// event; anything else becomes an info-level message.
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.output(Event::from_bytes_lossy(buf)).await?;
        Ok(buf.len())
    }

    /// Replace the outputs with the addresses exposed by `outs`.
    async fn set_outs(&self, outs: &[&dyn AddressSink]) -> Result<()>;

    /// Add the addresses exposed by `outs` that are not already known.
    async fn add_outs(&self, outs: &[&dyn AddressSink]) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Defaults applied by the convenience calls.
    fn scope(&self) -> &Scope;

    /// Members of a composite logger. `None` for leaf loggers.
    fn members(&self) -> Option<Vec<Arc<dyn Logger>>> {
        None
    }
}

/// Level-named convenience calls for every [`Logger`].
#[async_trait]
pub trait LoggerExt: Logger {
    async fn log(&self, level: Level, message: &str) -> Result<()> {
        self.output(self.scope().event(level, message)).await
    }

    async fn log_with(&self, level: Level, message: &str, metadata: Metadata) -> Result<()> {
        let event = self
            .scope()
            .builder()
            .level(level)
            .message(message)
            .metadata(metadata)
            .build();
        self.output(event).await
    }

    async fn trace(&self, message: &str) -> Result<()> {
        self.log(Level::Trace, message).await
    }

    async fn debug(&self, message: &str) -> Result<()> {
        self.log(Level::Debug, message).await
    }

    async fn info(&self, message: &str) -> Result<()> {
        self.log(Level::Info, message).await
    }

    async fn warn(&self, message: &str) -> Result<()> {
        self.log(Level::Warn, message).await
    }

    async fn error(&self, message: &str) -> Result<()> {
        self.log(Level::Error, message).await
    }

    /// Log at fatal level, then exit the process unless the scope sets
    /// `skip_exit`.
    async fn fatal(&self, message: &str) -> Result<()> {
        let result = self.log(Level::Fatal, message).await;
        if !self.scope().skip_exit {
            if let Err(e) = self.close().await {
                error!(error = %e, "Close before exit failed");
            }
            std::process::exit(1);
        }
        result
    }

    /// Log at panic level, then panic unless the scope sets `skip_exit`.
    async fn panic(&self, message: &str) -> Result<()> {
        let event = self
            .scope()
            .builder()
            .level(Level::Panic)
            .message(message)
            .with_call_stack(false)
            .build();
        let result = self.output(event).await;
        if !self.scope().skip_exit {
            panic!("{message}");
        }
        result
    }
}

impl<T: Logger + ?Sized> LoggerExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
        scope: Scope,
    }

    #[async_trait]
    impl Logger for Recorder {
        async fn output(&self, event: Event) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }

        async fn set_outs(&self, _outs: &[&dyn AddressSink]) -> Result<()> {
            Ok(())
        }

        async fn add_outs(&self, _outs: &[&dyn AddressSink]) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn scope(&self) -> &Scope {
            &self.scope
        }
    }

    #[tokio::test]
    async fn convenience_calls_use_scope() {
        let recorder = Recorder {
            scope: Scope {
                prefix: "api".into(),
                sub: "auth".into(),
                skip_exit: true,
                ..Scope::default()
            },
            ..Recorder::default()
        };

        recorder.warn("slow").await.unwrap();
        recorder.fatal("down").await.unwrap();

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].prefix(), "api");
        assert_eq!(events[0].level(), Level::Warn);
        assert_eq!(events[1].level(), Level::Fatal);
    }

    #[tokio::test]
    async fn panic_with_skip_exit_attaches_call_stack() {
        let recorder = Recorder {
            scope: Scope {
                skip_exit: true,
                ..Scope::default()
            },
            ..Recorder::default()
        };

        recorder.panic("boom").await.unwrap();

        let events = recorder.events.lock().unwrap();
        assert_eq!(events[0].level(), Level::Panic);
        assert!(events[0].metadata().contains_key(crate::event::CALLSTACK_KEY));
    }

    #[tokio::test]
    #[should_panic(expected = "boom")]
    async fn panic_level_panics() {
        let recorder = Recorder::default();
        let _ = recorder.panic("boom").await;
    }

    #[tokio::test]
    async fn write_falls_back_to_text() {
        let recorder = Recorder::default();
        let n = recorder.write(b"hello\n").await.unwrap();
        assert_eq!(n, 6);

        let events = recorder.events.lock().unwrap();
        assert_eq!(events[0].message(), "hello");
        assert_eq!(events[0].level(), Level::Info);
    }
}
