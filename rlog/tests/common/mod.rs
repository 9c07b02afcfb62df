//! Shared test utilities for rlog integration tests.

#![allow(dead_code)]

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rlog::{
    ClientConfig, Event, Format, LocalLogger, LogClient, LogServer, Mode, ServerConfig, Sink,
};
use tokio::task::JoinHandle;

/// Allocate a port nothing listens on.
pub fn unused_addr() -> String {
    let port = portpicker::pick_unused_port().expect("No available port");
    format!("127.0.0.1:{port}")
}

/// In-memory writer the collector renders JSON lines into.
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    pub fn events(&self) -> Vec<Event> {
        let buf = self.0.lock().unwrap().clone();
        String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).expect("Invalid JSON line"))
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e.message().to_string())
            .collect()
    }

    /// Wait until at least `count` events arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<Event> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let events = self.events();
            if events.len() >= count {
                return events;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "Timed out waiting for {count} events, got {}",
                events.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Writer that always fails.
pub struct Broken;

impl Write for Broken {
    fn write(&mut self, _: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "disk gone"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A collector serving on an OS-assigned port.
pub struct TestCollector {
    pub addr: SocketAddr,
    pub output: Capture,
    pub server: Arc<LogServer>,
    serving: JoinHandle<rlog::Result<()>>,
}

impl TestCollector {
    pub async fn spawn() -> Self {
        Self::spawn_at("127.0.0.1:0").await
    }

    /// A collector on a fixed address, e.g. to restart one that was shut
    /// down.
    pub async fn spawn_at(listen: &str) -> Self {
        let output = Capture::default();
        let data = LocalLogger::new(vec![Sink::new(output.clone(), Format::Json)]);
        Self::spawn_with(listen, data, output).await
    }

    /// A collector whose data sink always fails.
    pub async fn spawn_broken() -> Self {
        let data = LocalLogger::new(vec![Sink::new(Broken, Format::Json)]);
        Self::spawn_with("127.0.0.1:0", data, Capture::default()).await
    }

    async fn spawn_with(listen: &str, data: LocalLogger, output: Capture) -> Self {
        let config = ServerConfig {
            listen: listen.to_string(),
            ..ServerConfig::default()
        };
        let server = Arc::new(LogServer::new(config, data, LocalLogger::discard()));
        let addr = server.listen().await.expect("Failed to bind");

        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve().await })
        };

        Self {
            addr,
            output,
            server,
            serving,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Stop the collector and wait for serve() to return.
    pub async fn shutdown(self) -> rlog::Result<()> {
        self.server.stop();
        tokio::time::timeout(Duration::from_secs(10), self.serving)
            .await
            .expect("serve() did not return after stop()")
            .expect("serve task panicked")
    }
}

pub fn client_config(addresses: Vec<String>, mode: Mode) -> ClientConfig {
    ClientConfig {
        addresses,
        mode,
        ..ClientConfig::default()
    }
}

pub async fn start_client(addresses: Vec<String>, mode: Mode) -> LogClient {
    start_with(client_config(addresses, mode)).await
}

pub async fn start_with(config: ClientConfig) -> LogClient {
    LogClient::start(config)
        .await
        .expect("Failed to start client")
}

/// Wait for the first error on `errors` matching `wanted`.
pub async fn wait_for_error(
    errors: &mut tokio::sync::mpsc::Receiver<rlog::Error>,
    wanted: impl Fn(&rlog::Error) -> bool,
) -> rlog::Error {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match errors.recv().await {
                Some(error) if wanted(&error) => return error,
                Some(_) => continue,
                None => panic!("Error channel closed"),
            }
        }
    })
    .await
    .expect("Expected error was not reported")
}
