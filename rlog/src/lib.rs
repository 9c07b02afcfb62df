//! rlog: structured log shipping over gRPC
//!
//! A [`LogClient`] ships [`Event`]s to one or more collectors, either with one
//! unary call per event or over long-lived bidirectional streams. A
//! [`LogServer`] accepts them and writes them to local [`Sink`]s.
//!
//! # Example (client)
//! ```ignore
//! use rlog::{ClientOption, LogClient, LoggerExt, Mode};
//!
//! let client = LogClient::connect_with([
//!     ClientOption::Address("[::1]:9099".into()),
//!     ClientOption::Mode(Mode::Stream),
//!     ClientOption::Prefix("billing".into()),
//! ])
//! .await?;
//! client.info("invoice sent").await?;
//! client.close().await?;
//! ```
//!
//! # Example (collector)
//! ```ignore
//! use rlog::{Format, LocalLogger, LogServer, ServerConfig, Sink};
//!
//! let data = LocalLogger::new(vec![Sink::stdout(Format::Json)]);
//! let server = LogServer::new(ServerConfig::default(), data, LocalLogger::discard());
//! server.serve().await?;
//! ```

pub mod proto {
    tonic::include_proto!("rlog.v1");
}

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod logger;
pub mod multi;
pub mod remote;
pub mod server;
pub mod sink;

// Re-export commonly used types at crate root
pub use proto::log_service_client::LogServiceClient;
pub use proto::log_service_server::{LogService, LogServiceServer};

pub use backoff::{ActionKind, Backoff, Retry};
pub use client::LogClient;
pub use config::{ClientConfig, ClientOption, Mode, Scope, ServerConfig, ServerOption};
pub use error::{Error, Result};
pub use event::{Event, EventBuilder, Level, Metadata};
pub use logger::{Logger, LoggerExt};
pub use multi::{multi_collector, multi_logger, Collector, MultiCollector, MultiLogger};
pub use remote::{AddressSink, Connection, RemoteSet};
pub use server::LogServer;
pub use sink::{Format, LocalLogger, Sink};
