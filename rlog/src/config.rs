//! Client and server configuration.
//!
//! Configuration is resolved explicitly: start from the defaults, then apply
//! each option in order. Later options override earlier ones.

use std::time::Duration;

use serde_json::Value;

use crate::backoff::{DEFAULT_MAX_WAIT, DEFAULT_PENDING_LIMIT};
use crate::event::{Event, EventBuilder, Level, Metadata, DEFAULT_PREFIX};

pub const DEFAULT_LISTEN: &str = "[::1]:9099";

/// Delivery mode of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// One request/response call per event and remote.
    #[default]
    Unary,
    /// One long-lived bidirectional stream per remote.
    Stream,
}

/// Defaults applied to events created through the convenience calls.
#[derive(Debug, Clone)]
pub struct Scope {
    pub prefix: String,
    pub sub: String,
    pub metadata: Metadata,
    /// Do not exit or panic after `fatal`/`panic` level calls.
    pub skip_exit: bool,
}

impl Default for Scope {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            sub: String::new(),
            metadata: Metadata::new(),
            skip_exit: false,
        }
    }
}

impl Scope {
    /// A builder pre-filled with this scope.
    pub fn builder(&self) -> EventBuilder {
        Event::builder()
            .prefix(self.prefix.clone())
            .sub(self.sub.clone())
            .metadata(self.metadata.clone())
    }

    pub fn event(&self, level: Level, message: impl Into<String>) -> Event {
        self.builder().level(level).message(message).build()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub addresses: Vec<String>,
    pub mode: Mode,
    pub max_backoff: Duration,
    /// Capacity of the outbound event channel.
    pub queue_size: usize,
    pub connect_timeout: Duration,
    pub unary_timeout: Duration,
    pub stream_timeout: Duration,
    /// How long `close` waits for queued and unacknowledged events.
    pub close_timeout: Duration,
    /// Events parked for resend while no collector is reachable.
    pub pending_limit: usize,
    pub error_buffer: usize,
    pub scope: Scope,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            mode: Mode::Unary,
            max_backoff: DEFAULT_MAX_WAIT,
            queue_size: 1,
            connect_timeout: Duration::from_secs(5),
            unary_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(3600),
            close_timeout: Duration::from_secs(5),
            pending_limit: DEFAULT_PENDING_LIMIT,
            error_buffer: 64,
            scope: Scope::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientOption {
    Address(String),
    Addresses(Vec<String>),
    Mode(Mode),
    MaxBackoff(Duration),
    QueueSize(usize),
    ConnectTimeout(Duration),
    UnaryTimeout(Duration),
    StreamTimeout(Duration),
    CloseTimeout(Duration),
    PendingLimit(usize),
    ErrorBuffer(usize),
    Prefix(String),
    Sub(String),
    Field(String, Value),
    SkipExit(bool),
}

impl ClientOption {
    pub fn apply(self, config: &mut ClientConfig) {
        match self {
            ClientOption::Address(addr) => config.addresses.push(addr),
            ClientOption::Addresses(addrs) => config.addresses = addrs,
            ClientOption::Mode(mode) => config.mode = mode,
            ClientOption::MaxBackoff(d) => config.max_backoff = d,
            ClientOption::QueueSize(n) => config.queue_size = n.max(1),
            ClientOption::ConnectTimeout(d) => config.connect_timeout = d,
            ClientOption::UnaryTimeout(d) => config.unary_timeout = d,
            ClientOption::StreamTimeout(d) => config.stream_timeout = d,
            ClientOption::CloseTimeout(d) => config.close_timeout = d,
            ClientOption::PendingLimit(n) => config.pending_limit = n.max(1),
            ClientOption::ErrorBuffer(n) => config.error_buffer = n.max(1),
            ClientOption::Prefix(p) => config.scope.prefix = p,
            ClientOption::Sub(s) => config.scope.sub = s,
            ClientOption::Field(k, v) => {
                config.scope.metadata.insert(k, v);
            }
            ClientOption::SkipExit(skip) => config.scope.skip_exit = skip,
        }
    }
}

impl ClientConfig {
    pub fn resolve(options: impl IntoIterator<Item = ClientOption>) -> Self {
        let mut config = Self::default();
        for option in options {
            option.apply(&mut config);
        }
        config
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub http2_keepalive: Option<Duration>,
    pub concurrency_limit: Option<usize>,
    /// Capacity of the router's inbound channel.
    pub inbound_buffer: usize,
    pub error_buffer: usize,
    /// Prefix of the events the server emits about itself.
    pub service_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            http2_keepalive: Some(Duration::from_secs(60)),
            concurrency_limit: None,
            inbound_buffer: 64,
            error_buffer: 64,
            service_prefix: "rlog-collector".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServerOption {
    Listen(String),
    Http2Keepalive(Option<Duration>),
    ConcurrencyLimit(Option<usize>),
    InboundBuffer(usize),
    ErrorBuffer(usize),
    ServicePrefix(String),
}

impl ServerOption {
    pub fn apply(self, config: &mut ServerConfig) {
        match self {
            ServerOption::Listen(addr) => config.listen = addr,
            ServerOption::Http2Keepalive(d) => config.http2_keepalive = d,
            ServerOption::ConcurrencyLimit(n) => config.concurrency_limit = n,
            ServerOption::InboundBuffer(n) => config.inbound_buffer = n.max(1),
            ServerOption::ErrorBuffer(n) => config.error_buffer = n.max(1),
            ServerOption::ServicePrefix(p) => config.service_prefix = p,
        }
    }
}

impl ServerConfig {
    pub fn resolve(options: impl IntoIterator<Item = ServerOption>) -> Self {
        let mut config = Self::default();
        for option in options {
            option.apply(&mut config);
        }
        config
    }
}
