//! gRPC log collector.
//!
//! Both RPC handlers decode incoming events and hand them to a router. The
//! router's message task writes each event to the data logger and answers
//! with an acknowledgement; a second task drains the collector's own
//! diagnostics into the service logger.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Code, Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::{ServerConfig, ServerOption};
use crate::error::{Error, ErrorSender, Result};
use crate::event::{Event, Level};
use crate::proto;
use crate::proto::log_service_server::{LogService, LogServiceServer};
use crate::sink::LocalLogger;

/// Capacity of the collector's own diagnostics channel.
const SERVICE_BUFFER: usize = 256;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn rejected(error: impl ToString) -> proto::Ack {
    proto::Ack {
        ok: false,
        req_id: Ulid::new().to_string(),
        error: error.to_string(),
        bytes: 0,
    }
}

/// An event waiting to be written, with the channel its ack goes back on.
struct Inbound {
    event: Event,
    reply: oneshot::Sender<proto::Ack>,
}

struct Router {
    inbound: mpsc::Sender<Inbound>,
    service: mpsc::Sender<Event>,
    service_prefix: String,
    errors: ErrorSender,
    done: CancellationToken,
}

impl Router {
    /// Record something about the collector itself.
    fn notify(&self, level: Level, message: impl Into<String>, peer: &str) {
        let message = message.into();
        debug!(peer, "{message}");
        let event = Event::builder()
            .prefix(self.service_prefix.clone())
            .sub("router")
            .level(level)
            .message(message)
            .field("peer", peer)
            .build();
        if self.service.try_send(event).is_err() {
            debug!("Service log channel full, dropping diagnostic");
        }
    }

    /// Queue `event` for the message task and wait for its ack.
    async fn route(&self, event: Event) -> std::result::Result<proto::Ack, Status> {
        let (reply, ack) = oneshot::channel();
        self.inbound
            .send(Inbound { event, reply })
            .await
            .map_err(|_| Status::unavailable("collector is shutting down"))?;
        ack.await
            .map_err(|_| Status::unavailable(Error::NoResponse.to_string()))
    }

    /// Decode and route one message, turning anything the collector refuses
    /// into a rejected ack.
    async fn accept(
        &self,
        message: proto::LogEvent,
        peer: &str,
    ) -> std::result::Result<proto::Ack, Status> {
        match Event::try_from(message) {
            Ok(event) => self.route(event).await,
            Err(e) => {
                self.notify(Level::Warn, format!("rejected event: {e}"), peer);
                Ok(rejected(e))
            }
        }
    }
}

async fn handle_messages(
    mut inbound: mpsc::Receiver<Inbound>,
    data: Arc<LocalLogger>,
    router: Arc<Router>,
) {
    loop {
        let Inbound { event, reply } = tokio::select! {
            _ = router.done.cancelled() => break,
            next = inbound.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };

        let data = data.clone();
        let written = tokio::task::spawn_blocking(move || data.write_event(&event))
            .await
            .map_err(|e| Error::Task(e.to_string()))
            .and_then(|written| written);

        let ack = match written {
            Ok(bytes) => proto::Ack {
                ok: true,
                req_id: Ulid::new().to_string(),
                error: String::new(),
                bytes: bytes as i64,
            },
            Err(e) => {
                warn!(error = %e, "Failed to write event");
                router.notify(Level::Error, format!("write failed: {e}"), "local");
                rejected(e)
            }
        };
        // The caller may have gone away.
        let _ = reply.send(ack);
    }
    debug!("Message handler stopped");
}

/// Write the collector's diagnostics to the service logger. Returns how
/// many writes failed.
async fn drain_service_log(
    mut events: mpsc::Receiver<Event>,
    service: Arc<LocalLogger>,
    done: CancellationToken,
) -> usize {
    let mut failed = 0;
    loop {
        let event = tokio::select! {
            _ = done.cancelled() => break,
            next = events.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        if write_service_event(&service, event).await.is_err() {
            failed += 1;
        }
    }
    while let Ok(event) = events.try_recv() {
        if write_service_event(&service, event).await.is_err() {
            failed += 1;
        }
    }
    failed
}

async fn write_service_event(service: &Arc<LocalLogger>, event: Event) -> Result<usize> {
    let service = service.clone();
    let written = tokio::task::spawn_blocking(move || service.write_event(&event))
        .await
        .map_err(|e| Error::Task(e.to_string()))
        .and_then(|written| written);
    if let Err(e) = &written {
        warn!(error = %e, "Failed to write service log");
    }
    written
}

/// The `LogService` implementation handed to tonic.
struct CollectorService {
    router: Arc<Router>,
}

fn peer_of<T>(request: &Request<T>) -> String {
    request
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[tonic::async_trait]
impl LogService for CollectorService {
    async fn log(
        &self,
        request: Request<proto::LogEvent>,
    ) -> std::result::Result<Response<proto::Ack>, Status> {
        let peer = peer_of(&request);
        let ack = self.router.accept(request.into_inner(), &peer).await?;
        Ok(Response::new(ack))
    }

    type LogStreamStream = ReceiverStream<std::result::Result<proto::Ack, Status>>;

    async fn log_stream(
        &self,
        request: Request<Streaming<proto::LogEvent>>,
    ) -> std::result::Result<Response<Self::LogStreamStream>, Status> {
        let peer = peer_of(&request);
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        let router = self.router.clone();

        router.notify(Level::Info, "stream opened", &peer);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = router.done.cancelled() => break,
                    next = inbound.message() => next,
                };
                match next {
                    Ok(Some(message)) => {
                        let reply = router.accept(message, &peer).await;
                        let failed = reply.is_err();
                        if tx.send(reply).await.is_err() || failed {
                            break;
                        }
                    }
                    Ok(None) => {
                        router.notify(Level::Info, "stream closed by peer", &peer);
                        break;
                    }
                    Err(status) if status.code() == Code::Cancelled => {
                        router.notify(Level::Info, "stream cancelled by peer", &peer);
                        break;
                    }
                    Err(status) => {
                        router.notify(Level::Error, format!("stream failed: {status}"), &peer);
                        router.errors.report(Error::Status(status.clone()));
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

struct Tasks {
    inbound: mpsc::Receiver<Inbound>,
    service: mpsc::Receiver<Event>,
}

/// Collector accepting events from log clients.
pub struct LogServer {
    config: ServerConfig,
    router: Arc<Router>,
    data: Arc<LocalLogger>,
    service: Arc<LocalLogger>,
    tasks: Mutex<Option<Tasks>>,
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    error_rx: Mutex<Option<mpsc::Receiver<Error>>>,
}

impl LogServer {
    /// `data` receives the events clients send; `service` receives the
    /// collector's own diagnostics.
    pub fn new(config: ServerConfig, data: LocalLogger, service: LocalLogger) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_buffer.max(1));
        let (service_tx, service_rx) = mpsc::channel(SERVICE_BUFFER);
        let (errors, error_rx) = ErrorSender::channel(config.error_buffer);

        let router = Arc::new(Router {
            inbound: inbound_tx,
            service: service_tx,
            service_prefix: config.service_prefix.clone(),
            errors,
            done: CancellationToken::new(),
        });

        Self {
            config,
            router,
            data: Arc::new(data),
            service: Arc::new(service),
            tasks: Mutex::new(Some(Tasks {
                inbound: inbound_rx,
                service: service_rx,
            })),
            listener: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
            error_rx: Mutex::new(Some(error_rx)),
        }
    }

    pub fn with_options(
        options: impl IntoIterator<Item = ServerOption>,
        data: LocalLogger,
        service: LocalLogger,
    ) -> Self {
        Self::new(ServerConfig::resolve(options), data, service)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Take the receiving half of the error channel. Only the first call
    /// returns it.
    pub fn errors(&self) -> Option<mpsc::Receiver<Error>> {
        lock(&self.error_rx).take()
    }

    /// The bound address, once [`LogServer::listen`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Bind the configured address.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let addr = self.config.listen.clone();
        let listener = match TcpListener::bind(addr.as_str()).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %addr, error = %e, "Failed to listen");
                self.router.errors.report(Error::Listen {
                    addr: addr.clone(),
                    source: std::io::Error::new(e.kind(), e.to_string()),
                });
                return Err(Error::Listen { addr, source: e });
            }
        };

        let local = listener.local_addr()?;
        *lock(&self.local_addr) = Some(local);
        *self.listener.lock().await = Some(listener);
        self.router
            .notify(Level::Info, format!("listening on {local}"), "local");
        info!(addr = %local, "Collector listening");
        Ok(local)
    }

    /// Serve until [`LogServer::stop`] is called. Binds first when
    /// [`LogServer::listen`] was not called.
    pub async fn serve(&self) -> Result<()> {
        if self.listener.lock().await.is_none() {
            self.listen().await?;
        }
        let listener = self.listener.lock().await.take().ok_or(Error::Closed)?;
        let tasks = lock(&self.tasks).take().ok_or(Error::Closed)?;

        let messages = tokio::spawn(handle_messages(
            tasks.inbound,
            self.data.clone(),
            self.router.clone(),
        ));
        let diagnostics = tokio::spawn(drain_service_log(
            tasks.service,
            self.service.clone(),
            self.router.done.clone(),
        ));

        let mut builder = Server::builder().http2_keepalive_interval(self.config.http2_keepalive);
        if let Some(limit) = self.config.concurrency_limit {
            builder = builder.concurrency_limit_per_connection(limit);
        }

        let service = CollectorService {
            router: self.router.clone(),
        };
        let done = self.router.done.clone();
        let served = builder
            .add_service(LogServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                done.cancelled().await
            })
            .await;

        // A transport failure ends serving just like stop() does.
        self.router.done.cancel();
        if let Err(e) = messages.await {
            warn!(error = %e, "Message task failed");
        }
        match diagnostics.await {
            Ok(0) => {}
            Ok(failed) => warn!(failed, "Some service log writes failed"),
            Err(e) => warn!(error = %e, "Service log task failed"),
        }

        match served {
            Ok(()) => {
                info!("Collector stopped");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                error!(error = %message, "Collector failed");
                self.router.errors.report(Error::Serve(message.clone()));
                Err(Error::Serve(message))
            }
        }
    }

    /// Stop serving. Events already taken by the message task are still
    /// written and acknowledged.
    pub fn stop(&self) {
        self.router.done.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.router.done.is_cancelled()
    }
}

#[async_trait]
impl crate::multi::Collector for LogServer {
    async fn serve(&self) -> Result<()> {
        LogServer::serve(self).await
    }

    fn stop(&self) {
        LogServer::stop(self)
    }
}
