//! gRPC log client.
//!
//! Events handed to [`LogClient::output`] go through a bounded channel to a
//! dispatcher task. In unary mode the dispatcher makes one `Log` call per
//! event and remote. In stream mode it fans every event out to one link task
//! per remote; each link owns a `LogStream` call and keeps the events the
//! collector has not acknowledged yet, so they can be replayed on a new
//! stream.
//!
//! [`LogClient::close`] stops accepting events, lets the dispatcher and the
//! links deliver what they already hold, and cancels them once
//! `close_timeout` has elapsed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error as _;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::{Code, Request, Status, Streaming};
use tracing::{debug, error, info, trace, warn};

use crate::backoff::{ActionKind, Backoff, Retry};
use crate::config::{ClientConfig, ClientOption, Mode, Scope};
use crate::error::{Error, ErrorSender, Result};
use crate::event::Event;
use crate::logger::Logger;
use crate::proto;
use crate::proto::log_service_client::LogServiceClient;
use crate::remote::{AddressSink, Connection, RemoteSet};

/// Events a stream link buffers: queued for it plus sent but not acknowledged.
const LINK_CAPACITY: usize = 1024;

/// Dial `addr`. Addresses without a scheme are treated as plain `http`.
pub async fn dial(addr: &str, config: &ClientConfig) -> Result<Connection> {
    let uri = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };
    let endpoint = Endpoint::from_shared(uri)
        .map_err(|e| Error::InvalidAddress {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?
        .connect_timeout(config.connect_timeout)
        .tcp_nodelay(true);

    let channel = endpoint.connect().await?;
    Ok(LogServiceClient::new(channel))
}

/// Status codes that mean the connection itself is gone.
fn is_transport_failure(status: &Status) -> bool {
    match status.code() {
        Code::Unavailable | Code::Cancelled | Code::Aborted => true,
        Code::Unknown => status.source().is_some(),
        _ => false,
    }
}

/// Whether a unary delivery failed because the collector went away, so the
/// event is worth resending.
fn is_connection_lost(error: &Error) -> bool {
    match error {
        Error::Status(status) => is_transport_failure(status),
        Error::Transport(_) => true,
        _ => false,
    }
}

fn task_error(joined: std::result::Result<Result<()>, JoinError>) -> Option<Error> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) if e.is_cancelled() => None,
        Err(e) => Some(Error::Task(e.to_string())),
    }
}

struct Link {
    id: u64,
    queue: mpsc::Sender<Event>,
    cancel: CancellationToken,
}

struct Inner {
    config: ClientConfig,
    remotes: RemoteSet,
    backoff: Backoff,
    /// Taken by `close` so the dispatcher sees the end of the channel.
    outbound: Mutex<Option<mpsc::Sender<Event>>>,
    errors: ErrorSender,
    error_rx: Mutex<Option<mpsc::Receiver<Error>>>,
    /// Cancels every task at once.
    done: CancellationToken,
    /// Child of `done`: no new events are accepted.
    closing: CancellationToken,
    tasks: tokio::sync::Mutex<JoinSet<Result<()>>>,
    links: Mutex<HashMap<String, Link>>,
    next_link: AtomicU64,
    /// Addresses that were connected at least once.
    seen: Mutex<HashSet<String>>,
}

/// Client shipping events to one or more collectors.
///
/// Dropping the client cancels its tasks; call [`LogClient::close`] to
/// deliver what is queued, wait for the tasks and collect their errors.
pub struct LogClient {
    inner: Arc<Inner>,
}

impl LogClient {
    /// Resolve `options`, connect and start the delivery tasks.
    pub async fn connect_with(options: impl IntoIterator<Item = ClientOption>) -> Result<Self> {
        Self::start(ClientConfig::resolve(options)).await
    }

    /// Connect to the configured addresses and start the delivery tasks.
    ///
    /// Fails when no address is configured or none of them can be dialed.
    pub async fn start(config: ClientConfig) -> Result<Self> {
        let (outbound, outbound_rx) = mpsc::channel(config.queue_size.max(1));
        let (errors, error_rx) = ErrorSender::channel(config.error_buffer);

        let backoff = Backoff::new(config.max_backoff).with_pending_limit(config.pending_limit);
        let action = match config.mode {
            Mode::Unary => ActionKind::Resend,
            Mode::Stream => ActionKind::Redial,
        };
        backoff.register_action(action, errors.clone());

        let done = CancellationToken::new();
        let inner = Arc::new(Inner {
            remotes: RemoteSet::with_addresses(config.addresses.iter().cloned()),
            config,
            backoff,
            outbound: Mutex::new(Some(outbound)),
            errors,
            error_rx: Mutex::new(Some(error_rx)),
            closing: done.child_token(),
            done,
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            links: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(0),
            seen: Mutex::new(HashSet::new()),
        });

        let live = inner.connect().await?;
        inner.spawn(dispatch(inner.clone(), outbound_rx)).await;
        if inner.config.mode == Mode::Stream {
            inner.spawn_links().await;
        }

        info!(mode = ?inner.config.mode, live, "Log client started");
        Ok(Self { inner })
    }

    pub fn mode(&self) -> Mode {
        self.inner.config.mode
    }

    /// The registry of remotes. Clones share state with the client.
    pub fn remotes(&self) -> RemoteSet {
        self.inner.remotes.clone()
    }

    pub fn backoff(&self) -> &Backoff {
        &self.inner.backoff
    }

    /// Take the receiving half of the error channel. Only the first call
    /// returns it.
    pub fn errors(&self) -> Option<mpsc::Receiver<Error>> {
        lock(&self.inner.error_rx).take()
    }

    /// Whether the client stopped accepting events, through `close` or an
    /// unrecoverable stream failure.
    pub fn is_closed(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    /// Enqueue an event. Waits while the outbound queue is full and fails
    /// with [`Error::Closed`] once the client is closing.
    pub async fn output(&self, event: Event) -> Result<()> {
        if self.inner.closing.is_cancelled() {
            return Err(Error::Closed);
        }
        let Some(outbound) = lock(&self.inner.outbound).clone() else {
            return Err(Error::Closed);
        };
        tokio::select! {
            _ = self.inner.closing.cancelled() => Err(Error::Closed),
            sent = outbound.send(event) => sent.map_err(|_| Error::Closed),
        }
    }

    /// Replace every remote with the addresses of `outs` and connect.
    pub async fn set_outs(&self, outs: &[&dyn AddressSink]) -> Result<()> {
        if self.inner.closing.is_cancelled() {
            return Err(Error::Closed);
        }
        let addrs = collect_addresses(outs);
        for (_, link) in lock(&self.inner.links).drain() {
            link.cancel.cancel();
        }
        self.inner.remotes.reset();
        self.inner.remotes.add(addrs);

        self.inner.connect().await?;
        if self.inner.config.mode == Mode::Stream {
            self.inner.spawn_links().await;
        }
        Ok(())
    }

    /// Add the addresses of `outs` that are not registered yet and connect.
    pub async fn add_outs(&self, outs: &[&dyn AddressSink]) -> Result<()> {
        if self.inner.closing.is_cancelled() {
            return Err(Error::Closed);
        }
        let fresh: Vec<String> = collect_addresses(outs)
            .into_iter()
            .filter(|addr| !self.inner.remotes.contains(addr))
            .collect();
        self.inner.remotes.add(fresh);

        self.inner.connect().await?;
        if self.inner.config.mode == Mode::Stream {
            self.inner.spawn_links().await;
        }
        Ok(())
    }

    /// Deliver the queued events, stop every task, drop every connection
    /// and report what failed.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl Drop for LogClient {
    fn drop(&mut self) {
        self.inner.done.cancel();
    }
}

#[async_trait]
impl Logger for LogClient {
    async fn output(&self, event: Event) -> Result<()> {
        LogClient::output(self, event).await
    }

    async fn set_outs(&self, outs: &[&dyn AddressSink]) -> Result<()> {
        LogClient::set_outs(self, outs).await
    }

    async fn add_outs(&self, outs: &[&dyn AddressSink]) -> Result<()> {
        LogClient::add_outs(self, outs).await
    }

    async fn close(&self) -> Result<()> {
        LogClient::close(self).await
    }

    fn scope(&self) -> &Scope {
        &self.inner.config.scope
    }
}

fn collect_addresses(outs: &[&dyn AddressSink]) -> Vec<String> {
    outs.iter().flat_map(|out| out.addresses()).collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    /// Spawn `task`, reaping the tasks that already finished.
    async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Some(e) = task_error(joined) {
                self.errors.report(e);
            }
        }
        tasks.spawn(task);
    }

    /// Dial every registered address without a live connection.
    ///
    /// An address that was never reachable goes through one backoff cycle
    /// and is then removed. An address that was connected before stays
    /// registered so a later call redials it; when nothing is live, one
    /// backoff cycle runs before giving up. Returns the number of live
    /// connections.
    async fn connect(&self) -> Result<usize> {
        let addrs = self.remotes.keys();
        if addrs.is_empty() {
            return Err(Error::NoAddresses);
        }

        let mut lost = 0;
        for addr in addrs {
            if self.remotes.get(&addr).is_some() {
                continue;
            }
            match dial(&addr, &self.config).await {
                Ok(conn) => {
                    debug!(remote = %addr, "Connected");
                    lock(&self.seen).insert(addr.clone());
                    self.remotes.set(addr, conn);
                }
                Err(e) if lock(&self.seen).contains(&addr) => {
                    debug!(remote = %addr, error = %e, "Collector still unreachable");
                    lost += 1;
                }
                Err(e) => {
                    warn!(remote = %addr, error = %e, "Dial failed");
                    self.backoff.increment();
                    self.backoff.wait()?.run().await;
                    self.remotes.unset([&addr]);
                }
            }
        }

        let live = self.remotes.live();
        if live == 0 {
            if lost > 0 {
                self.backoff.increment();
                match self.backoff.wait() {
                    Ok(retry) => {
                        retry.run().await;
                    }
                    Err(Error::BackoffLocked) => self.backoff.unlocked().await,
                    Err(e) => return Err(e),
                }
            }
            return Err(Error::NoLiveConnections);
        }
        self.backoff.reset();
        Ok(live)
    }

    /// Start a link task for every connected remote that has none.
    async fn spawn_links(self: &Arc<Self>) {
        if self.closing.is_cancelled() {
            return;
        }
        for (addr, conn) in self.remotes.connected() {
            let (queue, rx) = mpsc::channel(LINK_CAPACITY);
            let cancel = self.done.child_token();
            let id = self.next_link.fetch_add(1, Ordering::Relaxed);
            {
                let mut links = lock(&self.links);
                if links.contains_key(&addr) {
                    continue;
                }
                links.insert(
                    addr.clone(),
                    Link {
                        id,
                        queue,
                        cancel: cancel.clone(),
                    },
                );
            }

            let link = StreamLink {
                inner: self.clone(),
                id,
                addr,
                conn: Some(conn),
                queue: rx,
                queue_done: false,
                cancel,
                unacked: VecDeque::new(),
            };
            self.spawn(link.run()).await;
        }
    }

    /// Deliver one event through unary calls, resending parked events
    /// first. With no event, only the parked ones are resent.
    async fn deliver_unary(&self, event: Option<Event>) {
        if let Err(e) = self.connect().await {
            if let Some(event) = event {
                self.park(event);
            }
            warn!(error = %e, pending = self.backoff.pending_len(), "No collector reachable, parking event");
            self.errors.report(e);
            return;
        }

        let mut batch = VecDeque::from(self.backoff.take_pending());
        if !batch.is_empty() {
            debug!(count = batch.len(), "Resending parked events");
        }
        batch.extend(event);

        while let Some(event) = batch.pop_front() {
            match self.send_unary(&event).await {
                Ok(()) => {}
                Err(e) if is_connection_lost(&e) => {
                    warn!(error = %e, parked = batch.len() + 1, "Collector went away, parking events");
                    self.park(event);
                    for event in batch.drain(..) {
                        self.park(event);
                    }
                    self.errors.report(e);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Unary delivery failed");
                    self.errors.report(e);
                }
            }
        }
    }

    fn park(&self, event: Event) {
        if let Some(evicted) = self.backoff.add_event(event) {
            warn!(dropped = %evicted.message(), "Resend buffer full, dropping oldest event");
            self.errors.report(Error::QueueFull("resend buffer".to_string()));
        }
    }

    /// Send `event` to every connected remote, stopping at the first
    /// failure.
    async fn send_unary(&self, event: &Event) -> Result<()> {
        let message = proto::LogEvent::from(event);
        for (addr, mut conn) in self.remotes.connected() {
            let mut request = Request::new(message.clone());
            request.set_timeout(self.config.unary_timeout);

            match conn.log(request).await {
                Ok(response) => {
                    let ack = response.into_inner();
                    if !ack.ok {
                        return Err(Error::NotOk {
                            req_id: ack.req_id,
                            message: ack.error,
                        });
                    }
                    trace!(remote = %addr, req_id = %ack.req_id, bytes = ack.bytes, "Delivered");
                }
                Err(status) => {
                    if is_transport_failure(&status) {
                        debug!(remote = %addr, "Dropping broken connection");
                        self.remotes.disconnect(&addr);
                    }
                    return Err(status.into());
                }
            }
        }
        Ok(())
    }

    /// Hand `event` to every stream link.
    fn fan_out(&self, event: Event) {
        let queues: Vec<(String, mpsc::Sender<Event>)> = lock(&self.links)
            .iter()
            .map(|(addr, link)| (addr.clone(), link.queue.clone()))
            .collect();
        if queues.is_empty() {
            self.errors.report(Error::NoLiveConnections);
            return;
        }

        for (addr, queue) in queues {
            match queue.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(remote = %addr, "Link queue full, dropping event");
                    self.errors.report(Error::QueueFull(addr));
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(remote = %addr, "Link is gone");
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.closing.cancel();
        lock(&self.outbound).take();

        let mut errors = Vec::new();
        {
            let mut tasks = self.tasks.lock().await;
            let grace = tokio::time::sleep(self.config.close_timeout);
            tokio::pin!(grace);
            loop {
                tokio::select! {
                    _ = &mut grace, if !self.done.is_cancelled() => {
                        warn!(
                            pending = self.backoff.pending_len(),
                            "Close timed out, dropping undelivered events"
                        );
                        self.done.cancel();
                    }
                    joined = tasks.join_next() => match joined {
                        Some(joined) => errors.extend(task_error(joined)),
                        None => break,
                    },
                }
            }
        }
        self.done.cancel();
        lock(&self.links).clear();
        self.remotes.disconnect_all();

        info!("Log client closed");
        match Error::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn dispatch(inner: Arc<Inner>, mut events: mpsc::Receiver<Event>) -> Result<()> {
    loop {
        let event = tokio::select! {
            _ = inner.done.cancelled() => break,
            event = events.recv() => event,
        };

        match (inner.config.mode, event) {
            (Mode::Unary, Some(event)) => {
                tokio::select! {
                    _ = inner.done.cancelled() => break,
                    _ = inner.deliver_unary(Some(event)) => {}
                }
            }
            (Mode::Unary, None) => {
                // Last chance for events parked during an outage.
                if inner.backoff.pending_len() > 0 {
                    tokio::select! {
                        _ = inner.done.cancelled() => {}
                        _ = inner.deliver_unary(None) => {}
                    }
                }
                break;
            }
            (Mode::Stream, Some(event)) => inner.fan_out(event),
            (Mode::Stream, None) => {
                // Dropping the queues lets every link drain and stop.
                lock(&inner.links).clear();
                break;
            }
        }
    }
    debug!(parked = inner.backoff.pending_len(), "Dispatcher stopped");
    Ok(())
}

/// How a stream session ended.
enum Outcome {
    /// The link was cancelled or delivered everything after its queue closed.
    Closed,
    /// The stream reached its deadline; open a new one on the same
    /// connection.
    Reconnect,
    /// The collector went away; back off and redial.
    Retry(Error),
    /// Unrecoverable; the whole client shuts down.
    Fatal(Error),
}

enum LinkState {
    Connecting,
    Streaming(Session),
    BackingOff(Retry),
    /// Another task holds the backoff lock.
    AwaitingUnlock,
    Closed,
}

struct Session {
    /// `None` once the stream is half-closed for rotation.
    requests: Option<mpsc::Sender<proto::LogEvent>>,
    acks: Streaming<proto::Ack>,
    deadline: Instant,
}

fn classify(status: Status) -> Outcome {
    match status.code() {
        Code::DeadlineExceeded => Outcome::Reconnect,
        _ if is_transport_failure(&status) => Outcome::Retry(status.into()),
        _ => Outcome::Fatal(status.into()),
    }
}

/// Failing to open a stream never reopens right away.
fn open_failure(error: Error) -> Outcome {
    match error {
        Error::Status(status) => match classify(status) {
            Outcome::Reconnect => {
                Outcome::Retry(Status::deadline_exceeded("stream open timed out").into())
            }
            outcome => outcome,
        },
        e => Outcome::Retry(e),
    }
}

/// Delivery to one remote in stream mode.
struct StreamLink {
    inner: Arc<Inner>,
    id: u64,
    addr: String,
    conn: Option<Connection>,
    queue: mpsc::Receiver<Event>,
    /// The queue was closed and emptied.
    queue_done: bool,
    cancel: CancellationToken,
    /// Sent on the current stream but not acknowledged, oldest first.
    unacked: VecDeque<Event>,
}

impl StreamLink {
    async fn run(mut self) -> Result<()> {
        let mut state = LinkState::Connecting;
        loop {
            state = match state {
                LinkState::Connecting if self.drained() => LinkState::Closed,
                LinkState::Connecting => {
                    let cancel = self.cancel.clone();
                    let opened = tokio::select! {
                        _ = cancel.cancelled() => break,
                        opened = self.open() => opened,
                    };
                    match opened {
                        Ok(session) => {
                            self.inner.backoff.reset();
                            LinkState::Streaming(session)
                        }
                        Err(e) => self.settle(open_failure(e)),
                    }
                }
                LinkState::Streaming(session) => {
                    let outcome = self.pump(session).await;
                    self.settle(outcome)
                }
                LinkState::BackingOff(retry) => tokio::select! {
                    _ = self.cancel.cancelled() => LinkState::Closed,
                    _ = retry.run() => LinkState::Connecting,
                },
                LinkState::AwaitingUnlock => tokio::select! {
                    _ = self.cancel.cancelled() => LinkState::Closed,
                    _ = self.inner.backoff.unlocked() => LinkState::Connecting,
                },
                LinkState::Closed => break,
            };
        }

        let mut links = lock(&self.inner.links);
        if links.get(&self.addr).is_some_and(|link| link.id == self.id) {
            links.remove(&self.addr);
        }
        if self.unacked.is_empty() {
            debug!(remote = %self.addr, "Link stopped");
        } else {
            warn!(remote = %self.addr, unacked = self.unacked.len(), "Link stopped with undelivered events");
        }
        Ok(())
    }

    /// Nothing left to deliver and nothing more will come.
    fn drained(&self) -> bool {
        self.queue_done && self.unacked.is_empty()
    }

    fn settle(&mut self, outcome: Outcome) -> LinkState {
        match outcome {
            Outcome::Closed => LinkState::Closed,
            Outcome::Reconnect => {
                debug!(remote = %self.addr, "Stream deadline reached, reopening");
                LinkState::Connecting
            }
            Outcome::Retry(e) => {
                self.conn = None;
                self.inner.remotes.disconnect(&self.addr);
                self.back_off(e)
            }
            Outcome::Fatal(e) => {
                error!(remote = %self.addr, error = %e, "Stream failed, closing client");
                self.inner.done.cancel();
                self.inner.errors.report(e);
                LinkState::Closed
            }
        }
    }

    fn back_off(&mut self, error: Error) -> LinkState {
        warn!(remote = %self.addr, error = %error, "Collector unavailable, backing off");
        let backoff = &self.inner.backoff;
        backoff.increment();
        match backoff.wait() {
            Ok(retry) => {
                debug!(remote = %self.addr, delay_ms = retry.delay().as_millis() as u64, "Retrying");
                LinkState::BackingOff(retry)
            }
            Err(Error::BackoffLocked) => LinkState::AwaitingUnlock,
            Err(e) => {
                error!(remote = %self.addr, error = %e, "Giving up on collector");
                self.inner.remotes.disconnect(&self.addr);
                LinkState::Closed
            }
        }
    }

    /// Open a stream, redialing when the connection was dropped, and replay
    /// the unacknowledged events on it.
    async fn open(&mut self) -> Result<Session> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let conn = dial(&self.addr, &self.inner.config).await?;
                self.inner.remotes.set(self.addr.clone(), conn.clone());
                conn
            }
        };

        let (requests, rx) = mpsc::channel(LINK_CAPACITY);
        for event in &self.unacked {
            if requests.try_send(proto::LogEvent::from(event)).is_err() {
                break;
            }
        }

        let timeout = self.inner.config.stream_timeout;
        let mut request = Request::new(ReceiverStream::new(rx));
        request.set_timeout(timeout);
        let acks = conn.log_stream(request).await?.into_inner();
        self.conn = Some(conn);

        info!(remote = %self.addr, replayed = self.unacked.len(), "Stream opened");
        Ok(Session {
            requests: Some(requests),
            acks,
            deadline: Instant::now() + timeout,
        })
    }

    /// Move events from the queue onto the stream and match acks to them.
    ///
    /// At the deadline the request side is closed and the remaining acks
    /// are awaited for up to another `stream_timeout`.
    async fn pump(&mut self, mut session: Session) -> Outcome {
        loop {
            if self.drained() {
                return Outcome::Closed;
            }
            let accepting = session.requests.is_some()
                && !self.queue_done
                && self.unacked.len() < LINK_CAPACITY;

            tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Closed,
                _ = tokio::time::sleep_until(session.deadline) => {
                    if session.requests.take().is_none() || self.unacked.is_empty() {
                        return Outcome::Reconnect;
                    }
                    debug!(remote = %self.addr, unacked = self.unacked.len(), "Stream deadline reached, awaiting acks");
                    session.deadline = Instant::now() + self.inner.config.stream_timeout;
                }
                ack = session.acks.message() => match ack {
                    Ok(Some(ack)) => {
                        self.unacked.pop_front();
                        if ack.ok {
                            trace!(remote = %self.addr, req_id = %ack.req_id, bytes = ack.bytes, "Acknowledged");
                        } else {
                            warn!(remote = %self.addr, req_id = %ack.req_id, error = %ack.error, "Collector rejected event");
                            self.inner.errors.report(Error::NotOk {
                                req_id: ack.req_id,
                                message: ack.error,
                            });
                        }
                        if session.requests.is_none() && self.unacked.is_empty() {
                            return Outcome::Reconnect;
                        }
                    }
                    Ok(None) if session.requests.is_none() => return Outcome::Reconnect,
                    Ok(None) => {
                        return Outcome::Retry(Status::unavailable("stream closed by collector").into())
                    }
                    Err(status) => return classify(status),
                },
                event = self.queue.recv(), if accepting => match event {
                    Some(event) => {
                        let message = proto::LogEvent::from(&event);
                        self.unacked.push_back(event);
                        let sent = session
                            .requests
                            .as_ref()
                            .is_some_and(|requests| requests.try_send(message).is_ok());
                        if !sent {
                            return Outcome::Retry(Status::unavailable("request stream closed").into());
                        }
                    }
                    None => self.queue_done = true,
                },
            }
        }
    }
}
