//! The multiplexed connection.
//!
//! One [`Connection`] owns one long-lived socket. Any number of tasks
//! submit requests through [`Connection::exec`]; a single driver task
//! runs [`Connection::run`], which resolves, connects, performs the
//! HELLO handshake and then keeps four cooperating activities going:
//!
//! ```text
//! exec() ──► queue ──► writer ──► socket ──► reader ──► adapters
//!                                               │
//!                                               └──► push rendezvous ──► receive_push()
//! ```
//!
//! The reader matches inbound frames against the queue head in strict
//! FIFO order; frames whose root type is `push` bypass the queue and
//! block the reader on the rendezvous until a consumer takes them. A
//! health pinger and an idle checker ride alongside; when any activity
//! finishes, the run cycle tears down, applies the connection-lost
//! policy to queued entries and reconnects when enabled.
//!
//! All shared state lives behind short mutex sections that are never
//! held across a suspension point.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

use crate::adapter::{ErasedAdapter, Ignore, ResponseAdapter};
use crate::error::{Error, Result};
use crate::queue::{Entry, Queue};
use crate::rendezvous::Rendezvous;
use crate::request::{Request, RequestConfig};
use crate::resp3::{parser, FrameType, PUSH_INDEX};
use crate::transport::{Connector, TcpConnector};

/// Tag carried by the internal health ping.
const HEALTH_CHECK_TAG: &str = "redmux-health";

/// Initial read buffer capacity; the buffer grows on demand up to
/// `Config::max_read_size`.
const READ_BUFFER_CAPACITY: usize = 4 * 1024;

/// Connection configuration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Username if authentication is required.
    pub username: String,
    /// Password if authentication is required.
    pub password: String,
    /// Timeout of the resolve step.
    pub resolve_timeout: Duration,
    /// Timeout of each connect attempt.
    pub connect_timeout: Duration,
    /// Interval between health pings; no data for twice this long
    /// fails the run with `IdleTimeout`.
    pub ping_interval: Duration,
    /// Wait before a reconnection attempt (see `enable_reconnect`).
    pub reconnect_interval: Duration,
    /// Upper bound on the read buffer and on any single declared
    /// bulk/aggregate size.
    pub max_read_size: usize,
    /// Batch neighboring requests into a single write.
    pub coalesce_requests: bool,
    /// Publish `Event`s on the event channel.
    pub enable_events: bool,
    /// Reconnect automatically after a lost connection.
    pub enable_reconnect: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: String::new(),
            password: String::new(),
            resolve_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(1),
            reconnect_interval: Duration::from_secs(1),
            max_read_size: usize::MAX,
            coalesce_requests: true,
            enable_events: false,
            enable_reconnect: false,
        }
    }
}

/// Lifecycle notifications published when `Config::enable_events` is
/// set. Single-slot, drop-if-no-receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The resolve step succeeded.
    Resolve,
    /// A connection was established.
    Connect,
    /// The HELLO handshake completed.
    Hello,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Event::Resolve => "resolve",
            Event::Connect => "connect",
            Event::Hello => "hello",
        })
    }
}

/// The cancellable operation classes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Cancel every pending `exec`.
    Exec,
    /// Cancel the current `run` cycle, reconnection included.
    Run,
    /// Cancel pending `receive_push` calls.
    Receive,
    /// Cancel pending `receive_event` calls.
    ReceiveEvent,
}

struct Shared {
    queue: Queue,
    connected: bool,
    run_canceled: bool,
    /// Top-level non-push frames still owed by the server.
    cmds_in_flight: usize,
    last_data: Instant,
}

/// A multiplexed connection to one server.
///
/// Methods take `&self`; wrap the connection in an [`Arc`] to share it
/// between the driver task calling [`run`](Connection::run) and any
/// number of submitters.
pub struct Connection<C: Connector = TcpConnector> {
    cfg: Config,
    connector: C,
    shared: Mutex<Shared>,
    /// Binary semaphore parking the writer between batches.
    writer_wake: Notify,
    run_cancel: Notify,
    push_slot: Rendezvous<(usize, Bytes)>,
    event_slot: Rendezvous<Event>,
}

impl Connection<TcpConnector> {
    /// A TCP connection with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self::with_connector(cfg, TcpConnector)
    }
}

impl<C: Connector> Connection<C> {
    /// A connection over a custom transport.
    pub fn with_connector(cfg: Config, connector: C) -> Self {
        Self {
            cfg,
            connector,
            shared: Mutex::new(Shared {
                queue: Queue::new(),
                connected: false,
                run_canceled: false,
                cmds_in_flight: 0,
                last_data: Instant::now(),
            }),
            writer_wake: Notify::new(),
            run_cancel: Notify::new(),
            push_slot: Rendezvous::new(),
            event_slot: Rendezvous::new(),
        }
    }

    /// The configuration this connection was built with.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Whether a run cycle currently holds an open socket.
    pub fn is_connected(&self) -> bool {
        self.shared.lock().unwrap().connected
    }

    /// Execute a request, driving its responses through `adapter`.
    ///
    /// Requests may be submitted from any task at any time; an internal
    /// queue orders them. Completes with the total bytes consumed by
    /// this request's responses and the adapter, once the last frame of
    /// the last command has been dispatched.
    pub async fn exec<A>(&self, request: &Request, adapter: A) -> Result<(usize, A)>
    where
        A: ResponseAdapter + Send + 'static,
    {
        if request.expected_responses() > adapter.supported_response_size() {
            return Err(Error::IncompatibleSize);
        }
        let entry = self.enqueue(request, Box::new(adapter))?;
        let bytes_read = self.wait_entry(&entry).await?;
        Ok((bytes_read, take_adapter::<A>(&entry)))
    }

    /// Receive one server push, driving its nodes through `adapter`
    /// with index [`PUSH_INDEX`].
    ///
    /// Consumers expecting pushes must keep a call outstanding; an
    /// undeliverable push blocks the reader until one arrives or the
    /// idle check fails the run.
    pub async fn receive_push<A>(&self, mut adapter: A) -> Result<(usize, A)>
    where
        A: ResponseAdapter,
    {
        let (len, frame) = self.push_slot.receive().await?;
        parser::parse(&frame, &mut |node| adapter.invoke(PUSH_INDEX, node))?;
        Ok((len, adapter))
    }

    /// Receive the next lifecycle [`Event`].
    ///
    /// Events are only published when `Config::enable_events` is set,
    /// and only when a receiver is already waiting.
    pub async fn receive_event(&self) -> Result<Event> {
        self.event_slot.receive().await
    }

    /// Drive the connection: resolve, connect, handshake, then pump
    /// reads and writes until the connection is lost or cancelled.
    ///
    /// With `Config::enable_reconnect` the loop re-runs after
    /// `Config::reconnect_interval`, replaying retained requests behind
    /// a fresh handshake. An orderly server close surfaces as
    /// [`Error::Eof`]; `cancel(Operation::Run)` as
    /// [`Error::OperationAborted`] and always stops the loop.
    pub async fn run(&self) -> Result<()> {
        self.shared.lock().unwrap().run_canceled = false;
        loop {
            let result = self.run_once().await;
            if self.shared.lock().unwrap().run_canceled {
                tracing::debug!("run cancelled");
                return Err(Error::OperationAborted);
            }
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if !self.cfg.enable_reconnect {
                return Err(err);
            }
            tracing::warn!(error = %err, "connection lost, reconnecting");
            sleep(self.cfg.reconnect_interval).await;
        }
    }

    /// Run the connection just long enough to execute one request.
    ///
    /// Shortcut combining [`run`](Connection::run) and
    /// [`exec`](Connection::exec) for send-one-request-and-quit usage.
    pub async fn run_with<A>(&self, request: &Request, adapter: A) -> Result<(usize, A)>
    where
        A: ResponseAdapter + Send + 'static,
    {
        let run = self.run();
        tokio::pin!(run);
        let exec = self.exec(request, adapter);
        tokio::pin!(exec);

        tokio::select! {
            result = &mut exec => {
                self.cancel(Operation::Run);
                let _ = run.await;
                result
            }
            run_result = &mut run => {
                self.cancel(Operation::Exec);
                match exec.await {
                    Ok(done) => Ok(done),
                    Err(exec_err) => match run_result {
                        Err(run_err) => Err(run_err),
                        Ok(()) => Err(exec_err),
                    },
                }
            }
        }
    }

    /// Cancel operations of one class; returns how many were affected.
    ///
    /// Cancellation is cooperative: affected operations wake with
    /// [`Error::OperationAborted`] (receives with
    /// [`Error::ChannelCancelled`]) at their next suspension point.
    pub fn cancel(&self, operation: Operation) -> usize {
        match operation {
            Operation::Exec => {
                let count = self.shared.lock().unwrap().queue.cancel_all();
                tracing::debug!(count, "cancelled pending requests");
                count
            }
            Operation::Run => {
                {
                    let mut shared = self.shared.lock().unwrap();
                    shared.run_canceled = true;
                    shared.queue.drop_run_scoped();
                }
                self.run_cancel.notify_waiters();
                1
            }
            Operation::Receive => {
                self.push_slot.cancel();
                1
            }
            Operation::ReceiveEvent => {
                self.event_slot.cancel();
                1
            }
        }
    }

    fn enqueue(&self, request: &Request, adapter: Box<dyn ErasedAdapter>) -> Result<Arc<Entry>> {
        let entry = Arc::new(Entry::new(request, adapter));
        let mut shared = self.shared.lock().unwrap();
        if !shared.connected && request.config().cancel_if_not_connected {
            return Err(Error::NotConnected);
        }
        shared.queue.push(entry.clone());
        if shared.connected {
            self.writer_wake.notify_one();
        }
        Ok(entry)
    }

    async fn wait_entry(&self, entry: &Arc<Entry>) -> Result<usize> {
        loop {
            let notified = entry.wake.notified();
            tokio::pin!(notified);
            {
                let mut state = entry.lock();
                if let Some(outcome) = state.outcome.take() {
                    return outcome;
                }
            }
            notified.await;
        }
    }

    async fn run_once(&self) -> Result<()> {
        let resolved = timeout(
            self.cfg.resolve_timeout,
            self.connector.resolve(&self.cfg.host, self.cfg.port),
        )
        .await;
        let endpoints = match resolved {
            Err(_) => return Err(Error::ResolveTimeout),
            Ok(Err(err)) => return Err(Error::Transport(err)),
            Ok(Ok(endpoints)) => endpoints,
        };
        self.emit(Event::Resolve);

        let mut stream = None;
        let mut last_err = Error::ConnectTimeout;
        for addr in endpoints {
            match timeout(self.cfg.connect_timeout, self.connector.connect(addr)).await {
                Err(_) => last_err = Error::ConnectTimeout,
                Ok(Err(err)) => {
                    tracing::debug!(%addr, error = %err, "connect attempt failed");
                    last_err = Error::Transport(err);
                }
                Ok(Ok(s)) => {
                    stream = Some(s);
                    break;
                }
            }
        }
        let stream = match stream {
            Some(stream) => stream,
            None => return Err(last_err),
        };
        self.emit(Event::Connect);

        let (read_half, write_half) = tokio::io::split(stream);

        // The handshake takes the front of the unwritten queue, ahead of
        // anything retained from a previous run.
        let hello = self.make_hello();
        let hello_entry = self.enqueue(&hello, Box::new(Ignore))?;

        {
            let mut shared = self.shared.lock().unwrap();
            shared.connected = true;
            shared.cmds_in_flight = 0;
            shared.last_data = Instant::now();
        }
        self.writer_wake.notify_one();

        let result = tokio::select! {
            biased;
            _ = self.run_canceled_waiter() => Err(Error::OperationAborted),
            r = self.hello_watcher(&hello_entry) => r,
            r = self.reader(read_half) => r,
            r = self.writer(write_half) => r,
            r = self.pinger() => r,
            r = self.idle_checker() => r,
        };

        // Teardown. The socket halves died with the losing branches;
        // queued entries follow the connection-lost policy.
        {
            let mut shared = self.shared.lock().unwrap();
            tracing::debug!(
                error = ?result.as_ref().err(),
                in_flight = shared.cmds_in_flight,
                queued = shared.queue.len(),
                "run cycle finished"
            );
            shared.connected = false;
            shared.cmds_in_flight = 0;
            shared.queue.complete_written_pushes();
            shared.queue.on_disconnect();
        }
        result
    }

    fn make_hello(&self) -> Request {
        let config = RequestConfig {
            close_on_run_completion: true,
            ..RequestConfig::default()
        };
        let mut req = Request::with_config(config);
        if self.cfg.username.is_empty() || self.cfg.password.is_empty() {
            req.push_args("HELLO", &["3"]);
        } else {
            req.push_args(
                "HELLO",
                &[
                    "3",
                    "AUTH",
                    self.cfg.username.as_str(),
                    self.cfg.password.as_str(),
                ],
            );
        }
        req
    }

    async fn run_canceled_waiter(&self) {
        loop {
            let notified = self.run_cancel.notified();
            tokio::pin!(notified);
            if self.shared.lock().unwrap().run_canceled {
                return;
            }
            notified.await;
        }
    }

    async fn hello_watcher(&self, entry: &Arc<Entry>) -> Result<()> {
        self.wait_entry(entry).await?;
        tracing::debug!("handshake complete");
        self.emit(Event::Hello);
        std::future::pending::<()>().await;
        Ok(())
    }

    /// Reader activity: drive the decoder from the socket and route
    /// each completed top-level frame to the queue head's adapter or,
    /// for pushes, to the rendezvous.
    async fn reader<R>(&self, mut read_half: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
        loop {
            loop {
                match parser::check(&buf, self.cfg.max_read_size)? {
                    None => break,
                    Some(len) => {
                        let frame = buf.split_to(len).freeze();
                        if parser::peek_type(&frame)? == Some(FrameType::Push) {
                            tracing::trace!(bytes = len, "delivering push frame");
                            self.push_slot
                                .deliver((len, frame))
                                .await
                                .map_err(|_| Error::OperationAborted)?;
                        } else {
                            self.dispatch_frame(&frame)?;
                        }
                    }
                }
            }
            if buf.len() >= self.cfg.max_read_size {
                return Err(Error::ExceedsMaxReadSize);
            }
            let n = read_half.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(Error::Eof);
            }
            self.shared.lock().unwrap().last_data = Instant::now();
        }
    }

    /// Hand one non-push frame to the queue head.
    fn dispatch_frame(&self, frame: &Bytes) -> Result<()> {
        let entry = {
            let mut shared = self.shared.lock().unwrap();
            match shared.queue.response_head() {
                Some(entry) => {
                    shared.cmds_in_flight = shared.cmds_in_flight.saturating_sub(1);
                    entry
                }
                None => {
                    tracing::warn!("response frame without an in-flight request");
                    return Err(Error::Transport(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "response without a matching request",
                    )));
                }
            }
        };

        let done = {
            let mut state = entry.lock();
            let state = &mut *state;
            let index = entry.expected() - state.remaining;
            if state.first_error.is_none() {
                let adapter = state
                    .adapter
                    .as_mut()
                    .expect("adapter retained until completion");
                if let Err(err) =
                    parser::parse(frame, &mut |node| adapter.invoke_node(index, node))
                {
                    tracing::debug!(error = %err, "adapter rejected response");
                    state.first_error = Some(err);
                }
            }
            state.remaining -= 1;
            state.bytes_read += frame.len();
            state.remaining == 0
        };

        if done {
            self.shared.lock().unwrap().queue.pop_head();
            let outcome = {
                let mut state = entry.lock();
                match state.first_error.take() {
                    Some(err) => Err(err),
                    None => Ok(state.bytes_read),
                }
            };
            entry.complete(outcome);
        }
        Ok(())
    }

    /// Writer activity: flush coalesced batches, park between them.
    async fn writer<W>(&self, mut write_half: W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();
        loop {
            {
                let mut shared = self.shared.lock().unwrap();
                if shared.queue.has_unwritten() {
                    let added = shared.queue.coalesce(self.cfg.coalesce_requests, &mut buf);
                    shared.cmds_in_flight += added;
                }
            }

            if buf.is_empty() {
                let notified = self.writer_wake.notified();
                tokio::pin!(notified);
                let has_work = {
                    let mut shared = self.shared.lock().unwrap();
                    // Zero-expected entries (subscribe style) complete on
                    // write even when their payload flushed with nothing
                    // else pending.
                    shared.queue.complete_written_pushes();
                    shared.queue.has_unwritten()
                };
                if !has_work {
                    notified.await;
                }
                continue;
            }

            write_half.write_all(&buf).await?;
            write_half.flush().await?;
            tracing::trace!(bytes = buf.len(), "flushed request batch");
            buf.clear();
            self.shared.lock().unwrap().queue.complete_written_pushes();
        }
    }

    /// Health activity: periodic tagged PING through the normal queue.
    async fn pinger(&self) -> Result<()> {
        loop {
            sleep(self.cfg.ping_interval).await;
            let config = RequestConfig {
                close_on_run_completion: true,
                ..RequestConfig::default()
            };
            let mut req = Request::with_config(config);
            req.push_args("PING", &[HEALTH_CHECK_TAG]);
            let entry = self.enqueue(&req, Box::new(Ignore))?;
            self.wait_entry(&entry).await?;
        }
    }

    /// Health activity: fail the run when the wire goes silent.
    async fn idle_checker(&self) -> Result<()> {
        loop {
            sleep(self.cfg.ping_interval).await;
            let last_data = self.shared.lock().unwrap().last_data;
            if last_data.elapsed() > self.cfg.ping_interval * 2 {
                tracing::warn!("no data within twice the ping interval");
                return Err(Error::IdleTimeout);
            }
        }
    }

    fn emit(&self, event: Event) {
        if self.cfg.enable_events && self.event_slot.try_deliver(event) {
            tracing::trace!(%event, "event delivered");
        }
    }
}

fn take_adapter<A>(entry: &Arc<Entry>) -> A
where
    A: ResponseAdapter + Send + 'static,
{
    let boxed = entry
        .lock()
        .adapter
        .take()
        .expect("adapter present until completion");
    *boxed
        .into_any()
        .downcast::<A>()
        .expect("adapter type preserved")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::TextSlots;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 6379);
        assert_eq!(cfg.resolve_timeout, Duration::from_secs(10));
        assert_eq!(cfg.ping_interval, Duration::from_secs(1));
        assert_eq!(cfg.max_read_size, usize::MAX);
        assert!(cfg.coalesce_requests);
        assert!(!cfg.enable_events);
        assert!(!cfg.enable_reconnect);
    }

    #[test]
    fn test_event_display() {
        assert_eq!(Event::Resolve.to_string(), "resolve");
        assert_eq!(Event::Connect.to_string(), "connect");
        assert_eq!(Event::Hello.to_string(), "hello");
    }

    #[tokio::test]
    async fn test_incompatible_size_rejected() {
        let conn = Connection::new(Config::default());
        let mut req = Request::new();
        req.push_args("HELLO", &["3"]);
        req.push("PING");

        let err = conn.exec(&req, TextSlots::with_size(1)).await.unwrap_err();
        assert!(matches!(err, Error::IncompatibleSize));
    }

    #[tokio::test]
    async fn test_cancel_if_not_connected() {
        let conn = Connection::new(Config::default());
        let mut req = Request::new();
        req.config_mut().cancel_if_not_connected = true;
        req.push_args("HELLO", &["3"]);
        req.push("PING");

        let err = conn.exec(&req, Ignore).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_cancel_exec_wakes_and_second_call_counts_zero() {
        let conn = Arc::new(Connection::new(Config::default()));
        let mut req = Request::new();
        req.push("PING");

        let pending = {
            let conn = conn.clone();
            let req = req.clone();
            tokio::spawn(async move { conn.exec(&req, Ignore).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(conn.cancel(Operation::Exec), 1);
        assert!(matches!(
            pending.await.unwrap(),
            Err(Error::OperationAborted)
        ));
        assert_eq!(conn.cancel(Operation::Exec), 0);
    }

    #[tokio::test]
    async fn test_cancel_receive_event() {
        let conn = Arc::new(Connection::new(Config::default()));
        let waiting = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.receive_event().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        conn.cancel(Operation::ReceiveEvent);
        assert!(matches!(
            waiting.await.unwrap(),
            Err(Error::ChannelCancelled)
        ));
    }
}
