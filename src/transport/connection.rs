//! Connection manager
//!
//! `Connection` is a cheap, cloneable handle. All socket I/O, decoding,
//! queue bookkeeping and notification dispatch happen on a single driver task,
//! which is what keeps results and events in line order. Callers talk to the
//! driver through an unbounded channel, so `submit` never blocks.

use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::antispam::AntispamGate;
use super::codec::{Frame, QueryCodec, decode_line};
use super::queue::{CommandQueue, PendingCommand};
use super::router::{self, EventRouter, HandlerError, SubscriptionId};
use super::{ParseError, QueryError, TransportConfig};
use crate::events::{Event, EventKind};
use crate::protocol::{Command, QueryResponse, Row};

/// Lifecycle of the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
    Failed,
}

/// Why the connection ended; `error` is `None` for a requested close
#[derive(Debug, Clone)]
pub struct CloseReason {
    pub error: Option<QueryError>,
}

enum Request {
    Submit(PendingCommand),
    Close(oneshot::Sender<()>),
}

struct Shared {
    router: Mutex<EventRouter>,
    state: watch::Sender<ConnectionState>,
    closed: watch::Sender<Option<CloseReason>>,
    handler_errors: broadcast::Sender<HandlerError>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("connection state {:?} -> {:?}", previous, state);
        }
    }
}

/// Completion handle returned by `Connection::submit`
#[must_use = "the command still runs, but its result is lost if the handle is dropped"]
pub struct CommandHandle {
    rx: oneshot::Receiver<Result<QueryResponse, QueryError>>,
}

impl Future for CommandHandle {
    type Output = Result<QueryResponse, QueryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(QueryError::ConnectionClosed)))
    }
}

/// Handle to a query connection
#[derive(Clone)]
pub struct Connection {
    requests: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Open a TCP connection and wait for the server greeting
    pub async fn connect(host: &str, port: u16, config: TransportConfig) -> Result<Self, QueryError> {
        log::info!("connecting to {}:{}", host, port);
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| QueryError::Timeout {
                command: "connect".to_string(),
                elapsed: config.connect_timeout,
            })??;
        stream.set_nodelay(true)?;
        Self::from_stream(stream, config).await
    }

    /// Run the protocol over an already established stream (TCP, tunnel, test pipe)
    pub async fn from_stream<S>(stream: S, config: TransportConfig) -> Result<Self, QueryError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (closed, _) = watch::channel(None);
        let (handler_errors, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            router: Mutex::new(EventRouter::default()),
            state,
            closed,
            handler_errors,
        });

        let (reader, writer) = tokio::io::split(stream);
        let mut reader = FramedRead::new(reader, QueryCodec::new());
        let writer = FramedWrite::new(writer, QueryCodec::new());

        let greeting = tokio::time::timeout(config.connect_timeout, read_greeting(&mut reader)).await;
        match greeting {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                shared.set_state(ConnectionState::Failed);
                return Err(e);
            }
            Err(_) => {
                shared.set_state(ConnectionState::Failed);
                return Err(QueryError::Timeout {
                    command: "greeting".to_string(),
                    elapsed: config.connect_timeout,
                });
            }
        }

        let (requests, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            reader,
            writer,
            requests: rx,
            queue: CommandQueue::new(config.command_timeout),
            gate: AntispamGate::new(config.antispam),
            shared: Arc::clone(&shared),
            keepalive: config.keepalive,
            keepalive_command: config.keepalive_command,
            last_write: Instant::now(),
        };

        shared.set_state(ConnectionState::Ready);
        log::info!("query connection ready");
        tokio::spawn(driver.run());

        Ok(Self { requests, shared })
    }

    /// Submit a command; the returned handle resolves once its status line arrives
    pub fn submit(&self, command: Command) -> CommandHandle {
        let (pending, rx) = PendingCommand::caller(command);

        if self.state() != ConnectionState::Ready {
            pending.fail(QueryError::ConnectionClosed);
        } else if let Err(mpsc::error::SendError(request)) = self.requests.send(Request::Submit(pending))
            && let Request::Submit(pending) = request
        {
            pending.fail(QueryError::ConnectionClosed);
        }

        CommandHandle { rx }
    }

    /// Submit a command and wait for its rows
    pub async fn execute(&self, command: Command) -> Result<Vec<Row>, QueryError> {
        self.submit(command).await.map(|response| response.rows)
    }

    /// Register a handler for one notification kind.
    ///
    /// Handlers run on the driver task in registration order and must not
    /// block; an `Err` or panic is reported through `handler_errors`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        router::lock(&self.shared.router).subscribe(kind, Arc::new(handler))
    }

    pub fn has_subscribers(&self, kind: EventKind) -> bool {
        router::lock(&self.shared.router).is_subscribed(kind)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        router::lock(&self.shared.router).unsubscribe(id)
    }

    /// Failures reported by event handlers and payload validation
    pub fn handler_errors(&self) -> broadcast::Receiver<HandlerError> {
        self.shared.handler_errors.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Resolves when the connection has ended, with the error that ended it
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.shared.closed.subscribe();
        let reason = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| (*reason).clone());
        reason.unwrap_or(CloseReason {
            error: Some(QueryError::ConnectionClosed),
        })
    }

    /// Send `quit`, fail everything still pending and wait for the driver to stop
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn next_line<R>(reader: &mut FramedRead<R, QueryCodec>) -> Result<String, QueryError>
where
    R: AsyncRead + Unpin,
{
    reader
        .next()
        .await
        .unwrap_or(Err(QueryError::ConnectionClosed))
}

async fn read_greeting<R>(reader: &mut FramedRead<R, QueryCodec>) -> Result<(), QueryError>
where
    R: AsyncRead + Unpin,
{
    let banner = next_line(reader).await?;
    if banner != "TS3" {
        return Err(ParseError::Greeting(banner).into());
    }
    let welcome = next_line(reader).await?;
    log::debug!("server greeting: {}", welcome);
    Ok(())
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Sender to acknowledge once a requested close has finished
type CloseAck = Option<oneshot::Sender<()>>;

struct Driver<S> {
    reader: FramedRead<ReadHalf<S>, QueryCodec>,
    writer: FramedWrite<WriteHalf<S>, QueryCodec>,
    requests: mpsc::UnboundedReceiver<Request>,
    queue: CommandQueue,
    gate: AntispamGate,
    shared: Arc<Shared>,
    keepalive: Option<Duration>,
    keepalive_command: String,
    last_write: Instant,
}

impl<S> Driver<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let outcome = self.drive().await;
        self.shutdown(outcome).await;
    }

    async fn drive(&mut self) -> Result<CloseAck, QueryError> {
        loop {
            let deadline = self.queue.next_deadline();
            let release_at = self.gate.ready_at();
            let keepalive_at = self.keepalive_at();

            tokio::select! {
                line = self.reader.next() => match line {
                    Some(Ok(line)) => self.on_line(&line).await?,
                    Some(Err(e)) => return Err(e),
                    None => return Err(QueryError::ConnectionClosed),
                },
                request = self.requests.recv() => match request {
                    Some(Request::Submit(pending)) => self.accept(pending).await?,
                    Some(Request::Close(ack)) => return Ok(Some(ack)),
                    None => return Ok(None),
                },
                _ = sleep_until_opt(release_at) => {
                    let now = Instant::now();
                    if let Some(pending) = self.gate.release(now) {
                        self.enqueue(pending, now).await?;
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    let expired = self.queue.expire(Instant::now());
                    log::debug!("{} command(s) timed out", expired);
                }
                _ = sleep_until_opt(keepalive_at) => {
                    log::debug!("connection idle, sending keepalive");
                    let command = Command::new(self.keepalive_command.clone());
                    self.accept(PendingCommand::keepalive(command)).await?;
                }
            }
        }
    }

    /// Next keepalive instant, only while nothing else is outstanding
    fn keepalive_at(&self) -> Option<Instant> {
        let period = self.keepalive?;
        if !self.queue.is_idle() || self.gate.len() > 0 {
            return None;
        }
        Some(self.last_write + period)
    }

    async fn on_line(&mut self, line: &str) -> Result<(), QueryError> {
        match decode_line(line)? {
            Frame::Status(status) => {
                log::trace!("status {}", status);
                if let Some(next) = self.queue.on_status(status, Instant::now())? {
                    self.write(&next).await?;
                }
            }
            Frame::Rows(rows) => self.queue.on_rows(rows)?,
            Frame::Notifications(notifications) => {
                for notification in &notifications {
                    for error in router::dispatch(&self.shared.router, notification) {
                        log::warn!("event handler failed: {}", error);
                        // No receivers is fine
                        let _ = self.shared.handler_errors.send(error);
                    }
                }
            }
        }
        Ok(())
    }

    async fn accept(&mut self, pending: PendingCommand) -> Result<(), QueryError> {
        let now = Instant::now();
        match self.gate.offer(pending, now) {
            Some(pending) => self.enqueue(pending, now).await,
            None => {
                log::trace!("antispam backlog: {}", self.gate.len());
                Ok(())
            }
        }
    }

    async fn enqueue(&mut self, pending: PendingCommand, now: Instant) -> Result<(), QueryError> {
        log::trace!(
            "`{}` entered queue after {:?}",
            pending.command.name(),
            now.saturating_duration_since(pending.submitted_at)
        );
        match self.queue.push(pending, now) {
            Some(command) => self.write(&command).await?,
            None => log::trace!(
                "`{}` in flight, {} waiting",
                self.queue.in_flight().unwrap_or_default(),
                self.queue.waiting_len()
            ),
        }
        Ok(())
    }

    async fn write(&mut self, command: &Command) -> Result<(), QueryError> {
        log::debug!("-> {}", command.name());
        self.writer.send(command).await?;
        self.last_write = Instant::now();
        Ok(())
    }

    async fn shutdown(mut self, outcome: Result<CloseAck, QueryError>) {
        match outcome {
            Ok(ack) => {
                self.shared.set_state(ConnectionState::Closing);
                if let Err(e) = self.writer.send(&Command::new("quit")).await {
                    log::debug!("failed to send quit: {}", e);
                }
                let _ = SinkExt::<&Command>::close(&mut self.writer).await;
                self.fail_outstanding();
                self.shared.set_state(ConnectionState::Disconnected);
                self.shared
                    .closed
                    .send_replace(Some(CloseReason { error: None }));
                log::info!("query connection closed");
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            Err(error) => {
                log::error!("query connection failed: {}", error);
                self.shared.set_state(ConnectionState::Failed);
                self.fail_outstanding();
                self.shared.closed.send_replace(Some(CloseReason {
                    error: Some(error),
                }));
            }
        }
    }

    /// Fail queue, antispam backlog and unread submissions, in that order
    fn fail_outstanding(&mut self) {
        self.queue.teardown();
        for pending in self.gate.drain() {
            pending.fail(QueryError::ConnectionClosed);
        }

        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            match request {
                Request::Submit(pending) => pending.fail(QueryError::ConnectionClosed),
                Request::Close(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StatusLine;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio_util::codec::LinesCodec;

    /// Scripted server side of a duplex pipe
    struct FakeServer {
        lines: FramedRead<ReadHalf<DuplexStream>, LinesCodec>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn expect(&mut self) -> String {
            self.lines.next().await.unwrap().unwrap()
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{}\n\r", line).as_bytes())
                .await
                .unwrap();
        }

        async fn ok(&mut self) {
            self.send("error id=0 msg=ok").await;
        }

        /// True when no command line arrives within `wait`
        async fn is_quiet(&mut self, wait: Duration) -> bool {
            tokio::time::timeout(wait, self.lines.next()).await.is_err()
        }
    }

    async fn pair(config: TransportConfig) -> (Connection, FakeServer) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, mut writer) = tokio::io::split(server);
        writer
            .write_all(b"TS3\n\rWelcome to the TeamSpeak 3 ServerQuery interface\n\r")
            .await
            .unwrap();

        let connection = Connection::from_stream(client, config).await.unwrap();
        let server = FakeServer {
            lines: FramedRead::new(reader, LinesCodec::new()),
            writer,
        };
        (connection, server)
    }

    fn quiet_config() -> TransportConfig {
        TransportConfig {
            keepalive: None,
            antispam: None,
            command_timeout: None,
            ..TransportConfig::default()
        }
    }

    fn add_perm(permid: u32) -> Command {
        Command::new("servergroupaddperm")
            .arg("sgid", 6)
            .arg("permid", permid)
            .arg("permvalue", 25)
            .arg("permskip", 0)
            .arg("permnegated", 0)
    }

    #[tokio::test]
    async fn test_greeting_is_required() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(b"SSH-2.0-OpenSSH\n").await.unwrap();

        let err = Connection::from_stream(client, quiet_config())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Parse(ParseError::Greeting(ref g)) if g == "SSH-2.0-OpenSSH"));
    }

    #[tokio::test]
    async fn test_execute_returns_rows() {
        let (conn, mut server) = pair(quiet_config()).await;
        assert_eq!(conn.state(), ConnectionState::Ready);

        let handle = conn.submit(Command::new("clientlist").flag("uid"));
        assert_eq!(server.expect().await, "clientlist -uid");
        server
            .send("clid=1 client_nickname=serveradmin|clid=5 client_nickname=Jane\\sDoe")
            .await;
        server.ok().await;

        let response = handle.await.unwrap();
        assert_eq!(response.rows.len(), 2);
        assert_eq!(response.rows[1].get("client_nickname"), Some("Jane Doe"));
        assert!(response.status.is_ok());
    }

    #[tokio::test]
    async fn test_add_perm_success_and_invalid_parameter() {
        let (conn, mut server) = pair(quiet_config()).await;

        let ok = conn.submit(add_perm(1));
        assert_eq!(
            server.expect().await,
            "servergroupaddperm sgid=6 permid=1 permvalue=25 permskip=0 permnegated=0"
        );
        server.ok().await;
        let response = ok.await.unwrap();
        assert!(response.rows.is_empty());
        assert_eq!(response.status.id, 0);

        let bad = conn.submit(add_perm(999_999));
        assert_eq!(
            server.expect().await,
            "servergroupaddperm sgid=6 permid=999999 permvalue=25 permskip=0 permnegated=0"
        );
        server.send("error id=1538 msg=invalid\\sparameter").await;

        let err = bad.await.unwrap_err();
        assert_eq!(
            err.status(),
            Some(&StatusLine {
                id: 1538,
                msg: "invalid parameter".to_string(),
                extra_msg: None,
                failed_permid: None,
            })
        );

        // A command error leaves the connection usable
        assert_eq!(conn.state(), ConnectionState::Ready);
        let next = conn.submit(Command::new("whoami"));
        assert_eq!(server.expect().await, "whoami");
        server.ok().await;
        assert!(next.await.is_ok());
    }

    #[tokio::test]
    async fn test_one_command_in_flight_and_fifo_completion() {
        let (conn, mut server) = pair(quiet_config()).await;

        let handles: Vec<_> = (0..3)
            .map(|i| conn.submit(Command::new("echo").arg("n", i)))
            .collect();

        for i in 0..3 {
            assert_eq!(server.expect().await, format!("echo n={}", i));
            assert!(server.is_quiet(Duration::from_millis(50)).await);
            server.send(&format!("n={}", i)).await;
            server.ok().await;
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let response = handle.await.unwrap();
            assert_eq!(response.rows[0].get("n"), Some(i.to_string().as_str()));
        }
    }

    #[tokio::test]
    async fn test_concurrent_submitters_complete_in_write_order() {
        let (conn, mut server) = pair(quiet_config()).await;
        let completed = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<_> = (0..5u32)
            .map(|i| {
                let conn = conn.clone();
                let completed = Arc::clone(&completed);
                tokio::spawn(async move {
                    let rows = conn
                        .execute(Command::new("echo").arg("n", i))
                        .await
                        .unwrap();
                    assert_eq!(rows[0].get("n"), Some(i.to_string().as_str()));
                    completed.lock().unwrap().push(i);
                })
            })
            .collect();

        let mut written = Vec::new();
        for _ in 0..5 {
            let line = server.expect().await;
            let n: u32 = line.strip_prefix("echo n=").unwrap().parse().unwrap();
            assert!(server.is_quiet(Duration::from_millis(50)).await);
            server.send(&format!("n={}", n)).await;
            server.ok().await;
            written.push(n);
        }

        for task in tasks {
            task.await.unwrap();
        }
        let mut sorted = written.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);
        assert_eq!(*completed.lock().unwrap(), written);
    }

    #[tokio::test]
    async fn test_notification_does_not_disturb_in_flight_command() {
        let (conn, mut server) = pair(quiet_config()).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conn.subscribe(EventKind::ClientMoved, move |event| {
            if let Event::ClientMoved { clid, .. } = event {
                sink.lock().unwrap().push(*clid);
            }
            Ok(())
        });
        assert!(conn.has_subscribers(EventKind::ClientMoved));
        assert!(!conn.has_subscribers(EventKind::TextMessage));

        let handle = conn.submit(Command::new("whoami"));
        assert_eq!(server.expect().await, "whoami");
        server.send("notifyclientmoved ctid=3 reasonid=0 clid=7").await;
        server.send("virtualserver_id=1 client_id=2").await;
        server.send("notifyclientmoved ctid=4 reasonid=0 clid=8").await;
        // Nobody subscribed to this one; it must still not become a result row
        server.send("notifytextmessage targetmode=3 msg=hi invokerid=1 invokername=a").await;
        server.ok().await;

        let response = handle.await.unwrap();
        assert_eq!(response.rows.len(), 1);
        assert_eq!(response.rows[0].get("client_id"), Some("2"));
        assert_eq!(*seen.lock().unwrap(), vec![7, 8]);
    }

    #[tokio::test]
    async fn test_handler_errors_are_reported() {
        let (conn, mut server) = pair(quiet_config()).await;
        let mut errors = conn.handler_errors();
        conn.subscribe(EventKind::ChannelDeleted, |_| Err(anyhow::anyhow!("cache miss")));

        server.send("notifychanneldeleted invokerid=1 invokername=a cid=9").await;
        let error = errors.recv().await.unwrap();
        assert_eq!(error.event, "notifychanneldeleted");
        assert_eq!(error.message, "cache miss");
        assert_eq!(conn.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_forced_close_fails_everything_in_order() {
        let (conn, mut server) = pair(quiet_config()).await;

        let first = conn.submit(Command::new("a"));
        let second = conn.submit(Command::new("b"));
        let third = conn.submit(Command::new("c"));
        assert_eq!(server.expect().await, "a");
        drop(server);

        for handle in [first, second, third] {
            assert!(matches!(handle.await, Err(QueryError::ConnectionClosed)));
        }

        let reason = conn.closed().await;
        assert!(matches!(reason.error, Some(QueryError::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Failed);

        let late = conn.submit(Command::new("d"));
        assert!(matches!(late.await, Err(QueryError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_parse_error_is_fatal() {
        let (conn, mut server) = pair(quiet_config()).await;
        let mut states = conn.watch_state();
        assert_eq!(*states.borrow_and_update(), ConnectionState::Ready);

        let handle = conn.submit(Command::new("whoami"));
        assert_eq!(server.expect().await, "whoami");
        server.send("error msg=missing\\sid").await;

        assert!(matches!(handle.await, Err(QueryError::ConnectionClosed)));
        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), ConnectionState::Failed);

        let reason = conn.closed().await;
        let error = reason.error.unwrap();
        assert!(error.is_fatal());
        assert!(matches!(error, QueryError::Parse(ParseError::Status(_))));
    }

    #[tokio::test]
    async fn test_clean_close() {
        let (conn, mut server) = pair(quiet_config()).await;

        let mut states = conn.watch_state();

        let pending = conn.submit(Command::new("whoami"));
        assert_eq!(server.expect().await, "whoami");
        conn.close().await;
        states
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await
            .unwrap();

        assert_eq!(server.expect().await, "quit");
        assert!(matches!(pending.await, Err(QueryError::ConnectionClosed)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.closed().await.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_late_status() {
        let config = TransportConfig {
            command_timeout: Some(Duration::from_secs(2)),
            ..quiet_config()
        };
        let (conn, mut server) = pair(config).await;

        let slow = conn.submit(Command::new("slow"));
        let next = conn.submit(Command::new("next"));
        assert_eq!(server.expect().await, "slow");

        let err = slow.await.unwrap_err();
        assert!(matches!(err, QueryError::Timeout { ref command, .. } if command == "slow"));

        // `next` expired while waiting behind `slow` and is never written
        assert!(matches!(next.await, Err(QueryError::Timeout { .. })));

        let after = conn.submit(Command::new("after"));
        server.send("late=1").await;
        server.ok().await;
        assert_eq!(server.expect().await, "after");
        server.ok().await;

        let response = after.await.unwrap();
        assert!(response.rows.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_antispam_paces_commands() {
        let interval = Duration::from_millis(350);
        let config = TransportConfig {
            antispam: Some(interval),
            ..quiet_config()
        };
        let (conn, mut server) = pair(config).await;

        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| conn.submit(Command::new(name)))
            .collect();

        let mut arrivals = Vec::new();
        for name in ["a", "b", "c"] {
            assert_eq!(server.expect().await, name);
            arrivals.push(Instant::now());
            server.ok().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(arrivals[1] - arrivals[0] >= interval);
        assert!(arrivals[2] - arrivals[1] >= interval);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_sent_when_idle() {
        let period = Duration::from_secs(60);
        let config = TransportConfig {
            keepalive: Some(period),
            ..quiet_config()
        };
        let start = Instant::now();
        let (_conn, mut server) = pair(config).await;

        assert_eq!(server.expect().await, "version");
        assert!(start.elapsed() >= period);
        server.send("version=3.13.7 build=1655727713 platform=Linux").await;
        server.ok().await;

        // Failure of a keepalive is only a health signal
        assert_eq!(server.expect().await, "version");
        server.send("error id=1 msg=undefined\\serror").await;
        assert_eq!(server.expect().await, "version");
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_waits_for_activity_gap() {
        let period = Duration::from_secs(60);
        let config = TransportConfig {
            keepalive: Some(period),
            ..quiet_config()
        };
        let (conn, mut server) = pair(config).await;

        tokio::time::sleep(Duration::from_secs(45)).await;
        let activity = Instant::now();
        let handle = conn.submit(Command::new("whoami"));
        assert_eq!(server.expect().await, "whoami");
        server.ok().await;
        handle.await.unwrap();

        assert_eq!(server.expect().await, "version");
        assert!(activity.elapsed() >= period);
    }
}
