//! Persistent control port channel with pipelined commands.
//!
//! A [`ControlChannel`] owns one authenticated TCP connection to the control
//! port and shares it between every caller in the process. Commands are
//! written in submission order and replies are matched to them strictly
//! first-in first-out: the protocol carries no request identifiers, so the
//! Nth complete reply block belongs to the Nth unresolved command.
//!
//! # Architecture
//!
//! ```text
//!   submit("GETINFO …") ──┐
//!   submit("SIGNAL …")  ──┼──▶ outbox ──▶ ┌──────────────┐ ──▶ socket
//!   submit("CLOSE…")    ──┘   (mpsc)      │ writer task  │
//!                                         │ push pending │
//!                                         └──────┬───────┘
//!                                                │ FIFO
//!                                                ▼
//!   oneshot ◀── pop front ◀── frame reply ◀── ┌──────────────┐ ◀── socket
//!                                             │ reader task  │
//!                                             └──────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! ```text
//!   Idle ──first use──▶ Connecting ──250──▶ Ready
//!    ▲                      │                 │
//!    │   timeout/rejection  │                 │ EOF, I/O error,
//!    └──────────────────────┘                 │ protocol corruption
//!    └────────────────────────────────────────┘
//! ```
//!
//! Only one handshake runs at a time. Callers arriving while one is in
//! flight wait on the same outcome. Any socket failure drops the session and
//! fails every pending request at once; the next call reconnects.
//!
//! # Timeouts
//!
//! A command that misses its deadline reports [`Error::Timeout`]. Its slot
//! stays in the queue with a closed receiver so the late reply, when it
//! arrives, is consumed and discarded instead of being handed to the next
//! command.
//!
//! # Example
//!
//! ```rust,no_run
//! use circuit_sidecar::control::{ControlChannel, ControlEndpoint};
//! use std::time::Duration;
//!
//! # async fn example() -> circuit_sidecar::Result<()> {
//! let endpoint = ControlEndpoint::new(
//!     "127.0.0.1:9051".parse().unwrap(),
//!     "/var/lib/anon/control_auth_cookie",
//! );
//! let channel = ControlChannel::new(endpoint);
//! let reply = channel.submit("GETINFO version", Duration::from_secs(5)).await?;
//! println!("{}", reply.text);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use zeroize::Zeroize;

use crate::config::{Config, LogLevel};
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::parser::{next_reply, Frame, ReplyBlock};

/// Deadline for connect plus authentication.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(8);

/// Default per-command deadline.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Hex-encoded authentication cookie, wiped from memory on drop.
///
/// ```rust
/// use circuit_sidecar::control::SecureCookie;
///
/// let cookie = SecureCookie::from_bytes(&[0xde, 0xad]);
/// assert_eq!(cookie.as_hex(), "dead");
/// assert_eq!(format!("{:?}", cookie), "SecureCookie([REDACTED])");
/// ```
#[derive(Clone)]
pub struct SecureCookie(String);

impl SecureCookie {
    /// Hex-encodes raw cookie bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Reads and hex-encodes the cookie file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    pub async fn read(path: &Path) -> Result<Self> {
        let mut bytes = tokio::fs::read(path).await?;
        let cookie = Self::from_bytes(&bytes);
        bytes.zeroize();
        Ok(cookie)
    }

    /// The hex string sent with `AUTHENTICATE`.
    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl Drop for SecureCookie {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecureCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureCookie([REDACTED])")
    }
}

/// Where the control port lives and how to authenticate to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    /// Control port socket address.
    pub address: SocketAddr,
    /// Path of the authentication cookie.
    pub cookie_path: PathBuf,
}

impl ControlEndpoint {
    /// Creates an endpoint.
    pub fn new(address: SocketAddr, cookie_path: impl Into<PathBuf>) -> Self {
        Self {
            address,
            cookie_path: cookie_path.into(),
        }
    }

    /// Builds the endpoint from a configuration whose host is already
    /// resolved to an IP address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `control_ip` is not an IP address.
    pub fn from_config(config: &Config) -> Result<Self> {
        let ip: IpAddr = config.control_ip.parse().map_err(|e| {
            Error::Config(format!("invalid control address {}: {}", config.control_ip, e))
        })?;
        Ok(Self::new(
            SocketAddr::new(ip, config.control_port),
            config.cookie_path.clone(),
        ))
    }

    async fn cookie(&self) -> Result<SecureCookie> {
        SecureCookie::read(&self.cookie_path).await
    }
}

/// Incremental reply framer over a byte stream.
#[derive(Default)]
struct ReplyReader {
    raw: Vec<u8>,
    text: String,
}

impl ReplyReader {
    /// Pops the next complete block already buffered.
    fn frame(&mut self) -> Result<Option<ReplyBlock>> {
        if let Some(pos) = self.raw.iter().rposition(|b| *b == b'\n') {
            let complete: Vec<u8> = self.raw.drain(..=pos).collect();
            self.text.push_str(&String::from_utf8_lossy(&complete));
        }
        match next_reply(&self.text) {
            Frame::Complete { block, consumed } => {
                self.text.drain(..consumed);
                Ok(Some(block))
            }
            Frame::Incomplete => Ok(None),
            Frame::Malformed(line) => Err(Error::Protocol(format!("malformed reply line {:?}", line))),
        }
    }

    /// Reads until a block is complete. `Ok(None)` means the peer closed.
    async fn next<R>(&mut self, reader: &mut R) -> Result<Option<ReplyBlock>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(block) = self.frame()? {
                return Ok(Some(block));
            }
            let n = reader
                .read_buf(&mut self.raw)
                .await
                .map_err(|e| Error::Connection(e.to_string()))?;
            if n == 0 {
                return Ok(None);
            }
        }
    }
}

/// Why a handshake failed. Cloneable so every waiter gets a copy.
#[derive(Debug, Clone)]
enum HandshakeFailure {
    Rejected(String),
    TimedOut,
    Unreachable(String),
}

impl From<HandshakeFailure> for Error {
    fn from(failure: HandshakeFailure) -> Self {
        match failure {
            HandshakeFailure::Rejected(line) => Error::Authentication(line),
            HandshakeFailure::TimedOut => Error::Timeout(format!(
                "authentication not completed within {:?}",
                AUTH_TIMEOUT
            )),
            HandshakeFailure::Unreachable(msg) => Error::Connection(msg),
        }
    }
}

type HandshakeOutcome = Option<std::result::Result<Arc<Session>, HandshakeFailure>>;

enum ChannelState {
    Idle,
    Connecting(watch::Receiver<HandshakeOutcome>),
    Ready(Arc<Session>),
}

struct PendingRequest {
    command: String,
    deadline: Instant,
    reply: oneshot::Sender<Result<ReplyBlock>>,
}

/// One authenticated connection.
struct Session {
    outbox: mpsc::UnboundedSender<PendingRequest>,
    pending: Mutex<VecDeque<PendingRequest>>,
    alive: AtomicBool,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Session {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hands a reply to the oldest unresolved request.
    fn dispatch(&self, block: ReplyBlock) -> Result<()> {
        if block.is_async_event() {
            return Err(Error::Protocol(format!(
                "unsolicited asynchronous reply: {}",
                block.status_line()
            )));
        }
        let request = self.pending().pop_front().ok_or_else(|| {
            Error::Protocol(format!(
                "reply with no pending request: {}",
                block.status_line()
            ))
        })?;
        if let Err(Ok(late)) = request.reply.send(Ok(block)) {
            plog(
                LogLevel::Debug,
                &format!(
                    "Discarding late reply to {:?} ({}), {:?} past its deadline",
                    command_name(&request.command),
                    late.status_line(),
                    Instant::now().saturating_duration_since(request.deadline)
                ),
            );
        }
        Ok(())
    }

    /// Marks the session dead and fails everything still pending.
    ///
    /// Returns `false` if it was already dead.
    fn fail(&self, make_error: impl Fn() -> Error) -> bool {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return false;
        }
        let drained: Vec<PendingRequest> = self.pending().drain(..).collect();
        for request in drained {
            let _ = request.reply.send(Err(make_error()));
        }
        let tasks: Vec<AbortHandle> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        true
    }
}

struct Shared {
    endpoint: ControlEndpoint,
    state: Mutex<ChannelState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drops `session` from the state if it is still the current one.
    fn forget(&self, session: &Arc<Session>) {
        let mut state = self.state();
        if let ChannelState::Ready(current) = &*state {
            if Arc::ptr_eq(current, session) {
                *state = ChannelState::Idle;
            }
        }
    }

    fn teardown(&self, session: &Arc<Session>, make_error: impl Fn() -> Error) {
        self.forget(session);
        if session.fail(&make_error) {
            plog(
                LogLevel::Warn,
                &format!("Control connection reset: {}", make_error()),
            );
        }
    }
}

/// Shared handle to the persistent control connection.
///
/// Cloning is cheap; all clones use the same connection.
#[derive(Clone)]
pub struct ControlChannel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("endpoint", &self.shared.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ControlChannel {
    /// Creates a channel. Nothing connects until first use.
    pub fn new(endpoint: ControlEndpoint) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint,
                state: Mutex::new(ChannelState::Idle),
            }),
        }
    }

    /// The endpoint this channel talks to.
    pub fn endpoint(&self) -> &ControlEndpoint {
        &self.shared.endpoint
    }

    /// Returns `true` while an authenticated session is live.
    pub fn is_connected(&self) -> bool {
        matches!(&*self.shared.state(), ChannelState::Ready(s) if s.is_alive())
    }

    /// Connects and authenticates unless a live session already exists.
    ///
    /// Concurrent callers share a single handshake.
    ///
    /// # Errors
    ///
    /// - [`Error::Authentication`] if the credential is rejected
    /// - [`Error::Timeout`] if the handshake exceeds [`AUTH_TIMEOUT`]
    /// - [`Error::Connection`] if the port is unreachable or closes early
    pub async fn ensure_connected(&self) -> Result<()> {
        self.session().await.map(|_| ())
    }

    async fn session(&self) -> Result<Arc<Session>> {
        let mut rx = {
            let mut state = self.shared.state();
            match &*state {
                ChannelState::Ready(session) if session.is_alive() => {
                    return Ok(session.clone());
                }
                ChannelState::Connecting(rx) => rx.clone(),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    *state = ChannelState::Connecting(rx.clone());
                    tokio::spawn(establish(self.shared.clone(), tx));
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => {
                let mut state = self.shared.state();
                if matches!(&*state, ChannelState::Connecting(_)) {
                    *state = ChannelState::Idle;
                }
                return Err(Error::Connection("handshake task aborted".to_string()));
            }
        };
        match outcome {
            Some(Ok(session)) => Ok(session),
            Some(Err(failure)) => Err(failure.into()),
            None => Err(Error::Connection("handshake produced no outcome".to_string())),
        }
    }

    /// Sends `command` and waits for its reply.
    ///
    /// Error replies (4xx/5xx) are returned as a [`ReplyBlock`] whose
    /// `is_ok()` is false; only transport failures are errors.
    ///
    /// # Errors
    ///
    /// - any handshake error from [`ensure_connected`](Self::ensure_connected)
    /// - [`Error::Timeout`] if no reply arrives before `limit`
    /// - [`Error::Connection`] / [`Error::Protocol`] if the session dies while
    ///   the request is pending
    pub async fn submit(&self, command: &str, limit: Duration) -> Result<ReplyBlock> {
        let session = self.session().await?;
        let deadline = Instant::now() + limit;
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest {
            command: command.to_string(),
            deadline,
            reply: tx,
        };
        if session.outbox.send(request).is_err() {
            self.shared.teardown(&session, || {
                Error::Connection("writer stopped".to_string())
            });
            return Err(Error::Connection("control connection closed".to_string()));
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connection("control connection closed".to_string())),
            Err(_) => Err(Error::Timeout(format!(
                "{} after {:?}",
                command_name(command),
                limit
            ))),
        }
    }

    /// [`submit`](Self::submit) with [`DEFAULT_COMMAND_TIMEOUT`].
    pub async fn command(&self, command: &str) -> Result<ReplyBlock> {
        self.submit(command, DEFAULT_COMMAND_TIMEOUT).await
    }

    /// Issues `GETINFO key` and returns the reply text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for a non-2xx reply, plus any
    /// [`submit`](Self::submit) error.
    pub async fn get_info(&self, key: &str, limit: Duration) -> Result<String> {
        let reply = self.submit(&format!("GETINFO {}", key), limit).await?;
        if reply.is_ok() {
            Ok(reply.text)
        } else {
            Err(Error::Protocol(format!(
                "GETINFO {} refused: {}",
                key,
                reply.status_line()
            )))
        }
    }

    /// Drops the current session, failing pending requests.
    pub fn close(&self) {
        let session = match &*self.shared.state() {
            ChannelState::Ready(session) => Some(session.clone()),
            _ => None,
        };
        if let Some(session) = session {
            self.shared.forget(&session);
            session.fail(|| Error::Connection("control channel closed".to_string()));
        }
    }
}

/// Returns the command verb plus first argument, never the credential.
fn command_name(command: &str) -> String {
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("AUTHENTICATE"), _) => "AUTHENTICATE".to_string(),
        (Some(verb), Some(arg)) => format!("{} {}", verb, arg),
        (Some(verb), None) => verb.to_string(),
        _ => String::new(),
    }
}

/// Runs one handshake and publishes its outcome to every waiter.
async fn establish(shared: Arc<Shared>, tx: watch::Sender<HandshakeOutcome>) {
    let result = match tokio::time::timeout(AUTH_TIMEOUT, handshake(&shared.endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeFailure::TimedOut),
    };

    let outcome = match result {
        Ok((reader, writer, buffered)) => {
            let session = start_session(&shared, reader, writer, buffered);
            *shared.state() = ChannelState::Ready(session.clone());
            plog(
                LogLevel::Notice,
                &format!(
                    "Control channel authenticated to {}",
                    shared.endpoint.address
                ),
            );
            Ok(session)
        }
        Err(failure) => {
            *shared.state() = ChannelState::Idle;
            plog(
                LogLevel::Warn,
                &format!(
                    "Control channel handshake with {} failed: {}",
                    shared.endpoint.address,
                    Error::from(failure.clone())
                ),
            );
            Err(failure)
        }
    };
    let _ = tx.send(Some(outcome));
}

async fn handshake(
    endpoint: &ControlEndpoint,
) -> std::result::Result<(OwnedReadHalf, OwnedWriteHalf, ReplyReader), HandshakeFailure> {
    let cookie = endpoint
        .cookie()
        .await
        .map_err(|e| HandshakeFailure::Unreachable(format!("cannot read cookie: {}", e)))?;
    let stream = TcpStream::connect(endpoint.address)
        .await
        .map_err(|e| HandshakeFailure::Unreachable(e.to_string()))?;
    let (mut reader, mut writer) = stream.into_split();

    let mut line = format!("AUTHENTICATE {}\r\n", cookie.as_hex());
    let written = writer.write_all(line.as_bytes()).await;
    line.zeroize();
    written.map_err(|e| HandshakeFailure::Unreachable(e.to_string()))?;

    let mut framer = ReplyReader::default();
    match framer.next(&mut reader).await {
        Ok(Some(block)) if block.code == 250 => Ok((reader, writer, framer)),
        Ok(Some(block)) => Err(HandshakeFailure::Rejected(block.status_line().to_string())),
        Ok(None) => Err(HandshakeFailure::Unreachable(
            "closed during authentication".to_string(),
        )),
        Err(e) => Err(HandshakeFailure::Unreachable(e.to_string())),
    }
}

fn start_session(
    shared: &Arc<Shared>,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    framer: ReplyReader,
) -> Arc<Session> {
    let (outbox, inbox) = mpsc::unbounded_channel();
    let session = Arc::new(Session {
        outbox,
        pending: Mutex::new(VecDeque::new()),
        alive: AtomicBool::new(true),
        tasks: Mutex::new(Vec::new()),
    });

    let writer_task = tokio::spawn(write_commands(
        Arc::downgrade(shared),
        Arc::downgrade(&session),
        writer,
        inbox,
    ));
    let reader_task = tokio::spawn(read_replies(
        Arc::downgrade(shared),
        session.clone(),
        reader,
        framer,
    ));
    if let Ok(mut tasks) = session.tasks.lock() {
        tasks.push(writer_task.abort_handle());
        tasks.push(reader_task.abort_handle());
    }
    session
}

/// Sole writer to the socket. Queues each request before writing it so the
/// pending order always matches the wire order.
async fn write_commands(
    shared: std::sync::Weak<Shared>,
    session: std::sync::Weak<Session>,
    mut writer: OwnedWriteHalf,
    mut inbox: mpsc::UnboundedReceiver<PendingRequest>,
) {
    while let Some(request) = inbox.recv().await {
        let Some(live) = session.upgrade().filter(|s| s.is_alive()) else {
            let _ = request
                .reply
                .send(Err(Error::Connection("control connection closed".to_string())));
            continue;
        };
        let line = format!("{}\r\n", request.command);
        plog(
            LogLevel::Debug,
            &format!("-> {}", command_name(&request.command)),
        );
        live.pending().push_back(request);
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            let message = e.to_string();
            match shared.upgrade() {
                Some(shared) => shared.teardown(&live, || Error::Connection(message.clone())),
                None => {
                    live.fail(|| Error::Connection(message.clone()));
                }
            }
            return;
        }
    }
}

async fn read_replies(
    shared: std::sync::Weak<Shared>,
    session: Arc<Session>,
    mut reader: OwnedReadHalf,
    mut framer: ReplyReader,
) {
    let failure = loop {
        match framer.next(&mut reader).await {
            Ok(Some(block)) => {
                if let Err(e) = session.dispatch(block) {
                    break e;
                }
            }
            Ok(None) => break Error::Connection("closed by peer".to_string()),
            Err(e) => break e,
        }
    };

    let message = failure.to_string();
    let rebuild: Box<dyn Fn() -> Error> = match failure {
        Error::Protocol(_) => Box::new(move || Error::Protocol(message.clone())),
        _ => Box::new(move || Error::Connection(message.clone())),
    };
    match shared.upgrade() {
        Some(shared) => shared.teardown(&session, &rebuild),
        None => {
            session.fail(&rebuild);
        }
    }
}

/// Runs `command` on a fresh one-off connection and returns its reply.
///
/// Sends `AUTHENTICATE`, the command and `QUIT` in one write. The peer may
/// close right after the reply; that is a normal end.
///
/// # Errors
///
/// - [`Error::Authentication`] if the credential is rejected
/// - [`Error::Timeout`] if the exchange exceeds `limit`
/// - [`Error::Connection`] if the peer closes before the reply completes
pub async fn raw_exchange(
    endpoint: &ControlEndpoint,
    command: &str,
    limit: Duration,
) -> Result<ReplyBlock> {
    let exchange = async {
        let cookie = endpoint.cookie().await?;
        let mut stream = TcpStream::connect(endpoint.address)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let mut script = format!(
            "AUTHENTICATE {}\r\n{}\r\nQUIT\r\n",
            cookie.as_hex(),
            command
        );
        let written = stream.write_all(script.as_bytes()).await;
        script.zeroize();
        written.map_err(|e| Error::Connection(e.to_string()))?;

        let mut framer = ReplyReader::default();
        let auth = framer
            .next(&mut stream)
            .await?
            .ok_or_else(|| Error::Connection("closed during authentication".to_string()))?;
        if auth.code != 250 {
            return Err(Error::Authentication(auth.status_line().to_string()));
        }
        let reply = framer.next(&mut stream).await?.ok_or_else(|| {
            Error::Connection(format!("closed before reply to {}", command_name(command)))
        })?;
        Ok::<ReplyBlock, Error>(reply)
    };

    tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| Error::Timeout(format!("raw {} after {:?}", command_name(command), limit)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    const COOKIE: &[u8] = &[0x01, 0x02, 0xab, 0xcd];

    fn cookie_file() -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), COOKIE).unwrap();
        file
    }

    /// Fake control port. `respond` maps each command line to raw reply text
    /// (`None` = stay silent). Returns the endpoint and a connection counter.
    async fn fake_port<F>(
        cookie: &NamedTempFile,
        respond: F,
    ) -> (ControlEndpoint, Arc<AtomicUsize>)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ControlEndpoint::new(listener.local_addr().unwrap(), cookie.path());
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        let respond = Arc::new(respond);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let respond = respond.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let reply = if let Some(hex) = line.strip_prefix("AUTHENTICATE ") {
                            if hex == hex::encode(COOKIE) {
                                Some("250 OK\r\n".to_string())
                            } else {
                                Some("515 Authentication failed\r\n".to_string())
                            }
                        } else if line == "QUIT" {
                            let _ = write.write_all(b"250 closing connection\r\n").await;
                            return;
                        } else {
                            (respond.as_ref())(&line)
                        };
                        if let Some(reply) = reply {
                            if write.write_all(reply.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        (endpoint, connections)
    }

    #[test]
    fn test_secure_cookie_redacted() {
        let cookie = SecureCookie::from_bytes(COOKIE);
        assert_eq!(cookie.as_hex(), "0102abcd");
        assert!(!format!("{:?}", cookie).contains("0102"));
    }

    #[test]
    fn test_command_name_hides_credential() {
        assert_eq!(command_name("AUTHENTICATE deadbeef"), "AUTHENTICATE");
        assert_eq!(command_name("GETINFO ip-to-country/1.2.3.4"), "GETINFO ip-to-country/1.2.3.4");
        assert_eq!(command_name("SIGNAL NEWNYM"), "SIGNAL NEWNYM");
    }

    #[test]
    fn test_endpoint_from_config() {
        let mut config = Config::default();
        config.control_ip = "::1".to_string();
        config.control_port = 9999;
        let endpoint = ControlEndpoint::from_config(&config).unwrap();
        assert_eq!(endpoint.address.port(), 9999);
        assert!(endpoint.address.is_ipv6());

        config.control_ip = "not-an-ip".to_string();
        assert!(matches!(
            ControlEndpoint::from_config(&config),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_pipelined_replies_resolve_in_order() {
        let cookie = cookie_file();
        let (endpoint, connections) = fake_port(&cookie, |line| {
            let key = line.strip_prefix("GETINFO ")?;
            Some(format!("250-{}=value-of-{}\r\n250 OK\r\n", key, key))
        })
        .await;
        let channel = ControlChannel::new(endpoint);

        let mut handles = Vec::new();
        for i in 0..20 {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move {
                let reply = channel
                    .submit(&format!("GETINFO k{}", i), Duration::from_secs(5))
                    .await
                    .unwrap();
                (i, reply)
            }));
        }
        for handle in handles {
            let (i, reply) = handle.await.unwrap();
            assert!(reply.is_ok());
            assert!(reply.text.contains(&format!("k{}=value-of-k{}", i, i)));
        }
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert!(channel.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_handshake() {
        let cookie = cookie_file();
        let (endpoint, connections) = fake_port(&cookie, |_| Some("250 OK\r\n".into())).await;
        let channel = ControlChannel::new(endpoint);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move { channel.ensure_connected().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(connections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_reply_is_not_an_error() {
        let cookie = cookie_file();
        let (endpoint, _) =
            fake_port(&cookie, |_| Some("552 Unrecognized key \"nope\"\r\n".into())).await;
        let channel = ControlChannel::new(endpoint);

        let reply = channel.command("GETINFO nope").await.unwrap();
        assert_eq!(reply.code, 552);
        assert!(!reply.is_ok());
        assert!(matches!(
            channel.get_info("nope", Duration::from_secs(1)).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_credential() {
        let cookie = cookie_file();
        let (mut endpoint, _) = fake_port(&cookie, |_| Some("250 OK\r\n".into())).await;
        let wrong = NamedTempFile::new().unwrap();
        std::fs::write(wrong.path(), b"wrong").unwrap();
        endpoint.cookie_path = wrong.path().to_path_buf();
        let channel = ControlChannel::new(endpoint);

        let err = channel.ensure_connected().await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_keeps_fifo_alignment() {
        let cookie = cookie_file();
        let (endpoint, _) = fake_port(&cookie, |line| {
            if line == "GETINFO slow" {
                // Reply only after the next command arrives.
                None
            } else {
                Some(format!(
                    "250-slow=late\r\n250 OK\r\n250-{}=fresh\r\n250 OK\r\n",
                    line.trim_start_matches("GETINFO ")
                ))
            }
        })
        .await;
        let channel = ControlChannel::new(endpoint);

        let err = channel
            .submit("GETINFO slow", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        let reply = channel
            .submit("GETINFO fast", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(reply.text.contains("fast=fresh"), "got {:?}", reply.text);
    }

    #[tokio::test]
    async fn test_unsolicited_event_resets_channel() {
        let cookie = cookie_file();
        let (endpoint, connections) = fake_port(&cookie, |line| {
            if line == "GETINFO evt" {
                Some("650 CIRC 1 BUILT\r\n".into())
            } else {
                Some("250 OK\r\n".into())
            }
        })
        .await;
        let channel = ControlChannel::new(endpoint);

        let err = channel
            .submit("GETINFO evt", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);

        // The next call opens a new connection.
        let reply = channel.command("GETINFO ok").await.unwrap();
        assert!(reply.is_ok());
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending_and_reconnects() {
        let cookie = cookie_file();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ControlEndpoint::new(listener.local_addr().unwrap(), cookie.path());
        tokio::spawn(async move {
            // First connection: authenticate, then hang up on the command.
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            lines.next_line().await.unwrap();
            write.write_all(b"250 OK\r\n").await.unwrap();
            lines.next_line().await.unwrap();
            drop(write);
            drop(lines);

            // Second connection answers normally.
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(_)) = lines.next_line().await {
                write.write_all(b"250 OK\r\n").await.unwrap();
            }
        });
        let channel = ControlChannel::new(endpoint);

        let err = channel.command("GETINFO version").await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
        assert!(channel.command("GETINFO version").await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_raw_exchange_tolerates_close_after_reply() {
        let cookie = cookie_file();
        let (endpoint, _) = fake_port(&cookie, |line| {
            (line == "GETINFO circuit-status").then(|| {
                "250+circuit-status=\r\n1 BUILT $AA~a PURPOSE=GENERAL\r\n.\r\n250 OK\r\n".to_string()
            })
        })
        .await;

        let reply = raw_exchange(&endpoint, "GETINFO circuit-status", Duration::from_secs(2))
            .await
            .unwrap();
        assert!(reply.is_ok());
        assert!(reply.text.contains("1 BUILT"));
    }

    #[tokio::test]
    async fn test_raw_exchange_missing_cookie() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ControlEndpoint::new(
            listener.local_addr().unwrap(),
            "/nonexistent/control_auth_cookie",
        );
        let err = raw_exchange(&endpoint, "GETINFO version", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
