//! A DNS over QUIC transport.
//!
//! The [`Client`] sends DNS requests to a single upstream using DNS over
//! QUIC as defined in RFC 9250. It keeps one QUIC connection to the upstream
//! and sends every request on a new stream of that connection.
//!
//! Connections to DoQ servers break in a number of ways that are invisible
//! until the next request is sent: the connection was idle for too long, the
//! server was restarted and answers with a stateless reset, the server closed
//! the connection because it reached its maximum age, or the server forgot
//! the session ticket used for 0-RTT. In all these cases, the client closes
//! the connection, dials a new one and tries again. This only happens if
//! there was a connection before the request, so a server that cannot be
//! reached at all fails the request right away.
//!
//! The message ID of requests sent over QUIC must be zero. The client clears
//! the ID before sending and restores it afterwards, both on the request and
//! the response.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use core::future::Future;
use std::boxed::Box;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::sync::RwLock;
use tokio::time::error::Elapsed;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, trace};

use crate::net::client::buf::{BufferPool, MAX_MSG_SIZE};
use crate::net::client::error::{Error, ErrorKind};
use crate::net::client::message::{
    add_prefix, strip_prefix, DnsMessage, PREFIX_LEN,
};
use crate::net::client::protocol::{
    BoxFuture, Dial, QuicConnect, QuicConnection, QuicRecvStream,
    QuicSendStream, QuinnConnect, UdpDial, UpstreamAddr,
};
use crate::net::client::tls;
use crate::net::client::transport::{
    ConnectionTracer, TransportConfig, TransportConfigHolder,
    DEF_KEEP_ALIVE_INTERVAL,
};
use crate::utils::config::DefMinMax;

//------------ Configuration Constants ----------------------------------------

/// Configuration limits for the exchange timeout.
const TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(10),
    Duration::from_millis(1),
    Duration::from_secs(60),
);

/// Configuration limits for the keep-alive interval.
const KEEP_ALIVE_INTERVAL: DefMinMax<Duration> = DefMinMax::new(
    DEF_KEEP_ALIVE_INTERVAL,
    Duration::from_secs(1),
    Duration::from_secs(300),
);

/// Configuration limits for the number of re-connect retries.
const MAX_RETRIES: DefMinMax<u8> = DefMinMax::new(2, 0, 5);

/// Close code used when there is no error to signal.
pub const CODE_NO_ERROR: u32 = 0;

/// Close code used when the client gave up on the connection.
pub const CODE_INTERNAL_ERROR: u32 = 1;

//------------ Config ---------------------------------------------------------

/// Configuration for a DNS over QUIC client.
#[derive(Clone, Debug)]
pub struct Config {
    /// Deadline for a single attempt, `None` for no deadline.
    timeout: Option<Duration>,

    /// Interval for QUIC keep-alive frames.
    keep_alive_interval: Duration,

    /// How often a request is retried on a new connection.
    max_retries: u8,

    /// Optional connection diagnostics.
    tracer: Option<Arc<dyn ConnectionTracer>>,
}

impl Config {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the timeout for a single attempt.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sets the timeout for a single attempt.
    ///
    /// Dialing, opening the stream, writing the request and reading the
    /// response together have to finish within this time. `None` or a zero
    /// duration disable the deadline. Other values are capped if they are
    /// too small or too large.
    pub fn set_timeout(&mut self, value: Option<Duration>) {
        self.timeout = TIMEOUT.limit_opt(value)
    }

    /// Returns the keep-alive interval.
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
    }

    /// Sets the keep-alive interval.
    ///
    /// If this value is too small or too large, it will be capped.
    pub fn set_keep_alive_interval(&mut self, value: Duration) {
        self.keep_alive_interval = KEEP_ALIVE_INTERVAL.limit(value)
    }

    /// Returns the maximum number of retries on a new connection.
    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    /// Sets the maximum number of retries on a new connection.
    ///
    /// If this value is too large, it will be capped.
    pub fn set_max_retries(&mut self, value: u8) {
        self.max_retries = MAX_RETRIES.limit(value)
    }

    /// Sets the tracer receiving connection events.
    pub fn set_tracer(&mut self, tracer: Option<Arc<dyn ConnectionTracer>>) {
        self.tracer = tracer
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Some(TIMEOUT.default()),
            keep_alive_interval: KEEP_ALIVE_INTERVAL.default(),
            max_retries: MAX_RETRIES.default(),
            tracer: None,
        }
    }
}

//------------ Client ---------------------------------------------------------

/// A DNS over QUIC client for a single upstream.
///
/// Clones share the connection. Dropping the last clone closes it.
pub struct Client<C: QuicConnect = QuinnConnect> {
    /// The shared state.
    inner: Arc<InnerClient<C>>,
}

impl Client<QuinnConnect> {
    /// Creates a client trusting the Mozilla root certificates.
    pub fn new(addr: UpstreamAddr) -> Result<Self, rustls::Error> {
        let tls = tls::default_client_config()?;
        Ok(Self::with_config(addr, Arc::new(tls), Config::default()))
    }

    /// Creates a client with the given TLS template and config.
    ///
    /// The template is copied for every dial. If it has no ALPN protocols
    /// set, the DoQ tokens are used.
    pub fn with_config(
        addr: UpstreamAddr,
        tls: Arc<ClientConfig>,
        config: Config,
    ) -> Self {
        let dial = UdpDial::new(addr.clone());
        Self::with_parts(addr, dial, QuinnConnect::new(), tls, config)
    }
}

impl<C: QuicConnect> Client<C> {
    /// Creates a client from its parts.
    ///
    /// `dial` finds a reachable address of the upstream, `connect`
    /// establishes QUIC connections to it.
    pub fn with_parts(
        addr: UpstreamAddr,
        dial: impl Dial + 'static,
        connect: C,
        tls: Arc<ClientConfig>,
        config: Config,
    ) -> Self {
        let transport = TransportConfig::new(
            config.keep_alive_interval,
            config.tracer.clone(),
        );
        Self {
            inner: Arc::new(InnerClient {
                addr_str: addr.to_string().into(),
                addr,
                dial: Box::new(dial),
                connect,
                tls,
                transport: TransportConfigHolder::new(transport),
                timeout: config.timeout,
                max_retries: config.max_retries,
                conn: RwLock::new(None),
                pool: BufferPool::new(MAX_MSG_SIZE + PREFIX_LEN),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the upstream address as `quic://host:port`.
    pub fn address(&self) -> &str {
        &self.inner.addr_str
    }

    /// Returns the transport config the next dial will use.
    pub fn transport_config(&self) -> Arc<TransportConfig> {
        self.inner.transport.get()
    }

    /// Returns the pool of receive buffers.
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    /// Sends a request and returns the response.
    ///
    /// The message ID of `msg` is zero while the request is in flight and
    /// restored afterwards, even if the future is dropped. The response
    /// carries the same ID as the request.
    ///
    /// If the request fails with a transport error that a new connection
    /// may fix and there was a connection before the call, the connection
    /// is re-created and the request retried. Whenever the request
    /// ultimately fails, the connection is closed.
    pub async fn exchange<M>(&self, msg: &mut M) -> Result<M, Error>
    where
        M: DnsMessage + Send + Sync,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(self.inner.error(ErrorKind::Closed));
        }

        let msg = RestoreId::new(msg);
        let id = msg.id;
        let mut resp = self.exchange_with_retry(&*msg.msg).await?;
        resp.set_id(id);
        Ok(resp)
    }

    /// Returns whether there currently is a cached connection.
    pub async fn has_connection(&self) -> bool {
        self.inner.conn.read().await.is_some()
    }

    /// Closes the client.
    ///
    /// The cached connection, if any, is closed with code 0. Later
    /// exchanges fail with [`ErrorKind::Closed`].
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.close_with_error(None).await;
    }

    /// Runs an exchange, re-creating the connection if that may help.
    async fn exchange_with_retry<M>(&self, msg: &M) -> Result<M, Error>
    where
        M: DnsMessage + Send + Sync,
    {
        // Only retry if the connection existed before. A fresh connection
        // that fails has nothing stale about it.
        let had_connection = self.has_connection().await;

        let mut res = self.exchange_once(msg).await;

        // Two retries are needed when an idle connection was dropped and
        // the server then also rejects 0-RTT on the next one.
        let mut retries = 0;
        while had_connection && retries < self.inner.max_retries {
            let err = match &res {
                Err(err) if err.is_retryable() => err,
                _ => break,
            };
            debug!(
                "re-creating the connection to {} and retrying: {err}",
                self.address()
            );
            self.close_with_error(Some(err)).await;
            res = self.exchange_once(msg).await;
            retries += 1;
        }

        if let Err(err) = &res {
            self.close_with_error(Some(err)).await;
        }
        res
    }

    /// Sends the request on a new stream and reads the response.
    async fn exchange_once<M>(&self, msg: &M) -> Result<M, Error>
    where
        M: DnsMessage + Send + Sync,
    {
        let deadline =
            self.inner.timeout.map(|timeout| Instant::now() + timeout);

        let conn = self.get_connection(true, deadline).await?;
        let buf = msg
            .pack()
            .map_err(|err| self.inner.error(ErrorKind::MessagePack(err)))?;

        let (mut send, mut recv) = self.open_stream(conn, deadline).await?;

        within(deadline, send.write_all(&add_prefix(&buf)))
            .await
            .map_err(|_| self.inner.error(ErrorKind::Timeout))?
            .map_err(|err| self.inner.error(ErrorKind::StreamWrite(err)))?;

        // Signal the end of the request. Only the sending direction is
        // closed, the response can still be read.
        if let Err(err) = send.finish() {
            trace!("finishing request stream to {}: {err}", self.address());
        }

        self.read_response(&mut recv, deadline).await
    }

    /// Opens a stream, re-creating the connection once if that fails.
    async fn open_stream(
        &self,
        conn: C::Connection,
        deadline: Option<Instant>,
    ) -> Result<
        (
            <C::Connection as QuicConnection>::SendStream,
            <C::Connection as QuicConnection>::RecvStream,
        ),
        Error,
    > {
        match within(deadline, conn.open_bi()).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => {
                debug!("opening stream to {} failed: {err}", self.address())
            }
            Err(_) => {
                debug!("opening stream to {} timed out", self.address())
            }
        }

        // The connection is not usable anymore.
        let conn = self.get_connection(false, deadline).await?;
        within(deadline, conn.open_bi())
            .await
            .map_err(|_| self.inner.error(ErrorKind::Timeout))?
            .map_err(|err| self.inner.error(ErrorKind::StreamOpen(err)))
    }

    /// Reads a single response from the stream.
    async fn read_response<M: DnsMessage>(
        &self,
        recv: &mut <C::Connection as QuicConnection>::RecvStream,
        deadline: Option<Instant>,
    ) -> Result<M, Error> {
        let mut buf = self.inner.pool.get();
        let mut len = 0;
        let mut failure = None;

        while len < buf.len() {
            match within(deadline, recv.read(&mut buf[len..])).await {
                Ok(Ok(Some(0))) | Ok(Ok(None)) => break,
                Ok(Ok(Some(n))) => len += n,
                Ok(Err(err)) => {
                    failure = Some(ErrorKind::StreamRead(err));
                    break;
                }
                Err(_) => {
                    failure = Some(ErrorKind::Timeout);
                    break;
                }
            }
        }

        if let Some(kind) = failure {
            if len == 0 {
                return Err(self.inner.error(kind));
            }
            trace!(
                "reading from {} stopped after {len} octets: {}",
                self.address(),
                self.inner.error(kind)
            );
        }

        // The length prefix is skipped rather than used. There is exactly
        // one response per stream.
        let payload = strip_prefix(&buf[..len])
            .ok_or_else(|| self.inner.error(ErrorKind::ShortMessage))?;
        M::unpack(payload)
            .map_err(|err| self.inner.error(ErrorKind::MessageUnpack(err)))
    }

    /// Returns a connection to the upstream.
    ///
    /// If `use_cached` is true and there is a cached connection, it is
    /// returned. Otherwise the cached connection is closed and a new one
    /// established.
    async fn get_connection(
        &self,
        use_cached: bool,
        deadline: Option<Instant>,
    ) -> Result<C::Connection, Error> {
        // Waiting for a slow dial of another task counts against our own
        // deadline.
        if use_cached {
            let slot = within(deadline, self.inner.conn.read())
                .await
                .map_err(|_| self.inner.error(ErrorKind::ConnectTimeout))?;
            if let Some(conn) = slot.as_ref() {
                return Ok(conn.clone());
            }
        }

        let mut slot = within(deadline, self.inner.conn.write())
            .await
            .map_err(|_| self.inner.error(ErrorKind::ConnectTimeout))?;

        // Somebody else may have connected while we were waiting.
        if use_cached {
            if let Some(conn) = slot.as_ref() {
                return Ok(conn.clone());
            }
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(self.inner.error(ErrorKind::Closed));
        }
        if let Some(conn) = slot.take() {
            self.inner.close_conn(&conn, CODE_NO_ERROR);
        }

        let conn = self.inner.open_connection(deadline).await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Closes the cached connection, if any.
    ///
    /// The close code tells the peer whether there was an error. If the
    /// error is a rejected 0-RTT attempt, the resumption store is reset
    /// first so the next dial does not present the same ticket again.
    async fn close_with_error(&self, err: Option<&Error>) {
        let mut slot = self.inner.conn.write().await;
        let Some(conn) = slot.take() else {
            return;
        };

        let code = match err {
            Some(_) => CODE_INTERNAL_ERROR,
            None => CODE_NO_ERROR,
        };
        if err.map(Error::is_zero_rtt_rejected).unwrap_or(false) {
            debug!("resetting resumption store for {}", self.address());
            self.inner.transport.reset_resumption_store();
        }
        self.inner.close_conn(&conn, code);
    }
}

impl<C: QuicConnect> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: QuicConnect> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.inner.addr)
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

//------------ InnerClient ----------------------------------------------------

/// The state shared by all clones of a [`Client`].
struct InnerClient<C: QuicConnect> {
    /// The upstream.
    addr: UpstreamAddr,

    /// The upstream as a string, for errors.
    addr_str: Arc<str>,

    /// Finds the address to connect to.
    dial: Box<dyn Dial>,

    /// Establishes connections.
    connect: C,

    /// Template for the TLS config, copied for every dial.
    tls: Arc<ClientConfig>,

    /// Transport config with the resumption store.
    transport: TransportConfigHolder,

    /// Deadline for a single attempt.
    timeout: Option<Duration>,

    /// Maximum number of retries on a new connection.
    max_retries: u8,

    /// The cached connection.
    ///
    /// Readers copy the handle and release the lock. Opening and closing
    /// happen under the write lock.
    conn: RwLock<Option<C::Connection>>,

    /// Receive buffers, large enough for a framed maximum size message.
    pool: BufferPool,

    /// Whether the client was closed explicitly.
    closed: AtomicBool,
}

impl<C: QuicConnect> InnerClient<C> {
    /// Creates an error for this upstream.
    fn error(&self, kind: ErrorKind) -> Error {
        Error::new(kind, self.addr_str.clone())
    }

    /// Dials the upstream and establishes a new connection.
    async fn open_connection(
        &self,
        deadline: Option<Instant>,
    ) -> Result<C::Connection, Error> {
        // The socket only tells us which address is reachable, the
        // connection uses its own.
        let sock = within(deadline, self.dial.dial())
            .await
            .map_err(|_| self.error(ErrorKind::ConnectTimeout))?
            .map_err(|err| self.error(ErrorKind::Bootstrap(Arc::new(err))))?;
        let peer = sock
            .peer_addr()
            .map_err(|err| self.error(ErrorKind::Bootstrap(Arc::new(err))))?;
        drop(sock);

        let transport = self.transport.get();
        let fut = self.connect.connect(
            peer,
            self.addr.host(),
            &self.tls,
            &transport,
        );
        let conn = within(deadline, fut)
            .await
            .map_err(|_| self.error(ErrorKind::ConnectTimeout))?
            .map_err(|err| self.error(ErrorKind::Connect(err)))?;
        debug!("opened QUIC connection to {} via {peer}", self.addr_str);
        Ok(conn)
    }

    /// Closes a connection. Failures are logged only.
    fn close_conn(&self, conn: &C::Connection, code: u32) {
        if let Some(tracer) = self.transport.get().tracer() {
            tracer.closing(code);
        }
        if let Err(err) = conn.close(code, b"") {
            error!(
                "failed to close the connection to {}: {err}",
                self.addr_str
            );
        }
    }
}

impl<C: QuicConnect> Drop for InnerClient<C> {
    fn drop(&mut self) {
        // Nobody else can hold the lock once the last reference is gone.
        let conn = self.conn.get_mut().take();
        if let Some(conn) = conn {
            self.close_conn(&conn, CODE_NO_ERROR);
        }
    }
}

//------------ Upstream -------------------------------------------------------

/// An upstream DNS server that messages of type `M` can be sent to.
pub trait Upstream<M>: Send + Sync {
    /// Sends a request and returns the response.
    fn exchange<'a>(
        &'a self,
        msg: &'a mut M,
    ) -> BoxFuture<'a, Result<M, Error>>;

    /// Returns the address of the upstream.
    fn address(&self) -> &str;
}

impl<C, M> Upstream<M> for Client<C>
where
    C: QuicConnect + 'static,
    M: DnsMessage + Send + Sync + 'static,
{
    fn exchange<'a>(
        &'a self,
        msg: &'a mut M,
    ) -> BoxFuture<'a, Result<M, Error>> {
        Box::pin(Client::exchange(self, msg))
    }

    fn address(&self) -> &str {
        Client::address(self)
    }
}

//------------ RestoreId ------------------------------------------------------

/// Clears the message ID and puts it back when dropped.
struct RestoreId<'a, M: DnsMessage> {
    /// The message.
    msg: &'a mut M,

    /// The ID set by the caller.
    id: u16,
}

impl<'a, M: DnsMessage> RestoreId<'a, M> {
    /// Saves the ID of `msg` and sets it to zero.
    fn new(msg: &'a mut M) -> Self {
        let id = msg.id();
        msg.set_id(0);
        Self { msg, id }
    }
}

impl<M: DnsMessage> Drop for RestoreId<'_, M> {
    fn drop(&mut self) {
        self.msg.set_id(self.id);
    }
}

//------------ Utility --------------------------------------------------------

/// Runs `fut` with an optional deadline.
async fn within<F: Future>(
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, Elapsed> {
    match deadline {
        Some(deadline) => timeout_at(deadline, fut).await,
        None => Ok(fut.await),
    }
}

//============ Tests =========================================================
