//! Underlying transport protocols.
//!
//! The QUIC client does not talk to `quinn` directly but through the traits
//! in this module. [`QuinnConnect`] implements them on top of `quinn`; tests
//! provide their own implementations to script transport failures.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use core::future::Future;
use core::pin::Pin;
use std::boxed::Box;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::string::String;
use std::sync::Arc;
use std::vec::Vec;

use quinn::crypto::rustls::QuicClientConfig;
use quinn::{Endpoint, VarInt};
use rustls::ClientConfig;
use tokio::net::{lookup_host, UdpSocket};
use tracing::trace;
use url::{Host, Url};

use crate::net::client::error::ConnectionError;
use crate::net::client::tls;
use crate::net::client::transport::TransportConfig;

/// The default port for DNS over QUIC, see RFC 9250, section 4.1.1.
pub const DEFAULT_PORT: u16 = 853;

/// The URL scheme of a DoQ upstream.
const SCHEME: &str = "quic";

/// A boxed future as returned by the traits in this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

//------------ UpstreamAddr --------------------------------------------------

/// The address of a DoQ upstream.
///
/// Parsed from `quic://host[:port]`. The scheme may be omitted and the port
/// defaults to 853.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UpstreamAddr {
    /// Host name or IP address, IPv6 addresses without brackets.
    host: String,

    /// The UDP port.
    port: u16,
}

impl UpstreamAddr {
    /// Creates an address from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the host.
    ///
    /// This is also the name the server certificate is checked against.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for UpstreamAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = if s.contains("://") {
            Url::parse(s)
        } else {
            Url::parse(&format!("{SCHEME}://{s}"))
        }
        .map_err(|err| AddrParseError(err.to_string()))?;

        if url.scheme() != SCHEME {
            return Err(AddrParseError(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        let host = match url.host() {
            Some(Host::Domain(name)) if !name.is_empty() => name.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(AddrParseError("missing host".into())),
        };
        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{SCHEME}://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{SCHEME}://{}:{}", self.host, self.port)
        }
    }
}

//------------ AddrParseError ------------------------------------------------

/// An upstream address could not be parsed.
#[derive(Clone, Debug)]
pub struct AddrParseError(String);

impl fmt::Display for AddrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid upstream address: {}", self.0)
    }
}

impl std::error::Error for AddrParseError {}

//------------ Dial ----------------------------------------------------------

/// Finds a reachable address for the upstream.
///
/// The returned socket is only used to learn the peer address. It is
/// dropped right away, the QUIC connection uses its own socket.
pub trait Dial: Send + Sync {
    /// Returns a UDP socket connected to the upstream.
    fn dial(&self) -> BoxFuture<'_, Result<UdpSocket, io::Error>>;
}

//------------ UdpDial -------------------------------------------------------

/// Dials the upstream via UDP.
///
/// Candidate addresses are either given explicitly or resolved from the
/// upstream's host name. They are tried in order, the first one a socket can
/// be connected to wins.
#[derive(Clone, Debug)]
pub struct UdpDial {
    /// The upstream.
    addr: UpstreamAddr,

    /// Pre-resolved addresses. Empty means resolve the host name.
    bootstrap: Vec<SocketAddr>,
}

impl UdpDial {
    /// Creates a dialer that resolves the upstream's host name.
    pub fn new(addr: UpstreamAddr) -> Self {
        Self {
            addr,
            bootstrap: Vec::new(),
        }
    }

    /// Creates a dialer using the given addresses.
    pub fn with_addrs(
        addr: UpstreamAddr,
        bootstrap: Vec<SocketAddr>,
    ) -> Self {
        Self { addr, bootstrap }
    }

    /// Returns the candidate addresses.
    async fn candidates(&self) -> Result<Vec<SocketAddr>, io::Error> {
        if !self.bootstrap.is_empty() {
            return Ok(self.bootstrap.clone());
        }
        Ok(lookup_host((self.addr.host(), self.addr.port()))
            .await?
            .collect())
    }

    /// Binds an unspecified local address and connects it to `peer`.
    async fn connect(peer: SocketAddr) -> Result<UdpSocket, io::Error> {
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let sock = UdpSocket::bind(local).await?;
        sock.connect(peer).await?;
        Ok(sock)
    }
}

impl Dial for UdpDial {
    fn dial(&self) -> BoxFuture<'_, Result<UdpSocket, io::Error>> {
        Box::pin(async move {
            let mut last_err = None;
            for peer in self.candidates().await? {
                match Self::connect(peer).await {
                    Ok(sock) => return Ok(sock),
                    Err(err) => {
                        trace!("cannot use {peer} for {}: {err}", self.addr);
                        last_err = Some(err);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses for {}", self.addr),
                )
            }))
        })
    }
}

//------------ QuicConnect ---------------------------------------------------

/// Establishes QUIC connections.
pub trait QuicConnect: Send + Sync {
    /// The type of an established connection.
    type Connection: QuicConnection;

    /// Dials `peer` and performs the handshake.
    ///
    /// `tls` is a copy of the client's TLS template, `transport` the
    /// transport config current at the time of the dial.
    fn connect<'a>(
        &'a self,
        peer: SocketAddr,
        server_name: &'a str,
        tls: &'a ClientConfig,
        transport: &'a TransportConfig,
    ) -> BoxFuture<'a, Result<Self::Connection, ConnectionError>>;
}

//------------ QuicConnection ------------------------------------------------

/// An established QUIC connection.
///
/// Clones refer to the same connection.
pub trait QuicConnection: Clone + Send + Sync + 'static {
    /// The sending half of a bidirectional stream.
    type SendStream: QuicSendStream;

    /// The receiving half of a bidirectional stream.
    type RecvStream: QuicRecvStream;

    /// Opens a new bidirectional stream.
    fn open_bi(
        &self,
    ) -> BoxFuture<
        '_,
        Result<(Self::SendStream, Self::RecvStream), ConnectionError>,
    >;

    /// Closes the connection, sending `code` to the peer.
    fn close(&self, code: u32, reason: &[u8]) -> Result<(), ConnectionError>;
}

/// The sending half of a QUIC stream.
pub trait QuicSendStream: Send {
    /// Writes all of `buf` to the stream.
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> BoxFuture<'a, Result<(), ConnectionError>>;

    /// Signals that no more data will be sent.
    ///
    /// The receiving half of the stream stays open.
    fn finish(&mut self) -> Result<(), ConnectionError>;
}

/// The receiving half of a QUIC stream.
pub trait QuicRecvStream: Send {
    /// Reads data into `buf`.
    ///
    /// Returns `None` when the peer has finished the stream.
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<Option<usize>, ConnectionError>>;
}

//------------ QuinnConnect --------------------------------------------------

/// Establishes QUIC connections using `quinn`.
///
/// Every connection gets its own endpoint bound to an unspecified local
/// address of the peer's address family.
#[derive(Clone, Copy, Debug, Default)]
pub struct QuinnConnect;

impl QuinnConnect {
    /// Creates a new connector.
    pub fn new() -> Self {
        QuinnConnect
    }
}

impl QuicConnect for QuinnConnect {
    type Connection = QuinnConnection;

    fn connect<'a>(
        &'a self,
        peer: SocketAddr,
        server_name: &'a str,
        tls: &'a ClientConfig,
        transport: &'a TransportConfig,
    ) -> BoxFuture<'a, Result<Self::Connection, ConnectionError>> {
        Box::pin(async move {
            if let Some(tracer) = transport.tracer() {
                tracer.connecting(peer);
            }

            let local: SocketAddr = if peer.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let endpoint = Endpoint::client(local)?;

            let config = quinn_config(tls, transport)?;
            let connecting = endpoint.connect_with(config, peer, server_name)?;

            // With a session ticket at hand the connection is usable right
            // away. If the server rejects the early data, the first stream
            // fails with ZeroRttRejected.
            let (conn, early) = match connecting.into_0rtt() {
                Ok((conn, _accepted)) => (conn, true),
                Err(connecting) => (connecting.await?, false),
            };
            trace!("connected to {peer}, 0-RTT: {early}");
            if let Some(tracer) = transport.tracer() {
                tracer.connected(peer, early);
            }

            Ok(QuinnConnection { conn, endpoint })
        })
    }
}

/// Builds the quinn client config for a single dial.
///
/// The TLS template is copied and the resumption store of `transport`
/// provides both the session tickets and the QUIC tokens.
fn quinn_config(
    tls: &ClientConfig,
    transport: &TransportConfig,
) -> Result<quinn::ClientConfig, ConnectionError> {
    let tls = tls::for_dial(tls, transport.resumption().resumption());
    let crypto = QuicClientConfig::try_from(tls)
        .map_err(|err| ConnectionError::Protocol(err.to_string().into()))?;
    let mut transport_config = quinn::TransportConfig::default();
    transport_config
        .keep_alive_interval(Some(transport.keep_alive_interval()));
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config
        .transport_config(Arc::new(transport_config))
        .token_store(transport.resumption().token_store());
    Ok(config)
}

//------------ QuinnConnection -----------------------------------------------

/// A QUIC connection established by [`QuinnConnect`].
#[derive(Clone, Debug)]
pub struct QuinnConnection {
    /// The connection.
    conn: quinn::Connection,

    /// The endpoint owning the connection's socket.
    endpoint: Endpoint,
}

impl QuinnConnection {
    /// Returns the local address of the connection's socket.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.endpoint.local_addr()
    }
}

impl QuicConnection for QuinnConnection {
    type SendStream = quinn::SendStream;
    type RecvStream = quinn::RecvStream;

    fn open_bi(
        &self,
    ) -> BoxFuture<
        '_,
        Result<(Self::SendStream, Self::RecvStream), ConnectionError>,
    > {
        Box::pin(async move { Ok(self.conn.open_bi().await?) })
    }

    fn close(&self, code: u32, reason: &[u8]) -> Result<(), ConnectionError> {
        self.conn.close(VarInt::from_u32(code), reason);
        Ok(())
    }
}

impl QuicSendStream for quinn::SendStream {
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> BoxFuture<'a, Result<(), ConnectionError>> {
        Box::pin(async move {
            Ok(quinn::SendStream::write_all(self, buf).await?)
        })
    }

    fn finish(&mut self) -> Result<(), ConnectionError> {
        Ok(quinn::SendStream::finish(self)?)
    }
}

impl QuicRecvStream for quinn::RecvStream {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<Option<usize>, ConnectionError>> {
        Box::pin(async move { Ok(quinn::RecvStream::read(self, buf).await?) })
    }
}

//============ Tests =========================================================
