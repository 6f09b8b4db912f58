#![cfg(feature = "hickory")]

use doq_upstream::logging::init_logging;
use doq_upstream::net::client::error::{
    CodecError, ConnectionError, ErrorKind,
};
use doq_upstream::net::client::message::{add_prefix, DnsMessage};
use doq_upstream::net::client::protocol::{
    BoxFuture, Dial, QuicConnect, QuicConnection, QuicRecvStream,
    QuicSendStream, UdpDial, UpstreamAddr,
};
use doq_upstream::net::client::quic::{Client, Config, Upstream};
use doq_upstream::net::client::tls;
use doq_upstream::net::client::transport::{ResumptionStore, TransportConfig};
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::{Name, RecordType};
use rstest::rstest;
use rustls::ClientConfig;
use std::cmp;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;

//------------ Mock Transport -------------------------------------------------

/// What the mock upstream does with the next stream.
#[derive(Clone, Debug)]
enum Plan {
    /// Answer the query.
    Echo,

    /// Send these raw octets and finish the stream.
    Respond(Vec<u8>),

    /// Fail opening the stream.
    OpenFails(ConnectionError),

    /// Fail writing the request.
    WriteFails(ConnectionError),

    /// Fail reading the response.
    ReadFails(ConnectionError),

    /// Never answer.
    Hang,
}

#[derive(Debug, Default)]
struct MockServer {
    plans: Mutex<VecDeque<Plan>>,
    stores: Mutex<Vec<ResumptionStore>>,
    requests: Mutex<Vec<Vec<u8>>>,
    closes: Mutex<Vec<(usize, u32)>>,
    connect_delay: Mutex<Option<Duration>>,
    connect_fails: Mutex<VecDeque<ConnectionError>>,
}

impl MockServer {
    fn new() -> Arc<Self> {
        Default::default()
    }

    fn push(&self, plan: Plan) {
        self.plans.lock().unwrap().push_back(plan);
    }

    fn fail_connect(&self, err: ConnectionError) {
        self.connect_fails.lock().unwrap().push_back(err);
    }

    fn pending(&self) -> usize {
        self.plans.lock().unwrap().len()
    }

    fn dials(&self) -> usize {
        self.stores.lock().unwrap().len()
    }

    fn store(&self, dial: usize) -> ResumptionStore {
        self.stores.lock().unwrap()[dial].clone()
    }

    fn closes(&self) -> Vec<(usize, u32)> {
        self.closes.lock().unwrap().clone()
    }

    fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

#[derive(Clone, Debug)]
struct MockConnect(Arc<MockServer>);

impl QuicConnect for MockConnect {
    type Connection = MockConnection;

    fn connect<'a>(
        &'a self,
        _peer: SocketAddr,
        _server_name: &'a str,
        _tls: &'a ClientConfig,
        transport: &'a TransportConfig,
    ) -> BoxFuture<'a, Result<MockConnection, ConnectionError>> {
        Box::pin(async move {
            let id = {
                let mut stores = self.0.stores.lock().unwrap();
                stores.push(transport.resumption().clone());
                stores.len()
            };
            let delay = *self.0.connect_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let failure = self.0.connect_fails.lock().unwrap().pop_front();
            if let Some(err) = failure {
                return Err(err);
            }
            Ok(MockConnection {
                id,
                server: self.0.clone(),
            })
        })
    }
}

#[derive(Clone, Debug)]
struct MockConnection {
    id: usize,
    server: Arc<MockServer>,
}

impl QuicConnection for MockConnection {
    type SendStream = MockSend;
    type RecvStream = MockRecv;

    fn open_bi(
        &self,
    ) -> BoxFuture<'_, Result<(MockSend, MockRecv), ConnectionError>> {
        Box::pin(async move {
            let plan = self
                .server
                .plans
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Plan::Echo);
            if let Plan::OpenFails(err) = plan {
                return Err(err);
            }
            let written = Arc::new(Mutex::new(Vec::new()));
            let send = MockSend {
                plan: plan.clone(),
                written: written.clone(),
                server: self.server.clone(),
            };
            let recv = MockRecv {
                plan,
                written,
                out: None,
            };
            Ok((send, recv))
        })
    }

    fn close(&self, code: u32, _reason: &[u8]) -> Result<(), ConnectionError> {
        self.server.closes.lock().unwrap().push((self.id, code));
        Ok(())
    }
}

struct MockSend {
    plan: Plan,
    written: Arc<Mutex<Vec<u8>>>,
    server: Arc<MockServer>,
}

impl QuicSendStream for MockSend {
    fn write_all<'a>(
        &'a mut self,
        buf: &'a [u8],
    ) -> BoxFuture<'a, Result<(), ConnectionError>> {
        Box::pin(async move {
            if let Plan::WriteFails(err) = &self.plan {
                return Err(err.clone());
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(())
        })
    }

    fn finish(&mut self) -> Result<(), ConnectionError> {
        let written = self.written.lock().unwrap().clone();
        self.server.requests.lock().unwrap().push(written);
        Ok(())
    }
}

struct MockRecv {
    plan: Plan,
    written: Arc<Mutex<Vec<u8>>>,
    out: Option<Vec<u8>>,
}

impl QuicRecvStream for MockRecv {
    fn read<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<Option<usize>, ConnectionError>> {
        Box::pin(async move {
            match &self.plan {
                Plan::ReadFails(err) => return Err(err.clone()),
                Plan::Hang => std::future::pending::<()>().await,
                _ => {}
            }
            if self.out.is_none() {
                let out = match &self.plan {
                    Plan::Respond(data) => data.clone(),
                    _ => answer(&self.written.lock().unwrap()),
                };
                self.out = Some(out);
            }
            let out = self.out.as_mut().unwrap();
            if out.is_empty() {
                return Ok(None);
            }
            // Hand out the response in small pieces.
            let n = cmp::min(cmp::min(buf.len(), out.len()), 7);
            buf[..n].copy_from_slice(&out[..n]);
            out.drain(..n);
            Ok(Some(n))
        })
    }
}

//------------ Helpers --------------------------------------------------------

/// A dialer that cannot find the upstream.
struct NoRouteDial;

impl Dial for NoRouteDial {
    fn dial(&self) -> BoxFuture<'_, Result<UdpSocket, io::Error>> {
        Box::pin(async {
            Err(io::Error::new(io::ErrorKind::NotFound, "no route"))
        })
    }
}

/// A message that is just its octets.
#[derive(Debug)]
struct Raw(Vec<u8>);

impl DnsMessage for Raw {
    fn id(&self) -> u16 {
        u16::from_be_bytes([self.0[0], self.0[1]])
    }

    fn set_id(&mut self, id: u16) {
        self.0[..2].copy_from_slice(&id.to_be_bytes());
    }

    fn pack(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.0.clone())
    }

    fn unpack(octets: &[u8]) -> Result<Self, CodecError> {
        Ok(Raw(octets.to_vec()))
    }
}

/// Builds the framed response to a framed request.
fn answer(request: &[u8]) -> Vec<u8> {
    let req = Message::from_vec(&request[2..]).unwrap();
    let mut resp = Message::new();
    resp.set_id(req.id())
        .set_message_type(MessageType::Response)
        .add_queries(req.queries().to_vec());
    add_prefix(&resp.to_vec().unwrap())
}

fn query(id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id).set_recursion_desired(true).add_query(Query::query(
        Name::from_str("example.com.").unwrap(),
        RecordType::A,
    ));
    msg
}

fn client_with(
    server: &Arc<MockServer>,
    config: Config,
) -> Client<MockConnect> {
    let addr = UpstreamAddr::new("dns.example", 853);
    let dial = UdpDial::with_addrs(
        addr.clone(),
        vec![SocketAddr::from(([127, 0, 0, 1], 853))],
    );
    Client::with_parts(
        addr,
        dial,
        MockConnect(server.clone()),
        Arc::new(tls::default_client_config().unwrap()),
        config,
    )
}

fn client(server: &Arc<MockServer>) -> Client<MockConnect> {
    client_with(server, Config::default())
}

//------------ Tests ----------------------------------------------------------

#[tokio::test]
async fn request_is_framed_with_zero_id() {
    let server = MockServer::new();
    let client = client(&server);

    let mut msg = query(0x4242);
    let resp = client.exchange(&mut msg).await.unwrap();
    assert_eq!(resp.id(), 0x4242);
    assert_eq!(msg.id(), 0x4242);
    assert_eq!(resp.message_type(), MessageType::Response);
    assert_eq!(resp.queries(), msg.queries());

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let wire = &requests[0];
    let len = u16::from_be_bytes([wire[0], wire[1]]) as usize;
    assert_eq!(len, wire.len() - 2);
    assert_eq!(&wire[2..4], &[0, 0]);
    assert!(client.has_connection().await);
}

#[tokio::test(start_paused = true)]
async fn concurrent_first_use_dials_once() {
    let server = MockServer::new();
    *server.connect_delay.lock().unwrap() = Some(Duration::from_millis(100));
    let client = client(&server);

    let mut tasks = JoinSet::new();
    for id in 1..=10u16 {
        let client = client.clone();
        tasks.spawn(async move {
            let mut msg = query(id);
            let resp = client.exchange(&mut msg).await.unwrap();
            assert_eq!(resp.id(), id);
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
    assert_eq!(server.dials(), 1);
    assert_eq!(server.requests().len(), 10);
}

#[tokio::test]
async fn reconnects_after_idle_timeout() {
    init_logging();
    let server = MockServer::new();
    let client = client(&server);

    client.exchange(&mut query(1)).await.unwrap();
    assert_eq!(server.dials(), 1);

    // The cached connection timed out while idle. The request succeeds on
    // a new connection.
    server.push(Plan::ReadFails(ConnectionError::IdleTimeout));
    let mut msg = query(0xabcd);
    let resp = client.exchange(&mut msg).await.unwrap();
    assert_eq!(resp.id(), 0xabcd);
    assert_eq!(msg.id(), 0xabcd);
    assert_eq!(server.dials(), 2);
    assert_eq!(server.closes(), vec![(1, 1)]);

    // Nothing about 0-RTT went wrong, so the tickets are kept.
    assert!(server.store(0).ptr_eq(&server.store(1)));
    assert!(client.has_connection().await);
}

#[rstest]
#[case::idle_timeout(ConnectionError::IdleTimeout)]
#[case::stateless_reset(ConnectionError::StatelessReset)]
#[case::server_restart(ConnectionError::ApplicationClosed {
    code: 0,
    reason: Default::default(),
})]
#[case::max_age(ConnectionError::TransportClosed {
    code: 0,
    reason: Default::default(),
})]
#[case::zero_rtt(ConnectionError::ZeroRttRejected)]
#[tokio::test]
async fn stale_connection_is_replaced(#[case] failure: ConnectionError) {
    let server = MockServer::new();
    let client = client(&server);
    client.exchange(&mut query(1)).await.unwrap();

    server.push(Plan::ReadFails(failure));
    let resp = client.exchange(&mut query(2)).await.unwrap();
    assert_eq!(resp.id(), 2);
    assert_eq!(server.dials(), 2);
    assert_eq!(server.closes(), vec![(1, 1)]);
}

#[tokio::test]
async fn retries_are_bounded() {
    let server = MockServer::new();
    let client = client(&server);
    client.exchange(&mut query(1)).await.unwrap();

    for _ in 0..5 {
        server.push(Plan::ReadFails(ConnectionError::IdleTimeout));
    }
    let mut msg = query(7);
    let err = client.exchange(&mut msg).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::StreamRead(ConnectionError::IdleTimeout)
    ));
    assert_eq!(msg.id(), 7);

    // One attempt plus two retries.
    assert_eq!(server.pending(), 2);
    assert_eq!(server.dials(), 3);
    assert_eq!(server.closes(), vec![(1, 1), (2, 1), (3, 1)]);
    assert!(!client.has_connection().await);
}

#[tokio::test]
async fn retry_limit_is_configurable() {
    let server = MockServer::new();
    let mut config = Config::new();
    config.set_max_retries(0);
    let client = client_with(&server, config);
    client.exchange(&mut query(1)).await.unwrap();

    server.push(Plan::ReadFails(ConnectionError::StatelessReset));
    assert!(client.exchange(&mut query(2)).await.is_err());
    assert_eq!(server.dials(), 1);
    assert_eq!(server.pending(), 0);
}

#[tokio::test]
async fn no_retry_on_fresh_connection() {
    let server = MockServer::new();
    let client = client(&server);

    server.push(Plan::ReadFails(ConnectionError::IdleTimeout));
    server.push(Plan::Echo);
    let err = client.exchange(&mut query(3)).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(server.dials(), 1);
    assert_eq!(server.pending(), 1);
    assert_eq!(server.closes(), vec![(1, 1)]);
    assert!(!client.has_connection().await);
}

#[tokio::test]
async fn no_retry_on_fatal_error() {
    let server = MockServer::new();
    let client = client(&server);
    client.exchange(&mut query(1)).await.unwrap();

    server.push(Plan::ReadFails(ConnectionError::ApplicationClosed {
        code: 5,
        reason: Default::default(),
    }));
    let err = client.exchange(&mut query(2)).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(server.dials(), 1);
    assert_eq!(server.closes(), vec![(1, 1)]);
}

#[tokio::test]
async fn zero_rtt_rejection_resets_store() {
    let server = MockServer::new();
    let client = client(&server);
    client.exchange(&mut query(1)).await.unwrap();
    let first = server.store(0);
    assert!(client.transport_config().resumption().ptr_eq(&first));

    server.push(Plan::WriteFails(ConnectionError::ZeroRttRejected));
    let resp = client.exchange(&mut query(9)).await.unwrap();
    assert_eq!(resp.id(), 9);

    assert_eq!(server.dials(), 2);
    let second = server.store(1);
    assert!(!first.ptr_eq(&second));
    assert!(client.transport_config().resumption().ptr_eq(&second));
    assert_eq!(server.closes(), vec![(1, 1)]);
}

#[tokio::test]
async fn stream_open_failure_recreates_connection() {
    let server = MockServer::new();
    let client = client(&server);
    client.exchange(&mut query(1)).await.unwrap();

    server.push(Plan::OpenFails(ConnectionError::LocallyClosed));
    let resp = client.exchange(&mut query(2)).await.unwrap();
    assert_eq!(resp.id(), 2);
    assert_eq!(server.dials(), 2);
    assert_eq!(server.closes(), vec![(1, 0)]);
}

#[tokio::test]
async fn buffer_is_returned_after_unpack_failure() {
    let server = MockServer::new();
    let client = client(&server);

    server.push(Plan::Respond(vec![0, 3, 1, 2, 3]));
    let err = client.exchange(&mut query(1)).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::MessageUnpack(_)));
    assert_eq!(client.buffer_pool().outstanding(), 0);
    assert_eq!(client.buffer_pool().idle(), 1);

    client.exchange(&mut query(2)).await.unwrap();
    assert_eq!(client.buffer_pool().outstanding(), 0);
    assert_eq!(client.buffer_pool().idle(), 1);
}

#[tokio::test]
async fn short_responses_are_rejected() {
    let server = MockServer::new();
    let client = client(&server);

    server.push(Plan::Respond(vec![0]));
    let err = client.exchange(&mut query(1)).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ShortMessage));

    server.push(Plan::Respond(Vec::new()));
    let err = client.exchange(&mut query(1)).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ShortMessage));
}

#[tokio::test]
async fn length_prefix_is_not_checked() {
    let server = MockServer::new();
    let client = client(&server);

    let mut framed = answer(&add_prefix(&query(0).to_vec().unwrap()));
    framed[0] = 0xff;
    framed[1] = 0xff;
    server.push(Plan::Respond(framed));
    let resp = client.exchange(&mut query(0x1111)).await.unwrap();
    assert_eq!(resp.id(), 0x1111);
}

#[tokio::test(start_paused = true)]
async fn exchange_times_out() {
    let server = MockServer::new();
    let mut config = Config::new();
    config.set_timeout(Some(Duration::from_secs(1)));
    let client = client_with(&server, config);
    client.exchange(&mut query(1)).await.unwrap();

    server.push(Plan::Hang);
    let mut msg = query(0x5555);
    let err = client.exchange(&mut msg).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Timeout));
    assert_eq!(msg.id(), 0x5555);
    assert_eq!(server.dials(), 1);
    assert!(!client.has_connection().await);
}

#[tokio::test]
async fn close_rejects_later_exchanges() {
    let server = MockServer::new();
    let client = client(&server);
    client.exchange(&mut query(1)).await.unwrap();

    client.close().await;
    assert_eq!(server.closes(), vec![(1, 0)]);
    let err = client.exchange(&mut query(2)).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Closed));
    assert_eq!(server.dials(), 1);

    drop(client);
    assert_eq!(server.closes(), vec![(1, 0)]);
}

#[tokio::test]
async fn drop_closes_connection() {
    let server = MockServer::new();
    let client = client(&server);
    let other = client.clone();
    client.exchange(&mut query(1)).await.unwrap();

    drop(client);
    assert!(server.closes().is_empty());
    drop(other);
    assert_eq!(server.closes(), vec![(1, 0)]);
}

#[tokio::test]
async fn usable_as_upstream() {
    let server = MockServer::new();
    let upstream: Box<dyn Upstream<Message>> = Box::new(client(&server));
    assert_eq!(upstream.address(), "quic://dns.example:853");

    let resp = upstream.exchange(&mut query(0x0102)).await.unwrap();
    assert_eq!(resp.id(), 0x0102);
}

#[tokio::test]
async fn first_dial_failure_is_not_retried() {
    let server = MockServer::new();
    let client = client(&server);

    server.fail_connect(ConnectionError::IdleTimeout);
    let mut msg = query(0x0a0a);
    let err = client.exchange(&mut msg).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::Connect(ConnectionError::IdleTimeout)
    ));
    assert!(err.is_retryable());
    assert_eq!(msg.id(), 0x0a0a);
    assert_eq!(server.dials(), 1);
    assert!(server.closes().is_empty());
    assert!(!client.has_connection().await);
}

#[tokio::test]
async fn failed_redial_ends_the_exchange() {
    let server = MockServer::new();
    let client = client(&server);
    client.exchange(&mut query(1)).await.unwrap();

    server.push(Plan::ReadFails(ConnectionError::IdleTimeout));
    server.fail_connect(ConnectionError::Protocol("handshake failed".into()));
    let err = client.exchange(&mut query(2)).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        ErrorKind::Connect(ConnectionError::Protocol(_))
    ));
    assert_eq!(server.dials(), 2);
    assert_eq!(server.closes(), vec![(1, 1)]);
    assert!(!client.has_connection().await);

    // The next exchange starts over with a new connection.
    client.exchange(&mut query(3)).await.unwrap();
    assert_eq!(server.dials(), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_handshake_times_out() {
    let server = MockServer::new();
    *server.connect_delay.lock().unwrap() = Some(Duration::from_secs(5));
    let mut config = Config::new();
    config.set_timeout(Some(Duration::from_secs(1)));
    let client = client_with(&server, config);

    let err = client.exchange(&mut query(1)).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ConnectTimeout));
    assert_eq!(server.dials(), 1);
    assert!(!client.has_connection().await);
}

#[tokio::test]
async fn unreachable_upstream_fails_bootstrap() {
    let server = MockServer::new();
    let client = Client::with_parts(
        UpstreamAddr::new("dns.example", 853),
        NoRouteDial,
        MockConnect(server.clone()),
        Arc::new(tls::default_client_config().unwrap()),
        Config::default(),
    );

    let err = client.exchange(&mut query(1)).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Bootstrap(_)));
    assert_eq!(server.dials(), 0);
}

#[tokio::test]
async fn maximum_size_response_is_read_whole() {
    let server = MockServer::new();
    let client = client(&server);

    let mut payload = vec![0x5a; 65535];
    payload[..2].copy_from_slice(&[0, 0]);
    server.push(Plan::Respond(add_prefix(&payload)));

    let mut msg = Raw(vec![0x12, 0x34, 1, 2, 3]);
    let resp = client.exchange(&mut msg).await.unwrap();
    assert_eq!(resp.0.len(), 65535);
    assert_eq!(resp.id(), 0x1234);
    assert_eq!(&resp.0[2..], &payload[2..]);
    assert_eq!(msg.id(), 0x1234);
}
