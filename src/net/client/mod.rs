//! Sending requests and receiving responses over QUIC.
//!
//! The client in [`quic`] sends DNS requests to a DoQ upstream. Sending a
//! request and receiving the reply consists of three steps:
//! 1) Creating the client,
//! 2) Creating a request message, and
//! 3) Exchanging the request for a response.
//!
//! # Creating the client
//!
//! A client is created for a single upstream given as `quic://host:port`.
//! [`Client::new`][quic::Client::new] uses the Mozilla root certificates
//! for verifying the server and default settings. Use
//! [`Client::with_config`][quic::Client::with_config] to provide a TLS
//! template and a [`Config`][quic::Config]:
//!
//! ```rust
//! # use doq_upstream::net::client::quic::{Client, Config};
//! # use doq_upstream::net::client::tls;
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! let mut config = Config::new();
//! config.set_timeout(Some(Duration::from_secs(2)));
//! let client = Client::with_config(
//!     "quic://dns.example".parse().unwrap(),
//!     Arc::new(tls::default_client_config().unwrap()),
//!     config,
//! );
//! assert_eq!(client.address(), "quic://dns.example:853");
//! ```
//!
//! No connection is made until the first request is sent.
//!
//! # Creating a request message
//!
//! The client accepts any message type implementing
//! [`DnsMessage`][message::DnsMessage]. With the `hickory` feature, the
//! message type of hickory-proto implements it.
//!
//! # Exchanging messages
//!
//! [`Client::exchange`][quic::Client::exchange] sends the request on a new
//! stream and waits for the response. Clones of a client share the same
//! connection, so a client can be used from many tasks at once.
//!
//! # Errors
//!
//! Failed exchanges return an [`Error`][error::Error] naming the stage that
//! failed and the upstream. The transport's own errors are available via
//! [`ErrorKind::connection_error`][error::ErrorKind::connection_error].

pub mod buf;
pub mod error;
pub mod message;
pub mod protocol;
pub mod quic;
pub mod tls;
pub mod transport;
