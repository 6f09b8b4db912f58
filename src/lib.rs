//! A resilient DNS over QUIC upstream client.
//!
//! This crate sends DNS queries to a single DNS over QUIC (DoQ, RFC 9250)
//! server and returns the responses. It is meant to be used as an upstream
//! by DNS forwarders and proxies that have to keep working while servers
//! restart, drop idle connections, or forget the session tickets used for
//! 0-RTT.
//!
//! The client lives in [`net::client::quic`]. It caches one QUIC connection
//! to the upstream, opens a new stream for every query, and transparently
//! re-creates the connection when it turns out to be stale.
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "hickory")]
//! # async fn _test() -> Result<(), Box<dyn std::error::Error>> {
//! use doq_upstream::net::client::quic::Client;
//! use hickory_proto::op::{Message, Query};
//! use hickory_proto::rr::{Name, RecordType};
//! use std::str::FromStr;
//!
//! let client = Client::new("quic://dns.example:853".parse()?)?;
//!
//! let mut msg = Message::new();
//! msg.set_recursion_desired(true);
//! msg.add_query(Query::query(
//!     Name::from_str("example.com.")?,
//!     RecordType::AAAA,
//! ));
//! let resp = client.exchange(&mut msg).await?;
//! println!("{resp}");
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Reference of Feature Flags
//!
//! * `hickory`: Implements the client's message trait for the `Message`
//!   type of the [hickory-proto](https://github.com/hickory-dns/hickory-dns)
//!   crate. Enabled by default.
//! * `tracing-subscriber`: Adds a helper for setting up logging of the
//!   events the client emits via [tracing](https://docs.rs/tracing).

#![allow(renamed_and_removed_lints)]
#![allow(clippy::unknown_clippy_lints)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod net;
pub mod utils;

#[cfg(any(test, feature = "tracing-subscriber"))]
pub mod logging;
