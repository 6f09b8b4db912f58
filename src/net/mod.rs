//! Sending DNS messages.
//!
//! Currently, the module only provides the [`client`] sub-module for sending
//! requests to a DNS over QUIC upstream and receiving responses to them.

pub mod client;
