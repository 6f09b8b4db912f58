//! DNS messages and their framing on a QUIC stream.
//!
//! The client does not care how a DNS message is represented. It only needs
//! to read and change the message ID and to convert the message from and to
//! wire format. The [`DnsMessage`] trait provides exactly that.
//!
//! On a DoQ stream, a message is preceded by its length as a 2-octet
//! big-endian integer, see RFC 9250, section 4.2.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::vec::Vec;

use crate::net::client::error::CodecError;

#[cfg(feature = "hickory")]
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

//------------ DnsMessage ----------------------------------------------------

/// A DNS message that can be sent over the QUIC client.
pub trait DnsMessage: Sized {
    /// Returns the message ID.
    fn id(&self) -> u16;

    /// Sets the message ID.
    fn set_id(&mut self, id: u16);

    /// Serializes the message into wire format.
    fn pack(&self) -> Result<Vec<u8>, CodecError>;

    /// Parses a message from wire format.
    fn unpack(octets: &[u8]) -> Result<Self, CodecError>;
}

#[cfg(feature = "hickory")]
impl DnsMessage for hickory_proto::op::Message {
    fn id(&self) -> u16 {
        hickory_proto::op::Message::id(self)
    }

    fn set_id(&mut self, id: u16) {
        hickory_proto::op::Message::set_id(self, id);
    }

    fn pack(&self) -> Result<Vec<u8>, CodecError> {
        BinEncodable::to_bytes(self).map_err(CodecError::new)
    }

    fn unpack(octets: &[u8]) -> Result<Self, CodecError> {
        <Self as BinDecodable<'_>>::from_bytes(octets)
            .map_err(CodecError::new)
    }
}

//------------ Framing -------------------------------------------------------

/// Length of the message length prefix.
pub const PREFIX_LEN: usize = 2;

/// Returns the message prefixed with its length.
///
/// Messages longer than 65535 octets cannot be framed. The client never
/// produces those as its messages come from [`DnsMessage::pack`].
pub fn add_prefix(msg: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(msg.len() + PREFIX_LEN);
    res.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    res.extend_from_slice(msg);
    res
}

/// Returns the message after its length prefix.
///
/// The prefix is skipped, not checked. Each stream carries exactly one
/// response, so the end of the stream delimits the message. Returns `None`
/// if the data is too short to contain the prefix.
pub fn strip_prefix(data: &[u8]) -> Option<&[u8]> {
    data.get(PREFIX_LEN..)
}

//============ Tests =========================================================
