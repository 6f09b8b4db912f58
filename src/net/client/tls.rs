//! TLS settings for DNS over QUIC.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::vec::Vec;

/// The ALPN token for DNS over QUIC, see RFC 9250, section 4.1.1.
pub const NEXT_PROTO_DOQ: &str = "doq";

/// The ALPN tokens offered during the handshake, newest first.
///
/// Besides the RFC 9250 token this includes the tokens of earlier drafts
/// that servers in the wild still select.
pub const COMPAT_PROTO_DOQ: [&str; 4] =
    [NEXT_PROTO_DOQ, "doq-i00", "dq", "doq-i02"];

/// Returns the ALPN protocol list in the form rustls expects.
pub fn alpn_protocols() -> Vec<Vec<u8>> {
    COMPAT_PROTO_DOQ
        .iter()
        .map(|proto| proto.as_bytes().to_vec())
        .collect()
}

/// Creates a client config trusting the given roots.
///
/// QUIC requires TLS 1.3, so only that version is enabled. The config
/// offers the DoQ ALPN tokens and allows early data. The session store it
/// carries is replaced with the client's own resumption store on every
/// dial.
pub fn client_config(
    roots: RootCertStore,
) -> Result<ClientConfig, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn_protocols();
    config.enable_early_data = true;
    Ok(config)
}

/// Creates a client config trusting the Mozilla root certificates.
pub fn default_client_config() -> Result<ClientConfig, rustls::Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    client_config(roots)
}

/// Prepares a copy of the TLS template for a single dial.
///
/// The copy uses `resumption` for session tickets, has early data enabled
/// and, unless the template says otherwise, offers the DoQ ALPN tokens.
pub fn for_dial(
    template: &ClientConfig,
    resumption: rustls::client::Resumption,
) -> ClientConfig {
    let mut config = template.clone();
    config.resumption = resumption;
    config.enable_early_data = true;
    if config.alpn_protocols.is_empty() {
        config.alpn_protocols = alpn_protocols();
    }
    config
}

//============ Tests =========================================================
