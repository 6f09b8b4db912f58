//! QUIC transport configuration shared between connection attempts.
//!
//! The configuration holds the state that needs to outlive a single
//! connection: the QUIC address validation tokens the server hands out and
//! the TLS session tickets. Together they make 0-RTT resumption possible.
//! Connections are re-created over the lifetime of a client, the store is
//! what they have in common.
//!
//! When the server rejects a 0-RTT attempt, the stored state is stale.
//! Instead of removing single entries, the whole store is replaced by a
//! fresh, empty one via [`TransportConfigHolder::reset_resumption_store`].

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use arc_swap::ArcSwap;
use quinn::{TokenMemoryCache, TokenStore};
use rustls::client::{ClientSessionMemoryCache, ClientSessionStore, Resumption};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Number of server origins the resumption store keeps state for.
///
/// A client only ever talks to one upstream.
pub const MAX_ORIGINS: usize = 1;

/// Number of address validation tokens kept per origin.
pub const TOKENS_PER_ORIGIN: usize = 10;

/// Default QUIC keep-alive interval.
pub const DEF_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

//------------ ResumptionStore -----------------------------------------------

/// A bounded store for the state used to resume connections with 0-RTT.
///
/// The store holds the QUIC address validation tokens received via
/// NEW_TOKEN frames and the TLS session tickets. Both are limited to
/// [`MAX_ORIGINS`] servers. Tokens are limited to [`TOKENS_PER_ORIGIN`] per
/// server, tickets to what rustls keeps per server.
///
/// Cloning a store gives another handle to the same state. A fresh store
/// is created through [`ResumptionStore::new`].
#[derive(Clone)]
pub struct ResumptionStore {
    /// The QUIC token cache.
    tokens: Arc<TokenMemoryCache>,

    /// The TLS session ticket cache.
    sessions: Arc<ClientSessionMemoryCache>,
}

impl ResumptionStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(TokenMemoryCache::new(
                MAX_ORIGINS as u32,
                TOKENS_PER_ORIGIN,
            )),
            sessions: Arc::new(ClientSessionMemoryCache::new(MAX_ORIGINS)),
        }
    }

    /// Returns the store as a QUIC token store.
    pub fn token_store(&self) -> Arc<dyn TokenStore> {
        self.tokens.clone()
    }

    /// Returns the store as a rustls session store.
    pub fn session_store(&self) -> Arc<dyn ClientSessionStore> {
        self.sessions.clone()
    }

    /// Returns a rustls resumption policy using this store.
    pub fn resumption(&self) -> Resumption {
        Resumption::store(self.session_store())
    }

    /// Returns whether both handles refer to the same store.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tokens, &other.tokens)
            && Arc::ptr_eq(&self.sessions, &other.sessions)
    }
}

impl Default for ResumptionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResumptionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumptionStore")
            .field("tokens", &Arc::as_ptr(&self.tokens))
            .field("sessions", &Arc::as_ptr(&self.sessions))
            .finish()
    }
}

//------------ ConnectionTracer ----------------------------------------------

/// Receives diagnostic events about connection set-up and tear-down.
///
/// All methods default to doing nothing.
pub trait ConnectionTracer: fmt::Debug + Send + Sync {
    /// A new connection to `peer` is being dialed.
    fn connecting(&self, peer: SocketAddr) {
        let _ = peer;
    }

    /// A connection to `peer` was established.
    ///
    /// `early` is true if the connection was set up with 0-RTT and the
    /// handshake may still be in progress.
    fn connected(&self, peer: SocketAddr, early: bool) {
        let _ = (peer, early);
    }

    /// The cached connection is closed with the given application code.
    fn closing(&self, code: u32) {
        let _ = code;
    }
}

//------------ TransportConfig -----------------------------------------------

/// The transport settings used when dialing a new connection.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Interval for sending keep-alive frames.
    keep_alive_interval: Duration,

    /// Store for session tickets.
    resumption: ResumptionStore,

    /// Optional diagnostics.
    tracer: Option<Arc<dyn ConnectionTracer>>,
}

impl TransportConfig {
    /// Creates a new config with a fresh resumption store.
    pub fn new(
        keep_alive_interval: Duration,
        tracer: Option<Arc<dyn ConnectionTracer>>,
    ) -> Self {
        Self {
            keep_alive_interval,
            resumption: ResumptionStore::new(),
            tracer,
        }
    }

    /// Returns the keep-alive interval.
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
    }

    /// Returns the resumption store.
    pub fn resumption(&self) -> &ResumptionStore {
        &self.resumption
    }

    /// Returns the tracer, if there is one.
    pub fn tracer(&self) -> Option<&dyn ConnectionTracer> {
        self.tracer.as_deref()
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(DEF_KEEP_ALIVE_INTERVAL, None)
    }
}

//------------ TransportConfigHolder -----------------------------------------

/// Holds the current transport config.
///
/// Readers get a snapshot that stays valid even if the config is replaced
/// afterwards, so a connection dialed with an old config is not affected by
/// a reset.
#[derive(Debug)]
pub struct TransportConfigHolder {
    /// The current config.
    current: ArcSwap<TransportConfig>,
}

impl TransportConfigHolder {
    /// Creates a holder with the given initial config.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
        }
    }

    /// Returns the current config.
    pub fn get(&self) -> Arc<TransportConfig> {
        self.current.load_full()
    }

    /// Replaces the resumption store with a fresh, empty one.
    ///
    /// Only connections dialed after this call use the new store.
    pub fn reset_resumption_store(&self) {
        self.current.rcu(|config| {
            let mut config = TransportConfig::clone(config);
            config.resumption = ResumptionStore::new();
            config
        });
    }
}

//============ Tests =========================================================
