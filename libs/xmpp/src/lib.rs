//! XMPP side of the jabber bot.
//!
//! [`ConnectionClient`] owns one chat session and keeps it alive; [`ConnectionManager`] owns
//! the named clients, delegates outbound sends to the `default` one and merges every
//! client's inbound messages into a single stream. The wire itself sits behind
//! [`XmppConnector`]: [`InMemoryConnector`] is always available, the `tokio-xmpp` feature
//! adds a real network connector.

pub mod client;
pub mod connector;
pub mod error;
pub mod fanin;
pub mod manager;
pub mod memory;
#[cfg(feature = "tokio-xmpp")]
pub mod wire;

pub use client::{ConnectionClient, ConnectionState, INBOUND_CAPACITY};
pub use connector::{Connection, InboundStanza, OutboundStanza, StanzaSink, XmppConnector};
pub use error::{TransportError, XmppError};
pub use fanin::{Merge, NamedStream, merge_streams};
pub use manager::{ConnectionManager, DEFAULT_CLIENT, DEFAULT_POLL_INTERVAL, MERGED_CAPACITY};
pub use memory::InMemoryConnector;
#[cfg(feature = "tokio-xmpp")]
pub use wire::TokioXmppConnector;
