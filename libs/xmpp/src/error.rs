use thiserror::Error;

/// Failure reported by a wire transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum XmppError {
    #[error("XMPP client is not connected")]
    NotConnected,
    #[error("No default XMPP client available")]
    NoDefaultClient,
    #[error("failed to connect to XMPP server: {0}")]
    Connection(#[source] TransportError),
    #[error("failed to send {what}: {source}")]
    Send {
        what: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("failed to reconnect after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },
    #[error("connection attempt cancelled")]
    Cancelled,
}
