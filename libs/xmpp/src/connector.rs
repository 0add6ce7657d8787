use std::sync::Arc;

use async_trait::async_trait;
use jb_core::{Message, XmppConfig};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// A message stanza to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundStanza {
    pub to: String,
    pub body: String,
    pub kind: String,
    pub subject: Option<String>,
}

/// A message stanza read from the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundStanza {
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub kind: String,
    pub subject: String,
    pub thread: String,
}

impl InboundStanza {
    pub fn chat(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            body: body.into(),
            kind: jb_core::DEFAULT_MESSAGE_TYPE.to_string(),
            ..Default::default()
        }
    }

    pub fn into_message(self) -> Message {
        Message {
            id: self.id,
            from: self.from,
            to: self.to,
            body: self.body,
            r#type: self.kind,
            subject: self.subject,
            thread: self.thread,
            stamp: String::new(),
        }
    }
}

/// Write half of an established session.
#[async_trait]
pub trait StanzaSink: Send + Sync {
    async fn send(&self, stanza: OutboundStanza) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// An established session. `events` ends when the server drops the session.
pub struct Connection {
    pub sink: Arc<dyn StanzaSink>,
    pub events: mpsc::Receiver<InboundStanza>,
}

/// Opens sessions against a chat server.
#[async_trait]
pub trait XmppConnector: Send + Sync {
    async fn connect(&self, settings: &XmppConfig) -> Result<Connection, TransportError>;
}
