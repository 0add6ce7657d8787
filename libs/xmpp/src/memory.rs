use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use jb_core::XmppConfig;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connector::{Connection, InboundStanza, OutboundStanza, StanzaSink, XmppConnector};
use crate::error::TransportError;

const SESSION_BUFFER: usize = 64;
const SENT_HISTORY: usize = 1024;

/// Loopback connector: records outbound stanzas and lets callers inject inbound ones.
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    sent: VecDeque<OutboundStanza>,
    sessions: Vec<MemorySession>,
    next_session: u64,
    connects: u32,
    failures_pending: u32,
    unreachable: bool,
}

struct MemorySession {
    id: u64,
    events: mpsc::Sender<InboundStanza>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundStanza> {
        self.inner.lock().sent.iter().cloned().collect()
    }

    pub fn take_sent(&self) -> Vec<OutboundStanza> {
        self.inner.lock().sent.drain(..).collect()
    }

    /// Number of connect calls seen, successful or not.
    pub fn connect_count(&self) -> u32 {
        self.inner.lock().connects
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.inner.lock().failures_pending = count;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unreachable = unreachable;
    }

    /// Delivers a stanza on the newest open session. Returns false if none accepted it.
    pub fn inject(&self, stanza: InboundStanza) -> bool {
        let state = self.inner.lock();
        match state.sessions.last() {
            Some(session) => session.events.try_send(stanza).is_ok(),
            None => false,
        }
    }

    /// Ends every open session as if the server had hung up.
    pub fn drop_sessions(&self) {
        self.inner.lock().sessions.clear();
    }
}

#[async_trait]
impl XmppConnector for InMemoryConnector {
    async fn connect(&self, settings: &XmppConfig) -> Result<Connection, TransportError> {
        let mut state = self.inner.lock();
        state.connects += 1;
        if state.unreachable {
            return Err(TransportError::Other(format!(
                "server {:?} unreachable",
                settings.server
            )));
        }
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(TransportError::Other("connection refused".into()));
        }

        let (events_tx, events_rx) = mpsc::channel(SESSION_BUFFER);
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.push(MemorySession {
            id,
            events: events_tx,
        });

        Ok(Connection {
            sink: Arc::new(MemorySink {
                id,
                state: Arc::clone(&self.inner),
            }),
            events: events_rx,
        })
    }
}

struct MemorySink {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl StanzaSink for MemorySink {
    async fn send(&self, stanza: OutboundStanza) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.sessions.iter().any(|session| session.id == self.id) {
            return Err(TransportError::Closed);
        }
        if state.sent.len() == SENT_HISTORY {
            state.sent.pop_front();
        }
        state.sent.push_back(stanza);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state
            .lock()
            .sessions
            .retain(|session| session.id != self.id);
        Ok(())
    }
}
