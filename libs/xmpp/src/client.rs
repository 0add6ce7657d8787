use std::sync::Arc;

use jb_core::{DEFAULT_MESSAGE_TYPE, GROUPCHAT_MESSAGE_TYPE, Message, ReconnectionConfig, XmppConfig};
use jb_telemetry::{record_inbound_dropped, record_reconnect_attempt};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connector::{Connection, InboundStanza, OutboundStanza, StanzaSink, XmppConnector};
use crate::error::XmppError;

/// Buffered inbound messages per client before new ones are dropped.
pub const INBOUND_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct ClientState {
    phase: ConnectionState,
    sink: Option<Arc<dyn StanzaSink>>,
    /// Bumped for every installed session so a stale reader cannot flip a newer session.
    generation: u64,
    token: Option<CancellationToken>,
    inbound_tx: Option<mpsc::Sender<Message>>,
    inbound_rx: Option<mpsc::Receiver<Message>>,
    /// Bumped whenever a connect after `disconnect` opens a fresh inbound channel.
    stream_epoch: u64,
}

/// One chat session plus its reconnection monitor.
///
/// Inbound messages are buffered in a bounded channel whose receiver is handed out once
/// through [`ConnectionClient::take_message_stream`].
pub struct ConnectionClient {
    name: String,
    settings: XmppConfig,
    reconnection: ReconnectionConfig,
    connector: Arc<dyn XmppConnector>,
    state: Mutex<ClientState>,
}

impl ConnectionClient {
    pub fn new(
        name: impl Into<String>,
        settings: XmppConfig,
        reconnection: ReconnectionConfig,
        connector: Arc<dyn XmppConnector>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            name: name.into(),
            settings,
            reconnection,
            connector,
            state: Mutex::new(ClientState {
                phase: ConnectionState::Disconnected,
                sink: None,
                generation: 0,
                token: None,
                inbound_tx: Some(tx),
                inbound_rx: Some(rx),
                stream_epoch: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().phase
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Hands out the inbound receiver. Only the first call after construction or a
    /// reconnect-from-closed returns `Some`.
    pub fn take_message_stream(&self) -> Option<mpsc::Receiver<Message>> {
        self.state.lock().inbound_rx.take()
    }

    /// Which inbound channel is current. Changes each time a fresh one is opened.
    pub fn stream_epoch(&self) -> u64 {
        self.state.lock().stream_epoch
    }

    /// Takes the inbound receiver unless its epoch is `seen`. The returned epoch is the one
    /// the receiver belongs to; the receiver is `None` if someone else already took it.
    pub(crate) fn take_stream_since(
        &self,
        seen: Option<u64>,
    ) -> Option<(u64, Option<mpsc::Receiver<Message>>)> {
        let mut state = self.state.lock();
        if seen == Some(state.stream_epoch) {
            return None;
        }
        Some((state.stream_epoch, state.inbound_rx.take()))
    }

    pub async fn connect(self: &Arc<Self>, parent: &CancellationToken) -> Result<(), XmppError> {
        let token = {
            let mut state = self.state.lock();
            if state.phase != ConnectionState::Disconnected {
                return Ok(());
            }
            if state.inbound_tx.is_none() {
                let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
                state.inbound_tx = Some(tx);
                state.inbound_rx = Some(rx);
                state.stream_epoch += 1;
            }
            state.phase = ConnectionState::Connecting;
            let token = parent.child_token();
            state.token = Some(token.clone());
            token
        };

        let connection = match self.connector.connect(&self.settings).await {
            Ok(connection) => connection,
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    if state.phase == ConnectionState::Connecting {
                        state.phase = ConnectionState::Disconnected;
                        state.token = None;
                    }
                }
                token.cancel();
                error!(client = %self.name, error = %err, "XMPP connection failed");
                return Err(XmppError::Connection(err));
            }
        };

        if !self.install_session(connection, &token) {
            return Err(XmppError::Cancelled);
        }
        info!(
            client = %self.name,
            jid = %self.settings.jid,
            server = %self.settings.server,
            "Successfully connected to XMPP server"
        );

        if self.reconnection.enabled {
            info!(client = %self.name, "Reconnection enabled, starting reconnection monitor");
            tokio::spawn(Arc::clone(self).monitor(token));
        }
        Ok(())
    }

    /// Stops background tasks, closes the session and the inbound channel. Idempotent.
    pub async fn disconnect(&self) {
        let (token, sink) = {
            let mut state = self.state.lock();
            if state.token.is_none() && state.sink.is_none() && state.inbound_tx.is_none() {
                return;
            }
            state.phase = ConnectionState::Disconnected;
            state.inbound_tx = None;
            (state.token.take(), state.sink.take())
        };

        if let Some(token) = token {
            token.cancel();
        }
        if let Some(sink) = sink {
            if let Err(err) = sink.close().await {
                error!(client = %self.name, error = %err, "Error during XMPP disconnect");
            }
        }
        info!(client = %self.name, "XMPP client disconnected");
    }

    pub async fn send_message(&self, to: &str, body: &str, kind: &str) -> Result<(), XmppError> {
        let sink = self.connected_sink()?;
        let kind = if kind.is_empty() {
            DEFAULT_MESSAGE_TYPE
        } else {
            kind
        };
        let stanza = OutboundStanza {
            to: to.to_string(),
            body: body.to_string(),
            kind: kind.to_string(),
            subject: None,
        };

        if let Err(err) = sink.send(stanza).await {
            error!(client = %self.name, to, error = %err, "Failed to send XMPP message");
            return Err(XmppError::Send {
                what: "message",
                source: err,
            });
        }
        info!(client = %self.name, to, message_type = kind, "Message sent successfully");
        Ok(())
    }

    pub async fn send_muc_message(
        &self,
        room: &str,
        body: &str,
        subject: &str,
    ) -> Result<(), XmppError> {
        let sink = self.connected_sink()?;
        let stanza = OutboundStanza {
            to: room.to_string(),
            body: body.to_string(),
            kind: GROUPCHAT_MESSAGE_TYPE.to_string(),
            subject: (!subject.is_empty()).then(|| subject.to_string()),
        };

        if let Err(err) = sink.send(stanza).await {
            error!(client = %self.name, room, error = %err, "Failed to send MUC message");
            return Err(XmppError::Send {
                what: "MUC message",
                source: err,
            });
        }
        info!(client = %self.name, room, subject, "MUC message sent successfully");
        Ok(())
    }

    fn connected_sink(&self) -> Result<Arc<dyn StanzaSink>, XmppError> {
        let state = self.state.lock();
        match (&state.phase, &state.sink) {
            (ConnectionState::Connected, Some(sink)) => Ok(Arc::clone(sink)),
            _ => Err(XmppError::NotConnected),
        }
    }

    /// Makes `connection` the live session. Returns false when the client was shut down
    /// while the connection was being established.
    fn install_session(self: &Arc<Self>, connection: Connection, token: &CancellationToken) -> bool {
        let Connection { sink, events } = connection;
        let mut state = self.state.lock();
        let tx = if token.is_cancelled() {
            None
        } else {
            state.inbound_tx.clone()
        };
        let Some(tx) = tx else {
            drop(state);
            tokio::spawn(async move {
                let _ = sink.close().await;
            });
            return false;
        };
        state.generation += 1;
        state.phase = ConnectionState::Connected;
        state.sink = Some(sink);
        let generation = state.generation;
        drop(state);

        tokio::spawn(Arc::clone(self).read_inbound(generation, events, tx, token.child_token()));
        true
    }

    async fn read_inbound(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<InboundStanza>,
        tx: mpsc::Sender<Message>,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                stanza = events.recv() => match stanza {
                    Some(stanza) => self.accept_inbound(stanza, &tx),
                    None => {
                        self.session_lost(generation);
                        return;
                    }
                },
            }
        }
    }

    fn accept_inbound(&self, stanza: InboundStanza, tx: &mpsc::Sender<Message>) {
        if stanza.body.is_empty() || stanza.from.is_empty() {
            return;
        }
        let message = stanza.into_message();
        let from = message.from.clone();
        match tx.try_send(message) {
            Ok(()) => debug!(client = %self.name, from = %from, "Message received and queued"),
            Err(TrySendError::Full(_)) => {
                warn!(client = %self.name, from = %from, "Message channel full, dropping message");
                record_inbound_dropped(&self.name);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client = %self.name, from = %from, "Inbound channel closed, discarding message")
            }
        }
    }

    fn session_lost(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation || state.phase != ConnectionState::Connected {
            return;
        }
        state.phase = ConnectionState::Disconnected;
        state.sink = None;
        drop(state);
        warn!(client = %self.name, "XMPP session ended by server");
    }

    fn mark_disconnected(&self) {
        let mut state = self.state.lock();
        if state.phase == ConnectionState::Connecting {
            state.phase = ConnectionState::Disconnected;
        }
    }

    async fn monitor(self: Arc<Self>, token: CancellationToken) {
        let period = self.reconnection.check_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if self.state() != ConnectionState::Disconnected {
                        continue;
                    }
                    warn!(client = %self.name, "XMPP connection lost, attempting to reconnect");
                    match self.reconnect(&token).await {
                        Ok(()) => {}
                        Err(XmppError::Cancelled) => return,
                        Err(err) => error!(client = %self.name, error = %err, "Reconnection failed"),
                    }
                }
            }
        }
    }

    async fn reconnect(self: &Arc<Self>, token: &CancellationToken) -> Result<(), XmppError> {
        {
            let mut state = self.state.lock();
            if state.phase != ConnectionState::Disconnected {
                return Ok(());
            }
            state.phase = ConnectionState::Connecting;
        }

        let max_attempts = self.reconnection.max_attempts;
        for attempt in 1..=max_attempts {
            info!(client = %self.name, attempt, max_attempts, "Reconnection attempt");
            record_reconnect_attempt(&self.name);

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.mark_disconnected();
                    return Err(XmppError::Cancelled);
                }
                _ = time::sleep(self.reconnection.backoff) => {}
            }

            match self.connector.connect(&self.settings).await {
                Ok(connection) => {
                    if !self.install_session(connection, token) {
                        return Err(XmppError::Cancelled);
                    }
                    info!(client = %self.name, attempt, "Reconnection successful");
                    return Ok(());
                }
                Err(err) => {
                    error!(client = %self.name, attempt, error = %err, "Reconnection attempt failed")
                }
            }
        }

        self.mark_disconnected();
        Err(XmppError::ReconnectFailed {
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryConnector;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn client_with(
        connector: &InMemoryConnector,
        reconnection: ReconnectionConfig,
    ) -> Arc<ConnectionClient> {
        Arc::new(ConnectionClient::new(
            "default",
            XmppConfig {
                jid: "bot@example.com".into(),
                server: "example.com:5222".into(),
                ..Default::default()
            },
            reconnection,
            Arc::new(connector.clone()),
        ))
    }

    fn fast_reconnect() -> ReconnectionConfig {
        ReconnectionConfig {
            enabled: true,
            max_attempts: 2,
            backoff: Duration::from_millis(10),
            check_interval: Duration::from_millis(20),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let connector = InMemoryConnector::new();
        let client = client_with(&connector, ReconnectionConfig::default());
        let err = client.send_message("a@x", "hi", "").await.unwrap_err();
        assert!(matches!(err, XmppError::NotConnected));
        let err = client.send_muc_message("room@x", "hi", "").await.unwrap_err();
        assert!(matches!(err, XmppError::NotConnected));
    }

    #[tokio::test]
    async fn empty_type_defaults_to_chat_and_muc_uses_groupchat() {
        let connector = InMemoryConnector::new();
        let client = client_with(&connector, ReconnectionConfig::default());
        client.connect(&CancellationToken::new()).await.unwrap();
        assert!(client.is_connected());

        client.send_message("alice@x", "hi", "").await.unwrap();
        client.send_message("alice@x", "hey", "normal").await.unwrap();
        client.send_muc_message("room@conf.x", "all", "").await.unwrap();
        client
            .send_muc_message("room@conf.x", "topic", "News")
            .await
            .unwrap();

        let sent = connector.sent();
        assert_eq!(sent[0].kind, "chat");
        assert_eq!(sent[1].kind, "normal");
        assert_eq!(sent[2].kind, "groupchat");
        assert_eq!(sent[2].subject, None);
        assert_eq!(sent[3].subject.as_deref(), Some("News"));
    }

    #[tokio::test]
    async fn failed_connect_reports_connection_error() {
        let connector = InMemoryConnector::new();
        connector.set_unreachable(true);
        let client = client_with(&connector, ReconnectionConfig::default());
        let err = client.connect(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, XmppError::Connection(_)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_twice_is_a_noop() {
        let connector = InMemoryConnector::new();
        let client = client_with(&connector, ReconnectionConfig::default());
        let mut stream = client.take_message_stream().unwrap();
        client.connect(&CancellationToken::new()).await.unwrap();

        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected());
        assert_eq!(connector.active_sessions(), 0);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn inbound_stanzas_without_body_or_sender_are_skipped() {
        let connector = InMemoryConnector::new();
        let client = client_with(&connector, ReconnectionConfig::default());
        let mut stream = client.take_message_stream().unwrap();
        assert!(client.take_message_stream().is_none());
        client.connect(&CancellationToken::new()).await.unwrap();

        connector.inject(InboundStanza::chat("a@x", "bot@x", ""));
        connector.inject(InboundStanza::chat("", "bot@x", "orphan"));
        connector.inject(InboundStanza {
            id: "m1".into(),
            thread: "t1".into(),
            ..InboundStanza::chat("a@x/phone", "bot@x", "hello")
        });

        let msg = stream.recv().await.unwrap();
        assert_eq!(msg.body, "hello");
        assert_eq!(msg.id, "m1");
        assert_eq!(msg.thread, "t1");
        assert_eq!(msg.r#type, "chat");
        assert!(msg.stamp.is_empty());
    }

    #[test]
    #[traced_test]
    fn full_inbound_channel_drops_and_warns() {
        let connector = InMemoryConnector::new();
        let client = client_with(&connector, ReconnectionConfig::default());
        let (tx, mut rx) = mpsc::channel(INBOUND_CAPACITY);
        for i in 0..=INBOUND_CAPACITY {
            client.accept_inbound(InboundStanza::chat("a@x", "b@x", format!("m{i}")), &tx);
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, INBOUND_CAPACITY);
        assert!(logs_contain("Message channel full, dropping message"));
    }

    #[tokio::test]
    async fn session_drop_without_reconnection_stays_disconnected() {
        let connector = InMemoryConnector::new();
        let client = client_with(&connector, ReconnectionConfig::default());
        client.connect(&CancellationToken::new()).await.unwrap();

        connector.drop_sessions();
        assert!(wait_until(|| !client.is_connected()).await);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn monitor_reconnects_after_session_drop() {
        let connector = InMemoryConnector::new();
        let client = client_with(&connector, fast_reconnect());
        let root = CancellationToken::new();
        client.connect(&root).await.unwrap();

        connector.fail_next_connects(1);
        connector.drop_sessions();
        assert!(wait_until(|| connector.connect_count() >= 3 && client.is_connected()).await);

        root.cancel();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn exhausted_reconnect_retries_on_next_tick() {
        let connector = InMemoryConnector::new();
        let client = client_with(&connector, fast_reconnect());
        let root = CancellationToken::new();
        client.connect(&root).await.unwrap();

        connector.set_unreachable(true);
        connector.drop_sessions();
        // one initial connect plus two rounds of `max_attempts`
        assert!(wait_until(|| connector.connect_count() >= 5).await);
        assert!(!client.is_connected());

        connector.set_unreachable(false);
        assert!(wait_until(|| client.is_connected()).await);

        client.disconnect().await;
        let settled = connector.connect_count();
        time::sleep(Duration::from_millis(80)).await;
        assert_eq!(connector.connect_count(), settled);
    }
}
