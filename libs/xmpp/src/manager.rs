use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use jb_core::{BotConfig, InboundSource, Message};
use jb_telemetry::record_inbound_dropped;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::ConnectionClient;
use crate::connector::XmppConnector;
use crate::error::XmppError;
use crate::fanin::{NamedStream, merge_streams};

pub const DEFAULT_CLIENT: &str = "default";
/// Capacity of the merged inbound stream handed to the consumer.
pub const MERGED_CAPACITY: usize = 1000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const FANIN_BUFFER: usize = 64;

type ClientMap = Arc<RwLock<BTreeMap<String, Arc<ConnectionClient>>>>;

struct Dispatcher {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the named connection clients and merges their inbound traffic.
pub struct ConnectionManager {
    config: Arc<BotConfig>,
    connector: Arc<dyn XmppConnector>,
    clients: ClientMap,
    inbound: Mutex<Option<mpsc::Receiver<Message>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    poll_interval: Duration,
}

impl ConnectionManager {
    pub fn new(config: Arc<BotConfig>, connector: Arc<dyn XmppConnector>) -> Self {
        Self {
            config,
            connector,
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            inbound: Mutex::new(None),
            dispatcher: Mutex::new(None),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How often the dispatcher checks for added or removed clients.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub async fn start(&self, parent: &CancellationToken) -> Result<(), XmppError> {
        if self.dispatcher.lock().is_some() {
            warn!("XMPP manager already started");
            return Ok(());
        }
        info!("Starting XMPP manager");

        let client = Arc::new(ConnectionClient::new(
            DEFAULT_CLIENT,
            self.config.xmpp.clone(),
            self.config.reconnection.clone(),
            Arc::clone(&self.connector),
        ));
        client.connect(parent).await?;
        self.clients
            .write()
            .insert(DEFAULT_CLIENT.to_string(), client);

        let (tx, rx) = mpsc::channel(MERGED_CAPACITY);
        *self.inbound.lock() = Some(rx);
        let token = parent.child_token();
        let handle = tokio::spawn(dispatch(
            Arc::clone(&self.clients),
            tx,
            self.poll_interval,
            token.clone(),
        ));
        *self.dispatcher.lock() = Some(Dispatcher { token, handle });

        info!("XMPP manager started successfully");
        Ok(())
    }

    /// Disconnects every client, closes the merged stream and forgets the clients.
    pub async fn stop(&self) {
        info!("Stopping XMPP manager");
        let clients: Vec<Arc<ConnectionClient>> = self.clients.read().values().cloned().collect();
        for client in &clients {
            client.disconnect().await;
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.token.cancel();
            if let Err(err) = dispatcher.handle.await {
                error!(error = %err, "Inbound dispatcher task failed");
            }
        }

        self.clients.write().clear();
        info!("XMPP manager stopped");
    }

    pub async fn send_message(&self, to: &str, body: &str, kind: &str) -> Result<(), XmppError> {
        let client = self.default_client().ok_or(XmppError::NoDefaultClient)?;
        client.send_message(to, body, kind).await
    }

    pub async fn send_muc_message(
        &self,
        room: &str,
        body: &str,
        subject: &str,
    ) -> Result<(), XmppError> {
        let client = self.default_client().ok_or(XmppError::NoDefaultClient)?;
        client.send_muc_message(room, body, subject).await
    }

    pub fn is_connected(&self) -> bool {
        self.default_client()
            .map(|client| client.is_connected())
            .unwrap_or(false)
    }

    /// Adds a named client. The dispatcher merges its inbound stream on the next poll.
    /// Returns false when the name is already taken.
    pub fn register_client(&self, client: Arc<ConnectionClient>) -> bool {
        let mut clients = self.clients.write();
        if clients.contains_key(client.name()) {
            return false;
        }
        clients.insert(client.name().to_string(), client);
        true
    }

    pub fn client_names(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    pub fn client(&self, name: &str) -> Option<Arc<ConnectionClient>> {
        self.clients.read().get(name).cloned()
    }

    /// The merged inbound stream. Handed out once.
    pub fn take_inbound_stream(&self) -> Option<mpsc::Receiver<Message>> {
        self.inbound.lock().take()
    }

    fn default_client(&self) -> Option<Arc<ConnectionClient>> {
        self.client(DEFAULT_CLIENT)
    }
}

impl InboundSource for ConnectionManager {
    fn take_inbound_stream(&self) -> Option<mpsc::Receiver<Message>> {
        ConnectionManager::take_inbound_stream(self)
    }
}

/// Supervisor loop: merges every registered client's stream into `output` and rebuilds the
/// merge whenever the number of registered clients changes or a client reconnected after an
/// explicit disconnect and opened a fresh inbound channel.
async fn dispatch(
    clients: ClientMap,
    output: mpsc::Sender<Message>,
    poll_interval: Duration,
    token: CancellationToken,
) {
    info!("Starting inbound dispatcher");
    let mut taken: BTreeMap<String, u64> = BTreeMap::new();
    let mut streams: Vec<NamedStream> = Vec::new();

    loop {
        let watched = collect_new_streams(&clients, &mut taken, &mut streams);
        if streams.is_empty() {
            warn!("No message channels available for dispatch");
        }
        let mut merge = merge_streams(std::mem::take(&mut streams), FANIN_BUFFER);
        let mut ticker = time::interval_at(Instant::now() + poll_interval, poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut exhausted = false;

        let shutdown = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break true,
                next = merge.output.recv(), if !exhausted => match next {
                    Some(message) => forward(&output, message),
                    None => {
                        debug!("All inbound streams closed");
                        exhausted = true;
                    }
                },
                _ = ticker.tick() => {
                    let current = clients.read().len();
                    if current != watched {
                        info!(previous = watched, current, "Client count changed, updating message channels");
                        break false;
                    }
                    if has_fresh_stream(&clients, &taken) {
                        info!("Client reopened its inbound channel, updating message channels");
                        break false;
                    }
                }
            }
        };

        let (pending, recovered) = merge.teardown().await;
        for message in pending {
            forward(&output, message);
        }
        streams = recovered;

        if shutdown {
            for stream in &mut streams {
                while let Ok(message) = stream.rx.try_recv() {
                    forward(&output, message);
                }
            }
            break;
        }
    }
    info!("Inbound dispatcher stopped");
}

/// Takes every inbound stream whose epoch has not been merged yet. Returns the client count.
fn collect_new_streams(
    clients: &ClientMap,
    taken: &mut BTreeMap<String, u64>,
    streams: &mut Vec<NamedStream>,
) -> usize {
    let clients = clients.read();
    for (name, client) in clients.iter() {
        let Some((epoch, rx)) = client.take_stream_since(taken.get(name).copied()) else {
            continue;
        };
        taken.insert(name.clone(), epoch);
        match rx {
            Some(rx) => {
                streams.retain(|stream| &stream.name != name);
                streams.push(NamedStream::new(name.clone(), rx));
            }
            None => warn!(client = %name, epoch, "Inbound stream already taken"),
        }
    }
    clients.len()
}

fn has_fresh_stream(clients: &ClientMap, taken: &BTreeMap<String, u64>) -> bool {
    clients
        .read()
        .iter()
        .any(|(name, client)| taken.get(name) != Some(&client.stream_epoch()))
}

fn forward(output: &mpsc::Sender<Message>, message: Message) {
    match output.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(message)) => {
            warn!(from = %message.from, "Inbound queue full, dropping message");
            record_inbound_dropped("merged");
        }
        Err(TrySendError::Closed(message)) => {
            debug!(from = %message.from, "Inbound consumer gone, dropping message")
        }
    }
}
