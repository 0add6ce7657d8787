//! Network connector backed by `tokio-xmpp`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use jb_core::XmppConfig;
use tokio::sync::{mpsc, oneshot};
use tokio_xmpp::parsers::message::{Body, Message as WireMessage, MessageType, Subject};
use tokio_xmpp::parsers::presence::{Presence, Type as PresenceType};
use tokio_xmpp::parsers::{Element, Jid};
use tokio_xmpp::{AsyncClient, AsyncConfig, AsyncServerConfig, Event};
use tracing::{debug, warn};

use crate::connector::{Connection, InboundStanza, OutboundStanza, StanzaSink, XmppConnector};
use crate::error::TransportError;

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 64;

pub struct TokioXmppConnector {
    connect_timeout: Duration,
}

impl TokioXmppConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TokioXmppConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

enum Command {
    Send(Element, oneshot::Sender<Result<(), TransportError>>),
    Close(oneshot::Sender<()>),
}

#[async_trait]
impl XmppConnector for TokioXmppConnector {
    async fn connect(&self, settings: &XmppConfig) -> Result<Connection, TransportError> {
        let address = if settings.resource.is_empty() {
            settings.jid.clone()
        } else {
            format!("{}/{}", settings.jid, settings.resource)
        };
        let jid = Jid::new(&address)
            .map_err(|err| TransportError::Other(format!("invalid jid {address:?}: {err}")))?;
        let server = match split_host_port(&settings.server) {
            Some((host, port)) => AsyncServerConfig::Manual { host, port },
            None => AsyncServerConfig::UseSrv,
        };

        let mut client = AsyncClient::new_with_config(AsyncConfig {
            jid,
            password: settings.password.clone(),
            server,
        });
        client.set_reconnect(false);

        let online = tokio::time::timeout(self.connect_timeout, async {
            while let Some(event) = client.next().await {
                match event {
                    Event::Online { .. } => return Ok(()),
                    Event::Disconnected(err) => return Err(TransportError::Other(err.to_string())),
                    Event::Stanza(_) => {}
                }
            }
            Err(TransportError::Closed)
        })
        .await;
        match online {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(TransportError::Other(format!(
                    "no session after {:?}",
                    self.connect_timeout
                )));
            }
        }

        client
            .send_stanza(Presence::new(PresenceType::None).into())
            .await
            .map_err(|err| TransportError::Other(err.to_string()))?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(run_session(client, commands_rx, events_tx));

        Ok(Connection {
            sink: Arc::new(WireSink {
                commands: commands_tx,
            }),
            events: events_rx,
        })
    }
}

struct WireSink {
    commands: mpsc::Sender<Command>,
}

#[async_trait]
impl StanzaSink for WireSink {
    async fn send(&self, stanza: OutboundStanza) -> Result<(), TransportError> {
        let element = build_message(&stanza)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send(element, reply_tx))
            .await
            .map_err(|_| TransportError::Closed)?;
        reply_rx.await.map_err(|_| TransportError::Closed)?
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Close(reply_tx)).await.is_err() {
            return Ok(());
        }
        let _ = reply_rx.await;
        Ok(())
    }
}

async fn run_session(
    mut client: AsyncClient<AsyncServerConfig>,
    mut commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<InboundStanza>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(element, reply)) => {
                    let result = client
                        .send_stanza(element)
                        .await
                        .map_err(|err| TransportError::Other(err.to_string()));
                    let _ = reply.send(result);
                }
                Some(Command::Close(reply)) => {
                    let _ = client.send_end().await;
                    let _ = reply.send(());
                    return;
                }
                None => {
                    let _ = client.send_end().await;
                    return;
                }
            },
            event = client.next() => match event {
                Some(Event::Stanza(element)) => {
                    if let Some(stanza) = parse_message(element) {
                        if events.try_send(stanza).is_err() {
                            warn!("Session event buffer full, dropping stanza");
                        }
                    }
                }
                Some(Event::Online { .. }) => debug!("XMPP session online"),
                Some(Event::Disconnected(err)) => {
                    warn!(error = %err, "XMPP stream disconnected");
                    return;
                }
                None => return,
            },
        }
    }
}

fn build_message(stanza: &OutboundStanza) -> Result<Element, TransportError> {
    let to = Jid::new(&stanza.to)
        .map_err(|err| TransportError::Other(format!("invalid recipient {:?}: {err}", stanza.to)))?;
    let mut message = WireMessage::new(Some(to));
    message.type_ = match stanza.kind.as_str() {
        "groupchat" => MessageType::Groupchat,
        "normal" => MessageType::Normal,
        "headline" => MessageType::Headline,
        _ => MessageType::Chat,
    };
    message
        .bodies
        .insert(String::new(), Body(stanza.body.clone()));
    if let Some(subject) = &stanza.subject {
        message
            .subjects
            .insert(String::new(), Subject(subject.clone()));
    }
    Ok(message.into())
}

fn parse_message(element: Element) -> Option<InboundStanza> {
    let message = WireMessage::try_from(element).ok()?;
    let body = message
        .get_best_body(Vec::new())
        .map(|(_, body)| body.0.clone())
        .unwrap_or_default();
    let subject = message
        .get_best_subject(Vec::new())
        .map(|(_, subject)| subject.0.clone())
        .unwrap_or_default();
    let kind = match message.type_ {
        MessageType::Chat => "chat",
        MessageType::Groupchat => "groupchat",
        MessageType::Headline => "headline",
        MessageType::Error => "error",
        MessageType::Normal => "normal",
    };
    Some(InboundStanza {
        id: message.id.clone().unwrap_or_default(),
        from: message.from.as_ref().map(|jid| jid.to_string()).unwrap_or_default(),
        to: message.to.as_ref().map(|jid| jid.to_string()).unwrap_or_default(),
        body,
        kind: kind.to_string(),
        subject,
        thread: message
            .thread
            .as_ref()
            .map(|thread| thread.0.clone())
            .unwrap_or_default(),
    })
}

/// Splits `host:port`. Anything else means SRV lookup on the JID domain.
fn split_host_port(server: &str) -> Option<(String, u16)> {
    let (host, port) = server.trim().rsplit_once(':')?;
    let port = port.parse().ok()?;
    (!host.is_empty()).then(|| (host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_address_parsing() {
        assert_eq!(
            split_host_port("chat.example.com:5222"),
            Some(("chat.example.com".to_string(), 5222))
        );
        assert_eq!(split_host_port("chat.example.com"), None);
        assert_eq!(split_host_port(""), None);
    }

    #[test]
    fn outbound_message_round_trips_through_element() {
        let element = build_message(&OutboundStanza {
            to: "room@conference.example.com".into(),
            body: "hello".into(),
            kind: "groupchat".into(),
            subject: Some("News".into()),
        })
        .unwrap();
        let parsed = parse_message(element).unwrap();
        assert_eq!(parsed.kind, "groupchat");
        assert_eq!(parsed.body, "hello");
        assert_eq!(parsed.subject, "News");
        assert_eq!(parsed.to, "room@conference.example.com");
    }
}
