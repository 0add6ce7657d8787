use async_trait::async_trait;
use jb_xmpp::{ConnectionManager, XmppError};

/// Outbound chat operations the REST handlers need.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn send_message(&self, to: &str, body: &str, kind: &str) -> Result<(), XmppError>;
    async fn send_muc_message(&self, room: &str, body: &str, subject: &str)
    -> Result<(), XmppError>;
    fn is_connected(&self) -> bool;
}

#[async_trait]
impl ChatGateway for ConnectionManager {
    async fn send_message(&self, to: &str, body: &str, kind: &str) -> Result<(), XmppError> {
        ConnectionManager::send_message(self, to, body, kind).await
    }

    async fn send_muc_message(
        &self,
        room: &str,
        body: &str,
        subject: &str,
    ) -> Result<(), XmppError> {
        ConnectionManager::send_muc_message(self, room, body, subject).await
    }

    fn is_connected(&self) -> bool {
        ConnectionManager::is_connected(self)
    }
}
