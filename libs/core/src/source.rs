use tokio::sync::mpsc;

use crate::types::Message;

/// A producer of inbound chat messages that hands its stream to a single consumer.
///
/// The first successful call returns the receiver; every later call returns `None`.
pub trait InboundSource: Send + Sync {
    fn take_inbound_stream(&self) -> Option<mpsc::Receiver<Message>>;
}
