//! Jabber bot core contracts and value types.
//!
//! This crate exposes the data structures exchanged between the XMPP connection layer, the
//! webhook delivery pipeline and the REST API, together with the configuration snapshot every
//! component reads from.
pub mod config;
pub mod source;
pub mod types;

pub use config::*;
pub use source::*;
pub use types::*;
