//! Transport facade unifying the WebSocket and SSH agent connections behind
//! one polymorphic type (spec §4.1). A closed two-variant enum fits better
//! here than a trait object: the set of transports is fixed by the protocol,
//! not by a plugin boundary.

pub mod codec;
pub mod ssh;
pub mod ws;

use std::sync::Arc;

use beszel_core::Action;

use crate::error::TransportError;
use ssh::SshTransport;
use ws::WsTransport;

#[derive(Clone)]
pub enum Transport {
    Ws(Arc<WsTransport>),
    Ssh(Arc<SshTransport>),
}

impl Transport {
    pub async fn request(&self, action: Action, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        match self {
            Transport::Ws(ws) => ws.request(action, payload).await,
            Transport::Ssh(ssh) => ssh.request(action, payload).await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Transport::Ws(ws) => ws.is_connected(),
            Transport::Ssh(ssh) => ssh.is_connected(),
        }
    }

    pub async fn close(&self) {
        match self {
            Transport::Ws(ws) => ws.close().await,
            Transport::Ssh(ssh) => ssh.close().await,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Transport::Ws(_) => "ws",
            Transport::Ssh(_) => "ssh",
        }
    }
}
