//! TransportSSH — single-request-per-session SSH fallback (spec §4.3).
//!
//! No crate in the retrieved reference pack speaks SSH; `russh` is the one
//! genuinely new third-party dependency this transformation introduces (see
//! DESIGN.md), chosen because it is the pure-Rust, tokio-native async SSH
//! client the rest of this stack would reach for.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use russh::client::{self, Handle};

use beszel_core::{Action, MIN_VERSION_AGENT_RESPONSE, RequestEnvelope, ResponseEnvelope};
use tokio::sync::Mutex;

use super::codec;
use crate::error::TransportError;
use crate::identity::SshIdentity;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECTION_CLASS_MARKERS: [&str; 3] = ["connection", "eof", "closed"];

struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host-key trust is delegated to the fingerprint protocol (spec §4.3, §6).
        Ok(true)
    }
}

pub struct SshTransport {
    host: String,
    port: String,
    identity: Arc<SshIdentity>,
    agent_semver: Mutex<Option<semver::Version>>,
    client: Mutex<Option<Handle<AcceptAnyHostKey>>>,
    connected: AtomicBool,
}

impl SshTransport {
    pub async fn dial(host: &str, port: &str, identity: Arc<SshIdentity>) -> Result<Self, TransportError> {
        let handle = dial_handle(host, port, &identity).await?;
        Ok(Self {
            host: host.to_string(),
            port: port.to_string(),
            identity,
            agent_semver: Mutex::new(None),
            client: Mutex::new(Some(handle)),
            connected: AtomicBool::new(true),
        })
    }

    /// Records the agent semver parsed from the SSH banner (`<banner>_<semver>`),
    /// which gates the response envelope dialect (spec §4.3).
    pub async fn set_agent_version(&self, version: semver::Version) {
        *self.agent_semver.lock().await = Some(version);
    }

    pub async fn request(&self, action: Action, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.request_with_retry(action, payload, 1).await
    }

    /// Retries connection-class errors by dropping the cached client and
    /// redialing; non-connection errors surface immediately (spec §4.3).
    pub async fn request_with_retry(
        &self,
        action: Action,
        payload: &[u8],
        retries: u32,
    ) -> Result<Vec<u8>, TransportError> {
        let mut attempt = 0;
        loop {
            match self.request_once(action, payload).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < retries && is_connection_class(&e) => {
                    attempt += 1;
                    *self.client.lock().await = None;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_once(&self, action: Action, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(dial_handle(&self.host, &self.port, &self.identity).await?);
        }
        let handle = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        let envelope = RequestEnvelope { id: None, action: action as u8, data: payload.to_vec() };
        let frame = codec::encode(&envelope)?;
        channel.data(frame.as_slice()).await.map_err(|e| TransportError::Protocol(e.to_string()))?;
        channel.eof().await.map_err(|e| TransportError::Protocol(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                russh::ChannelMsg::Data { data } => out.extend_from_slice(&data),
                russh::ChannelMsg::Eof | russh::ChannelMsg::Close => break,
                _ => {}
            }
        }

        let min_version =
            semver::Version::new(MIN_VERSION_AGENT_RESPONSE.0, MIN_VERSION_AGENT_RESPONSE.1, MIN_VERSION_AGENT_RESPONSE.2);
        let uses_new_envelope =
            matches!(&*self.agent_semver.lock().await, Some(v) if *v >= min_version);

        if uses_new_envelope {
            let envelope: ResponseEnvelope = codec::decode(&out)?;
            match envelope.error.filter(|e| !e.is_empty()) {
                Some(err) => Err(TransportError::AgentError(err)),
                None => Ok(envelope.data),
            }
        } else {
            // Legacy dialect: raw payload keyed by action, no envelope wrapper.
            Ok(out)
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.client.lock().await = None;
    }
}

async fn dial_handle(
    host: &str,
    port: &str,
    identity: &SshIdentity,
) -> Result<Handle<AcceptAnyHostKey>, TransportError> {
    let config = Arc::new(client::Config::default());
    let key_pair = identity.key_pair().map_err(|e| TransportError::Protocol(e.to_string()))?;

    let mut handle = if let Some(path) = host.strip_prefix('/') {
        let stream =
            tokio::time::timeout(DIAL_TIMEOUT, tokio::net::UnixStream::connect(format!("/{path}")))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::Protocol(e.to_string()))?;
        client::connect_stream(config, stream, AcceptAnyHostKey)
            .await
            .map_err(|e| TransportError::Protocol(e.to_string()))?
    } else {
        let addr = format!("{host}:{port}");
        tokio::time::timeout(DIAL_TIMEOUT, client::connect(config, addr, AcceptAnyHostKey))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Protocol(e.to_string()))?
    };

    let auth = handle
        .authenticate_publickey("u", russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), None))
        .await
        .map_err(|e| TransportError::Protocol(e.to_string()))?;
    if !auth.success() {
        return Err(TransportError::Protocol("ssh authentication rejected".into()));
    }

    Ok(handle)
}

fn is_connection_class(err: &TransportError) -> bool {
    let msg = err.to_string().to_lowercase();
    CONNECTION_CLASS_MARKERS.iter().any(|needle| msg.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_class_errors_are_recognized() {
        assert!(is_connection_class(&TransportError::ConnectionLost));
        assert!(is_connection_class(&TransportError::Protocol("EOF while reading".into())));
        assert!(!is_connection_class(&TransportError::AgentError("disk full".into())));
    }
}
