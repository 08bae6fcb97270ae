//! FingerprintAuth — the once-per-transport agent handshake (spec §4.4).

use beszel_core::{Action, CheckFingerprintRequest, CheckFingerprintResponse};

use crate::error::{HubError, TransportError};
use crate::identity::SshIdentity;
use crate::transport::Transport;
use crate::transport::codec;

pub struct FingerprintOutcome {
    pub fingerprint: String,
    pub hostname: Option<String>,
    pub sys_info: Option<serde_json::Value>,
}

/// Runs the handshake described in §4.4 steps 2-4 against a freshly attached
/// transport. Persistence of the resulting fingerprint (step 5) is the
/// caller's responsibility, since it needs the system's stored row.
pub async fn check_fingerprint(
    transport: &Transport,
    identity: &SshIdentity,
    token: uuid::Uuid,
    need_sys_info: bool,
) -> Result<FingerprintOutcome, HubError> {
    let signature = identity.sign(token.as_bytes());
    let request = CheckFingerprintRequest { signature, need_sys_info };
    let payload = codec::encode(&request).map_err(HubError::Transport)?;

    let raw = transport.request(Action::CheckFingerprint, &payload).await.map_err(HubError::Transport)?;
    let response: CheckFingerprintResponse =
        codec::decode(&raw).map_err(|e| HubError::Transport(TransportError::Protocol(e.to_string())))?;

    Ok(FingerprintOutcome {
        fingerprint: response.fingerprint,
        hostname: response.hostname,
        sys_info: response.sys_info,
    })
}

/// Step 5: reconcile the agent-reported fingerprint against the stored one.
/// `None` stored means "never bound"; accept and the caller persists it.
/// A mismatch is a rejection — never overwrite, it would let a second agent
/// steal another system's slot.
pub fn reconcile(stored: Option<&str>, reported: &str) -> FingerprintDecision {
    match stored {
        None => FingerprintDecision::Bind,
        Some(existing) if existing.is_empty() => FingerprintDecision::Bind,
        Some(existing) if existing == reported => FingerprintDecision::Accept,
        Some(_) => FingerprintDecision::Reject,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintDecision {
    Bind,
    Accept,
    Reject,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_contact_binds() {
        assert_eq!(reconcile(None, "abc"), FingerprintDecision::Bind);
        assert_eq!(reconcile(Some(""), "abc"), FingerprintDecision::Bind);
    }

    #[test]
    fn matching_fingerprint_accepts() {
        assert_eq!(reconcile(Some("abc"), "abc"), FingerprintDecision::Accept);
    }

    #[test]
    fn mismatched_fingerprint_rejects_without_overwrite() {
        assert_eq!(reconcile(Some("abc"), "xyz"), FingerprintDecision::Reject);
    }
}
