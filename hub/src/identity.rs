//! Hub SSH identity: an ed25519 keypair generated once and persisted under
//! `<data_dir>/id_ed25519` / `id_ed25519.pub` (spec §6). The same key signs
//! fingerprint challenges (§4.4) and authenticates the hub's outbound SSH
//! dials (§4.3); host-key verification is delegated to the fingerprint
//! protocol rather than to SSH's own trust model.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

pub struct SshIdentity {
    signing_key: SigningKey,
}

impl SshIdentity {
    pub fn load_or_generate(data_dir: &Path) -> Result<Arc<Self>> {
        let key_path = data_dir.join("id_ed25519");
        let pub_path = data_dir.join("id_ed25519.pub");

        let signing_key = if key_path.exists() {
            let bytes = std::fs::read(&key_path).context("read id_ed25519")?;
            let array: [u8; 32] =
                bytes.as_slice().try_into().context("id_ed25519 has unexpected length")?;
            SigningKey::from_bytes(&array)
        } else {
            std::fs::create_dir_all(data_dir).context("create data dir")?;
            let signing_key = SigningKey::generate(&mut OsRng);
            std::fs::write(&key_path, signing_key.to_bytes()).context("write id_ed25519")?;
            std::fs::write(&pub_path, authorized_key_line(&signing_key))
                .context("write id_ed25519.pub")?;
            signing_key
        };

        Ok(Arc::new(Self { signing_key }))
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// The `ssh-ed25519 <base64> beszel-hub` line returned by `GET /api/beszel/getkey`.
    pub fn authorized_key_line(&self) -> String {
        authorized_key_line(&self.signing_key)
    }

    pub fn key_pair(&self) -> Result<russh::keys::PrivateKey> {
        let public = russh::keys::ssh_key::public::Ed25519PublicKey(
            self.signing_key.verifying_key().to_bytes(),
        );
        let private =
            russh::keys::ssh_key::private::Ed25519PrivateKey::from_bytes(&self.signing_key.to_bytes());
        let keypair = russh::keys::ssh_key::private::Ed25519Keypair { public, private };
        russh::keys::PrivateKey::new(
            russh::keys::ssh_key::private::KeypairData::Ed25519(keypair),
            "beszel-hub",
        )
        .context("build ssh private key from hub identity")
    }
}

fn authorized_key_line(signing_key: &SigningKey) -> String {
    format!("ssh-ed25519 {} beszel-hub\n", BASE64.encode(signing_key.verifying_key().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_generate_persists_and_reloads() {
        let dir = tempdir();
        let first = SshIdentity::load_or_generate(&dir).unwrap();
        let second = SshIdentity::load_or_generate(&dir).unwrap();
        assert_eq!(first.authorized_key_line(), second.authorized_key_line());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn authorized_line_has_expected_shape() {
        let dir = tempdir();
        let identity = SshIdentity::load_or_generate(&dir).unwrap();
        let line = identity.authorized_key_line();
        assert!(line.starts_with("ssh-ed25519 "));
        assert!(line.ends_with(" beszel-hub\n"));
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("beszel-hub-test-{}", uuid::Uuid::new_v4()));
        dir
    }
}
