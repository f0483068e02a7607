//! Host key bootstrap.
//!
//! The server's SSH identity is a persistent RSA key generated on first
//! start and stored next to the configuration. The file's existence is the
//! idempotence key: a present but unreadable key is a fatal error, never
//! silently regenerated.

use std::path::Path;

use edgetainer_core::{TunnelError, TunnelResult};
use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::LineEnding;
use russh::keys::{decode_secret_key, HashAlg, PrivateKey};
use tracing::info;

const HOST_KEY_BITS: usize = 3072;

/// Load the host key from `path`, generating and persisting a new one if
/// the file does not exist.
pub async fn ensure_host_key(path: &Path) -> TunnelResult<PrivateKey> {
    match tokio::fs::read_to_string(path).await {
        Ok(pem) => {
            let key = decode_secret_key(&pem, None).map_err(|e| {
                TunnelError::Config(format!(
                    "host key {} exists but cannot be decoded: {e}",
                    path.display()
                ))
            })?;
            info!(
                path = %path.display(),
                fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
                "Loaded host key"
            );
            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "Host key not found, generating new key");
            let key = generate_host_key()?;
            persist_host_key(path, &key).await?;
            info!(
                fingerprint = %key.public_key().fingerprint(HashAlg::Sha256),
                "Generated host key"
            );
            Ok(key)
        }
        Err(e) => Err(TunnelError::Config(format!(
            "cannot read host key {}: {e}",
            path.display()
        ))),
    }
}

fn generate_host_key() -> TunnelResult<PrivateKey> {
    let keypair = RsaKeypair::random(&mut rand::rngs::OsRng, HOST_KEY_BITS)
        .map_err(|e| TunnelError::Config(format!("RSA key generation failed: {e}")))?;
    PrivateKey::new(KeypairData::Rsa(keypair), "edgetainer host key")
        .map_err(|e| TunnelError::Config(format!("host key construction failed: {e}")))
}

async fn persist_host_key(path: &Path, key: &PrivateKey) -> TunnelResult<()> {
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| TunnelError::Config(format!("host key encoding failed: {e}")))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TunnelError::Config(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
    }
    tokio::fs::write(path, pem.as_bytes())
        .await
        .map_err(|e| TunnelError::Config(format!("cannot write {}: {e}", path.display())))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| TunnelError::Config(format!("cannot chmod {}: {e}", path.display())))?;
    }
    Ok(())
}
