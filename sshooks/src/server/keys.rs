//! Host key provisioning.

use std::path::Path;

use log::info;
use russh::keys::PrivateKey;
use tokio::process::Command;

use crate::Error;

/// How a missing host key gets generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeygenConfig {
    /// Passed to `ssh-keygen -t`.
    pub key_type: String,
    pub passphrase: String,
}

impl Default for KeygenConfig {
    fn default() -> Self {
        KeygenConfig {
            key_type: "rsa".to_string(),
            passphrase: String::new(),
        }
    }
}

/// Load the host key at `path`, generating it with `ssh-keygen` first
/// if the file does not exist.
pub async fn provision(path: &Path, keygen: &KeygenConfig) -> Result<PrivateKey, Error> {
    if !tokio::fs::try_exists(path).await? {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        info!(
            "generating {} host key in {}",
            keygen.key_type,
            path.display()
        );
        let output = Command::new("ssh-keygen")
            .arg("-f")
            .arg(path)
            .arg("-t")
            .arg(&keygen.key_type)
            .arg("-N")
            .arg(&keygen.passphrase)
            .arg("-q")
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::KeyGeneration(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
    }
    let passphrase = Some(keygen.passphrase.as_str()).filter(|p| !p.is_empty());
    Ok(russh::keys::load_secret_key(path, passphrase)?)
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::io::Write;

    use russh::keys::ssh_key::{Algorithm, LineEnding};

    use super::*;

    #[tokio::test]
    async fn loads_an_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_key");
        let key = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
        {
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(key.to_openssh(LineEnding::LF).unwrap().as_bytes())
                .unwrap();
        }
        let loaded = provision(&path, &KeygenConfig::default()).await.unwrap();
        assert_eq!(loaded.public_key().key_data(), key.public_key().key_data());
    }

    #[tokio::test]
    async fn reports_keygen_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host_key");
        let keygen = KeygenConfig {
            key_type: "no-such-type".to_string(),
            passphrase: String::new(),
        };
        match provision(&path, &keygen).await {
            // Either `ssh-keygen` refused the type or it is not installed.
            Err(Error::KeyGeneration(_)) | Err(Error::IO(_)) => {}
            r => panic!("unexpected result {:?}", r.map(|_| ())),
        }
    }
}
