//! Public key authentication.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::debug;
use russh::keys::ssh_key::{HashAlg, PublicKey};

use crate::Error;

/// Extension under which the identity of a connection is recorded.
pub const KEY_ID: &str = "key-id";

/// What an accepted key grants to a connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Permissions {
    pub extensions: HashMap<String, String>,
}

impl Permissions {
    /// Permissions identifying the connection as `key_id`.
    pub fn with_key_id(key_id: impl Into<String>) -> Self {
        let mut extensions = HashMap::new();
        extensions.insert(KEY_ID.to_string(), key_id.into());
        Permissions { extensions }
    }

    pub fn key_id(&self) -> Option<&str> {
        self.extensions.get(KEY_ID).map(String::as_str)
    }
}

/// Decides which public keys may log in.
pub trait Authenticator: Send + Sync + 'static {
    /// `None` rejects the key.
    fn authenticate(&self, user: &str, key: &PublicKey) -> Option<Permissions>;
}

impl<F> Authenticator for F
where
    F: Fn(&str, &PublicKey) -> Option<Permissions> + Send + Sync + 'static,
{
    fn authenticate(&self, user: &str, key: &PublicKey) -> Option<Permissions> {
        self(user, key)
    }
}

/// The keys of an OpenSSH `authorized_keys` file.
///
/// Any user name is accepted. The identity of a connection is the
/// SHA-256 fingerprint of its key.
#[derive(Debug, Default, Clone)]
pub struct AuthorizedKeys {
    keys: Vec<PublicKey>,
}

impl AuthorizedKeys {
    pub fn new(keys: Vec<PublicKey>) -> Self {
        AuthorizedKeys { keys }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let f = BufReader::new(File::open(path)?);
        let mut keys = Vec::new();
        for (n, line) in f.lines().enumerate() {
            if let Some(key) = parse_line(&line?, n + 1)? {
                keys.push(key);
            }
        }
        debug!("loaded {} authorized keys", keys.len());
        Ok(AuthorizedKeys { keys })
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut keys = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if let Some(key) = parse_line(line, n + 1)? {
                keys.push(key);
            }
        }
        Ok(AuthorizedKeys { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.iter().any(|k| k.key_data() == key.key_data())
    }
}

impl Authenticator for AuthorizedKeys {
    fn authenticate(&self, _user: &str, key: &PublicKey) -> Option<Permissions> {
        if !self.contains(key) {
            return None;
        }
        Some(Permissions::with_key_id(
            key.fingerprint(HashAlg::Sha256).to_string(),
        ))
    }
}

// `[options] keytype base64 [comment]`
fn parse_line(line: &str, n: usize) -> Result<Option<PublicKey>, Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut fields = line.split_whitespace();
    while let Some(field) = fields.next() {
        if is_key_type(field) {
            let key = fields
                .next()
                .ok_or(Error::AuthorizedKeys { line: n })?;
            return russh::keys::parse_public_key_base64(key)
                .map(Some)
                .map_err(|_| Error::AuthorizedKeys { line: n });
        }
    }
    Err(Error::AuthorizedKeys { line: n })
}

fn is_key_type(field: &str) -> bool {
    field.starts_with("ssh-") || field.starts_with("ecdsa-") || field.starts_with("sk-")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::io::Write;

    use russh::keys::ssh_key::{Algorithm, PrivateKey};

    use super::*;

    fn random_key() -> PublicKey {
        PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[test]
    fn accepts_listed_keys_with_fingerprint_identity() {
        let alice = random_key();
        let mallory = random_key();
        let keys = AuthorizedKeys::parse(&format!(
            "# team\n\n{}\n",
            alice.to_openssh().unwrap()
        ))
        .unwrap();
        assert_eq!(keys.len(), 1);

        let permissions = keys.authenticate("git", &alice).unwrap();
        assert_eq!(
            permissions.key_id(),
            Some(alice.fingerprint(HashAlg::Sha256).to_string().as_str())
        );
        assert!(permissions.key_id().unwrap().starts_with("SHA256:"));
        assert_eq!(keys.authenticate("git", &mallory), None);
    }

    #[test]
    fn tolerates_options_and_comments() {
        let key = random_key();
        let line = format!(
            "no-pty,command=\"/bin/false\" {} alice@example.com",
            key.to_openssh().unwrap()
        );
        let keys = AuthorizedKeys::parse(&line).unwrap();
        assert!(keys.contains(&key));
    }

    #[test]
    fn reports_the_broken_line() {
        let key = random_key();
        let text = format!("{}\nssh-ed25519 not-base64!\n", key.to_openssh().unwrap());
        match AuthorizedKeys::parse(&text) {
            Err(Error::AuthorizedKeys { line }) => assert_eq!(line, 2),
            r => panic!("unexpected result {r:?}"),
        }
    }

    #[test]
    fn loads_from_file() {
        let key = random_key();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, "{}", key.to_openssh().unwrap()).unwrap();
        }
        let keys = AuthorizedKeys::load(&path).unwrap();
        assert!(keys.authenticate("anyone", &key).is_some());
    }

    #[test]
    fn closures_authenticate() {
        let auth = |user: &str, _: &PublicKey| {
            (user == "git").then(|| Permissions::with_key_id("fixed"))
        };
        let key = random_key();
        assert_eq!(
            auth.authenticate("git", &key).unwrap().key_id(),
            Some("fixed")
        );
        assert!(auth.authenticate("root", &key).is_none());
    }
}
