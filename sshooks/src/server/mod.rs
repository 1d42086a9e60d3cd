// Copyright 2024 The sshooks Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Running the gateway
//!
//! A [`Server`] owns the command [`Registry`], an [`Authenticator`] and
//! the host key. It can bind the configured address itself
//! ([`Server::listen`]) or serve connections from a listener built by
//! the caller ([`Server::serve`]):
//!
//! ```no_run
//! use sshooks::router::{handler_fn, Registry};
//! use sshooks::server::{Config, Permissions, Server};
//! use russh::keys::ssh_key::PublicKey;
//! use tokio::process::Command;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sshooks::Error> {
//!     let mut registry = Registry::new();
//!     registry.register(
//!         "whoami",
//!         handler_fn(|identity, _, _| {
//!             let mut command = Command::new("echo");
//!             command.arg(identity);
//!             Ok(Some(command))
//!         }),
//!     );
//!     let auth = |_: &str, key: &PublicKey| Some(Permissions::with_key_id(key.algorithm().as_str()));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:2222").await?;
//!     Server::new(Config::default(), registry, auth)
//!         .serve(listener)
//!         .await
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use russh::keys::PrivateKey;
use russh::{MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};

use crate::connection::Gateway;
use crate::router::{Registry, Router, DEFAULT_KEYWORD};
use crate::Error;

mod auth;
mod keys;
mod session;

pub use self::auth::{Authenticator, AuthorizedKeys, Permissions, KEY_ID};
pub use self::keys::{provision, KeygenConfig};
pub use self::session::RusshChannel;
use self::session::ConnectionHandler;

/// Configuration of a [`Server`].
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Host key, generated on startup if missing.
    pub private_key_path: PathBuf,
    pub keygen: KeygenConfig,
    /// See [`Router::with_keyword`].
    pub keyword: String,
    /// Commands running longer than this are killed.
    pub command_timeout: Option<Duration>,
    /// Connections without traffic for this long are closed.
    pub inactivity_timeout: Option<Duration>,
    pub auth_rejection_time: Duration,
    pub max_auth_attempts: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host: "localhost".to_string(),
            port: 1337,
            private_key_path: PathBuf::from("key.rsa"),
            keygen: KeygenConfig::default(),
            keyword: DEFAULT_KEYWORD.to_string(),
            command_timeout: None,
            inactivity_timeout: Some(Duration::from_secs(600)),
            auth_rejection_time: Duration::from_secs(1),
            max_auth_attempts: 10,
        }
    }
}

pub struct Server {
    config: Config,
    gateway: Arc<Gateway>,
    authenticator: Arc<dyn Authenticator>,
    host_key: Option<PrivateKey>,
}

impl Server {
    pub fn new<A: Authenticator>(config: Config, registry: Registry, authenticator: A) -> Self {
        let router = Router::with_keyword(registry, config.keyword.clone());
        let gateway = Gateway::new(router).with_command_timeout(config.command_timeout);
        Server {
            config,
            gateway: Arc::new(gateway),
            authenticator: Arc::new(authenticator),
            host_key: None,
        }
    }

    /// Use `key` instead of the key file of the configuration.
    pub fn with_host_key(mut self, key: PrivateKey) -> Self {
        self.host_key = Some(key);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the configured address and serve it.
    pub async fn listen(self) -> Result<(), Error> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        info!("listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener`. Only returns if the
    /// host key cannot be loaded.
    pub async fn serve(self, listener: TcpListener) -> Result<(), Error> {
        let config = Arc::new(self.russh_config().await?);
        let mut id = 0;
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept: {}", e);
                    // EMFILE and friends do not go away immediately.
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            id += 1;
            debug!("connection {}: accepted from {}", id, peer);
            let handler = ConnectionHandler::new(
                id,
                Some(peer),
                self.gateway.clone(),
                self.authenticator.clone(),
            );
            tokio::spawn(run_connection(id, config.clone(), socket, handler));
        }
    }

    async fn russh_config(&self) -> Result<russh::server::Config, Error> {
        let key = match &self.host_key {
            Some(key) => key.clone(),
            None => provision(&self.config.private_key_path, &self.config.keygen).await?,
        };
        Ok(russh::server::Config {
            keys: vec![key],
            methods: MethodSet::from(&[MethodKind::PublicKey][..]),
            inactivity_timeout: self.config.inactivity_timeout,
            auth_rejection_time: self.config.auth_rejection_time,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            max_auth_attempts: self.config.max_auth_attempts,
            ..Default::default()
        })
    }
}

async fn run_connection(
    id: usize,
    config: Arc<russh::server::Config>,
    socket: TcpStream,
    handler: ConnectionHandler,
) {
    let running = match russh::server::run_stream(config, socket, handler).await {
        Ok(running) => running,
        Err(e) => return report(id, "handshake", &e),
    };
    match running.await {
        Ok(()) => info!("connection {}: closed", id),
        Err(e) => report(id, "session", &e),
    }
}

fn report(id: usize, stage: &str, e: &Error) {
    if is_orderly_disconnect(e) {
        info!("connection {}: {} ended: {}", id, stage, e);
    } else {
        error!("connection {}: {} failed: {}", id, stage, e);
    }
}

/// Whether `e` is the client going away rather than a failure.
pub fn is_orderly_disconnect(e: &Error) -> bool {
    match e {
        Error::Ssh(russh::Error::HUP | russh::Error::Disconnect) => true,
        Error::Ssh(russh::Error::IO(e)) | Error::IO(e) => matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}
