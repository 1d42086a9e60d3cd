#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]
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

//! An SSH gateway that turns `exec` requests into local commands.
//!
//! The transport, key exchange and signature checks are left to
//! [russh]. Once a client is authenticated, this crate owns every
//! channel it opens:
//!
//! * [`connection::serve`] accepts `session` channels and rejects
//!   everything else;
//! * a [`channel::ChannelSession`] consumes the requests of one channel,
//!   applying `env` requests ([`env::Environment`]) until an `exec`
//!   request arrives;
//! * the [`router::Router`] maps the command line of that `exec` to a
//!   handler registered at startup, which builds the subprocess;
//! * [`bridge::run`] starts the subprocess and relays its standard
//!   streams and exit status over the channel.
//!
//! [`server::Server`] ties this to a TCP listener and the russh
//! session loop.
//!
//! ```no_run
//! use sshooks::router::Registry;
//! use sshooks::server::{AuthorizedKeys, Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sshooks::Error> {
//!     let mut registry = Registry::new();
//!     registry.register("git-upload-pack", sshooks::handlers::git_service("/srv/git"));
//!     let keys = AuthorizedKeys::load("/srv/git/authorized_keys")?;
//!     Server::new(Config::default(), registry, keys).listen().await
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

pub mod bridge;
pub mod channel;
pub mod connection;
pub mod env;
pub mod handlers;
pub mod router;
pub mod server;

/// Error type returned by handlers registered in the
/// [`Registry`](router::Registry).
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    /// An `env` request did not carry exactly one name/value pair.
    #[error("Invalid env arguments: {0:?}")]
    InvalidEnvArguments(String),

    /// The command handler refused the request.
    #[error("Command handler failed: {0}")]
    Handler(#[source] HandlerError),

    /// The subprocess could not be started.
    #[error("Could not start command: {0}")]
    Spawn(#[source] std::io::Error),

    /// A standard stream of the subprocess was not piped.
    #[error("Missing {0} pipe")]
    MissingPipe(&'static str),

    /// Waiting for the subprocess failed.
    #[error("Could not wait for command: {0}")]
    Wait(#[source] std::io::Error),

    /// The channel was closed by the other side.
    #[error("Channel closed")]
    ChannelClosed,

    /// The client sent more input than the command consumed.
    #[error("Channel input backlog exceeded {0} bytes")]
    InputOverflow(usize),

    /// The command ran longer than allowed.
    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// `ssh-keygen` exited unsuccessfully.
    #[error("Failed to generate private key: {0}")]
    KeyGeneration(String),

    /// A line of an `authorized_keys` file could not be parsed.
    #[error("Invalid authorized key on line {line}")]
    AuthorizedKeys { line: usize },

    #[error(transparent)]
    Keys(#[from] russh::keys::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}
