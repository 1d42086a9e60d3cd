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

//! Glue between the russh session loop and the channel handling of
//! this crate.
//!
//! russh reports everything through callbacks of a single
//! [`Handler`](russh::server::Handler) per connection. These callbacks
//! only enqueue: channel offers go to the task running
//! [`connection::serve`], channel messages to the queue of their
//! channel. Nothing here waits for a command.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use russh::keys::ssh_key::PublicKey;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::auth::{Authenticator, Permissions};
use crate::channel::{ChannelEvent, ChannelRequest, ChannelSink, RequestKind};
use crate::connection::{self, ConnectionContext, Gateway, NewChannel, OpenDecision};
use crate::{env, Error};

/// The outgoing half of a russh channel.
pub struct RusshChannel {
    handle: Handle,
    id: ChannelId,
}

impl RusshChannel {
    pub fn new(handle: Handle, id: ChannelId) -> Self {
        RusshChannel { handle, id }
    }
}

#[async_trait]
impl ChannelSink for RusshChannel {
    async fn reply(&self, success: bool) -> Result<(), Error> {
        let sent = if success {
            self.handle.channel_success(self.id).await
        } else {
            self.handle.channel_failure(self.id).await
        };
        sent.map_err(|()| Error::ChannelClosed)
    }

    async fn data(&self, data: Bytes) -> Result<(), Error> {
        self.handle
            .data(self.id, CryptoVec::from_slice(&data))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    async fn extended_data(&self, code: u32, data: Bytes) -> Result<(), Error> {
        self.handle
            .extended_data(self.id, code, CryptoVec::from_slice(&data))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    async fn exit_status(&self, status: u32) -> Result<(), Error> {
        self.handle
            .exit_status_request(self.id, status)
            .await
            .map_err(|()| Error::ChannelClosed)
    }

    async fn eof(&self) -> Result<(), Error> {
        self.handle
            .eof(self.id)
            .await
            .map_err(|()| Error::ChannelClosed)
    }

    async fn close(&self) -> Result<(), Error> {
        self.handle
            .close(self.id)
            .await
            .map_err(|()| Error::ChannelClosed)
    }
}

/// The russh handler of one TCP connection.
pub(crate) struct ConnectionHandler {
    id: usize,
    peer: Option<SocketAddr>,
    gateway: Arc<Gateway>,
    authenticator: Arc<dyn Authenticator>,
    permissions: Option<Permissions>,
    offers: Option<mpsc::UnboundedSender<NewChannel>>,
    // Unbounded since a callback must never wait for a command. The
    // stdin relay drains each queue eagerly and caps what the process
    // has not read at `bridge::MAX_PENDING_INPUT`.
    channels: HashMap<ChannelId, mpsc::UnboundedSender<ChannelEvent>>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        id: usize,
        peer: Option<SocketAddr>,
        gateway: Arc<Gateway>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        ConnectionHandler {
            id,
            peer,
            gateway,
            authenticator,
            permissions: None,
            offers: None,
            channels: HashMap::new(),
        }
    }

    /// The queue of channel offers, starting the multiplexer on first
    /// use.
    fn offers(&mut self) -> mpsc::UnboundedSender<NewChannel> {
        if let Some(offers) = &self.offers {
            return offers.clone();
        }
        let identity = match self.permissions.as_ref().and_then(Permissions::key_id) {
            Some(key_id) => key_id.to_string(),
            None => {
                warn!("connection {}: no key id, identity is empty", self.id);
                String::new()
            }
        };
        let context = ConnectionContext::new(self.id, identity, self.gateway.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(connection::serve(context, UnboundedReceiverStream::new(rx)));
        self.offers = Some(tx.clone());
        tx
    }

    async fn offer(
        &mut self,
        kind: &str,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<bool, Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(RusshChannel::new(session.handle(), channel));
        let (offer, decision) = NewChannel::new(kind, u32::from(channel), sink, rx);
        if self.offers().send(offer).is_err() {
            warn!("connection {}: channel multiplexer is gone", self.id);
            return Ok(false);
        }
        match decision.await {
            Ok(OpenDecision::Accept) => {
                self.channels.insert(channel, tx);
                Ok(true)
            }
            Ok(OpenDecision::Reject(reason, message)) => {
                debug!(
                    "connection {}: rejected {} channel: {:?} {}",
                    self.id, kind, reason, message
                );
                Ok(false)
            }
            Err(_) => Ok(false),
        }
    }

    fn push(&mut self, channel: ChannelId, event: ChannelEvent) {
        let delivered = match self.channels.get(&channel) {
            Some(events) => events.send(event).is_ok(),
            None => false,
        };
        if !delivered {
            debug!("connection {}: no receiver for channel {}", self.id, channel);
            self.channels.remove(&channel);
        }
    }

    fn request(
        &mut self,
        channel: ChannelId,
        kind: RequestKind,
        want_reply: bool,
        payload: Bytes,
    ) {
        self.push(
            channel,
            ChannelEvent::Request(ChannelRequest {
                kind,
                want_reply,
                payload,
            }),
        )
    }

    /// russh keeps a single pending reply flag per channel, so every
    /// request that can be answered without running anything is
    /// answered here, before the next request overwrites the flag.
    fn refuse(&mut self, channel: ChannelId, name: &str, session: &mut Session) {
        let _ = session.channel_failure(channel);
        self.request(channel, RequestKind::Other(name.to_string()), false, Bytes::new())
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        match self.authenticator.authenticate(user, key) {
            Some(permissions) => {
                debug!("connection {}: accepted key for {}", self.id, user);
                self.permissions = Some(permissions);
                Ok(Auth::Accept)
            }
            None => {
                info!(
                    "connection {}: rejected {} key for {} from {:?}",
                    self.id,
                    key.algorithm(),
                    user,
                    self.peer
                );
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        info!("connection {}: authenticated from {:?}", self.id, self.peer);
        self.offers();
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.offer(connection::SESSION_CHANNEL, channel.id(), session)
            .await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.offer("direct-tcpip", channel.id(), session).await
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.offer("forwarded-tcpip", channel.id(), session).await
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("connection {}: channel {} closed by client", self.id, channel);
        self.channels.remove(&channel);
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.push(channel, ChannelEvent::Eof);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.push(channel, ChannelEvent::Data(Bytes::copy_from_slice(data)));
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let checked = env::encode(variable_name, variable_value)
            .and_then(|payload| env::parse(&payload).map(|_| payload));
        match checked {
            Ok(payload) => {
                let _ = session.channel_success(channel);
                self.request(channel, RequestKind::Env, false, payload);
            }
            Err(e) => {
                warn!("connection {}: channel {}: {}", self.id, channel, e);
                let _ = session.channel_failure(channel);
                // Ends the event stream, which closes the channel.
                self.channels.remove(&channel);
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.request(
            channel,
            RequestKind::Exec,
            true,
            Bytes::copy_from_slice(data),
        );
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, "shell", session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("connection {}: subsystem {}", self.id, name);
        self.refuse(channel, "subsystem", session);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, "pty-req", session);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, "x11-req", session);
        Ok(())
    }
}
