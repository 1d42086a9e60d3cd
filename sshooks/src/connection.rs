//! Channels of one authenticated connection.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};

use crate::channel::{ChannelEvent, ChannelSession, ChannelSink};
use crate::router::Router;

/// The only channel type the gateway accepts.
pub const SESSION_CHANNEL: &str = "session";

/// State shared, read-only, by every connection.
#[derive(Debug)]
pub struct Gateway {
    router: Router,
    command_timeout: Option<Duration>,
}

impl Gateway {
    pub fn new(router: Router) -> Self {
        Gateway {
            router,
            command_timeout: None,
        }
    }

    /// Kill commands running longer than `timeout`.
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout
    }
}

/// What every channel of a connection knows about it.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    id: usize,
    identity: Arc<str>,
    gateway: Arc<Gateway>,
}

impl ConnectionContext {
    pub fn new(id: usize, identity: impl Into<Arc<str>>, gateway: Arc<Gateway>) -> Self {
        ConnectionContext {
            id,
            identity: identity.into(),
            gateway,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// The `key-id` the client authenticated with.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn router(&self) -> &Router {
        self.gateway.router()
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.gateway.command_timeout()
    }
}

/// Reason given to the client when a channel is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
}

/// Answer to a [`NewChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    Accept,
    Reject(RejectReason, String),
}

/// A channel the client asked to open, waiting for a decision.
pub struct NewChannel {
    kind: String,
    channel: u32,
    sink: Arc<dyn ChannelSink>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    decision: oneshot::Sender<OpenDecision>,
}

impl NewChannel {
    /// Returns the offer and the receiving end of the decision. A
    /// dropped offer reads as a closed decision channel.
    pub fn new(
        kind: impl Into<String>,
        channel: u32,
        sink: Arc<dyn ChannelSink>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> (Self, oneshot::Receiver<OpenDecision>) {
        let (decision, answer) = oneshot::channel();
        (
            NewChannel {
                kind: kind.into(),
                channel,
                sink,
                events,
                decision,
            },
            answer,
        )
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn accept(
        self,
    ) -> (
        Arc<dyn ChannelSink>,
        mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let _ = self.decision.send(OpenDecision::Accept);
        (self.sink, self.events)
    }

    pub fn reject(self, reason: RejectReason, message: &str) {
        let _ = self
            .decision
            .send(OpenDecision::Reject(reason, message.to_string()));
    }
}

/// Accept the `session` channels of one connection until `channels`
/// ends. Each accepted channel runs in its own task.
pub async fn serve<S>(context: ConnectionContext, channels: S)
where
    S: Stream<Item = NewChannel>,
{
    futures::pin_mut!(channels);
    info!(
        "connection {}: serving channels for {:?}",
        context.id(),
        context.identity()
    );
    while let Some(new_channel) = channels.next().await {
        if new_channel.kind() != SESSION_CHANNEL {
            warn!(
                "connection {}: ignore channel type: {}",
                context.id(),
                new_channel.kind()
            );
            new_channel.reject(RejectReason::UnknownChannelType, "unknown channel type");
            continue;
        }
        let label = format!("connection {} channel {}", context.id(), new_channel.channel());
        debug!("{}: accepted", label);
        let (sink, events) = new_channel.accept();
        let session = ChannelSession::new(context.clone(), label, sink, events);
        tokio::spawn(session.run());
    }
    debug!("connection {}: no more channels", context.id());
}
