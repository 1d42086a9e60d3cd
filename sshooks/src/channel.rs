//! One accepted `session` channel.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::connection::ConnectionContext;
use crate::env::Environment;
use crate::router::Route;
use crate::{bridge, Error};

/// Extended data type code for standard error.
pub const EXTENDED_DATA_STDERR: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    Env,
    Exec,
    Other(String),
}

impl From<&str> for RequestKind {
    fn from(name: &str) -> Self {
        match name {
            "env" => RequestKind::Env,
            "exec" => RequestKind::Exec,
            other => RequestKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub kind: RequestKind,
    pub want_reply: bool,
    pub payload: Bytes,
}

/// Messages received on a channel, in arrival order.
///
/// The end of the stream means the channel was closed by the client or
/// the connection went away.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Request(ChannelRequest),
    Data(Bytes),
    Eof,
}

/// The outgoing half of a channel.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Answer the last request.
    async fn reply(&self, success: bool) -> Result<(), Error>;
    async fn data(&self, data: Bytes) -> Result<(), Error>;
    async fn extended_data(&self, code: u32, data: Bytes) -> Result<(), Error>;
    async fn exit_status(&self, status: u32) -> Result<(), Error>;
    async fn eof(&self) -> Result<(), Error>;
    async fn close(&self) -> Result<(), Error>;
}

/// Processes the requests of one channel: any number of `env`, then a
/// single `exec`.
pub struct ChannelSession {
    context: ConnectionContext,
    label: String,
    sink: Arc<dyn ChannelSink>,
    events: UnboundedReceiver<ChannelEvent>,
    env: Environment,
}

impl ChannelSession {
    pub fn new(
        context: ConnectionContext,
        label: impl Into<String>,
        sink: Arc<dyn ChannelSink>,
        events: UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        ChannelSession {
            context,
            label: label.into(),
            sink,
            events,
            env: Environment::new(),
        }
    }

    /// Run until the command finished or the channel went away, then
    /// close the channel.
    pub async fn run(self) {
        let sink = self.sink.clone();
        let label = self.label.clone();
        debug!("{}: waiting for requests", label);
        if let Err(e) = self.serve().await {
            match e {
                Error::ChannelClosed => info!("{}: {}", label, e),
                e => error!("{}: {}", label, e),
            }
        }
        if let Err(e) = sink.close().await {
            debug!("{}: close: {}", label, e);
        }
    }

    async fn serve(mut self) -> Result<(), Error> {
        while let Some(event) = self.events.recv().await {
            let request = match event {
                ChannelEvent::Request(request) => request,
                ChannelEvent::Data(data) => {
                    debug!("{}: dropping {} bytes before exec", self.label, data.len());
                    continue;
                }
                ChannelEvent::Eof => continue,
            };
            debug!("{}: request {:?}", self.label, request.kind);
            match request.kind {
                RequestKind::Env => {
                    if let Err(e) = self.env.apply(&request.payload) {
                        warn!("{}: {}", self.label, e);
                        if request.want_reply {
                            self.sink.reply(false).await?;
                        }
                        return Err(e);
                    }
                    if request.want_reply {
                        self.sink.reply(true).await?;
                    }
                }
                RequestKind::Exec => return self.exec(&request.payload).await,
                RequestKind::Other(ref name) => {
                    debug!("{}: ignoring {} request", self.label, name);
                    if request.want_reply {
                        self.sink.reply(false).await?;
                    }
                }
            }
        }
        debug!("{}: closed before exec", self.label);
        Ok(())
    }

    async fn exec(self, payload: &[u8]) -> Result<(), Error> {
        let payload = String::from_utf8_lossy(payload);
        debug!("{}: payload {:?}", self.label, payload);
        let route = match self.context.router().route(self.context.identity(), &payload) {
            Ok(route) => route,
            Err(e) => {
                self.sink.reply(false).await?;
                return Err(e);
            }
        };
        let mut command = match route {
            Route::Spawn(command) => command,
            Route::NoOp(noop) => {
                info!("{}: nothing to run ({:?})", self.label, noop);
                self.sink.reply(true).await?;
                self.sink.eof().await?;
                return self.sink.exit_status(noop.exit_status()).await;
            }
        };
        command.envs(self.env.iter());
        let timeout = self.context.command_timeout();
        match bridge::run(command, &*self.sink, self.events, timeout).await {
            Ok(status) => {
                info!("{}: command exited with status {}", self.label, status);
                Ok(())
            }
            Err(e @ (Error::Spawn(_) | Error::MissingPipe(_))) => {
                self.sink.reply(false).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
