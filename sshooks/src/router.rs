//! Mapping of `exec` command lines to local commands.
//!
//! A [`Registry`] is filled once, before the server starts, and then
//! moved into a [`Router`] which is only ever read.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use tokio::process::Command;

use crate::{Error, HandlerError};

/// Keyword marking the start of the command in an `exec` payload.
pub const DEFAULT_KEYWORD: &str = "git";

/// Builds the subprocess for one executable name.
///
/// Handlers get the identity of the connection, the cleaned command
/// line and the argument remainder. They return a command that has not
/// been started yet, `None` to decline the request without running
/// anything, or an error.
pub trait CommandHandler: Send + Sync {
    fn command(
        &self,
        identity: &str,
        command: &str,
        args: &str,
    ) -> Result<Option<Command>, HandlerError>;
}

impl<F> CommandHandler for F
where
    F: Fn(&str, &str, &str) -> Result<Option<Command>, HandlerError> + Send + Sync,
{
    fn command(
        &self,
        identity: &str,
        command: &str,
        args: &str,
    ) -> Result<Option<Command>, HandlerError> {
        self(identity, command, args)
    }
}

/// Pin the signature of a closure so it can be registered as a handler.
pub fn handler_fn<F>(f: F) -> F
where
    F: Fn(&str, &str, &str) -> Result<Option<Command>, HandlerError> + Send + Sync,
{
    f
}

#[derive(Default, Clone)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `executable`, replacing any previous one.
    pub fn register<H: CommandHandler + 'static>(
        &mut self,
        executable: impl Into<String>,
        handler: H,
    ) -> &mut Self {
        self.handlers.insert(executable.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, executable: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.get(executable)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// A parsed `exec` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// The payload without framing artifacts and wrapper prefix.
    pub command: String,
    pub executable: String,
    pub args: String,
}

impl CommandLine {
    /// Parse an `exec` payload, dropping whatever precedes `keyword`.
    ///
    /// Returns `None` when the command has no argument part.
    pub fn parse(payload: &str, keyword: &str) -> Option<Self> {
        let command = clean(payload, keyword);
        let (executable, args) = command.split_once(char::is_whitespace)?;
        let args = match args.strip_prefix("'/") {
            Some(rest) => format!("'{rest}"),
            None => args.to_string(),
        };
        Some(CommandLine {
            executable: executable.to_string(),
            args,
            command: command.to_string(),
        })
    }
}

fn clean<'a>(payload: &'a str, keyword: &str) -> &'a str {
    let payload =
        payload.trim_start_matches(|c: char| c.is_control() || matches!(c, '\'' | '(' | ')'));
    if keyword.is_empty() {
        return payload;
    }
    match payload.find(keyword) {
        Some(i) => payload.get(i..).unwrap_or(payload),
        None => payload,
    }
}

/// Why an `exec` request does not run anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoOp {
    /// The payload had no argument part.
    EmptyCommand,
    /// No handler is registered for the executable.
    Unhandled(String),
    /// The handler returned no command.
    Declined(String),
}

impl NoOp {
    /// Exit status reported to the client.
    pub fn exit_status(&self) -> u32 {
        match self {
            NoOp::EmptyCommand | NoOp::Unhandled(_) => 127,
            NoOp::Declined(_) => 1,
        }
    }
}

#[derive(Debug)]
pub enum Route {
    Spawn(Command),
    NoOp(NoOp),
}

#[derive(Debug)]
pub struct Router {
    registry: Registry,
    keyword: String,
}

impl Router {
    pub fn new(registry: Registry) -> Self {
        Self::with_keyword(registry, DEFAULT_KEYWORD)
    }

    pub fn with_keyword(registry: Registry, keyword: impl Into<String>) -> Self {
        Router {
            registry,
            keyword: keyword.into(),
        }
    }

    pub fn keyword(&self) -> &str {
        &self.keyword
    }

    /// Route the `exec` payload sent by `identity`.
    pub fn route(&self, identity: &str, payload: &str) -> Result<Route, Error> {
        let Some(line) = CommandLine::parse(payload, &self.keyword) else {
            debug!("empty command in payload {:?}", payload);
            return Ok(Route::NoOp(NoOp::EmptyCommand));
        };
        debug!("cleaned payload: {:?}", line.command);
        let Some(handler) = self.registry.get(&line.executable) else {
            info!(
                "no handler for command: {}, args: {:?}",
                line.executable, line.args
            );
            return Ok(Route::NoOp(NoOp::Unhandled(line.executable)));
        };
        match handler
            .command(identity, &line.command, &line.args)
            .map_err(Error::Handler)?
        {
            Some(command) => Ok(Route::Spawn(command)),
            None => {
                info!("handler declined command: {}", line.executable);
                Ok(Route::NoOp(NoOp::Declined(line.executable)))
            }
        }
    }
}
