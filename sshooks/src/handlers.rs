//! Ready-made command handlers.

use std::path::{Component, Path, PathBuf};

use log::debug;
use tokio::process::Command;

use crate::router::CommandHandler;
use crate::HandlerError;

/// Executables served by [`git_service`].
pub const GIT_SERVICES: [&str; 3] = ["git-upload-pack", "git-receive-pack", "git-upload-archive"];

/// Environment variable carrying the identity of the client.
pub const KEY_ID_VAR: &str = "SSHOOKS_KEY_ID";

/// Environment variable carrying the command line as sent by the client.
pub const ORIGINAL_COMMAND_VAR: &str = "SSH_ORIGINAL_COMMAND";

/// Runs git's transport commands against the repositories under a root
/// directory.
///
/// The argument is the repository path, relative to the root. Requests
/// for repositories that do not exist are declined.
#[derive(Debug, Clone)]
pub struct GitService {
    root: PathBuf,
}

pub fn git_service(root: impl Into<PathBuf>) -> GitService {
    GitService { root: root.into() }
}

impl CommandHandler for GitService {
    fn command(
        &self,
        identity: &str,
        command: &str,
        args: &str,
    ) -> Result<Option<Command>, HandlerError> {
        let executable = command.split_whitespace().next().unwrap_or_default();
        let path = self.root.join(repository_path(args)?);
        if !path.is_dir() {
            debug!("no repository at {}", path.display());
            return Ok(None);
        }
        let mut cmd = Command::new(executable);
        cmd.arg(&path)
            .env(KEY_ID_VAR, identity)
            .env(ORIGINAL_COMMAND_VAR, command);
        Ok(Some(cmd))
    }
}

/// Hands every command to `<program> serv key-<identity>`, with the
/// command line in `SSH_ORIGINAL_COMMAND`.
#[derive(Debug, Clone)]
pub struct Forward {
    program: PathBuf,
}

pub fn forward(program: impl Into<PathBuf>) -> Forward {
    Forward {
        program: program.into(),
    }
}

impl CommandHandler for Forward {
    fn command(
        &self,
        identity: &str,
        command: &str,
        _args: &str,
    ) -> Result<Option<Command>, HandlerError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("serv")
            .arg(format!("key-{identity}"))
            .env(ORIGINAL_COMMAND_VAR, command);
        Ok(Some(cmd))
    }
}

fn repository_path(args: &str) -> Result<&Path, HandlerError> {
    let arg = args.trim();
    let arg = unquote(arg, '\'').or_else(|| unquote(arg, '"')).unwrap_or(arg);
    let path = Path::new(arg);
    let safe = !arg.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(format!("invalid repository path: {arg:?}").into());
    }
    Ok(path)
}

fn unquote(s: &str, quote: char) -> Option<&str> {
    s.strip_prefix(quote)?.strip_suffix(quote)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::ffi::OsStr;

    use super::*;
    use crate::router::{Registry, Route, Router};

    fn env<'a>(command: &'a Command, name: &str) -> Option<&'a OsStr> {
        command
            .as_std()
            .get_envs()
            .find(|(k, _)| *k == OsStr::new(name))
            .and_then(|(_, v)| v)
    }

    #[test]
    fn serves_existing_repositories() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("org").join("repo.git")).unwrap();

        let mut registry = Registry::new();
        for service in GIT_SERVICES {
            registry.register(service, git_service(root.path()));
        }
        let router = Router::new(registry);
        let Route::Spawn(command) = router
            .route("SHA256:key", "git-upload-pack '/org/repo.git'")
            .unwrap()
        else {
            panic!("expected a command");
        };
        let cmd = command.as_std();
        assert_eq!(cmd.get_program(), "git-upload-pack");
        assert_eq!(
            cmd.get_args().collect::<Vec<_>>(),
            vec![root.path().join("org").join("repo.git").as_os_str()]
        );
        assert_eq!(env(&command, KEY_ID_VAR), Some(OsStr::new("SHA256:key")));
        assert_eq!(
            env(&command, ORIGINAL_COMMAND_VAR),
            Some(OsStr::new("git-upload-pack '/org/repo.git'"))
        );
    }

    #[test]
    fn declines_missing_repositories() {
        let root = tempfile::tempdir().unwrap();
        let handler = git_service(root.path());
        let command = handler
            .command("key", "git-receive-pack 'nope.git'", "'nope.git'")
            .unwrap();
        assert!(command.is_none());
    }

    #[test]
    fn refuses_paths_leaving_the_root() {
        let root = tempfile::tempdir().unwrap();
        let handler = git_service(root.path());
        for args in ["'../secret.git'", "'/etc'", "''", "\"a/../../b\""] {
            assert!(
                handler.command("key", "git-upload-pack x", args).is_err(),
                "accepted {args}"
            );
        }
    }

    #[test]
    fn forwards_to_program() {
        let handler = forward("/usr/bin/gitserv");
        let command = handler
            .command("42", "git-upload-pack 'repo.git'", "'repo.git'")
            .unwrap()
            .unwrap();
        let cmd = command.as_std();
        assert_eq!(cmd.get_program(), "/usr/bin/gitserv");
        assert_eq!(cmd.get_args().collect::<Vec<_>>(), vec!["serv", "key-42"]);
        assert_eq!(
            env(&command, ORIGINAL_COMMAND_VAR),
            Some(OsStr::new("git-upload-pack 'repo.git'"))
        );
    }
}
