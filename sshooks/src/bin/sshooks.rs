use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::info;
use sshooks::handlers::{forward, git_service, GIT_SERVICES};
use sshooks::router::Registry;
use sshooks::server::{AuthorizedKeys, Config, KeygenConfig, Server};

#[tokio::main]
async fn main() -> Result<(), sshooks::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let keys = AuthorizedKeys::load(&cli.authorized_keys)?;
    info!(
        "{} authorized keys in {}",
        keys.len(),
        cli.authorized_keys.display()
    );

    let mut registry = Registry::new();
    for service in GIT_SERVICES {
        if let Some(root) = &cli.repositories {
            registry.register(service, git_service(root));
        } else if let Some(program) = &cli.forward {
            registry.register(service, forward(program));
        }
    }

    let config = Config {
        host: cli.host,
        port: cli.port,
        private_key_path: cli.key,
        keygen: KeygenConfig {
            key_type: cli.key_type,
            passphrase: String::new(),
        },
        keyword: cli.keyword,
        command_timeout: cli.command_timeout.map(Duration::from_secs),
        ..Config::default()
    };
    Server::new(config, registry, keys).listen().await
}

/// Serve git repositories, or hand git commands to another program,
/// over SSH.
#[derive(clap::Parser)]
#[clap(group(
    clap::ArgGroup::new("handler")
        .required(true)
        .args(&["repositories", "forward"]),
))]
pub struct Cli {
    #[clap(long, default_value = "localhost")]
    host: String,

    #[clap(long, short, default_value_t = 1337)]
    port: u16,

    /// Host key, generated if missing.
    #[clap(long, short = 'k', default_value = "key.rsa")]
    key: PathBuf,

    /// Type of a generated host key.
    #[clap(long, default_value = "rsa")]
    key_type: String,

    #[clap(long, short = 'a')]
    authorized_keys: PathBuf,

    /// Serve the git repositories under this directory.
    #[clap(long, short = 'r')]
    repositories: Option<PathBuf>,

    /// Run `<PROGRAM> serv key-<fingerprint>` for every git command.
    #[clap(long)]
    forward: Option<PathBuf>,

    /// Text before this keyword in a command is dropped.
    #[clap(long, default_value = sshooks::router::DEFAULT_KEYWORD)]
    keyword: String,

    /// Kill commands running longer than this many seconds.
    #[clap(long)]
    command_timeout: Option<u64>,
}
