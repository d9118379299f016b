//! npc: tunnel client that runs as a managed OS service.
//! Lifecycle verbs go to the host's service manager, utility commands run once,
//! and a plain invocation becomes the long-running supervised client.

mod host;
mod install;
mod logger;
mod net;
mod socks;
mod stun;
mod tunnel_file;
mod update;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use npc_core::client::{ClientOptions, TunnelClient};
use npc_core::config::{Flags, RuntimeConfig, default_config_path, normalize_args};
use npc_core::platform::{ProcessRunner, ServicePaths};
use npc_core::service::{self, ServiceAdapter, ServiceDescriptor, Verb};
use npc_core::supervisor::Supervisor;

use crate::host::{HostPaths, HostRunner};
use crate::net::NetClient;

#[derive(Parser, Debug)]
#[command(name = "npc", about = "nps tunnel client", disable_version_flag = true)]
struct Cli {
    #[command(flatten)]
    flags: Flags,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Register npc as a system service and start it
    Install,
    /// Remove the system service
    Uninstall,
    /// Start the installed service
    Start,
    /// Stop the installed service
    Stop,
    /// Restart the installed service
    Restart,
    /// Print the state of the tunnels in the tunnel file
    Status,
    /// Register this host's public address with the server
    Register,
    /// Replace this binary with the latest release
    Update,
    /// Detect the NAT type with a STUN server
    Nat,
}

impl Command {
    fn verb(self) -> Option<Verb> {
        match self {
            Command::Install => Some(Verb::Install),
            Command::Uninstall => Some(Verb::Uninstall),
            Command::Start => Some(Verb::Start),
            Command::Stop => Some(Verb::Stop),
            Command::Restart => Some(Verb::Restart),
            Command::Status | Command::Register | Command::Update | Command::Nat => None,
        }
    }
}

fn main() -> Result<()> {
    let raw_args: Vec<String> = std::env::args().collect();
    let cli = Cli::parse_from(normalize_args(raw_args.iter().cloned()));

    if cli.flags.version {
        println!("Version: {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = RuntimeConfig::from_flags(&cli.flags);
    if let Some(path) = logger::init_logger(&config.log) {
        info!("logging to {}", path.display());
    }
    info!("logger: {}", config.log.descriptor());
    info!("npc version {}", env!("CARGO_PKG_VERSION"));

    let client = Arc::new(NetClient::new());
    let paths: Arc<dyn ServicePaths> = Arc::new(HostPaths);
    let runner: Arc<dyn ProcessRunner> = Arc::new(HostRunner);
    let service_args = raw_args.get(1..).unwrap_or_default();

    match cli.command {
        Some(command) => match command.verb() {
            Some(verb) => {
                let current =
                    std::env::current_exe().context("locating the running executable")?;
                let descriptor = ServiceDescriptor::for_client(current.clone(), service_args);
                match service::detect(descriptor, paths.clone(), runner.clone()) {
                    Ok(manager) if verb == Verb::Install => {
                        // Copy once the old service is stopped and its binary released.
                        ServiceAdapter::new(manager).install_with(|| {
                            let executable =
                                install::install_binary(&current, &install::binary_targets());
                            let descriptor =
                                ServiceDescriptor::for_client(executable, service_args);
                            service::detect(descriptor, paths, runner).ok()
                        })
                    }
                    Ok(manager) => ServiceAdapter::new(manager).control(verb),
                    Err(err) => error!("Valid actions: {:?}\n{}", Verb::NAMES, err),
                }
            }
            None => run_utility(command, &config, client.as_ref()),
        },
        None => {
            let executable = std::env::current_exe().context("locating the running executable")?;
            let descriptor = ServiceDescriptor::for_client(executable, service_args);
            let program = Box::new(Supervisor::new(Arc::new(config), client));
            match service::detect(descriptor, paths, runner) {
                Ok(manager) => {
                    let adapter = ServiceAdapter::new(manager);
                    info!("running under {}", adapter.platform());
                    if let Err(err) = adapter.run(program) {
                        error!("service run failed: {}", err);
                    }
                }
                Err(err) => {
                    warn!("{}, running in the foreground", err);
                    let mut program = program;
                    service::run_foreground(program.as_mut());
                }
            }
        }
    }
    Ok(())
}

/// One-shot commands. Failures are logged; the process still exits normally.
fn run_utility(command: Command, config: &RuntimeConfig, client: &dyn TunnelClient) {
    match command {
        Command::Status => {
            let path = config.config_path.clone().unwrap_or_else(default_config_path);
            if let Err(err) = client.query_status(&path) {
                error!("status query failed: {}", err);
            }
        }
        Command::Register => {
            let options = ClientOptions::from_config(config);
            if let Err(err) = client.register_endpoint(&options, config.register_hours) {
                error!("ip registration failed: {}", err);
            }
        }
        Command::Update => {
            let feed = std::env::var(update::ENV_UPDATE_FEED)
                .unwrap_or_else(|_| update::DEFAULT_FEED.to_string());
            if let Err(err) = update::run_update(&feed) {
                error!("update failed: {:#}", err);
            }
        }
        Command::Nat => match client.discover_nat(&config.stun_addr) {
            Ok(report) => {
                println!("nat type: {}", report.kind);
                println!("public address: {}", report.public_endpoint);
            }
            Err(err) => error!("nat discovery failed: {}", err),
        },
        Command::Install
        | Command::Uninstall
        | Command::Start
        | Command::Stop
        | Command::Restart => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npc_core::config::TransportKind;

    fn parse(args: &[&str]) -> Cli {
        let argv = std::iter::once("npc").chain(args.iter().copied());
        Cli::try_parse_from(normalize_args(argv)).unwrap()
    }

    #[test]
    fn go_style_flags_and_verbs_parse() {
        let cli = parse(&["-server=1.2.3.4:8024", "-vkey=abc123", "install"]);
        assert_eq!(cli.command, Some(Command::Install));
        assert_eq!(cli.flags.server, "1.2.3.4:8024");
        assert_eq!(cli.flags.vkey, "abc123");
    }

    #[test]
    fn flags_after_the_verb_are_accepted() {
        let cli = parse(&["status", "-config=/etc/npc.toml", "-type=kcp"]);
        assert_eq!(cli.command, Some(Command::Status));
        assert_eq!(cli.flags.config, "/etc/npc.toml");
        assert_eq!(cli.flags.transport, TransportKind::Kcp);
    }

    #[test]
    fn plain_invocation_has_no_command() {
        let cli = parse(&["-password=p2p-secret", "-target=10.0.0.5:80"]);
        assert!(cli.command.is_none());
        assert!(cli.flags.debug);
    }

    #[test]
    fn debug_false_is_parsed() {
        assert!(!parse(&["-debug=false"]).flags.debug);
        assert!(parse(&["-debug"]).flags.debug);
    }

    #[test]
    fn only_lifecycle_commands_map_to_verbs() {
        assert_eq!(Command::Restart.verb(), Some(Verb::Restart));
        assert_eq!(Command::Nat.verb(), None);
        assert_eq!(Command::Update.verb(), None);
    }

    #[test]
    fn version_flag_is_ours() {
        assert!(parse(&["-version"]).flags.version);
    }
}
