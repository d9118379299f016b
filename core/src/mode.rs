//! Run-mode selection and execution.
//! Exactly one mode runs per process: a one-shot peer relay, a continuously
//! reconnecting direct client, or the tunnel-file driven client.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::client::{ClientOptions, PeerRelayConfig, TunnelClient};
use crate::config::{RuntimeConfig, default_config_path};
use crate::supervisor::guard;

/// Fixed pause between direct-client connection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    PeerRelay(PeerRelayConfig),
    DirectClient(ClientOptions),
    FileDriven { config_path: PathBuf },
}

impl RunMode {
    /// First match wins: password, then endpoint + key without a tunnel file,
    /// then the tunnel file (explicit or default).
    pub fn select(config: &RuntimeConfig) -> Self {
        if !config.p2p.password.is_empty() {
            return RunMode::PeerRelay(PeerRelayConfig {
                password: config.p2p.password.clone(),
                target: config.p2p.target.clone(),
                local_type: config.p2p.local_type.clone(),
                local_port: config.p2p.local_port,
                server: ClientOptions::from_config(config),
            });
        }
        if !config.server_addr.is_empty() && !config.vkey.is_empty() && config.config_path.is_none()
        {
            return RunMode::DirectClient(ClientOptions::from_config(config));
        }
        RunMode::FileDriven {
            config_path: config
                .config_path
                .clone()
                .unwrap_or_else(default_config_path),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunMode::PeerRelay(_) => "peer-relay",
            RunMode::DirectClient(_) => "direct-client",
            RunMode::FileDriven { .. } => "file-driven",
        }
    }
}

/// Start the mode on its own thread and return without waiting for it.
pub fn launch(
    mode: RunMode,
    client: Arc<dyn TunnelClient>,
) -> io::Result<thread::JoinHandle<()>> {
    let name = mode.name();
    info!("client version {}, mode {}", env!("CARGO_PKG_VERSION"), name);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = guard(name, move || execute(mode, client.as_ref()));
        })
}

fn execute(mode: RunMode, client: &dyn TunnelClient) {
    match mode {
        RunMode::PeerRelay(relay) => {
            if let Err(err) = client.start_peer_relay(&relay) {
                error!("peer relay on local port {} failed: {}", relay.local_port, err);
            }
        }
        RunMode::DirectClient(options) => reconnect_loop(client, &options, RECONNECT_DELAY),
        RunMode::FileDriven { config_path } => {
            info!("loading tunnels from {}", config_path.display());
            if let Err(err) = client.start_from_config_file(&config_path) {
                error!("tunnel file client stopped: {}", err);
            }
        }
    }
}

/// Connect, serve until disconnected, wait `delay`, repeat forever.
/// Every disconnect is handled the same way, whatever its cause.
pub fn reconnect_loop(client: &dyn TunnelClient, options: &ClientOptions, delay: Duration) -> ! {
    loop {
        // A panic is logged by the guard and treated like any other disconnect.
        if let Ok(Err(err)) = guard("client connection", || client.start_client(options)) {
            warn!("connection to {} lost: {}", options.endpoint, err);
        }
        info!(
            "client closed, reconnecting in {} seconds",
            delay.as_secs_f32()
        );
        thread::sleep(delay);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::{ClientError, NatReport};
    use crate::config::resolve;
    use crate::config::tests::parse_flags;
    use crate::config::{ENV_SERVER_ADDR, ENV_SERVER_VKEY, TransportKind};
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::Instant;

    fn select(args: &[&str]) -> RunMode {
        RunMode::select(&resolve(&parse_flags(args), |_| None))
    }

    #[test]
    fn server_and_key_select_direct_client() {
        match select(&["-server=1.2.3.4:8024", "-vkey=abc123"]) {
            RunMode::DirectClient(options) => {
                assert_eq!(options.endpoint, "1.2.3.4:8024");
                assert_eq!(options.auth_key, "abc123");
                assert_eq!(options.transport, TransportKind::Tcp);
                assert_eq!(options.disconnect_timeout, Duration::from_secs(60));
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn password_wins_over_everything_else() {
        let mode = select(&[
            "-server=1.2.3.4:8024",
            "-vkey=abc123",
            "-config=/etc/npc.toml",
            "-password=p2p-secret",
            "-target=10.0.0.5:80",
            "-local_port=2000",
        ]);
        match mode {
            RunMode::PeerRelay(relay) => {
                assert_eq!(relay.password, "p2p-secret");
                assert_eq!(relay.target, "10.0.0.5:80");
                assert_eq!(relay.local_port, 2000);
                assert_eq!(relay.local_type, "p2p");
                assert_eq!(relay.server.endpoint, "1.2.3.4:8024");
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn tunnel_file_path_beats_server_and_key() {
        assert_eq!(
            select(&["-server=1.2.3.4:8024", "-vkey=abc123", "-config=/etc/npc.toml"]),
            RunMode::FileDriven {
                config_path: PathBuf::from("/etc/npc.toml")
            }
        );
    }

    #[test]
    fn empty_config_flag_still_selects_direct_client() {
        match select(&["-server=1.2.3.4:8024", "-vkey=abc123", "-config="]) {
            RunMode::DirectClient(options) => assert_eq!(options.endpoint, "1.2.3.4:8024"),
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn everything_empty_falls_back_to_default_tunnel_file() {
        for args in [&[][..], &["-server=1.2.3.4:8024"][..], &["-vkey=abc"][..]] {
            assert_eq!(
                select(args),
                RunMode::FileDriven {
                    config_path: default_config_path()
                }
            );
        }
    }

    #[test]
    fn environment_backfill_feeds_direct_client() {
        let config = resolve(&parse_flags(&[]), |name| match name {
            ENV_SERVER_ADDR => Some("5.6.7.8:8024".to_string()),
            ENV_SERVER_VKEY => Some("envkey".to_string()),
            _ => None,
        });
        assert!(matches!(RunMode::select(&config), RunMode::DirectClient(_)));
    }

    /// Fails the first `fail_first` connections, then parks forever.
    pub(crate) struct FlakyClient {
        pub attempts: Mutex<Vec<Instant>>,
        pub fail_first: usize,
        pub panic_on: Option<usize>,
        pub reached: Mutex<Option<mpsc::Sender<usize>>>,
    }

    impl FlakyClient {
        pub(crate) fn new(fail_first: usize, reached: mpsc::Sender<usize>) -> Self {
            Self {
                attempts: Mutex::new(Vec::new()),
                fail_first,
                panic_on: None,
                reached: Mutex::new(Some(reached)),
            }
        }
    }

    impl TunnelClient for FlakyClient {
        fn start_client(&self, _options: &ClientOptions) -> Result<(), ClientError> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                attempts.push(Instant::now());
                attempts.len()
            };
            if self.panic_on == Some(attempt) {
                panic!("connection {attempt} blew up");
            }
            if attempt <= self.fail_first {
                return Err(ClientError::Rejected("refused".to_string()));
            }
            if let Some(tx) = self.reached.lock().unwrap().take() {
                let _ = tx.send(attempt);
            }
            loop {
                thread::park();
            }
        }
        fn start_peer_relay(&self, _relay: &PeerRelayConfig) -> Result<(), ClientError> {
            panic!("peer relay exploded");
        }
        fn start_from_config_file(&self, _path: &Path) -> Result<(), ClientError> {
            Ok(())
        }
        fn query_status(&self, _path: &Path) -> Result<(), ClientError> {
            Ok(())
        }
        fn register_endpoint(&self, _o: &ClientOptions, _h: u32) -> Result<(), ClientError> {
            Ok(())
        }
        fn discover_nat(&self, _stun_addr: &str) -> Result<NatReport, ClientError> {
            Err(ClientError::Stun("unavailable".to_string()))
        }
    }

    fn options() -> ClientOptions {
        ClientOptions {
            endpoint: "127.0.0.1:1".to_string(),
            auth_key: "k".to_string(),
            transport: TransportKind::Tcp,
            proxy_url: None,
            disconnect_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn default_reconnect_delay_is_five_seconds() {
        assert_eq!(RECONNECT_DELAY, Duration::from_secs(5));
    }

    #[test]
    fn failed_connections_retry_after_fixed_delay() {
        let delay = Duration::from_millis(200);
        let (tx, rx) = mpsc::channel();
        let client = Arc::new(FlakyClient::new(3, tx));
        let looping = client.clone();
        thread::spawn(move || reconnect_loop(looping.as_ref(), &options(), delay));

        let reached = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("loop kept going after three failures");
        assert_eq!(reached, 4);

        let attempts = client.attempts.lock().unwrap();
        for pair in attempts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= delay, "gap {:?} shorter than delay", gap);
            assert!(gap < delay * 10, "gap {:?} grew like a backoff", gap);
        }
    }

    #[test]
    fn panicking_connection_counts_as_a_disconnect() {
        let (tx, rx) = mpsc::channel();
        let mut client = FlakyClient::new(0, tx);
        client.panic_on = Some(1);
        let client = Arc::new(client);
        let looping = client.clone();
        thread::spawn(move || {
            reconnect_loop(looping.as_ref(), &options(), Duration::from_millis(10))
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(10)), Ok(2));
    }
}
