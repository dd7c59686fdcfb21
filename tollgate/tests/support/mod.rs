//! In-process test harness: a full worker stack (plugin chain, SMTP
//! listener, control channel) on loopback ports, plus a line-level SMTP
//! client.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use tollgate_common::{config::Config, state::ServerState, Signal};
use tollgate_control::ControlServer;
use tollgate_hooks::dns::{DnsAnswer, Resolve};
use tollgate_hooks::Dispatcher;
use tollgate_smtp::{Listener, Smtp, SmtpConfig};

/// Resolver that lists exactly the names it is given.
pub struct MockResolver {
    pub listed: Vec<String>,
}

#[async_trait]
impl Resolve for MockResolver {
    async fn lookup_a(&self, name: &str) -> DnsAnswer<Ipv4Addr> {
        if self.listed.iter().any(|l| l == name) {
            DnsAnswer::Records(vec![Ipv4Addr::new(127, 0, 0, 2)])
        } else {
            DnsAnswer::NoRecords
        }
    }

    async fn lookup_txt(&self, name: &str) -> DnsAnswer<String> {
        if self.listed.iter().any(|l| l == name) {
            DnsAnswer::Records(vec![format!("{name} is listed")])
        } else {
            DnsAnswer::NoRecords
        }
    }
}

pub struct TestServer {
    pub smtp_addr: SocketAddr,
    pub control_addr: SocketAddr,
    pub state: Arc<ServerState>,
    /// Kept alive so the spawned listener and control tasks keep serving.
    #[allow(dead_code)]
    shutdown: broadcast::Sender<Signal>,
    config_dir: tempfile::TempDir,
    _db_dir: tempfile::TempDir,
}

impl TestServer {
    /// Start a stack with the given config files and DNSBL-listed names.
    pub async fn start(config_files: &[(&str, &str)], listed: &[&str]) -> Self {
        let config_dir = tempfile::tempdir().unwrap();
        let db_dir = tempfile::tempdir().unwrap();

        for (key, content) in config_files {
            std::fs::write(config_dir.path().join(key), content).unwrap();
        }

        let config = Arc::new(Config::new(config_dir.path()));
        let state = Arc::new(ServerState::new());
        let resolver: Arc<dyn Resolve> = Arc::new(MockResolver {
            listed: listed.iter().map(ToString::to_string).collect(),
        });

        let registry = Arc::new(tollgate_plugins::build_registry(
            &config,
            db_dir.path(),
            Arc::clone(&resolver),
        ));

        let smtp = Arc::new(Smtp {
            dispatcher: Dispatcher::new(registry),
            server: Arc::clone(&state),
            config: Arc::clone(&config),
            settings: SmtpConfig::from_config(&config),
        });

        let (shutdown, _) = broadcast::channel(8);

        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let smtp_addr = tcp.local_addr().unwrap();
        let listener = Listener::new(tcp, Arc::clone(&smtp));
        let listener_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let _ = listener.serve(listener_shutdown).await;
        });

        let reload = {
            let config = Arc::clone(&config);
            let smtp = Arc::clone(&smtp);
            let resolver = Arc::clone(&resolver);
            let db_dir_path = db_dir.path().to_path_buf();
            Arc::new(move || {
                config.reload();
                let registry = Arc::new(tollgate_plugins::build_registry(
                    &config,
                    &db_dir_path,
                    Arc::clone(&resolver),
                ));
                smtp.dispatcher.swap(registry);
            }) as Arc<dyn Fn() + Send + Sync>
        };

        let control = ControlServer::bind("127.0.0.1:0", Arc::clone(&state), reload)
            .await
            .unwrap();
        let control_addr = control.local_addr().unwrap();
        let control_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            let _ = control.serve(control_shutdown).await;
        });

        Self {
            smtp_addr,
            control_addr,
            state,
            shutdown,
            config_dir,
            _db_dir: db_dir,
        }
    }

    /// Overwrite one config key on disk (visible after `reload`).
    pub fn write_config(&self, key: &str, content: &str) {
        std::fs::write(self.config_dir.path().join(key), content).unwrap();
    }

    pub async fn connect(&self) -> SmtpClient {
        SmtpClient::connect(self.smtp_addr).await
    }

    pub async fn control(&self, command: &str) -> String {
        tollgate_control::send_command(&self.control_addr.to_string(), command)
            .await
            .unwrap()
    }
}

pub struct SmtpClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl SmtpClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Final line of the next reply ("" on EOF).
    pub async fn reply(&mut self) -> String {
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            if n == 0 {
                return String::new();
            }
            let line = line.trim_end().to_string();
            if line.len() < 4 || line.as_bytes()[3] == b' ' {
                return line;
            }
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\r\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    pub async fn round(&mut self, line: &str) -> String {
        self.send(line).await;
        self.reply().await
    }

    /// Run MAIL/RCPT/DATA/body and return the final DATA reply.
    pub async fn transaction(&mut self, sender: &str, rcpt: &str, body: &[&str]) -> String {
        assert!(self.round(&format!("MAIL FROM:{sender}")).await.starts_with("250 "));
        assert!(self.round(&format!("RCPT TO:{rcpt}")).await.starts_with("250 "));
        assert!(self.round("DATA").await.starts_with("354 "));
        for line in body {
            self.send(line).await;
        }
        self.round(".").await
    }
}
