//! In-process SSH server with a scripted shell, plus gateway helpers

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Config, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use webshell_gateway::bridge::{Gateway, SshConnector};
use webshell_gateway::config::GatewayConfig;
use webshell_gateway::session::SessionRegistry;

pub const USER: &str = "u";
pub const PASSWORD: &str = "secret";
pub const PROMPT: &str = "$ ";
pub const LISTING: &str = "Cargo.toml  README.md  src\r\n";

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn random_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

/// Write `key` in OpenSSH format to a file inside `dir`
pub fn write_key(dir: &std::path::Path, key: &PrivateKey) -> String {
    let path = dir.join("id_ed25519");
    let pem = key.to_openssh(LineEnding::LF).unwrap();
    std::fs::write(&path, pem.as_bytes()).unwrap();
    path.to_string_lossy().into_owned()
}

/// Scripted login shell: echoes input, answers `ls`, ends on `exit`
struct ShellHandler {
    authorized_key: Option<PublicKey>,
    line: Vec<u8>,
    closed_channels: Arc<AtomicUsize>,
}

impl ShellHandler {
    fn run_line(&mut self, channel: ChannelId, session: &mut Session) {
        let line = String::from_utf8_lossy(&self.line).trim().to_string();
        self.line.clear();

        let reply = match line.as_str() {
            "" => String::new(),
            "ls" => LISTING.to_string(),
            "exit" => {
                let _ = session.data(channel, CryptoVec::from_slice(b"logout\r\n"));
                let _ = session.exit_status_request(channel, 0);
                let _ = session.eof(channel);
                let _ = session.close(channel);
                return;
            }
            other => format!("sh: {}: command not found\r\n", other),
        };
        let _ = session.data(
            channel,
            CryptoVec::from_slice(format!("{}{}", reply, PROMPT).as_bytes()),
        );
    }
}

impl Handler for ShellHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == USER && password == PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match &self.authorized_key {
            Some(key) if user == USER && key.key_data() == public_key.key_data() => {
                Ok(Auth::Accept)
            }
            _ => Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        let _ = session.data(channel, CryptoVec::from_slice(PROMPT.as_bytes()));
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.closed_channels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        for &byte in data {
            match byte {
                b'\r' | b'\n' => {
                    let _ = session.data(channel, CryptoVec::from_slice(b"\r\n"));
                    self.run_line(channel, session);
                }
                _ => {
                    let _ = session.data(channel, CryptoVec::from_slice(&[byte]));
                    self.line.push(byte);
                }
            }
        }
        Ok(())
    }
}

pub struct SshServer {
    pub addr: SocketAddr,
    closed_channels: Arc<AtomicUsize>,
}

impl SshServer {
    /// Channels the client has closed so far
    pub fn closed_channels(&self) -> usize {
        self.closed_channels.load(Ordering::SeqCst)
    }
}

/// Start an SSH server on a random local port.
///
/// Password `PASSWORD` for user `USER` is accepted, as is `authorized_key`
/// when given.
pub async fn start_ssh_server(authorized_key: Option<PublicKey>) -> SshServer {
    let config = Arc::new(Config {
        keys: vec![random_key()],
        auth_rejection_time: Duration::from_secs(0),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Config::default()
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let closed_channels = Arc::new(AtomicUsize::new(0));
    let counter = closed_channels.clone();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let cfg = config.clone();
            let handler = ShellHandler {
                authorized_key: authorized_key.clone(),
                line: Vec::new(),
                closed_channels: counter.clone(),
            };
            tokio::spawn(async move {
                if let Ok(session) = russh::server::run_stream(cfg, socket, handler).await {
                    let _ = session.await;
                }
            });
        }
    });

    SshServer {
        addr,
        closed_channels,
    }
}

pub struct RunningGateway {
    pub addr: SocketAddr,
    pub registry: Arc<SessionRegistry>,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl RunningGateway {
    pub async fn connect(&self) -> Client {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", self.addr))
            .await
            .unwrap();
        ws
    }

    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = self.task.await;
    }
}

/// Run a gateway with the real SSH connector on a random local port
pub async fn start_gateway(mut config: GatewayConfig) -> RunningGateway {
    config.listen = "127.0.0.1:0".parse().unwrap();
    let config = Arc::new(config);
    let connector = SshConnector::from_config(config.clone()).unwrap();
    let gateway = Arc::new(Gateway::new(config, Arc::new(connector)));
    let listener = gateway.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = gateway.registry();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let task = tokio::spawn(gateway.serve(listener, async move {
        let _ = stop_rx.await;
    }));

    RunningGateway {
        addr,
        registry,
        stop: Some(stop_tx),
        task,
    }
}

pub async fn send_text(client: &mut Client, text: &str) {
    client.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next text frame, or `None` once the connection closes
pub async fn next_text(client: &mut Client) -> Option<String> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no frame within 5s")
        {
            Some(Ok(Message::Text(t))) => return Some(t),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Collect output until it contains `needle`
pub async fn read_until(client: &mut Client, needle: &str) -> String {
    let mut output = String::new();
    while !output.contains(needle) {
        match next_text(client).await {
            Some(text) => output.push_str(&text),
            None => panic!("connection closed before {:?}; got {:?}", needle, output),
        }
    }
    output
}

pub async fn wait_for_count(registry: &SessionRegistry, n: usize) {
    for _ in 0..200 {
        if registry.count() == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry count stayed at {}, expected {}", registry.count(), n);
}
