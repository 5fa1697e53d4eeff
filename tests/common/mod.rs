// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared fixtures for tunnel integration tests.
//!
//! - [`Relay`]: an in-process russh server that honours `direct-tcpip`
//!   requests by dialling the requested address.
//! - Destination services: echo, a one-shot HTTP-like responder and a slow
//!   responder.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{Auth, Msg, Server as _, Session};
use russh::Channel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use ssh_tunnel::{
    AuthMethod, PartialTunnelConfig, ServerCheckMethod, TunnelEvent,
};

pub const TEST_USER: &str = "tester";
pub const HTTP_BODY: &[u8] = b"hello through the tunnel";

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Base64 body of an OpenSSH `.pub` fixture.
pub fn fixture_public_key(name: &str) -> String {
    let contents = std::fs::read_to_string(fixture_path(name)).expect("public key fixture");
    contents
        .split_whitespace()
        .nth(1)
        .expect("public key fixture has a key field")
        .to_string()
}

/// Credentials the relay accepts.
#[derive(Debug, Clone)]
pub enum RelayAuth {
    /// Any user, `none` method.
    Open,
    Password(String),
    /// Public key auth with the given base64 key.
    PublicKey(String),
}

/// `direct-tcpip` request seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub host: String,
    pub port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

pub struct Relay {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<ForwardRequest>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Relay {
    pub async fn start(auth: RelayAuth) -> Result<Self> {
        let host_key = russh::keys::PrivateKey::read_openssh_file(&fixture_path("host_ed25519"))
            .context("Failed to load relay host key")?;
        let config = Arc::new(russh::server::Config {
            keys: vec![host_key],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        });

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("Failed to bind relay")?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));

        let mut server = RelayServer {
            auth: Arc::new(auth),
            requests: Arc::clone(&requests),
        };
        let task = tokio::spawn(async move {
            let _ = server.run_on_socket(config, &listener).await;
        });

        Ok(Self {
            addr,
            requests,
            task,
        })
    }

    pub fn requests(&self) -> Vec<ForwardRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Tunnel settings pointing at this relay, pinned to its host key and
    /// bound to an ephemeral local port.
    pub fn tunnel_config(&self, destination: SocketAddr) -> PartialTunnelConfig {
        PartialTunnelConfig::new()
            .with_host("127.0.0.1")
            .with_port(self.addr.port())
            .with_username(TEST_USER)
            .with_server_check(ServerCheckMethod::with_public_key(&fixture_public_key(
                "host_ed25519.pub",
            )))
            .with_destination(destination.ip().to_string(), destination.port())
            .with_local("127.0.0.1", 0)
    }

    pub fn tunnel_config_with_auth(
        &self,
        destination: SocketAddr,
        auth: AuthMethod,
    ) -> PartialTunnelConfig {
        self.tunnel_config(destination).with_auth(auth)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
struct RelayServer {
    auth: Arc<RelayAuth>,
    requests: Arc<Mutex<Vec<ForwardRequest>>>,
}

impl russh::server::Server for RelayServer {
    type Handler = RelayHandler;

    fn new_client(&mut self, _peer_addr: Option<SocketAddr>) -> Self::Handler {
        RelayHandler {
            auth: Arc::clone(&self.auth),
            requests: Arc::clone(&self.requests),
        }
    }

    fn handle_session_error(&mut self, _error: <Self::Handler as russh::server::Handler>::Error) {}
}

struct RelayHandler {
    auth: Arc<RelayAuth>,
    requests: Arc<Mutex<Vec<ForwardRequest>>>,
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

impl russh::server::Handler for RelayHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        match *self.auth {
            RelayAuth::Open => Ok(Auth::Accept),
            _ => Ok(reject()),
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match &*self.auth {
            RelayAuth::Password(expected) if user == TEST_USER && password == expected => {
                Ok(Auth::Accept)
            }
            _ => Ok(reject()),
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        if let RelayAuth::PublicKey(expected) = &*self.auth {
            if let Ok(expected) = russh::keys::parse_public_key_base64(expected) {
                if user == TEST_USER && expected == *public_key {
                    return Ok(Auth::Accept);
                }
            }
        }
        Ok(reject())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.requests.lock().unwrap().push(ForwardRequest {
            host: host_to_connect.to_string(),
            port: port_to_connect,
            originator_address: originator_address.to_string(),
            originator_port,
        });

        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };

        match TcpStream::connect((host_to_connect, port)).await {
            Ok(mut upstream) => {
                let mut stream = channel.into_stream();
                tokio::spawn(async move {
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
                    let _ = stream.shutdown().await;
                });
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

/// Echo every byte back until the client closes.
pub async fn spawn_echo_service() -> Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    Ok(addr)
}

/// Answer one request per connection after `delay`, then close.
pub async fn spawn_http_service(delay: Duration) -> Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                if stream.read(&mut buf).await.unwrap_or(0) == 0 {
                    return;
                }
                tokio::time::sleep(delay).await;
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    HTTP_BODY.len()
                );
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(HTTP_BODY).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    Ok(addr)
}

/// Accept connections and hold them open without ever answering.
///
/// Serves both as a destination that never closes and as an "SSH server"
/// whose handshake never completes.
pub async fn spawn_silent_service() -> Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
    Ok(addr)
}

/// Poll until `count()` reaches `expected`.
pub async fn wait_for_count(count: impl Fn() -> usize, expected: usize) {
    timeout(Duration::from_secs(5), async {
        while count() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("count never reached the expected value");
}

/// A loopback address nothing listens on.
pub async fn closed_port() -> Result<SocketAddr> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

pub async fn next_event(events: &mut broadcast::Receiver<TunnelEvent>) -> TunnelEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for tunnel event")
        .expect("tunnel event channel closed")
}

/// Skip events until the first error.
pub async fn next_error(
    events: &mut broadcast::Receiver<TunnelEvent>,
) -> Arc<ssh_tunnel::TunnelError> {
    loop {
        if let TunnelEvent::Error(err) = next_event(events).await {
            return err;
        }
    }
}
