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

//! Tunnel connection manager.
//!
//! [`SshTunnel`] owns a local TCP listener and forwards every accepted
//! connection through its own SSH session to a fixed destination.
//!
//! # Architecture
//!
//! ```text
//! [Client] → [Local Listener] → [SSH session + direct-tcpip channel] → [dst_host:dst_port]
//!              ↑ local_host:local_port   ↑ one per accepted connection
//! ```
//!
//! # Per-connection flow
//!
//! 1. The accepted socket is registered in the [`ConnectionRegistry`] before
//!    anything else, so [`SshTunnel::close`] can abort it during setup.
//! 2. Session parameters are validated synchronously; a failure destroys the
//!    socket straight away.
//! 3. A session is connected and authenticated, then a forwarded channel is
//!    opened to the destination. Failures here are tagged `ssh-client`.
//!    Meanwhile the socket is watched: bytes the client sends are buffered
//!    for the channel, and a client that hangs up ends the connection.
//! 4. Socket and channel are spliced until the client closes. Local I/O
//!    failures are tagged `connection`, channel failures `ssh-client`.
//! 5. Whatever the cause of the end, the session is ended and the connection
//!    deregistered, exactly once.
//!
//! Failures of one connection are published as [`TunnelEvent::Error`] and
//! never affect the listener or other connections.

pub mod event;
pub mod registry;
pub mod splice;

pub use event::TunnelEvent;
pub use registry::{ConnectionId, ConnectionRegistry, Registration};
pub use splice::{splice, SpliceError, SpliceStats};

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{PartialTunnelConfig, TunnelConfig};
use crate::error::{SessionError, TunnelError};
use crate::ssh::client::{RemoteSession, RusshConnector, SessionConnector};

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Most client bytes buffered while a session is being set up.
const EARLY_DATA_LIMIT: usize = 64 * 1024;

enum ListenerState {
    Unbound,
    Binding,
    Bound {
        local_addr: SocketAddr,
        shutdown: CancellationToken,
        accept_task: JoinHandle<()>,
    },
    Closed,
}

/// State shared between the manager, its accept loop and connection tasks.
struct Shared<C> {
    config: TunnelConfig,
    connector: C,
    registry: ConnectionRegistry,
    events: broadcast::Sender<TunnelEvent>,
}

enum Outcome {
    Completed(SpliceStats),
    ClientClosed,
    Aborted,
    Failed(TunnelError),
}

/// Local listener forwarding each connection through SSH.
///
/// # Example
///
/// ```no_run
/// use ssh_tunnel::{AuthMethod, PartialTunnelConfig, SshTunnel};
///
/// # async fn example() -> Result<(), ssh_tunnel::TunnelError> {
/// let tunnel = SshTunnel::new(
///     PartialTunnelConfig::new()
///         .with_host("bastion.example.com")
///         .with_username("deploy")
///         .with_auth(AuthMethod::with_key_file("/home/deploy/.ssh/id_ed25519", None))
///         .with_destination("db.internal", 5432)
///         .with_local_port(15432),
/// );
///
/// tunnel.listen().await?;
/// println!("forwarding on port {}", tunnel.config().local_port);
/// // ...
/// tunnel.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct SshTunnel<C: SessionConnector = RusshConnector> {
    shared: Arc<Shared<C>>,
    listener: Mutex<ListenerState>,
}

impl SshTunnel<RusshConnector> {
    /// Create a tunnel that opens its sessions with russh.
    pub fn new(config: PartialTunnelConfig) -> Self {
        Self::with_connector(config, RusshConnector::new())
    }
}

impl<C: SessionConnector> SshTunnel<C> {
    /// Create a tunnel with a custom session connector.
    pub fn with_connector(config: PartialTunnelConfig, connector: C) -> Self {
        let (events, _) = broadcast::channel(event::EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config: TunnelConfig::resolve(config),
                connector,
                registry: ConnectionRegistry::new(),
                events,
            }),
            listener: Mutex::new(ListenerState::Unbound),
        }
    }

    fn lock_listener(&self) -> MutexGuard<'_, ListenerState> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an observer for lifecycle and error events.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    /// Resolved configuration, with `local_port` set to the bound port while
    /// the listener is bound.
    pub fn config(&self) -> TunnelConfig {
        let mut config = self.shared.config.clone();
        if let Some(addr) = self.local_addr() {
            config.local_port = addr.port();
        }
        config
    }

    /// Address the listener is bound to, if it is bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock_listener() {
            ListenerState::Bound { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    pub fn is_listening(&self) -> bool {
        matches!(&*self.lock_listener(), ListenerState::Bound { .. })
    }

    /// Number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Identifiers and peer addresses of the open connections.
    pub fn connections(&self) -> Vec<(ConnectionId, SocketAddr)> {
        let mut connections = Vec::with_capacity(self.shared.registry.len());
        self.shared
            .registry
            .for_each(|id, peer| connections.push((id, peer)));
        connections
    }

    /// Bind the local listener and start accepting connections.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::Listen`] if the address cannot be bound; the tunnel
    ///   stays unbound.
    /// - [`TunnelError::AlreadyListening`] if `listen` already succeeded or
    ///   is in progress.
    /// - [`TunnelError::ListenerClosed`] once the tunnel has been closed.
    pub async fn listen(&self) -> Result<(), TunnelError> {
        {
            let mut state = self.lock_listener();
            match *state {
                ListenerState::Unbound => *state = ListenerState::Binding,
                ListenerState::Binding | ListenerState::Bound { .. } => {
                    return Err(TunnelError::AlreadyListening)
                }
                ListenerState::Closed => return Err(TunnelError::ListenerClosed),
            }
        }

        let config = &self.shared.config;
        let bound = match TcpListener::bind((config.local_host.as_str(), config.local_port)).await
        {
            Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
            Err(e) => Err(e),
        };

        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                {
                    let mut state = self.lock_listener();
                    if matches!(*state, ListenerState::Binding) {
                        *state = ListenerState::Unbound;
                    }
                }
                error!("Failed to bind {}: {}", config.local_bind_addr(), source);
                self.shared
                    .emit(TunnelEvent::Error(Arc::new(TunnelError::Listen {
                        addr: config.local_bind_addr(),
                        source: io::Error::new(source.kind(), source.to_string()),
                    })));
                return Err(TunnelError::Listen {
                    addr: config.local_bind_addr(),
                    source,
                });
            }
        };

        let mut state = self.lock_listener();
        if !matches!(*state, ListenerState::Binding) {
            // closed while binding
            return Err(TunnelError::ListenerClosed);
        }

        info!(
            "Tunnel listening on {} → {} via {}:{}",
            local_addr,
            config.destination(),
            config.session.host.as_deref().unwrap_or("<unset>"),
            config.session.port
        );
        self.shared.emit(TunnelEvent::Listening(local_addr));

        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            shutdown.clone(),
        ));
        *state = ListenerState::Bound {
            local_addr,
            shutdown,
            accept_task,
        };
        Ok(())
    }

    /// Stop accepting, force-close every connection and wait for all of it.
    ///
    /// The listener is stopped first, so no connection can slip in after the
    /// teardown starts. A listener failure (for example a tunnel that never
    /// listened) is only returned once every connection has closed.
    pub async fn close(&self) -> Result<(), TunnelError> {
        let bound = {
            let mut state = self.lock_listener();
            match std::mem::replace(&mut *state, ListenerState::Closed) {
                ListenerState::Bound {
                    local_addr,
                    shutdown,
                    accept_task,
                } => Some((local_addr, shutdown, accept_task)),
                ListenerState::Unbound => {
                    *state = ListenerState::Unbound;
                    None
                }
                ListenerState::Binding | ListenerState::Closed => None,
            }
        };

        let listener_result = match bound {
            Some((local_addr, shutdown, accept_task)) => {
                shutdown.cancel();
                match accept_task.await {
                    Ok(()) => {
                        debug!("Listener on {} stopped", local_addr);
                        Ok(())
                    }
                    Err(e) => Err(TunnelError::ListenerTask(e.to_string())),
                }
            }
            None => Err(TunnelError::NotListening),
        };

        self.shared.registry.close_all_and_wait().await;

        match listener_result {
            Ok(()) => {
                info!("Tunnel closed");
                self.shared.emit(TunnelEvent::Close);
                Ok(())
            }
            Err(e) => {
                warn!("Tunnel close: {}", e);
                Err(e)
            }
        }
    }
}

impl<C: SessionConnector> Drop for SshTunnel<C> {
    fn drop(&mut self) {
        if let ListenerState::Bound { shutdown, .. } = &*self.lock_listener() {
            shutdown.cancel();
        }
        self.shared.registry.abort_all();
    }
}

impl<C> Shared<C> {
    fn emit(&self, event: TunnelEvent) {
        // no subscribers is not an error
        let _ = self.events.send(event);
    }
}

impl<C: SessionConnector> Shared<C> {
    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
        registration: Registration,
    ) {
        let id = registration.id();
        let abort = registration.abort_token();
        let mut session: Option<C::Session> = None;

        let outcome = match self.connector.validate(&self.config.session) {
            Err(source) => Outcome::Failed(TunnelError::Session { peer, source }),
            Ok(()) => tokio::select! {
                biased;
                _ = abort.cancelled() => Outcome::Aborted,
                result = self.forward(&mut stream, &mut session, peer) => match result {
                    Ok(Some(stats)) => Outcome::Completed(stats),
                    Ok(None) => Outcome::ClientClosed,
                    Err(e) => Outcome::Failed(e),
                },
            },
        };

        match outcome {
            Outcome::Completed(stats) => {
                debug!(
                    "Connection {} from {} completed: {} bytes in {:?}",
                    id,
                    peer,
                    stats.total_bytes(),
                    stats.duration
                );
                drop(stream);
            }
            Outcome::ClientClosed => {
                debug!("Connection {} from {} closed by client during setup", id, peer);
                drop(stream);
            }
            Outcome::Aborted => {
                debug!("Connection {} from {} aborted", id, peer);
                destroy(stream);
            }
            Outcome::Failed(err) => {
                warn!("Connection {} failed: {}", id, err);
                destroy(stream);
                self.emit(TunnelEvent::Error(Arc::new(err)));
            }
        }

        if let Some(mut session) = session.take() {
            session.end().await;
        }
        drop(registration);
    }

    /// Set up the channel while watching the client, then splice.
    ///
    /// Returns `None` when the client hung up before the channel was open.
    async fn forward(
        &self,
        stream: &mut TcpStream,
        session: &mut Option<C::Session>,
        peer: SocketAddr,
    ) -> Result<Option<SpliceStats>, TunnelError> {
        let mut early_data = Vec::new();
        let mut channel = tokio::select! {
            closed = watch_local(stream, &mut early_data) => {
                return match closed {
                    Ok(()) => Ok(None),
                    Err(source) => Err(TunnelError::Connection { peer, source }),
                };
            }
            channel = self.open_channel(session, peer) => channel?,
        };
        trace!("Forwarding {} to {}", peer, self.config.destination());

        if !early_data.is_empty() {
            trace!("Sending {} bytes received during setup", early_data.len());
            channel
                .write_all(&early_data)
                .await
                .map_err(|e| TunnelError::Session {
                    peer,
                    source: SessionError::ChannelIo(e),
                })?;
        }

        let stats = splice(stream, &mut channel)
            .await
            .map_err(|err| match err {
                SpliceError::Local(source) => TunnelError::Connection { peer, source },
                SpliceError::Channel(e) => TunnelError::Session {
                    peer,
                    source: SessionError::ChannelIo(e),
                },
            })?;
        Ok(Some(stats))
    }

    /// Connect and authenticate a session, then open the forwarded channel.
    async fn open_channel(
        &self,
        session: &mut Option<C::Session>,
        peer: SocketAddr,
    ) -> Result<<C::Session as RemoteSession>::Channel, TunnelError> {
        let config = &self.config;
        let ssh_error = |source| TunnelError::Session { peer, source };

        let connected = self
            .connector
            .connect(&config.session)
            .await
            .map_err(ssh_error)?;
        let session = session.insert(connected);

        session
            .open_forwarded_channel(
                &config.src_host,
                config.src_port,
                &config.dst_host,
                config.dst_port,
            )
            .await
            .map_err(ssh_error)
    }
}

/// Buffer client bytes into `early_data` until the client closes.
///
/// Stops reading (and stays pending) once [`EARLY_DATA_LIMIT`] is reached.
async fn watch_local(stream: &mut TcpStream, early_data: &mut Vec<u8>) -> io::Result<()> {
    while early_data.len() < EARLY_DATA_LIMIT {
        if stream.read_buf(early_data).await? == 0 {
            return Ok(());
        }
    }
    std::future::pending().await
}

async fn accept_loop<C: SessionConnector>(
    shared: Arc<Shared<C>>,
    listener: TcpListener,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Accept loop cancelled");
                break;
            }
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    let registration = shared.registry.add(peer);
                    debug!("Accepted connection {} from {}", registration.id(), peer);
                    shared.emit(TunnelEvent::Connection(peer));
                    tokio::spawn(Arc::clone(&shared).handle_connection(stream, peer, registration));
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    shared.emit(TunnelEvent::Error(Arc::new(TunnelError::Accept(e))));
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

/// Close `stream` abortively: the peer sees a reset instead of EOF.
fn destroy(stream: TcpStream) {
    #[allow(deprecated)]
    let linger = stream.set_linger(Some(Duration::ZERO));
    if let Err(e) = linger {
        trace!("Failed to set SO_LINGER before reset: {}", e);
    }
    drop(stream);
}
