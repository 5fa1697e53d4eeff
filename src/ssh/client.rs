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

//! Remote session factory: the SSH capability each tunnelled connection uses.
//!
//! The tunnel manager only depends on the two traits defined here:
//!
//! - [`SessionConnector`] turns [`SessionParams`] into a connected,
//!   authenticated [`RemoteSession`].
//! - [`RemoteSession`] opens forwarded byte streams and can be ended.
//!
//! [`RusshConnector`] implements them on top of russh, opening one SSH
//! connection per call to [`SessionConnector::connect`] and a `direct-tcpip`
//! channel per [`RemoteSession::open_forwarded_channel`].

use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{Config, Handle, Handler, Msg};
use russh::ChannelStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use super::auth::{authenticate, ServerCheckMethod};
use crate::config::SessionParams;
use crate::error::SessionError;

/// A connected and authenticated SSH session.
#[async_trait]
pub trait RemoteSession: Send + 'static {
    /// Duplex byte stream of a forwarded channel.
    type Channel: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Ask the remote side to connect to `dst_host:dst_port`, announcing
    /// `src_host:src_port` as the originator.
    async fn open_forwarded_channel(
        &mut self,
        src_host: &str,
        src_port: u16,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<Self::Channel, SessionError>;

    /// Gracefully terminate the session. Failures are only logged.
    async fn end(&mut self);
}

/// Creates remote sessions from resolved session parameters.
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    type Session: RemoteSession;

    /// Synchronous checks run before any network activity.
    fn validate(&self, params: &SessionParams) -> Result<(), SessionError> {
        params.validate()
    }

    /// Connect, verify the server and authenticate.
    async fn connect(&self, params: &SessionParams) -> Result<Self::Session, SessionError>;
}

/// [`SessionConnector`] backed by russh.
#[derive(Debug, Clone, Default)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }

    fn client_config(params: &SessionParams) -> Config {
        Config {
            inactivity_timeout: params.inactivity_timeout,
            keepalive_interval: params.keepalive_interval,
            ..Default::default()
        }
    }
}

#[async_trait]
impl SessionConnector for RusshConnector {
    type Session = RusshSession;

    async fn connect(&self, params: &SessionParams) -> Result<RusshSession, SessionError> {
        let host = params.host.as_deref().ok_or(SessionError::MissingHost)?;
        let username = params
            .username
            .as_deref()
            .ok_or(SessionError::MissingUsername)?;
        let config = Arc::new(Self::client_config(params));

        let socket_addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, params.port))
            .await
            .map_err(SessionError::AddressInvalid)?
            .collect();

        // Try every resolved address; authentication only runs on the first
        // one that completes the handshake.
        let mut connect_res = Err(SessionError::AddressInvalid(io::Error::new(
            io::ErrorKind::InvalidInput,
            "could not resolve to any addresses",
        )));
        for socket_addr in socket_addrs {
            let handler =
                ClientHandler::new(host.to_string(), socket_addr, params.server_check.clone());
            match russh::client::connect(Arc::clone(&config), socket_addr, handler).await {
                Ok(handle) => {
                    connect_res = Ok((socket_addr, handle));
                    break;
                }
                Err(e) => {
                    debug!("SSH connection to {} failed: {}", socket_addr, e);
                    connect_res = Err(e);
                }
            }
        }
        let (address, mut handle) = connect_res?;
        trace!("SSH handshake with {} complete", address);

        authenticate(&mut handle, username, &params.auth).await?;
        debug!("Authenticated to {} as {}", address, username);

        Ok(RusshSession { handle, address })
    }
}

/// One SSH connection owned by a single tunnelled connection.
pub struct RusshSession {
    handle: Handle<ClientHandler>,
    address: SocketAddr,
}

impl Debug for RusshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshSession")
            .field("address", &self.address)
            .field("handle", &"Handle<ClientHandler>")
            .finish()
    }
}

#[async_trait]
impl RemoteSession for RusshSession {
    type Channel = ChannelStream<Msg>;

    async fn open_forwarded_channel(
        &mut self,
        src_host: &str,
        src_port: u16,
        dst_host: &str,
        dst_port: u16,
    ) -> Result<Self::Channel, SessionError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(dst_host, u32::from(dst_port), src_host, u32::from(src_port))
            .await
            .map_err(|source| SessionError::ChannelOpen {
                target: format!("{dst_host}:{dst_port}"),
                source,
            })?;

        trace!(
            "Opened direct-tcpip channel to {}:{} via {}",
            dst_host,
            dst_port,
            self.address
        );
        Ok(channel.into_stream())
    }

    async fn end(&mut self) {
        if self.handle.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("Failed to disconnect from {}: {}", self.address, e);
        }
    }
}

/// russh client handler that verifies the server host key.
#[derive(Debug, Clone)]
pub struct ClientHandler {
    hostname: String,
    host: SocketAddr,
    server_check: ServerCheckMethod,
}

impl ClientHandler {
    pub fn new(hostname: String, host: SocketAddr, server_check: ServerCheckMethod) -> Self {
        Self {
            hostname,
            host,
            server_check,
        }
    }
}

impl Handler for ClientHandler {
    type Error = SessionError;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted =
            self.server_check
                .verify(&self.hostname, self.host.port(), server_public_key)?;
        if !accepted {
            warn!(
                "Host key for {} ({}) did not pass {:?}",
                self.hostname, self.host, self.server_check
            );
        }
        Ok(accepted)
    }
}
