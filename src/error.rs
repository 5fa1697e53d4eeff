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

//! Error types for the tunnel manager and the remote session layer.
//!
//! Every failure a connection can report carries an explicit [`ErrorOrigin`],
//! decided where the failure is detected:
//!
//! - [`ErrorOrigin::SshClient`]: the SSH session could not be prepared,
//!   connected, authenticated, or could not open the forwarded channel.
//! - [`ErrorOrigin::Connection`]: the local socket failed while bytes were
//!   being spliced.
//!
//! Listener lifecycle failures (bind, double listen, close of a listener that
//! never started) have no origin; they are returned straight to the caller of
//! [`SshTunnel::listen`](crate::SshTunnel::listen) or
//! [`SshTunnel::close`](crate::SshTunnel::close).

use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Which side of a tunnelled connection detected a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorOrigin {
    /// The remote SSH session or its forwarded channel.
    SshClient,
    /// The accepted local socket.
    Connection,
}

impl ErrorOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorOrigin::SshClient => "ssh-client",
            ErrorOrigin::Connection => "connection",
        }
    }
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of the remote session collaborator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("no SSH host configured")]
    MissingHost,

    #[error("no SSH username configured")]
    MissingUsername,

    #[error("could not resolve SSH host address: {0}")]
    AddressInvalid(#[source] io::Error),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("server host key verification failed")]
    ServerCheckFailed,

    #[error("{method} authentication rejected by server")]
    AuthFailed { method: &'static str },

    #[error("invalid private key: {0}")]
    KeyInvalid(#[source] russh::keys::Error),

    /// Transport failure surfacing on an open forwarded channel.
    #[error("forwarded channel I/O failed: {0}")]
    ChannelIo(#[source] io::Error),

    #[error("failed to open forwarded channel to {target}: {source}")]
    ChannelOpen {
        target: String,
        #[source]
        source: russh::Error,
    },
}

/// Errors produced by [`SshTunnel`](crate::SshTunnel).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TunnelError {
    /// The local listener could not be bound.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("tunnel is already listening")]
    AlreadyListening,

    #[error("tunnel has been closed and cannot listen again")]
    ListenerClosed,

    /// `close` was called on a tunnel whose listener never started.
    #[error("tunnel is not listening")]
    NotListening,

    #[error("listener task failed: {0}")]
    ListenerTask(String),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("[ssh-client] connection from {peer}: {source}")]
    Session {
        peer: SocketAddr,
        #[source]
        source: SessionError,
    },

    #[error("[connection] connection from {peer}: {source}")]
    Connection {
        peer: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl TunnelError {
    /// Origin tag of a per-connection failure, `None` for listener errors.
    pub fn origin(&self) -> Option<ErrorOrigin> {
        match self {
            TunnelError::Session { .. } => Some(ErrorOrigin::SshClient),
            TunnelError::Connection { .. } => Some(ErrorOrigin::Connection),
            _ => None,
        }
    }

    /// Peer address of the local connection this error belongs to.
    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            TunnelError::Session { peer, .. } | TunnelError::Connection { peer, .. } => {
                Some(*peer)
            }
            _ => None,
        }
    }
}
