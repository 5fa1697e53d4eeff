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

//! Lifecycle notifications published by [`SshTunnel`](super::SshTunnel).

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::TunnelError;

/// Default capacity of the event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Event observed through [`SshTunnel::subscribe`](super::SshTunnel::subscribe).
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The local listener is bound and accepting.
    Listening(SocketAddr),
    /// A local client connected from the given address.
    Connection(SocketAddr),
    /// The listener stopped and every connection has been torn down.
    Close,
    /// Listener or per-connection failure. Per-connection errors carry an
    /// [`ErrorOrigin`](crate::error::ErrorOrigin).
    Error(Arc<TunnelError>),
}

impl TunnelEvent {
    pub fn is_error(&self) -> bool {
        matches!(self, TunnelEvent::Error(_))
    }
}

impl fmt::Display for TunnelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelEvent::Listening(addr) => write!(f, "listening on {addr}"),
            TunnelEvent::Connection(peer) => write!(f, "connection from {peer}"),
            TunnelEvent::Close => write!(f, "closed"),
            TunnelEvent::Error(err) => match err.origin() {
                Some(origin) => write!(f, "error ({origin}): {err}"),
                None => write!(f, "error: {err}"),
            },
        }
    }
}
