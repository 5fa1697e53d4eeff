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

//! Tunnel configuration and its resolution from partial user input.
//!
//! Users describe a tunnel with a [`PartialTunnelConfig`] in which every field
//! is optional. [`TunnelConfig::resolve`] fills the gaps:
//!
//! | Field | Default |
//! |---|---|
//! | `port` (SSH) | `22` |
//! | `src_host` / `src_port` | `127.0.0.1` / `0` |
//! | `dst_host` / `dst_port` | `127.0.0.1` / SSH port |
//! | `local_host` / `local_port` | `127.0.0.1` / SSH port |
//!
//! Explicit values always win, including when they break the coupling
//! between the SSH port and the destination or listener port.

use std::time::Duration;

use crate::error::SessionError;
use crate::ssh::auth::{AuthMethod, ServerCheckMethod};

/// Default SSH server port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Loopback address used for every host default.
pub const LOOPBACK_HOST: &str = "127.0.0.1";

/// User supplied tunnel settings; anything left `None` gets a default.
#[derive(Debug, Clone, Default)]
pub struct PartialTunnelConfig {
    /// Originator host announced in the forwarding request.
    pub src_host: Option<String>,
    /// Originator port announced in the forwarding request.
    pub src_port: Option<u16>,
    /// Host the remote side connects to.
    pub dst_host: Option<String>,
    /// Port the remote side connects to.
    pub dst_port: Option<u16>,
    /// Address the local listener binds.
    pub local_host: Option<String>,
    /// Port the local listener binds, `0` for any free port.
    pub local_port: Option<u16>,

    /// SSH server host.
    pub host: Option<String>,
    /// SSH server port.
    pub port: Option<u16>,
    pub username: Option<String>,
    pub auth: Option<AuthMethod>,
    pub server_check: Option<ServerCheckMethod>,
    pub keepalive_interval: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
}

impl PartialTunnelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, host: impl Into<String>, port: u16) -> Self {
        self.src_host = Some(host.into());
        self.src_port = Some(port);
        self
    }

    pub fn with_destination(mut self, host: impl Into<String>, port: u16) -> Self {
        self.dst_host = Some(host.into());
        self.dst_port = Some(port);
        self
    }

    pub fn with_destination_port(mut self, port: u16) -> Self {
        self.dst_port = Some(port);
        self
    }

    pub fn with_local(mut self, host: impl Into<String>, port: u16) -> Self {
        self.local_host = Some(host.into());
        self.local_port = Some(port);
        self
    }

    pub fn with_local_port(mut self, port: u16) -> Self {
        self.local_port = Some(port);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_server_check(mut self, server_check: ServerCheckMethod) -> Self {
        self.server_check = Some(server_check);
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = Some(interval);
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = Some(timeout);
        self
    }
}

/// Parameters handed unchanged to the session connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// SSH server host. Only checked when a session is started.
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub auth: AuthMethod,
    pub server_check: ServerCheckMethod,
    pub keepalive_interval: Option<Duration>,
    pub inactivity_timeout: Option<Duration>,
}

impl SessionParams {
    /// Connect-time checks that need no network access.
    pub fn validate(&self) -> Result<(), SessionError> {
        match self.host.as_deref() {
            Some(host) if !host.trim().is_empty() => {}
            _ => return Err(SessionError::MissingHost),
        }
        match self.username.as_deref() {
            Some(user) if !user.is_empty() => {}
            _ => return Err(SessionError::MissingUsername),
        }
        self.auth.validate()
    }
}

/// Fully resolved, immutable tunnel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub src_host: String,
    pub src_port: u16,
    pub dst_host: String,
    pub dst_port: u16,
    pub local_host: String,
    pub local_port: u16,
    pub session: SessionParams,
}

impl TunnelConfig {
    /// Merge partial settings with the defaults. Never fails.
    pub fn resolve(partial: PartialTunnelConfig) -> Self {
        let PartialTunnelConfig {
            src_host,
            src_port,
            dst_host,
            dst_port,
            local_host,
            local_port,
            host,
            port,
            username,
            auth,
            server_check,
            keepalive_interval,
            inactivity_timeout,
        } = partial;

        let session = SessionParams {
            host,
            port: port.unwrap_or(DEFAULT_SSH_PORT),
            username,
            auth: auth.unwrap_or_default(),
            server_check: server_check.unwrap_or_default(),
            keepalive_interval,
            inactivity_timeout,
        };

        Self {
            src_host: src_host.unwrap_or_else(|| LOOPBACK_HOST.to_string()),
            src_port: src_port.unwrap_or(0),
            dst_host: dst_host.unwrap_or_else(|| LOOPBACK_HOST.to_string()),
            dst_port: dst_port.unwrap_or(session.port),
            local_host: local_host.unwrap_or_else(|| LOOPBACK_HOST.to_string()),
            local_port: local_port.unwrap_or(session.port),
            session,
        }
    }

    /// `host:port` string the local listener binds.
    pub fn local_bind_addr(&self) -> String {
        join_host_port(&self.local_host, self.local_port)
    }

    /// `host:port` string of the forwarding destination.
    pub fn destination(&self) -> String {
        join_host_port(&self.dst_host, self.dst_port)
    }
}

impl From<PartialTunnelConfig> for TunnelConfig {
    fn from(partial: PartialTunnelConfig) -> Self {
        Self::resolve(partial)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
