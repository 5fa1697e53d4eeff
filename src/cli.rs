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

//! Command-line front end for the `ssh-tunnel` binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};

use crate::config::PartialTunnelConfig;
use crate::ssh::{AuthMethod, ServerCheckMethod};

#[derive(Parser, Debug)]
#[command(
    name = "ssh-tunnel",
    version,
    about = "Forward a local TCP port to a remote destination through SSH",
    long_about = "ssh-tunnel listens on a local TCP port and forwards every accepted connection\nthrough its own SSH session to a fixed destination reachable from the SSH server.",
    after_help = "EXAMPLES:\n  Forward localhost:15432 to db.internal:5432:  ssh-tunnel -L 15432 db.internal:5432 deploy@bastion\n  Bind all interfaces, password auth:           ssh-tunnel -L 0.0.0.0:8080 --password 10.0.0.5:80 admin@gateway\n  Pick a free local port:                       ssh-tunnel -L 0 -i ~/.ssh/id_ed25519 localhost:6379 cache-host"
)]
pub struct Cli {
    /// Destination the SSH server connects to, as HOST:PORT
    #[arg(value_name = "DESTINATION")]
    pub target: String,

    /// SSH server, as [user@]host
    #[arg(value_name = "SERVER")]
    pub server: String,

    /// SSH server port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Login name on the SSH server (overrides user@ in SERVER)
    #[arg(short = 'l', long = "login", value_name = "USER")]
    pub login: Option<String>,

    /// Private key file used for authentication
    #[arg(short = 'i', long = "identity", value_name = "FILE")]
    pub identity: Option<PathBuf>,

    /// Prompt for a password instead of using a key
    #[arg(long, conflicts_with = "identity")]
    pub password: bool,

    /// known_hosts file used to verify the server key (default: ~/.ssh/known_hosts)
    #[arg(long, value_name = "FILE", conflicts_with = "insecure")]
    pub known_hosts: Option<PathBuf>,

    /// Accept any server host key
    #[arg(long)]
    pub insecure: bool,

    /// Local listen address, as [HOST:]PORT (default: 127.0.0.1 and the SSH port)
    #[arg(short = 'L', long = "local", value_name = "[HOST:]PORT")]
    pub local: Option<String>,

    /// Originator address announced to the SSH server, as HOST:PORT
    #[arg(long = "src", value_name = "HOST:PORT")]
    pub src: Option<String>,

    /// Seconds between SSH keepalive messages
    #[arg(long, value_name = "SECONDS")]
    pub keepalive: Option<u64>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Login name from `-l`, else from `user@` in the server argument.
    pub fn username(&self) -> Option<String> {
        self.login
            .clone()
            .or_else(|| split_user_host(&self.server).0.map(str::to_string))
    }

    /// Build the tunnel settings. `password` is used only with `--password`.
    pub fn to_config(&self, password: Option<&str>) -> Result<PartialTunnelConfig> {
        let (_, host) = split_user_host(&self.server);
        if host.is_empty() {
            bail!("Invalid server '{}': missing host", self.server);
        }

        let (dst_host, dst_port) = parse_host_port(&self.target)
            .with_context(|| format!("Invalid destination '{}'", self.target))?;

        let mut config = PartialTunnelConfig::new()
            .with_host(host)
            .with_destination(dst_host, dst_port);

        if let Some(port) = self.port {
            config = config.with_port(port);
        }
        if let Some(username) = self.username() {
            config = config.with_username(username);
        }

        if let Some(local) = &self.local {
            let (local_host, local_port) = parse_bind(local)
                .with_context(|| format!("Invalid local address '{local}'"))?;
            config = match local_host {
                Some(local_host) => config.with_local(local_host, local_port),
                None => config.with_local_port(local_port),
            };
        }

        if let Some(src) = &self.src {
            let (src_host, src_port) =
                parse_host_port(src).with_context(|| format!("Invalid source '{src}'"))?;
            config = config.with_source(src_host, src_port);
        }

        if self.password {
            let password =
                password.context("Password authentication requested but no password given")?;
            config = config.with_auth(AuthMethod::with_password(password));
        } else if let Some(identity) = &self.identity {
            config = config.with_auth(AuthMethod::with_key_file(identity, None));
        }

        if self.insecure {
            config = config.with_server_check(ServerCheckMethod::NoCheck);
        } else if let Some(known_hosts) = &self.known_hosts {
            config = config.with_server_check(ServerCheckMethod::with_known_hosts_file(
                &known_hosts.to_string_lossy(),
            ));
        }

        if let Some(seconds) = self.keepalive {
            config = config.with_keepalive_interval(Duration::from_secs(seconds));
        }

        Ok(config)
    }
}

/// Split `[user@]host` at the last `@`.
fn split_user_host(spec: &str) -> (Option<&str>, &str) {
    match spec.rsplit_once('@') {
        Some((user, host)) if !user.is_empty() => (Some(user), host),
        Some((_, host)) => (None, host),
        None => (None, spec),
    }
}

/// Parse `HOST:PORT`, accepting `[v6addr]:PORT`.
pub fn parse_host_port(spec: &str) -> Result<(String, u16)> {
    let (host, port) = spec
        .rsplit_once(':')
        .with_context(|| format!("Expected HOST:PORT, got '{spec}'"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        bail!("Missing host in '{spec}'");
    }
    let port = port
        .parse::<u16>()
        .with_context(|| format!("Invalid port: {port}"))?;
    Ok((host.to_string(), port))
}

/// Parse `[HOST:]PORT`.
pub fn parse_bind(spec: &str) -> Result<(Option<String>, u16)> {
    if let Ok(port) = spec.parse::<u16>() {
        return Ok((None, port));
    }
    let (host, port) = parse_host_port(spec)?;
    Ok((Some(host), port))
}
