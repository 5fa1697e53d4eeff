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

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use zeroize::Zeroizing;

use ssh_tunnel::{cli::Cli, utils::init_logging, SshTunnel, TunnelEvent};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let password = if cli.password {
        let prompt = match cli.username() {
            Some(user) => format!("{user}@{}'s password: ", cli.server),
            None => format!("{}'s password: ", cli.server),
        };
        Some(Zeroizing::new(
            rpassword::prompt_password(prompt).context("Failed to read password")?,
        ))
    } else {
        None
    };

    let mut config = cli.to_config(password.as_ref().map(|p| p.as_str()))?;
    if config.username.is_none() {
        config.username = std::env::var("USER").ok();
    }

    let tunnel = SshTunnel::new(config);
    let mut events = tunnel.subscribe();
    tunnel.listen().await.context("Failed to start tunnel")?;

    let local = tunnel.config();
    eprintln!(
        "Forwarding {}:{} → {} (Ctrl-C to stop)",
        local.local_host,
        local.local_port,
        local.destination()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Interrupted, closing tunnel");
                break;
            }
            event = events.recv() => match event {
                Ok(TunnelEvent::Error(err)) => tracing::warn!("{}", err),
                Ok(event) => tracing::info!("{}", event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} tunnel events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    tunnel.close().await.context("Failed to close tunnel")?;
    Ok(())
}
