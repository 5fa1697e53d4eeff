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

use tracing_subscriber::EnvFilter;

/// Create an environment filter based on verbosity level
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        // RUST_LOG wins, so russh internals can be inspected directly
        EnvFilter::from_default_env()
    } else {
        match verbosity {
            0 => EnvFilter::new("ssh_tunnel=warn"),
            1 => EnvFilter::new("ssh_tunnel=info"),
            // -vv: include russh handshake and channel logs
            2 => EnvFilter::new("ssh_tunnel=debug,russh=debug"),
            _ => EnvFilter::new("ssh_tunnel=trace,russh=trace"),
        }
    }
}

/// Initialize console logging on stderr.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging(verbosity: u8) {
    let filter = create_env_filter(verbosity);

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
