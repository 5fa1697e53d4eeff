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

//! SSH client authentication and server host key verification settings.
//!
//! [`AuthMethod`] selects how the tunnel authenticates each session it opens;
//! [`ServerCheckMethod`] selects how the server host key is verified before
//! any credentials are sent.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use russh::client::{Handle, Handler};
use zeroize::Zeroizing;

use crate::error::SessionError;

/// How each tunnel session authenticates.
#[derive(Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum AuthMethod {
    /// The SSH `none` method, accepted by servers that need no credentials.
    #[default]
    None,
    Password(Zeroizing<String>),
    PrivateKey {
        /// entire contents of private key file
        key_data: Zeroizing<String>,
        key_pass: Option<Zeroizing<String>>,
    },
    PrivateKeyFile {
        key_file_path: PathBuf,
        key_pass: Option<Zeroizing<String>>,
    },
}

impl AuthMethod {
    pub fn with_password(password: &str) -> Self {
        Self::Password(Zeroizing::new(password.to_string()))
    }

    pub fn with_key(key: &str, passphrase: Option<&str>) -> Self {
        Self::PrivateKey {
            key_data: Zeroizing::new(key.to_string()),
            key_pass: passphrase.map(|p| Zeroizing::new(p.to_string())),
        }
    }

    pub fn with_key_file<T: AsRef<std::path::Path>>(
        key_file_path: T,
        passphrase: Option<&str>,
    ) -> Self {
        Self::PrivateKeyFile {
            key_file_path: key_file_path.as_ref().to_path_buf(),
            key_pass: passphrase.map(|p| Zeroizing::new(p.to_string())),
        }
    }

    /// Name of the SSH authentication method, as used in error messages.
    pub fn method_name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) => "password",
            AuthMethod::PrivateKey { .. } | AuthMethod::PrivateKeyFile { .. } => "publickey",
        }
    }

    /// Checks that can run before any connection is made.
    ///
    /// Inline keys are decoded here so that a malformed key fails the
    /// connection immediately instead of after the SSH handshake.
    pub fn validate(&self) -> Result<(), SessionError> {
        if let AuthMethod::PrivateKey { key_data, key_pass } = self {
            russh::keys::decode_secret_key(key_data, key_pass.as_ref().map(|p| p.as_str()))
                .map_err(SessionError::KeyInvalid)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::None => f.write_str("None"),
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::PrivateKey { key_pass, .. } => f
                .debug_struct("PrivateKey")
                .field("key_data", &"<redacted>")
                .field("has_passphrase", &key_pass.is_some())
                .finish(),
            AuthMethod::PrivateKeyFile {
                key_file_path,
                key_pass,
            } => f
                .debug_struct("PrivateKeyFile")
                .field("key_file_path", key_file_path)
                .field("has_passphrase", &key_pass.is_some())
                .finish(),
        }
    }
}

/// Server host key verification methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum ServerCheckMethod {
    /// Accept any host key (insecure, for testing only)
    NoCheck,
    /// Compare against a base64 encoded public key
    PublicKey(String),
    /// Compare against a public key file
    PublicKeyFile(String),
    /// Look the host up in ~/.ssh/known_hosts
    #[default]
    DefaultKnownHostsFile,
    /// Look the host up in the given known_hosts file
    KnownHostsFile(String),
}

impl ServerCheckMethod {
    pub fn with_public_key(key: &str) -> Self {
        Self::PublicKey(key.to_string())
    }

    pub fn with_public_key_file(key_file_name: &str) -> Self {
        Self::PublicKeyFile(key_file_name.to_string())
    }

    pub fn with_known_hosts_file(known_hosts_file: &str) -> Self {
        Self::KnownHostsFile(known_hosts_file.to_string())
    }

    /// Verify `key` presented by `hostname:port`.
    pub fn verify(
        &self,
        hostname: &str,
        port: u16,
        key: &russh::keys::PublicKey,
    ) -> Result<bool, SessionError> {
        match self {
            ServerCheckMethod::NoCheck => Ok(true),
            ServerCheckMethod::PublicKey(encoded) => {
                let expected = russh::keys::parse_public_key_base64(encoded)
                    .map_err(|_| SessionError::ServerCheckFailed)?;
                Ok(expected == *key)
            }
            ServerCheckMethod::PublicKeyFile(path) => {
                let expected = russh::keys::load_public_key(path)
                    .map_err(|_| SessionError::ServerCheckFailed)?;
                Ok(expected == *key)
            }
            ServerCheckMethod::KnownHostsFile(path) => {
                russh::keys::check_known_hosts_path(hostname, port, key, path)
                    .map_err(|_| SessionError::ServerCheckFailed)
            }
            ServerCheckMethod::DefaultKnownHostsFile => {
                russh::keys::check_known_hosts(hostname, port, key)
                    .map_err(|_| SessionError::ServerCheckFailed)
            }
        }
    }
}

/// Authenticate `username` on an established handle.
pub(crate) async fn authenticate<H: Handler>(
    handle: &mut Handle<H>,
    username: &str,
    auth: &AuthMethod,
) -> Result<(), SessionError> {
    let result = match auth {
        AuthMethod::None => handle.authenticate_none(username).await?,
        AuthMethod::Password(password) => {
            handle
                .authenticate_password(username, password.as_str())
                .await?
        }
        AuthMethod::PrivateKey { key_data, key_pass } => {
            let key =
                russh::keys::decode_secret_key(key_data, key_pass.as_ref().map(|p| p.as_str()))
                    .map_err(SessionError::KeyInvalid)?;
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
            handle
                .authenticate_publickey(
                    username,
                    russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await?
        }
        AuthMethod::PrivateKeyFile {
            key_file_path,
            key_pass,
        } => {
            let key = russh::keys::load_secret_key(
                key_file_path,
                key_pass.as_ref().map(|p| p.as_str()),
            )
            .map_err(SessionError::KeyInvalid)?;
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
            handle
                .authenticate_publickey(
                    username,
                    russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                )
                .await?
        }
    };

    if result.success() {
        Ok(())
    } else {
        Err(SessionError::AuthFailed {
            method: auth.method_name(),
        })
    }
}
