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

//! SSH client side of the tunnel, powered by russh.
//!
//! - [`auth`]: authentication methods and host key verification
//! - [`client`]: the session connector traits and their russh implementation

pub mod auth;
pub mod client;

pub use auth::{AuthMethod, ServerCheckMethod};
pub use client::{ClientHandler, RemoteSession, RusshConnector, RusshSession, SessionConnector};
