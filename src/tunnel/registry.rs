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

//! Registry of live tunnelled connections.
//!
//! Every accepted socket is registered before its SSH session is started, so
//! that [`ConnectionRegistry::close_all_and_wait`] can abort connections that
//! are still in the middle of their handshake.
//!
//! Each entry carries two cancellation tokens:
//!
//! - `abort`: fired by the registry to ask the connection task to destroy
//!   its socket.
//! - `closed`: fired exactly once by the connection task (through the
//!   [`Registration`] guard) after its socket is gone and its session ended.
//!
//! A fired token stays fired, so a connection that closes on its own while
//! `close_all_and_wait` is running is still awaited exactly once.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// Unique identifier for a tunnelled connection
pub type ConnectionId = Uuid;

#[derive(Debug, Clone)]
struct Entry {
    peer: SocketAddr,
    abort: CancellationToken,
    closed: CancellationToken,
}

/// Shared set of open local connections.
///
/// Cloning is cheap and yields a handle to the same set.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<Mutex<HashMap<ConnectionId, Entry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
        // Entries stay consistent even if a holder panicked mid-operation.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a newly accepted connection.
    ///
    /// The returned guard deregisters the connection and signals its closure
    /// when dropped.
    pub fn add(&self, peer: SocketAddr) -> Registration {
        let id = Uuid::new_v4();
        let entry = Entry {
            peer,
            abort: CancellationToken::new(),
            closed: CancellationToken::new(),
        };
        let registration = Registration {
            id,
            abort: entry.abort.clone(),
            closed: entry.closed.clone(),
            registry: self.clone(),
        };

        self.lock().insert(id, entry);
        trace!("Registered connection {} from {}", id, peer);
        registration
    }

    /// Stop tracking a connection. Returns whether it was tracked.
    pub fn remove(&self, id: ConnectionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Visit every tracked connection.
    ///
    /// Runs over a snapshot, so `f` may call back into the registry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(ConnectionId, SocketAddr),
    {
        let snapshot: Vec<(ConnectionId, SocketAddr)> = self
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.peer))
            .collect();

        for (id, peer) in snapshot {
            f(id, peer);
        }
    }

    /// Ask every tracked connection to close without waiting for it.
    pub fn abort_all(&self) {
        for entry in self.lock().values() {
            entry.abort.cancel();
        }
    }

    /// Abort every tracked connection and wait until each has closed.
    ///
    /// Resolves immediately when nothing is tracked. There is no timeout: a
    /// connection task that never finishes keeps this future pending.
    pub async fn close_all_and_wait(&self) {
        let snapshot: Vec<(ConnectionId, Entry)> = self
            .lock()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();

        if snapshot.is_empty() {
            return;
        }

        debug!("Closing {} open connection(s)", snapshot.len());
        for (_, entry) in &snapshot {
            entry.abort.cancel();
        }

        futures::future::join_all(snapshot.iter().map(|(_, entry)| entry.closed.cancelled()))
            .await;

        let mut entries = self.lock();
        for (id, _) in &snapshot {
            entries.remove(id);
        }
    }
}

/// Ownership of one registry entry, held by the connection task.
#[derive(Debug)]
pub struct Registration {
    id: ConnectionId,
    abort: CancellationToken,
    closed: CancellationToken,
    registry: ConnectionRegistry,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Token fired when the registry asks this connection to close.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        self.closed.cancel();
        trace!("Connection {} deregistered", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_close_all_empty_resolves() {
        let registry = ConnectionRegistry::new();
        timeout(Duration::from_secs(1), registry.close_all_and_wait())
            .await
            .expect("empty registry should close immediately");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registration_drop_removes_entry() {
        let registry = ConnectionRegistry::new();
        let first = registry.add(peer(1000));
        let second = registry.add(peer(1001));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(first.id()));

        let id = first.id();
        drop(first);
        assert!(!registry.contains(id));
        assert_eq!(registry.len(), 1);

        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_for_each_visits_snapshot() {
        let registry = ConnectionRegistry::new();
        let _a = registry.add(peer(2000));
        let _b = registry.add(peer(2001));

        let mut ports = Vec::new();
        registry.for_each(|_, addr| {
            ports.push(addr.port());
            // re-entrant access must not deadlock
            assert_eq!(registry.len(), 2);
        });
        ports.sort_unstable();
        assert_eq!(ports, vec![2000, 2001]);
    }

    #[tokio::test]
    async fn test_close_all_aborts_and_waits() {
        let registry = ConnectionRegistry::new();
        let mut tasks = Vec::new();

        for port in 3000..3003 {
            let registration = registry.add(peer(port));
            tasks.push(tokio::spawn(async move {
                registration.abort_token().cancelled().await;
                // simulate socket teardown taking a moment
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(registration);
            }));
        }

        timeout(Duration::from_secs(2), registry.close_all_and_wait())
            .await
            .expect("close_all_and_wait should finish");
        assert!(registry.is_empty());

        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_all_with_concurrent_self_close() {
        let registry = ConnectionRegistry::new();

        // closes on its own regardless of the abort signal
        let self_closing = registry.add(peer(4000));
        let self_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            drop(self_closing);
        });

        let aborted = registry.add(peer(4001));
        let aborted_task = tokio::spawn(async move {
            aborted.abort_token().cancelled().await;
            assert!(aborted.abort_token().is_cancelled());
            drop(aborted);
        });

        timeout(Duration::from_secs(2), registry.close_all_and_wait())
            .await
            .expect("close_all_and_wait should finish");

        self_task.await.unwrap();
        aborted_task.await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_waits_for_slow_connection() {
        let registry = ConnectionRegistry::new();
        let registration = registry.add(peer(5000));

        let closer = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.close_all_and_wait().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registration.abort_token().is_cancelled());
        assert!(!closer.is_finished());

        drop(registration);
        timeout(Duration::from_secs(1), closer)
            .await
            .expect("close should resolve once the connection closed")
            .unwrap();
    }
}
