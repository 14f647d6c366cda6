//! Remote client pool.
//!
//! Remote worker processes are expensive to establish (process spawn, shell
//! tunnel, authentication), so connections are pooled by host and role and
//! shared for the life of the command. The pool is a plain value owned by
//! the controller and handed around by reference.

use crate::client::ProtocolClient;
use dashmap::DashMap;
use pgvault_common::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Which side of the copy a host plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostRole {
    /// The cluster host, where source files are read.
    Db,
    /// The repository host, where artifacts are written.
    Repo,
}

/// Pool key: one connection per (host, role).
pub type PoolKey = (String, HostRole);

#[derive(Default)]
pub struct RemoteClientPool {
    clients: DashMap<PoolKey, Arc<Mutex<ProtocolClient>>>,
}

impl RemoteClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the pooled client for a host/role, connecting with `connect`
    /// when none exists yet.
    pub async fn acquire<F, Fut>(
        &self,
        host_id: &str,
        role: HostRole,
        connect: F,
    ) -> Result<Arc<Mutex<ProtocolClient>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProtocolClient>>,
    {
        let key = (host_id.to_string(), role);

        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        debug!(host = host_id, ?role, "establishing remote connection");
        let client = Arc::new(Mutex::new(connect().await?));

        // A concurrent connect may have won the race; keep the first.
        Ok(self
            .clients
            .entry(key)
            .or_insert_with(|| client.clone())
            .clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Ask every pooled connection to shut down, then drop them.
    pub async fn shutdown(&self) {
        let keys: Vec<PoolKey> = self.clients.iter().map(|e| e.key().clone()).collect();

        for key in keys {
            if let Some((_, client)) = self.clients.remove(&key) {
                client.lock().await.shutdown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::duplex;

    fn dummy_client() -> ProtocolClient {
        let (io, _keep) = duplex(64);
        let (read, write) = tokio::io::split(io);
        // The unused half leaks intentionally; these clients never speak.
        std::mem::forget(_keep);
        ProtocolClient::new(read, write, Duration::from_secs(1), "dummy")
    }

    #[tokio::test]
    async fn test_acquire_reuses_connection() {
        let pool = RemoteClientPool::new();
        let connects = AtomicUsize::new(0);

        for _ in 0..3 {
            pool.acquire("db1", HostRole::Db, || async {
                connects.fetch_add(1, Ordering::SeqCst);
                Ok(dummy_client())
            })
            .await
            .unwrap();
        }

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_keys_by_host_and_role() {
        let pool = RemoteClientPool::new();

        for (host, role) in
            [("db1", HostRole::Db), ("db1", HostRole::Repo), ("db2", HostRole::Db)]
        {
            pool.acquire(host, role, || async { Ok(dummy_client()) }).await.unwrap();
        }

        assert_eq!(pool.len(), 3);
    }
}
