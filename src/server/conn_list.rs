//! Registry of live connections.
//!
//! The runtime owns scheduling, so the list's job is lifecycle coordination
//! and accounting: connections register on accept, deregister on destroy,
//! and a shutdown broadcast asks every live one to drain and close.

use crate::{errors::DisconnectReason, server::connection::ConnShared};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

#[derive(Default)]
pub struct ConnectionList {
    inner: Mutex<HashMap<u64, Arc<ConnShared>>>,
    next_id: AtomicU64,
}

impl ConnectionList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn register(&self, conn: Arc<ConnShared>) {
        self.inner.lock().unwrap().insert(conn.id, conn);
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.inner.lock().unwrap().remove(&id);
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests handled across all currently live connections.
    pub fn total_requests(&self) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .values()
            .map(|conn| conn.stats.requests())
            .sum()
    }

    /// Asks every live connection to close. Each aborts its queued requests
    /// and reports "server shutting down" to its destroy callback.
    pub fn shutdown(&self) {
        let conns: Vec<_> = self.inner.lock().unwrap().values().cloned().collect();
        tracing::debug!(connections = conns.len(), "shutting down connection list");
        for conn in conns {
            conn.request_close(DisconnectReason::ServerShutdown);
        }
    }
}
