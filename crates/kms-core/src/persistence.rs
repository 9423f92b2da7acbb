//! Persistence abstraction for client activation history.
//!
//! The trait is synchronous (no async) — dispatch is a pure, in-process
//! computation and a durable store is expected to do its own internal
//! batching/async plumbing behind this boundary if it needs to.

use kms_proto::bytecodec::Filetime;
use kms_proto::Guid;
use thiserror::Error;

/// One client's activation history as the server has observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    /// Primary key: the client's machine GUID.
    pub client_machine_id: Guid,
    /// Application (product family) the client activated against.
    pub application_id: Guid,
    /// SKU GUID of the exact edition activated.
    pub sku_id: Guid,
    /// NetBIOS machine name at last activation.
    pub machine_name: String,
    /// Timestamp of the most recent accepted request.
    pub last_activation: Filetime,
    /// Number of requests observed for this client (including dropped
    /// stale ones is not counted — only accepted writes increment this).
    pub activation_count: u64,
}

/// Errors a `Persistence` implementation may report.
///
/// Per the dispatch algorithm, these are always advisory: a store failure is
/// logged by the caller and the activation response is built and sent
/// anyway.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// The underlying store is unavailable (e.g. connection lost).
    #[error("persistence store unavailable: {0}")]
    Unavailable(String),
}

/// The three-operation interface the dispatcher calls into.
///
/// Implementations must be `Send + Sync` and safe for concurrent callers —
/// one connection's task never holds any other lock across the call.
pub trait Persistence: Send + Sync + 'static {
    /// Look up a client's record by its machine ID.
    fn get(&self, client_machine_id: &Guid) -> Result<Option<ClientRecord>, PersistenceError>;

    /// Insert or update a client's record.
    ///
    /// Last-writer-wins on `last_activation`: a write whose
    /// `record.last_activation` is older than what's currently stored must
    /// be dropped (treated as a successful no-op) rather than overwriting
    /// newer data.
    fn upsert(&self, record: ClientRecord) -> Result<(), PersistenceError>;

    /// List every stored record, for an external monitoring collaborator.
    /// Order is not guaranteed.
    fn list(&self) -> Result<Vec<ClientRecord>, PersistenceError>;
}

/// In-memory `Persistence` implementation for standalone operation and
/// tests.
///
/// Thread-safe through a `Mutex`, using `lock().expect()` — acceptable here
/// since a poisoned mutex means another thread already panicked and the
/// process is going down regardless.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: std::sync::Arc<std::sync::Mutex<std::collections::HashMap<Guid, ClientRecord>>>,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct clients currently stored.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("Mutex poisoned").len()
    }

    /// Whether the store currently holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Persistence for MemoryStore {
    #[allow(clippy::expect_used)]
    fn get(&self, client_machine_id: &Guid) -> Result<Option<ClientRecord>, PersistenceError> {
        Ok(self.inner.lock().expect("Mutex poisoned").get(client_machine_id).cloned())
    }

    #[allow(clippy::expect_used)]
    fn upsert(&self, record: ClientRecord) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().expect("Mutex poisoned");
        match inner.get(&record.client_machine_id) {
            Some(existing) if existing.last_activation >= record.last_activation => {
                // Stale write; last-writer-wins means this is a silent no-op.
            }
            _ => {
                inner.insert(record.client_machine_id, record);
            }
        }
        Ok(())
    }

    #[allow(clippy::expect_used)]
    fn list(&self) -> Result<Vec<ClientRecord>, PersistenceError> {
        Ok(self.inner.lock().expect("Mutex poisoned").values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: Guid, ft: u64) -> ClientRecord {
        ClientRecord {
            client_machine_id: id,
            application_id: Guid::NIL,
            sku_id: Guid::NIL,
            machine_name: "TESTPC".to_string(),
            last_activation: Filetime(ft),
            activation_count: 1,
        }
    }

    #[test]
    fn new_store_is_empty() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.list().unwrap().len(), 0);
    }

    #[test]
    fn get_returns_none_for_unknown_client() {
        let store = MemoryStore::new();
        assert_eq!(store.get(&Guid::NIL).unwrap(), None);
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let store = MemoryStore::new();
        let id = Guid::parse("11111111-2222-3333-4444-555555555555").unwrap();
        store.upsert(record(id, 100)).unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().last_activation, Filetime(100));
    }

    #[test]
    fn stale_write_is_dropped() {
        let store = MemoryStore::new();
        let id = Guid::parse("11111111-2222-3333-4444-555555555555").unwrap();
        store.upsert(record(id, 200)).unwrap();
        store.upsert(record(id, 100)).unwrap(); // older requestTime, must be a no-op
        assert_eq!(store.get(&id).unwrap().unwrap().last_activation, Filetime(200));
    }

    #[test]
    fn newer_write_replaces_older() {
        let store = MemoryStore::new();
        let id = Guid::parse("11111111-2222-3333-4444-555555555555").unwrap();
        store.upsert(record(id, 100)).unwrap();
        store.upsert(record(id, 200)).unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().last_activation, Filetime(200));
    }

    #[test]
    fn list_reflects_multiple_clients() {
        let store = MemoryStore::new();
        let a = Guid::parse("11111111-2222-3333-4444-555555555555").unwrap();
        let b = Guid::parse("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee").unwrap();
        store.upsert(record(a, 1)).unwrap();
        store.upsert(record(b, 1)).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn replaying_same_request_is_idempotent() {
        let store = MemoryStore::new();
        let id = Guid::parse("11111111-2222-3333-4444-555555555555").unwrap();
        for _ in 0..5 {
            store.upsert(record(id, 500)).unwrap();
        }
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.get(&id).unwrap().unwrap().last_activation, Filetime(500));
    }
}
