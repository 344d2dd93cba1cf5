//! Object reference registry
//!
//! Maps ids handed to the peer to the live local objects behind them. One mutex
//! guards the whole table so registration and release stay atomic with respect
//! to reference counts, whichever connection touches them.

use objbridge_core::{BridgeError, ObjectId, Result};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// A local object exposed to the peer
pub type ObjectHandle = Arc<dyn Any + Send + Sync>;

/// Identifies one connection for registry scoping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifetime an entry is tied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Lives until the gateway shuts down; ignores release
    Gateway,
    /// Pruned when the connection that introduced it closes
    Connection(ConnectionId),
}

struct Entry {
    object: ObjectHandle,
    refcount: usize,
    scope: Scope,
    identity: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ObjectId, Entry>,
    by_identity: HashMap<(Scope, usize), ObjectId>,
    by_connection: HashMap<ConnectionId, HashSet<ObjectId>>,
    /// Scopes opened and not yet closed
    open: HashSet<ConnectionId>,
    next_id: u64,
    /// Set by `clear`; no registrations are accepted afterwards
    cleared: bool,
}

impl Inner {
    fn remove(&mut self, id: &ObjectId) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        self.by_identity.remove(&(entry.scope, entry.identity));
        if let Scope::Connection(conn) = entry.scope {
            if let Some(ids) = self.by_connection.get_mut(&conn) {
                ids.remove(id);
            }
        }
        Some(entry)
    }
}

/// Registry of objects visible to the peer
pub struct Registry {
    inner: Mutex<Inner>,
    next_connection: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Default::default()
            }),
            next_connection: AtomicU64::new(1),
        }
    }

    // A panic while holding the lock cannot leave an entry half-written, so
    // poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a scope for a new connection
    pub fn open_scope(&self) -> ConnectionId {
        let conn = ConnectionId(self.next_connection.fetch_add(1, Ordering::SeqCst));
        self.lock().open.insert(conn);
        conn
    }

    /// Register the application root under the well-known id `"0"`
    pub fn register_entry_point(&self, object: ObjectHandle) -> ObjectId {
        let id = ObjectId::entry_point();
        let identity = identity_of(&object);
        let mut inner = self.lock();
        if let Some(previous) = inner.remove(&id) {
            debug!("Replacing entry point (was {:p})", previous.object);
        }
        inner.by_identity.insert((Scope::Gateway, identity), id.clone());
        inner.entries.insert(
            id.clone(),
            Entry {
                object,
                refcount: 1,
                scope: Scope::Gateway,
                identity,
            },
        );
        id
    }

    /// Register an object, reusing its id if the same instance is already known
    ///
    /// Re-registering adds one reference; objects pinned at gateway scope keep
    /// their gateway id and are not counted. Fails once the registry has been
    /// cleared or when `scope` belongs to a connection that already closed.
    pub fn register(&self, object: ObjectHandle, scope: Scope) -> Result<ObjectId> {
        let identity = identity_of(&object);
        let mut inner = self.lock();

        if inner.cleared {
            return Err(BridgeError::Shutdown);
        }
        if let Scope::Connection(conn) = scope {
            if !inner.open.contains(&conn) {
                return Err(BridgeError::ConnectionLost(format!("{} is closed", conn)));
            }
        }

        if let Some(id) = inner.by_identity.get(&(Scope::Gateway, identity)).cloned() {
            return Ok(id);
        }

        if let Some(id) = inner.by_identity.get(&(scope, identity)).cloned() {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.refcount += 1;
            }
            return Ok(id);
        }

        let id = ObjectId::from(inner.next_id);
        inner.next_id += 1;
        inner.by_identity.insert((scope, identity), id.clone());
        if let Scope::Connection(conn) = scope {
            inner.by_connection.entry(conn).or_default().insert(id.clone());
        }
        inner.entries.insert(
            id.clone(),
            Entry {
                object,
                refcount: 1,
                scope,
                identity,
            },
        );
        Ok(id)
    }

    /// Look up a live object
    pub fn resolve(&self, id: &ObjectId) -> Result<ObjectHandle> {
        self.lock()
            .entries
            .get(id)
            .map(|entry| entry.object.clone())
            .ok_or_else(|| BridgeError::UnknownReference(id.clone()))
    }

    /// Drop one reference; unknown ids and gateway-scoped entries are ignored
    pub fn release(&self, id: &ObjectId) {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(id) else {
            return;
        };
        if entry.scope == Scope::Gateway {
            return;
        }
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            inner.remove(id);
            debug!("Released object {}", id);
        }
    }

    /// Prune everything a closed connection introduced; returns how many entries went
    pub fn close_scope(&self, conn: ConnectionId) -> usize {
        let mut inner = self.lock();
        inner.open.remove(&conn);
        let ids = inner.by_connection.remove(&conn).unwrap_or_default();
        let pruned = ids.iter().filter(|id| inner.remove(id).is_some()).count();
        if pruned > 0 {
            debug!("Pruned {} objects introduced by {}", pruned, conn);
        }
        pruned
    }

    /// Remove every entry, entry point included, and refuse later registrations
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.by_identity.clear();
        inner.by_connection.clear();
        inner.open.clear();
        inner.cleared = true;
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Current reference count of an entry
    pub fn refcount(&self, id: &ObjectId) -> Option<usize> {
        self.lock().entries.get(id).map(|entry| entry.refcount)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Address of the shared allocation; stable while the registry holds a clone
fn identity_of(object: &ObjectHandle) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(value: i32) -> ObjectHandle {
        Arc::new(value)
    }

    #[test]
    fn test_same_instance_gets_same_id() {
        let registry = Registry::new();
        let scope = Scope::Connection(registry.open_scope());
        let obj = object(1);

        let first = registry.register(obj.clone(), scope).unwrap();
        let second = registry.register(obj, scope).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.refcount(&first), Some(2));

        // Equal value, different instance
        let third = registry.register(object(1), scope).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn test_ids_start_after_entry_point() {
        let registry = Registry::new();
        let root = registry.register_entry_point(object(0));
        assert_eq!(root.as_str(), "0");
        let scope = Scope::Connection(registry.open_scope());
        assert_eq!(registry.register(object(1), scope).unwrap().as_str(), "1");
        assert_eq!(registry.register(object(2), scope).unwrap().as_str(), "2");
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = Registry::new();
        let scope = Scope::Connection(registry.open_scope());
        let id = registry.register(object(5), scope).unwrap();

        registry.release(&id);
        assert!(matches!(
            registry.resolve(&id),
            Err(BridgeError::UnknownReference(_))
        ));
        registry.release(&id);
        registry.release(&ObjectId::from("never-issued"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_refcount_keeps_entry_until_last_release() {
        let registry = Registry::new();
        let scope = Scope::Connection(registry.open_scope());
        let obj = object(9);
        let id = registry.register(obj.clone(), scope).unwrap();
        registry.register(obj, scope).unwrap();

        registry.release(&id);
        assert!(registry.resolve(&id).is_ok());
        registry.release(&id);
        assert!(registry.resolve(&id).is_err());
    }

    #[test]
    fn test_entry_point_survives_release() {
        let registry = Registry::new();
        let root_obj = object(0);
        let root = registry.register_entry_point(root_obj.clone());
        registry.release(&root);
        assert!(registry.resolve(&root).is_ok());

        // Returning the root from a call does not mint a second id
        let scope = Scope::Connection(registry.open_scope());
        assert_eq!(registry.register(root_obj, scope).unwrap(), root);
    }

    #[test]
    fn test_close_scope_prunes_only_that_connection() {
        let registry = Registry::new();
        let a = registry.open_scope();
        let b = registry.open_scope();
        let from_a = registry.register(object(1), Scope::Connection(a)).unwrap();
        let from_b = registry.register(object(2), Scope::Connection(b)).unwrap();

        assert_eq!(registry.close_scope(a), 1);
        assert!(registry.resolve(&from_a).is_err());
        assert!(registry.resolve(&from_b).is_ok());
        assert_eq!(registry.close_scope(a), 0);
    }

    #[test]
    fn test_scopes_deduplicate_independently() {
        let registry = Registry::new();
        let a = Scope::Connection(registry.open_scope());
        let b = Scope::Connection(registry.open_scope());
        let obj = object(3);
        let id_a = registry.register(obj.clone(), a).unwrap();
        let id_b = registry.register(obj, b).unwrap();
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn test_concurrent_registration_is_consistent() {
        let registry = Arc::new(Registry::new());
        let shared = object(42);
        let scope = Scope::Connection(registry.open_scope());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let shared = shared.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| registry.register(shared.clone(), scope).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: HashSet<ObjectId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(ids.len(), 1);
        let id = ids.into_iter().next().unwrap();
        assert_eq!(registry.refcount(&id), Some(800));
    }

    #[test]
    fn test_closed_scope_and_cleared_registry_refuse_registration() {
        let registry = Registry::new();
        let conn = registry.open_scope();
        registry.close_scope(conn);
        assert!(matches!(
            registry.register(object(1), Scope::Connection(conn)),
            Err(BridgeError::ConnectionLost(_))
        ));
        assert!(registry.is_empty());

        let live = Scope::Connection(registry.open_scope());
        registry.register(object(2), live).unwrap();
        registry.clear();
        assert!(matches!(
            registry.register(object(3), live),
            Err(BridgeError::Shutdown)
        ));
        assert!(matches!(
            registry.register(object(4), Scope::Gateway),
            Err(BridgeError::Shutdown)
        ));
        assert!(registry.is_empty());
    }
}
