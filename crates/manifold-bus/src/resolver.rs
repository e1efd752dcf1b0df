//! Dependency-resolver port and the type-map reference implementation.
//!
//! The runtime resolves user consumers, handlers and interceptor collections
//! through this port. A "collection of T" is just a registered
//! `Vec<Arc<dyn SomeInterceptor<M>>>` entry.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Resolves registered instances by type.
pub trait DependencyResolver: Send + Sync + 'static {
    /// Resolves a registered entry by type id, or `None`.
    fn resolve_any(&self, key: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;

    /// Creates a child scope seeded with the current entries.
    ///
    /// Registrations made in the child stay local to it; the scope is
    /// released when the returned handle drops.
    fn create_scope(&self) -> Arc<dyn DependencyResolver>;
}

impl dyn DependencyResolver {
    /// Typed resolution helper.
    pub fn resolve<C: Send + Sync + 'static>(&self) -> Option<Arc<C>> {
        self.resolve_any(TypeId::of::<C>())
            .and_then(|entry| entry.downcast::<C>().ok())
    }
}

/// Type-keyed dependency map; the reference resolver implementation.
#[derive(Default)]
pub struct TypeMap {
    entries: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl TypeMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a value under its own type.
    pub fn insert<C: Send + Sync + 'static>(&self, value: C) {
        self.entries
            .write()
            .insert(TypeId::of::<C>(), Arc::new(value));
    }

    /// Registers a shared value under its own type.
    pub fn insert_arc<C: Send + Sync + 'static>(&self, value: Arc<C>) {
        self.entries.write().insert(TypeId::of::<C>(), value);
    }

    /// Typed resolution helper for direct use in tests and wiring code.
    pub fn resolve<C: Send + Sync + 'static>(&self) -> Option<Arc<C>> {
        self.resolve_any(TypeId::of::<C>())
            .and_then(|entry| entry.downcast::<C>().ok())
    }
}

impl DependencyResolver for TypeMap {
    fn resolve_any(&self, key: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries.read().get(&key).cloned()
    }

    fn create_scope(&self) -> Arc<dyn DependencyResolver> {
        let snapshot = self.entries.read().clone();
        Arc::new(TypeMap {
            entries: RwLock::new(snapshot),
        })
    }
}

impl std::fmt::Debug for TypeMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeMap")
            .field("entries", &self.entries.read().len())
            .finish()
    }
}
