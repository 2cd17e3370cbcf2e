//! Runtime scopes — lifetime containers for reused instances.
//!
//! A [`Scope`] is a node in a tree of lifetime contexts. It owns a cache of
//! already-created reused instances (keyed by factory id) and an ordered
//! disposal stack. Disposing a scope releases its instances in reverse
//! construction order and is idempotent.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{ContainerError, Result, ScopeDisposedError};
use crate::registry::{DisposerFn, Factory, FactoryId, Instance};

/// Conventional name of the root scope when the implicit-root-scope rule
/// makes the container itself behave as an open scope.
pub const ROOT_SCOPE_NAME: &str = "root";

/// Cleanup contract for instances owned by a scope.
///
/// Register it per factory with
/// [`Factory::dispose_with`](crate::registry::Factory::dispose_with);
/// the owning scope calls [`Dispose::dispose`] exactly once per instance,
/// in reverse construction order, when the scope is disposed.
pub trait Dispose {
    fn dispose(&self);
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// A node in the scope tree.
///
/// Parents are held weakly: the tree never forms ownership cycles, and a
/// chain walk simply ends at a scope whose parent is gone.
pub struct Scope {
    id: u64,
    name: Option<&'static str>,
    parent: Option<Weak<Scope>>,
    // One cell per factory id; the map lock is never held across construction,
    // the cell guarantees at-most-once creation under racing resolvers.
    slots: Mutex<HashMap<FactoryId, Arc<OnceCell<Instance>>>>,
    disposables: Mutex<Vec<(Instance, DisposerFn)>>,
    disposed: AtomicBool,
}

impl Scope {
    /// Creates a root scope (no parent). The root always exists for a
    /// container; singleton reuse binds here.
    pub(crate) fn root(name: Option<&'static str>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            parent: None,
            slots: Mutex::new(HashMap::new()),
            disposables: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    /// Opens a child of this scope. Independent children of the same
    /// parent never interfere with each other.
    pub(crate) fn child(self: &Arc<Self>, name: Option<&'static str>) -> Arc<Self> {
        let child = Arc::new(Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            parent: Some(Arc::downgrade(self)),
            slots: Mutex::new(HashMap::new()),
            disposables: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        });
        debug!(scope = child.id, parent = self.id, name = ?name, "Opened scope");
        child
    }

    /// The scope's name, if it was opened with one.
    #[inline]
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    /// Whether [`Scope::dispose`] already ran.
    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Walks the chain from this scope outward to the nearest scope with
    /// the given name.
    pub(crate) fn find_named(self: &Arc<Self>, name: &str) -> Option<Arc<Self>> {
        let mut current = Some(Arc::clone(self));
        while let Some(scope) = current {
            if scope.name.is_some_and(|n| n == name) {
                return Some(scope);
            }
            current = scope.parent.as_ref().and_then(Weak::upgrade);
        }
        None
    }

    /// Returns the cached instance for the factory, constructing it
    /// at most once.
    ///
    /// Racing resolvers share one cell per factory id: exactly one runs the
    /// construction, both observe the same instance. A failed construction
    /// leaves the cell empty, so a later resolve may retry.
    pub(crate) fn get_or_try_create(
        &self,
        factory: &Factory,
        make: impl FnOnce() -> Result<Instance>,
    ) -> Result<Instance> {
        if self.is_disposed() {
            return Err(ContainerError::ScopeIsDisposed(ScopeDisposedError {
                scope_name: self.name,
            }));
        }

        let slot = {
            let mut slots = self.slots.lock();
            slots
                .entry(factory.id())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let mut created = false;
        let instance = slot.get_or_try_init(|| {
            trace!(scope = self.id, factory = factory.id(), "Creating scoped instance");
            created = true;
            make()
        })?;
        let instance = instance.clone();

        if created {
            if let Some(disposer) = factory.disposer() {
                self.track(instance.clone(), disposer.clone());
            }
        }
        Ok(instance)
    }

    /// Puts an instance on the disposal stack; push order is construction
    /// order, disposal runs in reverse.
    pub(crate) fn track(&self, instance: Instance, disposer: DisposerFn) {
        self.disposables.lock().push((instance, disposer));
    }

    /// Disposes every tracked instance in reverse construction order,
    /// clears the cache and marks the scope disposed.
    ///
    /// Idempotent: returns `true` only for the call that performed the
    /// disposal; later calls are no-ops.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let drained = mem::take(&mut *self.disposables.lock());
        let count = drained.len();
        for (instance, disposer) in drained.into_iter().rev() {
            disposer(&instance);
        }
        self.slots.lock().clear();

        debug!(scope = self.id, name = ?self.name, disposed = count, "Scope disposed");
        true
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
