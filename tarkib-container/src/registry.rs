//! Factory records and the copy-on-write service registry.
//!
//! The registry maps [`ServiceKey`] to ordered lists of [`Factory`]
//! registrations. Mutation never touches the table in place: a new
//! [`Snapshot`] is built and swapped, so readers pin one consistent view
//! for the whole duration of a resolution and never observe a
//! half-updated table.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::key::ServiceKey;
use crate::resolver::{Request, ResolveContext};
use crate::reuse::Reuse;
use crate::scope::Dispose;

/// Unique identifier of one registration, assigned at factory creation.
///
/// Caches are keyed by factory id (arena-style) so factories, scopes and
/// caches never hold direct references to each other.
pub type FactoryId = u64;

/// A constructed service instance, type-erased and shareable.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// The error type factory closures may fail with.
///
/// Container errors from nested `ctx.resolve()` calls convert into it with
/// `?`; so does any custom construction error.
pub type FactoryError = Box<dyn StdError + Send + Sync>;

/// Result type for factory closures.
pub type FactoryResult<T> = std::result::Result<T, FactoryError>;

/// Type-erased construction closure.
///
/// # Why `Arc` and not `Box`?
/// Factories are shared between threads and referenced from plans and
/// snapshots; `Arc` clones without copying the closure.
pub type FactoryFn =
    Arc<dyn Fn(&ResolveContext<'_>) -> FactoryResult<Instance> + Send + Sync>;

pub(crate) type ConditionFn = Arc<dyn Fn(&Request) -> bool + Send + Sync>;
pub(crate) type DisposerFn = Arc<dyn Fn(&Instance) + Send + Sync>;

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

/// An immutable recipe for producing one service instance.
///
/// Created at registration time and never mutated afterwards; plans and
/// scope caches refer to it by [`FactoryId`].
///
/// # Examples
/// ```
/// use tarkib_container::registry::Factory;
/// use tarkib_container::reuse::Reuse;
///
/// struct Config { url: String }
///
/// let factory = Factory::of::<Config>(|_| {
///     Ok(Config { url: "postgres://localhost".into() })
/// })
/// .with_reuse(Reuse::Singleton);
/// assert!(factory.reuse().is_singleton());
/// ```
#[derive(Clone)]
pub struct Factory {
    id: FactoryId,
    impl_name: &'static str,
    make: FactoryFn,
    reuse: Reuse,
    dependencies: Vec<ServiceKey>,
    condition: Option<ConditionFn>,
    metadata: Option<Arc<dyn Any + Send + Sync>>,
    disposer: Option<DisposerFn>,
}

impl Factory {
    /// Creates a factory from a typed construction closure.
    ///
    /// The closure receives a [`ResolveContext`] to resolve its own
    /// dependencies. Default reuse is [`Reuse::Transient`].
    pub fn of<T: Send + Sync + 'static>(
        make: impl Fn(&ResolveContext<'_>) -> FactoryResult<T> + Send + Sync + 'static,
    ) -> Self {
        Self::erased(
            type_name::<T>(),
            Arc::new(move |ctx: &ResolveContext<'_>| {
                Ok(Arc::new(make(ctx)?) as Instance)
            }),
        )
    }

    /// Wraps an already-built value; every resolution yields the same
    /// shared instance. Covers "register an instance" with zero
    /// dependencies.
    pub fn instance<T: Send + Sync + 'static>(value: T) -> Self {
        let shared: Instance = Arc::new(value);
        Self::erased(
            type_name::<T>(),
            Arc::new(move |_: &ResolveContext<'_>| Ok(shared.clone())),
        )
        .with_reuse(Reuse::Singleton)
    }

    /// Creates a factory from a pre-erased closure.
    ///
    /// Prefer [`Factory::of`]; this exists for registration sources that
    /// already work with erased instances.
    pub fn erased(impl_name: &'static str, make: FactoryFn) -> Self {
        Self {
            id: NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed),
            impl_name,
            make,
            reuse: Reuse::Transient,
            dependencies: Vec::new(),
            condition: None,
            metadata: None,
            disposer: None,
        }
    }

    /// Sets the reuse policy.
    pub fn with_reuse(mut self, reuse: Reuse) -> Self {
        self.reuse = reuse;
        self
    }

    /// Declares the dependency list of this factory.
    ///
    /// Used by registry verification and error context; the construction
    /// closure is still the authority on what actually gets resolved.
    pub fn with_dependencies(mut self, dependencies: Vec<ServiceKey>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Restricts this candidate to requests satisfying the predicate.
    pub fn with_condition(
        mut self,
        condition: impl Fn(&Request) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Attaches opaque metadata, retrievable through [`Factory::metadata`].
    pub fn with_metadata<M: Send + Sync + 'static>(mut self, metadata: M) -> Self {
        self.metadata = Some(Arc::new(metadata));
        self
    }

    /// Marks produced instances as disposable.
    ///
    /// Every instance this factory creates is pushed onto the disposal
    /// stack of its owning scope and receives [`Dispose::dispose`] when
    /// that scope is disposed, in reverse construction order. `T` must be
    /// the same type the factory produces.
    pub fn dispose_with<T: Dispose + Send + Sync + 'static>(mut self) -> Self {
        self.disposer = Some(Arc::new(|instance: &Instance| {
            if let Ok(typed) = instance.clone().downcast::<T>() {
                typed.dispose();
            }
        }));
        self
    }

    /// The unique id of this registration.
    #[inline]
    pub fn id(&self) -> FactoryId {
        self.id
    }

    /// The implementation type name (for diagnostics).
    #[inline]
    pub fn impl_name(&self) -> &'static str {
        self.impl_name
    }

    /// The reuse policy.
    #[inline]
    pub fn reuse(&self) -> Reuse {
        self.reuse
    }

    /// The declared dependency list.
    #[inline]
    pub fn dependencies(&self) -> &[ServiceKey] {
        &self.dependencies
    }

    /// The attached metadata, if any.
    #[inline]
    pub fn metadata(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.metadata.as_ref()
    }

    /// Whether this candidate accepts the request.
    pub(crate) fn accepts(&self, request: &Request) -> bool {
        match &self.condition {
            Some(condition) => condition(request),
            None => true,
        }
    }

    pub(crate) fn call(&self, ctx: &ResolveContext<'_>) -> FactoryResult<Instance> {
        (self.make)(ctx)
    }

    pub(crate) fn disposer(&self) -> Option<&DisposerFn> {
        self.disposer.as_ref()
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Factory")
            .field("id", &self.id)
            .field("impl", &self.impl_name)
            .field("reuse", &self.reuse)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

// ============================================================
// Snapshot
// ============================================================

/// One immutable, versioned view of the registration table.
///
/// In-flight resolutions keep the snapshot valid at resolution start even
/// while registrations change underneath.
pub(crate) struct Snapshot {
    version: u64,
    entries: HashMap<ServiceKey, Vec<Arc<Factory>>>,
    // Keys per service type, in first-registration order; backs "resolve many".
    by_type: HashMap<TypeId, Vec<ServiceKey>>,
}

impl Snapshot {
    fn empty(version: u64) -> Self {
        Self {
            version,
            entries: HashMap::new(),
            by_type: HashMap::new(),
        }
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Factories registered for the exact key, registration-ordered.
    /// The last one is the implicit default.
    pub fn lookup(&self, key: &ServiceKey) -> &[Arc<Factory>] {
        self.entries.get(key).map_or(&[], Vec::as_slice)
    }

    /// Every key registered for the service type (default and keyed),
    /// in first-registration order.
    pub fn keys_for_type(&self, type_id: TypeId) -> &[ServiceKey] {
        self.by_type.get(&type_id).map_or(&[], Vec::as_slice)
    }

    pub fn registered_keys(&self) -> impl Iterator<Item = &ServiceKey> {
        self.entries.keys()
    }

    pub fn all_entries(&self) -> impl Iterator<Item = (&ServiceKey, &[Arc<Factory>])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version)
            .field("entries", &self.entries.len())
            .finish()
    }
}

// ============================================================
// Registry
// ============================================================

/// Copy-on-write registration table.
///
/// Readers clone the current [`Snapshot`] handle under a momentary read
/// lock; writers rebuild the table outside the lock and swap the pointer,
/// so lookups never wait on table construction.
pub(crate) struct Registry {
    current: RwLock<Arc<Snapshot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::empty(1))),
        }
    }

    /// Pins the current view; O(1).
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Appends a factory under the key. Never fails: a newer unkeyed
    /// registration becomes the default while older ones stay resolvable
    /// through "resolve many".
    pub fn register(&self, key: ServiceKey, factory: Factory) -> FactoryId {
        let factory = Arc::new(factory);
        let id = factory.id();
        debug!(key = %key, id, reuse = %factory.reuse(), "Registered service");

        self.swap(|next| {
            next.entries.entry(key.clone()).or_default().push(factory.clone());
            let keys = next.by_type.entry(key.type_id()).or_default();
            if !keys.contains(&key) {
                keys.push(key.clone());
            }
        });
        id
    }

    /// Removes one factory (by id) or the whole entry for the key.
    pub fn unregister(&self, key: &ServiceKey, id: Option<FactoryId>) {
        debug!(key = %key, ?id, "Unregistered service");

        self.swap(|next| {
            let emptied = match next.entries.get_mut(key) {
                Some(factories) => {
                    match id {
                        Some(id) => factories.retain(|f| f.id() != id),
                        None => factories.clear(),
                    }
                    factories.is_empty()
                }
                None => false,
            };
            if emptied {
                next.entries.remove(key);
                if let Some(keys) = next.by_type.get_mut(&key.type_id()) {
                    keys.retain(|k| k != key);
                    if keys.is_empty() {
                        next.by_type.remove(&key.type_id());
                    }
                }
            }
        });
    }

    /// Drops every registration (container disposal).
    pub fn clear(&self) {
        self.swap(|next| {
            next.entries.clear();
            next.by_type.clear();
        });
    }

    /// Builds the successor snapshot outside the lock, then swaps it in.
    /// Retries when a concurrent writer got there first.
    fn swap(&self, mutate: impl Fn(&mut Snapshot)) {
        loop {
            let pinned = self.snapshot();
            let mut next = Snapshot {
                version: pinned.version + 1,
                entries: pinned.entries.clone(),
                by_type: pinned.by_type.clone(),
            };
            mutate(&mut next);

            let mut guard = self.current.write();
            if guard.version == pinned.version {
                *guard = Arc::new(next);
                trace!(version = pinned.version + 1, "Registry snapshot swapped");
                return;
            }
            // Lost the race against another writer; rebuild on the fresh view.
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
