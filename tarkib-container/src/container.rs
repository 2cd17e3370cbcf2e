//! # The Container — heart of Tarkib
//!
//! The facade composing the registry, the resolver, the plan cache and the
//! scope tree: the unit of configuration and disposal.
//!
//! # Architecture
//! ```text
//! ContainerBuilder ──build()──> Container ── register()/resolve()
//!                                  │
//!                             open_scope()
//!                                  │
//!                                  ▼
//!                           ScopedContainer ── resolve()/open_scope()/dispose()
//! ```
//!
//! # Examples
//! ```rust
//! use tarkib_container::prelude::*;
//! use std::sync::Arc;
//!
//! trait Logger: Send + Sync {
//!     fn log(&self, msg: &str);
//! }
//!
//! struct ConsoleLogger;
//! impl Logger for ConsoleLogger {
//!     fn log(&self, msg: &str) { println!("{msg}"); }
//! }
//!
//! struct UserService {
//!     logger: Arc<Arc<dyn Logger>>,
//! }
//!
//! let container = Container::new();
//! container.register_with::<Arc<dyn Logger>>(Reuse::Singleton, |_| {
//!     Ok(Arc::new(ConsoleLogger) as Arc<dyn Logger>)
//! });
//! container.register_with::<UserService>(Reuse::Transient, |ctx| {
//!     Ok(UserService { logger: ctx.resolve()? })
//! });
//!
//! let service: Arc<UserService> = container.resolve().expect("Failed to resolve");
//! service.logger.log("wired");
//! ```

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, instrument, trace};

use crate::context::ScopeContext;
use crate::error::Result;
use crate::key::ServiceKey;
use crate::plan::PlanCache;
use crate::provider::Provider;
use crate::registry::{Factory, FactoryId, FactoryResult, Registry};
use crate::resolver::{Lazy, ResolveContext, ResolveSession, downcast};
use crate::reuse::Reuse;
use crate::scope::{ROOT_SCOPE_NAME, Scope};
use crate::verify;

// ============================================================
// Rules
// ============================================================

/// Container-wide resolution rules, fixed at build time.
#[derive(Debug, Clone)]
pub(crate) struct Rules {
    /// When several candidates exist, skip those whose reuse names a scope
    /// absent from the active chain (unless a candidate is the only one).
    /// Default on; disabling makes reuse fail lazily at construction.
    pub(crate) reuse_matching_scope_filter: bool,
    /// Make the root container behave as an open scope named
    /// [`ROOT_SCOPE_NAME`], so `InCurrentScope` works at top level.
    pub(crate) implicit_root_scope: bool,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            reuse_matching_scope_filter: true,
            implicit_root_scope: false,
        }
    }
}

// ============================================================
// ContainerInner
// ============================================================

pub(crate) struct ContainerInner {
    pub(crate) registry: Registry,
    pub(crate) plans: PlanCache,
    pub(crate) rules: Rules,
    pub(crate) scope_context: Option<Arc<dyn ScopeContext>>,
    pub(crate) root_scope: Arc<Scope>,
}

impl ContainerInner {
    /// `Some(current)` when an ambient context is configured (`current`
    /// itself may be `None`); `None` when scopes are purely explicit.
    pub(crate) fn ambient_current(&self) -> Option<Option<Arc<Scope>>> {
        self.scope_context.as_ref().map(|context| context.current())
    }
}

// ============================================================
// ContainerBuilder
// ============================================================

/// Configures the rules a [`Container`] is built with.
///
/// Registration happens on the container itself (the registry is
/// copy-on-write); the builder only fixes the rules and the optional
/// ambient scope context.
pub struct ContainerBuilder {
    rules: Rules,
    scope_context: Option<Arc<dyn ScopeContext>>,
}

impl ContainerBuilder {
    fn new() -> Self {
        Self {
            rules: Rules::default(),
            scope_context: None,
        }
    }

    /// Disables the reuse-matching-scope candidate filter; scope-bound
    /// candidates are then selected normally and fail at construction
    /// time when no matching scope is open.
    pub fn without_reuse_matching_scope_filter(mut self) -> Self {
        self.rules.reuse_matching_scope_filter = false;
        self
    }

    /// Makes the root container behave as an open, disposable scope named
    /// [`ROOT_SCOPE_NAME`], so `InCurrentScope` reuse works with no
    /// explicit `open_scope` call.
    pub fn with_implicit_root_scope(mut self) -> Self {
        self.rules.implicit_root_scope = true;
        self
    }

    /// Layers an ambient scope context on top of explicit scope passing.
    /// Deferred handles then follow "whatever scope is active at
    /// invocation time".
    pub fn with_scope_context(mut self, context: impl ScopeContext + 'static) -> Self {
        self.scope_context = Some(Arc::new(context));
        self
    }

    /// Builds the container.
    #[instrument(skip(self), name = "container_build")]
    pub fn build(self) -> Container {
        let root_name = self.rules.implicit_root_scope.then_some(ROOT_SCOPE_NAME);
        info!(implicit_root = self.rules.implicit_root_scope, "Building container");
        Container {
            inner: Arc::new(ContainerInner {
                registry: Registry::new(),
                plans: PlanCache::new(),
                rules: self.rules,
                scope_context: self.scope_context,
                root_scope: Scope::root(root_name),
            }),
        }
    }
}

// ============================================================
// Container
// ============================================================

/// Thread-safe dependency injection container.
///
/// Cheap to clone; clones share the registry, the plan cache and the root
/// scope.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl Container {
    /// A container with default rules.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// A builder for non-default rules.
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    // ── Registration ──

    /// Registers a factory under a key. Never fails; a newer unkeyed
    /// registration becomes the default while older ones stay reachable
    /// through [`Container::resolve_many`].
    pub fn register(&self, key: ServiceKey, factory: Factory) -> FactoryId {
        let id = self.inner.registry.register(key, factory);
        self.inner.plans.invalidate_all();
        id
    }

    /// Registers a typed construction closure under the default key.
    pub fn register_with<T: Send + Sync + 'static>(
        &self,
        reuse: Reuse,
        make: impl Fn(&ResolveContext<'_>) -> FactoryResult<T> + Send + Sync + 'static,
    ) -> FactoryId {
        self.register(ServiceKey::of::<T>(), Factory::of::<T>(make).with_reuse(reuse))
    }

    /// Registers a typed construction closure under a key.
    pub fn register_keyed_with<T: Send + Sync + 'static>(
        &self,
        key: &'static str,
        reuse: Reuse,
        make: impl Fn(&ResolveContext<'_>) -> FactoryResult<T> + Send + Sync + 'static,
    ) -> FactoryId {
        self.register(ServiceKey::keyed::<T>(key), Factory::of::<T>(make).with_reuse(reuse))
    }

    /// Registers an already-built instance; every resolve yields the same
    /// shared value.
    pub fn register_instance<T: Send + Sync + 'static>(&self, value: T) -> FactoryId {
        self.register(ServiceKey::of::<T>(), Factory::instance(value))
    }

    /// Registers a zero-dependency construction delegate (a fresh
    /// instance per resolve).
    pub fn register_delegate<T: Send + Sync + 'static>(
        &self,
        make: impl Fn() -> FactoryResult<T> + Send + Sync + 'static,
    ) -> FactoryId {
        self.register(ServiceKey::of::<T>(), Factory::of::<T>(move |_| make()))
    }

    /// Removes one factory (by id) or every registration under the key.
    pub fn unregister(&self, key: &ServiceKey, id: Option<FactoryId>) {
        self.inner.registry.unregister(key, id);
        self.inner.plans.invalidate_all();
    }

    /// Applies a [`Provider`] module.
    pub fn add_provider(&self, provider: &dyn Provider) -> &Self {
        debug!(provider = provider.name(), "Applying provider");
        provider.register(self);
        self
    }

    // ── Resolution ──

    /// Resolves the default registration for `T`.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        let key = ServiceKey::of::<T>();
        trace!(key = %key, "Resolving");
        let instance = self.session()?.resolve_single(&key)?;
        downcast(&key, instance)
    }

    /// Resolves the registration of `T` under the given key.
    pub fn resolve_keyed<T: Send + Sync + 'static>(&self, key: &'static str) -> Result<Arc<T>> {
        let key = ServiceKey::keyed::<T>(key);
        trace!(key = %key, "Resolving");
        let instance = self.session()?.resolve_single(&key)?;
        downcast(&key, instance)
    }

    /// Resolves `T`, or returns `None` when nothing is registered.
    /// Construction failures of a found factory still propagate.
    pub fn resolve_opt<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>> {
        let key = ServiceKey::of::<T>();
        match self.session()?.resolve_optional(&key)? {
            Some(instance) => Ok(Some(downcast(&key, instance)?)),
            None => Ok(None),
        }
    }

    /// Keyed variant of [`Container::resolve_opt`].
    pub fn resolve_keyed_opt<T: Send + Sync + 'static>(
        &self,
        key: &'static str,
    ) -> Result<Option<Arc<T>>> {
        let key = ServiceKey::keyed::<T>(key);
        match self.session()?.resolve_optional(&key)? {
            Some(instance) => Ok(Some(downcast(&key, instance)?)),
            None => Ok(None),
        }
    }

    /// Resolves every registration of `T` — default and keyed — in
    /// registration order, skipping candidates excluded by conditions or
    /// by the reuse-matching-scope filter.
    pub fn resolve_many<T: Send + Sync + 'static>(&self) -> Result<Vec<Arc<T>>> {
        resolve_many_as(&self.session()?, None)
    }

    /// Like [`Container::resolve_many`], excluding candidates registered
    /// under the composite key — so a composite service never resolves
    /// itself as one of its own parts.
    pub fn resolve_many_excluding<T: Send + Sync + 'static>(
        &self,
        composite_key: &'static str,
    ) -> Result<Vec<Arc<T>>> {
        resolve_many_as(&self.session()?, Some(composite_key))
    }

    /// Returns a deferred handle to `T` instead of constructing it now.
    pub fn resolve_lazy<T: Send + Sync + 'static>(&self) -> Result<Lazy<T>> {
        let key = ServiceKey::of::<T>();
        let session = self.session()?;
        session.verify_resolvable(&key)?;
        Ok(session.make_lazy(key))
    }

    // ── Scopes ──

    /// Opens an unnamed child scope of the current one.
    pub fn open_scope(&self) -> ScopedContainer {
        self.open(None)
    }

    /// Opens a named child scope; `InCurrentNamedScope` reuse binds to the
    /// nearest scope carrying the name.
    pub fn open_named_scope(&self, name: &'static str) -> ScopedContainer {
        self.open(Some(name))
    }

    fn open(&self, name: Option<&'static str>) -> ScopedContainer {
        let parent = self
            .active_scope()
            .unwrap_or_else(|| self.inner.root_scope.clone());
        open_child(&self.inner, &parent, name)
    }

    /// The scope resolutions through this handle run against, if any:
    /// the ambient current scope, or the root under the
    /// implicit-root-scope rule.
    pub fn current_scope(&self) -> Option<Arc<Scope>> {
        self.active_scope()
    }

    // ── Lifecycle ──

    /// Disposes the root scope (reverse construction order, idempotent)
    /// and drops every registration; later resolves fail with the
    /// not-found codes.
    #[instrument(skip(self), name = "container_dispose")]
    pub fn dispose(&self) {
        if self.inner.root_scope.dispose() {
            debug!("Container disposed");
        }
        self.inner.registry.clear();
        self.inner.plans.invalidate_all();
    }

    /// Verifies the declared registration graph: missing registrations
    /// and declared cycles. Factories may resolve keys they never
    /// declared, so the resolver's runtime cycle detection stays
    /// authoritative; this catches configuration mistakes before the
    /// first resolve.
    pub fn validate(&self) -> Result<()> {
        verify::verify(&self.inner.registry.snapshot())
    }

    /// Number of registered keys.
    pub fn registration_count(&self) -> usize {
        self.inner.registry.snapshot().len()
    }

    // ── Internal ──

    fn active_scope(&self) -> Option<Arc<Scope>> {
        if let Some(context) = &self.inner.scope_context {
            return context.current();
        }
        if self.inner.rules.implicit_root_scope {
            return Some(self.inner.root_scope.clone());
        }
        None
    }

    fn session(&self) -> Result<ResolveSession> {
        ResolveSession::new(self.inner.clone(), self.active_scope())
    }
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("registered", &self.registration_count())
            .finish()
    }
}

// ============================================================
// ScopedContainer
// ============================================================

/// A handle to an open scope.
///
/// Resolutions through it run with the scope as the active one; nested
/// scopes are opened from it. Disposing the handle (explicitly or by
/// dropping it) disposes the scope's instances in reverse construction
/// order — idempotently — and restores the ambient current scope when a
/// context is configured.
pub struct ScopedContainer {
    inner: Arc<ContainerInner>,
    scope: Arc<Scope>,
    ambient_parent: Option<Arc<Scope>>,
}

fn open_child(
    inner: &Arc<ContainerInner>,
    parent: &Arc<Scope>,
    name: Option<&'static str>,
) -> ScopedContainer {
    let scope = parent.child(name);
    let ambient_parent = match &inner.scope_context {
        Some(context) => context.set_current(Some(scope.clone())),
        None => None,
    };
    ScopedContainer {
        inner: inner.clone(),
        scope,
        ambient_parent,
    }
}

impl ScopedContainer {
    /// Resolves the default registration for `T` within this scope.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        let key = ServiceKey::of::<T>();
        trace!(key = %key, scope = ?self.scope.name(), "Resolving in scope");
        let instance = self.session()?.resolve_single(&key)?;
        downcast(&key, instance)
    }

    /// Resolves the registration of `T` under the given key.
    pub fn resolve_keyed<T: Send + Sync + 'static>(&self, key: &'static str) -> Result<Arc<T>> {
        let key = ServiceKey::keyed::<T>(key);
        let instance = self.session()?.resolve_single(&key)?;
        downcast(&key, instance)
    }

    /// Resolves `T`, or returns `None` when nothing is registered.
    pub fn resolve_opt<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>> {
        let key = ServiceKey::of::<T>();
        match self.session()?.resolve_optional(&key)? {
            Some(instance) => Ok(Some(downcast(&key, instance)?)),
            None => Ok(None),
        }
    }

    /// Resolves every registration of `T` within this scope.
    pub fn resolve_many<T: Send + Sync + 'static>(&self) -> Result<Vec<Arc<T>>> {
        resolve_many_as(&self.session()?, None)
    }

    /// Scoped variant of [`Container::resolve_many_excluding`].
    pub fn resolve_many_excluding<T: Send + Sync + 'static>(
        &self,
        composite_key: &'static str,
    ) -> Result<Vec<Arc<T>>> {
        resolve_many_as(&self.session()?, Some(composite_key))
    }

    /// Returns a deferred handle bound to this scope (or to the ambient
    /// context when one is configured).
    pub fn resolve_lazy<T: Send + Sync + 'static>(&self) -> Result<Lazy<T>> {
        let key = ServiceKey::of::<T>();
        let session = self.session()?;
        session.verify_resolvable(&key)?;
        Ok(session.make_lazy(key))
    }

    /// Opens a nested unnamed scope.
    pub fn open_scope(&self) -> ScopedContainer {
        open_child(&self.inner, &self.scope, None)
    }

    /// Opens a nested named scope.
    pub fn open_named_scope(&self, name: &'static str) -> ScopedContainer {
        open_child(&self.inner, &self.scope, Some(name))
    }

    /// The underlying scope node.
    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// Disposes the scope: instances go in reverse construction order,
    /// a second call is a no-op, and resolutions through this handle
    /// fail `ScopeIsDisposed` afterwards.
    pub fn dispose(&self) {
        if self.scope.dispose() {
            if let Some(context) = &self.inner.scope_context {
                context.set_current(self.ambient_parent.clone());
            }
        }
    }

    fn session(&self) -> Result<ResolveSession> {
        ResolveSession::new(self.inner.clone(), Some(self.scope.clone()))
    }
}

impl Drop for ScopedContainer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ScopedContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedContainer")
            .field("scope", &self.scope)
            .finish()
    }
}

fn resolve_many_as<T: Send + Sync + 'static>(
    session: &ResolveSession,
    exclude_composite: Option<&'static str>,
) -> Result<Vec<Arc<T>>> {
    let key = ServiceKey::of::<T>();
    let instances = session.resolve_many(&key, exclude_composite)?;
    instances
        .into_iter()
        .map(|instance| downcast(&key, instance))
        .collect()
}

// ============================================================
// Prelude
// ============================================================

pub mod prelude {
    pub use super::{Container, ContainerBuilder, ScopedContainer};
    pub use crate::context::{ScopeContext, ThreadScopeContext};
    pub use crate::error::{ContainerError, ErrorCode, Result};
    pub use crate::key::ServiceKey;
    pub use crate::provider::Provider;
    pub use crate::registry::{Factory, FactoryResult};
    pub use crate::resolver::{Lazy, Request, RequestShape, ResolveContext};
    pub use crate::reuse::Reuse;
    pub use crate::scope::Dispose;
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ThreadScopeContext;
    use crate::error::{ContainerError, ErrorCode};
    use crate::scope::Dispose;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Debug)]
    struct Log;

    #[test]
    fn resolve_registered_instance_is_shared() {
        let container = Container::new();
        container.register_instance(42i32);

        let first: Arc<i32> = container.resolve().unwrap();
        let second: Arc<i32> = container.resolve().unwrap();
        assert_eq!(*first, 42);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn transient_creates_new_each_time() {
        let counter = Arc::new(AtomicU32::new(0));

        let container = Container::new();
        container.register_with::<u32>(Reuse::Transient, {
            let counter = counter.clone();
            move |_| Ok(counter.fetch_add(1, Ordering::SeqCst))
        });

        let a: Arc<u32> = container.resolve().unwrap();
        let b: Arc<u32> = container.resolve().unwrap();
        let c: Arc<u32> = container.resolve().unwrap();

        assert_eq!((*a, *b, *c), (0, 1, 2));
    }

    #[test]
    fn singleton_factory_called_once() {
        let counter = Arc::new(AtomicU32::new(0));

        let container = Container::new();
        container.register_with::<i32>(Reuse::Singleton, {
            let counter = counter.clone();
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        });

        let a: Arc<i32> = container.resolve().unwrap();
        let b: Arc<i32> = container.resolve().unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn singleton_is_lazy() {
        let constructed = Arc::new(AtomicBool::new(false));

        let container = Container::new();
        container.register_with::<i32>(Reuse::Singleton, {
            let constructed = constructed.clone();
            move |_| {
                constructed.store(true, Ordering::SeqCst);
                Ok(1)
            }
        });

        // Registration alone constructs nothing.
        assert!(!constructed.load(Ordering::SeqCst));
        let _ = container.resolve::<i32>().unwrap();
        assert!(constructed.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_singleton_constructs_once() {
        use std::thread;

        let constructions = Arc::new(AtomicU32::new(0));
        let container = Container::new();
        container.register_with::<String>(Reuse::Singleton, {
            let constructions = constructions.clone();
            move |_| {
                constructions.fetch_add(1, Ordering::SeqCst);
                Ok(String::from("one"))
            }
        });

        let mut handles = Vec::new();
        for _ in 0..8 {
            let container = container.clone();
            handles.push(thread::spawn(move || container.resolve::<String>().unwrap()));
        }
        let resolved: Vec<Arc<String>> =
            handles.into_iter().map(|handle| handle.join().unwrap()).collect();

        assert_eq!(constructions.load(Ordering::SeqCst), 1);
        for pair in resolved.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[test]
    fn resolve_with_dependency() {
        let container = Container::new();
        container.register_instance(String::from("postgres://localhost"));
        container.register_with::<Vec<u8>>(Reuse::Transient, |ctx| {
            let url: Arc<String> = ctx.resolve()?;
            Ok(url.as_bytes().to_vec())
        });

        let bytes: Arc<Vec<u8>> = container.resolve().unwrap();
        assert_eq!(*bytes, b"postgres://localhost");
    }

    #[test]
    fn resolve_not_registered() {
        let container = Container::new();

        let err = container.resolve::<i32>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnableToResolveDefaultService);
        match err {
            ContainerError::UnableToResolveDefault(e) => {
                assert!(e.requested.type_name().contains("i32"));
            }
            other => panic!("Expected UnableToResolveDefault, got: {other:?}"),
        }
    }

    #[test]
    fn optional_returns_absence_required_errors() {
        let container = Container::new();

        // Absence, never an error.
        assert!(container.resolve_opt::<i32>().unwrap().is_none());
        // The same request as required raises the default code.
        assert_eq!(
            container.resolve::<i32>().unwrap_err().code(),
            ErrorCode::UnableToResolveDefaultService
        );

        container.register_instance(5i32);
        assert_eq!(*container.resolve_opt::<i32>().unwrap().unwrap(), 5);
    }

    #[test]
    fn optional_propagates_construction_failure() {
        #[derive(Debug)]
        struct Faulty;

        let container = Container::new();
        container.register_with::<Faulty>(Reuse::Transient, |_| {
            Err::<Faulty, _>("boom".into())
        });

        // A found-but-failing factory is an error even for optional.
        let err = container.resolve_opt::<Faulty>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConstructionFailed);
    }

    #[test]
    fn keyed_registrations_coexist() {
        let container = Container::new();
        container.register_keyed_with::<String>("primary", Reuse::Transient, |_| {
            Ok(String::from("primary-db"))
        });
        container.register_keyed_with::<String>("replica", Reuse::Transient, |_| {
            Ok(String::from("replica-db"))
        });

        let primary: Arc<String> = container.resolve_keyed("primary").unwrap();
        assert_eq!(*primary, "primary-db");

        // A key without a registration gets the keyed code.
        let err = container.resolve_keyed::<String>("backup").unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnableToResolveKeyedService);
        // And there is no default registration either.
        let err = container.resolve::<String>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnableToResolveDefaultService);

        assert!(container.resolve_keyed_opt::<String>("backup").unwrap().is_none());
    }

    #[test]
    fn last_registered_is_default() {
        let container = Container::new();
        container.register_with::<&'static str>(Reuse::Transient, |_| Ok("first"));
        container.register_with::<&'static str>(Reuse::Transient, |_| Ok("second"));

        let resolved: Arc<&'static str> = container.resolve().unwrap();
        assert_eq!(*resolved, "second");

        // Both stay reachable through resolve_many, in registration order.
        let all: Vec<Arc<&'static str>> = container.resolve_many().unwrap();
        let values: Vec<&str> = all.iter().map(|s| **s).collect();
        assert_eq!(values, vec!["first", "second"]);
    }

    #[test]
    fn register_resolve_unregister_round_trip() {
        let container = Container::new();
        let key = ServiceKey::of::<i32>();
        let id = container.register(key.clone(), Factory::of::<i32>(|_| Ok(9)));

        assert_eq!(*container.resolve::<i32>().unwrap(), 9);

        container.unregister(&key, Some(id));
        assert_eq!(
            container.resolve::<i32>().unwrap_err().code(),
            ErrorCode::UnableToResolveDefaultService
        );
    }

    #[test]
    fn registration_invalidates_cached_plans() {
        let container = Container::new();
        container.register_with::<&'static str>(Reuse::Transient, |_| Ok("old"));
        assert_eq!(*container.resolve::<&'static str>().unwrap(), "old");

        // A later registration must change the default for the same key.
        container.register_with::<&'static str>(Reuse::Transient, |_| Ok("new"));
        assert_eq!(*container.resolve::<&'static str>().unwrap(), "new");
    }

    // ── Scopes ──

    #[test]
    fn reuses_instance_within_scope_not_across_nested() {
        let container = Container::new();
        container.register_with::<Log>(Reuse::InCurrentScope, |_| Ok(Log));

        let outer = container.open_scope();
        let outer_log: Arc<Log> = outer.resolve().unwrap();
        let outer_log_again: Arc<Log> = outer.resolve().unwrap();
        assert!(Arc::ptr_eq(&outer_log, &outer_log_again));

        // A nested scope caches its own instance.
        let nested = outer.open_scope();
        let nested_log: Arc<Log> = nested.resolve().unwrap();
        assert!(!Arc::ptr_eq(&outer_log, &nested_log));

        // Disposing the nested scope leaves the outer instance intact.
        nested.dispose();
        let outer_after: Arc<Log> = outer.resolve().unwrap();
        assert!(Arc::ptr_eq(&outer_log, &outer_after));
    }

    #[test]
    fn three_level_nesting_reuses_per_scope() {
        let container = Container::new();
        container.register_with::<Log>(Reuse::InCurrentScope, |_| Ok(Log));

        let outer = container.open_scope();
        let middle = outer.open_scope();
        let deep = middle.open_scope();

        let outer_log: Arc<Log> = outer.resolve().unwrap();
        let middle_log: Arc<Log> = middle.resolve().unwrap();
        let deep_log: Arc<Log> = deep.resolve().unwrap();
        let deep_log_again: Arc<Log> = deep.resolve().unwrap();

        assert!(Arc::ptr_eq(&deep_log, &deep_log_again));
        assert!(!Arc::ptr_eq(&deep_log, &middle_log));
        assert!(!Arc::ptr_eq(&deep_log, &outer_log));
        assert!(!Arc::ptr_eq(&middle_log, &outer_log));
    }

    #[test]
    fn sibling_scopes_do_not_share() {
        let container = Container::new();
        container.register_with::<Log>(Reuse::InCurrentScope, |_| Ok(Log));

        let first = container.open_scope();
        let second = container.open_scope();

        let in_first: Arc<Log> = first.resolve().unwrap();
        let in_second: Arc<Log> = second.resolve().unwrap();
        assert!(Arc::ptr_eq(&in_first, &first.resolve().unwrap()));
        assert!(!Arc::ptr_eq(&in_first, &in_second));
    }

    #[test]
    fn fresh_scope_means_fresh_instance() {
        let container = Container::new();
        container.register_with::<Log>(Reuse::InCurrentScope, |_| Ok(Log));

        let scope = container.open_scope();
        let first: Arc<Log> = scope.resolve().unwrap();
        scope.dispose();

        let scope = container.open_scope();
        let second: Arc<Log> = scope.resolve().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn scoped_without_open_scope_fails() {
        let container = Container::new();
        container.register_with::<Log>(Reuse::InCurrentScope, |_| Ok(Log));

        let err = container.resolve::<Log>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoCurrentScope);
    }

    #[test]
    fn scoped_without_filter_also_fails_no_current_scope() {
        let container = Container::builder()
            .without_reuse_matching_scope_filter()
            .build();
        container.register_with::<Log>(Reuse::InCurrentScope, |_| Ok(Log));

        let err = container.resolve::<Log>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoCurrentScope);
    }

    #[test]
    fn named_scope_reuse_binds_to_named_ancestor() {
        let container = Container::new();
        container.register_with::<Log>(Reuse::InCurrentNamedScope("web"), |_| Ok(Log));

        let web = container.open_named_scope("web");
        let log: Arc<Log> = web.resolve().unwrap();
        assert!(Arc::ptr_eq(&log, &web.resolve().unwrap()));

        // An unnamed nested scope still finds the named ancestor:
        // the instance is shared, not re-created.
        let nested = web.open_scope();
        let nested_log: Arc<Log> = nested.resolve().unwrap();
        assert!(Arc::ptr_eq(&log, &nested_log));
    }

    #[test]
    fn named_scope_missing_fails() {
        let container = Container::new();
        container.register_with::<Log>(Reuse::InCurrentNamedScope("web"), |_| Ok(Log));

        let other = container.open_named_scope("worker");
        let err = other.resolve::<Log>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoCurrentScope);
        match err {
            ContainerError::NoCurrentScope(e) => assert_eq!(e.required_scope, Some("web")),
            other => panic!("Expected NoCurrentScope, got: {other:?}"),
        }
    }

    #[test]
    fn resolving_through_disposed_scope_fails() {
        let container = Container::new();
        container.register_instance(1i32);

        let scope = container.open_scope();
        assert!(scope.resolve::<i32>().is_ok());

        scope.dispose();
        let err = scope.resolve::<i32>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ScopeIsDisposed);

        // Dispose stays idempotent.
        scope.dispose();
    }

    // ── Disposal ──

    #[derive(Debug)]
    struct Blah {
        disposed: Arc<AtomicBool>,
    }

    impl Dispose for Blah {
        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    fn register_blah(container: &Container, reuse: Reuse) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        container.register(
            ServiceKey::of::<Blah>(),
            Factory::of::<Blah>({
                let flag = flag.clone();
                move |_| Ok(Blah { disposed: flag.clone() })
            })
            .with_reuse(reuse)
            .dispose_with::<Blah>(),
        );
        flag
    }

    #[test]
    fn scope_dispose_releases_scoped_instance() {
        let container = Container::new();
        let flag = register_blah(&container, Reuse::InCurrentScope);

        let scope = container.open_scope();
        let _blah: Arc<Blah> = scope.resolve().unwrap();
        assert!(!flag.load(Ordering::SeqCst));

        scope.dispose();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn parent_dispose_does_not_reach_child_cache_and_vice_versa() {
        let container = Container::new();
        let flag = register_blah(&container, Reuse::InCurrentScope);

        let parent = container.open_scope();
        let child = parent.open_scope();
        let _in_child: Arc<Blah> = child.resolve().unwrap();

        // Disposing the parent only releases parent-cached instances.
        parent.dispose();
        assert!(!flag.load(Ordering::SeqCst));

        child.dispose();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn container_dispose_releases_singletons_and_registrations() {
        let container = Container::new();
        let flag = register_blah(&container, Reuse::Singleton);

        let _blah: Arc<Blah> = container.resolve().unwrap();
        container.dispose();

        assert!(flag.load(Ordering::SeqCst));
        // Registrations are gone too.
        assert_eq!(
            container.resolve::<Blah>().unwrap_err().code(),
            ErrorCode::UnableToResolveDefaultService
        );
    }

    #[test]
    fn dependencies_are_disposed_after_their_dependents() {
        struct Conn;
        struct Repo {
            _conn: Arc<Witness<Conn>>,
        }

        struct Witness<T> {
            order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
            tag: &'static str,
            _value: T,
        }
        impl<T> Dispose for Witness<T> {
            fn dispose(&self) {
                self.order.lock().push(self.tag);
            }
        }

        let order: Arc<parking_lot::Mutex<Vec<&'static str>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));

        let container = Container::new();
        container.register(
            ServiceKey::of::<Witness<Conn>>(),
            Factory::of::<Witness<Conn>>({
                let order = order.clone();
                move |_| Ok(Witness { order: order.clone(), tag: "conn", _value: Conn })
            })
            .with_reuse(Reuse::InCurrentScope)
            .dispose_with::<Witness<Conn>>(),
        );
        container.register(
            ServiceKey::of::<Witness<Repo>>(),
            Factory::of::<Witness<Repo>>({
                let order = order.clone();
                move |ctx| {
                    Ok(Witness {
                        order: order.clone(),
                        tag: "repo",
                        _value: Repo { _conn: ctx.resolve()? },
                    })
                }
            })
            .with_reuse(Reuse::InCurrentScope)
            .dispose_with::<Witness<Repo>>(),
        );

        let scope = container.open_scope();
        let _repo: Arc<Witness<Repo>> = scope.resolve().unwrap();
        scope.dispose();

        // The dependency was constructed first, so it goes last.
        assert_eq!(*order.lock(), vec!["repo", "conn"]);
    }

    #[test]
    fn transient_disposables_follow_the_active_scope() {
        let container = Container::new();
        let flag = register_blah(&container, Reuse::Transient);

        let scope = container.open_scope();
        let _a: Arc<Blah> = scope.resolve().unwrap();
        scope.dispose();
        assert!(flag.load(Ordering::SeqCst));
    }

    // ── resolve_many ──

    trait Dep: Send + Sync {}
    struct PlainDep;
    impl Dep for PlainDep {}
    struct ScopedDep;
    impl Dep for ScopedDep {}

    #[test]
    fn resolve_many_filters_out_not_scoped_candidates() {
        let container = Container::new();
        container.register_with::<Arc<dyn Dep>>(Reuse::Transient, |_| {
            Ok(Arc::new(PlainDep) as Arc<dyn Dep>)
        });
        container.register_with::<Arc<dyn Dep>>(Reuse::InCurrentScope, |_| {
            Ok(Arc::new(ScopedDep) as Arc<dyn Dep>)
        });

        // Outside any scope only the unscoped candidate is available.
        let deps: Vec<Arc<Arc<dyn Dep>>> = container.resolve_many().unwrap();
        assert_eq!(deps.len(), 1);

        // Inside an open scope both come back.
        let scope = container.open_scope();
        let deps: Vec<Arc<Arc<dyn Dep>>> = scope.resolve_many().unwrap();
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn resolve_many_excludes_composite_key() {
        let container = Container::new();
        container.register_with::<&'static str>(Reuse::Transient, |_| Ok("part-one"));
        container.register_keyed_with::<&'static str>("composite", Reuse::Transient, |_| {
            Ok("the-composite")
        });

        let all: Vec<Arc<&'static str>> = container.resolve_many().unwrap();
        assert_eq!(all.len(), 2);

        let parts: Vec<Arc<&'static str>> =
            container.resolve_many_excluding("composite").unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(*parts[0], "part-one");
    }

    #[test]
    fn resolve_many_of_unregistered_type_is_empty() {
        let container = Container::new();
        let none: Vec<Arc<i64>> = container.resolve_many().unwrap();
        assert!(none.is_empty());
    }

    // ── Lazy handles ──

    #[test]
    fn lazy_bound_to_disposed_scope_fails_every_time() {
        let container = Container::new();
        container.register_with::<Log>(Reuse::InCurrentScope, |_| Ok(Log));

        let get_log: Lazy<Log> = {
            let scope = container.open_scope();
            let lazy = scope.resolve_lazy::<Log>().unwrap();
            assert!(lazy.get().is_ok());
            scope.dispose();
            lazy
        };

        // Not just the first invocation — every one fails.
        assert_eq!(get_log.get().unwrap_err().code(), ErrorCode::ScopeIsDisposed);
        assert_eq!(get_log.get().unwrap_err().code(), ErrorCode::ScopeIsDisposed);
    }

    #[test]
    fn lazy_of_unregistered_fails_at_capture() {
        let container = Container::new();
        let err = container.resolve_lazy::<Log>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnableToResolveDefaultService);
    }

    #[test]
    fn lazy_singleton_survives_scope_disposal() {
        let container = Container::new();
        container.register_with::<String>(Reuse::Singleton, |_| Ok(String::from("s")));

        let in_scope = {
            let scope = container.open_scope();
            let lazy = scope.resolve_lazy::<String>().unwrap();
            lazy.get().unwrap()
        };
        let at_root = container.resolve::<String>().unwrap();
        assert!(Arc::ptr_eq(&in_scope, &at_root));
    }

    // ── Ambient scope context ──

    #[test]
    fn ambient_lazy_follows_current_scope() {
        let container = Container::builder()
            .with_scope_context(ThreadScopeContext::new())
            .build();
        container.register_with::<Log>(Reuse::InCurrentScope, |_| Ok(Log));

        let get_log = {
            let scope = container.open_scope();
            let lazy = container.resolve_lazy::<Log>().unwrap();
            assert!(lazy.get().is_ok());
            scope.dispose();
            lazy
        };

        // The ambient context has left scope: the handle finds no current
        // scope at invocation time.
        assert_eq!(get_log.get().unwrap_err().code(), ErrorCode::NoCurrentScope);
    }

    #[test]
    fn ambient_scopes_give_fresh_instances_per_scope() {
        let container = Container::builder()
            .with_scope_context(ThreadScopeContext::new())
            .build();
        container.register_with::<Log>(Reuse::InCurrentScope, |_| Ok(Log));

        let lazy = container.resolve_lazy::<Log>().unwrap();

        let scope = container.open_scope();
        let first = lazy.get().unwrap();
        scope.dispose();

        let scope = container.open_scope();
        let second = lazy.get().unwrap();
        scope.dispose();

        assert!(!Arc::ptr_eq(&first, &second));
    }

    // ── Implicit root scope ──

    #[test]
    fn implicit_root_scope_serves_scoped_at_top_level() {
        let container = Container::builder().with_implicit_root_scope().build();
        let flag = register_blah(&container, Reuse::InCurrentScope);

        let blah: Arc<Blah> = container.resolve().unwrap();
        assert!(Arc::ptr_eq(&blah, &container.resolve().unwrap()));

        container.dispose();
        container.dispose(); // idempotent
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn implicit_root_scope_carries_the_conventional_name() {
        let container = Container::builder().with_implicit_root_scope().build();
        let current = container.current_scope().unwrap();
        assert_eq!(current.name(), Some(crate::scope::ROOT_SCOPE_NAME));
    }

    #[test]
    fn implicit_root_nested_scope_still_disposes_normally() {
        let container = Container::builder().with_implicit_root_scope().build();
        let flag = register_blah(&container, Reuse::InCurrentScope);

        {
            let scope = container.open_scope();
            let _blah: Arc<Blah> = scope.resolve().unwrap();
        }
        // The nested scope cached its own instance and disposed it on drop.
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn implicit_root_with_ambient_context_refuses_scoped_resolution() {
        // The implicit root scope and an ambient context both claim to
        // define "current"; combined they fail rather than pick one.
        let container = Container::builder()
            .with_implicit_root_scope()
            .with_scope_context(ThreadScopeContext::new())
            .build();
        container.register_with::<Log>(Reuse::InCurrentScope, |_| Ok(Log));

        let err = container.resolve::<Log>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnableToResolveFromRegisteredServices);
    }

    #[test]
    fn debug_display() {
        let container = Container::new();
        container.register_instance(1i32);
        container.register_instance(String::from("x"));

        let debug = format!("{container:?}");
        assert!(debug.contains("Container"));
        assert!(debug.contains("2"));
    }
}
