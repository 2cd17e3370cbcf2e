//! The recursive resolution engine.
//!
//! A [`ResolveSession`] lives for exactly one top-level resolve call. It
//! pins one registry snapshot, carries the active scope, detects cycles
//! over the in-progress factory stack and hosts the resolution-scope
//! cache. Factories see the session through a [`ResolveContext`] and
//! resolve their own dependencies against it, so a whole object graph is
//! built from one consistent registry view.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use tarkib_support::rendering::suggest_similar;

use crate::container::ContainerInner;
use crate::error::{
    ContainerError, CyclicDependencyError, ExcludedCandidatesError, NoCurrentScopeError,
    Result, ScopeDisposedError, UnresolvedDefaultError, UnresolvedKeyedError,
};
use crate::key::ServiceKey;
use crate::plan::{Candidate, Plan};
use crate::registry::{FactoryId, Instance};
use crate::reuse::Reuse;
use crate::scope::Scope;

/// The requested result shape of a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestShape {
    /// One instance; missing registration is an error.
    Single,
    /// Every non-excluded candidate, in registration order.
    Many,
    /// One instance or an explicit absence, never a not-found error.
    Optional,
    /// A deferred handle; construction happens at invocation time.
    Lazy,
}

/// What a factory condition gets to look at.
#[derive(Debug, Clone)]
pub struct Request {
    pub key: ServiceKey,
    pub shape: RequestShape,
    /// Whether the resolution runs with an open scope in the active chain.
    pub has_open_scope: bool,
}

struct Frame {
    factory: FactoryId,
    key: ServiceKey,
}

/// One top-level resolution in flight.
pub(crate) struct ResolveSession {
    inner: Arc<ContainerInner>,
    snapshot: Arc<crate::registry::Snapshot>,
    active: Option<Arc<Scope>>,
    // In-progress factories, root request first.
    stack: Mutex<Vec<Frame>>,
    // The resolution scope: (factory id, discriminator) → instance,
    // discarded when the session ends.
    graph_cache: Mutex<HashMap<(FactoryId, Option<&'static str>), Instance>>,
}

impl ResolveSession {
    pub(crate) fn new(inner: Arc<ContainerInner>, active: Option<Arc<Scope>>) -> Result<Self> {
        if let Some(scope) = &active {
            if scope.is_disposed() {
                return Err(ContainerError::ScopeIsDisposed(ScopeDisposedError {
                    scope_name: scope.name(),
                }));
            }
        }
        Ok(Self {
            snapshot: inner.registry.snapshot(),
            inner,
            active,
            stack: Mutex::new(Vec::new()),
            graph_cache: Mutex::new(HashMap::new()),
        })
    }

    // ── Entry points ──

    pub(crate) fn resolve_single(&self, key: &ServiceKey) -> Result<Instance> {
        let plan = self.plan_for(key, RequestShape::Single);
        match self.select_and_construct(&plan, key, RequestShape::Single)? {
            Some(instance) => Ok(instance),
            None => Err(self.not_found(key)),
        }
    }

    pub(crate) fn resolve_optional(&self, key: &ServiceKey) -> Result<Option<Instance>> {
        let plan = self.plan_for(key, RequestShape::Optional);
        self.select_and_construct(&plan, key, RequestShape::Optional)
    }

    /// Collects every non-excluded candidate for the service type, in
    /// registration order. `exclude_composite` drops candidates registered
    /// under that key, so a composite never resolves itself as its own
    /// dependency.
    pub(crate) fn resolve_many(
        &self,
        type_key: &ServiceKey,
        exclude_composite: Option<&'static str>,
    ) -> Result<Vec<Instance>> {
        let plan = self.plan_for(type_key, RequestShape::Many);
        let request = Request {
            key: type_key.clone(),
            shape: RequestShape::Many,
            has_open_scope: self.active.is_some(),
        };

        let mut collected = Vec::new();
        for candidate in &plan.candidates {
            if exclude_composite.is_some() && candidate.key.key() == exclude_composite {
                continue;
            }
            if !candidate.factory.accepts(&request) {
                continue;
            }
            if self.inner.rules.reuse_matching_scope_filter
                && !self.scope_available(candidate.factory.reuse())
            {
                trace!(key = %candidate.key, "Skipping candidate without a matching scope");
                continue;
            }
            collected.push(self.construct(candidate)?);
        }
        Ok(collected)
    }

    /// Checks that a deferred request would find a registration now.
    pub(crate) fn verify_resolvable(&self, key: &ServiceKey) -> Result<()> {
        let plan = self.plan_for(key, RequestShape::Lazy);
        if plan.candidates.is_empty() {
            return Err(self.not_found(key));
        }
        Ok(())
    }

    pub(crate) fn make_lazy<T: ?Sized>(&self, key: ServiceKey) -> Lazy<T> {
        // With an ambient context the handle re-reads "current scope" at
        // invocation time; without one it stays bound to the scope that
        // was active at capture time.
        let bound = if self.inner.scope_context.is_some() {
            None
        } else {
            self.active.clone()
        };
        Lazy {
            inner: self.inner.clone(),
            key,
            bound,
            _marker: PhantomData,
        }
    }

    // ── Steps 1–2: shape + candidate lookup (cached as a plan) ──

    fn plan_for(&self, key: &ServiceKey, shape: RequestShape) -> Arc<Plan> {
        self.inner.plans.get_or_build(&self.snapshot, key, shape, || {
            let candidates = match shape {
                RequestShape::Many => {
                    let mut list = Vec::new();
                    for reg_key in self.snapshot.keys_for_type(key.type_id()) {
                        for factory in self.snapshot.lookup(reg_key) {
                            list.push(Candidate {
                                key: reg_key.clone(),
                                factory: factory.clone(),
                            });
                        }
                    }
                    list
                }
                _ => self
                    .snapshot
                    .lookup(key)
                    .iter()
                    .map(|factory| Candidate { key: key.clone(), factory: factory.clone() })
                    .collect(),
            };
            Plan { shape, candidates }
        })
    }

    // ── Steps 3–4: candidate selection ──

    fn select_and_construct(
        &self,
        plan: &Plan,
        key: &ServiceKey,
        shape: RequestShape,
    ) -> Result<Option<Instance>> {
        if plan.candidates.is_empty() {
            return match shape {
                RequestShape::Optional => Ok(None),
                _ => Err(self.not_found(key)),
            };
        }

        let request = Request {
            key: key.clone(),
            shape,
            has_open_scope: self.active.is_some(),
        };
        let matching: Vec<&Candidate> = plan
            .candidates
            .iter()
            .filter(|candidate| candidate.factory.accepts(&request))
            .collect();

        if matching.is_empty() {
            // Registrations exist but every condition said no.
            return match shape {
                RequestShape::Optional => Ok(None),
                _ => Err(ContainerError::UnableToResolveFromRegistered(
                    ExcludedCandidatesError {
                        requested: key.clone(),
                        candidates: plan.candidates.len(),
                    },
                )),
            };
        }

        let selected = self.select(&matching, &request)?;
        self.construct(selected).map(Some)
    }

    /// Picks the candidate to construct: the default (last registered),
    /// unless the reuse-matching-scope filter excludes it.
    fn select<'p>(
        &self,
        matching: &[&'p Candidate],
        request: &Request,
    ) -> Result<&'p Candidate> {
        match matching {
            [] => Err(ContainerError::UnableToResolveFromRegistered(
                ExcludedCandidatesError { requested: request.key.clone(), candidates: 0 },
            )),
            [only] => Ok(*only),
            [.., default] if !self.inner.rules.reuse_matching_scope_filter => Ok(*default),
            [.., default] => {
                for candidate in matching.iter().rev() {
                    if self.scope_available(candidate.factory.reuse()) {
                        return Ok(*candidate);
                    }
                }
                Err(ContainerError::NoCurrentScope(NoCurrentScopeError {
                    requested: request.key.clone(),
                    required_scope: default.factory.reuse().required_scope_name(),
                }))
            }
        }
    }

    fn scope_available(&self, reuse: Reuse) -> bool {
        match reuse {
            Reuse::InCurrentScope => self.active.is_some(),
            Reuse::InCurrentNamedScope(name) => self
                .active
                .as_ref()
                .is_some_and(|scope| scope.find_named(name).is_some()),
            _ => true,
        }
    }

    // ── Steps 5–7: construction with cycle detection and reuse ──

    fn construct(&self, candidate: &Candidate) -> Result<Instance> {
        let factory = &candidate.factory;
        {
            let stack = self.stack.lock();
            if stack.iter().any(|frame| frame.factory == factory.id()) {
                let start = stack
                    .iter()
                    .position(|frame| frame.factory == factory.id())
                    .unwrap_or(0);
                let mut chain: Vec<ServiceKey> =
                    stack[start..].iter().map(|frame| frame.key.clone()).collect();
                chain.push(candidate.key.clone());
                return Err(ContainerError::CyclicDependency(CyclicDependencyError {
                    chain,
                }));
            }
        }

        self.stack.lock().push(Frame {
            factory: factory.id(),
            key: candidate.key.clone(),
        });
        let result = self.construct_with_reuse(candidate);
        self.stack.lock().pop();
        result
    }

    fn construct_with_reuse(&self, candidate: &Candidate) -> Result<Instance> {
        let factory = &candidate.factory;
        match factory.reuse() {
            Reuse::Transient => {
                let instance = self.run_factory(candidate)?;
                if let Some(disposer) = factory.disposer() {
                    self.owning_scope().track(instance.clone(), disposer.clone());
                }
                Ok(instance)
            }

            Reuse::Singleton => self
                .inner
                .root_scope
                .get_or_try_create(factory, || self.run_factory(candidate)),

            Reuse::InCurrentScope => {
                self.check_implicit_root_exclusion(candidate)?;
                match &self.active {
                    Some(scope) => {
                        scope.get_or_try_create(factory, || self.run_factory(candidate))
                    }
                    None => Err(ContainerError::NoCurrentScope(NoCurrentScopeError {
                        requested: candidate.key.clone(),
                        required_scope: None,
                    })),
                }
            }

            Reuse::InCurrentNamedScope(name) => {
                self.check_implicit_root_exclusion(candidate)?;
                let target = self.active.as_ref().and_then(|scope| scope.find_named(name));
                match target {
                    Some(scope) => {
                        scope.get_or_try_create(factory, || self.run_factory(candidate))
                    }
                    None => Err(ContainerError::NoCurrentScope(NoCurrentScopeError {
                        requested: candidate.key.clone(),
                        required_scope: Some(name),
                    })),
                }
            }

            Reuse::InResolutionScope => {
                let cache_key = (factory.id(), candidate.key.key());
                if let Some(hit) = self.graph_cache.lock().get(&cache_key).cloned() {
                    return Ok(hit);
                }
                let instance = self.run_factory(candidate)?;
                let instance = self
                    .graph_cache
                    .lock()
                    .entry(cache_key)
                    .or_insert(instance)
                    .clone();
                if let Some(disposer) = factory.disposer() {
                    self.owning_scope().track(instance.clone(), disposer.clone());
                }
                Ok(instance)
            }
        }
    }

    /// Runs the factory closure. A resolution failure from a nested
    /// resolve propagates untouched; a construction failure is wrapped
    /// with this factory's identity, extending the chain from root
    /// request to failing leaf.
    fn run_factory(&self, candidate: &Candidate) -> Result<Instance> {
        let ctx = ResolveContext { session: self };
        trace!(key = %candidate.key, factory = candidate.factory.id(), "Running factory");
        candidate.factory.call(&ctx).map_err(|err| {
            match err.downcast::<ContainerError>() {
                Ok(inner) => match *inner {
                    wrapped @ ContainerError::ConstructionFailed { .. } => {
                        ContainerError::construction(
                            candidate.key.clone(),
                            Some(candidate.factory.id()),
                            Box::new(wrapped),
                        )
                    }
                    resolution_failure => resolution_failure,
                },
                Err(foreign) => ContainerError::construction(
                    candidate.key.clone(),
                    Some(candidate.factory.id()),
                    foreign,
                ),
            }
        })
    }

    /// Transient and resolution-scoped disposables belong to the scope the
    /// resolution runs through; the root when none is open.
    fn owning_scope(&self) -> Arc<Scope> {
        self.active
            .clone()
            .unwrap_or_else(|| self.inner.root_scope.clone())
    }

    fn check_implicit_root_exclusion(&self, candidate: &Candidate) -> Result<()> {
        // The implicit root scope and an ambient context are mutually
        // exclusive ways of answering "what is current": combined they
        // resolve to nothing rather than silently picking one.
        if self.inner.rules.implicit_root_scope
            && self.inner.scope_context.is_some()
            && self.active.is_none()
        {
            return Err(ContainerError::UnableToResolveFromRegistered(
                ExcludedCandidatesError { requested: candidate.key.clone(), candidates: 1 },
            ));
        }
        Ok(())
    }

    fn not_found(&self, key: &ServiceKey) -> ContainerError {
        let required_by = self.stack.lock().last().map(|frame| frame.key.clone());
        if key.is_keyed() {
            ContainerError::UnableToResolveKeyed(UnresolvedKeyedError {
                requested: key.clone(),
                required_by,
            })
        } else {
            ContainerError::UnableToResolveDefault(UnresolvedDefaultError {
                requested: key.clone(),
                required_by,
                suggestions: self.suggestions_for(key),
            })
        }
    }

    fn suggestions_for(&self, key: &ServiceKey) -> Vec<ServiceKey> {
        let registered: Vec<&ServiceKey> = self.snapshot.registered_keys().collect();
        let names: Vec<&str> = registered.iter().map(|k| k.type_name()).collect();
        let picks = suggest_similar(key.type_name(), &names, 3);
        registered
            .into_iter()
            .filter(|k| picks.iter().any(|p| p == k.type_name()))
            .cloned()
            .collect()
    }
}

/// Downcasts an erased instance to the requested type.
pub(crate) fn downcast<T: Send + Sync + 'static>(
    key: &ServiceKey,
    instance: Instance,
) -> Result<Arc<T>> {
    instance.downcast::<T>().map_err(|_| {
        ContainerError::construction(
            key.clone(),
            None,
            format!("type mismatch: expected {}", type_name::<T>()).into(),
        )
    })
}

// ============================================================
// ResolveContext — what factories see
// ============================================================

/// The resolver handed to factory closures.
///
/// All calls run against the factory's own in-flight session: the same
/// pinned registry snapshot, the same resolution scope, the same cycle
/// detection stack.
///
/// # Examples
/// ```rust,ignore
/// container.register_with::<UserService>(Reuse::Transient, |ctx| {
///     let db: Arc<Database> = ctx.resolve()?;
///     Ok(UserService { db })
/// });
/// ```
pub struct ResolveContext<'s> {
    session: &'s ResolveSession,
}

impl ResolveContext<'_> {
    /// Resolves the default registration for `T`.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        let key = ServiceKey::of::<T>();
        let instance = self.session.resolve_single(&key)?;
        downcast(&key, instance)
    }

    /// Resolves the registration of `T` under the given key.
    pub fn resolve_keyed<T: Send + Sync + 'static>(&self, key: &'static str) -> Result<Arc<T>> {
        let key = ServiceKey::keyed::<T>(key);
        let instance = self.session.resolve_single(&key)?;
        downcast(&key, instance)
    }

    /// Resolves `T` or returns `None` when nothing is registered.
    pub fn resolve_opt<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>> {
        let key = ServiceKey::of::<T>();
        match self.session.resolve_optional(&key)? {
            Some(instance) => Ok(Some(downcast(&key, instance)?)),
            None => Ok(None),
        }
    }

    /// Resolves every registration of `T`, default and keyed.
    pub fn resolve_many<T: Send + Sync + 'static>(&self) -> Result<Vec<Arc<T>>> {
        let key = ServiceKey::of::<T>();
        let instances = self.session.resolve_many(&key, None)?;
        instances
            .into_iter()
            .map(|instance| downcast(&key, instance))
            .collect()
    }

    /// Returns a deferred handle to `T` instead of constructing it now.
    ///
    /// Recursion stops at this boundary, which is what makes
    /// lazily-broken dependency cycles legal.
    pub fn resolve_lazy<T: Send + Sync + 'static>(&self) -> Result<Lazy<T>> {
        let key = ServiceKey::of::<T>();
        self.session.verify_resolvable(&key)?;
        Ok(self.session.make_lazy(key))
    }
}

// ============================================================
// Lazy — deferred resolution handle
// ============================================================

/// A deferred handle to a registered service.
///
/// Without an ambient scope context the handle is bound to the scope that
/// was active when it was captured; invoking it after that scope's
/// disposal fails `ScopeIsDisposed` on every call. With an ambient
/// context it resolves against whatever scope is current at invocation
/// time, and fails `NoCurrentScope` once the context has left scope.
pub struct Lazy<T: ?Sized> {
    inner: Arc<ContainerInner>,
    key: ServiceKey,
    bound: Option<Arc<Scope>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Sync + 'static> Lazy<T> {
    /// Resolves the service now, against the scope rules above.
    pub fn get(&self) -> Result<Arc<T>> {
        let active = match self.inner.ambient_current() {
            Some(current) => current,
            None => self.bound.clone(),
        };
        let session = ResolveSession::new(self.inner.clone(), active)?;
        let instance = session.resolve_single(&self.key)?;
        downcast(&self.key, instance)
    }
}

impl<T: ?Sized> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            key: self.key.clone(),
            bound: self.bound.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy").field("key", &self.key).finish()
    }
}
