//! Registration-graph verification.
//!
//! Walks every registration's *declared* dependency list and reports:
//! - dependencies with no registration (with the requiring key)
//! - cycles in the declared graph
//!
//! This is an opt-in diagnostic over what registration sources declared.
//! Factories are opaque closures and may resolve keys they never declared,
//! so the in-flight stack of the resolver stays the authoritative cycle
//! detector; this pass catches configuration mistakes before the first
//! resolve.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::error::{
    ContainerError, CyclicDependencyError, Result, UnresolvedDefaultError,
    UnresolvedKeyedError,
};
use crate::key::ServiceKey;
use crate::registry::{Factory, FactoryId, Snapshot};

/// Verifies a pinned snapshot. Returns the first problem found.
#[instrument(skip(snapshot), name = "registry_verification")]
pub(crate) fn verify(snapshot: &Snapshot) -> Result<()> {
    let mut verifier = GraphVerifier::new(snapshot);
    verifier.verify_all()
}

/// Depth-first walk over declared dependencies.
///
/// Keeps the set currently being visited (cycle detection) and the current
/// path (error rendering), and caches ids already verified.
struct GraphVerifier<'s> {
    snapshot: &'s Snapshot,
    visiting: HashSet<FactoryId>,
    verified: HashSet<FactoryId>,
    path: Vec<ServiceKey>,
}

impl<'s> GraphVerifier<'s> {
    fn new(snapshot: &'s Snapshot) -> Self {
        Self {
            snapshot,
            visiting: HashSet::new(),
            verified: HashSet::new(),
            path: Vec::new(),
        }
    }

    fn verify_all(&mut self) -> Result<()> {
        let snapshot = self.snapshot;
        debug!(registrations = snapshot.len(), "Verifying registration graph");

        let entries: Vec<(ServiceKey, Vec<Arc<Factory>>)> = snapshot
            .all_entries()
            .map(|(key, factories)| (key.clone(), factories.to_vec()))
            .collect();
        for (key, factories) in entries {
            for factory in factories {
                self.verify_factory(&key, &factory)?;
            }
        }

        debug!("Registration graph verified ✓");
        Ok(())
    }

    /// Verifies one declared dependency edge: the key must have a
    /// registration, and its default candidate must verify in turn.
    fn verify_key(&mut self, key: &ServiceKey) -> Result<()> {
        let snapshot = self.snapshot;
        match snapshot.lookup(key).last() {
            // The declared dependency resolves to the default (last
            // registered) candidate.
            Some(factory) => {
                let factory = factory.clone();
                self.verify_factory(key, &factory)
            }
            None => Err(self.not_registered(key)),
        }
    }

    fn verify_factory(&mut self, key: &ServiceKey, factory: &Arc<Factory>) -> Result<()> {
        if self.verified.contains(&factory.id()) {
            return Ok(());
        }

        if self.visiting.contains(&factory.id()) {
            let start = self.path.iter().position(|k| k == key).unwrap_or(0);
            let mut chain = self.path[start..].to_vec();
            chain.push(key.clone());

            warn!(cycle = ?chain, "Declared dependency cycle detected");
            return Err(ContainerError::CyclicDependency(CyclicDependencyError {
                chain,
            }));
        }

        self.visiting.insert(factory.id());
        self.path.push(key.clone());

        for dependency in factory.dependencies().to_vec() {
            self.verify_key(&dependency)?;
        }

        self.path.pop();
        self.visiting.remove(&factory.id());
        self.verified.insert(factory.id());
        Ok(())
    }

    fn not_registered(&self, key: &ServiceKey) -> ContainerError {
        let required_by = self.path.last().cloned();
        if key.is_keyed() {
            ContainerError::UnableToResolveKeyed(UnresolvedKeyedError {
                requested: key.clone(),
                required_by,
            })
        } else {
            ContainerError::UnableToResolveDefault(UnresolvedDefaultError {
                requested: key.clone(),
                required_by,
                suggestions: Vec::new(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::registry::Registry;

    struct Database;
    struct UserRepo;
    struct UserService;

    fn leaf<T: Send + Sync + Default + 'static>() -> Factory {
        Factory::of::<T>(|_| Ok(T::default()))
    }

    fn node<T: Send + Sync + Default + 'static>(deps: Vec<ServiceKey>) -> Factory {
        Factory::of::<T>(|_| Ok(T::default())).with_dependencies(deps)
    }

    impl Default for Database {
        fn default() -> Self {
            Database
        }
    }
    impl Default for UserRepo {
        fn default() -> Self {
            UserRepo
        }
    }
    impl Default for UserService {
        fn default() -> Self {
            UserService
        }
    }

    #[test]
    fn valid_chain_verifies() {
        let registry = Registry::new();
        registry.register(ServiceKey::of::<Database>(), leaf::<Database>());
        registry.register(
            ServiceKey::of::<UserRepo>(),
            node::<UserRepo>(vec![ServiceKey::of::<Database>()]),
        );
        registry.register(
            ServiceKey::of::<UserService>(),
            node::<UserService>(vec![ServiceKey::of::<UserRepo>()]),
        );

        assert!(verify(&registry.snapshot()).is_ok());
    }

    #[test]
    fn detects_declared_cycle() {
        #[derive(Default)]
        struct A;
        #[derive(Default)]
        struct B;
        #[derive(Default)]
        struct C;

        let registry = Registry::new();
        registry.register(ServiceKey::of::<A>(), node::<A>(vec![ServiceKey::of::<B>()]));
        registry.register(ServiceKey::of::<B>(), node::<B>(vec![ServiceKey::of::<C>()]));
        registry.register(ServiceKey::of::<C>(), node::<C>(vec![ServiceKey::of::<A>()]));

        let err = verify(&registry.snapshot()).unwrap_err();
        match err {
            ContainerError::CyclicDependency(e) => assert!(e.chain.len() >= 3),
            other => panic!("Expected CyclicDependency, got: {other:?}"),
        }
    }

    #[test]
    fn detects_self_dependency() {
        #[derive(Default)]
        struct A;

        let registry = Registry::new();
        registry.register(ServiceKey::of::<A>(), node::<A>(vec![ServiceKey::of::<A>()]));

        assert!(verify(&registry.snapshot()).is_err());
    }

    #[test]
    fn detects_missing_declared_dependency() {
        #[derive(Default)]
        struct A;
        struct NeverRegistered;

        let registry = Registry::new();
        registry.register(
            ServiceKey::of::<A>(),
            node::<A>(vec![ServiceKey::of::<NeverRegistered>()]),
        );

        let err = verify(&registry.snapshot()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnableToResolveDefaultService);
        match err {
            ContainerError::UnableToResolveDefault(e) => {
                assert!(e.requested.type_name().contains("NeverRegistered"));
                assert!(e.required_by.is_some());
            }
            other => panic!("Expected UnableToResolveDefault, got: {other:?}"),
        }
    }

    #[test]
    fn missing_keyed_dependency_gets_keyed_code() {
        #[derive(Default)]
        struct A;
        struct Keyed;

        let registry = Registry::new();
        registry.register(
            ServiceKey::of::<A>(),
            node::<A>(vec![ServiceKey::keyed::<Keyed>("replica")]),
        );

        let err = verify(&registry.snapshot()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnableToResolveKeyedService);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        #[derive(Default)]
        struct A;
        #[derive(Default)]
        struct B;
        #[derive(Default)]
        struct C;
        #[derive(Default)]
        struct D;

        let registry = Registry::new();
        registry.register(ServiceKey::of::<D>(), leaf::<D>());
        registry.register(ServiceKey::of::<B>(), node::<B>(vec![ServiceKey::of::<D>()]));
        registry.register(ServiceKey::of::<C>(), node::<C>(vec![ServiceKey::of::<D>()]));
        registry.register(
            ServiceKey::of::<A>(),
            node::<A>(vec![ServiceKey::of::<B>(), ServiceKey::of::<C>()]),
        );

        assert!(verify(&registry.snapshot()).is_ok());
    }
}
