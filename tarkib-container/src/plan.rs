//! Construction plans and the plan cache.
//!
//! A [`Plan`] is the cached outcome of registry analysis for one request
//! shape: the validated, condition-independent candidate set. Evaluating a
//! plan re-runs only the reuse/scope-chain lookups, which vary from call
//! to call; everything derived from the registry snapshot is reused.
//!
//! The cache is invalidated wholesale whenever the registry version moves:
//! every entry carries the snapshot version it was built against and is
//! rebuilt on mismatch. Races during population are benign — plans are
//! pure functions of the snapshot, so whichever build wins is correct.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use crate::key::ServiceKey;
use crate::registry::{Factory, Snapshot};
use crate::resolver::RequestShape;

/// One selectable registration inside a plan.
#[derive(Clone)]
pub(crate) struct Candidate {
    /// The key the factory was registered under (not necessarily the
    /// requested key — "resolve many" collects keyed registrations too).
    pub key: ServiceKey,
    pub factory: Arc<Factory>,
}

/// Cached registry analysis for one (key, shape) request.
pub(crate) struct Plan {
    pub shape: RequestShape,
    /// Registration-ordered; empty means nothing is registered.
    pub candidates: Vec<Candidate>,
}

#[derive(PartialEq, Eq, Hash)]
struct PlanKey {
    key: ServiceKey,
    shape: RequestShape,
}

struct CachedPlan {
    version: u64,
    plan: Arc<Plan>,
}

/// Memoizes resolver output keyed by (request key, shape, registry version).
pub(crate) struct PlanCache {
    plans: DashMap<PlanKey, CachedPlan>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self { plans: DashMap::new() }
    }

    /// Returns the cached plan for the request, or builds one against the
    /// pinned snapshot. A hit skips registry analysis entirely; a miss and
    /// a hit are semantically identical.
    pub fn get_or_build(
        &self,
        snapshot: &Snapshot,
        key: &ServiceKey,
        shape: RequestShape,
        build: impl FnOnce() -> Plan,
    ) -> Arc<Plan> {
        let plan_key = PlanKey { key: key.clone(), shape };

        if let Some(hit) = self.plans.get(&plan_key) {
            if hit.version == snapshot.version() {
                trace!(key = %key, ?shape, "Plan cache hit");
                return hit.plan.clone();
            }
        }

        trace!(key = %key, ?shape, version = snapshot.version(), "Building plan");
        let plan = Arc::new(build());
        self.plans.insert(
            plan_key,
            CachedPlan { version: snapshot.version(), plan: plan.clone() },
        );
        plan
    }

    /// Drops every cached plan. Called on registration changes; the
    /// per-entry version stamp already guards correctness, this frees the
    /// stale entries eagerly.
    pub fn invalidate_all(&self) {
        self.plans.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.plans.len()
    }
}
