//! Reuse policies — how long a resolved instance lives and where it is cached.
//!
//! - [`Reuse::Transient`] — a fresh instance on every resolution
//! - [`Reuse::Singleton`] — one instance cached in the root scope
//! - [`Reuse::InCurrentScope`] — one instance per nearest open scope
//! - [`Reuse::InCurrentNamedScope`] — one instance per nearest scope with a
//!   matching name
//! - [`Reuse::InResolutionScope`] — one instance per object graph, discarded
//!   when the top-level resolve call returns

use std::fmt;

/// Defines the lifetime of a service instance produced by a factory.
///
/// All cached reuses create lazily: nothing is constructed at registration,
/// only on the first resolution that reaches the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reuse {
    /// New instance created on every resolve call. Never cached.
    Transient,

    /// One instance shared across the whole container.
    ///
    /// Cached in the root scope on first resolve; concurrent first
    /// resolutions construct exactly once.
    Singleton,

    /// One instance per nearest open scope in the active chain.
    ///
    /// Resolving without any open scope fails with `NoCurrentScope`
    /// (unless the implicit-root-scope rule is enabled).
    InCurrentScope,

    /// One instance per nearest ancestor scope whose name matches.
    ///
    /// The chain is walked from the current scope outward; no match
    /// fails with `NoCurrentScope`.
    InCurrentNamedScope(&'static str),

    /// One instance per top-level resolve call.
    ///
    /// Two dependencies requesting the same factory within one object
    /// graph share a single instance; the cache is discarded when the
    /// call returns and no durable scope owns the instance.
    InResolutionScope,
}

impl Reuse {
    /// Returns `true` if this policy caches instances in a durable scope.
    #[inline]
    pub fn is_cached(&self) -> bool {
        matches!(
            self,
            Reuse::Singleton | Reuse::InCurrentScope | Reuse::InCurrentNamedScope(_)
        )
    }

    /// Returns `true` for the root-scope policy.
    #[inline]
    pub fn is_singleton(&self) -> bool {
        matches!(self, Reuse::Singleton)
    }

    /// The scope name this policy binds to, if it names one.
    #[inline]
    pub(crate) fn required_scope_name(&self) -> Option<&'static str> {
        match self {
            Reuse::InCurrentNamedScope(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Reuse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reuse::Transient => write!(f, "Transient"),
            Reuse::Singleton => write!(f, "Singleton"),
            Reuse::InCurrentScope => write!(f, "InCurrentScope"),
            Reuse::InCurrentNamedScope(name) => write!(f, "InCurrentNamedScope({name:?})"),
            Reuse::InResolutionScope => write!(f, "InResolutionScope"),
        }
    }
}
