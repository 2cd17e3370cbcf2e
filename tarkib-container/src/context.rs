//! Ambient scope context — optional tracking of "the currently open scope".
//!
//! The engine always threads the active scope explicitly; a
//! [`ScopeContext`] is a thin optional layer on top that lets deferred
//! handles find whatever scope is active *at invocation time* instead of
//! the scope captured at creation time.

use std::cell::RefCell;
use std::sync::Arc;

use crate::scope::Scope;

/// Storage for the ambient "current scope".
///
/// Configured per container via
/// [`ContainerBuilder::with_scope_context`](crate::container::ContainerBuilder::with_scope_context).
/// Opening a scope sets the current one; disposing it restores the
/// previous one.
pub trait ScopeContext: Send + Sync {
    /// The scope considered current, if any.
    fn current(&self) -> Option<Arc<Scope>>;

    /// Replaces the current scope, returning the previous one.
    fn set_current(&self, scope: Option<Arc<Scope>>) -> Option<Arc<Scope>>;
}

thread_local! {
    static CURRENT_SCOPE: RefCell<Option<Arc<Scope>>> = const { RefCell::new(None) };
}

/// A [`ScopeContext`] backed by thread-local storage.
///
/// Each thread sees its own current scope, so independent threads opening
/// scopes through the same container do not interfere.
#[derive(Debug, Default)]
pub struct ThreadScopeContext;

impl ThreadScopeContext {
    pub fn new() -> Self {
        Self
    }
}

impl ScopeContext for ThreadScopeContext {
    fn current(&self) -> Option<Arc<Scope>> {
        CURRENT_SCOPE.with(|current| current.borrow().clone())
    }

    fn set_current(&self, scope: Option<Arc<Scope>>) -> Option<Arc<Scope>> {
        CURRENT_SCOPE.with(|current| current.replace(scope))
    }
}
