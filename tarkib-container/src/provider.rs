//! Provider trait — a module of related service registrations.
//!
//! Providers are the seam through which external registration sources
//! (convention scanners, configuration loaders, hand-written wiring
//! modules) supply `(key, factory)` pairs to the container. The engine
//! only requires that each supplied factory already carries its reuse
//! policy and declared dependency list.
//!
//! # Examples
//! ```rust,ignore
//! struct DatabaseProvider;
//!
//! impl Provider for DatabaseProvider {
//!     fn register(&self, container: &Container) {
//!         container.register_with::<Database>(Reuse::Singleton, |_| {
//!             Ok(Database::connect("postgres://localhost"))
//!         });
//!     }
//! }
//!
//! let container = Container::new();
//! container.add_provider(&DatabaseProvider);
//! ```

use crate::container::Container;

/// A module that registers related services into a container.
///
/// Split wiring by domain instead of one giant registration block:
///
/// ```rust,ignore
/// container.add_provider(&DatabaseProvider);
/// container.add_provider(&AuthProvider);
/// container.add_provider(&EmailProvider);
/// ```
pub trait Provider: Send + Sync {
    /// Register services into the container.
    fn register(&self, container: &Container);

    /// Optional: human-readable name for diagnostics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}
