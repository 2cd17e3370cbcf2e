//! Error types for Tarkib container operations.
//!
//! Every failure crossing the public boundary is a [`ContainerError`]
//! carrying one code from the closed [`ErrorCode`] set plus enough context
//! to see the offending request.

use std::error::Error as StdError;
use std::fmt;

use tarkib_support::rendering::render_chain;

use crate::key::ServiceKey;
use crate::registry::FactoryId;

/// The closed set of failure codes.
///
/// Every [`ContainerError`] maps to exactly one code via
/// [`ContainerError::code`]; nothing outside this set escapes the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No default (unkeyed) registration found for a required request.
    UnableToResolveDefaultService,
    /// No registration found under the requested key.
    UnableToResolveKeyedService,
    /// Candidates existed but every one was excluded from selection.
    UnableToResolveFromRegisteredServices,
    /// A reuse policy requires a scope absent from the active chain.
    NoCurrentScope,
    /// Resolution attempted through (or after) a disposed scope.
    ScopeIsDisposed,
    /// An unbroken dependency cycle was detected.
    CyclicDependency,
    /// A factory failed while constructing an instance.
    ConstructionFailed,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::UnableToResolveDefaultService => "UnableToResolveDefaultService",
            ErrorCode::UnableToResolveKeyedService => "UnableToResolveKeyedService",
            ErrorCode::UnableToResolveFromRegisteredServices => {
                "UnableToResolveFromRegisteredServices"
            }
            ErrorCode::NoCurrentScope => "NoCurrentScope",
            ErrorCode::ScopeIsDisposed => "ScopeIsDisposed",
            ErrorCode::CyclicDependency => "CyclicDependency",
            ErrorCode::ConstructionFailed => "ConstructionFailed",
        };
        write!(f, "{name}")
    }
}

/// Main error type for all Tarkib operations.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// A required default request found no registration.
    #[error("{}", .0)]
    UnableToResolveDefault(UnresolvedDefaultError),

    /// A required keyed request found no registration under its key.
    #[error("{}", .0)]
    UnableToResolveKeyed(UnresolvedKeyedError),

    /// Registrations existed for the request but all were excluded.
    #[error("{}", .0)]
    UnableToResolveFromRegistered(ExcludedCandidatesError),

    /// The reuse policy named a scope missing from the active chain.
    #[error("{}", .0)]
    NoCurrentScope(NoCurrentScopeError),

    /// The target scope was already disposed.
    #[error("{}", .0)]
    ScopeIsDisposed(ScopeDisposedError),

    /// An unbroken dependency cycle.
    #[error("{}", .0)]
    CyclicDependency(CyclicDependencyError),

    /// A factory returned an error during construction.
    ///
    /// Dependency failures are wrapped level by level with the requesting
    /// factory's identity, forming a chain from root request to failing leaf.
    #[error("Failed to construct {requested}{}: {source}", render_factory_id(.factory_id))]
    ConstructionFailed {
        requested: ServiceKey,
        factory_id: Option<FactoryId>,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl ContainerError {
    /// The code of this failure from the closed set.
    pub fn code(&self) -> ErrorCode {
        match self {
            ContainerError::UnableToResolveDefault(_) => ErrorCode::UnableToResolveDefaultService,
            ContainerError::UnableToResolveKeyed(_) => ErrorCode::UnableToResolveKeyedService,
            ContainerError::UnableToResolveFromRegistered(_) => {
                ErrorCode::UnableToResolveFromRegisteredServices
            }
            ContainerError::NoCurrentScope(_) => ErrorCode::NoCurrentScope,
            ContainerError::ScopeIsDisposed(_) => ErrorCode::ScopeIsDisposed,
            ContainerError::CyclicDependency(_) => ErrorCode::CyclicDependency,
            ContainerError::ConstructionFailed { .. } => ErrorCode::ConstructionFailed,
        }
    }

    /// The code of the innermost failure.
    ///
    /// Walks the [`ContainerError::ConstructionFailed`] wrapping chain down
    /// to the leaf; for a leaf that is not a container error (a factory's
    /// own failure) this is [`ErrorCode::ConstructionFailed`].
    pub fn root_code(&self) -> ErrorCode {
        let mut current = self;
        loop {
            match current {
                ContainerError::ConstructionFailed { source, .. } => {
                    match source.downcast_ref::<ContainerError>() {
                        Some(inner) => current = inner,
                        None => return ErrorCode::ConstructionFailed,
                    }
                }
                other => return other.code(),
            }
        }
    }

    pub(crate) fn construction(
        requested: ServiceKey,
        factory_id: Option<FactoryId>,
        source: Box<dyn StdError + Send + Sync>,
    ) -> Self {
        ContainerError::ConstructionFailed { requested, factory_id, source }
    }
}

fn render_factory_id(id: &Option<FactoryId>) -> String {
    match id {
        Some(id) => format!(" (factory #{id})"),
        None => String::new(),
    }
}

/// Error when a required default request found no registration.
#[derive(Debug)]
pub struct UnresolvedDefaultError {
    /// The service that was requested.
    pub requested: ServiceKey,
    /// What required this service (if the failure happened inside a graph).
    pub required_by: Option<ServiceKey>,
    /// Similar types that ARE registered, for "did you mean?" output.
    pub suggestions: Vec<ServiceKey>,
}

impl fmt::Display for UnresolvedDefaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unable to resolve default service: {}", self.requested)?;

        if let Some(ref parent) = self.required_by {
            write!(f, "\n  Required by: {parent}")?;
        }

        if !self.suggestions.is_empty() {
            write!(f, "\n  Did you mean one of:")?;
            for suggestion in &self.suggestions {
                write!(f, "\n    - {suggestion}")?;
            }
        }

        write!(
            f,
            "\n  Hint: Did you forget to register {}?",
            self.requested
        )
    }
}

/// Error when a required keyed request found no registration under its key.
#[derive(Debug)]
pub struct UnresolvedKeyedError {
    pub requested: ServiceKey,
    pub required_by: Option<ServiceKey>,
}

impl fmt::Display for UnresolvedKeyedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unable to resolve keyed service: {}", self.requested)?;
        if let Some(ref parent) = self.required_by {
            write!(f, "\n  Required by: {parent}")?;
        }
        write!(
            f,
            "\n  Hint: Register the service under key {:?}, or resolve the default one",
            self.requested.key().unwrap_or_default()
        )
    }
}

/// Error when registrations existed but selection excluded every candidate.
#[derive(Debug)]
pub struct ExcludedCandidatesError {
    pub requested: ServiceKey,
    /// How many registered candidates were considered and excluded.
    pub candidates: usize,
}

impl fmt::Display for ExcludedCandidatesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unable to resolve {} from {} registered candidate(s): all were excluded",
            self.requested, self.candidates,
        )?;
        write!(
            f,
            "\n  Hint: Check candidate conditions and the scope rules the container was built with"
        )
    }
}

/// Error when a reuse policy requires a scope missing from the active chain.
#[derive(Debug)]
pub struct NoCurrentScopeError {
    pub requested: ServiceKey,
    /// The scope name the reuse policy binds to, if it names one.
    pub required_scope: Option<&'static str>,
}

impl fmt::Display for NoCurrentScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.required_scope {
            Some(name) => write!(
                f,
                "No scope named {:?} is open while resolving {}",
                name, self.requested,
            )?,
            None => write!(
                f,
                "No scope is currently open while resolving {}",
                self.requested,
            )?,
        }
        write!(f, "\n  Hint: Resolve through a scope opened with open_scope()")
    }
}

/// Error when resolution goes through a disposed scope.
#[derive(Debug)]
pub struct ScopeDisposedError {
    pub scope_name: Option<&'static str>,
}

impl fmt::Display for ScopeDisposedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope_name {
            Some(name) => write!(f, "Scope {name:?} is disposed"),
            None => write!(f, "Scope is disposed"),
        }?;
        write!(f, "\n  Hint: Instances of a disposed scope are gone; open a new scope")
    }
}

/// Error when an unbroken dependency cycle is detected.
///
/// Shows the full request chain so you can see WHERE the cycle is.
#[derive(Debug)]
pub struct CyclicDependencyError {
    /// The chain of requests that forms the cycle, e.g. `[A, B, C, A]`.
    pub chain: Vec<ServiceKey>,
}

impl fmt::Display for CyclicDependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain: Vec<String> = self.chain.iter().map(ServiceKey::to_string).collect();
        write!(f, "Cyclic dependency detected:\n  {}", render_chain(&chain))?;
        write!(
            f,
            "\n  Hint: Break the cycle with a lazy dependency or restructure the graph"
        )
    }
}

/// Convenient Result type for Tarkib operations.
pub type Result<T> = std::result::Result<T, ContainerError>;
