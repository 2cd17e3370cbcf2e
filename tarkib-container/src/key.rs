//! Service identification keys.
//!
//! [`ServiceKey`] identifies *what* a resolution request asks for.
//! It combines a [`TypeId`] with an optional discriminator for keyed
//! registrations (multiple implementations of the same service type).

use std::any::{TypeId, type_name};
use std::fmt;
use std::hash::{Hash, Hasher};

use tarkib_support::rendering::shorten_type_name;

/// Uniquely identifies a service within the container.
///
/// Each service is identified by its Rust type ([`TypeId`]) and an optional
/// key for cases where several registrations of the same type must coexist.
/// The unkeyed registration is the *default* one.
///
/// # Examples
/// ```
/// use tarkib_container::key::ServiceKey;
///
/// // Default key — just a type
/// let key = ServiceKey::of::<String>();
/// assert_eq!(key.type_name(), "alloc::string::String");
/// assert_eq!(key.key(), None);
///
/// // Keyed — type + discriminator
/// let key = ServiceKey::keyed::<String>("primary");
/// assert_eq!(key.key(), Some("primary"));
/// ```
#[derive(Clone)]
pub struct ServiceKey {
    type_id: TypeId,
    type_name: &'static str,
    key: Option<&'static str>,
}

impl ServiceKey {
    /// Creates the default (unkeyed) key for type `T`.
    #[inline]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            key: None,
        }
    }

    /// Creates a keyed variant for type `T`.
    ///
    /// Keyed registrations coexist with the default one and with each
    /// other; they are only picked when requested by the same key.
    #[inline]
    pub fn keyed<T: ?Sized + 'static>(key: &'static str) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            key: Some(key),
        }
    }

    /// Creates a key from a raw [`TypeId`] and type name.
    ///
    /// Prefer [`ServiceKey::of`] when possible — this exists for
    /// registration sources that carry pre-erased type information.
    #[inline]
    pub fn from_raw(type_id: TypeId, type_name: &'static str, key: Option<&'static str>) -> Self {
        Self { type_id, type_name, key }
    }

    /// Returns the [`TypeId`] of the requested service type.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Returns the human-readable type name (used in error messages).
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Returns the discriminator of a keyed registration.
    #[inline]
    pub fn key(&self) -> Option<&'static str> {
        self.key
    }

    /// Returns `true` for keyed registrations.
    #[inline]
    pub fn is_keyed(&self) -> bool {
        self.key.is_some()
    }
}

// Two keys are equal when both TypeId and discriminator match.
impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.key == other.key
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.key.hash(state);
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key {
            Some(key) => write!(f, "ServiceKey({}, key={:?})", self.type_name, key),
            None => write!(f, "ServiceKey({})", self.type_name),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = shorten_type_name(self.type_name);
        match self.key {
            Some(key) => write!(f, "{short} (key={key:?})"),
            None => write!(f, "{short}"),
        }
    }
}
