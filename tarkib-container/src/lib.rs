//! Core resolution engine for Tarkib DI.

pub mod container;
pub mod context;
pub mod error;
pub mod key;
pub mod provider;
pub mod registry;
pub mod resolver;
pub mod reuse;
pub mod scope;

mod plan;
mod verify;

pub use container::prelude;
pub use container::{Container, ContainerBuilder, ScopedContainer};
pub use error::{ContainerError, ErrorCode, Result};
pub use key::ServiceKey;
pub use reuse::Reuse;
