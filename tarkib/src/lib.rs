//! # Tarkib — Dependency Injection Container for Rust
//!
//! A resolution engine with copy-on-write registrations, nested lifetime
//! scopes, deterministic disposal and cached construction plans, inspired
//! by DIshka, Laravel Container and .NET Dependency Injection.

pub use tarkib_container::*;
pub use tarkib_support::rendering;
