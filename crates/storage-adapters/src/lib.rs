//! Persistence adapters for the engine's ports.
//!
//! [`memory::InMemoryStore`] is always available and backs tests and local
//! runs. The PostgreSQL store is compiled with the `db-postgres` feature.

pub mod memory;

#[cfg(feature = "db-postgres")]
pub mod postgres;

pub use memory::{InMemoryStore, Seed};

#[cfg(feature = "db-postgres")]
pub use postgres::PgStore;
