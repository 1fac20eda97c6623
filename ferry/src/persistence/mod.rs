/// In-memory store for tests and single-process embedding.
pub mod memory;

#[cfg(feature = "postgres")]
/// PostgreSQL-backed store, enabled with the `postgres` feature.
pub mod postgres;

pub use memory::InMemoryJobStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresJobStore;
