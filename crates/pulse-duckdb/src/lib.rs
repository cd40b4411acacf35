pub mod backend;
pub mod events;
pub mod realtime;
pub mod schema;
pub mod session;
pub mod writes;

pub use backend::DuckDbBackend;

/// Re-export the `duckdb` crate so consumers (especially tests) can use
/// `pulse_duckdb::duckdb::params!` without an extra dependency.
pub use duckdb;
