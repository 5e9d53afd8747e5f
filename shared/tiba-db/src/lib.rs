//! Tiba DB
//!
//! PostgreSQL wire-protocol connection pool shared by services that persist state.

mod error;
mod pool;

pub use error::{DbError, Result};
pub use pool::{DbPool, PoolConfig};

/// Re-export tokio-postgres types for convenience
pub use tokio_postgres::{types::ToSql, Row};
