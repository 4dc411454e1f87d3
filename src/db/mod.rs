//! Database module for the task queue
//!
//! Provides the [`TaskStore`] contract with a PostgreSQL implementation and an
//! in-process one for tests and local runs.

pub mod connection;
pub mod memory;
pub mod models;
pub mod pg;
pub mod store;

pub use connection::{create_pool, create_pool_from_env, run_migrations, DbPool};
pub use memory::MemoryTaskStore;
pub use models::*;
pub use pg::PgTaskStore;
pub use store::{
    complete_with_fallback, fail_with_fallback, failure_transition, next_failure_state,
    TaskStore, TaskTransition,
};
