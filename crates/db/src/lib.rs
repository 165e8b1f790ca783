//! `db` crate: pure persistence layer.
//!
//! Provides the [`AutomationStore`] contract over the four automation
//! relations (definitions, enrollment ledger, trigger log, execution log), a
//! Postgres implementation and an in-memory one with the same semantics.
//! No business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use pool::DbPool;
pub use postgres::PgStore;
pub use store::{AutomationStore, EnrollOutcome, EnrollmentUpdate, Lease, NewEnrollment};
