//! Repository functions: one function per database operation.
//!
//! Every function takes a pool or a connection and returns a
//! `Result<T, DbError>`. No business logic, no domain types, only SQL.

pub mod automations;
pub mod enrollments;
pub mod execution_log;
pub mod trigger_log;
