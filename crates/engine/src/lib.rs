//! `engine` crate: automation definitions, trigger dispatch, the scheduler
//! loop and ledger statistics.
//!
//! The pieces share one [`db::AutomationStore`]:
//! - [`AutomationService`] validates and stores definitions and drives their lifecycle.
//! - [`TriggerDispatcher`] enrolls contacts when a timeline event matches a live automation.
//! - [`Scheduler`] advances due enrollments node by node.
//! - [`StatsAggregator`] answers counter and history queries.

pub mod config;
pub mod dag;
pub mod definitions;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod stats;

pub use config::{DispatcherConfig, SchedulerConfig};
pub use dag::validate_definition;
pub use definitions::AutomationService;
pub use dispatcher::{TriggerDispatcher, TriggerOutcome};
pub use error::EngineError;
pub use models::{
    normalize_email, Automation, AutomationDefinition, AutomationStatus, ContactTimelineEvent,
    Enrollment, EnrollmentStatus, Frequency, LogAction, TriggerConfig,
};
pub use scheduler::{Collaborators, Scheduler, TickReport};
pub use stats::{AutomationStats, ExecutionLogEntry, StatsAggregator};
