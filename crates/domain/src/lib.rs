pub mod entities;
pub mod events;
pub mod executor;
pub mod repositories;

pub use entities::{
    AccountSession, AutomationRule, ConcurrencyLease, FailureKind, Job, JobFilter, JobKind,
    JobOutcome, JobStatus, LastError, NewJob, SessionHealth,
};
pub use events::JobFinishedEvent;
pub use executor::{ActionExecutor, ExecutionOutcome, ExecutorRegistry};
pub use repositories::{JobRepository, LeaseRepository, RuleRepository, SessionRepository};
