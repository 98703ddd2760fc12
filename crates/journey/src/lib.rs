//! Contact journey automation: versioned step graphs triggered by domain
//! events, executed by a polling scheduler with claim-based coordination and
//! an idempotent execution log.

pub mod collaborators;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod executor;
pub mod graph;
pub mod predicate;
pub mod render;
pub mod retry;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod trigger;
pub mod types;

pub use collaborators::{
    Collaborators, ContactDirectory, ContactSnapshot, EffectError, EmailSender, WebhookCaller,
};
pub use dispatcher::{DispatchReport, TriggerDispatcher};
pub use engine::{DefinitionUpdate, ExitReport, JourneyEngine, NewAutomation};
pub use error::{JourneyError, JourneyResult};
pub use executor::{RunOutcome, RunReport, StepExecutor};
pub use graph::{Step, StepGraph, StepId, StepKind};
pub use scheduler::{Scheduler, SchedulerSettings, TickReport};
pub use store::Stores;
pub use types::{Automation, Enrollment, EnrollmentFilter, EnrollmentStatus, ExecutionLogEntry};
