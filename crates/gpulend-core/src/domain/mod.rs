//! Domain types shared by the registry, matcher, dispatcher and supervisor.

pub mod api;
mod capability;
mod job;

pub use capability::{Capability, ResourceRequirement};
pub use job::{
    ArtifactRef, ExecutionLogs, JobOutcome, JobRequest, JobSession, JobState, PayloadRef, SessionEvent,
    Transition, TransitionError,
};
