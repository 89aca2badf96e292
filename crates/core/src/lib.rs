//! `jobforge-core`: domain building blocks of the job pipeline.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! job records, the lifecycle state machine, opaque payloads, retry policy
//! and the broker message contract.

pub mod error;
pub mod id;
pub mod job;
pub mod message;
pub mod payload;
pub mod policy;
pub mod state;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use job::{DEFAULT_KIND, ErrorKind, Job, JobError, JobUpdate, Lease};
pub use message::{DeliveryToken, MessageHandle, TaskMessage};
pub use payload::Payload;
pub use policy::{JobPolicy, PolicyTable, RetryPolicy, category_match};
pub use state::JobState;
