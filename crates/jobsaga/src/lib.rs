//! Cross-service saga coordinator for publishing job posts.
//!
//! A submission creates a record in the job database, a linked item in the
//! publishing system, and a back-reference on the submitting member's
//! profile. Every write is retried with exponential backoff, verified after
//! the fact, and compensated in reverse order when a later step fails.
//!
//! The entry point is [`saga::SagaCoordinator::run`].

pub mod config;
pub mod error;
pub mod journal;
pub mod lock;
pub mod notify;
pub mod repository;
pub mod retry;
pub mod rollback;
pub mod saga;
pub mod store;
pub mod submission;
pub mod transaction;
pub mod verify;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::SagaConfig;
pub use error::{FailureKind, SagaError, SagaFailure};
pub use saga::{JobSubmission, PublishedJob, SagaCoordinator};
