//! The publish-job saga.
//!
//! One call to [`SagaCoordinator::run`] takes a submission through:
//!
//! ```text
//! Init -> CollectingInput -> ResolvingMember -> CreatingJobRecord
//!      -> CreatingPublishItem -> LinkingSelfReference
//!      -> UpdatingJobRecordWithLink -> LinkingMemberProfile
//!      -> Verifying -> Completing
//! ```
//!
//! Any failure from `CreatingJobRecord` on moves to
//! `Failed -> Compensating -> Reported`, undoing what was created in reverse
//! order. Earlier failures go straight to `Failed -> Reported`.

mod context;
mod coordinator;
mod types;

pub use context::{SagaContext, SagaServices, member_lock_key};
pub use coordinator::SagaCoordinator;
pub use types::{JobSubmission, PublishedJob};

pub use crate::transaction::SagaPhase;
