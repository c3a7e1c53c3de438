//! The aggregate root of one saga execution.
//!
//! A [`Transaction`] tracks progress flags in a [`TransactionState`] and an
//! append-only log of [`Checkpoint`]s. Every change goes through
//! [`Transaction::record`], which refuses updates that would break the
//! transaction's invariants.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::FailureKind;
use crate::saga::JobSubmission;

/// Correlates every request, log line and compensation of one saga attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	pub fn as_uuid(&self) -> Uuid {
		self.0
	}
}

impl Default for RequestId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for RequestId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}

/// States of the publish-job saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SagaPhase {
	#[default]
	Init,
	CollectingInput,
	ResolvingMember,
	CreatingJobRecord,
	CreatingPublishItem,
	LinkingSelfReference,
	UpdatingJobRecordWithLink,
	LinkingMemberProfile,
	Verifying,
	/// Terminal success.
	Completing,
	Failed,
	Compensating,
	/// Terminal failure.
	Reported,
}

impl SagaPhase {
	pub fn as_str(&self) -> &'static str {
		match self {
			SagaPhase::Init => "init",
			SagaPhase::CollectingInput => "collecting-input",
			SagaPhase::ResolvingMember => "resolving-member",
			SagaPhase::CreatingJobRecord => "creating-job-record",
			SagaPhase::CreatingPublishItem => "creating-publish-item",
			SagaPhase::LinkingSelfReference => "linking-self-reference",
			SagaPhase::UpdatingJobRecordWithLink => "updating-job-record-with-link",
			SagaPhase::LinkingMemberProfile => "linking-member-profile",
			SagaPhase::Verifying => "verifying",
			SagaPhase::Completing => "completing",
			SagaPhase::Failed => "failed",
			SagaPhase::Compensating => "compensating",
			SagaPhase::Reported => "reported",
		}
	}
}

impl fmt::Display for SagaPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Named progress flags of one saga execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionState {
	pub phase: SagaPhase,
	pub job_record_id: Option<String>,
	pub publish_item_id: Option<String>,
	pub member_lookup_id: Option<String>,
	pub self_linked: bool,
	pub job_record_linked: bool,
	/// A back-reference write was sent; it may have landed even if the call failed.
	pub member_link_attempted: bool,
	pub member_linked: bool,
	pub secondary_credit_applied: bool,
	pub verification_passed: bool,
	pub completed: bool,
	/// A compensation step ran for the sub-system, whether or not it succeeded.
	pub job_record_cleanup_attempted: bool,
	pub publish_item_cleanup_attempted: bool,
	pub member_link_cleanup_attempted: bool,
	pub job_record_cleaned: bool,
	pub publish_item_cleaned: bool,
	pub member_link_cleaned: bool,
	pub rollback_completed: bool,
}

/// A partial update to [`TransactionState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StateUpdate {
	#[serde(rename_all = "camelCase")]
	PhaseEntered { phase: SagaPhase },
	#[serde(rename_all = "camelCase")]
	MemberResolved { member_lookup_id: String },
	#[serde(rename_all = "camelCase")]
	JobRecordCreated { job_record_id: String },
	#[serde(rename_all = "camelCase")]
	PublishItemCreated { publish_item_id: String },
	SelfLinked,
	JobRecordLinked,
	MemberLinkAttempted,
	MemberLinked,
	VerificationPassed,
	CreditApplied,
	Completed,
	#[serde(rename_all = "camelCase")]
	Failed { failure: FailureKind, message: String },
	#[serde(rename_all = "camelCase")]
	Compensated {
		job_record_cleanup_attempted: bool,
		publish_item_cleanup_attempted: bool,
		member_link_cleanup_attempted: bool,
		job_record_cleaned: bool,
		publish_item_cleaned: bool,
		member_link_cleaned: bool,
		rollback_completed: bool,
	},
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
	pub at: DateTime<Utc>,
	pub update: StateUpdate,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
	#[error("job record id is already set to '{0}'")]
	JobRecordAlreadySet(String),

	#[error("publish item id is already set to '{0}'")]
	PublishItemAlreadySet(String),

	#[error("cannot complete a transaction that has not passed verification")]
	CompletedWithoutVerification,
}

impl TransactionState {
	fn check(&self, update: &StateUpdate) -> Result<(), TransactionError> {
		match update {
			StateUpdate::JobRecordCreated { .. } => match &self.job_record_id {
				Some(existing) => Err(TransactionError::JobRecordAlreadySet(existing.clone())),
				None => Ok(()),
			},
			StateUpdate::PublishItemCreated { .. } => match &self.publish_item_id {
				Some(existing) => Err(TransactionError::PublishItemAlreadySet(existing.clone())),
				None => Ok(()),
			},
			StateUpdate::Completed if !self.verification_passed => {
				Err(TransactionError::CompletedWithoutVerification)
			},
			_ => Ok(()),
		}
	}

	fn apply(&mut self, update: &StateUpdate) {
		match update {
			StateUpdate::PhaseEntered { phase } => self.phase = *phase,
			StateUpdate::MemberResolved { member_lookup_id } => {
				self.member_lookup_id = Some(member_lookup_id.clone())
			},
			StateUpdate::JobRecordCreated { job_record_id } => {
				self.job_record_id = Some(job_record_id.clone())
			},
			StateUpdate::PublishItemCreated { publish_item_id } => {
				self.publish_item_id = Some(publish_item_id.clone())
			},
			StateUpdate::SelfLinked => self.self_linked = true,
			StateUpdate::JobRecordLinked => self.job_record_linked = true,
			StateUpdate::MemberLinkAttempted => self.member_link_attempted = true,
			StateUpdate::MemberLinked => self.member_linked = true,
			StateUpdate::VerificationPassed => self.verification_passed = true,
			StateUpdate::CreditApplied => self.secondary_credit_applied = true,
			StateUpdate::Completed => self.completed = true,
			StateUpdate::Failed { .. } => {},
			StateUpdate::Compensated {
				job_record_cleanup_attempted,
				publish_item_cleanup_attempted,
				member_link_cleanup_attempted,
				job_record_cleaned,
				publish_item_cleaned,
				member_link_cleaned,
				rollback_completed,
			} => {
				self.job_record_cleanup_attempted = *job_record_cleanup_attempted;
				self.publish_item_cleanup_attempted = *publish_item_cleanup_attempted;
				self.member_link_cleanup_attempted = *member_link_cleanup_attempted;
				self.job_record_cleaned = *job_record_cleaned;
				self.publish_item_cleaned = *publish_item_cleaned;
				self.member_link_cleaned = *member_link_cleaned;
				self.rollback_completed = *rollback_completed;
			},
		}
	}

	/// Whether the member back-reference may exist and needs compensating.
	pub fn member_link_pending(&self) -> bool {
		self.member_linked || self.member_link_attempted
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
	id: RequestId,
	started_at: DateTime<Utc>,
	state: TransactionState,
	checkpoints: Vec<Checkpoint>,
	form_snapshot: JobSubmission,
}

impl Transaction {
	/// Start a transaction seeded by an immutable snapshot of the submission.
	pub fn begin(form_snapshot: JobSubmission) -> Self {
		Self {
			id: RequestId::new(),
			started_at: Utc::now(),
			state: TransactionState::default(),
			checkpoints: Vec::new(),
			form_snapshot,
		}
	}

	pub fn id(&self) -> RequestId {
		self.id
	}

	pub fn started_at(&self) -> DateTime<Utc> {
		self.started_at
	}

	pub fn state(&self) -> &TransactionState {
		&self.state
	}

	pub fn checkpoints(&self) -> &[Checkpoint] {
		&self.checkpoints
	}

	pub fn form_snapshot(&self) -> &JobSubmission {
		&self.form_snapshot
	}

	/// Apply `update` and append it to the checkpoint log.
	///
	/// A refused update leaves both the state and the log untouched.
	pub fn record(&mut self, update: StateUpdate) -> Result<(), TransactionError> {
		self.state.check(&update)?;
		self.state.apply(&update);
		self.checkpoints.push(Checkpoint {
			at: Utc::now(),
			update,
		});
		Ok(())
	}
}
