use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::LockError;
use crate::repository::RepositoryError;
use crate::rollback::CompensationResult;
use crate::transaction::{RequestId, SagaPhase, Transaction};

/// Classification of every way a saga can fail.
///
/// Callers render user-facing messages from this; notification payloads
/// carry it instead of a raw error chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
	/// Required input was missing. Nothing was created.
	Validation,
	/// The submitting member has no backing record. Nothing was created.
	Lookup,
	/// A create call exhausted its retries.
	Creation,
	/// An update or link step exhausted its retries.
	Link,
	/// Post-write checks did not all pass.
	VerificationFailure,
	/// One or more compensation steps failed; needs a human.
	CompensationPartialFailure,
	/// An optional side effect failed; the saga still succeeded.
	NonCriticalFailure,
	/// A saga for the same submission is already running.
	DuplicateSubmission,
}

impl FailureKind {
	/// Whether a failure of this kind happens after something was created.
	pub fn requires_compensation(&self) -> bool {
		matches!(
			self,
			FailureKind::Creation | FailureKind::Link | FailureKind::VerificationFailure
		)
	}
}

/// External system a step talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Resource {
	JobRecord,
	PublishItem,
	MemberProfile,
	Credit,
}

impl std::fmt::Display for Resource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Resource::JobRecord => "job record",
			Resource::PublishItem => "publish item",
			Resource::MemberProfile => "member profile",
			Resource::Credit => "credit",
		})
	}
}

/// Why a link step failed.
#[derive(Debug, Error)]
pub enum StepError {
	#[error(transparent)]
	Repository(#[from] RepositoryError),

	#[error(transparent)]
	Lock(#[from] LockError),
}

impl StepError {
	/// Lock failures are never retried; repository failures follow
	/// [`RepositoryError::is_retryable`].
	pub fn is_retryable(&self) -> bool {
		match self {
			StepError::Repository(e) => e.is_retryable(),
			StepError::Lock(_) => false,
		}
	}
}

/// Errors that end a saga.
#[derive(Debug, Error)]
pub enum SagaError {
	#[error("missing required field '{field}'")]
	Validation { field: &'static str },

	#[error("submission '{submission_id}' is already being processed")]
	DuplicateSubmission { submission_id: String },

	#[error("no job-database record found for member '{member_id}'")]
	Lookup {
		member_id: String,
		#[source]
		source: Option<RepositoryError>,
	},

	#[error("failed to create {resource}: {source}")]
	Creation {
		resource: Resource,
		#[source]
		source: RepositoryError,
	},

	#[error("step '{phase}' failed: {source}")]
	Link {
		phase: SagaPhase,
		#[source]
		source: StepError,
	},

	#[error("verification failed: {}", .failed_checks.join(", "))]
	Verification { failed_checks: Vec<String> },
}

impl SagaError {
	pub fn kind(&self) -> FailureKind {
		match self {
			SagaError::Validation { .. } => FailureKind::Validation,
			SagaError::DuplicateSubmission { .. } => FailureKind::DuplicateSubmission,
			SagaError::Lookup { .. } => FailureKind::Lookup,
			SagaError::Creation { .. } => FailureKind::Creation,
			SagaError::Link { .. } => FailureKind::Link,
			SagaError::Verification { .. } => FailureKind::VerificationFailure,
		}
	}

	pub(crate) fn link(phase: SagaPhase, source: impl Into<StepError>) -> Self {
		SagaError::Link {
			phase,
			source: source.into(),
		}
	}
}

/// An optional side effect that failed without failing the saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonCriticalFailure {
	pub step: String,
	pub message: String,
}

impl NonCriticalFailure {
	pub fn kind(&self) -> FailureKind {
		FailureKind::NonCriticalFailure
	}
}

/// Terminal failure of a saga, with everything needed to diagnose it.
#[derive(Debug, Error)]
#[error("saga {} failed: {error}", .transaction.id())]
pub struct SagaFailure {
	#[source]
	pub error: SagaError,
	/// Final transaction state and checkpoint log.
	pub transaction: Box<Transaction>,
	/// Present when the failure happened after something was created.
	pub compensation: Option<CompensationResult>,
}

impl SagaFailure {
	/// The failure's classification. A compensation that did not fully
	/// complete takes precedence over the original cause.
	pub fn kind(&self) -> FailureKind {
		match &self.compensation {
			Some(result) if !result.completed => FailureKind::CompensationPartialFailure,
			_ => self.error.kind(),
		}
	}

	pub fn request_id(&self) -> RequestId {
		self.transaction.id()
	}
}
