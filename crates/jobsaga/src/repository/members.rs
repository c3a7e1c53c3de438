//! Member profiles and their list of back-references to published items.
//!
//! Writes are read-merge-write under an advisory lock held by the caller.
//! References that no longer resolve are pruned before every write, since
//! the publishing system rejects a list containing a dangling id.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::items::PublishItemRepository;
use super::{Fields, RepositoryError, RequestId};
use crate::error::StepError;
use crate::lock::LockLease;
use crate::retry::{RetryPolicy, retry_if};

#[derive(Debug, Clone, PartialEq)]
pub struct MemberProfile {
	pub id: String,
	pub back_references: Vec<String>,
	pub fields: Fields,
}

/// Raw reads and writes of member profiles.
#[async_trait]
pub trait MemberProfileApi: Send + Sync {
	async fn fetch(&self, request_id: RequestId, member_id: &str) -> Result<MemberProfile, RepositoryError>;

	/// Replace the member's back-reference list. `fencing_token` identifies
	/// the lease the write is made under.
	async fn write_back_references(
		&self,
		request_id: RequestId,
		member_id: &str,
		references: &[String],
		fencing_token: u64,
	) -> Result<(), RepositoryError>;

	/// Retry policy for back-reference writes. [`MemberProfiles`] runs the
	/// retries itself so the lease is checked before every attempt;
	/// `write_back_references` must make a single attempt.
	fn write_retry(&self) -> RetryPolicy {
		RetryPolicy::no_retry()
	}
}

/// A member's back-reference list merged with one new reference, not yet
/// written.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedReferences {
	pub reference: String,
	pub references: Vec<String>,
	/// False when the stored list already equals `references`.
	pub changed: bool,
}

/// Member-profile repository.
#[derive(Clone)]
pub struct MemberProfiles {
	api: Arc<dyn MemberProfileApi>,
	items: Arc<dyn PublishItemRepository>,
}

impl MemberProfiles {
	pub fn new(api: Arc<dyn MemberProfileApi>, items: Arc<dyn PublishItemRepository>) -> Self {
		Self { api, items }
	}

	pub async fn get(&self, request_id: RequestId, member_id: &str) -> Result<MemberProfile, RepositoryError> {
		self.api.fetch(request_id, member_id).await
	}

	/// Add `reference` to the member's list, pruning stale entries.
	///
	/// Returns the list that was written (or that already held, if nothing
	/// changed).
	pub async fn append_back_reference(
		&self,
		request_id: RequestId,
		member_id: &str,
		reference: &str,
		lease: &LockLease,
	) -> Result<Vec<String>, StepError> {
		let merged = self
			.merge_back_reference(request_id, member_id, reference)
			.await?;
		self
			.commit_back_reference(request_id, member_id, merged, lease)
			.await
	}

	/// Read the member's list, prune it and add `reference`. Nothing is written.
	pub async fn merge_back_reference(
		&self,
		request_id: RequestId,
		member_id: &str,
		reference: &str,
	) -> Result<MergedReferences, RepositoryError> {
		let profile = self.api.fetch(request_id, member_id).await?;
		let mut references = self
			.prune(request_id, dedupe(&profile.back_references), Some(reference))
			.await;
		if !references.iter().any(|id| id == reference) {
			references.push(reference.to_string());
		}
		let changed = references != profile.back_references;
		Ok(MergedReferences {
			reference: reference.to_string(),
			references,
			changed,
		})
	}

	/// Write a merged list under `lease`. Sends nothing when the list did not
	/// change.
	pub async fn commit_back_reference(
		&self,
		request_id: RequestId,
		member_id: &str,
		merged: MergedReferences,
		lease: &LockLease,
	) -> Result<Vec<String>, StepError> {
		if !merged.changed {
			debug!(member_id, reference = %merged.reference, %request_id, "back-reference already present");
			return Ok(merged.references);
		}
		self
			.write(
				request_id,
				member_id,
				merged.references,
				Some(&merged.reference),
				lease,
			)
			.await
	}

	/// Remove `reference` from the member's list. Returns `false` if it was
	/// not there.
	pub async fn remove_back_reference(
		&self,
		request_id: RequestId,
		member_id: &str,
		reference: &str,
		lease: &LockLease,
	) -> Result<bool, StepError> {
		let profile = self.api.fetch(request_id, member_id).await?;
		if !profile.back_references.iter().any(|id| id == reference) {
			return Ok(false);
		}
		let remaining: Vec<String> = dedupe(&profile.back_references)
			.into_iter()
			.filter(|id| id != reference)
			.collect();
		let remaining = self.prune(request_id, remaining, None).await;
		self
			.write(request_id, member_id, remaining, None, lease)
			.await?;
		Ok(true)
	}

	/// Drop references whose item no longer exists.
	///
	/// A reference is only dropped when the lookup positively says it is
	/// gone; lookup errors keep it. `keep` is never checked or dropped.
	async fn prune(&self, request_id: RequestId, references: Vec<String>, keep: Option<&str>) -> Vec<String> {
		let checks = references.iter().map(|id| async move {
			if Some(id.as_str()) == keep {
				return true;
			}
			match self.items.exists(request_id, id).await {
				Ok(exists) => exists,
				Err(e) => {
					warn!(reference = %id, %request_id, error = %e, "could not check reference, keeping it");
					true
				},
			}
		});
		let results = join_all(checks).await;

		let mut kept = Vec::with_capacity(references.len());
		for (id, resolves) in references.into_iter().zip(results) {
			if resolves {
				kept.push(id);
			} else {
				info!(reference = %id, %request_id, "pruning stale back-reference");
			}
		}
		kept
	}

	/// Write `references`, retrying once without a single rejected id.
	async fn write(
		&self,
		request_id: RequestId,
		member_id: &str,
		mut references: Vec<String>,
		protected: Option<&str>,
		lease: &LockLease,
	) -> Result<Vec<String>, StepError> {
		let rejected = match self.send(request_id, member_id, &references, lease).await {
			Ok(()) => return Ok(references),
			Err(StepError::Repository(RepositoryError::RejectedReference { reference }))
				if Some(reference.as_str()) != protected && references.contains(&reference) =>
			{
				reference
			},
			Err(e) => return Err(e),
		};

		warn!(member_id, reference = %rejected, %request_id, "write rejected a reference, retrying without it");
		references.retain(|id| *id != rejected);
		self.send(request_id, member_id, &references, lease).await?;
		Ok(references)
	}

	/// One fenced write, retried on transient failures. The lease must still
	/// be live before every attempt.
	async fn send(
		&self,
		request_id: RequestId,
		member_id: &str,
		references: &[String],
		lease: &LockLease,
	) -> Result<(), StepError> {
		let api = self.api.as_ref();
		retry_if(
			&api.write_retry(),
			"member.update",
			move || async move {
				lease.ensure_live()?;
				api
					.write_back_references(request_id, member_id, references, lease.fencing_token)
					.await?;
				Ok::<(), StepError>(())
			},
			StepError::is_retryable,
		)
		.await
	}
}

/// Remove duplicates, keeping the first occurrence of each id.
fn dedupe(references: &[String]) -> Vec<String> {
	let mut seen = std::collections::HashSet::new();
	references
		.iter()
		.filter(|id| !id.is_empty() && seen.insert(id.as_str()))
		.cloned()
		.collect()
}
