//! Compensation of a partially completed saga.
//!
//! Steps run in reverse dependency order: member back-reference, then
//! publish item, then job record. Each step is attempted independently; a
//! failed step is reported in the result and never stops the others.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::lock::with_lock;
use crate::saga::{SagaContext, member_lock_key};
use crate::transaction::Transaction;

/// Outcome of a compensation run.
///
/// A `*_attempted` flag is true when its step was needed and ran, whatever
/// the outcome. A `*_cleaned` flag is true only when the step succeeded.
/// `completed` is true when every attempted step succeeded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationResult {
	pub job_attempted: bool,
	pub job_cleaned: bool,
	pub item_attempted: bool,
	pub item_cleaned: bool,
	pub member_attempted: bool,
	pub member_cleaned: bool,
	pub completed: bool,
}

/// Undo whatever `tx` records as created. `reason` is passed to the job
/// database with the delete.
pub async fn compensate(ctx: &SagaContext, tx: &Transaction, reason: &str) -> CompensationResult {
	let state = tx.state();
	let request_id = ctx.request_id;
	let mut result = CompensationResult::default();
	let mut all_succeeded = true;

	info!(
		%request_id,
		job_record_id = ?state.job_record_id,
		publish_item_id = ?state.publish_item_id,
		member_link_pending = state.member_link_pending(),
		"starting compensation"
	);

	if state.member_link_pending()
		&& let Some(item_id) = &state.publish_item_id
	{
		let member_id = &tx.form_snapshot().member_id;
		result.member_attempted = true;
		let removed = with_lock(
			ctx.lock.as_ref(),
			&member_lock_key(member_id),
			&ctx.holder_id(),
			ctx.lock_timeout,
			|lease| async move {
				ctx
					.members
					.remove_back_reference(request_id, member_id, item_id, &lease)
					.await
			},
		)
		.await;
		match removed {
			Ok(was_present) => {
				info!(%request_id, member_id, was_present, "removed member back-reference");
				result.member_cleaned = true;
			},
			Err(e) => {
				error!(%request_id, member_id, error = %e, "failed to remove member back-reference");
				all_succeeded = false;
			},
		}
	} else {
		debug!(%request_id, "no member link to compensate");
	}

	if let Some(item_id) = &state.publish_item_id {
		result.item_attempted = true;
		match ctx.items.delete(request_id, item_id).await {
			Ok(existed) => {
				info!(%request_id, item_id, existed, "deleted publish item");
				result.item_cleaned = true;
			},
			Err(e) => {
				error!(%request_id, item_id, error = %e, "failed to delete publish item");
				all_succeeded = false;
			},
		}
	}

	if let Some(job_id) = &state.job_record_id {
		result.job_attempted = true;
		match ctx.jobs.delete(request_id, job_id, reason).await {
			Ok(existed) => {
				info!(%request_id, job_id, existed, "deleted job record");
				result.job_cleaned = true;
			},
			Err(e) => {
				error!(%request_id, job_id, error = %e, "failed to delete job record");
				all_succeeded = false;
			},
		}
	}

	result.completed = all_succeeded;
	if all_succeeded {
		info!(%request_id, "compensation completed");
	} else {
		error!(%request_id, ?result, "compensation incomplete, manual cleanup required");
	}
	result
}
