//! Post-write consistency checks.
//!
//! Each check reads back one cross-reference the saga wrote. Checks are
//! independent and run concurrently; the saga only succeeds if none of them
//! failed. A check against an endpoint that is merely unavailable may
//! soft-pass, but the checks on the saga's own core writes never do.

use serde::Serialize;
use tracing::{info, warn};

use crate::repository::RepositoryError;
use crate::saga::SagaContext;
use crate::transaction::Transaction;

pub const SELF_LINK_CHECK: &str = "publish-item-self-link";
pub const MEMBER_BACK_REFERENCE_CHECK: &str = "member-back-reference";
pub const JOB_RECORD_LINK_CHECK: &str = "job-record-link";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum CheckOutcome {
	Passed,
	/// The endpoint was unavailable; not held against the saga.
	SoftPassed { reason: String },
	Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
	pub name: &'static str,
	#[serde(flatten)]
	pub outcome: CheckOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
	pub checks: Vec<CheckResult>,
}

impl VerificationReport {
	pub fn passed(&self) -> bool {
		self
			.checks
			.iter()
			.all(|c| !matches!(c.outcome, CheckOutcome::Failed { .. }))
	}

	pub fn failed_checks(&self) -> Vec<String> {
		self
			.checks
			.iter()
			.filter(|c| matches!(c.outcome, CheckOutcome::Failed { .. }))
			.map(|c| c.name.to_string())
			.collect()
	}
}

fn failed(reason: impl Into<String>) -> CheckOutcome {
	CheckOutcome::Failed {
		reason: reason.into(),
	}
}

/// Returns true only if every check passed.
pub async fn verify(ctx: &SagaContext, tx: &Transaction) -> bool {
	run_checks(ctx, tx).await.passed()
}

pub async fn run_checks(ctx: &SagaContext, tx: &Transaction) -> VerificationReport {
	let (self_link, back_reference, job_link) = futures::join!(
		check_self_link(ctx, tx),
		check_member_back_reference(ctx, tx),
		check_job_record_link(ctx, tx),
	);

	let report = VerificationReport {
		checks: vec![
			CheckResult {
				name: SELF_LINK_CHECK,
				outcome: self_link,
			},
			CheckResult {
				name: MEMBER_BACK_REFERENCE_CHECK,
				outcome: back_reference,
			},
			CheckResult {
				name: JOB_RECORD_LINK_CHECK,
				outcome: job_link,
			},
		],
	};

	for check in &report.checks {
		match &check.outcome {
			CheckOutcome::Passed => {},
			CheckOutcome::SoftPassed { reason } => {
				warn!(request_id = %ctx.request_id, check = check.name, reason, "check soft-passed")
			},
			CheckOutcome::Failed { reason } => {
				warn!(request_id = %ctx.request_id, check = check.name, reason, "check failed")
			},
		}
	}
	info!(request_id = %ctx.request_id, passed = report.passed(), "verification finished");
	report
}

/// The publish item carries its own id and is slugged by the job record id.
async fn check_self_link(ctx: &SagaContext, tx: &Transaction) -> CheckOutcome {
	let state = tx.state();
	let (Some(item_id), Some(job_id)) = (&state.publish_item_id, &state.job_record_id) else {
		return failed("no publish item or job record recorded");
	};
	let item = match ctx.items.get(ctx.request_id, item_id).await {
		Ok(item) => item,
		Err(e) => return failed(format!("could not read publish item: {e}")),
	};

	let self_link = item.field_str(&ctx.fields.self_link);
	if self_link != Some(item_id.as_str()) {
		return failed(format!("self-link is {self_link:?}, expected {item_id}"));
	}
	let slug = item.field_str(&ctx.fields.slug);
	if slug != Some(job_id.as_str()) {
		return failed(format!("slug is {slug:?}, expected {job_id}"));
	}
	CheckOutcome::Passed
}

/// The member's back-reference list contains the new item.
async fn check_member_back_reference(ctx: &SagaContext, tx: &Transaction) -> CheckOutcome {
	let Some(item_id) = &tx.state().publish_item_id else {
		return failed("no publish item recorded");
	};
	let member_id = &tx.form_snapshot().member_id;
	match ctx.members.get(ctx.request_id, member_id).await {
		Ok(profile) if profile.back_references.contains(item_id) => CheckOutcome::Passed,
		Ok(_) => failed(format!("member {member_id} does not reference {item_id}")),
		Err(e) => failed(format!("could not read member profile: {e}")),
	}
}

/// The job record points at the publish item. The job database's read
/// endpoint is not on the saga's write path, so its outages soft-pass.
async fn check_job_record_link(ctx: &SagaContext, tx: &Transaction) -> CheckOutcome {
	let state = tx.state();
	let (Some(item_id), Some(job_id)) = (&state.publish_item_id, &state.job_record_id) else {
		return failed("no publish item or job record recorded");
	};
	match ctx.jobs.lookup(ctx.request_id, job_id).await {
		Ok(record) if record.linked_item_id.as_deref() == Some(item_id.as_str()) => CheckOutcome::Passed,
		Ok(record) => failed(format!(
			"job record links {:?}, expected {item_id}",
			record.linked_item_id
		)),
		Err(e) if e.is_unavailable() => CheckOutcome::SoftPassed {
			reason: format!("job record lookup unavailable: {e}"),
		},
		Err(RepositoryError::NotFound) => failed(format!("job record {job_id} not found")),
		Err(e) => failed(format!("could not read job record: {e}")),
	}
}
