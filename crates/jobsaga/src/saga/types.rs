use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::NonCriticalFailure;
use crate::repository::Fields;
use crate::transaction::RequestId;

/// Validated input from the submission form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmission {
	/// Identifies the form submission, so a double submit is recognized.
	pub submission_id: String,
	pub title: String,
	/// The submitting member's id in the publishing system.
	pub member_id: String,
	/// Remaining job fields, copied onto both created records.
	#[serde(default, skip_serializing_if = "Fields::is_empty")]
	pub details: Fields,
}

impl JobSubmission {
	pub fn new(
		submission_id: impl Into<String>,
		title: impl Into<String>,
		member_id: impl Into<String>,
	) -> Self {
		Self {
			submission_id: submission_id.into(),
			title: title.into(),
			member_id: member_id.into(),
			details: Fields::new(),
		}
	}

	pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.details.insert(key.into(), value.into());
		self
	}
}

/// A job post that was created, linked and verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedJob {
	pub request_id: RequestId,
	pub job_record_id: String,
	pub publish_item_id: String,
	/// Optional side effects that failed.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub warnings: Vec<NonCriticalFailure>,
}
