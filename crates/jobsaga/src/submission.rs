//! Guard against the same submission starting two sagas (e.g. a double click).
//!
//! This is independent of the per-member lock, which serializes *different*
//! submissions touching the same member profile.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

/// Tracks submissions that currently have a saga in flight.
#[derive(Debug, Default, Clone)]
pub struct SubmissionGuard {
	in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Held for the duration of a saga; frees the submission id on drop.
#[derive(Debug)]
pub struct SubmissionTicket {
	submission_id: String,
	in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SubmissionGuard {
	pub fn new() -> Self {
		Self::default()
	}

	/// Returns `None` if a saga for `submission_id` is already running.
	pub fn enter(&self, submission_id: &str) -> Option<SubmissionTicket> {
		let mut in_flight = self.in_flight.lock();
		if !in_flight.insert(submission_id.to_string()) {
			return None;
		}
		Some(SubmissionTicket {
			submission_id: submission_id.to_string(),
			in_flight: self.in_flight.clone(),
		})
	}

	pub fn is_in_flight(&self, submission_id: &str) -> bool {
		self.in_flight.lock().contains(submission_id)
	}
}

impl SubmissionTicket {
	pub fn submission_id(&self) -> &str {
		&self.submission_id
	}
}

impl Drop for SubmissionTicket {
	fn drop(&mut self) {
		self.in_flight.lock().remove(&self.submission_id);
	}
}
