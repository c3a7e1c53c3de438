use std::sync::Arc;
use std::time::Duration;

use crate::config::FieldNames;
use crate::lock::AdvisoryLock;
use crate::repository::{
	CreditService, JobRecordRepository, MemberProfileApi, MemberProfiles, PublishItemRepository,
	RequestId,
};

/// The external systems a saga talks to, shared by every saga.
#[derive(Clone)]
pub struct SagaServices {
	pub jobs: Arc<dyn JobRecordRepository>,
	pub items: Arc<dyn PublishItemRepository>,
	pub members: Arc<dyn MemberProfileApi>,
	/// Skipped when absent.
	pub credits: Option<Arc<dyn CreditService>>,
}

/// Everything one saga invocation needs, built fresh for each run.
#[derive(Clone)]
pub struct SagaContext {
	pub request_id: RequestId,
	pub jobs: Arc<dyn JobRecordRepository>,
	pub items: Arc<dyn PublishItemRepository>,
	pub members: MemberProfiles,
	pub credits: Option<Arc<dyn CreditService>>,
	pub lock: Arc<dyn AdvisoryLock>,
	pub lock_timeout: Duration,
	pub fields: FieldNames,
}

impl SagaContext {
	pub fn new(
		request_id: RequestId,
		services: &SagaServices,
		lock: Arc<dyn AdvisoryLock>,
		lock_timeout: Duration,
		fields: FieldNames,
	) -> Self {
		Self {
			request_id,
			jobs: services.jobs.clone(),
			items: services.items.clone(),
			members: MemberProfiles::new(services.members.clone(), services.items.clone()),
			credits: services.credits.clone(),
			lock,
			lock_timeout,
			fields,
		}
	}

	/// Lock holder id used by this saga.
	pub fn holder_id(&self) -> String {
		self.request_id.to_string()
	}
}

/// Lock key serializing writes to one member's profile.
pub fn member_lock_key(member_id: &str) -> String {
	format!("member:{member_id}")
}
