//! In-memory stand-ins for the external systems, with failure injection.
//!
//! Every call is appended to a [`CallLog`] under the same operation label the
//! HTTP adapters use (`job.create`, `item.delete`, `member.update`, ...), and
//! any label can be made to fail with a transport error.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::config::{FieldNames, LockSettings};
use crate::lock::{LockLease, StoreLock};
use crate::notify::{NotificationSink, NotifyError, SagaEvent};
use crate::repository::{
	Created, CreditService, CreditUsage, Fields, JobRecord, JobRecordRepository, MemberProfile,
	MemberProfileApi, PublishItem, PublishItemRepository, RepositoryError, RequestId,
};
use crate::saga::{SagaContext, SagaServices};
use crate::store::MemoryStore;

/// Ordered record of calls, optionally shared between fakes.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
	pub fn push(&self, label: &str) {
		self.0.lock().push(label.to_string());
	}

	pub fn entries(&self) -> Vec<String> {
		self.0.lock().clone()
	}

	pub fn count(&self, label: &str) -> usize {
		self.0.lock().iter().filter(|l| *l == label).count()
	}
}

#[derive(Debug, Default)]
struct Faults(Mutex<HashSet<String>>);

impl Faults {
	fn check(&self, label: &str) -> Result<(), RepositoryError> {
		if self.0.lock().contains(label) {
			return Err(RepositoryError::Transport(format!("injected failure in {label}")));
		}
		Ok(())
	}
}

/// Job database with member records and job records.
#[derive(Debug, Default)]
pub struct FakeJobDatabase {
	records: Mutex<BTreeMap<String, JobRecord>>,
	members: Mutex<HashMap<String, String>>,
	delete_reasons: Mutex<Vec<String>>,
	faults: Faults,
	log: CallLog,
	next_id: AtomicU64,
}

impl FakeJobDatabase {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_log(log: CallLog) -> Self {
		Self {
			log,
			..Self::default()
		}
	}

	/// Register a member and return the id of their backing record.
	pub fn add_member(&self, member_id: &str) -> String {
		let record_id = format!("mrec-{member_id}");
		self
			.members
			.lock()
			.insert(member_id.to_string(), record_id.clone());
		record_id
	}

	pub fn insert_record(&self, fields: Fields) -> String {
		let id = format!("rec-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
		self.records.lock().insert(
			id.clone(),
			JobRecord {
				id: id.clone(),
				linked_item_id: None,
				fields,
			},
		);
		id
	}

	pub fn link_record(&self, id: &str, item_id: &str) {
		if let Some(record) = self.records.lock().get_mut(id) {
			record.linked_item_id = Some(item_id.to_string());
		}
	}

	pub fn record(&self, id: &str) -> Option<JobRecord> {
		self.records.lock().get(id).cloned()
	}

	pub fn record_count(&self) -> usize {
		self.records.lock().len()
	}

	pub fn delete_reasons(&self) -> Vec<String> {
		self.delete_reasons.lock().clone()
	}

	/// Make every call with this label fail.
	pub fn fail(&self, label: &str) {
		self.faults.0.lock().insert(label.to_string());
	}

	pub fn calls(&self) -> Vec<String> {
		self.log.entries()
	}

	fn enter(&self, label: &str) -> Result<(), RepositoryError> {
		self.log.push(label);
		self.faults.check(label)
	}
}

#[async_trait]
impl JobRecordRepository for FakeJobDatabase {
	async fn find_member(
		&self,
		_request_id: RequestId,
		member_id: &str,
	) -> Result<Option<String>, RepositoryError> {
		self.enter("job.search-member")?;
		Ok(self.members.lock().get(member_id).cloned())
	}

	async fn create(&self, _request_id: RequestId, fields: &Fields) -> Result<Created, RepositoryError> {
		self.enter("job.create")?;
		let id = self.insert_record(fields.clone());
		Ok(Created {
			raw: json!({ "id": id }),
			id,
		})
	}

	async fn update(
		&self,
		_request_id: RequestId,
		id: &str,
		publish_item_id: &str,
		fields: &Fields,
	) -> Result<(), RepositoryError> {
		self.enter("job.update")?;
		let mut records = self.records.lock();
		let record = records.get_mut(id).ok_or(RepositoryError::NotFound)?;
		record.linked_item_id = Some(publish_item_id.to_string());
		record.fields.extend(fields.clone());
		Ok(())
	}

	async fn delete(&self, _request_id: RequestId, id: &str, reason: &str) -> Result<bool, RepositoryError> {
		self.enter("job.delete")?;
		self.delete_reasons.lock().push(reason.to_string());
		Ok(self.records.lock().remove(id).is_some())
	}

	async fn lookup(&self, _request_id: RequestId, id: &str) -> Result<JobRecord, RepositoryError> {
		self.enter("job.lookup")?;
		self.record(id).ok_or(RepositoryError::NotFound)
	}
}

/// Publishing system holding items and member profiles.
#[derive(Debug, Default)]
pub struct FakePublishSystem {
	items: Mutex<BTreeMap<String, Fields>>,
	members: Mutex<HashMap<String, Vec<String>>>,
	failing_gets: Mutex<HashSet<String>>,
	rejected_on_write: Mutex<HashSet<String>>,
	member_writes: AtomicUsize,
	last_fencing_token: Mutex<Option<u64>>,
	lose_member_writes: AtomicBool,
	faults: Faults,
	log: CallLog,
	next_id: AtomicU64,
}

impl FakePublishSystem {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_log(log: CallLog) -> Self {
		Self {
			log,
			..Self::default()
		}
	}

	pub fn insert_item(&self, fields: Fields) -> String {
		let id = format!("item-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
		self.items.lock().insert(id.clone(), fields);
		id
	}

	/// Merge `fields` into an existing item.
	pub fn patch_item(&self, id: &str, fields: Fields) {
		if let Some(item) = self.items.lock().get_mut(id) {
			item.extend(fields);
		}
	}

	pub fn item(&self, id: &str) -> Option<Fields> {
		self.items.lock().get(id).cloned()
	}

	pub fn item_count(&self) -> usize {
		self.items.lock().len()
	}

	pub fn insert_member(&self, member_id: &str, references: Vec<String>) {
		self
			.members
			.lock()
			.insert(member_id.to_string(), references);
	}

	pub fn member_references(&self, member_id: &str) -> Option<Vec<String>> {
		self.members.lock().get(member_id).cloned()
	}

	/// Number of member writes that were accepted.
	pub fn member_write_count(&self) -> usize {
		self.member_writes.load(Ordering::SeqCst)
	}

	pub fn last_fencing_token(&self) -> Option<u64> {
		*self.last_fencing_token.lock()
	}

	/// Reads of this item fail with a transport error.
	pub fn fail_gets_for(&self, id: &str) {
		self.failing_gets.lock().insert(id.to_string());
	}

	/// Member writes containing this reference are rejected.
	pub fn reject_reference_on_write(&self, id: &str) {
		self.rejected_on_write.lock().insert(id.to_string());
	}

	/// Member writes report success but are silently dropped.
	pub fn lose_member_writes(&self) {
		self.lose_member_writes.store(true, Ordering::SeqCst);
	}

	/// Make every call with this label fail.
	pub fn fail(&self, label: &str) {
		self.faults.0.lock().insert(label.to_string());
	}

	pub fn calls(&self) -> Vec<String> {
		self.log.entries()
	}

	fn enter(&self, label: &str) -> Result<(), RepositoryError> {
		self.log.push(label);
		self.faults.check(label)
	}
}

#[async_trait]
impl PublishItemRepository for FakePublishSystem {
	async fn create(&self, _request_id: RequestId, fields: &Fields) -> Result<Created, RepositoryError> {
		self.enter("item.create")?;
		let id = self.insert_item(fields.clone());
		Ok(Created {
			raw: json!({ "id": id }),
			id,
		})
	}

	async fn update(&self, _request_id: RequestId, id: &str, fields: &Fields) -> Result<(), RepositoryError> {
		self.enter("item.update")?;
		let mut items = self.items.lock();
		let item = items.get_mut(id).ok_or(RepositoryError::NotFound)?;
		item.extend(fields.clone());
		Ok(())
	}

	async fn delete(&self, _request_id: RequestId, id: &str) -> Result<bool, RepositoryError> {
		self.enter("item.delete")?;
		Ok(self.items.lock().remove(id).is_some())
	}

	async fn get(&self, _request_id: RequestId, id: &str) -> Result<PublishItem, RepositoryError> {
		self.enter("item.get")?;
		if self.failing_gets.lock().contains(id) {
			return Err(RepositoryError::Transport(format!("injected failure reading {id}")));
		}
		let fields = self.item(id).ok_or(RepositoryError::NotFound)?;
		Ok(PublishItem {
			id: id.to_string(),
			fields,
		})
	}
}

#[async_trait]
impl MemberProfileApi for FakePublishSystem {
	async fn fetch(&self, _request_id: RequestId, member_id: &str) -> Result<MemberProfile, RepositoryError> {
		self.enter("member.get")?;
		let references = self
			.member_references(member_id)
			.ok_or(RepositoryError::NotFound)?;
		let mut fields = Fields::new();
		fields.insert(
			FieldNames::default().back_references,
			Value::from(references.clone()),
		);
		Ok(MemberProfile {
			id: member_id.to_string(),
			back_references: references,
			fields,
		})
	}

	async fn write_back_references(
		&self,
		_request_id: RequestId,
		member_id: &str,
		references: &[String],
		fencing_token: u64,
	) -> Result<(), RepositoryError> {
		self.enter("member.update")?;
		{
			let rejected = self.rejected_on_write.lock();
			if let Some(reference) = references.iter().find(|r| rejected.contains(*r)) {
				return Err(RepositoryError::RejectedReference {
					reference: reference.clone(),
				});
			}
		}
		let mut members = self.members.lock();
		let stored = members.get_mut(member_id).ok_or(RepositoryError::NotFound)?;
		self.member_writes.fetch_add(1, Ordering::SeqCst);
		*self.last_fencing_token.lock() = Some(fencing_token);
		if !self.lose_member_writes.load(Ordering::SeqCst) {
			*stored = references.to_vec();
		}
		Ok(())
	}
}

/// Usage-credit service counting deductions per member.
#[derive(Debug, Default)]
pub struct FakeCredits {
	usage: Mutex<HashMap<String, i64>>,
	failing: AtomicBool,
}

impl FakeCredits {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn fail(&self) {
		self.failing.store(true, Ordering::SeqCst);
	}

	pub fn usage(&self, member_id: &str) -> i64 {
		self.usage.lock().get(member_id).copied().unwrap_or(0)
	}
}

#[async_trait]
impl CreditService for FakeCredits {
	async fn deduct(&self, _request_id: RequestId, member_id: &str) -> Result<CreditUsage, RepositoryError> {
		if self.failing.load(Ordering::SeqCst) {
			return Err(RepositoryError::Status {
				operation: "credit.deduct".to_string(),
				status: http::StatusCode::SERVICE_UNAVAILABLE,
				body: String::new(),
			});
		}
		let mut usage = self.usage.lock();
		let counter = usage.entry(member_id.to_string()).or_insert(0);
		let before = *counter;
		*counter += 1;
		Ok(CreditUsage {
			before,
			after: *counter,
		})
	}
}

/// Keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
	events: Mutex<Vec<SagaEvent>>,
	failing: AtomicBool,
}

impl RecordingSink {
	pub fn new() -> Self {
		Self::default()
	}

	/// Record events but report delivery failure.
	pub fn fail(&self) {
		self.failing.store(true, Ordering::SeqCst);
	}

	pub fn events(&self) -> Vec<SagaEvent> {
		self.events.lock().clone()
	}
}

#[async_trait]
impl NotificationSink for RecordingSink {
	async fn notify(&self, event: &SagaEvent) -> Result<(), NotifyError> {
		self.events.lock().push(event.clone());
		if self.failing.load(Ordering::SeqCst) {
			return Err(NotifyError::Transport("injected failure".to_string()));
		}
		Ok(())
	}
}

pub fn test_lease(resource_key: &str) -> LockLease {
	test_lease_with_ttl(resource_key, Duration::from_secs(30))
}

pub fn test_lease_with_ttl(resource_key: &str, ttl: Duration) -> LockLease {
	LockLease::new(
		resource_key.to_string(),
		"test-holder".to_string(),
		1,
		Utc::now(),
		Instant::now() + ttl,
		Vec::new(),
	)
}

pub fn test_services(
	jobs: Arc<FakeJobDatabase>,
	cms: Arc<FakePublishSystem>,
	credits: Option<Arc<FakeCredits>>,
) -> SagaServices {
	SagaServices {
		jobs,
		items: cms.clone(),
		members: cms,
		credits: credits.map(|c| c as Arc<dyn CreditService>),
	}
}

/// Context over the fakes with an in-memory lock and default settings.
pub fn test_context(jobs: Arc<FakeJobDatabase>, cms: Arc<FakePublishSystem>) -> SagaContext {
	let settings = LockSettings::default();
	SagaContext::new(
		RequestId::new(),
		&test_services(jobs, cms, None),
		Arc::new(StoreLock::new(Arc::new(MemoryStore::new()), settings)),
		settings.timeout,
		FieldNames::default(),
	)
}
