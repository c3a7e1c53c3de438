use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::context::{SagaContext, SagaServices, member_lock_key};
use super::types::{JobSubmission, PublishedJob};
use crate::config::{ConfigError, FieldNames, LockSettings, SagaConfig};
use crate::error::{NonCriticalFailure, Resource, SagaError, SagaFailure, StepError};
use crate::journal::TransactionJournal;
use crate::lock::{AdvisoryLock, StoreLock, with_lock};
use crate::notify::{LogSink, NotificationSink, SagaEvent, WebhookSink};
use crate::repository::{
	CreditService, Fields, HttpCredits, HttpJobRecords, HttpPublishItems, ServiceClient,
};
use crate::rollback;
use crate::store::{MemoryStore, StateStore};
use crate::submission::SubmissionGuard;
use crate::transaction::{SagaPhase, StateUpdate, Transaction};
use crate::verify;

/// Runs publish-job sagas.
///
/// One coordinator is shared by every submission. Each [`run`](Self::run)
/// builds its own [`SagaContext`] and [`Transaction`]; the only state shared
/// between runs is the advisory lock, the journal store and the submission
/// guard.
pub struct SagaCoordinator {
	services: SagaServices,
	lock: Arc<dyn AdvisoryLock>,
	journal: TransactionJournal,
	sink: Arc<dyn NotificationSink>,
	guard: SubmissionGuard,
	lock_timeout: Duration,
	fields: FieldNames,
}

impl SagaCoordinator {
	pub fn new(
		services: SagaServices,
		lock: Arc<dyn AdvisoryLock>,
		journal: TransactionJournal,
		sink: Arc<dyn NotificationSink>,
	) -> Self {
		Self {
			services,
			lock,
			journal,
			sink,
			guard: SubmissionGuard::new(),
			lock_timeout: LockSettings::default().timeout,
			fields: FieldNames::default(),
		}
	}

	pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
		self.lock_timeout = timeout;
		self
	}

	pub fn with_fields(mut self, fields: FieldNames) -> Self {
		self.fields = fields;
		self
	}

	/// Build a coordinator talking to the configured HTTP services, with an
	/// in-process lock and journal.
	pub fn from_config(config: &SagaConfig) -> Result<Self, ConfigError> {
		Self::from_config_with_store(config, Arc::new(MemoryStore::new()))
	}

	/// Like [`from_config`](Self::from_config), keeping locks and journal in
	/// `store`. Coordinators in different processes must share a store for
	/// the member lock to exclude them from each other.
	pub fn from_config_with_store(
		config: &SagaConfig,
		store: Arc<dyn StateStore>,
	) -> Result<Self, ConfigError> {
		config.validate()?;
		let client = |url: &url::Url| {
			ServiceClient::new(url.clone(), config.request_timeout, config.retry)
				.map_err(|e| ConfigError::Invalid(format!("cannot build client for {url}: {e}")))
		};

		let jobs = HttpJobRecords::new(client(&config.services.job_records)?);
		let items = Arc::new(HttpPublishItems::new(
			client(&config.services.publish_items)?,
			config.fields.back_references.clone(),
		));
		let credits: Option<Arc<dyn CreditService>> = match &config.services.credits {
			Some(url) => Some(Arc::new(HttpCredits::new(client(url)?))),
			None => None,
		};
		let services = SagaServices {
			jobs: Arc::new(jobs),
			items: items.clone(),
			members: items,
			credits,
		};

		let sink: Arc<dyn NotificationSink> = match &config.services.notify_webhook {
			Some(url) => Arc::new(
				WebhookSink::new(url.clone(), config.request_timeout)
					.map_err(|e| ConfigError::Invalid(format!("cannot build webhook sink: {e}")))?,
			),
			None => Arc::new(LogSink),
		};

		let lock = Arc::new(StoreLock::new(store.clone(), config.lock));
		let journal = TransactionJournal::new(store, config.journal);
		Ok(
			Self::new(services, lock, journal, sink)
				.with_lock_timeout(config.lock.timeout)
				.with_fields(config.fields.clone()),
		)
	}

	pub fn submission_guard(&self) -> &SubmissionGuard {
		&self.guard
	}

	/// Publish one job post.
	///
	/// Returns once the saga reached a terminal state: verified success, or a
	/// failure whose compensation (if any was needed) has run. Either way the
	/// notification sink has been called and the journal entry removed.
	pub async fn run(&self, submission: JobSubmission) -> Result<PublishedJob, SagaFailure> {
		let tx = Transaction::begin(submission);
		let request_id = tx.id();
		let ctx = SagaContext::new(
			request_id,
			&self.services,
			self.lock.clone(),
			self.lock_timeout,
			self.fields.clone(),
		);
		let mut run = SagaRun {
			ctx: &ctx,
			journal: &self.journal,
			tx,
			warnings: Vec::new(),
		};
		info!(
			%request_id,
			submission_id = %run.tx.form_snapshot().submission_id,
			member_id = %run.tx.form_snapshot().member_id,
			"saga started"
		);

		let admitted = match run.collect_input().await {
			Ok(()) => {
				let submission_id = &run.tx.form_snapshot().submission_id;
				self
					.guard
					.enter(submission_id)
					.ok_or_else(|| SagaError::DuplicateSubmission {
						submission_id: submission_id.clone(),
					})
			},
			Err(e) => Err(e),
		};
		// The ticket is held until the failure path, compensation included, is done.
		let (outcome, _ticket) = match admitted {
			Ok(ticket) => (run.execute().await, Some(ticket)),
			Err(e) => (Err(e), None),
		};

		let result = match outcome {
			Ok(published) => {
				info!(
					%request_id,
					job_record_id = %published.job_record_id,
					publish_item_id = %published.publish_item_id,
					warnings = published.warnings.len(),
					"saga completed"
				);
				self
					.notify(SagaEvent::Succeeded {
						request_id,
						job_record_id: published.job_record_id.clone(),
						publish_item_id: published.publish_item_id.clone(),
						warnings: published.warnings.clone(),
						transaction: Box::new(run.tx),
					})
					.await;
				Ok(published)
			},
			Err(error) => {
				let failure = run.fail(error).await;
				self
					.notify(SagaEvent::Failed {
						request_id,
						kind: failure.kind(),
						message: failure.error.to_string(),
						compensation: failure.compensation,
						transaction: failure.transaction.clone(),
					})
					.await;
				Err(failure)
			},
		};

		self.journal.discard(request_id).await;
		result
	}

	async fn notify(&self, event: SagaEvent) {
		if let Err(e) = self.sink.notify(&event).await {
			warn!(request_id = %event.request_id(), error = %e, "failed to deliver saga notification");
		}
	}
}

/// One saga invocation in progress.
struct SagaRun<'a> {
	ctx: &'a SagaContext,
	journal: &'a TransactionJournal,
	tx: Transaction,
	warnings: Vec<NonCriticalFailure>,
}

/// Record `update` on `tx` and journal the new snapshot.
async fn record(tx: &mut Transaction, journal: &TransactionJournal, update: StateUpdate) {
	if let Err(e) = tx.record(update) {
		error!(request_id = %tx.id(), error = %e, "transaction refused update");
	}
	journal.save(tx).await;
}

impl SagaRun<'_> {
	async fn checkpoint(&mut self, update: StateUpdate) {
		record(&mut self.tx, self.journal, update).await;
	}

	async fn enter(&mut self, phase: SagaPhase) {
		debug!(request_id = %self.ctx.request_id, %phase, "entering phase");
		self.checkpoint(StateUpdate::PhaseEntered { phase }).await;
	}

	async fn collect_input(&mut self) -> Result<(), SagaError> {
		self.enter(SagaPhase::CollectingInput).await;
		let submission = self.tx.form_snapshot();
		let required = [
			("submissionId", &submission.submission_id),
			("title", &submission.title),
			("memberId", &submission.member_id),
		];
		for (field, value) in required {
			if value.trim().is_empty() {
				return Err(SagaError::Validation { field });
			}
		}
		Ok(())
	}

	async fn execute(&mut self) -> Result<PublishedJob, SagaError> {
		let ctx = self.ctx;
		let request_id = ctx.request_id;
		let submission = self.tx.form_snapshot().clone();

		self.enter(SagaPhase::ResolvingMember).await;
		let found = ctx.jobs.find_member(request_id, &submission.member_id).await;
		let member_record = match found {
			Ok(Some(id)) => id,
			Ok(None) => {
				return Err(SagaError::Lookup {
					member_id: submission.member_id,
					source: None,
				});
			},
			Err(e) => {
				return Err(SagaError::Lookup {
					member_id: submission.member_id,
					source: Some(e),
				});
			},
		};
		self
			.checkpoint(StateUpdate::MemberResolved {
				member_lookup_id: member_record.clone(),
			})
			.await;

		self.enter(SagaPhase::CreatingJobRecord).await;
		let job = ctx
			.jobs
			.create(request_id, &self.job_record_fields(&submission, &member_record))
			.await
			.map_err(|source| SagaError::Creation {
				resource: Resource::JobRecord,
				source,
			})?;
		info!(%request_id, job_record_id = %job.id, "job record created");
		self
			.checkpoint(StateUpdate::JobRecordCreated {
				job_record_id: job.id.clone(),
			})
			.await;

		self.enter(SagaPhase::CreatingPublishItem).await;
		let item = ctx
			.items
			.create(request_id, &self.publish_item_fields(&submission, &job.id))
			.await
			.map_err(|source| SagaError::Creation {
				resource: Resource::PublishItem,
				source,
			})?;
		info!(%request_id, publish_item_id = %item.id, "publish item created");
		self
			.checkpoint(StateUpdate::PublishItemCreated {
				publish_item_id: item.id.clone(),
			})
			.await;

		self.enter(SagaPhase::LinkingSelfReference).await;
		let mut self_link = Fields::new();
		self_link.insert(ctx.fields.self_link.clone(), json!(item.id));
		ctx
			.items
			.update(request_id, &item.id, &self_link)
			.await
			.map_err(|e| SagaError::link(SagaPhase::LinkingSelfReference, e))?;
		self.checkpoint(StateUpdate::SelfLinked).await;

		self.enter(SagaPhase::UpdatingJobRecordWithLink).await;
		ctx
			.jobs
			.update(request_id, &job.id, &item.id, &Fields::new())
			.await
			.map_err(|e| SagaError::link(SagaPhase::UpdatingJobRecordWithLink, e))?;
		self.checkpoint(StateUpdate::JobRecordLinked).await;

		self.enter(SagaPhase::LinkingMemberProfile).await;
		let references = self
			.link_member(&submission.member_id, &item.id)
			.await
			.map_err(|e| SagaError::link(SagaPhase::LinkingMemberProfile, e))?;
		info!(
			%request_id,
			member_id = %submission.member_id,
			references = references.len(),
			"member profile linked"
		);
		self.checkpoint(StateUpdate::MemberLinked).await;

		self.enter(SagaPhase::Verifying).await;
		let report = verify::run_checks(ctx, &self.tx).await;
		if !report.passed() {
			return Err(SagaError::Verification {
				failed_checks: report.failed_checks(),
			});
		}
		self.checkpoint(StateUpdate::VerificationPassed).await;

		self.enter(SagaPhase::Completing).await;
		self.apply_credit(&submission.member_id).await;
		self.checkpoint(StateUpdate::Completed).await;

		Ok(PublishedJob {
			request_id,
			job_record_id: job.id,
			publish_item_id: item.id,
			warnings: std::mem::take(&mut self.warnings),
		})
	}

	fn job_record_fields(&self, submission: &JobSubmission, member_record: &str) -> Fields {
		let mut fields = submission.details.clone();
		fields.insert(self.ctx.fields.name.clone(), json!(submission.title));
		fields.insert(self.ctx.fields.member.clone(), json!(member_record));
		fields
	}

	/// Slugged by the job record id, which gives a stable 1:1 correlation
	/// between the two records.
	fn publish_item_fields(&self, submission: &JobSubmission, job_record_id: &str) -> Fields {
		let mut fields = submission.details.clone();
		fields.insert(self.ctx.fields.name.clone(), json!(submission.title));
		fields.insert(self.ctx.fields.slug.clone(), json!(job_record_id));
		fields.insert(self.ctx.fields.member.clone(), json!(submission.member_id));
		fields
	}

	/// Append the item to the member's back-references under the member lock.
	async fn link_member(&mut self, member_id: &str, item_id: &str) -> Result<Vec<String>, StepError> {
		let ctx = self.ctx;
		let journal = self.journal;
		let tx = &mut self.tx;
		with_lock(
			ctx.lock.as_ref(),
			&member_lock_key(member_id),
			&ctx.holder_id(),
			ctx.lock_timeout,
			|lease| async move {
				let merged = ctx
					.members
					.merge_back_reference(ctx.request_id, member_id, item_id)
					.await?;
				if merged.changed {
					lease.ensure_live()?;
					// From here on the write may land even if the call reports failure.
					record(tx, journal, StateUpdate::MemberLinkAttempted).await;
				}
				ctx
					.members
					.commit_back_reference(ctx.request_id, member_id, merged, &lease)
					.await
			},
		)
		.await
	}

	async fn apply_credit(&mut self, member_id: &str) {
		let request_id = self.ctx.request_id;
		let Some(credits) = &self.ctx.credits else {
			debug!(%request_id, "no credit service configured");
			return;
		};
		match credits.deduct(request_id, member_id).await {
			Ok(usage) => {
				info!(%request_id, member_id, before = usage.before, after = usage.after, "credit applied");
				self.checkpoint(StateUpdate::CreditApplied).await;
			},
			Err(e) => {
				warn!(%request_id, member_id, error = %e, "credit deduction failed");
				self.warnings.push(NonCriticalFailure {
					step: "credit.deduct".to_string(),
					message: e.to_string(),
				});
			},
		}
	}

	async fn fail(mut self, error: SagaError) -> SagaFailure {
		let request_id = self.ctx.request_id;
		let kind = error.kind();
		error!(
			%request_id,
			?kind,
			phase = %self.tx.state().phase,
			error = %error,
			"saga failed"
		);
		self.enter(SagaPhase::Failed).await;
		self
			.checkpoint(StateUpdate::Failed {
				failure: kind,
				message: error.to_string(),
			})
			.await;

		let compensation = if kind.requires_compensation() {
			self.enter(SagaPhase::Compensating).await;
			let reason = format!("saga {request_id} rolled back: {error}");
			let result = rollback::compensate(self.ctx, &self.tx, &reason).await;
			self
				.checkpoint(StateUpdate::Compensated {
					job_record_cleanup_attempted: result.job_attempted,
					publish_item_cleanup_attempted: result.item_attempted,
					member_link_cleanup_attempted: result.member_attempted,
					job_record_cleaned: result.job_cleaned,
					publish_item_cleaned: result.item_cleaned,
					member_link_cleaned: result.member_cleaned,
					rollback_completed: result.completed,
				})
				.await;
			Some(result)
		} else {
			None
		};

		self.enter(SagaPhase::Reported).await;
		SagaFailure {
			error,
			transaction: Box::new(self.tx),
			compensation,
		}
	}
}
