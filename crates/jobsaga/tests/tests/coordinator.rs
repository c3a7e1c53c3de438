//! End-to-end sagas against mock HTTP services.

use assert_matches::assert_matches;
use jobsaga::error::SagaError;
use jobsaga::rollback::CompensationResult;
use jobsaga::{FailureKind, JobSubmission, SagaConfig, SagaCoordinator};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Services {
	jobs: MockServer,
	cms: MockServer,
	hook: MockServer,
}

impl Services {
	async fn start() -> Self {
		Self {
			jobs: MockServer::start().await,
			cms: MockServer::start().await,
			hook: MockServer::start().await,
		}
	}

	fn coordinator(&self) -> anyhow::Result<SagaCoordinator> {
		let yaml = format!(
			r#"
services:
  jobRecords: {}
  publishItems: {}
  notifyWebhook: {}
retry:
  attempts: 2
  initialDelay: 10ms
  maxDelay: 20ms
lock:
  timeout: 2s
requestTimeout: 5s
"#,
			self.jobs.uri(),
			self.cms.uri(),
			self.hook.uri()
		);
		Ok(SagaCoordinator::from_config(&SagaConfig::from_yaml(&yaml)?)?)
	}

	async fn mount_common(&self) {
		Mock::given(method("POST"))
			.and(path("/search-member"))
			.and(body_partial_json(json!({ "memberId": "mem_1" })))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "recordId": "mrec-1" })))
			.mount(&self.jobs)
			.await;
		Mock::given(method("POST"))
			.and(path("/"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "rec-1" })))
			.expect(1)
			.mount(&self.jobs)
			.await;
		Mock::given(method("POST"))
			.and(path("/update"))
			.and(body_partial_json(json!({ "recordId": "rec-1", "webflowId": "item-1" })))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&self.jobs)
			.await;
		Mock::given(method("POST"))
			.and(path("/lookup"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"id": "rec-1",
				"linkedItemId": "item-1"
			})))
			.mount(&self.jobs)
			.await;

		Mock::given(method("POST"))
			.and(path("/"))
			.and(body_partial_json(json!({ "fields": { "slug": "rec-1", "member": "mem_1" } })))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "item-1" })))
			.expect(1)
			.mount(&self.cms)
			.await;
		Mock::given(method("PATCH"))
			.and(path("/item-1"))
			.and(body_partial_json(json!({ "fields": { "item-id": "item-1" } })))
			.respond_with(ResponseTemplate::new(200))
			.expect(1)
			.mount(&self.cms)
			.await;
		Mock::given(method("PATCH"))
			.and(path("/members/mem_1"))
			.and(header_exists("x-fencing-token"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&self.cms)
			.await;
	}

	async fn mount_member_after_link(&self) {
		Mock::given(method("GET"))
			.and(path("/members/mem_1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"id": "mem_1",
				"fields": { "job-posts": ["item-1"] }
			})))
			.mount(&self.cms)
			.await;
	}

	async fn webhook_events(&self) -> Vec<Value> {
		self
			.hook
			.received_requests()
			.await
			.unwrap_or_default()
			.into_iter()
			.filter_map(|r| serde_json::from_slice(&r.body).ok())
			.collect()
	}
}

fn submission() -> JobSubmission {
	JobSubmission::new("sub-1", "Platform Engineer", "mem_1").with_detail("location", "Remote")
}

#[tokio::test]
async fn test_publishes_across_services() -> anyhow::Result<()> {
	let services = Services::start().await;
	services.mount_common().await;
	// the profile has no references until the saga writes one
	Mock::given(method("GET"))
		.and(path("/members/mem_1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"id": "mem_1",
			"fields": { "job-posts": [] }
		})))
		.up_to_n_times(1)
		.with_priority(1)
		.mount(&services.cms)
		.await;
	services.mount_member_after_link().await;
	Mock::given(method("GET"))
		.and(path("/item-1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"id": "item-1",
			"fields": { "item-id": "item-1", "slug": "rec-1", "member": "mem_1" }
		})))
		.mount(&services.cms)
		.await;
	Mock::given(method("POST"))
		.and(body_partial_json(json!({ "event": "succeeded", "jobRecordId": "rec-1" })))
		.and(header_exists("x-request-id"))
		.respond_with(ResponseTemplate::new(204))
		.expect(1)
		.mount(&services.hook)
		.await;

	let coordinator = services.coordinator()?;
	let published = coordinator.run(submission()).await?;
	assert_eq!(published.job_record_id, "rec-1");
	assert_eq!(published.publish_item_id, "item-1");
	assert!(published.warnings.is_empty());

	let member_writes: Vec<Value> = services
		.cms
		.received_requests()
		.await
		.unwrap_or_default()
		.into_iter()
		.filter(|r| r.method.as_str() == "PATCH" && r.url.path() == "/members/mem_1")
		.map(|r| serde_json::from_slice(&r.body))
		.collect::<Result<_, _>>()?;
	assert_eq!(member_writes.len(), 1);
	assert_eq!(member_writes[0]["fields"]["job-posts"], json!(["item-1"]));
	assert_eq!(member_writes[0]["requestId"], published.request_id.to_string());

	let events = services.webhook_events().await;
	assert_eq!(events.len(), 1);
	assert_eq!(events[0]["transaction"]["state"]["phase"], "completing");
	assert_eq!(events[0]["transaction"]["state"]["completed"], true);
	assert!(!coordinator.submission_guard().is_in_flight("sub-1"));

	services.jobs.verify().await;
	services.cms.verify().await;
	services.hook.verify().await;
	Ok(())
}

#[tokio::test]
async fn test_failed_verification_compensates_every_service() -> anyhow::Result<()> {
	let services = Services::start().await;
	services.mount_common().await;
	services.mount_member_after_link().await;
	// the item never got its self-link
	Mock::given(method("GET"))
		.and(path("/item-1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"id": "item-1",
			"fields": { "slug": "rec-1" }
		})))
		.mount(&services.cms)
		.await;
	Mock::given(method("DELETE"))
		.and(path("/item-1"))
		.respond_with(ResponseTemplate::new(405))
		.expect(1)
		.mount(&services.cms)
		.await;
	Mock::given(method("POST"))
		.and(path("/delete"))
		.and(body_partial_json(json!({ "itemId": "item-1" })))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&services.cms)
		.await;
	Mock::given(method("POST"))
		.and(path("/delete"))
		.and(body_partial_json(json!({ "recordId": "rec-1" })))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": true })))
		.expect(1)
		.mount(&services.jobs)
		.await;
	Mock::given(method("POST"))
		.and(body_partial_json(json!({ "event": "failed", "kind": "verificationFailure" })))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&services.hook)
		.await;

	let coordinator = services.coordinator()?;
	let failure = coordinator.run(submission()).await.unwrap_err();
	assert_eq!(failure.kind(), FailureKind::VerificationFailure);
	assert_matches!(
		&failure.error,
		SagaError::Verification { failed_checks } if failed_checks == &["publish-item-self-link"]
	);
	assert_eq!(
		failure.compensation,
		Some(CompensationResult {
			job_attempted: true,
			job_cleaned: true,
			item_attempted: true,
			item_cleaned: true,
			member_attempted: true,
			member_cleaned: true,
			completed: true,
		})
	);

	// the reference was already listed, so the only member write is the rollback
	let member_writes: Vec<Value> = services
		.cms
		.received_requests()
		.await
		.unwrap_or_default()
		.into_iter()
		.filter(|r| r.method.as_str() == "PATCH" && r.url.path() == "/members/mem_1")
		.map(|r| serde_json::from_slice(&r.body))
		.collect::<Result<_, _>>()?;
	assert_eq!(member_writes.len(), 1);
	assert_eq!(member_writes[0]["fields"]["job-posts"], json!([]));

	let events = services.webhook_events().await;
	assert_eq!(events[0]["compensation"]["completed"], true);

	services.jobs.verify().await;
	services.cms.verify().await;
	services.hook.verify().await;
	Ok(())
}

#[tokio::test]
async fn test_unknown_member_creates_nothing() -> anyhow::Result<()> {
	let services = Services::start().await;
	Mock::given(method("POST"))
		.and(path("/search-member"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "recordId": null })))
		.expect(1)
		.mount(&services.jobs)
		.await;
	Mock::given(method("POST"))
		.and(path("/"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "rec-1" })))
		.expect(0)
		.mount(&services.jobs)
		.await;
	Mock::given(method("POST"))
		.and(header("content-type", "application/json"))
		.and(body_partial_json(json!({ "event": "failed", "kind": "lookup" })))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&services.hook)
		.await;

	let coordinator = services.coordinator()?;
	let failure = coordinator.run(submission()).await.unwrap_err();
	assert_eq!(failure.kind(), FailureKind::Lookup);
	assert!(failure.compensation.is_none());
	assert!(services.cms.received_requests().await.unwrap_or_default().is_empty());

	let events = services.webhook_events().await;
	assert!(events[0].get("compensation").is_none());

	services.jobs.verify().await;
	services.hook.verify().await;
	Ok(())
}

#[tokio::test]
async fn test_publish_item_creation_exhausts_retries() -> anyhow::Result<()> {
	let services = Services::start().await;
	Mock::given(method("POST"))
		.and(path("/search-member"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "recordId": "mrec-1" })))
		.mount(&services.jobs)
		.await;
	Mock::given(method("POST"))
		.and(path("/"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "rec-1" })))
		.expect(1)
		.mount(&services.jobs)
		.await;
	Mock::given(method("POST"))
		.and(path("/delete"))
		.and(body_partial_json(json!({ "recordId": "rec-1" })))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": true })))
		.expect(1)
		.mount(&services.jobs)
		.await;
	Mock::given(method("POST"))
		.and(path("/"))
		.respond_with(ResponseTemplate::new(503))
		.expect(2)
		.mount(&services.cms)
		.await;
	Mock::given(method("POST"))
		.and(body_partial_json(json!({ "event": "failed", "kind": "creation" })))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&services.hook)
		.await;

	let coordinator = services.coordinator()?;
	let failure = coordinator.run(submission()).await.unwrap_err();
	assert_eq!(failure.kind(), FailureKind::Creation);
	assert_eq!(
		failure.compensation,
		Some(CompensationResult {
			job_attempted: true,
			job_cleaned: true,
			item_attempted: false,
			item_cleaned: false,
			member_attempted: false,
			member_cleaned: false,
			completed: true,
		})
	);

	let events = services.webhook_events().await;
	assert_eq!(events[0]["compensation"]["jobCleaned"], true);
	assert_eq!(events[0]["compensation"]["itemCleaned"], false);
	assert_eq!(events[0]["compensation"]["memberCleaned"], false);

	services.jobs.verify().await;
	services.cms.verify().await;
	services.hook.verify().await;
	Ok(())
}
