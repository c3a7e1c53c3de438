//! HTTP adapters against mock services.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use jobsaga::error::StepError;
use jobsaga::lock::LockError;
use jobsaga::repository::{
	CreditService, Fields, HttpCredits, HttpJobRecords, HttpPublishItems, JobRecordRepository,
	MemberProfileApi, MemberProfiles, PublishItemRepository, RepositoryError, RequestId,
	ServiceClient,
};
use jobsaga::retry::RetryPolicy;
use jobsaga::testing::{test_lease, test_lease_with_ttl};
use serde_json::{Value, json};
use url::Url;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> ServiceClient {
	client_with_retry(
		server,
		RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(20)),
	)
}

fn client_with_retry(server: &MockServer, retry: RetryPolicy) -> ServiceClient {
	ServiceClient::new(Url::parse(&server.uri()).unwrap(), Duration::from_secs(5), retry).unwrap()
}

async fn request_bodies(server: &MockServer, verb: &str, at: &str) -> Vec<Value> {
	server
		.received_requests()
		.await
		.unwrap_or_default()
		.into_iter()
		.filter(|r| r.method.as_str() == verb && r.url.path() == at)
		.map(|r| serde_json::from_slice(&r.body).unwrap_or(Value::Null))
		.collect()
}

#[tokio::test]
async fn test_create_carries_correlation_id() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/"))
		.and(header_exists("x-request-id"))
		.and(body_partial_json(json!({ "fields": { "name": "Engineer" } })))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "rec-1" })))
		.expect(1)
		.mount(&server)
		.await;

	let jobs = HttpJobRecords::new(client(&server));
	let request_id = RequestId::new();
	let mut fields = Fields::new();
	fields.insert("name".into(), json!("Engineer"));

	let created = jobs.create(request_id, &fields).await?;
	assert_eq!(created.id, "rec-1");

	let requests = server.received_requests().await.unwrap_or_default();
	assert_eq!(
		requests[0].headers.get("x-request-id").unwrap().to_str()?,
		request_id.to_string()
	);
	let body: Value = serde_json::from_slice(&requests[0].body)?;
	assert_eq!(body["requestId"], request_id.to_string());
	Ok(())
}

#[tokio::test]
async fn test_transient_failures_are_retried() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/"))
		.respond_with(ResponseTemplate::new(503))
		.up_to_n_times(2)
		.with_priority(1)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/"))
		.respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 42 })))
		.mount(&server)
		.await;

	let jobs = HttpJobRecords::new(client(&server));
	let created = jobs.create(RequestId::new(), &Fields::new()).await?;
	assert_eq!(created.id, "42");
	assert_eq!(server.received_requests().await.unwrap_or_default().len(), 3);
	Ok(())
}

#[tokio::test]
async fn test_retries_are_bounded_and_return_last_error() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
		.expect(3)
		.mount(&server)
		.await;

	let items = HttpPublishItems::new(client(&server), "job-posts");
	let err = items.create(RequestId::new(), &Fields::new()).await.unwrap_err();
	assert_matches!(err, RepositoryError::Status { status, ref body, .. } if status.as_u16() == 502 && body == "bad gateway");
	Ok(())
}

#[tokio::test]
async fn test_client_errors_are_not_retried() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/update"))
		.respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "bad field" })))
		.expect(1)
		.mount(&server)
		.await;

	let jobs = HttpJobRecords::new(client(&server));
	let err = jobs
		.update(RequestId::new(), "rec-1", "item-1", &Fields::new())
		.await
		.unwrap_err();
	assert!(!err.is_retryable());

	let bodies = request_bodies(&server, "POST", "/update").await;
	assert_eq!(bodies[0]["recordId"], "rec-1");
	assert_eq!(bodies[0]["webflowId"], "item-1");
	Ok(())
}

#[tokio::test]
async fn test_job_delete_is_idempotent() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/delete"))
		.and(body_partial_json(json!({ "recordId": "rec-gone", "reason": "rollback" })))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/delete"))
		.and(body_partial_json(json!({ "recordId": "rec-1" })))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": true })))
		.mount(&server)
		.await;

	let jobs = HttpJobRecords::new(client(&server));
	assert!(jobs.delete(RequestId::new(), "rec-1", "rollback").await?);
	assert!(!jobs.delete(RequestId::new(), "rec-gone", "rollback").await?);
	Ok(())
}

#[tokio::test]
async fn test_member_search() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/search-member"))
		.and(body_partial_json(json!({ "memberId": "mem_1" })))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "recordId": "mrec-1" })))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/search-member"))
		.and(body_partial_json(json!({ "memberId": "mem_2" })))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "recordId": null })))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/search-member"))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;

	let jobs = HttpJobRecords::new(client(&server));
	let rid = RequestId::new();
	assert_eq!(jobs.find_member(rid, "mem_1").await?, Some("mrec-1".to_string()));
	assert_eq!(jobs.find_member(rid, "mem_2").await?, None);
	assert_eq!(jobs.find_member(rid, "mem_3").await?, None);
	Ok(())
}

#[tokio::test]
async fn test_job_lookup_reads_link() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/lookup"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"id": "rec-1",
			"linkedItemId": "item-1",
			"fields": { "name": "Engineer" }
		})))
		.mount(&server)
		.await;

	let jobs = HttpJobRecords::new(client(&server));
	let record = jobs.lookup(RequestId::new(), "rec-1").await?;
	assert_eq!(record.linked_item_id.as_deref(), Some("item-1"));
	assert_eq!(record.fields["name"], "Engineer");
	Ok(())
}

#[tokio::test]
async fn test_item_delete_falls_back_to_post() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	// only one DELETE attempt before falling back
	Mock::given(method("DELETE"))
		.and(path("/item-1"))
		.respond_with(ResponseTemplate::new(500))
		.expect(1)
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/delete"))
		.and(body_partial_json(json!({ "itemId": "item-1" })))
		.respond_with(ResponseTemplate::new(200))
		.expect(1)
		.mount(&server)
		.await;

	let items = HttpPublishItems::new(client(&server), "job-posts");
	assert!(items.delete(RequestId::new(), "item-1").await?);
	Ok(())
}

#[tokio::test]
async fn test_item_delete_treats_not_found_as_done() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("DELETE"))
		.and(path("/item-1"))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/delete"))
		.respond_with(ResponseTemplate::new(200))
		.expect(0)
		.mount(&server)
		.await;
	Mock::given(method("DELETE"))
		.and(path("/item-2"))
		.respond_with(ResponseTemplate::new(405))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/delete"))
		.and(body_partial_json(json!({ "itemId": "item-2" })))
		.respond_with(ResponseTemplate::new(404))
		.with_priority(1)
		.mount(&server)
		.await;

	let items = HttpPublishItems::new(client(&server), "job-posts");
	assert!(!items.delete(RequestId::new(), "item-1").await?);
	assert!(!items.delete(RequestId::new(), "item-2").await?);
	Ok(())
}

#[tokio::test]
async fn test_item_delete_fails_when_both_paths_fail() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("DELETE"))
		.respond_with(ResponseTemplate::new(405))
		.mount(&server)
		.await;
	Mock::given(method("POST"))
		.and(path("/delete"))
		.respond_with(ResponseTemplate::new(403))
		.mount(&server)
		.await;

	let items = HttpPublishItems::new(client(&server), "job-posts");
	let err = items.delete(RequestId::new(), "item-1").await.unwrap_err();
	assert_matches!(err, RepositoryError::Status { status, .. } if status.as_u16() == 403);
	Ok(())
}

#[tokio::test]
async fn test_item_get_and_exists() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/item-1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"id": "item-1",
			"fields": { "item-id": "item-1", "slug": "rec-1" }
		})))
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/item-2"))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;

	let items = HttpPublishItems::new(client(&server), "job-posts");
	let rid = RequestId::new();
	let item = items.get(rid, "item-1").await?;
	assert_eq!(item.field_str("slug"), Some("rec-1"));
	assert!(items.exists(rid, "item-1").await?);
	assert!(!items.exists(rid, "item-2").await?);
	assert_matches!(items.get(rid, "item-2").await, Err(RepositoryError::NotFound));
	Ok(())
}

async fn mount_member(server: &MockServer, references: Value) {
	Mock::given(method("GET"))
		.and(path("/members/mem_1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"id": "mem_1",
			"fields": { "job-posts": references, "name": "Ada" }
		})))
		.mount(server)
		.await;
}

#[tokio::test]
async fn test_member_fetch_parses_back_references() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	mount_member(&server, json!(["item-1", "item-2"])).await;
	Mock::given(method("GET"))
		.and(path("/members/mem_2"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "mem_2", "fields": {} })))
		.mount(&server)
		.await;

	let items = HttpPublishItems::new(client(&server), "job-posts");
	let profile = items.fetch(RequestId::new(), "mem_1").await?;
	assert_eq!(profile.back_references, vec!["item-1", "item-2"]);
	assert_eq!(profile.fields["name"], "Ada");
	assert!(items.fetch(RequestId::new(), "mem_2").await?.back_references.is_empty());
	Ok(())
}

#[tokio::test]
async fn test_append_prunes_and_writes_with_fencing_token() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	mount_member(&server, json!(["item-old", "item-stale", "item-old"])).await;
	Mock::given(method("GET"))
		.and(path("/item-old"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "item-old", "fields": {} })))
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/item-stale"))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;
	Mock::given(method("PATCH"))
		.and(path("/members/mem_1"))
		.and(header("x-fencing-token", "1"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
		.expect(1)
		.mount(&server)
		.await;

	let items = Arc::new(HttpPublishItems::new(client(&server), "job-posts"));
	let members = MemberProfiles::new(items.clone(), items);
	let lease = test_lease("member:mem_1");
	let written = members
		.append_back_reference(RequestId::new(), "mem_1", "item-new", &lease)
		.await?;
	assert_eq!(written, vec!["item-old", "item-new"]);

	let bodies = request_bodies(&server, "PATCH", "/members/mem_1").await;
	assert_eq!(bodies[0]["fields"]["job-posts"], json!(["item-old", "item-new"]));
	// the new item is never looked up
	assert!(request_bodies(&server, "GET", "/item-new").await.is_empty());
	Ok(())
}

#[tokio::test]
async fn test_append_retries_without_rejected_reference() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	mount_member(&server, json!(["item-old"])).await;
	Mock::given(method("GET"))
		.and(path("/item-old"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "item-old" })))
		.mount(&server)
		.await;
	Mock::given(method("PATCH"))
		.and(path("/members/mem_1"))
		.respond_with(
			ResponseTemplate::new(422).set_body_json(json!({ "rejectedReference": "item-old" })),
		)
		.up_to_n_times(1)
		.with_priority(1)
		.mount(&server)
		.await;
	Mock::given(method("PATCH"))
		.and(path("/members/mem_1"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&server)
		.await;

	let items = Arc::new(HttpPublishItems::new(client(&server), "job-posts"));
	let members = MemberProfiles::new(items.clone(), items);
	let written = members
		.append_back_reference(RequestId::new(), "mem_1", "item-new", &test_lease("member:mem_1"))
		.await?;
	assert_eq!(written, vec!["item-new"]);

	let bodies = request_bodies(&server, "PATCH", "/members/mem_1").await;
	assert_eq!(bodies.len(), 2);
	assert_eq!(bodies[1]["fields"]["job-posts"], json!(["item-new"]));
	Ok(())
}

#[tokio::test]
async fn test_credit_deduction() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/"))
		.and(body_partial_json(json!({ "memberId": "mem_1" })))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({ "before": 3, "after": 4 })))
		.mount(&server)
		.await;

	let credits = HttpCredits::new(client(&server));
	let usage = credits.deduct(RequestId::new(), "mem_1").await?;
	assert_eq!((usage.before, usage.after), (3, 4));
	Ok(())
}

#[tokio::test]
async fn test_member_write_retry_stops_when_lease_expires() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	mount_member(&server, json!([])).await;
	Mock::given(method("PATCH"))
		.and(path("/members/mem_1"))
		.respond_with(ResponseTemplate::new(503))
		.mount(&server)
		.await;

	let retry = RetryPolicy::new(3, Duration::from_millis(200), Duration::from_millis(200));
	let items = Arc::new(HttpPublishItems::new(client_with_retry(&server, retry), "job-posts"));
	let members = MemberProfiles::new(items.clone(), items);
	// live for the second attempt, expired before the third
	let lease = test_lease_with_ttl("member:mem_1", Duration::from_millis(350));
	let err = members
		.append_back_reference(RequestId::new(), "mem_1", "item-new", &lease)
		.await
		.unwrap_err();
	assert_matches!(err, StepError::Lock(LockError::Expired { fencing_token: 1, .. }));
	assert_eq!(request_bodies(&server, "PATCH", "/members/mem_1").await.len(), 2);
	Ok(())
}

#[tokio::test]
async fn test_member_write_is_retried_while_lease_is_live() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	mount_member(&server, json!([])).await;
	Mock::given(method("PATCH"))
		.and(path("/members/mem_1"))
		.respond_with(ResponseTemplate::new(503))
		.up_to_n_times(1)
		.with_priority(1)
		.mount(&server)
		.await;
	Mock::given(method("PATCH"))
		.and(path("/members/mem_1"))
		.and(header("x-fencing-token", "1"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&server)
		.await;

	let items = Arc::new(HttpPublishItems::new(client(&server), "job-posts"));
	let members = MemberProfiles::new(items.clone(), items);
	let written = members
		.append_back_reference(RequestId::new(), "mem_1", "item-new", &test_lease("member:mem_1"))
		.await?;
	assert_eq!(written, vec!["item-new"]);
	assert_eq!(request_bodies(&server, "PATCH", "/members/mem_1").await.len(), 2);
	Ok(())
}

#[tokio::test]
async fn test_credit_deduction_is_not_retried() -> anyhow::Result<()> {
	let server = MockServer::start().await;
	Mock::given(method("POST"))
		.and(path("/"))
		.respond_with(ResponseTemplate::new(503))
		.expect(1)
		.mount(&server)
		.await;

	let credits = HttpCredits::new(client(&server));
	let err = credits.deduct(RequestId::new(), "mem_1").await.unwrap_err();
	assert_matches!(
		err,
		RepositoryError::Status { status, .. } if status == http::StatusCode::SERVICE_UNAVAILABLE
	);
	server.verify().await;
	Ok(())
}
