use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Call, Created, Fields, RepositoryError, RequestId, ServiceClient, id_field};

/// A record in the job database, as far as the saga cares about it.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
	pub id: String,
	/// Publish item the record points at, once linked.
	pub linked_item_id: Option<String>,
	pub fields: Fields,
}

/// The job database.
#[async_trait]
pub trait JobRecordRepository: Send + Sync {
	/// Resolve an external member id to the member's record in the job database.
	async fn find_member(
		&self,
		request_id: RequestId,
		member_id: &str,
	) -> Result<Option<String>, RepositoryError>;

	async fn create(&self, request_id: RequestId, fields: &Fields) -> Result<Created, RepositoryError>;

	/// Store the publish item id on the record, along with any extra fields.
	async fn update(
		&self,
		request_id: RequestId,
		id: &str,
		publish_item_id: &str,
		fields: &Fields,
	) -> Result<(), RepositoryError>;

	/// Returns `false` when there was nothing to delete. Both outcomes are success.
	async fn delete(&self, request_id: RequestId, id: &str, reason: &str)
	-> Result<bool, RepositoryError>;

	async fn lookup(&self, request_id: RequestId, id: &str) -> Result<JobRecord, RepositoryError>;
}

/// Job database behind its HTTP bridge.
#[derive(Debug, Clone)]
pub struct HttpJobRecords {
	client: ServiceClient,
}

impl HttpJobRecords {
	pub fn new(client: ServiceClient) -> Self {
		Self { client }
	}
}

#[async_trait]
impl JobRecordRepository for HttpJobRecords {
	async fn find_member(
		&self,
		request_id: RequestId,
		member_id: &str,
	) -> Result<Option<String>, RepositoryError> {
		let call = Call::post("job.search-member", &["search-member"], json!({ "memberId": member_id }));
		match self.client.call(request_id, call).await {
			Ok(body) => Ok(id_field(&body, "recordId")),
			Err(RepositoryError::NotFound) => Ok(None),
			Err(e) => Err(e),
		}
	}

	async fn create(&self, request_id: RequestId, fields: &Fields) -> Result<Created, RepositoryError> {
		let call = Call::post("job.create", &[], json!({ "fields": fields }));
		Created::from_body(self.client.call(request_id, call).await?)
	}

	async fn update(
		&self,
		request_id: RequestId,
		id: &str,
		publish_item_id: &str,
		fields: &Fields,
	) -> Result<(), RepositoryError> {
		let call = Call::post(
			"job.update",
			&["update"],
			json!({
				"recordId": id,
				"webflowId": publish_item_id,
				"fields": fields,
			}),
		);
		self.client.call(request_id, call).await?;
		Ok(())
	}

	async fn delete(
		&self,
		request_id: RequestId,
		id: &str,
		reason: &str,
	) -> Result<bool, RepositoryError> {
		let call = Call::post("job.delete", &["delete"], json!({ "recordId": id, "reason": reason }));
		match self.client.call(request_id, call).await {
			Ok(body) => Ok(body.get("deleted").and_then(Value::as_bool).unwrap_or(true)),
			Err(RepositoryError::NotFound) => Ok(false),
			Err(e) => Err(e),
		}
	}

	async fn lookup(&self, request_id: RequestId, id: &str) -> Result<JobRecord, RepositoryError> {
		let call = Call::post("job.lookup", &["lookup"], json!({ "recordId": id }));
		let body = self.client.call(request_id, call).await?;
		let id = id_field(&body, "id").unwrap_or_else(|| id.to_string());
		let linked_item_id = id_field(&body, "linkedItemId");
		let fields = match body.get("fields") {
			Some(Value::Object(map)) => map.clone(),
			_ => Fields::new(),
		};
		Ok(JobRecord {
			id,
			linked_item_id,
			fields,
		})
	}
}
