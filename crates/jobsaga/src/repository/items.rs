use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::warn;

use super::members::{MemberProfile, MemberProfileApi};
use super::{Call, Created, Fields, RepositoryError, RequestId, ServiceClient, id_field};
use crate::retry::RetryPolicy;

/// An item in the publishing system.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishItem {
	pub id: String,
	pub fields: Fields,
}

impl PublishItem {
	pub fn field_str(&self, name: &str) -> Option<&str> {
		self.fields.get(name).and_then(Value::as_str)
	}
}

/// The publishing system's item collection.
#[async_trait]
pub trait PublishItemRepository: Send + Sync {
	async fn create(&self, request_id: RequestId, fields: &Fields) -> Result<Created, RepositoryError>;

	async fn update(&self, request_id: RequestId, id: &str, fields: &Fields) -> Result<(), RepositoryError>;

	/// Returns `false` when the item was already gone. Both outcomes are success.
	async fn delete(&self, request_id: RequestId, id: &str) -> Result<bool, RepositoryError>;

	/// Fails with [`RepositoryError::NotFound`] if the item does not exist.
	async fn get(&self, request_id: RequestId, id: &str) -> Result<PublishItem, RepositoryError>;

	async fn exists(&self, request_id: RequestId, id: &str) -> Result<bool, RepositoryError> {
		match self.get(request_id, id).await {
			Ok(_) => Ok(true),
			Err(RepositoryError::NotFound) => Ok(false),
			Err(e) => Err(e),
		}
	}
}

/// Publishing system behind its HTTP API. Member profiles live in the same
/// system, under `members/`.
#[derive(Debug, Clone)]
pub struct HttpPublishItems {
	client: ServiceClient,
	back_reference_field: String,
}

impl HttpPublishItems {
	pub fn new(client: ServiceClient, back_reference_field: impl Into<String>) -> Self {
		Self {
			client,
			back_reference_field: back_reference_field.into(),
		}
	}
}

fn fields_of(body: &Value) -> Fields {
	match body.get("fields") {
		Some(Value::Object(map)) => map.clone(),
		_ => Fields::new(),
	}
}

#[async_trait]
impl PublishItemRepository for HttpPublishItems {
	async fn create(&self, request_id: RequestId, fields: &Fields) -> Result<Created, RepositoryError> {
		let call = Call::post("item.create", &[], json!({ "fields": fields }));
		Created::from_body(self.client.call(request_id, call).await?)
	}

	async fn update(&self, request_id: RequestId, id: &str, fields: &Fields) -> Result<(), RepositoryError> {
		let call = Call::patch("item.update", &[id], json!({ "fields": fields }));
		self.client.call(request_id, call).await?;
		Ok(())
	}

	async fn delete(&self, request_id: RequestId, id: &str) -> Result<bool, RepositoryError> {
		// Some deployments refuse DELETE (e.g. cross-origin), so fall back to
		// the POST endpoint when the verb itself fails.
		let primary = self
			.client
			.call(request_id, Call::delete("item.delete", &[id]).without_retry())
			.await;
		let error = match primary {
			Ok(_) => return Ok(true),
			Err(RepositoryError::NotFound) => return Ok(false),
			Err(e) => e,
		};
		warn!(item_id = id, %request_id, error = %error, "DELETE failed, using POST fallback");

		let fallback = Call::post("item.delete-fallback", &["delete"], json!({ "itemId": id }));
		match self.client.call(request_id, fallback).await {
			Ok(_) => Ok(true),
			Err(RepositoryError::NotFound) => Ok(false),
			Err(e) => Err(e),
		}
	}

	async fn get(&self, request_id: RequestId, id: &str) -> Result<PublishItem, RepositoryError> {
		let body = self.client.call(request_id, Call::get("item.get", &[id])).await?;
		Ok(PublishItem {
			id: id_field(&body, "id").unwrap_or_else(|| id.to_string()),
			fields: fields_of(&body),
		})
	}
}

#[async_trait]
impl MemberProfileApi for HttpPublishItems {
	async fn fetch(&self, request_id: RequestId, member_id: &str) -> Result<MemberProfile, RepositoryError> {
		let call = Call::get("member.get", &["members", member_id]);
		let body = self.client.call(request_id, call).await?;
		let fields = fields_of(&body);
		let back_references = match fields.get(&self.back_reference_field) {
			None | Some(Value::Null) => Vec::new(),
			Some(Value::Array(items)) => items
				.iter()
				.filter_map(|v| v.as_str().map(str::to_string))
				.collect(),
			Some(other) => {
				return Err(RepositoryError::Decode(format!(
					"field '{}' is not a list: {other}",
					self.back_reference_field
				)));
			},
		};
		Ok(MemberProfile {
			id: id_field(&body, "id").unwrap_or_else(|| member_id.to_string()),
			back_references,
			fields,
		})
	}

	async fn write_back_references(
		&self,
		request_id: RequestId,
		member_id: &str,
		references: &[String],
		fencing_token: u64,
	) -> Result<(), RepositoryError> {
		let mut fields = Fields::new();
		fields.insert(self.back_reference_field.clone(), json!(references));
		let call = Call::patch("member.update", &["members", member_id], json!({ "fields": fields }))
			.with_fencing_token(fencing_token)
			.without_retry();
		self.client.call(request_id, call).await?;
		Ok(())
	}

	fn write_retry(&self) -> RetryPolicy {
		self.client.retry_policy()
	}
}
