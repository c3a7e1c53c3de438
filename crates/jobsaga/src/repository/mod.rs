//! Adapters for the external systems the saga writes to.
//!
//! Each HTTP adapter goes through a [`ServiceClient`], which retries
//! transient failures with the configured [`RetryPolicy`], tags every request
//! with the saga's [`RequestId`], and normalizes responses and errors.

mod credits;
mod items;
mod jobs;
mod members;

use std::time::Duration;

use http::{Method, StatusCode};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub use credits::{CreditService, CreditUsage, HttpCredits};
pub use items::{HttpPublishItems, PublishItem, PublishItemRepository};
pub use jobs::{HttpJobRecords, JobRecord, JobRecordRepository};
pub use members::{MemberProfile, MemberProfileApi, MemberProfiles, MergedReferences};

pub use crate::transaction::RequestId;
use crate::retry::{RetryPolicy, retry_if};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const FENCING_TOKEN_HEADER: &str = "x-fencing-token";

pub type Fields = Map<String, Value>;

#[derive(Debug, Error)]
pub enum RepositoryError {
	#[error("transport error: {0}")]
	Transport(String),

	#[error("request timed out")]
	Timeout,

	#[error("not found")]
	NotFound,

	#[error("reference '{reference}' was rejected")]
	RejectedReference { reference: String },

	#[error("{operation} returned {status}: {body}")]
	Status {
		operation: String,
		status: StatusCode,
		body: String,
	},

	#[error("invalid response: {0}")]
	Decode(String),

	#[error("invalid request: {0}")]
	InvalidRequest(String),
}

impl RepositoryError {
	/// Transient failures worth retrying.
	pub fn is_retryable(&self) -> bool {
		match self {
			RepositoryError::Transport(_) | RepositoryError::Timeout => true,
			RepositoryError::Status { status, .. } => {
				status.is_server_error()
					|| *status == StatusCode::TOO_MANY_REQUESTS
					|| *status == StatusCode::REQUEST_TIMEOUT
			},
			_ => false,
		}
	}

	/// The endpoint itself could not serve the request.
	pub fn is_unavailable(&self) -> bool {
		match self {
			RepositoryError::Transport(_) | RepositoryError::Timeout => true,
			RepositoryError::Status { status, .. } => status.is_server_error(),
			_ => false,
		}
	}
}

/// Id and raw body of a created entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
	pub id: String,
	pub raw: Value,
}

impl Created {
	fn from_body(body: Value) -> Result<Self, RepositoryError> {
		let id = id_field(&body, "id")
			.ok_or_else(|| RepositoryError::Decode(format!("response has no id: {body}")))?;
		Ok(Self { id, raw: body })
	}
}

/// Read a string or numeric id field.
pub(crate) fn id_field(body: &Value, field: &str) -> Option<String> {
	match body.get(field)? {
		Value::String(s) if !s.is_empty() => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		_ => None,
	}
}

/// One logical call against a service.
#[derive(Debug, Clone)]
pub struct Call<'a> {
	label: &'a str,
	method: Method,
	segments: Vec<&'a str>,
	body: Option<Value>,
	fencing_token: Option<u64>,
	retry: bool,
}

impl<'a> Call<'a> {
	pub fn new(label: &'a str, method: Method, segments: &[&'a str]) -> Self {
		Self {
			label,
			method,
			segments: segments.to_vec(),
			body: None,
			fencing_token: None,
			retry: true,
		}
	}

	pub fn get(label: &'a str, segments: &[&'a str]) -> Self {
		Self::new(label, Method::GET, segments)
	}

	pub fn post(label: &'a str, segments: &[&'a str], body: Value) -> Self {
		Self::new(label, Method::POST, segments).with_body(body)
	}

	pub fn patch(label: &'a str, segments: &[&'a str], body: Value) -> Self {
		Self::new(label, Method::PATCH, segments).with_body(body)
	}

	pub fn delete(label: &'a str, segments: &[&'a str]) -> Self {
		Self::new(label, Method::DELETE, segments)
	}

	pub fn with_body(mut self, body: Value) -> Self {
		self.body = Some(body);
		self
	}

	pub fn with_fencing_token(mut self, token: u64) -> Self {
		self.fencing_token = Some(token);
		self
	}

	/// Make a single attempt regardless of the client's retry policy.
	pub fn without_retry(mut self) -> Self {
		self.retry = false;
		self
	}
}

/// HTTP client for one external service.
#[derive(Debug, Clone)]
pub struct ServiceClient {
	http: reqwest::Client,
	base: Url,
	retry: RetryPolicy,
}

impl ServiceClient {
	pub fn new(base: Url, timeout: Duration, retry: RetryPolicy) -> Result<Self, RepositoryError> {
		let http = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| RepositoryError::InvalidRequest(e.to_string()))?;
		Ok(Self { http, base, retry })
	}

	pub fn base(&self) -> &Url {
		&self.base
	}

	pub fn retry_policy(&self) -> RetryPolicy {
		self.retry
	}

	fn url(&self, segments: &[&str]) -> Result<Url, RepositoryError> {
		let mut url = self.base.clone();
		if !segments.is_empty() {
			url
				.path_segments_mut()
				.map_err(|_| RepositoryError::InvalidRequest(format!("cannot extend base URL {}", self.base)))?
				.pop_if_empty()
				.extend(segments);
		}
		Ok(url)
	}

	/// Send `call` with retries and return the decoded success body.
	///
	/// 404 maps to [`RepositoryError::NotFound`]; a rejected write naming a
	/// `rejectedReference` maps to [`RepositoryError::RejectedReference`].
	pub async fn call(&self, request_id: RequestId, call: Call<'_>) -> Result<Value, RepositoryError> {
		let policy = if call.retry {
			self.retry
		} else {
			RetryPolicy::no_retry()
		};
		retry_if(
			&policy,
			call.label,
			|| self.send_once(request_id, &call),
			RepositoryError::is_retryable,
		)
		.await
	}

	async fn send_once(&self, request_id: RequestId, call: &Call<'_>) -> Result<Value, RepositoryError> {
		let url = self.url(&call.segments)?;
		let mut request = self
			.http
			.request(call.method.clone(), url.clone())
			.header(REQUEST_ID_HEADER, request_id.to_string());
		if let Some(token) = call.fencing_token {
			request = request.header(FENCING_TOKEN_HEADER, token.to_string());
		}
		if let Some(body) = &call.body {
			let mut body = body.clone();
			if let Value::Object(map) = &mut body {
				map.insert("requestId".to_string(), Value::String(request_id.to_string()));
			}
			let bytes =
				serde_json::to_vec(&body).map_err(|e| RepositoryError::InvalidRequest(e.to_string()))?;
			request = request
				.header(http::header::CONTENT_TYPE, "application/json")
				.body(bytes);
		}

		debug!(operation = call.label, method = %call.method, %url, %request_id, "sending request");
		let response = request.send().await.map_err(|e| {
			if e.is_timeout() {
				RepositoryError::Timeout
			} else {
				RepositoryError::Transport(e.to_string())
			}
		})?;

		let status = response.status();
		let text = response
			.text()
			.await
			.map_err(|e| RepositoryError::Transport(format!("failed to read response body: {e}")))?;
		let body = if text.trim().is_empty() {
			Value::Null
		} else {
			serde_json::from_str(&text).unwrap_or(Value::String(text))
		};

		if status.is_success() {
			return Ok(body);
		}
		if status == StatusCode::NOT_FOUND {
			return Err(RepositoryError::NotFound);
		}
		if matches!(
			status,
			StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY
		) && let Some(reference) = id_field(&body, "rejectedReference")
		{
			return Err(RepositoryError::RejectedReference { reference });
		}
		Err(RepositoryError::Status {
			operation: call.label.to_string(),
			status,
			body: match body {
				Value::String(s) => s,
				other => other.to_string(),
			},
		})
	}
}
