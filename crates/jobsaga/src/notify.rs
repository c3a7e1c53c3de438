//! Terminal saga events and where they go.

use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::error::{FailureKind, NonCriticalFailure};
use crate::repository::REQUEST_ID_HEADER;
use crate::rollback::CompensationResult;
use crate::transaction::{RequestId, Transaction};

#[derive(Debug, Error)]
pub enum NotifyError {
	#[error("failed to serialize event: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("failed to deliver event: {0}")]
	Transport(String),

	#[error("notification endpoint returned {0}")]
	Status(StatusCode),
}

/// Emitted once per saga, after it has reached a terminal state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SagaEvent {
	#[serde(rename_all = "camelCase")]
	Succeeded {
		request_id: RequestId,
		job_record_id: String,
		publish_item_id: String,
		warnings: Vec<NonCriticalFailure>,
		transaction: Box<Transaction>,
	},
	#[serde(rename_all = "camelCase")]
	Failed {
		request_id: RequestId,
		kind: FailureKind,
		message: String,
		#[serde(skip_serializing_if = "Option::is_none")]
		compensation: Option<CompensationResult>,
		/// Final state and the full checkpoint log.
		transaction: Box<Transaction>,
	},
}

impl SagaEvent {
	pub fn request_id(&self) -> RequestId {
		match self {
			SagaEvent::Succeeded { request_id, .. } | SagaEvent::Failed { request_id, .. } => *request_id,
		}
	}
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
	async fn notify(&self, event: &SagaEvent) -> Result<(), NotifyError>;
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
	async fn notify(&self, event: &SagaEvent) -> Result<(), NotifyError> {
		let payload = serde_json::to_string(event)?;
		match event {
			SagaEvent::Succeeded { request_id, .. } => {
				info!(%request_id, event = %payload, "saga succeeded")
			},
			SagaEvent::Failed {
				request_id, kind, ..
			} => error!(%request_id, ?kind, event = %payload, "saga failed"),
		}
		Ok(())
	}
}

/// POSTs events as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookSink {
	client: reqwest::Client,
	url: Url,
}

impl WebhookSink {
	pub fn new(url: Url, timeout: Duration) -> Result<Self, NotifyError> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| NotifyError::Transport(e.to_string()))?;
		Ok(Self { client, url })
	}
}

#[async_trait]
impl NotificationSink for WebhookSink {
	async fn notify(&self, event: &SagaEvent) -> Result<(), NotifyError> {
		let body = serde_json::to_vec(event)?;
		let response = self
			.client
			.post(self.url.clone())
			.header(http::header::CONTENT_TYPE, "application/json")
			.header(REQUEST_ID_HEADER, event.request_id().to_string())
			.body(body)
			.send()
			.await
			.map_err(|e| NotifyError::Transport(e.to_string()))?;
		if !response.status().is_success() {
			return Err(NotifyError::Status(response.status()));
		}
		Ok(())
	}
}
