use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Call, RepositoryError, RequestId, ServiceClient};

/// Usage counters before and after a deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditUsage {
	pub before: i64,
	pub after: i64,
}

/// Optional usage-credit bookkeeping. Failures never fail a saga.
#[async_trait]
pub trait CreditService: Send + Sync {
	async fn deduct(&self, request_id: RequestId, member_id: &str) -> Result<CreditUsage, RepositoryError>;
}

#[derive(Debug, Clone)]
pub struct HttpCredits {
	client: ServiceClient,
}

impl HttpCredits {
	pub fn new(client: ServiceClient) -> Self {
		Self { client }
	}
}

#[async_trait]
impl CreditService for HttpCredits {
	async fn deduct(&self, request_id: RequestId, member_id: &str) -> Result<CreditUsage, RepositoryError> {
		// A deduction whose response was lost may still have been applied.
		let call = Call::post("credit.deduct", &[], json!({ "memberId": member_id })).without_retry();
		let body = self.client.call(request_id, call).await?;
		serde_json::from_value(body).map_err(|e| RepositoryError::Decode(e.to_string()))
	}
}
