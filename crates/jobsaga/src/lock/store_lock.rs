use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use super::{AdvisoryLock, LockError, LockLease};
use crate::config::LockSettings;
use crate::store::{StateStore, StoreError};

const LOCK_PREFIX: &str = "lock:";
const FENCE_PREFIX: &str = "lock-fence:";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockRecord {
	holder_id: String,
	acquired_at: chrono::DateTime<Utc>,
	nonce: uuid::Uuid,
}

/// Advisory lock backed by a [`StateStore`].
///
/// The key is taken with an atomic set-if-absent carrying the lock TTL, so a
/// holder that never releases stops blocking others once the TTL elapses.
/// Acquisition polls at a fixed interval until the key is free or the
/// timeout passes.
pub struct StoreLock {
	store: Arc<dyn StateStore>,
	ttl: Duration,
	poll_interval: Duration,
}

impl StoreLock {
	pub fn new(store: Arc<dyn StateStore>, settings: LockSettings) -> Self {
		Self {
			store,
			ttl: settings.ttl,
			poll_interval: settings.poll_interval,
		}
	}

	/// Holder currently recorded for `resource_key`, if any.
	pub async fn holder(&self, resource_key: &str) -> Result<Option<String>, LockError> {
		let Some(bytes) = self.store.get(&lock_key(resource_key)).await? else {
			return Ok(None);
		};
		let record: LockRecord = serde_json::from_slice(&bytes)
			.map_err(|e| StoreError::Serialization(e.to_string()))?;
		Ok(Some(record.holder_id))
	}

	async fn try_acquire(
		&self,
		resource_key: &str,
		holder_id: &str,
	) -> Result<Option<LockLease>, LockError> {
		let acquired_at = Utc::now();
		let started = Instant::now();
		let record = serde_json::to_vec(&LockRecord {
			holder_id: holder_id.to_string(),
			acquired_at,
			nonce: uuid::Uuid::new_v4(),
		})
		.map_err(|e| StoreError::Serialization(e.to_string()))?;

		if !self
			.store
			.set_if_absent(&lock_key(resource_key), record.clone(), Some(self.ttl))
			.await?
		{
			return Ok(None);
		}

		// Drawn after winning the key so tokens only grow across successful holders.
		let fencing_token = self.store.increment(&fence_key(resource_key)).await?;
		Ok(Some(LockLease::new(
			resource_key.to_string(),
			holder_id.to_string(),
			fencing_token,
			acquired_at,
			started + self.ttl,
			record,
		)))
	}
}

fn lock_key(resource_key: &str) -> String {
	format!("{LOCK_PREFIX}{resource_key}")
}

fn fence_key(resource_key: &str) -> String {
	format!("{FENCE_PREFIX}{resource_key}")
}

#[async_trait]
impl AdvisoryLock for StoreLock {
	async fn acquire(
		&self,
		resource_key: &str,
		holder_id: &str,
		timeout: Duration,
	) -> Result<LockLease, LockError> {
		let start = Instant::now();
		let deadline = start + timeout;
		loop {
			if let Some(lease) = self.try_acquire(resource_key, holder_id).await? {
				debug!(
					resource_key,
					holder_id,
					fencing_token = lease.fencing_token,
					waited = ?start.elapsed(),
					"lock acquired"
				);
				return Ok(lease);
			}

			let now = Instant::now();
			if now >= deadline {
				return Err(LockError::Timeout {
					resource_key: resource_key.to_string(),
					waited: now - start,
				});
			}
			tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
		}
	}

	async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
		let released = self
			.store
			.compare_and_delete(&lock_key(&lease.resource_key), lease.record())
			.await?;
		debug!(
			resource_key = %lease.resource_key,
			holder_id = %lease.holder_id,
			released,
			"lock released"
		);
		Ok(released)
	}
}
