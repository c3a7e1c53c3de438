//! Named, TTL-bounded advisory locks.
//!
//! Locks only exclude callers that take them. A lease that outlives its TTL
//! is presumed abandoned and the key may be taken by another holder, so every
//! write made under a lease should first call [`LockLease::ensure_live`] and
//! pass the lease's fencing token to the guarded system.

mod store_lock;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

pub use store_lock::StoreLock;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum LockError {
	#[error("timed out after {waited:?} waiting for lock '{resource_key}'")]
	Timeout {
		resource_key: String,
		waited: Duration,
	},

	#[error("lease on '{resource_key}' (fencing token {fencing_token}) has expired")]
	Expired {
		resource_key: String,
		fencing_token: u64,
	},

	#[error("lock store error: {0}")]
	Store(#[from] StoreError),
}

/// Proof of ownership of a lock.
#[derive(Debug, Clone)]
pub struct LockLease {
	pub resource_key: String,
	pub holder_id: String,
	/// Strictly increasing per resource key across successful acquisitions.
	pub fencing_token: u64,
	pub acquired_at: DateTime<Utc>,
	expires_at: Instant,
	record: Vec<u8>,
}

impl LockLease {
	pub(crate) fn new(
		resource_key: String,
		holder_id: String,
		fencing_token: u64,
		acquired_at: DateTime<Utc>,
		expires_at: Instant,
		record: Vec<u8>,
	) -> Self {
		Self {
			resource_key,
			holder_id,
			fencing_token,
			acquired_at,
			expires_at,
			record,
		}
	}

	pub fn is_live(&self) -> bool {
		Instant::now() < self.expires_at
	}

	/// Fails once the lease's TTL has elapsed.
	pub fn ensure_live(&self) -> Result<(), LockError> {
		if self.is_live() {
			Ok(())
		} else {
			Err(LockError::Expired {
				resource_key: self.resource_key.clone(),
				fencing_token: self.fencing_token,
			})
		}
	}

	pub(crate) fn record(&self) -> &[u8] {
		&self.record
	}
}

#[async_trait]
pub trait AdvisoryLock: Send + Sync {
	/// Wait until `resource_key` is free (or its holder's lease expired) and take it.
	async fn acquire(
		&self,
		resource_key: &str,
		holder_id: &str,
		timeout: Duration,
	) -> Result<LockLease, LockError>;

	/// Release a lease. Returns `false` if the lease was no longer held, e.g.
	/// because it expired and another holder took the key.
	async fn release(&self, lease: &LockLease) -> Result<bool, LockError>;
}

/// Acquire `resource_key`, run `f` under the lease, and release the lease on
/// every return path.
pub async fn with_lock<L, F, Fut, T, E>(
	lock: &L,
	resource_key: &str,
	holder_id: &str,
	timeout: Duration,
	f: F,
) -> Result<T, E>
where
	L: AdvisoryLock + ?Sized,
	F: FnOnce(LockLease) -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: From<LockError>,
{
	let lease = lock.acquire(resource_key, holder_id, timeout).await?;
	let result = f(lease.clone()).await;
	match lock.release(&lease).await {
		Ok(true) => {},
		Ok(false) => warn!(
			resource_key,
			holder_id,
			fencing_token = lease.fencing_token,
			"lease was lost before release"
		),
		Err(e) => warn!(resource_key, holder_id, error = %e, "failed to release lock"),
	}
	result
}
