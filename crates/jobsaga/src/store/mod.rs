//! Key/value storage shared by the advisory lock and the transaction journal.

mod memory;

use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryStore;

/// Error type for StateStore operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("serialization error: {0}")]
	Serialization(String),
	#[error("storage error: {0}")]
	Storage(String),
}

/// Async key-value storage with TTL support and the atomic primitives needed
/// to build a lease-based lock on top of it.
///
/// Expired keys behave exactly like absent keys for every operation.
#[async_trait]
pub trait StateStore: Send + Sync {
	/// Returns `Ok(None)` if the key doesn't exist or has expired.
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

	/// Set a value with an optional TTL, overwriting any existing value.
	async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

	/// Set a value only if the key is absent (or expired).
	///
	/// Returns `true` if the value was written.
	async fn set_if_absent(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<bool, StoreError>;

	/// Delete the key only if its current value equals `expected`.
	///
	/// Returns `true` if the key was deleted.
	async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError>;

	/// Atomically increment a counter and return the new value. Counters never expire.
	async fn increment(&self, key: &str) -> Result<u64, StoreError>;

	/// Returns `Ok(())` regardless of whether the key existed.
	async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Extension trait for StateStore that provides JSON convenience methods
#[async_trait]
pub trait StateStoreExt: StateStore {
	async fn get_json<T: serde::de::DeserializeOwned + Send>(
		&self,
		key: &str,
	) -> Result<Option<T>, StoreError> {
		match self.get(key).await? {
			Some(bytes) => serde_json::from_slice(&bytes)
				.map(Some)
				.map_err(|e| StoreError::Serialization(e.to_string())),
			None => Ok(None),
		}
	}

	async fn set_json<T: serde::Serialize + Send + Sync>(
		&self,
		key: &str,
		value: &T,
		ttl: Option<Duration>,
	) -> Result<(), StoreError> {
		let bytes =
			serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
		self.set(key, bytes, ttl).await
	}
}

// Blanket implementation for all StateStore implementations
impl<T: StateStore + ?Sized> StateStoreExt for T {}
