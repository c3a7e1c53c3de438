//! In-process implementation of StateStore.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{StateStore, StoreError};

/// Entry in the memory store with optional expiration
struct MemoryEntry {
	value: Vec<u8>,
	expires_at: Option<Instant>,
}

impl MemoryEntry {
	fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
		Self {
			value,
			expires_at: ttl.map(|d| Instant::now() + d),
		}
	}

	fn is_expired(&self) -> bool {
		self.expires_at.is_some_and(|exp| Instant::now() >= exp)
	}
}

/// In-memory implementation of StateStore.
///
/// Suitable for a single coordinator process. Deployments running several
/// coordinators against the same members need a shared store with the same
/// atomic guarantees.
#[derive(Default)]
pub struct MemoryStore {
	data: Mutex<HashMap<String, MemoryEntry>>,
	counters: Mutex<HashMap<String, u64>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of live (unexpired) entries.
	pub fn len(&self) -> usize {
		self.data.lock().values().filter(|e| !e.is_expired()).count()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Keys of all live entries starting with `prefix`.
	pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
		let data = self.data.lock();
		let mut keys: Vec<String> = data
			.iter()
			.filter(|(k, e)| k.starts_with(prefix) && !e.is_expired())
			.map(|(k, _)| k.clone())
			.collect();
		keys.sort();
		keys
	}
}

#[async_trait]
impl StateStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		let mut data = self.data.lock();
		if let Some(entry) = data.get(key) {
			if entry.is_expired() {
				data.remove(key);
				return Ok(None);
			}
			return Ok(Some(entry.value.clone()));
		}
		Ok(None)
	}

	async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
		self
			.data
			.lock()
			.insert(key.to_string(), MemoryEntry::new(value, ttl));
		Ok(())
	}

	async fn set_if_absent(
		&self,
		key: &str,
		value: Vec<u8>,
		ttl: Option<Duration>,
	) -> Result<bool, StoreError> {
		let mut data = self.data.lock();
		if let Some(entry) = data.get(key)
			&& !entry.is_expired()
		{
			return Ok(false);
		}
		data.insert(key.to_string(), MemoryEntry::new(value, ttl));
		Ok(true)
	}

	async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
		let mut data = self.data.lock();
		match data.get(key) {
			Some(entry) if !entry.is_expired() && entry.value == expected => {
				data.remove(key);
				Ok(true)
			},
			_ => Ok(false),
		}
	}

	async fn increment(&self, key: &str) -> Result<u64, StoreError> {
		let mut counters = self.counters.lock();
		let counter = counters.entry(key.to_string()).or_insert(0);
		*counter += 1;
		Ok(*counter)
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		self.data.lock().remove(key);
		Ok(())
	}
}
