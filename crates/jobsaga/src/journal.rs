//! Snapshot of the in-flight transaction, kept in a [`StateStore`].
//!
//! The snapshot is rewritten after every checkpoint and removed when the
//! saga finishes. It exists so an operator can see what a saga had created
//! if the process died mid-run; the saga never reads it back.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::JournalSettings;
use crate::store::{StateStore, StateStoreExt, StoreError};
use crate::transaction::{RequestId, Transaction};

const JOURNAL_PREFIX: &str = "saga:tx:";

#[derive(Clone)]
pub struct TransactionJournal {
	store: Arc<dyn StateStore>,
	ttl: Duration,
}

impl TransactionJournal {
	pub fn new(store: Arc<dyn StateStore>, settings: JournalSettings) -> Self {
		Self {
			store,
			ttl: settings.ttl,
		}
	}

	pub fn key(id: RequestId) -> String {
		format!("{JOURNAL_PREFIX}{id}")
	}

	/// Best-effort: store errors are logged and swallowed.
	pub async fn save(&self, tx: &Transaction) {
		if let Err(e) = self
			.store
			.set_json(&Self::key(tx.id()), tx, Some(self.ttl))
			.await
		{
			warn!(request_id = %tx.id(), error = %e, "failed to journal transaction");
		}
	}

	pub async fn discard(&self, id: RequestId) {
		if let Err(e) = self.store.delete(&Self::key(id)).await {
			warn!(request_id = %id, error = %e, "failed to discard journaled transaction");
		}
	}

	pub async fn load(&self, id: RequestId) -> Result<Option<Transaction>, StoreError> {
		self.store.get_json(&Self::key(id)).await
	}
}
