//! Coordinator configuration.
//!
//! ```yaml
//! services:
//!   jobRecords: http://jobs.internal
//!   publishItems: http://cms.internal/items
//!   credits: http://credits.internal
//! retry:
//!   attempts: 3
//!   initialDelay: 1s
//!   maxDelay: 10s
//! lock:
//!   timeout: 10s
//!   ttl: 30s
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_yaml::Error),

	#[error("invalid config: {0}")]
	Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SagaConfig {
	pub services: ServiceEndpoints,

	#[serde(default)]
	pub retry: RetryPolicy,

	#[serde(default)]
	pub lock: LockSettings,

	#[serde(default)]
	pub journal: JournalSettings,

	/// Per-request timeout applied by every HTTP adapter.
	#[serde(default = "default_request_timeout", with = "serde_dur")]
	pub request_timeout: Duration,

	#[serde(default)]
	pub fields: FieldNames,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServiceEndpoints {
	pub job_records: Url,
	pub publish_items: Url,
	/// Usage-credit service. Credit deduction is skipped when unset.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub credits: Option<Url>,
	/// Receives terminal saga events as JSON. Events are only logged when unset.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub notify_webhook: Option<Url>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LockSettings {
	/// How long `acquire` waits for a busy key before giving up.
	#[serde(default = "default_lock_timeout", with = "serde_dur")]
	pub timeout: Duration,
	/// Lease lifetime; a lock not released within it is presumed abandoned.
	#[serde(default = "default_lock_ttl", with = "serde_dur")]
	pub ttl: Duration,
	#[serde(default = "default_poll_interval", with = "serde_dur")]
	pub poll_interval: Duration,
}

impl Default for LockSettings {
	fn default() -> Self {
		Self {
			timeout: default_lock_timeout(),
			ttl: default_lock_ttl(),
			poll_interval: default_poll_interval(),
		}
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JournalSettings {
	/// How long an in-flight transaction snapshot survives if the process dies mid-saga.
	#[serde(default = "default_journal_ttl", with = "serde_dur")]
	pub ttl: Duration,
}

impl Default for JournalSettings {
	fn default() -> Self {
		Self {
			ttl: default_journal_ttl(),
		}
	}
}

/// Field names used to link records across the external systems.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FieldNames {
	#[serde(default = "default_name_field")]
	pub name: String,
	#[serde(default = "default_slug_field")]
	pub slug: String,
	/// Publish-item field holding the item's own id.
	#[serde(default = "default_self_link_field")]
	pub self_link: String,
	/// Publish-item field holding the submitting member's id.
	#[serde(default = "default_member_field")]
	pub member: String,
	/// Member-profile field holding the list of published item ids.
	#[serde(default = "default_back_reference_field")]
	pub back_references: String,
}

impl Default for FieldNames {
	fn default() -> Self {
		Self {
			name: default_name_field(),
			slug: default_slug_field(),
			self_link: default_self_link_field(),
			member: default_member_field(),
			back_references: default_back_reference_field(),
		}
	}
}

fn default_request_timeout() -> Duration {
	Duration::from_secs(15)
}
fn default_lock_timeout() -> Duration {
	Duration::from_secs(10)
}
fn default_lock_ttl() -> Duration {
	Duration::from_secs(30)
}
fn default_poll_interval() -> Duration {
	Duration::from_millis(100)
}
fn default_journal_ttl() -> Duration {
	Duration::from_secs(60 * 60)
}
fn default_name_field() -> String {
	"name".to_string()
}
fn default_slug_field() -> String {
	"slug".to_string()
}
fn default_self_link_field() -> String {
	"item-id".to_string()
}
fn default_member_field() -> String {
	"member".to_string()
}
fn default_back_reference_field() -> String {
	"job-posts".to_string()
}

impl SagaConfig {
	pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
		let config: SagaConfig = serde_yaml::from_str(content)?;
		config.validate()?;
		Ok(config)
	}

	pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let content = fs_err::tokio::read_to_string(path.as_ref()).await?;
		Self::from_yaml(&content)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.retry.max_delay < self.retry.initial_delay {
			return Err(ConfigError::Invalid(
				"retry.maxDelay must not be smaller than retry.initialDelay".into(),
			));
		}
		if self.lock.ttl <= self.lock.poll_interval {
			return Err(ConfigError::Invalid(
				"lock.ttl must be longer than lock.pollInterval".into(),
			));
		}
		if self.lock.poll_interval.is_zero() {
			return Err(ConfigError::Invalid("lock.pollInterval must be positive".into()));
		}
		let urls = [
			Some(&self.services.job_records),
			Some(&self.services.publish_items),
			self.services.credits.as_ref(),
			self.services.notify_webhook.as_ref(),
		];
		for url in urls.into_iter().flatten() {
			if !matches!(url.scheme(), "http" | "https") {
				return Err(ConfigError::Invalid(format!("unsupported URL scheme: {url}")));
			}
		}
		Ok(())
	}
}

/// Parse a duration string like "100ms", "30s", "5m", "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
	let s = s.trim();
	if s.is_empty() {
		return Err(ConfigError::Invalid("empty duration string".into()));
	}

	let (num_str, unit) = if let Some(n) = s.strip_suffix("ms") {
		(n, "ms")
	} else if let Some(n) = s.strip_suffix('s') {
		(n, "s")
	} else if let Some(n) = s.strip_suffix('m') {
		(n, "m")
	} else if let Some(n) = s.strip_suffix('h') {
		(n, "h")
	} else {
		(s, "s")
	};

	let num: u64 = num_str
		.parse()
		.map_err(|_| ConfigError::Invalid(format!("invalid duration number: {num_str}")))?;

	Ok(match unit {
		"ms" => Duration::from_millis(num),
		"m" => Duration::from_secs(num * 60),
		"h" => Duration::from_secs(num * 60 * 60),
		_ => Duration::from_secs(num),
	})
}

/// Format a duration the way [`parse_duration`] reads it back.
pub fn format_duration(d: Duration) -> String {
	let millis = d.as_millis();
	if millis % 1000 != 0 {
		format!("{millis}ms")
	} else if millis % (60 * 60 * 1000) == 0 && millis > 0 {
		format!("{}h", millis / (60 * 60 * 1000))
	} else if millis % (60 * 1000) == 0 && millis > 0 {
		format!("{}m", millis / (60 * 1000))
	} else {
		format!("{}s", millis / 1000)
	}
}

pub mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&super::format_duration(*d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		super::parse_duration(&raw).map_err(serde::de::Error::custom)
	}
}
