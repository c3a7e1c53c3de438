//! Bounded exponential-backoff retry.
//!
//! The delay before attempt `n + 1` is `min(initial_delay * 2^(n-1), max_delay)`.
//! Once attempts are exhausted the last error is returned as-is.

use std::fmt::Display;
use std::future::Future;
use std::num::NonZeroU8;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::serde_dur;

/// Retry policy shared by every repository adapter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryPolicy {
	/// Total number of attempts, including the first one.
	#[serde(default = "default_attempts")]
	pub attempts: NonZeroU8,

	#[serde(default = "default_initial_delay", with = "serde_dur")]
	pub initial_delay: Duration,

	#[serde(default = "default_max_delay", with = "serde_dur")]
	pub max_delay: Duration,
}

fn default_attempts() -> NonZeroU8 {
	NonZeroU8::new(3).unwrap_or(NonZeroU8::MIN)
}

fn default_initial_delay() -> Duration {
	Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
	Duration::from_secs(10)
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			attempts: default_attempts(),
			initial_delay: default_initial_delay(),
			max_delay: default_max_delay(),
		}
	}
}

impl RetryPolicy {
	pub fn new(attempts: u8, initial_delay: Duration, max_delay: Duration) -> Self {
		Self {
			attempts: NonZeroU8::new(attempts).unwrap_or(NonZeroU8::MIN),
			initial_delay,
			max_delay,
		}
	}

	/// A policy that makes exactly one attempt.
	pub fn no_retry() -> Self {
		Self::new(1, Duration::ZERO, Duration::ZERO)
	}

	/// Delay to wait after failed attempt `attempt` (1-based).
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(31);
		let factor = 1u32 << exponent;
		self
			.initial_delay
			.checked_mul(factor)
			.map_or(self.max_delay, |d| d.min(self.max_delay))
	}
}

/// An operation that can be invoked repeatedly until it succeeds.
///
/// Implemented for every `FnMut() -> Future` closure, so callers usually pass
/// an `async` closure or `|| async move { .. }`.
pub trait Retryable<T, E> {
	fn attempt(&mut self) -> impl Future<Output = Result<T, E>> + Send;
}

impl<F, Fut, T, E> Retryable<T, E> for F
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>> + Send,
{
	fn attempt(&mut self) -> impl Future<Output = Result<T, E>> + Send {
		self()
	}
}

/// Invoke `op` until it succeeds or the policy's attempts are exhausted.
pub async fn retry<T, E, R>(policy: &RetryPolicy, label: &str, op: R) -> Result<T, E>
where
	R: Retryable<T, E>,
	E: Display,
{
	retry_if(policy, label, op, |_| true).await
}

/// Like [`retry`], but errors for which `should_retry` returns false are
/// returned immediately.
pub async fn retry_if<T, E, R, P>(
	policy: &RetryPolicy,
	label: &str,
	mut op: R,
	should_retry: P,
) -> Result<T, E>
where
	R: Retryable<T, E>,
	E: Display,
	P: Fn(&E) -> bool,
{
	let max_attempts = u32::from(policy.attempts.get());
	let mut attempt = 1;
	loop {
		match op.attempt().await {
			Ok(value) => return Ok(value),
			Err(e) if attempt >= max_attempts || !should_retry(&e) => {
				warn!(
					operation = label,
					attempt,
					max_attempts,
					error = %e,
					"attempt failed, giving up"
				);
				return Err(e);
			},
			Err(e) => {
				let delay = policy.delay_for(attempt);
				warn!(
					operation = label,
					attempt,
					max_attempts,
					delay = ?delay,
					error = %e,
					"attempt failed, backing off"
				);
				tokio::time::sleep(delay).await;
				attempt += 1;
			},
		}
	}
}
