//! Retry policy engine
//!
//! A request is retried while its outcome is retryable and the bounded
//! attempt budget is not exhausted. Waits are scheduled on the caller's own
//! timer; nothing here sleeps a shared worker.

use std::collections::HashSet;
use std::time::Duration;

use http::Method;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Retry policy kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicyType {
    /// Constant delay between attempts
    Linear,
    /// Geometrically growing delay between attempts
    Exponential,
}

// Upper bound on a single backoff wait; keeps the exponential formula away
// from non-finite values for extreme retry counts.
const MAX_DELAY_SECS: f64 = 86_400.0;

fn default_retry_limit() -> u32 {
    10
}

fn default_retry_interval() -> u64 {
    2000
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_scale() -> f64 {
    0.5
}

fn default_status_codes() -> HashSet<u16> {
    [408, 429, 500, 502, 503, 504].into_iter().collect()
}

fn default_retry_methods() -> HashSet<String> {
    ["GET", "PUT", "DELETE"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

/// Configuration for a retry policy, attachable at session or request level.
///
/// A request-level configuration fully overrides the session policy for that
/// one call and is discarded once the call resolves.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyConfiguration {
    /// Policy kind; `None` disables retries entirely
    #[serde(rename = "type")]
    pub policy_type: Option<RetryPolicyType>,

    /// Maximum number of retries after the initial attempt.
    ///
    /// Zero means "attempt once, never retry".
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Delay between attempts in milliseconds (linear policies)
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,

    /// Backoff base (exponential policies)
    #[serde(default = "default_backoff_base")]
    pub exponential_backoff_base: f64,

    /// Backoff scale in seconds (exponential policies)
    #[serde(default = "default_backoff_scale")]
    pub exponential_backoff_scale: f64,

    /// HTTP status codes considered transient failures
    #[serde(default = "default_status_codes")]
    pub status_codes: HashSet<u16>,

    /// HTTP methods eligible for retry
    #[serde(default = "default_retry_methods")]
    pub retry_methods: HashSet<String>,
}

impl Default for RetryPolicyConfiguration {
    fn default() -> Self {
        Self {
            policy_type: None,
            retry_limit: default_retry_limit(),
            retry_interval: default_retry_interval(),
            exponential_backoff_base: default_backoff_base(),
            exponential_backoff_scale: default_backoff_scale(),
            status_codes: default_status_codes(),
            retry_methods: default_retry_methods(),
        }
    }
}

impl RetryPolicyConfiguration {
    /// Validate the configuration, rejecting values the delay formulas cannot
    /// work with.
    pub fn validate(&self) -> Result<()> {
        if self.policy_type.is_none() {
            return Ok(());
        }

        if self.retry_interval == 0 {
            return Err(Error::Config {
                message: "retryInterval must be greater than 0".to_string(),
            });
        }

        if self.exponential_backoff_base <= 0.0 || self.exponential_backoff_scale <= 0.0 {
            return Err(Error::Config {
                message: "exponential backoff base and scale must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Narrow the retryable method set to exactly one request's method.
    ///
    /// Used when resolving a per-request policy: the request either is or
    /// is not eligible, independent of the idempotent-method default set.
    pub fn for_method(mut self, method: &Method) -> Self {
        self.retry_methods = [method.as_str().to_string()].into_iter().collect();
        self
    }

    fn method_eligible(&self, method: &Method) -> bool {
        self.retry_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.policy_type {
            Some(RetryPolicyType::Linear) | None => Duration::from_millis(self.retry_interval),
            Some(RetryPolicyType::Exponential) => {
                let seconds = (self.exponential_backoff_base.powi(retry as i32)
                    * self.exponential_backoff_scale)
                    .min(MAX_DELAY_SECS);
                Duration::from_secs_f64(seconds)
            }
        }
    }
}

/// Outcome of one attempt, as seen by the engine
#[derive(Debug)]
pub enum AttemptOutcome<'a> {
    /// An HTTP response was received with this status code
    Response(u16),
    /// The attempt failed before any HTTP response existed
    Failure(&'a Error),
}

/// Decision for what to do after an attempt
#[derive(Debug, PartialEq)]
pub enum RetryDecision {
    /// The outcome is final: success or a non-retryable failure
    Done,
    /// Wait, then run the next attempt
    RetryAfter(Duration),
    /// The retry budget is spent; return the last outcome flagged as exhausted
    Exhausted,
}

/// Sequential retry state for a single request.
///
/// Attempts within one request are strictly ordered: the next attempt never
/// starts before the previous outcome has been observed here.
#[derive(Debug)]
pub struct RetryState {
    config: RetryPolicyConfiguration,
    method: Method,
    retries: u32,
}

impl RetryState {
    /// Create retry state for one request
    pub fn new(config: RetryPolicyConfiguration, method: Method) -> Self {
        Self {
            config,
            method,
            retries: 0,
        }
    }

    /// Number of retries performed so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Observe an attempt's outcome and decide what happens next
    pub fn observe(&mut self, outcome: AttemptOutcome<'_>) -> RetryDecision {
        if self.config.policy_type.is_none() {
            return RetryDecision::Done;
        }

        let retryable = match outcome {
            AttemptOutcome::Response(status) => {
                !(200..300).contains(&status) && self.config.status_codes.contains(&status)
            }
            AttemptOutcome::Failure(error) => error.is_transient(),
        };

        if !retryable || !self.config.method_eligible(&self.method) {
            return RetryDecision::Done;
        }

        if self.retries >= self.config.retry_limit {
            return RetryDecision::Exhausted;
        }

        self.retries += 1;
        RetryDecision::RetryAfter(self.config.delay_for(self.retries))
    }
}
