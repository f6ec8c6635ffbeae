//! Error types for the projection engine.
//!
//! All errors that can occur while reducing and applying events are
//! represented by [`ProjectorError`]. Errors are propagated via
//! `Result<T, ProjectorError>` and classified where they are first
//! detected (registry dispatch, sequence tracker, executor result); nothing
//! downstream reclassifies them.
//!
//! # Error Classification
//!
//! - **Contract** — registry misconfiguration, undecodable payloads,
//!   malformed statements. Never retried; always alerts.
//! - **Sequence** — stale/duplicate or out-of-order delivery. Stale events
//!   are absorbed by the handler; gaps go back to the event feed.
//! - **Storage** — executor failures. Transient ones are retried unchanged
//!   with backoff, fatal ones mark the projection unhealthy.
//! - **Internal** — bugs. Not retried.
//!
//! # Retry Policy
//!
//! The [`RetryPolicy`] struct encapsulates exponential backoff with jitter for
//! transient storage failures. The handler uses it to decide whether and when
//! to resubmit a statement.

use std::fmt;

/// Primary error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum ProjectorError {
    // ── Contract errors — fail, don't retry ──────────────────────────────
    /// A reducer was handed an event type it does not handle.
    #[error("invalid event mapping: reducer for {expected} received {actual}")]
    InvalidEventMapping { expected: String, actual: String },

    /// The event payload could not be decoded into its declared structure.
    #[error("invalid payload for {event_type}: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    /// A statement could not be assembled (e.g. unscoped UPDATE/DELETE).
    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    /// The engine configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Sequence conditions ──────────────────────────────────────────────
    /// The event's sequence is not greater than the last applied one.
    #[error("stale or duplicate event: sequence {sequence} <= last applied {last}")]
    StaleOrDuplicateEvent { sequence: u64, last: u64 },

    /// The event references a predecessor that was never applied.
    #[error(
        "out-of-order event: sequence {sequence} follows {previous}, last applied is {last}"
    )]
    OutOfOrderEvent {
        sequence: u64,
        previous: u64,
        last: u64,
    },

    // ── Storage errors ───────────────────────────────────────────────────
    /// The executor reported a failure that is safe to retry unchanged.
    #[error("transient storage failure: {0}")]
    TransientStorageFailure(String),

    /// The executor reported a schema or constraint violation.
    #[error("fatal storage failure: {0}")]
    FatalStorageFailure(String),

    // ── Internal errors — should not happen ──────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ProjectorError {
    /// Whether the failed operation may be resubmitted unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProjectorError::TransientStorageFailure(_))
    }

    /// Whether this condition should page an operator.
    ///
    /// Sequence conditions and transient failures only degrade read-model
    /// freshness until redelivery or retry catches up.
    pub fn should_alert(&self) -> bool {
        matches!(
            self.kind(),
            ProjectorErrorKind::Contract | ProjectorErrorKind::Internal
        ) || matches!(self, ProjectorError::FatalStorageFailure(_))
    }

    /// Whether this error should count toward marking the projection unhealthy.
    pub fn counts_toward_unhealthy(&self) -> bool {
        !matches!(
            self,
            ProjectorError::StaleOrDuplicateEvent { .. }
                | ProjectorError::OutOfOrderEvent { .. }
                | ProjectorError::TransientStorageFailure(_)
        )
    }

    /// Build an [`ProjectorError::InvalidEventMapping`] from two displayable
    /// event type names.
    pub fn invalid_mapping(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        ProjectorError::InvalidEventMapping {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Classification of error severity/kind for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectorErrorKind {
    Contract,
    Sequence,
    Storage,
    Internal,
}

impl fmt::Display for ProjectorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectorErrorKind::Contract => write!(f, "CONTRACT"),
            ProjectorErrorKind::Sequence => write!(f, "SEQUENCE"),
            ProjectorErrorKind::Storage => write!(f, "STORAGE"),
            ProjectorErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl ProjectorError {
    /// Classify the error for monitoring and alerting.
    pub fn kind(&self) -> ProjectorErrorKind {
        match self {
            ProjectorError::InvalidEventMapping { .. }
            | ProjectorError::InvalidPayload { .. }
            | ProjectorError::InvalidStatement(_)
            | ProjectorError::InvalidConfig(_) => ProjectorErrorKind::Contract,

            ProjectorError::StaleOrDuplicateEvent { .. }
            | ProjectorError::OutOfOrderEvent { .. } => ProjectorErrorKind::Sequence,

            ProjectorError::TransientStorageFailure(_)
            | ProjectorError::FatalStorageFailure(_) => ProjectorErrorKind::Storage,

            ProjectorError::InternalError(_) => ProjectorErrorKind::Internal,
        }
    }
}

// ── Retry Policy ───────────────────────────────────────────────────────────

/// Retry policy with exponential backoff for transient storage failures.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Base delay in milliseconds (doubled each attempt).
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for backoff).
    pub max_delay_ms: u64,
    /// Maximum number of retry attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,  // 100ms initial
            max_delay_ms: 5_000, // 5 second cap
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Calculate the backoff delay in milliseconds for the given attempt number (0-based).
    ///
    /// Uses exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
    /// Adds simple jitter by varying ±25%.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let capped = delay.min(self.max_delay_ms);

        // Deterministic jitter: vary by ±25% based on attempt parity
        if attempt.is_multiple_of(2) {
            capped.saturating_mul(3) / 4
        } else {
            capped.saturating_mul(5) / 4
        }
    }

    /// Whether the given attempt (0-based) is within the retry limit.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

// ── Per-statement Retry State ──────────────────────────────────────────────

/// Tracks retry state while one statement is being resubmitted.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Number of consecutive transient failures.
    pub attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transient failure and return the delay before the next
    /// attempt, or `None` when the retry budget is exhausted.
    pub fn record_failure(&mut self, policy: &RetryPolicy) -> Option<u64> {
        self.attempts += 1;
        if policy.should_retry(self.attempts) {
            Some(policy.backoff_ms(self.attempts - 1))
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
