//! Retry policy for worker operations.
//!
//! Failures are classified as transient or permanent. Transient failures are
//! retried after an exponential backoff with jitter; permanent failures
//! propagate immediately.
//!
//! # Architecture
//!
//! ```text
//! anyhow::Error ──classify──> Classification ──retry?──> backoff ──> Clock::sleep
//!      │                          │
//!      │ io::ErrorKind,           │ reason, action
//!      │ StewardError first       ▼
//!      └── then message regex   FailureAction::{Retry, Fail, ManualIntervention}
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use steward::retry::RetryPolicy;
//!
//! let policy = RetryPolicy::from_settings(&config.retry);
//! let pages = policy.run(ctx.clock(), "draft", || generate_pages(&inputs))?;
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RetrySettings;
use crate::context::Clock;
use crate::error::StewardError;

/// Mixes the attempt number into the jitter seed.
const SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// Largest jitter as a fraction of the delay.
const JITTER_FRACTION: f64 = 0.5;

// ============================================================================
// Classification
// ============================================================================

/// Why an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Connectivity,
    Timeout,
    RateLimit,
    ServerError,
    FileLock,
    Validation,
    TypeError,
    Assertion,
    NotFound,
    Policy,
    Conflict,
    Unknown,
}

impl FailureReason {
    /// Whether a failure of this kind may go away on its own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connectivity
                | Self::Timeout
                | Self::RateLimit
                | Self::ServerError
                | Self::FileLock
                | Self::Unknown
        )
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::FileLock => "file_lock",
            Self::Validation => "validation",
            Self::TypeError => "type_error",
            Self::Assertion => "assertion",
            Self::NotFound => "not_found",
            Self::Policy => "policy",
            Self::Conflict => "conflict",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the caller should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    Retry,
    Fail,
    /// Unrecognized failure: retried within bounds, flagged for a human.
    ManualIntervention,
}

/// Result of classifying one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub is_transient: bool,
    pub reason: FailureReason,
    pub action: FailureAction,
}

impl Classification {
    /// Classification implied by a reason.
    #[must_use]
    pub fn from_reason(reason: FailureReason) -> Self {
        let action = match reason {
            FailureReason::Unknown => FailureAction::ManualIntervention,
            r if r.is_transient() => FailureAction::Retry,
            _ => FailureAction::Fail,
        };
        Self {
            is_transient: reason.is_transient(),
            reason,
            action,
        }
    }
}

/// Classifies failures by error type, then by message.
#[derive(Debug, Clone)]
pub struct RetryClassifier {
    /// Compiled patterns, transient before permanent.
    patterns: Vec<(Regex, FailureReason)>,
}

impl Default for RetryClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryClassifier {
    /// Create a classifier with the default patterns.
    #[must_use]
    pub fn new() -> Self {
        // First match wins. Transient patterns come first so that e.g.
        // "upstream timed out: resource not found" is retried.
        let patterns = vec![
            // Rate limiting (before server errors: 429 is not a 5xx)
            (r"(?i)rate.?limit", FailureReason::RateLimit),
            (r"(?i)too many requests", FailureReason::RateLimit),
            (r"\b429\b", FailureReason::RateLimit),
            // Timeouts
            (r"(?i)timed?.?out", FailureReason::Timeout),
            (r"(?i)deadline exceeded", FailureReason::Timeout),
            // Connectivity
            (
                r"(?i)connection (refused|reset|aborted|closed)",
                FailureReason::Connectivity,
            ),
            (r"(?i)network (is )?unreachable", FailureReason::Connectivity),
            (r"(?i)broken pipe", FailureReason::Connectivity),
            (
                r"(?i)(dns|name resolution|failed to lookup address)",
                FailureReason::Connectivity,
            ),
            // Server errors
            (
                r"(?i)(service unavailable|bad gateway|internal server error|gateway timeout)",
                FailureReason::ServerError,
            ),
            (r"(?i)(status|http)\D{0,8}5\d\d\b", FailureReason::ServerError),
            // File locks
            (
                r"(?i)(file|resource|database) (is )?(locked|busy)",
                FailureReason::FileLock,
            ),
            (r"(?i)resource temporarily unavailable", FailureReason::FileLock),
            (r"(?i)used by another process", FailureReason::FileLock),
            (r"\b(EAGAIN|EBUSY|EWOULDBLOCK)\b", FailureReason::FileLock),
            // Permanent
            (r"(?i)type ?error", FailureReason::TypeError),
            (r"(?i)mismatched types", FailureReason::TypeError),
            (r"(?i)assertion", FailureReason::Assertion),
            (r"(?i)panicked at", FailureReason::Assertion),
            (r"(?i)validation (error|failed)", FailureReason::Validation),
            (r"(?i)\binvalid\b", FailureReason::Validation),
            (r"(?i)schema", FailureReason::Validation),
            (r"(?i)not found", FailureReason::NotFound),
            (r"(?i)no such file", FailureReason::NotFound),
            (r"(?i)does not exist", FailureReason::NotFound),
            (r"\b404\b", FailureReason::NotFound),
        ];

        let compiled = patterns
            .into_iter()
            .filter_map(|(pattern, reason)| Regex::new(pattern).ok().map(|re| (re, reason)))
            .collect();

        Self { patterns: compiled }
    }

    /// Classify an error, walking its cause chain.
    pub fn classify(&self, err: &anyhow::Error) -> Classification {
        for cause in err.chain() {
            if let Some(reason) = structural_reason(cause) {
                return Classification::from_reason(reason);
            }
        }
        self.classify_message(&format!("{err:#}"))
    }

    /// Classify a bare error message.
    #[must_use]
    pub fn classify_message(&self, message: &str) -> Classification {
        let reason = self
            .patterns
            .iter()
            .find(|(re, _)| re.is_match(message))
            .map_or(FailureReason::Unknown, |(_, reason)| *reason);
        Classification::from_reason(reason)
    }
}

fn structural_reason(cause: &(dyn std::error::Error + 'static)) -> Option<FailureReason> {
    if let Some(err) = cause.downcast_ref::<StewardError>() {
        return match err {
            StewardError::PolicyViolation { .. } => Some(FailureReason::Policy),
            StewardError::PatchConflict { .. } => Some(FailureReason::Conflict),
            StewardError::MissingArtifact { .. } | StewardError::IssueNotFound { .. } => {
                Some(FailureReason::NotFound)
            }
            StewardError::NoOpFix { .. } => Some(FailureReason::Assertion),
            StewardError::Config { .. }
            | StewardError::InvalidConfig { .. }
            | StewardError::MalformedArtifact { .. }
            | StewardError::Json(_)
            | StewardError::Yaml(_)
            | StewardError::Toml(_) => Some(FailureReason::Validation),
            StewardError::Io(io) => io_reason(io.kind()),
            // Message decides the reason; fall back to the pattern pass.
            StewardError::Transient { .. } | StewardError::Other(_) => None,
        };
    }
    if let Some(io) = cause.downcast_ref::<std::io::Error>() {
        return io_reason(io.kind());
    }
    None
}

fn io_reason(kind: ErrorKind) -> Option<FailureReason> {
    match kind {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => Some(FailureReason::Connectivity),
        ErrorKind::TimedOut => Some(FailureReason::Timeout),
        ErrorKind::WouldBlock => Some(FailureReason::FileLock),
        ErrorKind::NotFound => Some(FailureReason::NotFound),
        ErrorKind::InvalidData | ErrorKind::InvalidInput => Some(FailureReason::Validation),
        _ => None,
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Delay before retry number `attempt` (0-based).
///
/// `min(base * multiplier^attempt, max_delay)` plus a jitter drawn uniformly
/// from `[0, 0.5 * delay)`. With a seed the jitter is a pure function of
/// `(seed, attempt)`.
///
/// ```
/// use steward::retry::backoff;
/// use std::time::Duration;
///
/// let base = Duration::from_secs(1);
/// let max = Duration::from_secs(30);
/// let a = backoff(2, base, 2.0, max, Some(7));
/// assert_eq!(a, backoff(2, base, 2.0, max, Some(7)));
/// assert!(a >= Duration::from_secs(4) && a < Duration::from_secs(6));
/// ```
#[must_use]
pub fn backoff(
    attempt: u32,
    base: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter_seed: Option<u64>,
) -> Duration {
    let delay = capped_delay(attempt, base, multiplier, max_delay);
    let range = delay * JITTER_FRACTION;
    if range.is_nan() || range <= 0.0 {
        return Duration::from_secs_f64(delay);
    }

    let jitter = match jitter_seed {
        Some(seed) => {
            let mixed = seed.wrapping_add(u64::from(attempt).wrapping_mul(SEED_STRIDE));
            StdRng::seed_from_u64(mixed).gen_range(0.0..range)
        }
        None => rand::thread_rng().gen_range(0.0..range),
    };
    Duration::from_secs_f64(delay + jitter)
}

/// The exponential part of [`backoff`], in seconds.
fn capped_delay(attempt: u32, base: Duration, multiplier: f64, max_delay: Duration) -> f64 {
    let base = base.as_secs_f64();
    let max = max_delay.as_secs_f64();
    if base <= 0.0 {
        return 0.0;
    }
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let delay = base * multiplier.powi(exponent);
    if delay.is_finite() {
        delay.min(max)
    } else {
        max
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Bounded retry of a fallible operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_seed: Option<u64>,
    classifier: RetryClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    /// Build a policy from the `[retry]` configuration section.
    #[must_use]
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: settings.base_delay(),
            multiplier: settings.multiplier,
            max_delay: settings.max_delay(),
            jitter_seed: settings.jitter_seed,
            classifier: RetryClassifier::new(),
        }
    }

    /// Set the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Fix the jitter seed.
    #[must_use]
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    #[must_use]
    pub fn classifier(&self) -> &RetryClassifier {
        &self.classifier
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff(
            attempt,
            self.base_delay,
            self.multiplier,
            self.max_delay,
            self.jitter_seed,
        )
    }

    /// Run `op`, retrying transient failures up to `max_retries` times.
    ///
    /// Permanent failures propagate at once; after the last retry the last
    /// error propagates. Backoff sleeps go through `clock`.
    pub fn run<T, F>(&self, clock: &dyn Clock, name: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        let mut attempt = 0u32;
        loop {
            let err = match op() {
                Ok(value) => {
                    if attempt > 0 {
                        info!("{} succeeded after {} retries", name, attempt);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let classification = self.classifier.classify(&err);
            if !classification.is_transient {
                debug!(
                    "{} failed permanently ({}): {:#}",
                    name, classification.reason, err
                );
                return Err(err);
            }
            if attempt >= self.max_retries {
                warn!(
                    "{} failed after {} retries ({}): {:#}",
                    name, attempt, classification.reason, err
                );
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            if classification.action == FailureAction::ManualIntervention {
                warn!(
                    "{} failed with an unrecognized error, may need manual intervention; retry {}/{} in {:?}: {:#}",
                    name,
                    attempt + 1,
                    self.max_retries,
                    delay,
                    err
                );
            } else {
                warn!(
                    "{} failed ({}); retry {}/{} in {:?}",
                    name,
                    classification.reason,
                    attempt + 1,
                    self.max_retries,
                    delay
                );
            }
            clock.sleep(delay);
            attempt += 1;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
