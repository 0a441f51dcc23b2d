use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;


/// Category name shared by every [`FutureError`] code.
pub const CATEGORY: &str = "cps::future";

/// The captured cause of a failure, type-erased so it can cross futures of
/// different payload types and still be recovered by downcasting.
pub type ErrorObject = Arc<dyn StdError + Send + Sync>;

/// Categorical errors reported by futures and generators.
#[derive(Debug, Clone, Error)]
pub enum FutureError {
    /// A terminal read was attempted on a future that has not resolved yet.
    #[error("future is still pending")]
    IsPending,
    /// The future failed; the failure record carries the details.
    #[error("future is failed: {0}")]
    IsFailed(Failure),
    /// The future was cancelled before it produced a value.
    #[error("future is cancelled")]
    IsCancelled,
    /// The generator has run out of items.
    #[error("no more items")]
    NoMoreItems,
}

impl FutureError {
    /// Numeric code for this error, stable across releases.
    pub fn code(&self) -> u32 {
        match self {
            FutureError::IsPending => 1,
            FutureError::IsFailed(_) => 2,
            FutureError::IsCancelled => 3,
            FutureError::NoMoreItems => 4,
        }
    }

    /// Category name for these codes - [`CATEGORY`].
    pub fn category(&self) -> &'static str {
        CATEGORY
    }

    /// Returns the failure record when this error carries one.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            FutureError::IsFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Everything a failed future knows about what went wrong: a human-readable
/// reason, the component that raised it, and (when the failure was raised
/// from a typed error rather than a bare string) the original error object.
///
/// Cloning is cheap; the captured error is shared, not copied, so a failure
/// forwarded across a chain still exposes the original object for
/// downcasting.
#[derive(Debug, Clone)]
pub struct Failure {
    reason: String,
    component: String,
    cause: Option<ErrorObject>,
}

impl Failure {
    pub(crate) fn from_reason(reason: impl Into<String>, component: impl Into<String>) -> Self {
        Failure {
            reason: reason.into(),
            component: component.into(),
            cause: None,
        }
    }

    pub(crate) fn from_error(cause: ErrorObject, component: impl Into<String>) -> Self {
        Failure {
            reason: cause.to_string(),
            component: component.into(),
            cause: Some(cause),
        }
    }

    /// Human-readable description of the failure.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Name of the subsystem that raised the failure.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// The captured error object, if the failure carries one.
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Attempts to view the captured error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause()?.downcast_ref::<E>()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        let cause: &(dyn StdError + 'static) = self.cause.as_deref()?;
        Some(cause)
    }
}
