//! The tagged result every node and module produces.
//!
//! `Outcome<T>` is the currency the execution engine moves: every step,
//! stage-fanout module, and join returns one. Only `Ok` and `Fallback`
//! carry a value; every other kind carries a `code` only.

use std::fmt;

/// Which branch of the tagged union an [`Outcome`] is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Ok,
    Error,
    Timeout,
    Skipped,
    Fallback,
    Canceled,
    Unspecified,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutcomeKind::Ok => "Ok",
            OutcomeKind::Error => "Error",
            OutcomeKind::Timeout => "Timeout",
            OutcomeKind::Skipped => "Skipped",
            OutcomeKind::Fallback => "Fallback",
            OutcomeKind::Canceled => "Canceled",
            OutcomeKind::Unspecified => "Unspecified",
        };
        f.write_str(s)
    }
}

/// Error raised by [`Outcome::value`] / [`Outcome::into_value`] when the
/// outcome's kind carries no value. This is a programming-error signal, not
/// a request-time outcome in its own right — callers that reach it have
/// misused the API.
#[derive(Debug, thiserror::Error)]
#[error("outcome of kind {kind} (code {code:?}) carries no value")]
pub struct NoValueError {
    pub kind: OutcomeKind,
    pub code: String,
}

/// Tagged result of a node or module invocation.
///
/// Construct via the convenience constructors ([`Outcome::ok`],
/// [`Outcome::error`], ...) rather than matching on the kind directly; they
/// enforce the non-empty-code invariant (`Ok` always gets `"OK"`).
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Ok(T),
    Error { code: String },
    Timeout { code: String },
    Skipped { code: String },
    Fallback(T),
    Canceled { code: String },
    Unspecified,
}

impl<T> Outcome<T> {
    pub fn ok(value: T) -> Self {
        Outcome::Ok(value)
    }

    pub fn error(code: impl Into<String>) -> Self {
        Outcome::Error { code: code.into() }
    }

    pub fn timeout(code: impl Into<String>) -> Self {
        Outcome::Timeout { code: code.into() }
    }

    pub fn skipped(code: impl Into<String>) -> Self {
        Outcome::Skipped { code: code.into() }
    }

    pub fn fallback(value: T) -> Self {
        Outcome::Fallback(value)
    }

    pub fn canceled(code: impl Into<String>) -> Self {
        Outcome::Canceled { code: code.into() }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Ok(_) => OutcomeKind::Ok,
            Outcome::Error { .. } => OutcomeKind::Error,
            Outcome::Timeout { .. } => OutcomeKind::Timeout,
            Outcome::Skipped { .. } => OutcomeKind::Skipped,
            Outcome::Fallback(_) => OutcomeKind::Fallback,
            Outcome::Canceled { .. } => OutcomeKind::Canceled,
            Outcome::Unspecified => OutcomeKind::Unspecified,
        }
    }

    /// The outcome's code. `Ok` is always `"OK"`; `Unspecified` is always `""`.
    pub fn code(&self) -> &str {
        match self {
            Outcome::Ok(_) => "OK",
            Outcome::Error { code }
            | Outcome::Timeout { code }
            | Outcome::Skipped { code }
            | Outcome::Canceled { code } => code,
            Outcome::Fallback(_) => "OK",
            Outcome::Unspecified => "",
        }
    }

    pub fn is_value_carrying(&self) -> bool {
        matches!(self, Outcome::Ok(_) | Outcome::Fallback(_))
    }

    /// Borrow the carried value.
    ///
    /// # Errors
    /// Returns [`NoValueError`] if this outcome's kind carries no value.
    pub fn value(&self) -> Result<&T, NoValueError> {
        match self {
            Outcome::Ok(v) | Outcome::Fallback(v) => Ok(v),
            other => Err(NoValueError {
                kind: other.kind(),
                code: other.code().to_string(),
            }),
        }
    }

    /// Consume the outcome, returning the carried value.
    ///
    /// # Errors
    /// Returns [`NoValueError`] if this outcome's kind carries no value.
    pub fn into_value(self) -> Result<T, NoValueError> {
        match self {
            Outcome::Ok(v) | Outcome::Fallback(v) => Ok(v),
            other => {
                let kind = other.kind();
                let code = other.code().to_string();
                Err(NoValueError { kind, code })
            }
        }
    }
}

impl<T> Default for Outcome<T> {
    fn default() -> Self {
        Outcome::Unspecified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_code_is_always_ok() {
        let o = Outcome::ok(42);
        assert_eq!(o.code(), "OK");
        assert_eq!(o.kind(), OutcomeKind::Ok);
        assert_eq!(*o.value().unwrap(), 42);
    }

    #[test]
    fn unspecified_is_the_zero_value() {
        let o: Outcome<String> = Outcome::default();
        assert_eq!(o.kind(), OutcomeKind::Unspecified);
        assert_eq!(o.code(), "");
        assert!(!o.is_value_carrying());
    }

    #[test]
    fn reading_value_on_non_value_kind_fails() {
        let o: Outcome<i32> = Outcome::error("BOOM");
        let err = o.value().unwrap_err();
        assert_eq!(err.kind, OutcomeKind::Error);
        assert_eq!(err.code, "BOOM");
    }

    #[test]
    fn fallback_carries_value_with_ok_code() {
        let o = Outcome::fallback("cached".to_string());
        assert_eq!(o.code(), "OK");
        assert!(o.is_value_carrying());
    }
}
