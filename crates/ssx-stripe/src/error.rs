//! Error type for the provider boundary.
//!
//! Raw reqwest / serde errors never cross this boundary; callers match on
//! the category to decide between retry, skip, and abort.

use std::fmt;

/// Errors a provider call may return.
#[derive(Debug)]
pub enum StripeError {
    /// Network or transport failure (connect, TLS, timeout).
    Transport(String),
    /// The upstream API returned an application-level error.
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    /// A response payload could not be decoded.
    Decode(String),
    /// A required configuration value (e.g. API key) is missing or invalid.
    Config(String),
}

impl StripeError {
    /// True when the request may succeed on retry (429 or 5xx or transport).
    pub fn is_retryable(&self) -> bool {
        match self {
            StripeError::Transport(_) => true,
            StripeError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// True when the API reported the target resource as missing.
    ///
    /// Used by the webhook manager to detect orphaned endpoints: the local
    /// row exists but the remote endpoint was deleted out-of-band.
    pub fn is_resource_missing(&self) -> bool {
        match self {
            StripeError::Api { status, code, .. } => {
                *status == 404 || code.as_deref() == Some("resource_missing")
            }
            _ => false,
        }
    }
}

impl fmt::Display for StripeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StripeError::Transport(msg) => write!(f, "transport error: {msg}"),
            StripeError::Api {
                status,
                code: Some(c),
                message,
            } => write!(f, "provider api error status={status} code={c}: {message}"),
            StripeError::Api {
                status,
                code: None,
                message,
            } => write!(f, "provider api error status={status}: {message}"),
            StripeError::Decode(msg) => write!(f, "decode error: {msg}"),
            StripeError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for StripeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StripeError::Transport("connection refused".into()).is_retryable());
        assert!(StripeError::Api {
            status: 429,
            code: None,
            message: "rate limited".into()
        }
        .is_retryable());
        assert!(StripeError::Api {
            status: 503,
            code: None,
            message: "overloaded".into()
        }
        .is_retryable());
        assert!(!StripeError::Api {
            status: 400,
            code: None,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!StripeError::Decode("truncated".into()).is_retryable());
    }

    #[test]
    fn resource_missing_by_code_or_status() {
        assert!(StripeError::Api {
            status: 404,
            code: None,
            message: "no such webhook_endpoint".into()
        }
        .is_resource_missing());
        assert!(StripeError::Api {
            status: 400,
            code: Some("resource_missing".into()),
            message: "no such webhook_endpoint".into()
        }
        .is_resource_missing());
        assert!(!StripeError::Transport("reset".into()).is_resource_missing());
    }

    #[test]
    fn display_api_with_code() {
        let err = StripeError::Api {
            status: 400,
            code: Some("resource_missing".into()),
            message: "no such customer".into(),
        };
        assert_eq!(
            err.to_string(),
            "provider api error status=400 code=resource_missing: no such customer"
        );
    }
}
