//! Error types for podwatch
//!
//! Errors carry the run, key or context they relate to so that a failed tick
//! can be diagnosed from its log line alone.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for podwatch operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Dynamic status store failure
    #[error("status store error for {key}: {message}")]
    Store {
        /// Key or prefix being accessed
        key: String,
        /// Description of what failed
        message: String,
    },

    /// Result archive failure
    #[error("archive error for run id {run_id}: {message}")]
    Archive {
        /// Archive document id of the run
        run_id: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Malformed input (bad interrupt reason, bad setting)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Component where the error occurred (e.g., "interrupt-monitor")
        context: String,
    },
}

impl Error {
    /// Create a status store error for a key or prefix
    pub fn store(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an archive error for an archive run id
    pub fn archive(run_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Archive {
            run_id: run_id.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error tagged with the component it came from
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the next tick may succeed where this one failed.
    ///
    /// Infrastructure failures are transient. Malformed input, logic errors
    /// and API rejections (4xx other than timeouts and throttling) fail the
    /// same way until something outside this process changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !is_client_rejection(source),
            Error::Store { .. } | Error::Archive { .. } => true,
            Error::Serialization { .. } | Error::Validation { .. } | Error::Internal { .. } => {
                false
            }
        }
    }
}

fn is_client_rejection(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if (400..500).contains(&e.code) && !matches!(e.code, 408 | 429))
}

/// True when the kube error is a 404 from the API server.
///
/// Deleting something that is already gone is the desired end state, so
/// callers treat this as success rather than failure.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "pods \"p1\" not found".to_string(),
            reason: "NotFound".to_string(),
            code,
        })
    }

    #[test]
    fn store_error_names_the_key() {
        let err = Error::store("run.U1.status", "connection reset");
        assert_eq!(
            err.to_string(),
            "status store error for run.U1.status: connection reset"
        );
    }

    #[test]
    fn archive_error_names_the_run_id() {
        let err = Error::archive("cdb-1234", "document missing");
        assert!(err.to_string().contains("cdb-1234"));
        assert!(err.to_string().contains("document missing"));
    }

    #[test]
    fn internal_error_defaults_to_unknown_context() {
        match Error::internal("oops") {
            Error::Internal { context, message } => {
                assert_eq!(context, UNKNOWN_CONTEXT);
                assert_eq!(message, "oops");
            }
            other => panic!("expected Internal, got {other:?}"),
        }

        let err = Error::internal_with_context("heartbeat-monitor", "clock went backwards");
        assert!(err.to_string().contains("[heartbeat-monitor]"));
    }

    #[test]
    fn infrastructure_errors_are_retryable() {
        assert!(Error::store("run.", "timeout").is_retryable());
        assert!(Error::archive("id", "timeout").is_retryable());
        assert!(Error::from(api_error(500)).is_retryable());
        assert!(Error::from(api_error(429)).is_retryable());
    }

    #[test]
    fn api_rejections_are_not_retryable() {
        assert!(!Error::from(api_error(403)).is_retryable());
        assert!(!Error::from(api_error(422)).is_retryable());
    }

    #[test]
    fn input_and_logic_errors_are_not_retryable() {
        assert!(!Error::validation("bad reason 'paused'").is_retryable());
        assert!(!Error::serialization("bad base64").is_retryable());
        assert!(!Error::internal("queue closed").is_retryable());
    }

    #[test]
    fn not_found_is_recognised_only_for_404() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(!is_not_found(&api_error(500)));
    }
}
