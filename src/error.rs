//! Error types for OCC.
//!
//! All errors in OCC are strongly typed using thiserror.
//! Command failures are values, not panics: the executor returns a
//! [`CommandError`] and the dispatcher decides what to do with it.

use thiserror::Error;

/// Exit code reported when the configured `runas` user does not exist.
pub const UNKNOWN_USER_CODE: i32 = 7;

/// Exit code reported for failures that never produced a real exit status.
pub const NO_EXIT_CODE: i32 = -1;

/// Failures of a single command execution.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Username {user} not found")]
    UnknownUser {
        user: String,
    },

    #[error("Script file {program} not found")]
    NotFound {
        program: String,
    },

    #[error("Cannot execute {program} as user {user}: {message}")]
    PermissionDenied {
        program: String,
        user: String,
        message: String,
    },

    #[error("Command timed out after {timeout_secs}s")]
    Timeout {
        timeout_secs: u64,
        output: String,
    },

    #[error("Subprocess error: {message}")]
    SubprocessError {
        message: String,
    },

    #[error("Command exited with code {code}")]
    NonZeroExit {
        code: i32,
        output: String,
    },
}

impl CommandError {
    /// Numeric code placed in failure reports.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::UnknownUser { .. } => UNKNOWN_USER_CODE,
            Self::NonZeroExit { code, .. } => *code,
            Self::NotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::Timeout { .. }
            | Self::SubprocessError { .. } => NO_EXIT_CODE,
        }
    }

    /// Diagnostic text placed in failure reports.
    ///
    /// For a non-zero exit this is the captured output of the command.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::NonZeroExit { output, .. } => output.clone(),
            Self::Timeout {
                timeout_secs,
                output,
            } if !output.is_empty() => {
                format!("Command timed out after {timeout_secs}s; output so far:\n{output}")
            }
            other => other.to_string(),
        }
    }

    /// Short machine-friendly name of the failure kind, used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::UnknownUser { .. } => "unknown_user",
            Self::NotFound { .. } => "not_found",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Timeout { .. } => "timeout",
            Self::SubprocessError { .. } => "subprocess_error",
            Self::NonZeroExit { .. } => "non_zero_exit",
        }
    }
}

/// Errors while loading or validating `occ.yaml`.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid subscription '{subscription}': {reason}")]
    InvalidSubscription {
        subscription: String,
        reason: String,
    },

    #[error("Duplicate subscription '{subscription}'")]
    DuplicateSubscription {
        subscription: String,
    },
}

/// Errors raised by a mail transport. These never leave the notifier.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Failed to start mail transport {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to hand message to mail transport: {0}")]
    Write(#[source] std::io::Error),

    #[error("Mail transport exited with status {status}")]
    Rejected {
        status: String,
    },
}

/// Errors from an event source.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Connection to {url} failed: {message}")]
    ConnectionFailed {
        url: String,
        message: String,
    },

    #[error("Event stream returned HTTP {status}")]
    HttpStatus {
        status: u16,
    },

    #[error("Failed to read event stream: {0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to decode payload: {message}")]
    Decode {
        message: String,
    },
}

impl SourceError {
    /// Returns true if reconnecting may succeed.
    ///
    /// Network failures, server errors and request throttling are transient.
    /// Any other HTTP status (a rejected credential, a wrong URL) will not fix
    /// itself.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::Read(_) => true,
            Self::HttpStatus { status } => *status >= 500 || *status == 408 || *status == 429,
            Self::Decode { .. } => false,
        }
    }
}

/// Top-level error type for OCC.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum OccError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Event source error: {0}")]
    Source(#[from] SourceError),
}

/// Result type alias for OCC operations.
pub type OccResult<T> = Result<T, OccError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_user_reports_code_seven() {
        let err = CommandError::UnknownUser {
            user: "nobody-here".to_string(),
        };
        assert_eq!(err.code(), 7);
        assert_eq!(err.reason(), "Username nobody-here not found");
    }

    #[test]
    fn non_zero_exit_reason_is_captured_output() {
        let err = CommandError::NonZeroExit {
            code: 3,
            output: "boom\n".to_string(),
        };
        assert_eq!(err.code(), 3);
        assert_eq!(err.reason(), "boom\n");
        assert!(err.to_string().contains("code 3"));
    }

    #[test]
    fn other_failures_report_minus_one() {
        let errs = [
            CommandError::NotFound {
                program: "deploy.sh".to_string(),
            },
            CommandError::PermissionDenied {
                program: "deploy.sh".to_string(),
                user: "www".to_string(),
                message: "EPERM".to_string(),
            },
            CommandError::Timeout {
                timeout_secs: 30,
                output: String::new(),
            },
            CommandError::SubprocessError {
                message: "x".to_string(),
            },
        ];
        for err in errs {
            assert_eq!(err.code(), NO_EXIT_CODE, "{}", err.kind());
        }
    }

    #[test]
    fn timeout_reason_includes_partial_output() {
        let err = CommandError::Timeout {
            timeout_secs: 30,
            output: "step 1\n".to_string(),
        };
        let reason = err.reason();
        assert!(reason.contains("30s"));
        assert!(reason.contains("step 1"));
    }

    #[test]
    fn source_error_classification() {
        let err = SourceError::ConnectionFailed {
            url: "https://pubsub".to_string(),
            message: "refused".to_string(),
        };
        assert!(err.is_retryable());
        assert!(SourceError::HttpStatus { status: 503 }.is_retryable());
        assert!(SourceError::HttpStatus { status: 429 }.is_retryable());
        assert!(!SourceError::HttpStatus { status: 401 }.is_retryable());
        assert!(!SourceError::HttpStatus { status: 404 }.is_retryable());
    }

    #[test]
    fn occ_error_wraps_config_error() {
        let err: OccError = ConfigError::DuplicateSubscription {
            subscription: "a".to_string(),
        }
        .into();
        assert!(matches!(err, OccError::Config(_)));
        assert!(err.to_string().contains("Duplicate subscription 'a'"));
    }
}
