use crate::error::{CdcError, ErrorKind};

/// How a failed operation may be retried.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// Retried automatically with backoff.
    Timed,
    /// Retried only once an operator resolved the cause.
    Manual,
    /// Never retried.
    NoRetry,
}

/// Handling decided for a [`CdcError`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    /// Returns an operator-facing hint, if one exists.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }
}

/// Decides how an error is handled by the table branches.
///
/// Only transient connectivity and contention failures are retried automatically.
pub fn build_error_handling_policy(error: &CdcError) -> ErrorHandlingPolicy {
    match error.kind() {
        ErrorKind::TransportConnectionFailed
        | ErrorKind::TransportReadFailed
        | ErrorKind::TransportAckFailed
        | ErrorKind::WarehouseConnectionFailed
        | ErrorKind::WarehouseTransactionConflict => {
            ErrorHandlingPolicy::new(RetryDirective::Timed, None)
        }

        ErrorKind::MergeCursorConflict => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Make sure a single applier run owns each replica table."),
        ),
        ErrorKind::AuthenticationError => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Verify the transport and warehouse credentials."),
        ),
        ErrorKind::InvalidData | ErrorKind::ConversionError | ErrorKind::DeserializationError => {
            ErrorHandlingPolicy::new(
                RetryDirective::Manual,
                Some("Fix or dead-letter the offending change record at the source."),
            )
        }
        ErrorKind::ConfigError | ErrorKind::ValidationError => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Correct the configuration and restart the applier."),
        ),
        ErrorKind::WarehouseTableNameInvalid => ErrorHandlingPolicy::new(
            RetryDirective::NoRetry,
            Some("Rename the table or stream so it is a valid warehouse identifier."),
        ),

        #[cfg(feature = "failpoints")]
        ErrorKind::WithNoRetry => {
            ErrorHandlingPolicy::new(RetryDirective::NoRetry, Some("Cannot retry this error."))
        }
        #[cfg(feature = "failpoints")]
        ErrorKind::WithManualRetry => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Manually trigger retry after resolving the issue."),
        ),
        #[cfg(feature = "failpoints")]
        ErrorKind::WithTimedRetry => ErrorHandlingPolicy::new(
            RetryDirective::Timed,
            Some("Will automatically retry after the configured delay."),
        ),

        _ => ErrorHandlingPolicy::new(
            RetryDirective::Manual,
            Some("Inspect the error detail and restart the affected table branch once resolved."),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: ErrorKind) -> CdcError {
        CdcError::from((kind, "test error"))
    }

    #[test]
    fn connectivity_failures_are_retried_with_backoff() {
        for kind in [
            ErrorKind::WarehouseConnectionFailed,
            ErrorKind::WarehouseTransactionConflict,
            ErrorKind::TransportConnectionFailed,
        ] {
            let policy = build_error_handling_policy(&err(kind));
            assert_eq!(policy.retry_directive(), RetryDirective::Timed);
            assert_eq!(policy.solution(), None);
        }
    }

    #[test]
    fn invalid_records_need_manual_intervention() {
        let policy = build_error_handling_policy(&err(ErrorKind::InvalidData));
        assert_eq!(policy.retry_directive(), RetryDirective::Manual);
        assert!(policy.solution().is_some());
    }

    #[test]
    fn configuration_errors_are_never_retried() {
        let policy = build_error_handling_policy(&err(ErrorKind::ConfigError));
        assert_eq!(policy.retry_directive(), RetryDirective::NoRetry);
    }
}
