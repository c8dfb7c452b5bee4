//! Error types for change application.
//!
//! [`CdcError`] carries a classification ([`ErrorKind`]), a static description, optional dynamic
//! detail, an optional source, and the location where it was raised. Failures of several table
//! branches are aggregated into a single [`CdcError`] so callers see every failure at once.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Result type used across the engine.
pub type CdcResult<T> = Result<T, CdcError>;

/// Classification of a [`CdcError`].
///
/// The kind drives retry decisions, see [`crate::workers::policy`].
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Transport
    TransportConnectionFailed,
    TransportReadFailed,
    TransportAckFailed,

    // Warehouse
    WarehouseConnectionFailed,
    WarehouseQueryFailed,
    WarehouseTransactionConflict,
    WarehouseTableNameInvalid,
    MergeCursorConflict,

    // Data
    InvalidData,
    ConversionError,
    UnroutableMessage,

    // Configuration
    ConfigError,
    ValidationError,

    // IO & Serialization
    IoError,
    SerializationError,
    DeserializationError,

    // Security
    AuthenticationError,

    // State & Workflow
    InvalidState,
    RetriesExhausted,
    DemuxWorkerPanic,
    TableWorkerPanic,

    Unknown,

    // Fault injection kinds which map to a specific retry directive.
    #[cfg(feature = "failpoints")]
    WithNoRetry,
    #[cfg(feature = "failpoints")]
    WithManualRetry,
    #[cfg(feature = "failpoints")]
    WithTimedRetry,
}

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    /// Several failures, usually one per failed worker.
    Many {
        errors: Vec<CdcError>,
        location: &'static Location<'static>,
    },
}

/// Error raised by the change application engine.
#[derive(Debug, Clone)]
pub struct CdcError {
    repr: ErrorRepr,
}

impl CdcError {
    /// Returns the kind of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::Single(payload) => payload.kind,
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(CdcError::kind)
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every kind contained in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match &self.repr {
            ErrorRepr::Single(payload) => vec![payload.kind],
            ErrorRepr::Many { errors, .. } => errors.iter().flat_map(CdcError::kinds).collect(),
        }
    }

    /// Returns the aggregated errors, or `None` for a single error.
    pub fn errors(&self) -> Option<&[CdcError]> {
        match &self.repr {
            ErrorRepr::Single(_) => None,
            ErrorRepr::Many { errors, .. } => Some(errors),
        }
    }

    pub fn description(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::Single(payload) => Some(&payload.description),
            ErrorRepr::Many { .. } => None,
        }
    }

    /// Returns the dynamic detail of this error, or the first available one in an aggregate.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload.detail.as_deref(),
            ErrorRepr::Many { errors, .. } => errors.iter().find_map(CdcError::detail),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match &self.repr {
            ErrorRepr::Single(payload) => Some(&payload.backtrace),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the originating error. Has no effect on aggregates.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(payload) = &mut self.repr {
            payload.source = Some(Arc::new(source));
        }

        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        CdcError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }

    /// Wraps a foreign error, using its rendering as detail.
    #[track_caller]
    fn from_source<E>(kind: ErrorKind, description: &'static str, err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        let detail = err.to_string();
        CdcError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl PartialEq for CdcError {
    /// Errors compare by kind, recursively for aggregates.
    fn eq(&self, other: &CdcError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for CdcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                let location = payload.location;
                write!(
                    f,
                    "[{:?}] {} @ {}:{}:{}",
                    payload.kind,
                    payload.description,
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                if let Some(detail) = payload.detail.as_deref() {
                    write_block(f, "Detail", detail)?;
                }

                let backtrace = payload.backtrace.to_string();
                if !backtrace.trim().is_empty() {
                    write_block(f, "Backtrace", &backtrace)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                write!(
                    f,
                    "[Many] {} error{} aggregated @ {}:{}:{}",
                    errors.len(),
                    if errors.len() == 1 { "" } else { "s" },
                    location.file(),
                    location.line(),
                    location.column()
                )?;

                for (index, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    let mut lines = rendered.lines();
                    write!(f, "\n  {}. {}", index + 1, lines.next().unwrap_or_default())?;
                    for line in lines {
                        write!(f, "\n     {line}")?;
                    }
                }

                Ok(())
            }
        }
    }
}

/// Writes an indented, titled block of lines under the error header.
fn write_block(f: &mut fmt::Formatter<'_>, title: &str, body: &str) -> fmt::Result {
    if body.trim().is_empty() {
        return write!(f, "\n  {title}: <empty>");
    }

    write!(f, "\n  {title}:")?;
    for line in body.lines() {
        write!(f, "\n    {}", line.trim_end())?;
    }

    Ok(())
}

impl error::Error for CdcError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_ref()
                .map(|source| source.as_ref() as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => errors
                .first()
                .map(|error| error as &(dyn error::Error + 'static)),
        }
    }
}

impl From<(ErrorKind, &'static str)> for CdcError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> CdcError {
        CdcError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for CdcError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> CdcError {
        CdcError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is.
impl<E> From<Vec<E>> for CdcError
where
    E: Into<CdcError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> CdcError {
        let location = Location::caller();
        let mut errors: Vec<CdcError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1
            && let Some(error) = errors.pop()
        {
            return error;
        }

        CdcError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for CdcError {
    #[track_caller]
    fn from(err: std::io::Error) -> CdcError {
        CdcError::from_source(ErrorKind::IoError, "I/O operation failed", err)
    }
}

impl From<serde_json::Error> for CdcError {
    #[track_caller]
    fn from(err: serde_json::Error) -> CdcError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        CdcError::from_source(kind, description, err)
    }
}

impl From<std::str::Utf8Error> for CdcError {
    #[track_caller]
    fn from(err: std::str::Utf8Error) -> CdcError {
        CdcError::from_source(ErrorKind::ConversionError, "UTF-8 conversion failed", err)
    }
}

impl From<std::num::ParseIntError> for CdcError {
    #[track_caller]
    fn from(err: std::num::ParseIntError) -> CdcError {
        CdcError::from_source(ErrorKind::ConversionError, "Integer parsing failed", err)
    }
}

impl From<chrono::ParseError> for CdcError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> CdcError {
        CdcError::from_source(ErrorKind::ConversionError, "Datetime parsing failed", err)
    }
}

impl From<cdc_config::shared::ValidationError> for CdcError {
    #[track_caller]
    fn from(err: cdc_config::shared::ValidationError) -> CdcError {
        CdcError::from_source(ErrorKind::ConfigError, "Invalid configuration", err)
    }
}

/// Classifies [`sqlx::Error`] by SQLSTATE class so transient warehouse failures are retried.
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for CdcError {
    #[track_caller]
    fn from(err: sqlx::Error) -> CdcError {
        let (kind, description) = match &err {
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // Connection exceptions (08xxx), resource exhaustion (53xxx), and operator
                // intervention such as shutdowns (57xxx).
                Some(code)
                    if code.starts_with("08") || code.starts_with("53") || code.starts_with("57") =>
                {
                    (
                        ErrorKind::WarehouseConnectionFailed,
                        "Postgres warehouse unavailable",
                    )
                }
                // Serialization failures and deadlocks (40xxx).
                Some(code) if code.starts_with("40") => (
                    ErrorKind::WarehouseTransactionConflict,
                    "Postgres warehouse transaction conflict",
                ),
                Some(code) if code.starts_with("28") => (
                    ErrorKind::AuthenticationError,
                    "Postgres warehouse authentication failed",
                ),
                Some(code) if code.starts_with("22") => (
                    ErrorKind::ConversionError,
                    "Postgres warehouse rejected a value",
                ),
                _ => (
                    ErrorKind::WarehouseQueryFailed,
                    "Postgres warehouse query failed",
                ),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut => (
                ErrorKind::WarehouseConnectionFailed,
                "Postgres warehouse connection failed",
            ),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => (
                ErrorKind::ConversionError,
                "Postgres warehouse value decoding failed",
            ),
            _ => (
                ErrorKind::WarehouseQueryFailed,
                "Postgres warehouse operation failed",
            ),
        };

        CdcError::from_source(kind, description, err)
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CdcError {
    #[track_caller]
    fn from(err: redis::RedisError) -> CdcError {
        let (kind, description) = if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            (
                ErrorKind::TransportConnectionFailed,
                "Redis connection failed",
            )
        } else if err.kind() == redis::ErrorKind::AuthenticationFailed {
            (ErrorKind::AuthenticationError, "Redis authentication failed")
        } else {
            (ErrorKind::TransportReadFailed, "Redis command failed")
        };

        CdcError::from_source(kind, description, err)
    }
}

#[cfg(feature = "bigquery")]
impl From<gcp_bigquery_client::error::BQError> for CdcError {
    #[track_caller]
    fn from(err: gcp_bigquery_client::error::BQError) -> CdcError {
        use gcp_bigquery_client::error::BQError;

        let (kind, description) = match &err {
            BQError::RequestError(_) | BQError::TonicTransportError(_) => (
                ErrorKind::WarehouseConnectionFailed,
                "BigQuery request failed",
            ),
            BQError::InvalidServiceAccountKey(_)
            | BQError::InvalidServiceAccountAuthenticator(_)
            | BQError::AuthError(_)
            | BQError::YupAuthError(_)
            | BQError::NoToken => (
                ErrorKind::AuthenticationError,
                "BigQuery authentication failed",
            ),
            BQError::ResponseError { .. } => {
                (ErrorKind::WarehouseQueryFailed, "BigQuery query failed")
            }
            BQError::SerializationError(_) => (
                ErrorKind::SerializationError,
                "BigQuery payload serialization failed",
            ),
            _ => (ErrorKind::WarehouseQueryFailed, "BigQuery operation failed"),
        };

        CdcError::from_source(kind, description, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_error_renders_kind_description_and_detail() {
        let err = CdcError::from((
            ErrorKind::InvalidData,
            "Change record is malformed",
            "primary key is empty",
        ));

        let rendered = err.to_string();
        assert!(rendered.starts_with("[InvalidData] Change record is malformed @ "));
        assert!(rendered.contains("Detail:\n    primary key is empty"));
        assert_eq!(err.detail(), Some("primary key is empty"));
    }

    #[test]
    fn aggregating_one_error_returns_it_unchanged() {
        let err: CdcError = vec![CdcError::from((ErrorKind::InvalidState, "boom"))].into();

        assert!(err.errors().is_none());
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn aggregated_errors_expose_all_kinds() {
        let err: CdcError = vec![
            CdcError::from((ErrorKind::InvalidData, "first")),
            CdcError::from((ErrorKind::RetriesExhausted, "second")),
        ]
        .into();

        assert_eq!(
            err.kinds(),
            vec![ErrorKind::InvalidData, ErrorKind::RetriesExhausted]
        );
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(err.to_string().starts_with("[Many] 2 errors aggregated"));
    }

    #[test]
    fn json_errors_are_deserialization_errors() {
        let err: CdcError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();

        assert_eq!(err.kind(), ErrorKind::DeserializationError);
        assert!(error::Error::source(&err).is_some());
    }
}
