use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;

use cdc::error::CdcError;
use thiserror::Error;

/// Returns whether terminal output should include backtraces.
fn should_render_backtrace() -> bool {
    matches!(
        std::env::var("RUST_BACKTRACE").as_deref(),
        Ok("1") | Ok("full")
    )
}

pub type ApplierResult<T> = Result<T, ApplierError>;

/// Backtrace captured when an infrastructure error is created.
pub struct CapturedBacktrace(Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        Self(Backtrace::capture())
    }
}

impl fmt::Debug for CapturedBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors ending the applier process.
#[derive(Debug, Error)]
pub enum ApplierError {
    /// The pipeline failed.
    #[error("{0}")]
    Cdc(CdcError),
    #[error("configuration error: {0}")]
    Config(#[source] Box<dyn Error + Send + Sync>, CapturedBacktrace),
    #[error("i/o error: {0}")]
    Io(#[source] std::io::Error, CapturedBacktrace),
}

impl ApplierError {
    /// Returns a short category label for this error.
    pub fn category(&self) -> &'static str {
        match self {
            ApplierError::Cdc(_) => "pipeline error",
            ApplierError::Config(_, _) => "configuration error",
            ApplierError::Io(_, _) => "i/o error",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            ApplierError::Cdc(err) => err.backtrace(),
            ApplierError::Config(_, captured) | ApplierError::Io(_, captured) => Some(&captured.0),
        }
    }

    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        ApplierError::Config(Box::new(err), CapturedBacktrace::capture())
    }

    /// Returns a report for terminal output, listing every failed table for aggregated errors.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        out.push_str("cdc-applier failed\n");
        out.push_str(&format!("category: {}\n", self.category()));
        out.push_str(&format!("error: {self}\n"));

        match self {
            ApplierError::Cdc(err) if err.errors().is_some() => {
                for (idx, kind) in err.kinds().iter().enumerate() {
                    out.push_str(&format!("failure {}: {kind:?}\n", idx + 1));
                }
            }
            _ => {
                let mut source = match self {
                    ApplierError::Cdc(err) => err.source(),
                    _ => Error::source(self),
                };
                let mut idx = 1usize;
                while let Some(err) = source {
                    out.push_str(&format!("cause {idx}: {err}\n"));
                    source = err.source();
                    idx += 1;
                }
            }
        }

        if should_render_backtrace()
            && let Some(backtrace) = self.backtrace()
        {
            out.push_str("backtrace:\n");
            out.push_str(&backtrace.to_string());
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }

        out
    }
}

impl From<CdcError> for ApplierError {
    fn from(err: CdcError) -> Self {
        ApplierError::Cdc(err)
    }
}

impl From<std::io::Error> for ApplierError {
    fn from(err: std::io::Error) -> Self {
        ApplierError::Io(err, CapturedBacktrace::capture())
    }
}

#[cfg(test)]
mod tests {
    use cdc::cdc_error;
    use cdc::error::ErrorKind;
    use cdc_config::shared::ValidationError;

    use super::*;

    #[test]
    fn configuration_errors_are_categorized() {
        let err = ApplierError::config(ValidationError::MissingInputSource);

        assert_eq!(err.category(), "configuration error");
        assert!(err.render_report().contains("category: configuration error"));
    }

    #[test]
    fn aggregated_pipeline_errors_list_every_failure() {
        let err: ApplierError = CdcError::from(vec![
            cdc_error!(ErrorKind::InvalidData, "Bad record"),
            cdc_error!(ErrorKind::RetriesExhausted, "Append gave up"),
        ])
        .into();

        let report = err.render_report();
        assert!(report.contains("category: pipeline error"));
        assert!(report.contains("failure 1: InvalidData"));
        assert!(report.contains("failure 2: RetriesExhausted"));
    }
}
