use fail::fail_point;

use crate::bail;
use crate::error::{CdcResult, ErrorKind};

/// Fails the changelog append of a batch before anything is written.
pub const APPEND_CHANGES__BEFORE_WRITE: &str = "append_changes.before_write";

/// Fails a merge commit after the replica rows were staged but before the cursor moved.
pub const COMMIT_MERGE__AFTER_APPLY: &str = "commit_merge.after_apply";

/// Fails a merge pass right after its trigger fired.
pub const MERGE_PASS__AFTER_TRIGGER: &str = "merge_pass.after_trigger";

/// Evaluates the fail point `name`.
///
/// The configured action parameter selects the error kind returned: `no_retry`, `manual_retry`
/// or `timed_retry`.
pub fn cdc_fail_point(name: &str) -> CdcResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("manual_retry") => ErrorKind::WithManualRetry,
            Some("timed_retry") => ErrorKind::WithTimedRetry,
            _ => ErrorKind::WithNoRetry,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
