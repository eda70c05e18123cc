//! Classification table for "expected disconnect" command outcomes.
//!
//! Restarting the UI service while the framework preload is active reports a
//! failure or drops the SSH connection; that is the normal activation
//! signature, not an error. The table below is the single place these
//! signatures live. The wording is firmware-dependent and may need new
//! entries after firmware updates.

use lazy_regex::{Lazy, Regex, lazy_regex};

use crate::session::CommandOutput;

static JOB_FAILED: Lazy<Regex> = lazy_regex!(r"(?i)job for xochitl\.service (?:failed|canceled)");
static CONNECTION_LOST: Lazy<Regex> =
    lazy_regex!(r"(?i)connection (?:lost|closed|reset)|channel closed|broken pipe");
static TIMED_OUT: Lazy<Regex> = lazy_regex!(r"(?i)timed?[ -]?out");

/// `(exit code to match, text pattern)`; `None` matches any non-zero exit.
static EXPECTED_DISCONNECT: &[(Option<i32>, &Lazy<Regex>)] = &[
    (Some(-1), &CONNECTION_LOST),
    (Some(-1), &TIMED_OUT),
    (None, &JOB_FAILED),
];

/// Returns true when a failed command output matches a known expected
/// disconnect signature. Successful outputs never match.
pub fn is_expected_disconnect(output: &CommandOutput) -> bool {
    if output.success() {
        return false;
    }
    EXPECTED_DISCONNECT.iter().any(|(exit_code, pattern)| {
        let code_matches = match exit_code {
            Some(code) => output.exit_code == *code,
            None => output.exit_code != 0,
        };
        code_matches
            && (pattern.is_match(&output.stderr) || pattern.is_match(&output.stdout))
    })
}
