// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test-only facilities

pub mod poll;

pub use dropshot::test_util::LogContext;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingIfExists;
use dropshot::ConfigLoggingLevel;

/// Returns a [`LogContext`] for the test named `test_name`
///
/// Everything is logged at trace level to a per-test file.  Call
/// `cleanup_successful()` at the end of a passing test to remove it; a
/// failing test leaves the file behind for inspection.
pub fn test_setup_log(test_name: &str) -> LogContext {
    let config = ConfigLogging::File {
        level: ConfigLoggingLevel::Trace,
        // LogContext chooses the real path.
        path: "UNUSED".into(),
        if_exists: ConfigLoggingIfExists::Fail,
    };
    LogContext::new(test_name, &config)
}
