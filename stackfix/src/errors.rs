// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::output::StderrStyles;
use camino::Utf8PathBuf;
use owo_colors::OwoColorize;
use stackfix_runner::errors::{CompletionLogError, ConfigError, MarkerError, StateError};
use std::error::Error;
use thiserror::Error;
use tracing::error;

pub(crate) type Result<T, E = ExpectedError> = std::result::Result<T, E>;

/// Documented exit codes for `stackfix` failures.
///
/// Unknown or unexpected failures always result in exit code 1.
pub enum StackfixExitCode {}

impl StackfixExitCode {
    /// No errors occurred.
    pub const OK: i32 = 0;

    /// A query key didn't match anything in the state document.
    pub const KEY_NOT_FOUND: i32 = 4;

    /// One or more leaked resources couldn't be cleaned up.
    pub const CLEANUP_FAILED: i32 = 100;

    /// Writing to stdout or stderr failed.
    pub const WRITE_OUTPUT_ERROR: i32 = 110;

    /// Configuration, the state directory or a state document couldn't be read.
    pub const SETUP_ERROR: i32 = 96;
}

// The #[error()] strings are placeholders: errors are printed with display_to_stderr, which
// colorizes them.

/// An expected error, reported to the user without a backtrace.
#[derive(Debug, Error)]
#[doc(hidden)]
pub enum ExpectedError {
    #[error("config load error")]
    ConfigLoad {
        #[from]
        err: ConfigError,
    },
    #[error("state directory read error")]
    StateDirRead { err: MarkerError },
    #[error("completion log read error")]
    CompletionLogRead { err: CompletionLogError },
    #[error("state document load error")]
    StateLoad { path: Utf8PathBuf, err: StateError },
    #[error("query error")]
    Query { key: String, err: StateError },
    #[error("key not found")]
    KeyNotFound { key: String, path: Utf8PathBuf },
    #[error("cleanup failed")]
    CleanupFailed { failed: usize, total: usize },
    #[error("error writing output")]
    WriteOutput {
        #[source]
        err: std::io::Error,
    },
}

impl ExpectedError {
    pub(crate) fn write_output(err: std::io::Error) -> Self {
        Self::WriteOutput { err }
    }

    /// Returns the exit code for the process.
    pub fn process_exit_code(&self) -> i32 {
        match self {
            Self::ConfigLoad { .. }
            | Self::StateDirRead { .. }
            | Self::CompletionLogRead { .. }
            | Self::StateLoad { .. }
            | Self::Query { .. } => StackfixExitCode::SETUP_ERROR,
            Self::KeyNotFound { .. } => StackfixExitCode::KEY_NOT_FOUND,
            Self::CleanupFailed { .. } => StackfixExitCode::CLEANUP_FAILED,
            Self::WriteOutput { .. } => StackfixExitCode::WRITE_OUTPUT_ERROR,
        }
    }

    /// Displays this error to stderr.
    pub fn display_to_stderr(&self, styles: &StderrStyles) {
        let mut next_error = match &self {
            Self::ConfigLoad { err } => {
                error!("failed to load stackfix config");
                Some(err as &dyn Error)
            }
            Self::StateDirRead { err } => {
                error!("failed to read state directory");
                Some(err as &dyn Error)
            }
            Self::CompletionLogRead { err } => {
                error!("failed to read completion log");
                Some(err as &dyn Error)
            }
            Self::StateLoad { path, err } => {
                error!(
                    "failed to load state document at `{}`",
                    path.style(styles.bold)
                );
                Some(err as &dyn Error)
            }
            Self::Query { key, err } => {
                error!("failed to look up `{}`", key.style(styles.bold));
                Some(err as &dyn Error)
            }
            Self::KeyNotFound { key, path } => {
                error!(
                    "`{}` not found in `{}`",
                    key.style(styles.bold),
                    path.style(styles.bold)
                );
                None
            }
            Self::CleanupFailed { failed, total } => {
                error!(
                    "{} of {total} leaked resources couldn't be cleaned up",
                    failed.style(styles.bold)
                );
                None
            }
            Self::WriteOutput { err } => {
                error!("error writing output");
                Some(err as &dyn Error)
            }
        };

        while let Some(err) = next_error {
            error!(target: "stackfix::no_heading", "\nCaused by:\n  {}", err);
            next_error = err.source();
        }
    }
}
