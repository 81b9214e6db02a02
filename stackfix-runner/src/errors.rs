// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by stackfix.

use crate::{
    identifier::{ResourceName, TestId},
    registry::Scope,
};
use camino::Utf8PathBuf;
use itertools::Itertools;
use std::{error::Error, fmt, io, time::Duration};
use thiserror::Error;

/// Displays an error along with its full chain of sources, on a single line.
///
/// Used for log lines, where the multi-line `Caused by:` format doesn't fit.
pub struct DisplayErrorChain<E>(E);

impl<E: Error> DisplayErrorChain<E> {
    /// Creates a new `DisplayErrorChain`.
    pub fn new(error: E) -> Self {
        Self(error)
    }
}

impl<E: Error> fmt::Display for DisplayErrorChain<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

/// An error that occurred while acquiring a lock file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LockError {
    /// The lock wasn't acquired within the configured timeout.
    #[error("timed out after {}s waiting for lock `{path}`", .timeout.as_secs_f64())]
    Timeout {
        /// The lock file path.
        path: Utf8PathBuf,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The lock file couldn't be opened.
    #[error("error opening lock file `{path}`")]
    Open {
        /// The lock file path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Locking failed for a reason other than contention.
    #[error("error locking `{path}`")]
    Lock {
        /// The lock file path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while operating on a marker file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MarkerError {
    /// Acquiring the marker's lock failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The state directory couldn't be created.
    #[error("error creating state directory `{path}`")]
    StateDirCreate {
        /// The state directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The state directory couldn't be listed.
    #[error("error listing state directory `{path}`")]
    StateDirRead {
        /// The state directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The marker couldn't be read.
    #[error("error reading marker `{path}`")]
    Read {
        /// The marker path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The marker couldn't be written and published.
    #[error("error writing marker `{path}`")]
    Write {
        /// The marker path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The marker couldn't be removed.
    #[error("error removing marker `{path}`")]
    Remove {
        /// The marker path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while reading or writing the completion log.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompletionLogError {
    /// The log couldn't be opened.
    #[error("error opening completion log `{path}`")]
    Open {
        /// The log path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A test id couldn't be appended.
    #[error("error appending `{test_id}` to completion log `{path}`")]
    Append {
        /// The log path.
        path: Utf8PathBuf,
        /// The test id being appended.
        test_id: TestId,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A test id contains a line break, so it can't be stored as a single log line.
    #[error("test id `{test_id}` contains a line break")]
    InvalidTestId {
        /// The offending id.
        test_id: TestId,
    },

    /// The log couldn't be scanned.
    #[error("error reading completion log `{path}`")]
    Read {
        /// The log path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },
}

/// An error that occurred while loading, querying or saving a state document.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    /// The state file doesn't exist.
    #[error("state file `{path}` could not be located")]
    NotFound {
        /// The path that was looked up.
        path: Utf8PathBuf,
    },

    /// The state file couldn't be read.
    #[error("error reading state file `{path}`")]
    Read {
        /// The state file path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The state document isn't valid JSON, or doesn't have the expected shape.
    #[error("error parsing state document")]
    Parse(#[source] serde_json::Error),

    /// The state document couldn't be serialized.
    #[error("error serializing state document")]
    Serialize(#[source] serde_json::Error),

    /// The state file couldn't be written.
    #[error("error writing state file `{path}`")]
    Write {
        /// The state file path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// A lookup by bare resource name matched more than one resource.
    #[error(
        "ambiguous resource name `{name}` (matches: {})",
        .matches.iter().join(", ")
    )]
    AmbiguousLookup {
        /// The name that was looked up.
        name: String,
        /// Every `type.name` that matched.
        matches: Vec<String>,
    },
}

/// An error returned by the provisioning tool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// The command couldn't be spawned.
    #[error("failed to execute `{command}`")]
    Spawn {
        /// The command line.
        command: String,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The command exited unsuccessfully.
    #[error("`{command}` failed with {}\n{output}", display_exit_code(*.exit_code))]
    CommandFailed {
        /// The command line.
        command: String,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Combined stdout and stderr of the command.
        output: String,
    },

    /// The state produced by `apply` couldn't be loaded.
    #[error("error loading provisioned state")]
    State(#[from] StateError),
}

fn display_exit_code(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_owned(),
    }
}

/// An error produced by a fixture while setting up or tearing down its resource.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FixtureError {
    /// The provisioning module couldn't be located in any candidate directory.
    #[error(
        "module `{name}` not found (searched: {})",
        .candidates.iter().join(", ")
    )]
    ModuleNotFound {
        /// The resource name.
        name: ResourceName,
        /// Every directory that was searched, in order.
        candidates: Vec<Utf8PathBuf>,
    },

    /// Replay mode is on, but no recorded state exists for the module.
    #[error("replay state for `{name}` doesn't exist at `{path}`")]
    ReplayStateMissing {
        /// The resource name.
        name: ResourceName,
        /// The expected location of the recorded state.
        path: Utf8PathBuf,
    },

    /// A working directory for provisioning couldn't be created.
    #[error("error creating work directory for `{name}` under `{path}`")]
    WorkDirCreate {
        /// The resource name.
        name: ResourceName,
        /// The directory that couldn't be created.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Every numbered work directory slot under the work root is already taken.
    #[error("no free work directory for `{name}` under `{root}` after {attempts} attempts")]
    WorkDirsExhausted {
        /// The resource name.
        name: ResourceName,
        /// The directory the numbered work directories live in.
        root: Utf8PathBuf,
        /// How many numbered directories were tried.
        attempts: u32,
    },

    /// Provisioning the external resource failed.
    #[error("provisioning `{name}` failed")]
    ProvisioningFailed {
        /// The resource name.
        name: ResourceName,
        /// The underlying error.
        #[source]
        error: ProvisionError,
    },

    /// Destroying the external resource failed.
    #[error("tearing down `{name}` failed")]
    TeardownFailed {
        /// The resource name.
        name: ResourceName,
        /// The underlying error.
        #[source]
        error: ProvisionError,
    },

    /// The cached or recorded state for a resource couldn't be loaded or saved.
    #[error("error accessing cached state for `{name}`")]
    State {
        /// The resource name.
        name: ResourceName,
        /// The underlying error.
        #[source]
        error: StateError,
    },

    /// The fixture was already torn down in this process.
    #[error("fixture `{name}` was already torn down in this process")]
    AlreadyDestroyed {
        /// The resource name.
        name: ResourceName,
    },

    /// A marker operation failed.
    #[error(transparent)]
    Marker(#[from] MarkerError),
}

/// An error produced by the lifecycle coordinator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoordinatorError {
    /// The shared state directory couldn't be created or resolved.
    #[error("error preparing state directory `{path}`")]
    StateDir {
        /// The state directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// Workers must be local processes that share a filesystem with the master.
    #[error("worker `{worker}` uses transport `{transport}`: only local subprocess workers are supported")]
    UnsupportedWorker {
        /// The worker name.
        worker: String,
        /// A description of the transport.
        transport: String,
    },

    /// A function-scoped fixture was requested as a shared one.
    #[error("fixture `{name}` is function-scoped and isn't shared between tests")]
    FunctionScoped {
        /// The resource name.
        name: ResourceName,
    },

    /// A shared fixture was requested as a function-scoped one.
    #[error("fixture `{name}` is shared at scope `{scope}` and is set up through the coordinator")]
    SharedScope {
        /// The resource name.
        name: ResourceName,
        /// The scope the fixture was registered with.
        scope: Scope,
    },

    /// A completion log operation failed.
    #[error(transparent)]
    CompletionLog(#[from] CompletionLogError),

    /// A registry lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A fixture operation failed.
    #[error(transparent)]
    Fixture(#[from] FixtureError),
}

/// An error produced while registering or looking up fixtures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The same module was registered twice with different scopes.
    #[error("module `{name}` registered with scope `{requested}`, but already registered with scope `{existing}`")]
    ScopeConflict {
        /// The resource name.
        name: ResourceName,
        /// The scope of the existing registration.
        existing: Scope,
        /// The scope that was requested.
        requested: Scope,
    },

    /// No fixture with this name was registered.
    #[error("unknown fixture `{name}`")]
    UnknownFixture {
        /// The name that was looked up.
        name: String,
    },

    /// The fixture's teardown option is invalid.
    #[error("invalid teardown option for `{name}`")]
    InvalidTeardown {
        /// The resource name.
        name: ResourceName,
        /// The underlying error.
        #[source]
        error: InvalidTeardownPolicy,
    },
}

/// A teardown policy string wasn't recognized.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("`{input}` is not a valid teardown option (valid: on, off, ignore, default)")]
pub struct InvalidTeardownPolicy {
    input: String,
}

impl InvalidTeardownPolicy {
    pub(crate) fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
        }
    }

    /// Returns the rejected input.
    pub fn input(&self) -> &str {
        &self.input
    }
}

/// An error that occurred while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// An explicitly requested config file doesn't exist.
    #[error("config file `{path}` not found")]
    FileNotFound {
        /// The requested path.
        path: Utf8PathBuf,
    },

    /// The config file couldn't be read.
    #[error("error reading config file `{path}`")]
    Read {
        /// The config file path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// The config file couldn't be parsed.
    #[error("error parsing config file `{path}`")]
    Parse {
        /// The config file path.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: toml::de::Error,
    },

    /// The provider plugin cache directory couldn't be created.
    #[error("error creating plugin cache directory `{path}`")]
    PluginCacheDirCreate {
        /// The directory.
        path: Utf8PathBuf,
        /// The underlying error.
        #[source]
        error: io::Error,
    },

    /// No provisioning binary is configured or on `PATH`, and replay mode is off.
    #[error("provisioning binary `{name}` not found on PATH and not configured (set `binary` or enable replay)")]
    BinaryNotFound {
        /// The binary name that was searched for.
        name: String,
    },
}
