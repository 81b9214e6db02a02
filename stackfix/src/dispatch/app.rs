// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Top-level application and command routing.

use super::commands::{exec_cleanup, exec_query, exec_status};
use crate::{
    errors::Result,
    output::{OutputContext, OutputOpts},
};
use camino::Utf8PathBuf;
use clap::{Args, Subcommand};
use std::io::Write;

/// Operator tooling for stackfix shared test fixtures.
///
/// Inspects the state directory shared by the processes of a test run, and cleans up resources
/// that were left provisioned.
#[derive(Debug, clap::Parser)]
#[command(
    version,
    styles = crate::output::clap_styles::style(),
    max_term_width = 100,
)]
pub struct StackfixApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(subcommand)]
    command: Command,
}

impl StackfixApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, writing results to `out`.
    ///
    /// Returns the exit code.
    pub fn exec(self, output: OutputContext, out: &mut dyn Write) -> Result<i32> {
        match self.command {
            Command::Status(opts) => exec_status(&opts.state_dir, output, out),
            Command::Cleanup(opts) => exec_cleanup(opts, output, out),
            Command::Query(opts) => exec_query(&opts.state_file, &opts.key, out),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show provisioned resources and completed tests in a state directory
    Status(StatusOpts),

    /// Destroy resources left provisioned in a state directory
    ///
    /// Resources are left behind by teardown policy `off`, by workers that crashed, and by
    /// failed teardowns. Each module is located the same way fixture setup does, then the
    /// resource is destroyed under its lock, and its marker removed.
    Cleanup(CleanupOpts),

    /// Look up a key in a recorded state document
    ///
    /// KEY is either a resource name, or a dotted path such as `aws_sqs_queue.jobs.arn`.
    Query(QueryOpts),
}

#[derive(Debug, Args)]
struct StatusOpts {
    /// The shared state directory
    #[arg(long, value_name = "DIR")]
    state_dir: Utf8PathBuf,
}

#[derive(Debug, Args)]
pub(super) struct CleanupOpts {
    /// The shared state directory
    #[arg(long, value_name = "DIR")]
    pub(super) state_dir: Utf8PathBuf,

    /// Config file [default: ROOT/.config/stackfix.toml, `none` to skip]
    #[arg(long, value_name = "PATH")]
    pub(super) config: Option<String>,

    /// Project root that relative config paths are resolved against
    #[arg(long, value_name = "DIR", default_value = ".")]
    pub(super) root: Utf8PathBuf,

    /// Directory searched first for each resource's module [default: from config]
    #[arg(long, value_name = "DIR")]
    pub(super) module_dir: Option<Utf8PathBuf>,

    /// Test directory that modules are also searched relative to [default: ROOT/tests]
    #[arg(long, value_name = "DIR")]
    pub(super) test_dir: Option<Utf8PathBuf>,

    /// List what would be destroyed without destroying anything
    #[arg(long)]
    pub(super) dry_run: bool,
}

#[derive(Debug, Args)]
struct QueryOpts {
    /// Path to a state document
    #[arg(value_name = "STATE_FILE")]
    state_file: Utf8PathBuf,

    /// The key to look up
    #[arg(value_name = "KEY")]
    key: String,
}
