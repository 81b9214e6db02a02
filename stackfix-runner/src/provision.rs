// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provisioning collaborators: the tool that actually creates and destroys a stack.
//!
//! Fixtures only see the [`Provisioner`] and [`ProvisionerFactory`] traits. The production
//! implementation, [`TerraformRunner`], shells out to a terraform-compatible binary.

use crate::{config::StackfixConfig, errors::ProvisionError, state::StackState};
use camino::{Utf8Path, Utf8PathBuf};
use std::{borrow::Cow, env, path::PathBuf};
use tracing::debug;

/// The default provisioning binary searched for on `PATH`.
pub const DEFAULT_BINARY_NAME: &str = "terraform";

/// Provisions and destroys a single stack from a module directory.
pub trait Provisioner {
    /// Prepares the working directory (downloads providers, modules, etc).
    fn init(&self) -> Result<(), ProvisionError>;

    /// Creates the stack and returns its state.
    fn apply(&self) -> Result<StackState, ProvisionError>;

    /// Destroys the stack.
    fn destroy(&self) -> Result<(), ProvisionError>;
}

/// Creates a [`Provisioner`] for a module and working directory.
pub trait ProvisionerFactory {
    /// Returns a provisioner that runs `module_dir` with its data in `work_dir`.
    fn provisioner(&self, module_dir: &Utf8Path, work_dir: &Utf8Path) -> Box<dyn Provisioner>;
}

/// Searches `PATH` for an executable file called `name`.
pub fn find_binary(name: &str) -> Option<Utf8PathBuf> {
    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
        .and_then(|candidate: PathBuf| Utf8PathBuf::from_path_buf(candidate).ok())
}

/// A provisioning subcommand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Subcommand {
    Init,
    Plan,
    Apply,
    Destroy,
}

impl Subcommand {
    fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }
}

/// Runs a terraform-compatible binary against one module.
///
/// Commands run with the module directory as their working directory, and with `TF_DATA_DIR`
/// pointing at the fixture's work directory so concurrent fixtures for the same module don't
/// share provider state.
#[derive(Clone, Debug)]
pub struct TerraformRunner {
    binary: Utf8PathBuf,
    module_dir: Utf8PathBuf,
    work_dir: Utf8PathBuf,
    state_path: Utf8PathBuf,
    plugin_cache_dir: Option<Utf8PathBuf>,
}

impl TerraformRunner {
    /// Creates a runner. The state file defaults to `terraform.tfstate` next to the work directory.
    pub fn new(
        binary: impl Into<Utf8PathBuf>,
        module_dir: impl Into<Utf8PathBuf>,
        work_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        let work_dir = work_dir.into();
        // The state lives outside the data dir: terraform misbehaves when they're the same.
        let state_path = match work_dir.parent() {
            Some(parent) => parent.join("terraform.tfstate"),
            None => work_dir.join("..").join("terraform.tfstate"),
        };
        Self {
            binary: binary.into(),
            module_dir: module_dir.into(),
            work_dir,
            state_path,
            plugin_cache_dir: None,
        }
    }

    /// Sets the shared provider plugin cache directory.
    pub fn with_plugin_cache_dir(mut self, dir: Option<Utf8PathBuf>) -> Self {
        self.plugin_cache_dir = dir;
        self
    }

    /// Overrides the state file location.
    pub fn with_state_path(mut self, state_path: impl Into<Utf8PathBuf>) -> Self {
        self.state_path = state_path.into();
        self
    }

    /// Returns the state file location.
    pub fn state_path(&self) -> &Utf8Path {
        &self.state_path
    }

    /// Returns the plan file location.
    pub fn plan_path(&self) -> Utf8PathBuf {
        self.work_dir.join("tfplan")
    }

    pub(crate) fn command_args(&self, subcommand: Subcommand) -> Vec<Cow<'_, str>> {
        let mut args: Vec<Cow<'_, str>> = vec![
            subcommand.as_str().into(),
            "-input=false".into(),
            "-no-color".into(),
        ];
        let state = || Cow::Owned(format!("-state={}", self.state_path));
        match subcommand {
            Subcommand::Init => {}
            Subcommand::Plan => {
                args.push(state());
                args.push(format!("-out={}", self.plan_path()).into());
            }
            Subcommand::Apply => {
                args.push(state());
                args.push("-auto-approve".into());
                args.push(self.plan_path().into_string().into());
            }
            Subcommand::Destroy => {
                args.push(state());
                args.push("-auto-approve".into());
            }
        }
        args
    }

    fn to_expression(&self, subcommand: Subcommand) -> duct::Expression {
        let args = self.command_args(subcommand);
        let mut expression = duct::cmd(self.binary.as_str(), args.iter().map(|arg| &**arg))
            .dir(&self.module_dir)
            .env("TF_IN_AUTOMATION", "yes")
            .env("TF_DATA_DIR", &self.work_dir);
        if let Some(cache_dir) = &self.plugin_cache_dir {
            expression = expression.env("TF_PLUGIN_CACHE_DIR", cache_dir);
        }
        expression
    }

    fn run(&self, subcommand: Subcommand) -> Result<(), ProvisionError> {
        let command = std::iter::once(Cow::Borrowed(self.binary.as_str()))
            .chain(self.command_args(subcommand))
            .collect::<Vec<_>>()
            .join(" ");
        debug!("running `{command}` in {}", self.module_dir);

        let output = self
            .to_expression(subcommand)
            .stderr_to_stdout()
            .stdout_capture()
            .unchecked()
            .run()
            .map_err(|error| ProvisionError::Spawn {
                command: command.clone(),
                error,
            })?;

        if !output.status.success() {
            return Err(ProvisionError::CommandFailed {
                command,
                exit_code: output.status.code(),
                output: String::from_utf8_lossy(&output.stdout).into_owned(),
            });
        }
        Ok(())
    }
}

impl Provisioner for TerraformRunner {
    fn init(&self) -> Result<(), ProvisionError> {
        self.run(Subcommand::Init)
    }

    fn apply(&self) -> Result<StackState, ProvisionError> {
        self.run(Subcommand::Plan)?;
        self.run(Subcommand::Apply)?;
        Ok(StackState::from_path(&self.state_path)?)
    }

    fn destroy(&self) -> Result<(), ProvisionError> {
        self.run(Subcommand::Destroy)
    }
}

/// Creates a [`TerraformRunner`] per fixture.
#[derive(Clone, Debug)]
pub struct TerraformRunnerFactory {
    binary: Utf8PathBuf,
    plugin_cache_dir: Option<Utf8PathBuf>,
}

impl TerraformRunnerFactory {
    /// Creates a new factory.
    pub fn new(binary: impl Into<Utf8PathBuf>, plugin_cache_dir: Option<Utf8PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            plugin_cache_dir,
        }
    }

    /// Creates a factory using the configured binary (or `terraform` from `PATH`) and plugin
    /// cache.
    pub fn from_config(config: &StackfixConfig) -> Self {
        Self::new(
            config.binary().unwrap_or(Utf8Path::new(DEFAULT_BINARY_NAME)),
            config.plugin_cache_dir().map(Utf8Path::to_path_buf),
        )
    }
}

impl ProvisionerFactory for TerraformRunnerFactory {
    fn provisioner(&self, module_dir: &Utf8Path, work_dir: &Utf8Path) -> Box<dyn Provisioner> {
        Box::new(
            TerraformRunner::new(&self.binary, module_dir, work_dir)
                .with_plugin_cache_dir(self.plugin_cache_dir.clone()),
        )
    }
}
