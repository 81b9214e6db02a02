// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::app::CleanupOpts;
use crate::{
    errors::{ExpectedError, Result, StackfixExitCode},
    output::{OutputContext, StdoutStyles},
};
use camino::Utf8Path;
use owo_colors::OwoColorize;
use stackfix_runner::{
    completion::{COMPLETION_LOG_FILE_NAME, CompletionLogReader},
    config::{ConfigLocation, StackfixConfig},
    errors::{DisplayErrorChain, FixtureError},
    identifier::ResourceName,
    lock::LockOptions,
    marker::{DeleteOutcome, MarkerStore},
    provision::{ProvisionerFactory, TerraformRunnerFactory},
    registry::resolve_module_dir,
    state::StackState,
};
use std::io::Write;
use tracing::{debug, error, info};

pub(super) fn exec_status(
    state_dir: &Utf8Path,
    output: OutputContext,
    out: &mut dyn Write,
) -> Result<i32> {
    let styles = output.stdout_styles();
    let markers = MarkerStore::new(state_dir, LockOptions::default());
    let entries = markers
        .list()
        .map_err(|err| ExpectedError::StateDirRead { err })?;

    let log_path = state_dir.join(COMPLETION_LOG_FILE_NAME);
    let completed = if log_path.is_file() {
        CompletionLogReader::open(log_path)
            .and_then(|mut reader| reader.scan())
            .map_err(|err| ExpectedError::CompletionLogRead { err })?
            .len()
    } else {
        0
    };

    write_status(&entries, completed, &styles, out).map_err(ExpectedError::write_output)?;
    Ok(StackfixExitCode::OK)
}

fn write_status(
    entries: &[(ResourceName, String)],
    completed: usize,
    styles: &StdoutStyles,
    out: &mut dyn Write,
) -> std::io::Result<()> {
    writeln!(
        out,
        "{} provisioned {}",
        entries.len().style(styles.count),
        plural(entries.len(), "resource", "resources"),
    )?;
    for (name, work_dir) in entries {
        writeln!(
            out,
            "    {}: {}",
            name.style(styles.name),
            work_dir.style(styles.path)
        )?;
    }
    writeln!(
        out,
        "{} completed {} in log",
        completed.style(styles.count),
        plural(completed, "test", "tests"),
    )?;
    out.flush()
}

pub(super) fn exec_cleanup(
    opts: CleanupOpts,
    output: OutputContext,
    out: &mut dyn Write,
) -> Result<i32> {
    let config = StackfixConfig::load(&opts.root, ConfigLocation::from_cli(opts.config.as_deref()))?;
    debug!(
        "lock timeout: {}, poll interval: {}",
        humantime::format_duration(config.lock().timeout),
        humantime::format_duration(config.lock().poll_interval),
    );

    let config = match opts.module_dir {
        Some(module_dir) => config.with_module_dir(Some(module_dir)),
        None => config,
    };
    let test_dir = opts.test_dir.unwrap_or_else(|| opts.root.join("tests"));

    let markers = MarkerStore::new(opts.state_dir, *config.lock());
    let factory = TerraformRunnerFactory::from_config(&config);

    let cleanup = Cleanup {
        markers: &markers,
        factory: &factory,
        config: &config,
        test_dir: &test_dir,
        dry_run: opts.dry_run,
        styles: output.stdout_styles(),
    };
    cleanup.run(out)
}

struct Cleanup<'a> {
    markers: &'a MarkerStore,
    factory: &'a dyn ProvisionerFactory,
    config: &'a StackfixConfig,
    test_dir: &'a Utf8Path,
    dry_run: bool,
    styles: StdoutStyles,
}

impl Cleanup<'_> {
    fn run(&self, out: &mut dyn Write) -> Result<i32> {
        let entries = self
            .markers
            .list()
            .map_err(|err| ExpectedError::StateDirRead { err })?;
        if entries.is_empty() {
            info!(
                "no leaked resources in {}",
                self.markers.state_dir().style(self.styles.path)
            );
            return Ok(StackfixExitCode::OK);
        }

        let total = entries.len();
        let mut failed = 0;
        for (name, work_dir) in entries {
            let module_dir = match resolve_module_dir(&name, self.test_dir, self.config) {
                Ok(module_dir) => module_dir,
                Err(err) => {
                    error!("failed to clean up {name}: {}", DisplayErrorChain::new(&err));
                    failed += 1;
                    continue;
                }
            };

            if self.dry_run {
                writeln!(
                    out,
                    "would destroy {} (module: {}, work dir: {})",
                    name.style(self.styles.name),
                    module_dir.style(self.styles.path),
                    work_dir.style(self.styles.path),
                )
                .map_err(ExpectedError::write_output)?;
                continue;
            }

            match self.destroy(&name, &module_dir) {
                Ok(DeleteOutcome::Deleted(())) => {
                    writeln!(out, "destroyed {}", name.style(self.styles.name))
                        .map_err(ExpectedError::write_output)?;
                }
                Ok(DeleteOutcome::Absent) => {
                    info!("{name} was removed by another process");
                }
                Err(err) => {
                    error!("failed to clean up {name}: {}", DisplayErrorChain::new(&err));
                    failed += 1;
                }
            }
        }

        out.flush().map_err(ExpectedError::write_output)?;
        if failed > 0 {
            Err(ExpectedError::CleanupFailed { failed, total })
        } else {
            Ok(StackfixExitCode::OK)
        }
    }

    fn destroy(
        &self,
        name: &ResourceName,
        module_dir: &Utf8Path,
    ) -> Result<DeleteOutcome<()>, FixtureError> {
        self.markers.delete_if_present(name, |work_dir| {
            info!("destroying {name} (work dir: {work_dir})");
            self.factory
                .provisioner(module_dir, Utf8Path::new(work_dir))
                .destroy()
                .map_err(|error| FixtureError::TeardownFailed {
                    name: name.clone(),
                    error,
                })
        })
    }
}

pub(super) fn exec_query(state_file: &Utf8Path, key: &str, out: &mut dyn Write) -> Result<i32> {
    let state = StackState::from_path(state_file).map_err(|err| ExpectedError::StateLoad {
        path: state_file.to_owned(),
        err,
    })?;
    let value = state
        .get(key)
        .map_err(|err| ExpectedError::Query {
            key: key.to_owned(),
            err,
        })?
        .ok_or_else(|| ExpectedError::KeyNotFound {
            key: key.to_owned(),
            path: state_file.to_owned(),
        })?;

    serde_json::to_writer_pretty(&mut *out, &value)
        .map_err(|err| ExpectedError::write_output(err.into()))?;
    writeln!(out).map_err(ExpectedError::write_output)?;
    Ok(StackfixExitCode::OK)
}

fn plural(count: usize, singular: &'static str, plural: &'static str) -> &'static str {
    if count == 1 { singular } else { plural }
}
