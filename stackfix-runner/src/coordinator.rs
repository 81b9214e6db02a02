// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decides when shared resources are torn down across worker processes.
//!
//! Each process in a run (the master and every worker) builds one [`Coordinator`]. They share
//! nothing but a state directory:
//!
//! * one marker per provisioned resource, managed by [`MarkerStore`]
//! * the completion log, appended to by the master only and rescanned by everyone
//!
//! A worker tears down a shared resource once every test that it collected for that resource has
//! completed, anywhere in the run. The completed set only grows, so a stale view of the log can
//! delay a teardown but never trigger one early.
//!
//! The coordinator only sees the tests its own process collected. If another worker uses a
//! resource through tests this worker never collected, those tests aren't waited for.

use crate::{
    completion::{COMPLETION_LOG_FILE_NAME, CompletedSet, CompletionLogReader, CompletionLogWriter},
    config::StackfixConfig,
    dependency::{CollectedTest, DependencyMap},
    errors::{CoordinatorError, DisplayErrorChain},
    fixture::{FixtureContext, StackFixture, TeardownOutcome},
    identifier::{ResourceName, TestId, WorkerId},
    marker::MarkerStore,
    provision::ProvisionerFactory,
    registry::FixtureRegistry,
    state::{StackState, StateHook},
};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use indexmap::IndexMap;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
};
use tracing::{debug, info, warn};

/// The name of the shared state directory.
pub const STATE_DIR_NAME: &str = "stackfix";

/// How a worker process is connected to the master.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WorkerTransport {
    /// A subprocess on the same machine, sharing the master's filesystem.
    LocalProcess,

    /// Anything else, e.g. a worker on a remote host.
    Remote {
        /// A description of the transport.
        spec: String,
    },
}

impl fmt::Display for WorkerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalProcess => write!(f, "local process"),
            Self::Remote { spec } => write!(f, "{spec}"),
        }
    }
}

/// The phase of a test a report is about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TestPhase {
    /// Fixture setup.
    Setup,
    /// The test body.
    Call,
    /// Fixture teardown.
    Teardown,
}

/// A test result forwarded to the master.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestReport {
    /// The test the report is about.
    pub id: TestId,

    /// The phase the report is about.
    pub phase: TestPhase,
}

impl TestReport {
    /// Creates a new report.
    pub fn new(id: impl AsRef<str>, phase: TestPhase) -> Self {
        Self {
            id: TestId::new(id),
            phase,
        }
    }
}

/// The result of the end-of-session sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Resources torn down by the sweep.
    pub torn_down: Vec<ResourceName>,

    /// Resources left alone because some of their tests haven't completed, with those tests.
    ///
    /// Another worker may still be using them.
    pub remaining: BTreeMap<ResourceName, BTreeSet<TestId>>,

    /// Resources whose teardown failed.
    pub failures: Vec<(ResourceName, CoordinatorError)>,
}

impl SweepReport {
    /// Returns true if nothing was left behind and nothing failed.
    pub fn is_clean(&self) -> bool {
        self.remaining.is_empty() && self.failures.is_empty()
    }
}

/// Everything fixtures borrow from the coordinator.
#[derive(Debug)]
struct FixtureEnv {
    worker: WorkerId,
    config: StackfixConfig,
    markers: MarkerStore,
    work_root: Utf8PathBuf,
    factory: DebugIgnore<Box<dyn ProvisionerFactory>>,
    state_hook: DebugIgnore<Option<Box<dyn StateHook>>>,
}

impl FixtureEnv {
    fn context(&self) -> FixtureContext<'_> {
        FixtureContext {
            worker: &self.worker,
            config: &self.config,
            markers: &self.markers,
            factory: &**self.factory,
            work_root: &self.work_root,
            state_hook: self.state_hook.as_deref(),
        }
    }
}

/// Coordinates shared resource lifecycles for one process.
#[derive(Debug)]
pub struct Coordinator {
    env: FixtureEnv,
    registry: FixtureRegistry,
    writer: Option<CompletionLogWriter>,
    reader: CompletionLogReader,
    completed: CompletedSet,
    dependencies: DependencyMap,
    fixtures: IndexMap<ResourceName, StackFixture>,
    // Teardowns that failed after a test; only retried by the session sweep.
    failed_teardowns: BTreeSet<ResourceName>,
}

impl Coordinator {
    /// Creates the coordinator for `worker`.
    ///
    /// `base_temp` is this process's temporary directory. The master's state directory is
    /// `<base_temp>/stackfix`, which it creates along with the completion log. Each worker's
    /// temporary directory is a child of the master's, so workers use `<base_temp>/../stackfix`.
    /// The master must therefore be created before any worker.
    ///
    /// Work directories for provisioning are created under `base_temp`.
    pub fn new(
        config: StackfixConfig,
        registry: FixtureRegistry,
        factory: Box<dyn ProvisionerFactory>,
        worker: WorkerId,
        base_temp: &Utf8Path,
    ) -> Result<Self, CoordinatorError> {
        let state_dir = if worker.is_master() {
            let state_dir = base_temp.join(STATE_DIR_NAME);
            fs::create_dir_all(&state_dir).map_err(|error| CoordinatorError::StateDir {
                path: state_dir.clone(),
                error,
            })?;
            state_dir
        } else {
            match base_temp.parent() {
                Some(parent) => parent.join(STATE_DIR_NAME),
                None => {
                    return Err(CoordinatorError::StateDir {
                        path: base_temp.to_owned(),
                        error: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "worker temporary directory has no parent",
                        ),
                    });
                }
            }
        };

        let log_path = state_dir.join(COMPLETION_LOG_FILE_NAME);
        let writer = if worker.is_master() {
            Some(CompletionLogWriter::open(log_path.clone())?)
        } else {
            None
        };
        let reader = CompletionLogReader::open(log_path)?;

        info!("{worker}: coordinating shared resources in {state_dir}");
        let markers = MarkerStore::new(state_dir, *config.lock());

        Ok(Self {
            env: FixtureEnv {
                worker,
                config,
                markers,
                work_root: base_temp.to_owned(),
                factory: DebugIgnore(factory),
                state_hook: DebugIgnore(None),
            },
            registry,
            writer,
            reader,
            completed: CompletedSet::new(),
            dependencies: DependencyMap::default(),
            fixtures: IndexMap::new(),
            failed_teardowns: BTreeSet::new(),
        })
    }

    /// Sets a hook that adjusts state right after it's provisioned.
    pub fn with_state_hook(mut self, hook: impl StateHook + 'static) -> Self {
        self.env.state_hook = DebugIgnore(Some(Box::new(hook)));
        self
    }

    /// Returns this process's worker id.
    pub fn worker(&self) -> &WorkerId {
        &self.env.worker
    }

    /// Returns the configuration.
    pub fn config(&self) -> &StackfixConfig {
        &self.env.config
    }

    /// Returns the fixture registry.
    pub fn registry(&self) -> &FixtureRegistry {
        &self.registry
    }

    /// Returns the marker store in the shared state directory.
    pub fn markers(&self) -> &MarkerStore {
        &self.env.markers
    }

    /// Returns the shared state directory.
    pub fn state_dir(&self) -> &Utf8Path {
        self.env.markers.state_dir()
    }

    /// Returns the tracked resources that haven't been torn down yet.
    pub fn dependencies(&self) -> &DependencyMap {
        &self.dependencies
    }

    /// Returns the tests known to have completed as of the last check.
    pub fn completed(&self) -> &CompletedSet {
        &self.completed
    }

    /// Returns a fixture context, for tearing down fixtures from
    /// [`function_fixture`](Self::function_fixture).
    pub fn context(&self) -> FixtureContext<'_> {
        self.env.context()
    }

    /// Accepts or rejects a newly started worker. Only called on the master.
    ///
    /// Coordination happens entirely through the filesystem, so workers must be local processes.
    pub fn configure_worker(
        &self,
        worker: &WorkerId,
        transport: &WorkerTransport,
    ) -> Result<(), CoordinatorError> {
        match transport {
            WorkerTransport::LocalProcess => {
                debug!("{}: accepted worker {worker}", self.env.worker);
                Ok(())
            }
            WorkerTransport::Remote { .. } => Err(CoordinatorError::UnsupportedWorker {
                worker: worker.to_string(),
                transport: transport.to_string(),
            }),
        }
    }

    /// Builds the dependency map from the tests this process collected.
    ///
    /// Replaces any previous map.
    pub fn collect(&mut self, tests: &[CollectedTest]) -> &DependencyMap {
        let tracked = self.registry.tracked_names();
        self.dependencies = DependencyMap::build(tests, &tracked);
        for name in self.dependencies.names() {
            let count = self.dependencies.dependents(name).map_or(0, |d| d.len());
            debug!(
                "{}: {name} is used by {count} collected tests",
                self.env.worker
            );
        }
        &self.dependencies
    }

    /// Sets up the shared fixture `name` and returns its state.
    ///
    /// The fixture is set up at most once per process; later calls return the same state.
    pub fn fixture(&mut self, name: &str) -> Result<StackState, CoordinatorError> {
        let resource = self.registry.get(name)?;
        if !resource.is_tracked() {
            return Err(CoordinatorError::FunctionScoped {
                name: resource.name().clone(),
            });
        }

        let fixture = self
            .fixtures
            .entry(resource.name().clone())
            .or_insert_with(|| StackFixture::new(resource.clone()));
        Ok(fixture.setup(&self.env.context())?)
    }

    /// Sets up a fresh instance of the function-scoped fixture `name`.
    ///
    /// The caller owns the returned fixture, and tears it down with
    /// [`context`](Self::context) when the test finishes. Shared fixtures are rejected with
    /// [`CoordinatorError::SharedScope`]: their lifecycle belongs to the coordinator.
    pub fn function_fixture(
        &self,
        name: &str,
    ) -> Result<(StackFixture, StackState), CoordinatorError> {
        let resource = self.registry.get(name)?;
        if resource.is_tracked() || self.dependencies.contains(resource.name()) {
            return Err(CoordinatorError::SharedScope {
                name: resource.name().clone(),
                scope: resource.scope().clone(),
            });
        }
        let mut fixture = StackFixture::new(resource.clone());
        let state = fixture.setup(&self.env.context())?;
        Ok((fixture, state))
    }

    /// Records a test report. Only the master writes, and only for the test body.
    pub fn record_report(&mut self, report: &TestReport) -> Result<(), CoordinatorError> {
        if report.phase != TestPhase::Call {
            return Ok(());
        }
        match &mut self.writer {
            Some(writer) => {
                writer.append(&report.id)?;
                debug!("{}: recorded {} as completed", self.env.worker, report.id);
            }
            None => {
                debug!(
                    "{}: not the master, ignoring report for {}",
                    self.env.worker, report.id
                );
            }
        }
        Ok(())
    }

    /// Called after `test` finishes. Tears down every remaining shared resource whose collected
    /// tests have all completed, and returns their names.
    ///
    /// Every resource still in the dependency map is checked, not only the ones `test` uses:
    /// tests finishing on other workers may have made any of them ready.
    ///
    /// Stops at the first teardown failure. A resource whose teardown failed is only retried by
    /// [`session_finish`](Self::session_finish); other resources are checked after later tests.
    pub fn after_test(
        &mut self,
        test: &CollectedTest,
    ) -> Result<Vec<ResourceName>, CoordinatorError> {
        self.completed.refresh(&mut self.reader)?;
        self.completed.insert(test.id.clone());

        let ready: Vec<_> = self
            .dependencies
            .ready(&self.completed)
            .into_iter()
            .filter(|name| !self.failed_teardowns.contains(name))
            .collect();

        let mut torn_down = Vec::with_capacity(ready.len());
        for name in ready {
            if let Err(error) = self.tear_down(&name) {
                self.failed_teardowns.insert(name);
                return Err(error);
            }
            torn_down.push(name);
        }
        Ok(torn_down)
    }

    /// Tears down every remaining resource whose collected tests have all completed, at the end
    /// of this process's session.
    ///
    /// Never fails: resources still in use elsewhere are left alone and reported in
    /// [`SweepReport::remaining`], and failures are logged and reported.
    pub fn session_finish(&mut self) -> SweepReport {
        let mut report = SweepReport::default();
        if let Err(error) = self.completed.refresh(&mut self.reader) {
            warn!(
                "{}: error reading completion log, using last known state: {}",
                self.env.worker,
                DisplayErrorChain::new(&error)
            );
        }

        for name in self.dependencies.ready(&self.completed) {
            match self.tear_down(&name) {
                Ok(()) => report.torn_down.push(name),
                Err(error) => {
                    warn!(
                        "{}: failed to tear down {name}: {}",
                        self.env.worker,
                        DisplayErrorChain::new(&error)
                    );
                    report.failures.push((name, error));
                }
            }
        }

        report.remaining = self.dependencies.pending(&self.completed);
        for (name, tests) in &report.remaining {
            warn!(
                "{}: leaving {name} provisioned, {} of its tests haven't completed",
                self.env.worker,
                tests.len()
            );
        }
        report
    }

    fn tear_down(&mut self, name: &ResourceName) -> Result<(), CoordinatorError> {
        let resource = self.registry.get(name.as_str())?;
        let fixture = self
            .fixtures
            .entry(name.clone())
            .or_insert_with(|| StackFixture::new(resource.clone()));
        let outcome = fixture.tear_down(&self.env.context())?;
        if outcome == TeardownOutcome::NotPresent {
            debug!("{}: {name} was already torn down", self.env.worker);
        }
        self.dependencies.remove(name);
        Ok(())
    }
}
