// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fixtures that provision and destroy one resource.
//!
//! A [`StackFixture`] wraps a single registered resource. Shared (non-function) fixtures claim
//! ownership through the [`MarkerStore`]: the process that creates the marker provisions the
//! resource, and every other process reuses the state it cached next to the module. Destruction
//! goes through the marker too, so exactly one process destroys a resource however many try.
//!
//! Fixtures never decide when to tear themselves down; the
//! [`Coordinator`](crate::coordinator::Coordinator) does.

use crate::{
    config::{StackfixConfig, TeardownPolicy},
    errors::{DisplayErrorChain, FixtureError, MarkerError},
    identifier::{ResourceName, WorkerId},
    marker::{CreateOutcome, DeleteOutcome, MarkerStore},
    provision::{Provisioner, ProvisionerFactory},
    registry::SharedResource,
    state::{StackState, StateHook, replay_path},
};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use std::{fs, io, io::Write};
use tracing::{debug, info, warn};

/// The lifecycle state of a [`StackFixture`] within this process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FixtureState {
    /// Setup hasn't been attempted.
    Uninitialized,

    /// Setup is in progress, or failed partway. A failed setup isn't unwound.
    Creating,

    /// The resource is available. `owner` is true if this process provisioned it.
    Created {
        /// Whether this process provisioned the resource (and so holds its work directory).
        owner: bool,
    },

    /// Another process had already provisioned the resource; its cached state was loaded.
    Reused,

    /// Teardown is in progress.
    Destroying,

    /// Teardown finished. The fixture can't be used again in this process.
    Destroyed,
}

/// What [`StackFixture::tear_down`] did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TeardownOutcome {
    /// This process destroyed the resource.
    Destroyed,

    /// Destroying failed, but the teardown policy is `ignore`. The resource is considered gone.
    FailureIgnored,

    /// The marker was already gone: another process destroyed the resource.
    NotPresent,

    /// Nothing was destroyed, because the teardown policy is `off` or nothing was provisioned
    /// (e.g. in replay mode).
    Skipped,
}

/// Everything a fixture needs from its surroundings.
#[derive(Clone, Copy)]
pub struct FixtureContext<'a> {
    /// The process this fixture runs in.
    pub worker: &'a WorkerId,

    /// The run's configuration.
    pub config: &'a StackfixConfig,

    /// The shared marker store.
    pub markers: &'a MarkerStore,

    /// Creates provisioners.
    pub factory: &'a dyn ProvisionerFactory,

    /// This process's directory for work directories.
    pub work_root: &'a Utf8Path,

    /// Adjusts freshly provisioned state.
    pub state_hook: Option<&'a dyn StateHook>,
}

/// Provisions and destroys one registered resource.
#[derive(Debug)]
pub struct StackFixture {
    resource: SharedResource,
    state: FixtureState,
    module_dir: Option<Utf8PathBuf>,
    work_dir: Option<Utf8PathBuf>,
    stack_state: Option<StackState>,
    provisioner: DebugIgnore<Option<Box<dyn Provisioner>>>,
}

impl StackFixture {
    /// Creates an uninitialized fixture for `resource`.
    pub fn new(resource: SharedResource) -> Self {
        Self {
            resource,
            state: FixtureState::Uninitialized,
            module_dir: None,
            work_dir: None,
            stack_state: None,
            provisioner: DebugIgnore(None),
        }
    }

    /// The resource this fixture manages.
    pub fn resource(&self) -> &SharedResource {
        &self.resource
    }

    /// The resource name.
    pub fn name(&self) -> &ResourceName {
        self.resource.name()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> FixtureState {
        self.state
    }

    /// The work directory, if this process provisioned the resource or learned it from the marker.
    pub fn work_dir(&self) -> Option<&Utf8Path> {
        self.work_dir.as_deref()
    }

    /// Sets up the resource and returns its state.
    ///
    /// Once the fixture is created, later calls return the same state without provisioning
    /// again. After teardown, fails with [`FixtureError::AlreadyDestroyed`].
    pub fn setup(&mut self, ctx: &FixtureContext<'_>) -> Result<StackState, FixtureError> {
        match self.state {
            FixtureState::Created { .. } | FixtureState::Reused => {
                if let Some(state) = &self.stack_state {
                    return Ok(state.clone());
                }
            }
            FixtureState::Destroying | FixtureState::Destroyed => {
                return Err(FixtureError::AlreadyDestroyed {
                    name: self.name().clone(),
                });
            }
            FixtureState::Uninitialized | FixtureState::Creating => {}
        }

        let module_dir = self.module_dir(ctx.config)?;

        let state = if self.resource.replay() {
            let state = self.load_replay(&module_dir)?;
            self.state = FixtureState::Created { owner: false };
            state
        } else if !self.resource.is_tracked() {
            self.state = FixtureState::Creating;
            let work_dir = allocate_work_dir(ctx.work_root, self.name())?;
            let provisioner = ctx.factory.provisioner(&module_dir, &work_dir);
            let state = provision(ctx, self.name(), &module_dir, provisioner.as_ref())?;
            self.provisioner = DebugIgnore(Some(provisioner));
            self.work_dir = Some(work_dir);
            self.state = FixtureState::Created { owner: true };
            state
        } else {
            self.setup_shared(ctx, &module_dir)?
        };

        self.stack_state = Some(state.clone());
        Ok(state)
    }

    fn setup_shared(
        &mut self,
        ctx: &FixtureContext<'_>,
        module_dir: &Utf8Path,
    ) -> Result<StackState, FixtureError> {
        self.state = FixtureState::Creating;
        let name = self.resource.name();
        let marker_path = ctx.markers.marker_path(name);

        let outcome = ctx.markers.create_if_absent(name, |file| {
            let work_dir = allocate_work_dir(ctx.work_root, name)?;
            let provisioner = ctx.factory.provisioner(module_dir, &work_dir);
            let state = provision(ctx, name, module_dir, provisioner.as_ref())?;
            file.write_all(work_dir.as_str().as_bytes())
                .map_err(|error| MarkerError::Write {
                    path: marker_path.clone(),
                    error,
                })?;
            Ok::<_, FixtureError>((work_dir, state))
        })?;

        match outcome {
            CreateOutcome::Created((work_dir, state)) => {
                info!(
                    "{}: created {name} (work dir: {work_dir})",
                    ctx.worker
                );
                self.work_dir = Some(work_dir);
                self.state = FixtureState::Created { owner: true };
                Ok(state)
            }
            CreateOutcome::Existed(work_dir) => {
                debug!(
                    "{}: {name} already provisioned by another process, reusing",
                    ctx.worker
                );
                let state = self.load_replay(module_dir)?;
                self.work_dir = Some(Utf8PathBuf::from(work_dir));
                self.state = FixtureState::Reused;
                Ok(state)
            }
        }
    }

    /// Tears down the resource according to its teardown policy.
    ///
    /// For shared fixtures this goes through the marker, so it doesn't require this process to
    /// have set the fixture up, and is a no-op if another process already destroyed the resource.
    /// With teardown policy `on`, a failure to destroy is returned and the marker is kept, so the
    /// resource can still be found and cleaned up.
    pub fn tear_down(&mut self, ctx: &FixtureContext<'_>) -> Result<TeardownOutcome, FixtureError> {
        let name = self.name().clone();
        let previous = self.state;
        match previous {
            FixtureState::Destroying | FixtureState::Destroyed => {
                return Err(FixtureError::AlreadyDestroyed { name });
            }
            _ => {}
        }

        let policy = self.resource.teardown();
        if policy == TeardownPolicy::Off {
            info!(
                "{}: teardown is off, leaving {name} provisioned",
                ctx.worker
            );
            return Ok(TeardownOutcome::Skipped);
        }

        if self.resource.replay() {
            self.state = FixtureState::Destroyed;
            return Ok(TeardownOutcome::Skipped);
        }

        self.state = FixtureState::Destroying;
        let result = if self.resource.is_tracked() {
            self.tear_down_shared(ctx, policy)
        } else {
            self.tear_down_local(ctx, policy)
        };

        match &result {
            Ok(_) => {
                self.state = FixtureState::Destroyed;
                self.stack_state = None;
                self.provisioner = DebugIgnore(None);
            }
            // Leave the fixture usable so teardown can be retried.
            Err(_) => self.state = previous,
        }
        result
    }

    fn tear_down_shared(
        &mut self,
        ctx: &FixtureContext<'_>,
        policy: TeardownPolicy,
    ) -> Result<TeardownOutcome, FixtureError> {
        let module_dir = self.module_dir(ctx.config)?;
        let name = self.resource.name();

        let outcome = ctx.markers.delete_if_present(name, |work_dir| {
            info!(
                "{}: tearing down {name} (work dir: {work_dir})",
                ctx.worker
            );
            let provisioner = ctx.factory.provisioner(&module_dir, Utf8Path::new(work_dir));
            destroy(ctx, name, provisioner.as_ref(), policy)
        })?;

        Ok(match outcome {
            DeleteOutcome::Deleted(outcome) => outcome,
            DeleteOutcome::Absent => {
                debug!(
                    "{}: {name} was already torn down by another process",
                    ctx.worker
                );
                TeardownOutcome::NotPresent
            }
        })
    }

    fn tear_down_local(
        &mut self,
        ctx: &FixtureContext<'_>,
        policy: TeardownPolicy,
    ) -> Result<TeardownOutcome, FixtureError> {
        match &*self.provisioner {
            Some(provisioner) => {
                info!("{}: tearing down {}", ctx.worker, self.name());
                destroy(ctx, self.resource.name(), provisioner.as_ref(), policy)
            }
            None => Ok(TeardownOutcome::Skipped),
        }
    }

    fn module_dir(&mut self, config: &StackfixConfig) -> Result<Utf8PathBuf, FixtureError> {
        if let Some(module_dir) = &self.module_dir {
            return Ok(module_dir.clone());
        }
        let module_dir = self.resource.resolve_module_dir(config)?;
        self.module_dir = Some(module_dir.clone());
        Ok(module_dir)
    }

    fn load_replay(&self, module_dir: &Utf8Path) -> Result<StackState, FixtureError> {
        let path = replay_path(module_dir);
        if !path.is_file() {
            return Err(FixtureError::ReplayStateMissing {
                name: self.name().clone(),
                path,
            });
        }
        StackState::from_path(&path).map_err(|error| FixtureError::State {
            name: self.name().clone(),
            error,
        })
    }
}

/// Creates a fresh numbered directory `<root>/<name><N>` and returns `<root>/<name><N>/work`.
///
/// The provisioning state file lives in the numbered directory, next to (not inside) the work
/// directory.
fn allocate_work_dir(root: &Utf8Path, name: &ResourceName) -> Result<Utf8PathBuf, FixtureError> {
    allocate_numbered_work_dir(root, name, MAX_WORK_DIRS)
}

const MAX_WORK_DIRS: u32 = 10_000;

fn allocate_numbered_work_dir(
    root: &Utf8Path,
    name: &ResourceName,
    attempts: u32,
) -> Result<Utf8PathBuf, FixtureError> {
    let create_err = |path: &Utf8Path, error| FixtureError::WorkDirCreate {
        name: name.clone(),
        path: path.to_owned(),
        error,
    };

    fs::create_dir_all(root).map_err(|error| create_err(root, error))?;
    for n in 0..attempts {
        let numbered = root.join(format!("{name}{n}"));
        match fs::create_dir(&numbered) {
            Ok(()) => {
                let work_dir = numbered.join("work");
                fs::create_dir(&work_dir).map_err(|error| create_err(&work_dir, error))?;
                return Ok(work_dir);
            }
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(error) => return Err(create_err(&numbered, error)),
        }
    }

    Err(FixtureError::WorkDirsExhausted {
        name: name.clone(),
        root: root.to_owned(),
        attempts,
    })
}

/// Initializes and applies, runs the state hook, and caches the state next to the module.
fn provision(
    ctx: &FixtureContext<'_>,
    name: &ResourceName,
    module_dir: &Utf8Path,
    provisioner: &dyn Provisioner,
) -> Result<StackState, FixtureError> {
    info!("{}: provisioning {name} from {module_dir}", ctx.worker);
    let failed = |error| FixtureError::ProvisioningFailed {
        name: name.clone(),
        error,
    };

    provisioner.init().map_err(failed)?;
    let mut state = provisioner.apply().map_err(failed)?;
    if let Some(hook) = ctx.state_hook {
        hook.modify_state(name, &mut state);
    }
    state
        .save(&replay_path(module_dir))
        .map_err(|error| FixtureError::State {
            name: name.clone(),
            error,
        })?;
    Ok(state)
}

fn destroy(
    ctx: &FixtureContext<'_>,
    name: &ResourceName,
    provisioner: &dyn Provisioner,
    policy: TeardownPolicy,
) -> Result<TeardownOutcome, FixtureError> {
    match provisioner.destroy() {
        Ok(()) => Ok(TeardownOutcome::Destroyed),
        Err(error) => {
            let error = FixtureError::TeardownFailed {
                name: name.clone(),
                error,
            };
            if policy == TeardownPolicy::Ignore {
                warn!(
                    "{}: ignoring teardown failure: {}",
                    ctx.worker,
                    DisplayErrorChain::new(&error)
                );
                Ok(TeardownOutcome::FailureIgnored)
            } else {
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::ProvisionError,
        lock::LockOptions,
        registry::{FixtureRegistry, ResourceDescriptor},
    };
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::{cell::RefCell, rc::Rc, time::Duration};

    #[derive(Clone, Default)]
    struct FakeFactory {
        calls: Rc<RefCell<Vec<String>>>,
        fail_apply: bool,
        fail_destroy: bool,
    }

    impl FakeFactory {
        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    struct FakeProvisioner {
        work_dir: Utf8PathBuf,
        factory: FakeFactory,
    }

    impl ProvisionerFactory for FakeFactory {
        fn provisioner(&self, _module_dir: &Utf8Path, work_dir: &Utf8Path) -> Box<dyn Provisioner> {
            Box::new(FakeProvisioner {
                work_dir: work_dir.to_owned(),
                factory: self.clone(),
            })
        }
    }

    impl FakeProvisioner {
        fn record(&self, call: &str) {
            let numbered = self.work_dir.parent().and_then(Utf8Path::file_name);
            self.factory
                .calls
                .borrow_mut()
                .push(format!("{call} {}", numbered.unwrap_or_default()));
        }
    }

    fn failure(command: &str) -> ProvisionError {
        ProvisionError::CommandFailed {
            command: command.to_owned(),
            exit_code: Some(1),
            output: String::new(),
        }
    }

    impl Provisioner for FakeProvisioner {
        fn init(&self) -> Result<(), ProvisionError> {
            self.record("init");
            Ok(())
        }

        fn apply(&self) -> Result<StackState, ProvisionError> {
            self.record("apply");
            if self.factory.fail_apply {
                return Err(failure("apply"));
            }
            Ok(format!(
                r#"{{"resources": [{{"type": "aws_db_instance", "name": "main", "instances": [{{"attributes": {{"id": "{}"}}}}]}}]}}"#,
                self.work_dir
            )
            .parse()
            .unwrap())
        }

        fn destroy(&self) -> Result<(), ProvisionError> {
            self.record("destroy");
            if self.factory.fail_destroy {
                return Err(failure("destroy"));
            }
            Ok(())
        }
    }

    struct Harness {
        dir: Utf8TempDir,
        config: StackfixConfig,
        markers: MarkerStore,
        worker: WorkerId,
        factory: FakeFactory,
        registry: FixtureRegistry,
    }

    impl Harness {
        fn new() -> Self {
            let dir = Utf8TempDir::new().unwrap();
            let state_dir = dir.path().join("state");
            fs::create_dir_all(&state_dir).unwrap();
            fs::create_dir_all(dir.path().join("tests").join("terraform").join("db")).unwrap();
            let options = LockOptions::new(Duration::from_secs(5), Duration::from_millis(1));
            Self {
                config: StackfixConfig::defaults().with_lock(options),
                markers: MarkerStore::new(state_dir, options),
                worker: WorkerId::from_name("gw0"),
                factory: FakeFactory::default(),
                registry: FixtureRegistry::new(),
                dir,
            }
        }

        fn fixture(&mut self, descriptor: ResourceDescriptor) -> StackFixture {
            let resource = self.registry.register(descriptor, &self.config).unwrap();
            StackFixture::new(resource.clone())
        }

        fn db(&self) -> ResourceDescriptor {
            ResourceDescriptor::new("db", self.dir.path().join("tests")).with_scope("session")
        }

        fn module_dir(&self) -> Utf8PathBuf {
            self.dir.path().join("tests").join("terraform").join("db")
        }

        fn ctx(&self) -> FixtureContext<'_> {
            FixtureContext {
                worker: &self.worker,
                config: &self.config,
                markers: &self.markers,
                factory: &self.factory,
                work_root: self.dir.path(),
                state_hook: None,
            }
        }
    }

    #[test]
    fn owner_provisions_and_publishes_marker() {
        let mut h = Harness::new();
        let mut fixture = h.fixture(h.db());
        let state = fixture.setup(&h.ctx()).unwrap();

        assert_eq!(fixture.state(), FixtureState::Created { owner: true });
        assert_eq!(h.factory.calls(), vec!["init db0", "apply db0"]);
        let work_dir = h.dir.path().join("db0").join("work");
        assert_eq!(fixture.work_dir(), Some(work_dir.as_path()));
        assert_eq!(
            h.markers.read(fixture.name()).unwrap().as_deref(),
            Some(work_dir.as_str())
        );
        assert_eq!(
            StackState::from_path(&replay_path(&h.module_dir())).unwrap(),
            state
        );

        // Setup is single-use: a second call returns the same state without provisioning.
        assert_eq!(fixture.setup(&h.ctx()).unwrap(), state);
        assert_eq!(h.factory.calls().len(), 2);
    }

    #[test]
    fn second_process_reuses_cached_state() {
        let mut h = Harness::new();
        let mut owner = h.fixture(h.db());
        let mut other = h.fixture(h.db());

        let state = owner.setup(&h.ctx()).unwrap();
        let reused = other.setup(&h.ctx()).unwrap();
        assert_eq!(reused, state);
        assert_eq!(other.state(), FixtureState::Reused);
        assert_eq!(owner.work_dir(), other.work_dir());
        assert_eq!(h.factory.calls(), vec!["init db0", "apply db0"]);

        // Whichever process tears down first destroys it; the other finds it gone.
        assert_eq!(
            other.tear_down(&h.ctx()).unwrap(),
            TeardownOutcome::Destroyed
        );
        assert_eq!(
            owner.tear_down(&h.ctx()).unwrap(),
            TeardownOutcome::NotPresent
        );
        assert_eq!(
            h.factory.calls(),
            vec!["init db0", "apply db0", "destroy db0"]
        );
        assert_eq!(h.markers.read(owner.name()).unwrap(), None);
        assert!(matches!(
            owner.tear_down(&h.ctx()),
            Err(FixtureError::AlreadyDestroyed { .. })
        ));
        assert!(matches!(
            owner.setup(&h.ctx()),
            Err(FixtureError::AlreadyDestroyed { .. })
        ));
    }

    #[test]
    fn provisioning_failure_leaves_no_marker() {
        let mut h = Harness::new();
        h.factory.fail_apply = true;
        let mut fixture = h.fixture(h.db());

        let err = fixture.setup(&h.ctx()).unwrap_err();
        assert!(
            matches!(err, FixtureError::ProvisioningFailed { .. }),
            "{err:?}"
        );
        assert_eq!(fixture.state(), FixtureState::Creating);
        assert_eq!(h.markers.read(fixture.name()).unwrap(), None);
    }

    #[test]
    fn teardown_failure_with_policy_on_keeps_marker() {
        let mut h = Harness::new();
        h.factory.fail_destroy = true;
        let mut fixture = h.fixture(h.db());
        fixture.setup(&h.ctx()).unwrap();

        let err = fixture.tear_down(&h.ctx()).unwrap_err();
        assert!(matches!(err, FixtureError::TeardownFailed { .. }), "{err:?}");
        assert!(h.markers.read(fixture.name()).unwrap().is_some());
        assert_eq!(fixture.state(), FixtureState::Created { owner: true });
    }

    #[test]
    fn teardown_failure_with_policy_ignore_is_swallowed() {
        let mut h = Harness::new();
        h.factory.fail_destroy = true;
        let descriptor = h.db().with_teardown("ignore");
        let mut fixture = h.fixture(descriptor);
        fixture.setup(&h.ctx()).unwrap();

        assert_eq!(
            fixture.tear_down(&h.ctx()).unwrap(),
            TeardownOutcome::FailureIgnored
        );
        assert_eq!(h.markers.read(fixture.name()).unwrap(), None);
        assert_eq!(fixture.state(), FixtureState::Destroyed);
    }

    #[test]
    fn teardown_off_leaves_resource() {
        let mut h = Harness::new();
        let descriptor = h.db().with_teardown("off");
        let mut fixture = h.fixture(descriptor);
        fixture.setup(&h.ctx()).unwrap();

        assert_eq!(
            fixture.tear_down(&h.ctx()).unwrap(),
            TeardownOutcome::Skipped
        );
        assert!(h.markers.read(fixture.name()).unwrap().is_some());
        assert!(!h.factory.calls().iter().any(|call| call.starts_with("destroy")));
    }

    #[test]
    fn replay_loads_recorded_state() {
        let mut h = Harness::new();
        let descriptor = h.db().with_replay(true);
        let mut fixture = h.fixture(descriptor);

        let err = fixture.setup(&h.ctx()).unwrap_err();
        assert!(
            matches!(err, FixtureError::ReplayStateMissing { .. }),
            "{err:?}"
        );

        let mut recorded = StackState::default();
        recorded
            .outputs_mut()
            .insert("endpoint".to_owned(), json!("db.internal"));
        recorded.save(&replay_path(&h.module_dir())).unwrap();

        assert_eq!(fixture.setup(&h.ctx()).unwrap(), recorded);
        assert_eq!(fixture.state(), FixtureState::Created { owner: false });
        assert_eq!(
            fixture.tear_down(&h.ctx()).unwrap(),
            TeardownOutcome::Skipped
        );
        assert!(h.factory.calls().is_empty());
        assert_eq!(h.markers.list().unwrap(), vec![]);
    }

    #[test]
    fn function_scope_bypasses_markers() {
        let mut h = Harness::new();
        let descriptor = ResourceDescriptor::new("db", h.dir.path().join("tests"));
        let mut first = h.fixture(descriptor.clone());
        let mut second = h.fixture(descriptor);

        first.setup(&h.ctx()).unwrap();
        second.setup(&h.ctx()).unwrap();
        assert_eq!(h.markers.list().unwrap(), vec![]);

        assert_eq!(
            first.tear_down(&h.ctx()).unwrap(),
            TeardownOutcome::Destroyed
        );
        assert_eq!(
            second.tear_down(&h.ctx()).unwrap(),
            TeardownOutcome::Destroyed
        );
        assert_eq!(
            h.factory.calls(),
            vec![
                "init db0",
                "apply db0",
                "init db1",
                "apply db1",
                "destroy db0",
                "destroy db1"
            ]
        );
    }

    #[test]
    fn state_hook_runs_before_caching() {
        let mut h = Harness::new();
        let mut fixture = h.fixture(h.db());
        let hook = |name: &ResourceName, state: &mut StackState| {
            state
                .outputs_mut()
                .insert("hooked".to_owned(), json!(name.as_str()));
        };
        let ctx = FixtureContext {
            state_hook: Some(&hook),
            ..h.ctx()
        };

        let state = fixture.setup(&ctx).unwrap();
        assert_eq!(state.outputs().get("hooked"), Some(&json!("db")));
        let cached = StackState::from_path(&replay_path(&h.module_dir())).unwrap();
        assert_eq!(cached, state);
    }

    #[test]
    fn missing_module_fails_before_provisioning() {
        let mut h = Harness::new();
        let descriptor =
            ResourceDescriptor::new("queue", h.dir.path().join("tests")).with_scope("session");
        let mut fixture = h.fixture(descriptor);

        let err = fixture.setup(&h.ctx()).unwrap_err();
        assert!(matches!(err, FixtureError::ModuleNotFound { .. }), "{err:?}");
        assert!(h.factory.calls().is_empty());
        assert_eq!(fixture.state(), FixtureState::Uninitialized);
    }

    #[test]
    fn work_dirs_are_numbered_until_exhausted() {
        let dir = Utf8TempDir::new().unwrap();
        let root = dir.path().join("basetemp");
        let name = ResourceName::new("db");

        let first = allocate_numbered_work_dir(&root, &name, 2).unwrap();
        assert_eq!(first, root.join("db0").join("work"));
        let second = allocate_numbered_work_dir(&root, &name, 2).unwrap();
        assert_eq!(second, root.join("db1").join("work"));

        let err = allocate_numbered_work_dir(&root, &name, 2).unwrap_err();
        assert!(
            matches!(err, FixtureError::WorkDirsExhausted { attempts: 2, .. }),
            "{err:?}"
        );
        assert!(!root.join("db2").exists());
    }
}
