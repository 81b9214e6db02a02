// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::{Utf8Path, Utf8PathBuf};
use camino_tempfile::Utf8TempDir;
use serde_json::json;
use stackfix_runner::{
    config::StackfixConfig,
    coordinator::Coordinator,
    errors::ProvisionError,
    identifier::WorkerId,
    lock::LockOptions,
    provision::{Provisioner, ProvisionerFactory},
    registry::{FixtureRegistry, ResourceDescriptor},
    state::StackState,
};
use std::{
    fs,
    sync::{Arc, Mutex, Once},
    time::Duration,
};

pub(crate) fn test_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        color_eyre::install().unwrap();
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// A call made to a provisioner, tagged with the module name and numbered work directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Call {
    Init(String),
    Apply(String),
    Destroy(String),
}

impl Call {
    pub(crate) fn is_apply(&self) -> bool {
        matches!(self, Call::Apply(_))
    }

    pub(crate) fn is_destroy(&self) -> bool {
        matches!(self, Call::Destroy(_))
    }
}

/// Records every call made by its provisioners, across threads.
#[derive(Clone, Debug, Default)]
pub(crate) struct RecordingFactory {
    calls: Arc<Mutex<Vec<Call>>>,
    fail_destroy: bool,
}

impl RecordingFactory {
    pub(crate) fn failing_destroy() -> Self {
        Self {
            fail_destroy: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| pred(call)).count()
    }
}

impl ProvisionerFactory for RecordingFactory {
    fn provisioner(&self, module_dir: &Utf8Path, work_dir: &Utf8Path) -> Box<dyn Provisioner> {
        Box::new(RecordingProvisioner {
            module: module_dir.file_name().unwrap_or_default().to_owned(),
            work_dir: work_dir.to_owned(),
            factory: self.clone(),
        })
    }
}

struct RecordingProvisioner {
    module: String,
    work_dir: Utf8PathBuf,
    factory: RecordingFactory,
}

impl RecordingProvisioner {
    fn tag(&self) -> String {
        let numbered = self.work_dir.parent().and_then(Utf8Path::file_name);
        format!("{}@{}", self.module, numbered.unwrap_or_default())
    }

    fn record(&self, call: Call) {
        self.factory.calls.lock().unwrap().push(call);
    }
}

impl Provisioner for RecordingProvisioner {
    fn init(&self) -> Result<(), ProvisionError> {
        self.record(Call::Init(self.tag()));
        Ok(())
    }

    fn apply(&self) -> Result<StackState, ProvisionError> {
        self.record(Call::Apply(self.tag()));
        let raw = json!({
            "version": 4,
            "outputs": {},
            "resources": [{
                "type": "aws_db_instance",
                "name": self.module,
                "instances": [{"attributes": {"id": self.work_dir.as_str()}}],
            }],
        });
        Ok(raw.to_string().parse().expect("valid state"))
    }

    fn destroy(&self) -> Result<(), ProvisionError> {
        self.record(Call::Destroy(self.tag()));
        if self.factory.fail_destroy {
            return Err(ProvisionError::CommandFailed {
                command: "terraform destroy".to_owned(),
                exit_code: Some(1),
                output: "Error: timeout while waiting for state to become 'destroyed'".to_owned(),
            });
        }
        Ok(())
    }
}

/// A project with `db`, `cache` and `scratch` modules, and a temporary directory tree shaped like
/// a distributed run's: the master's base directory with one child per worker.
pub(crate) struct Project {
    dir: Utf8TempDir,
    pub(crate) config: StackfixConfig,
}

impl Project {
    pub(crate) fn new() -> Self {
        let dir = Utf8TempDir::new().unwrap();
        for module in ["db", "cache", "scratch"] {
            fs::create_dir_all(dir.path().join("tests").join("terraform").join(module)).unwrap();
        }
        fs::create_dir_all(dir.path().join("basetemp")).unwrap();

        let config = StackfixConfig::defaults().with_lock(LockOptions::new(
            Duration::from_secs(10),
            Duration::from_millis(5),
        ));
        Self { dir, config }
    }

    pub(crate) fn test_dir(&self) -> Utf8PathBuf {
        self.dir.path().join("tests")
    }

    pub(crate) fn base_temp(&self, worker: &WorkerId) -> Utf8PathBuf {
        let base = self.dir.path().join("basetemp");
        match worker {
            WorkerId::Master => base,
            WorkerId::Worker(name) => {
                let dir = base.join(format!("popen-{name}"));
                fs::create_dir_all(&dir).unwrap();
                dir
            }
        }
    }

    /// Registers `db` (session), `cache` (module) and `scratch` (function), with `db` using
    /// `db_teardown`.
    pub(crate) fn registry(&self, db_teardown: &str) -> FixtureRegistry {
        let mut registry = FixtureRegistry::new();
        let descriptors = [
            ResourceDescriptor::new("db", self.test_dir())
                .with_scope("session")
                .with_teardown(db_teardown),
            ResourceDescriptor::new("cache", self.test_dir()).with_scope("module"),
            ResourceDescriptor::new("scratch", self.test_dir()),
        ];
        for descriptor in descriptors {
            registry.register(descriptor, &self.config).unwrap();
        }
        registry
    }

    pub(crate) fn coordinator(
        &self,
        worker: WorkerId,
        factory: &RecordingFactory,
        db_teardown: &str,
    ) -> Coordinator {
        let base_temp = self.base_temp(&worker);
        Coordinator::new(
            self.config.clone(),
            self.registry(db_teardown),
            Box::new(factory.clone()),
            worker,
            &base_temp,
        )
        .unwrap()
    }
}
