// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The registry of infrastructure fixtures known to a run.
//!
//! Test suites declare fixtures up front with [`FixtureRegistry::register`], passing the directory
//! the declaring test module lives in. The registry is then shared with the coordinator, which
//! uses it to decide which fixtures to track across workers.

use crate::{
    config::{StackfixConfig, TeardownPolicy},
    errors::{FixtureError, RegistryError},
    identifier::ResourceName,
};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::{collections::BTreeSet, convert::Infallible, fmt, str::FromStr};
use tracing::debug;

/// How widely a fixture's resource is shared.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Scope {
    /// A fresh resource for every test. Never shared between tests or processes.
    Function,

    /// Shared by the tests of one module.
    Module,

    /// Shared by every test in the run.
    Session,

    /// Any other framework-defined scope (e.g. `class` or `package`). Shared like `Module`.
    Custom(String),
}

impl Scope {
    /// Returns true if resources of this scope outlive a single test, and so need cross-process
    /// coordination.
    pub fn is_shared(&self) -> bool {
        !matches!(self, Self::Function)
    }

    /// Returns the name of this scope.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Function => "function",
            Self::Module => "module",
            Self::Session => "session",
            Self::Custom(name) => name,
        }
    }
}

impl FromStr for Scope {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "function" => Self::Function,
            "module" => Self::Module,
            "session" => Self::Session,
            other => Self::Custom(other.to_owned()),
        })
    }
}

impl From<&str> for Scope {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(scope) => scope,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixture declaration, as passed to [`FixtureRegistry::register`].
#[derive(Clone, Debug)]
pub struct ResourceDescriptor {
    module: ResourceName,
    scope: Scope,
    test_dir: Utf8PathBuf,
    replay: Option<bool>,
    teardown: Option<String>,
}

impl ResourceDescriptor {
    /// Declares a function-scoped fixture for `module`, declared from a test module in `test_dir`.
    pub fn new(module: impl AsRef<str>, test_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            module: ResourceName::new(module),
            scope: Scope::Function,
            test_dir: test_dir.into(),
            replay: None,
            teardown: None,
        }
    }

    /// Sets the scope.
    pub fn with_scope(mut self, scope: impl Into<Scope>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Overrides the configured replay mode for this fixture.
    pub fn with_replay(mut self, replay: bool) -> Self {
        self.replay = Some(replay);
        self
    }

    /// Sets the teardown option: `on`, `off`, `ignore` or `default`.
    pub fn with_teardown(mut self, teardown: impl Into<String>) -> Self {
        self.teardown = Some(teardown.into());
        self
    }
}

/// A registered fixture, with its options resolved against the configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SharedResource {
    name: ResourceName,
    scope: Scope,
    test_dir: Utf8PathBuf,
    replay: bool,
    teardown: TeardownPolicy,
}

impl SharedResource {
    /// The resource name, which is also the module name.
    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    /// The scope the resource is shared at.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// The directory of the test module that declared the fixture.
    pub fn test_dir(&self) -> &Utf8Path {
        &self.test_dir
    }

    /// Whether the fixture loads recorded state instead of provisioning.
    pub fn replay(&self) -> bool {
        self.replay
    }

    /// The resolved teardown policy.
    pub fn teardown(&self) -> TeardownPolicy {
        self.teardown
    }

    /// Returns true if this resource is shared across tests and tracked by the coordinator.
    pub fn is_tracked(&self) -> bool {
        self.scope.is_shared()
    }

    /// Returns the directories searched for this resource's module, in order.
    pub fn module_dir_candidates(&self, config: &StackfixConfig) -> Vec<Utf8PathBuf> {
        module_dir_candidates(&self.name, &self.test_dir, config)
    }

    /// Returns the first candidate module directory that exists.
    pub fn resolve_module_dir(&self, config: &StackfixConfig) -> Result<Utf8PathBuf, FixtureError> {
        resolve_module_dir(&self.name, &self.test_dir, config)
    }
}

/// Returns the directories searched for the module `name`, declared from a test module in
/// `test_dir`, in order:
///
/// 1. `<module-dir>/<name>`, if a module directory is configured
/// 2. `<test_dir>/<name>`
/// 3. `<test_dir>/terraform/<name>`
/// 4. `<test_dir>/../<name>`
/// 5. `<test_dir>/../terraform/<name>`
pub fn module_dir_candidates(
    name: &ResourceName,
    test_dir: &Utf8Path,
    config: &StackfixConfig,
) -> Vec<Utf8PathBuf> {
    let module = name.as_str();
    let mut candidates = Vec::with_capacity(5);
    if let Some(module_dir) = config.module_dir() {
        candidates.push(module_dir.join(module));
    }
    candidates.push(test_dir.join(module));
    candidates.push(test_dir.join("terraform").join(module));
    if let Some(parent) = test_dir.parent() {
        candidates.push(parent.join(module));
        candidates.push(parent.join("terraform").join(module));
    }
    candidates
}

/// Returns the first of [`module_dir_candidates`] that exists, or
/// [`FixtureError::ModuleNotFound`] listing all of them.
pub fn resolve_module_dir(
    name: &ResourceName,
    test_dir: &Utf8Path,
    config: &StackfixConfig,
) -> Result<Utf8PathBuf, FixtureError> {
    let candidates = module_dir_candidates(name, test_dir, config);
    match candidates.iter().find(|candidate| candidate.is_dir()) {
        Some(found) => Ok(found.clone()),
        None => Err(FixtureError::ModuleNotFound {
            name: name.clone(),
            candidates,
        }),
    }
}

/// Every fixture registered for a run, in registration order.
#[derive(Clone, Debug, Default)]
pub struct FixtureRegistry {
    fixtures: IndexMap<ResourceName, SharedResource>,
}

impl FixtureRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fixture.
    ///
    /// Registering a module that's already registered with the same scope returns the existing
    /// entry unchanged. A different scope is a [`RegistryError::ScopeConflict`].
    pub fn register(
        &mut self,
        descriptor: ResourceDescriptor,
        config: &StackfixConfig,
    ) -> Result<&SharedResource, RegistryError> {
        let ResourceDescriptor {
            module,
            scope,
            test_dir,
            replay,
            teardown,
        } = descriptor;

        if let Some(existing) = self.fixtures.get(&module) {
            if existing.scope != scope {
                return Err(RegistryError::ScopeConflict {
                    name: module,
                    existing: existing.scope.clone(),
                    requested: scope,
                });
            }
            debug!("fixture {module} already registered, reusing");
        } else {
            let teardown = TeardownPolicy::resolve(teardown.as_deref(), config.teardown())
                .map_err(|error| RegistryError::InvalidTeardown {
                    name: module.clone(),
                    error,
                })?;
            let resource = SharedResource {
                name: module.clone(),
                scope,
                test_dir,
                replay: replay.unwrap_or(config.replay()),
                teardown,
            };
            debug!(
                "registered fixture {module} (scope: {}, teardown: {teardown})",
                resource.scope
            );
            self.fixtures.insert(module.clone(), resource);
        }

        // The entry was either found or inserted above.
        self.get(module.as_str())
    }

    /// Looks up a fixture by name.
    pub fn get(&self, name: &str) -> Result<&SharedResource, RegistryError> {
        self.fixtures
            .get(name)
            .ok_or_else(|| RegistryError::UnknownFixture {
                name: name.to_owned(),
            })
    }

    /// Returns the names of every fixture that's shared beyond a single test.
    pub fn tracked_names(&self) -> BTreeSet<ResourceName> {
        self.fixtures
            .values()
            .filter(|resource| resource.is_tracked())
            .map(|resource| resource.name.clone())
            .collect()
    }

    /// Iterates over fixtures in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &SharedResource> {
        self.fixtures.values()
    }

    /// Returns the number of registered fixtures.
    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    /// Returns true if no fixtures are registered.
    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }
}
