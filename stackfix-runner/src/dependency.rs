// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-worker map from shared resources to the tests that use them.

use crate::{
    completion::CompletedSet,
    identifier::{ResourceName, TestId},
};
use std::collections::{BTreeMap, BTreeSet};

/// A test as seen at collection time: its id and the fixtures it requests.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CollectedTest {
    /// The test's id.
    pub id: TestId,

    /// The names of every fixture the test requests, tracked or not.
    pub fixture_names: Vec<ResourceName>,
}

impl CollectedTest {
    /// Creates a new collected test.
    pub fn new(
        id: impl AsRef<str>,
        fixture_names: impl IntoIterator<Item = impl AsRef<str>>,
    ) -> Self {
        Self {
            id: TestId::new(id),
            fixture_names: fixture_names.into_iter().map(ResourceName::new).collect(),
        }
    }

    /// Returns the tracked fixtures this test uses, without duplicates.
    pub fn tracked_fixtures<'a>(
        &'a self,
        tracked: &'a BTreeSet<ResourceName>,
    ) -> impl Iterator<Item = &'a ResourceName> + 'a {
        let mut seen = BTreeSet::new();
        self.fixture_names
            .iter()
            .filter(move |name| tracked.contains(*name) && seen.insert(*name))
    }
}

/// Maps each tracked resource to the ids of the tests that depend on it.
///
/// Built once at collection time from what this worker collected. Entries are removed as their
/// resources are torn down, and never re-added.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DependencyMap {
    map: BTreeMap<ResourceName, BTreeSet<TestId>>,
}

impl DependencyMap {
    /// Builds the map from collected tests, keeping only fixtures in `tracked`.
    pub fn build<'a>(
        tests: impl IntoIterator<Item = &'a CollectedTest>,
        tracked: &BTreeSet<ResourceName>,
    ) -> Self {
        let mut map: BTreeMap<ResourceName, BTreeSet<TestId>> = BTreeMap::new();
        for test in tests {
            for name in test.tracked_fixtures(tracked) {
                map.entry(name.clone())
                    .or_default()
                    .insert(test.id.clone());
            }
        }
        Self { map }
    }

    /// Returns the dependents of `name`, if it's still in the map.
    pub fn dependents(&self, name: &ResourceName) -> Option<&BTreeSet<TestId>> {
        self.map.get(name)
    }

    /// Returns true if `name` is still awaiting teardown.
    pub fn contains(&self, name: &ResourceName) -> bool {
        self.map.contains_key(name)
    }

    /// Returns true if every known dependent of `name` has completed.
    ///
    /// Returns false if `name` isn't in the map.
    pub fn is_ready(&self, name: &ResourceName, completed: &CompletedSet) -> bool {
        self.map
            .get(name)
            .is_some_and(|dependents| completed.is_superset_of(dependents))
    }

    /// Returns every resource whose known dependents have all completed.
    pub fn ready(&self, completed: &CompletedSet) -> Vec<ResourceName> {
        self.map
            .iter()
            .filter(|(_, dependents)| completed.is_superset_of(*dependents))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Returns, for every resource with incomplete dependents, the dependents still outstanding.
    pub fn pending(&self, completed: &CompletedSet) -> BTreeMap<ResourceName, BTreeSet<TestId>> {
        self.map
            .iter()
            .filter_map(|(name, dependents)| {
                let missing = completed.missing(dependents);
                (!missing.is_empty()).then(|| (name.clone(), missing))
            })
            .collect()
    }

    /// Removes `name` from the map, returning its dependents.
    pub fn remove(&mut self, name: &ResourceName) -> Option<BTreeSet<TestId>> {
        self.map.remove(name)
    }

    /// Iterates over resource names in the map, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &ResourceName> {
        self.map.keys()
    }

    /// Returns the number of resources awaiting teardown.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if no resources are awaiting teardown.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
