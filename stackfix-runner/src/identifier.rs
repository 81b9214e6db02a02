// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identifiers shared by every worker in a run.
//!
//! Resource names and test ids are computed identically by every worker, so they're safe to
//! compare across process boundaries (via the marker store and the completion log).

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{borrow::Borrow, fmt};

/// The name of a shared resource: the provisioning module it's built from.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceName(SmolStr);

impl ResourceName {
    /// Creates a new resource name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(SmolStr::new(name))
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ResourceName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ResourceName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A test identifier, stable across all workers for the same test.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(SmolStr);

impl TestId {
    /// Creates a new test id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(SmolStr::new(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TestId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TestId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifies the process this coordinator runs in.
///
/// Exactly one process per run is the master: it owns the completion log writer and creates the
/// shared state directory. Every other process is a worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WorkerId {
    /// The first process up, which owns the completion log writer.
    Master,

    /// A worker process, identified by the name its scheduler assigned (e.g. `gw0`).
    Worker(String),
}

impl WorkerId {
    /// The name used for the master process.
    pub const MASTER_NAME: &'static str = "master";

    /// Parses a worker id, treating `"master"` as [`WorkerId::Master`].
    pub fn from_name(name: &str) -> Self {
        if name == Self::MASTER_NAME {
            Self::Master
        } else {
            Self::Worker(name.to_owned())
        }
    }

    /// Returns true if this is the master process.
    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str(Self::MASTER_NAME),
            Self::Worker(name) => f.write_str(name),
        }
    }
}
