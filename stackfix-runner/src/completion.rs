// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The shared, append-only log of completed tests.
//!
//! One process (the master) owns a [`CompletionLogWriter`] and appends one line per completed
//! test. Every process, master included, holds a [`CompletionLogReader`] and rescans the whole log
//! from the start whenever it needs to know global progress. Only newline-terminated lines are
//! trusted, so a reader racing with an append sees a shorter log rather than a torn entry.

use crate::{errors::CompletionLogError, identifier::TestId};
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use std::{
    collections::BTreeSet,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
};

/// The file name of the completion log inside the shared state directory.
pub const COMPLETION_LOG_FILE_NAME: &str = "completed-log.txt";

/// The single writer handle for the completion log.
#[derive(Debug)]
pub struct CompletionLogWriter {
    path: Utf8PathBuf,
    file: DebugIgnore<File>,
}

impl CompletionLogWriter {
    /// Opens the log for appending, creating it if necessary.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, CompletionLogError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|error| CompletionLogError::Open {
                path: path.clone(),
                error,
            })?;
        Ok(Self {
            path,
            file: DebugIgnore(file),
        })
    }

    /// Returns the path to the log.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Appends `test_id` as a single line and syncs it to disk before returning.
    pub fn append(&mut self, test_id: &TestId) -> Result<(), CompletionLogError> {
        if test_id.as_str().contains(['\n', '\r']) {
            return Err(CompletionLogError::InvalidTestId {
                test_id: test_id.clone(),
            });
        }

        let line = format!("{test_id}\n");
        // A single write call keeps the line contiguous in append mode.
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .and_then(|()| self.file.sync_data())
            .map_err(|error| CompletionLogError::Append {
                path: self.path.clone(),
                test_id: test_id.clone(),
                error,
            })
    }
}

/// A read-only handle to the completion log, opened once and rescanned on every check.
#[derive(Debug)]
pub struct CompletionLogReader {
    path: Utf8PathBuf,
    file: DebugIgnore<File>,
}

impl CompletionLogReader {
    /// Opens an existing log for reading.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, CompletionLogError> {
        let path = path.into();
        let file = File::open(&path).map_err(|error| CompletionLogError::Open {
            path: path.clone(),
            error,
        })?;
        Ok(Self {
            path,
            file: DebugIgnore(file),
        })
    }

    /// Returns the path to the log.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Reads every complete entry in the log, from the beginning, in order.
    ///
    /// A trailing line without a newline is ignored: it may still be in the middle of being
    /// written. Surrounding whitespace is trimmed and blank lines are skipped.
    pub fn scan(&mut self) -> Result<Vec<TestId>, CompletionLogError> {
        let read_err = |error| CompletionLogError::Read {
            path: self.path.clone(),
            error,
        };

        let mut contents = Vec::new();
        self.file.seek(SeekFrom::Start(0)).map_err(read_err)?;
        self.file.read_to_end(&mut contents).map_err(read_err)?;

        Ok(parse_entries(&contents))
    }
}

fn parse_entries(contents: &[u8]) -> Vec<TestId> {
    let complete = match contents.iter().rposition(|&b| b == b'\n') {
        Some(last_newline) => &contents[..last_newline],
        None => return Vec::new(),
    };

    complete
        .split(|&b| b == b'\n')
        .map(String::from_utf8_lossy)
        .filter_map(|line| {
            let line = line.trim();
            (!line.is_empty()).then(|| TestId::new(line))
        })
        .collect()
}

/// The set of tests known to have completed, as seen by one worker.
///
/// Merges the full completion log with tests finished locally. It only ever grows.
#[derive(Clone, Debug, Default)]
pub struct CompletedSet {
    ids: BTreeSet<TestId>,
}

impl CompletedSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rescans the log and merges every entry into the set.
    ///
    /// Returns the number of ids that weren't already present.
    pub fn refresh(&mut self, reader: &mut CompletionLogReader) -> Result<usize, CompletionLogError> {
        let before = self.ids.len();
        self.ids.extend(reader.scan()?);
        Ok(self.ids.len() - before)
    }

    /// Records a locally completed test. Returns true if it wasn't already present.
    pub fn insert(&mut self, id: TestId) -> bool {
        self.ids.insert(id)
    }

    /// Returns true if `id` has completed.
    pub fn contains(&self, id: &TestId) -> bool {
        self.ids.contains(id)
    }

    /// Returns true if every id in `ids` has completed.
    pub fn is_superset_of<'a>(&self, ids: impl IntoIterator<Item = &'a TestId>) -> bool {
        ids.into_iter().all(|id| self.ids.contains(id))
    }

    /// Returns the ids in `ids` that haven't completed yet.
    pub fn missing<'a>(&self, ids: impl IntoIterator<Item = &'a TestId>) -> BTreeSet<TestId> {
        ids.into_iter()
            .filter(|id| !self.ids.contains(*id))
            .cloned()
            .collect()
    }

    /// Returns the number of completed tests.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if no tests have completed.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterates over completed ids in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &TestId> {
        self.ids.iter()
    }
}
