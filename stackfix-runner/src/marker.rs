// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Marker files recording which shared resources are currently provisioned.
//!
//! A marker lives at `<state_dir>/<resource_name>`. Its presence means "provisioned and not yet
//! destroyed", and its content is the working directory the resource was provisioned from, so a
//! destroyer in another process can find it. Creation and deletion happen under the marker's
//! sibling lock file (see [`lock_path_for`]).

use crate::{
    completion::COMPLETION_LOG_FILE_NAME,
    errors::MarkerError,
    identifier::ResourceName,
    lock::{FileLock, LOCK_EXTENSION, LockOptions, lock_path_for},
};
use atomicwrites::{AtomicFile, DisallowOverwrite};
use camino::{Utf8Path, Utf8PathBuf};
use std::{
    fs::{self, File},
    io::{self, Write},
};
use tracing::debug;

/// The result of [`create_if_absent`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CreateOutcome<T> {
    /// The marker didn't exist; the caller's writer ran and its output was published.
    Created(T),

    /// The marker already existed, with this content. The writer was never invoked.
    Existed(String),
}

impl<T> CreateOutcome<T> {
    /// Returns true if this caller created the marker.
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// The result of [`delete_if_present`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeleteOutcome<T> {
    /// The marker didn't exist, so nothing was done.
    Absent,

    /// The marker existed; the caller's body ran with its content and the marker was removed.
    Deleted(T),
}

impl<T> DeleteOutcome<T> {
    /// Returns true if this caller deleted the marker.
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted(_))
    }
}

/// Creates the marker at `path` if it doesn't exist.
///
/// A plain existence check is made first; if the marker is absent, the check is repeated under
/// the lock to close the race with concurrent creators. Among any number of concurrent callers,
/// at most one gets [`CreateOutcome::Created`].
///
/// `writer` populates the marker contents. They're written to a temporary file that is flushed
/// and published atomically once `writer` returns `Ok`, so other processes never observe a
/// partial marker. If `writer` fails, the marker stays absent and the error is returned.
pub fn create_if_absent<T, E>(
    path: &Utf8Path,
    options: &LockOptions,
    writer: impl FnOnce(&mut File) -> Result<T, E>,
) -> Result<CreateOutcome<T>, E>
where
    E: From<MarkerError>,
{
    if let Some(content) = read_marker(path)? {
        return Ok(CreateOutcome::Existed(content));
    }

    let _lock = FileLock::acquire(&lock_path_for(path), options).map_err(MarkerError::from)?;
    if let Some(content) = read_marker(path)? {
        return Ok(CreateOutcome::Existed(content));
    }

    let value = AtomicFile::new(path, DisallowOverwrite)
        .write(|file| {
            let value = writer(file)?;
            file.flush().map_err(|error| {
                E::from(MarkerError::Write {
                    path: path.to_owned(),
                    error,
                })
            })?;
            Ok(value)
        })
        .map_err(|error| match error {
            atomicwrites::Error::Internal(error) => E::from(MarkerError::Write {
                path: path.to_owned(),
                error,
            }),
            atomicwrites::Error::User(error) => error,
        })?;

    debug!("published marker {path}");
    Ok(CreateOutcome::Created(value))
}

/// Deletes the marker at `path` if it exists.
///
/// Under the lock, `body` receives the marker's content (the recorded working directory) so the
/// caller can destroy the underlying resource; the marker is removed only after `body` returns
/// `Ok`, inside the same critical section. If `body` fails the marker is left in place.
pub fn delete_if_present<T, E>(
    path: &Utf8Path,
    options: &LockOptions,
    body: impl FnOnce(&str) -> Result<T, E>,
) -> Result<DeleteOutcome<T>, E>
where
    E: From<MarkerError>,
{
    if !path.exists() {
        return Ok(DeleteOutcome::Absent);
    }

    let _lock = FileLock::acquire(&lock_path_for(path), options).map_err(MarkerError::from)?;
    let Some(content) = read_marker(path)? else {
        return Ok(DeleteOutcome::Absent);
    };

    let value = body(&content)?;
    fs::remove_file(path).map_err(|error| MarkerError::Remove {
        path: path.to_owned(),
        error,
    })?;

    debug!("removed marker {path}");
    Ok(DeleteOutcome::Deleted(value))
}

fn read_marker(path: &Utf8Path) -> Result<Option<String>, MarkerError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(MarkerError::Read {
            path: path.to_owned(),
            error,
        }),
    }
}

/// The set of markers in a shared state directory.
#[derive(Clone, Debug)]
pub struct MarkerStore {
    state_dir: Utf8PathBuf,
    options: LockOptions,
}

impl MarkerStore {
    /// Creates a marker store rooted at `state_dir`. The directory must already exist.
    pub fn new(state_dir: impl Into<Utf8PathBuf>, options: LockOptions) -> Self {
        Self {
            state_dir: state_dir.into(),
            options,
        }
    }

    /// Returns the state directory.
    pub fn state_dir(&self) -> &Utf8Path {
        &self.state_dir
    }

    /// Returns the lock options used for marker operations.
    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Returns the path of the marker for `name`.
    pub fn marker_path(&self, name: &ResourceName) -> Utf8PathBuf {
        self.state_dir.join(name.as_str())
    }

    /// Runs [`create_if_absent`] on the marker for `name`.
    pub fn create_if_absent<T, E>(
        &self,
        name: &ResourceName,
        writer: impl FnOnce(&mut File) -> Result<T, E>,
    ) -> Result<CreateOutcome<T>, E>
    where
        E: From<MarkerError>,
    {
        create_if_absent(&self.marker_path(name), &self.options, writer)
    }

    /// Runs [`delete_if_present`] on the marker for `name`.
    pub fn delete_if_present<T, E>(
        &self,
        name: &ResourceName,
        body: impl FnOnce(&str) -> Result<T, E>,
    ) -> Result<DeleteOutcome<T>, E>
    where
        E: From<MarkerError>,
    {
        delete_if_present(&self.marker_path(name), &self.options, body)
    }

    /// Reads the marker for `name` without locking, returning `None` if it's absent.
    pub fn read(&self, name: &ResourceName) -> Result<Option<String>, MarkerError> {
        read_marker(&self.marker_path(name))
    }

    /// Lists every marker currently present, sorted by name, along with its content.
    ///
    /// Lock files, the completion log, and hidden temporary files are skipped.
    pub fn list(&self) -> Result<Vec<(ResourceName, String)>, MarkerError> {
        let read_dir_err = |error| MarkerError::StateDirRead {
            path: self.state_dir.clone(),
            error,
        };

        let mut markers = Vec::new();
        for entry in self.state_dir.read_dir_utf8().map_err(read_dir_err)? {
            let entry = entry.map_err(read_dir_err)?;
            let file_name = entry.file_name();
            if file_name.starts_with('.')
                || file_name == COMPLETION_LOG_FILE_NAME
                || entry.path().extension() == Some(LOCK_EXTENSION)
                || !entry.file_type().map_err(read_dir_err)?.is_file()
            {
                continue;
            }
            // The marker may have been deleted between listing and reading it.
            if let Some(content) = read_marker(entry.path())? {
                markers.push((ResourceName::new(file_name), content));
            }
        }
        markers.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        Ok(markers)
    }
}
