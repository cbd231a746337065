// Copyright (c) The testplat Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-attempt results directories.
//!
//! Each retry run gets its own directory `<results>/Retries/<id>`, with one subdirectory per
//! attempt. Once the run is done, the last attempt's results are moved into `<results>`.

use crate::errors::RetryError;
use camino::{Utf8Path, Utf8PathBuf};
use rand::{RngExt, distr::Alphanumeric};
use std::io;
use tracing::debug;

/// The name of the directory that holds retry runs.
pub const RETRIES_DIR_NAME: &str = "Retries";

/// The number of times a fresh id is tried if the retries directory already exists.
const CREATE_ATTEMPTS: usize = 3;

const ID_LEN: usize = 8;

fn random_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| rng.sample(Alphanumeric) as char)
        .collect()
}

/// Creates a fresh, uniquely named directory under `<results_dir>/Retries`.
pub async fn create_retries_directory(results_dir: &Utf8Path) -> Result<Utf8PathBuf, RetryError> {
    create_unique_dir(&results_dir.join(RETRIES_DIR_NAME), random_id).await
}

async fn create_unique_dir(
    parent: &Utf8Path,
    mut next_id: impl FnMut() -> String,
) -> Result<Utf8PathBuf, RetryError> {
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|err| RetryError::CreateDir {
            path: parent.to_owned(),
            err,
        })?;

    let mut last_err = None;
    for _ in 0..CREATE_ATTEMPTS {
        let path = parent.join(next_id());
        match tokio::fs::create_dir(&path).await {
            Ok(()) => {
                debug!(%path, "created retries directory");
                return Ok(path);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!(%path, "retries directory already exists, trying another id");
                last_err = Some(err);
            }
            Err(err) => return Err(RetryError::CreateDir { path, err }),
        }
    }

    Err(RetryError::RetriesDirectoryCollision {
        parent: parent.to_owned(),
        attempts: CREATE_ATTEMPTS,
        err: last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AlreadyExists)),
    })
}

/// Creates the directory for attempt `index` (1-based) within a retries directory.
pub async fn create_attempt_directory(
    retries_dir: &Utf8Path,
    index: u32,
) -> Result<Utf8PathBuf, RetryError> {
    let path = retries_dir.join(index.to_string());
    tokio::fs::create_dir_all(&path)
        .await
        .map_err(|err| RetryError::CreateDir {
            path: path.clone(),
            err,
        })?;
    Ok(path)
}

/// Moves every file under `from` into the same relative location under `to`, replacing files
/// that already exist.
///
/// Returns the number of files moved.
pub async fn move_results(from: &Utf8Path, to: &Utf8Path) -> Result<usize, RetryError> {
    let mut moved = 0;
    let mut pending = vec![Utf8PathBuf::new()];

    while let Some(relative) = pending.pop() {
        let source_dir = from.join(&relative);
        let dest_dir = to.join(&relative);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|err| RetryError::CreateDir {
                path: dest_dir.clone(),
                err,
            })?;

        let mut entries = tokio::fs::read_dir(&source_dir)
            .await
            .map_err(|err| move_error(&source_dir, &dest_dir, err))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| move_error(&source_dir, &dest_dir, err))?
        {
            let file_name = entry.file_name();
            let file_name = file_name
                .to_str()
                .ok_or_else(|| RetryError::NonUtf8Path { path: entry.path() })?;
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| move_error(&source_dir, &dest_dir, err))?;

            if file_type.is_dir() {
                pending.push(relative.join(file_name));
            } else {
                let source = source_dir.join(file_name);
                let dest = dest_dir.join(file_name);
                tokio::fs::rename(&source, &dest)
                    .await
                    .map_err(|err| move_error(&source, &dest, err))?;
                debug!(%source, %dest, "moved result file");
                moved += 1;
            }
        }
    }

    Ok(moved)
}

fn move_error(from: &Utf8Path, to: &Utf8Path, err: io::Error) -> RetryError {
    RetryError::MoveResults {
        from: from.to_owned(),
        to: to.to_owned(),
        err,
    }
}
