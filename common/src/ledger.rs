// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities to help reading/writing JSON ledgers from/to multiple paths

use camino::{Utf8Path, Utf8PathBuf};
use serde::{de::DeserializeOwned, Serialize};
use slog::{debug, error, info, warn, Logger};
use slog_error_chain::InlineErrorChain;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Cannot serialize JSON to file {path}: {err}")]
    JsonSerialize {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::error::Error,
    },

    #[error("Cannot deserialize JSON from file {path}: {err}")]
    JsonDeserialize {
        path: Utf8PathBuf,
        #[source]
        err: serde_json::error::Error,
    },

    #[error("Failed to perform I/O: {message}")]
    Io {
        message: String,
        #[source]
        err: std::io::Error,
    },

    #[error("Failed to write the ledger to any path: {failed_paths:?}")]
    FailedToWrite { failed_paths: Vec<(Utf8PathBuf, String)> },
}

impl Error {
    fn io_path(path: &Utf8Path, err: std::io::Error) -> Self {
        Self::Io { message: format!("Error accessing {path}"), err }
    }
}

impl From<Error> for crate::api::external::Error {
    fn from(err: Error) -> crate::api::external::Error {
        crate::api::external::Error::unavail(&format!(
            "ledger: {}",
            InlineErrorChain::new(&err)
        ))
    }
}

/// Manage the serialization and deserialization of a ledger of information.
///
/// This structure is intended to help with serialization and deserialization
/// of configuration information to both one or more files.  On read, the newest
/// copy (by [`Ledgerable::is_newer_than`]) wins.  On write, every path is
/// written, and the commit succeeds if at least one write succeeded.
pub struct Ledger<T> {
    log: Logger,
    ledger: T,
    paths: Vec<Utf8PathBuf>,
}

impl<T: Ledgerable> Ledger<T> {
    /// Creates a ledger with a new initial value.
    pub fn new_with(log: &Logger, paths: Vec<Utf8PathBuf>, default: T) -> Self {
        Self { log: log.clone(), ledger: default, paths }
    }

    /// Reads the ledger from any of the provided `paths`.
    ///
    /// Returns the following, in order:
    /// - The ledger with the highest generation number
    /// - `None` if none of the paths could be read
    pub async fn new(log: &Logger, paths: Vec<Utf8PathBuf>) -> Option<Self> {
        // Read the ledgers from storage
        let mut ledger = None;
        for path in paths.iter() {
            match T::read_from(log, path).await {
                Ok(contents) => match &ledger {
                    Some(current) if !contents.is_newer_than(current) => {}
                    _ => ledger = Some(contents),
                },
                Err(err) => {
                    debug!(
                        log,
                        "Failed to read ledger";
                        "path" => %path,
                        InlineErrorChain::new(&err),
                    );
                }
            }
        }

        let ledger = ledger?;
        Some(Self { log: log.clone(), ledger, paths })
    }

    pub fn data(&self) -> &T {
        &self.ledger
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.ledger
    }

    pub fn into_inner(self) -> T {
        self.ledger
    }

    /// Writes the ledger back to all config directories.
    ///
    /// Succeeds if at least one of the writes succeeds.
    pub async fn commit(&mut self) -> Result<(), Error> {
        // Bump the generation number any time we want to commit the ledger.
        self.ledger.generation_bump();

        let mut failed_paths = vec![];
        let mut one_successful_write = false;
        for path in self.paths.iter() {
            if let Err(e) = self.atomic_write(&path).await {
                warn!(
                    self.log,
                    "Failed to write ledger";
                    "path" => %path,
                    InlineErrorChain::new(&e),
                );
                failed_paths.push((path.clone(), e.to_string()));
            } else {
                one_successful_write = true;
            }
        }

        if !one_successful_write {
            error!(self.log, "No successful writes to ledger");
            return Err(Error::FailedToWrite { failed_paths });
        }
        Ok(())
    }

    // Atomically serialize and write the ledger to storage.
    //
    // We accomplish this by first writing to a temporary file, then
    // renaming to the target destination.
    async fn atomic_write(&self, path: &Utf8Path) -> Result<(), Error> {
        let as_str = serde_json::to_string(&self.ledger).map_err(|err| {
            Error::JsonSerialize { path: path.to_path_buf(), err }
        })?;
        let tmp_path = path.with_extension("tmp");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| Error::io_path(parent, err))?;
        }
        tokio::fs::write(&tmp_path, as_str)
            .await
            .map_err(|err| Error::io_path(&tmp_path, err))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|err| Error::io_path(&path, err))?;
        Ok(())
    }
}

/// Data that can be kept in a [`Ledger`]
#[async_trait::async_trait]
pub trait Ledgerable: DeserializeOwned + Serialize + Send + Sync {
    /// Returns true if [Self] is newer than `other`.
    fn is_newer_than(&self, other: &Self) -> bool;

    /// Increments the generation number.
    fn generation_bump(&mut self);

    /// Reads from `path` as a json-serialized version of `Self`.
    async fn read_from(log: &Logger, path: &Utf8Path) -> Result<Self, Error> {
        if path.exists() {
            debug!(log, "Reading ledger from {}", path);
            <Self as Ledgerable>::deserialize(
                &tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|err| Error::io_path(&path, err))?,
            )
            .map_err(|err| Error::JsonDeserialize {
                path: path.to_path_buf(),
                err,
            })
        } else {
            info!(log, "No ledger in {path}");
            Err(Error::Io {
                message: format!("No ledger in {path}"),
                err: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Not found in storage",
                ),
            })
        }
    }

    /// Reads from a string which is a json-serialized version of `Self`.
    fn deserialize(s: &str) -> Result<Self, serde_json::error::Error> {
        serde_json::from_str(s)
    }
}
