//! File-backed [`UuidStore`].

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use homebus_app::ports::UuidStore;
use homebus_domain::error::BusError;
use homebus_domain::uuid_map::UuidMap;

use crate::error::StorageError;

/// Stores the uuid map of one agent in a single JSON file.
#[derive(Debug, Clone)]
pub struct JsonUuidStore {
    path: PathBuf,
}

impl JsonUuidStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(suffix);
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read(&self) -> Result<UuidMap, StorageError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no uuid map yet");
                return Ok(UuidMap::new());
            }
            Err(err) => return Err(self.io_error(err)),
        };
        match serde_json::from_slice::<UuidMap>(&raw) {
            Ok(map) => {
                tracing::debug!(path = %self.path.display(), entries = map.len(), "uuid map loaded");
                Ok(map)
            }
            Err(source) => {
                let moved_to = self.sibling(".corrupt");
                fs::rename(&self.path, &moved_to).map_err(|err| self.io_error(err))?;
                Err(StorageError::Corrupt {
                    path: self.path.clone(),
                    moved_to,
                    source,
                })
            }
        }
    }

    fn write(&self, map: &UuidMap) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        let payload = serde_json::to_vec_pretty(map)?;
        let tmp = self.sibling(".tmp");
        let mut file = File::create(&tmp).map_err(|err| self.io_error(err))?;
        file.write_all(&payload)
            .and_then(|()| file.sync_all())
            .map_err(|err| self.io_error(err))?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|err| self.io_error(err))?;
        tracing::trace!(path = %self.path.display(), entries = map.len(), "uuid map saved");
        Ok(())
    }
}

impl UuidStore for JsonUuidStore {
    fn load(&self) -> Result<UuidMap, BusError> {
        Ok(self.read()?)
    }

    fn save(&self, map: &UuidMap) -> Result<(), BusError> {
        Ok(self.write(map)?)
    }
}
