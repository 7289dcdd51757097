//! File-backed settings storage
//!
//! Mirrors how the settings file is handled on flash filesystems: at most
//! [`MAX_CONFIG_SIZE`] bytes are read and the write truncates the file.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::string::{String, ToString};

use super::ConfigStorage;
use crate::error::ConfigError;

/// Largest settings document read back from disk
pub const MAX_CONFIG_SIZE: usize = 255;

pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigStorage for FileStorage {
    fn load(&self) -> Result<Option<String>, ConfigError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::trace!("no config file present {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(ConfigError::StorageError(e.to_string())),
        };

        let mut buf = [0u8; MAX_CONFIG_SIZE];
        let mut len = 0;
        let mut reader = file.take(MAX_CONFIG_SIZE as u64);
        loop {
            match reader.read(&mut buf[len..]) {
                Ok(0) => break,
                Ok(n) => len += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(ConfigError::StorageError(e.to_string())),
            }
        }

        let text = core::str::from_utf8(&buf[..len])
            .map_err(|_| ConfigError::storage_error("config file is not UTF-8"))?;
        Ok(Some(String::from(text)))
    }

    fn save(&mut self, contents: &str) -> Result<(), ConfigError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| ConfigError::StorageError(e.to_string()))?;

        log::trace!("saving config len={}: {}", contents.len(), contents);
        file.write_all(contents.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| ConfigError::StorageError(e.to_string()))
    }

    fn exists(&self) -> bool {
        fs::metadata(&self.path).is_ok()
    }
}
