use alloc::string::String;

use super::ConfigStorage;
use crate::error::ConfigError;

/// Settings document kept in RAM
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    contents: Option<String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: &str) -> Self {
        Self {
            contents: Some(String::from(contents)),
        }
    }

    pub fn contents(&self) -> Option<&str> {
        self.contents.as_deref()
    }
}

impl ConfigStorage for MemoryStorage {
    fn load(&self) -> Result<Option<String>, ConfigError> {
        Ok(self.contents.clone())
    }

    fn save(&mut self, contents: &str) -> Result<(), ConfigError> {
        self.contents = Some(String::from(contents));
        Ok(())
    }

    fn exists(&self) -> bool {
        self.contents.is_some()
    }
}
