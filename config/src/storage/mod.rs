// Configuration storage abstraction
// Provides trait for reading/writing the persisted settings document

#[cfg(feature = "std")]
pub mod file;
pub mod memory;

use crate::error::ConfigError;
use crate::json::ConfigUpdate;
use alloc::string::String;

/// Trait for configuration storage backends
pub trait ConfigStorage {
    /// Load the stored settings document
    /// Returns Ok(None) if no configuration exists
    fn load(&self) -> Result<Option<String>, ConfigError>;

    /// Replace the stored settings document
    fn save(&mut self, contents: &str) -> Result<(), ConfigError>;

    /// Check if configuration exists in storage
    fn exists(&self) -> bool;
}

/// Load and decode the stored settings document
///
/// # Returns
/// * `Ok(Some(update))` - A document was present and decoded
/// * `Ok(None)` - Nothing is stored
/// * `Err(ConfigError)` - The stored document is unreadable or malformed
pub fn load_update(storage: &dyn ConfigStorage) -> Result<Option<ConfigUpdate>, ConfigError> {
    let Some(text) = storage.load()? else {
        return Ok(None);
    };

    if text.len() <= 2 || !text.starts_with('{') {
        return Err(ConfigError::parse_error("config appears to be invalid"));
    }

    log::trace!("loading config: {}", text);
    ConfigUpdate::from_json(&text).map(Some)
}
