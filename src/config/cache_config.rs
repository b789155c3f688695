//! Cache settings file
//!
//! JSON with a top-level `CacheConfig` section:
//!
//! ```json
//! { "CacheConfig": { "Name": "contoso", "Password": "...", "ClusterMode": true,
//!                    "KeyPrefix": "Message", "NumberOfKeysToSet": 100,
//!                    "SetKeysFirst": false, "SearchPattern": "Message" } }
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::utils::CacheError;

/// Environment variable that overrides `CacheConfig.Password`
pub const PASSWORD_ENV: &str = "CACHE_PASSWORD";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CacheConfig {
    pub name: String,
    pub password: String,
    pub cluster_mode: bool,
    pub key_prefix: String,
    pub number_of_keys_to_set: u32,
    pub set_keys_first: bool,
    pub search_pattern: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            password: String::new(),
            cluster_mode: false,
            key_prefix: "Message".to_string(),
            number_of_keys_to_set: 100,
            set_keys_first: false,
            search_pattern: "Message".to_string(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SettingsFile {
    cache_config: CacheConfig,
}

impl CacheConfig {
    /// Parse the settings file contents
    pub fn from_json_str(json: &str) -> Result<Self, CacheError> {
        serde_json::from_str::<SettingsFile>(json)
            .map(|file| file.cache_config)
            .map_err(|e| CacheError::Config(format!("Invalid cache settings: {}", e)))
    }

    /// Load from a settings file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| CacheError::Config(format!("Failed to read {:?}: {}", path, e)))?;
        let mut config = Self::from_json_str(&json)?;
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            config.password = password;
        }
        Ok(config)
    }

    /// Server-side SCAN pattern for the configured search term
    pub fn scan_pattern(&self) -> String {
        format!("*{}*", self.search_pattern)
    }
}
