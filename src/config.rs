//! Provisioning configuration loaded from a dotenv config source.

use crate::error::{ProvisionError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Config key holding the Azure subscription identifier (required)
pub const SUBSCRIPTION_ID_KEY: &str = "AZURE_SUBSCRIPTION_ID";

/// Config key holding the Azure region
pub const REGION_KEY: &str = "AZURE_LOCATION";

/// Config key holding the VM size SKU
pub const VM_SIZE_KEY: &str = "AZURE_VM_SIZE";

pub const DEFAULT_REGION: &str = "eastus";

/// T4 GPU SKU, the smallest size that runs HaMeR inference comfortably
pub const DEFAULT_VM_SIZE: &str = "Standard_NC4as_T4_v3";

/// Config source read when no `--env-file` is given
pub const DEFAULT_ENV_FILE: &str = ".env";

const KNOWN_KEYS: [&str; 3] = [SUBSCRIPTION_ID_KEY, REGION_KEY, VM_SIZE_KEY];

/// Typed configuration for one provisioning run.
///
/// Built once by [`ConfigLoader`] and passed by value to every later stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningConfig {
    pub subscription_id: String,
    pub region: String,
    pub vm_size: String,
}

impl ProvisioningConfig {
    /// Config with the given subscription and default region / VM size
    #[must_use]
    pub fn new(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            region: DEFAULT_REGION.to_string(),
            vm_size: DEFAULT_VM_SIZE.to_string(),
        }
    }

    /// Build from already-collected key/value pairs.
    ///
    /// `source_path` is only used to point the operator at the file to fix.
    pub fn from_values(values: &HashMap<String, String>, source_path: &Path) -> Result<Self> {
        let lookup = |key: &str| {
            values
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let subscription_id =
            lookup(SUBSCRIPTION_ID_KEY).ok_or_else(|| ProvisionError::MissingRequiredField {
                key: SUBSCRIPTION_ID_KEY,
                source_path: source_path.to_path_buf(),
            })?;

        Ok(Self {
            subscription_id,
            region: lookup(REGION_KEY).unwrap_or_else(|| DEFAULT_REGION.to_string()),
            vm_size: lookup(VM_SIZE_KEY).unwrap_or_else(|| DEFAULT_VM_SIZE.to_string()),
        })
    }

    /// Subscription id with everything but the last four characters hidden
    #[must_use]
    pub fn masked_subscription_id(&self) -> String {
        let chars: Vec<char> = self.subscription_id.chars().collect();
        let visible = chars.len().min(4);
        let hidden = chars.len() - visible;
        let tail: String = chars[hidden..].iter().collect();
        format!("{}{tail}", "*".repeat(hidden))
    }
}

/// Reads a [`ProvisioningConfig`] from a dotenv file.
///
/// The process environment is never modified, but it is always read for
/// `$VAR` / `${VAR}` substitution inside unquoted and double-quoted values.
/// Single-quoted values are taken literally. When `process_env_override` is
/// enabled, a non-empty process variable with a known key also wins over the
/// file value.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    path: PathBuf,
    process_env_override: bool,
}

impl ConfigLoader {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            process_env_override: false,
        }
    }

    #[must_use]
    pub fn with_process_env(mut self, enabled: bool) -> Self {
        self.process_env_override = enabled;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the config source exists at all
    #[must_use]
    pub fn source_exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn load(&self) -> Result<ProvisioningConfig> {
        if !self.source_exists() {
            return Err(ProvisionError::MissingConfigSource(self.path.clone()));
        }

        let mut values = self.read_source()?;

        if self.process_env_override {
            for key in KNOWN_KEYS {
                if let Ok(value) = std::env::var(key) {
                    if !value.trim().is_empty() {
                        values.insert(key.to_string(), value);
                    }
                }
            }
        }

        ProvisioningConfig::from_values(&values, &self.path)
    }

    fn read_source(&self) -> Result<HashMap<String, String>> {
        let invalid = |reason: String| ProvisionError::InvalidConfigSource {
            path: self.path.clone(),
            reason,
        };

        let iter = dotenvy::from_path_iter(&self.path).map_err(|e| invalid(e.to_string()))?;

        let mut values = HashMap::new();
        for item in iter {
            let (key, value) = item.map_err(|e| invalid(e.to_string()))?;
            values.insert(key, value);
        }
        Ok(values)
    }
}
