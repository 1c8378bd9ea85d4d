//! Error types for the provisioning run.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Coarse classification of a [`ProvisionError`], used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingConfigSource,
    InvalidConfigSource,
    MissingRequiredField,
    MissingArtifact,
    KeyGenerationFailed,
    PrerequisiteInstallFailed,
    ToolInstallFailed,
    TemplateRender,
    ArtifactWriteFailed,
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(
        "Config source not found: {}\n   \
         Create it with {}=<id> and optionally {} and {}",
        .0.display(),
        crate::config::SUBSCRIPTION_ID_KEY,
        crate::config::REGION_KEY,
        crate::config::VM_SIZE_KEY
    )]
    MissingConfigSource(PathBuf),

    #[error("Config source {} could not be parsed: {reason}", path.display())]
    InvalidConfigSource { path: PathBuf, reason: String },

    #[error("Missing required configuration: {key}\n   Add `{key}=<value>` to {}", source_path.display())]
    MissingRequiredField { key: &'static str, source_path: PathBuf },

    #[error("Required artifact not found: {}\n   Place it there before provisioning", .0.display())]
    MissingArtifact(PathBuf),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Package manager `{tool}` could not be installed: {reason}")]
    PrerequisiteInstallFailed { tool: String, reason: String },

    #[error("`{tool}` could not be installed: {reason}")]
    ToolInstallFailed { tool: String, reason: String },

    #[error("Failed to render template {template}: {reason}")]
    TemplateRender { template: &'static str, reason: String },

    #[error("Failed to write {}: {source}", path.display())]
    ArtifactWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingConfigSource(_) => ErrorKind::MissingConfigSource,
            Self::InvalidConfigSource { .. } => ErrorKind::InvalidConfigSource,
            Self::MissingRequiredField { .. } => ErrorKind::MissingRequiredField,
            Self::MissingArtifact(_) => ErrorKind::MissingArtifact,
            Self::KeyGenerationFailed(_) => ErrorKind::KeyGenerationFailed,
            Self::PrerequisiteInstallFailed { .. } => ErrorKind::PrerequisiteInstallFailed,
            Self::ToolInstallFailed { .. } => ErrorKind::ToolInstallFailed,
            Self::TemplateRender { .. } => ErrorKind::TemplateRender,
            Self::ArtifactWriteFailed { .. } => ErrorKind::ArtifactWriteFailed,
        }
    }

    pub(crate) fn write_failed(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ArtifactWriteFailed {
            path: path.into(),
            source,
        }
    }
}
