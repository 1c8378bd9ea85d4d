//! Existence checks for the local artifacts the provisioned VM depends on

use crate::error::{ProvisionError, Result};
use std::path::{Path, PathBuf};

/// A file that must exist in the project directory before provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredArtifact {
    pub name: &'static str,
    pub relative_path: &'static str,
}

impl RequiredArtifact {
    #[must_use]
    pub fn path_in(&self, project_dir: &Path) -> PathBuf {
        project_dir.join(self.relative_path)
    }
}

/// Artifacts checked before any mutation, in declaration order.
pub const REQUIRED_ARTIFACTS: &[RequiredArtifact] = &[
    RequiredArtifact {
        name: "entry point",
        relative_path: "video_to_mesh.py",
    },
    RequiredArtifact {
        name: "HaMeR checkpoint",
        relative_path: "_DATA/hamer_ckpts/checkpoints/hamer.ckpt",
    },
    RequiredArtifact {
        name: "MANO right-hand model",
        relative_path: "_DATA/data/mano/MANO_RIGHT.pkl",
    },
];

/// Fail on the first missing artifact.
///
/// Later artifacts are not inspected once one is missing.
pub fn validate(project_dir: &Path, artifacts: &[RequiredArtifact]) -> Result<()> {
    for artifact in artifacts {
        let path = artifact.path_in(project_dir);
        if !path.exists() {
            return Err(ProvisionError::MissingArtifact(path));
        }
    }
    Ok(())
}

/// Presence of every artifact, for reporting without failing
#[must_use]
pub fn survey(project_dir: &Path, artifacts: &[RequiredArtifact]) -> Vec<(RequiredArtifact, bool)> {
    artifacts
        .iter()
        .map(|artifact| (*artifact, artifact.path_in(project_dir).exists()))
        .collect()
}
