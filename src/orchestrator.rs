//! Single-pass provisioning run
//!
//! ```text
//! LoadingConfig -> ValidatingPreconditions -> EnsuringCredentials
//!     -> EnsuringToolchain -> GeneratingArtifacts -> Done
//! ```
//!
//! Any stage may end the run with a [`StageFailure`]. Nothing is retried; the
//! operator re-runs the whole thing, which is safe because every mutating stage
//! probes before it acts.

use crate::artifacts::{ArtifactGenerator, GeneratedArtifactSet, Template, render_all, sha256_hex};
use crate::config::{ConfigLoader, ProvisioningConfig};
use crate::credentials::{
    CredentialOutcome, KeyGenerator, Keypair, KeypairStatus, check_keypair, ensure_keypair,
};
use crate::error::{ErrorKind, ProvisionError};
use crate::preconditions::{self, RequiredArtifact};
use crate::toolchain::{Toolchain, ToolchainReport, ToolchainState, ensure_toolchain};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Position in the provisioning state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadingConfig,
    ValidatingPreconditions,
    EnsuringCredentials,
    EnsuringToolchain,
    GeneratingArtifacts,
    Done,
}

impl Stage {
    /// Stage that follows a successful `self`; `None` once done
    #[must_use]
    pub fn next(self) -> Option<Stage> {
        match self {
            Self::LoadingConfig => Some(Self::ValidatingPreconditions),
            Self::ValidatingPreconditions => Some(Self::EnsuringCredentials),
            Self::EnsuringCredentials => Some(Self::EnsuringToolchain),
            Self::EnsuringToolchain => Some(Self::GeneratingArtifacts),
            Self::GeneratingArtifacts => Some(Self::Done),
            Self::Done => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::LoadingConfig => "loading configuration",
            Self::ValidatingPreconditions => "validating required artifacts",
            Self::EnsuringCredentials => "ensuring SSH credentials",
            Self::EnsuringToolchain => "ensuring toolchain",
            Self::GeneratingArtifacts => "generating Terraform artifacts",
            Self::Done => "done",
        };
        f.write_str(label)
    }
}

/// Terminal failure: the stage that was running and what went wrong
#[derive(Debug, Error)]
#[error("{stage} failed: {error}")]
pub struct StageFailure {
    pub stage: Stage,
    #[source]
    pub error: ProvisionError,
}

impl StageFailure {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Flags controlling one run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub verbose: bool,
    /// Probe and render only; no key generation, installs or writes
    pub dry_run: bool,
    pub skip_toolchain: bool,
}

/// Result of the credentials stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStep {
    Ensured(CredentialOutcome),
    /// Dry run: the keypair's observed status
    Planned(KeypairStatus),
}

/// Result of the toolchain stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolchainStep {
    Ensured(ToolchainReport),
    /// Dry run: observed state, nothing installed
    Probed(ToolchainState),
    Skipped,
}

/// A document a dry run would write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedArtifact {
    pub template: Template,
    pub path: PathBuf,
    pub sha256: String,
    /// On-disk copy already matches
    pub unchanged: bool,
}

/// Result of the artifact stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactStep {
    Written(GeneratedArtifactSet),
    Planned(Vec<PlannedArtifact>),
}

/// Everything a successful run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub config: ProvisioningConfig,
    pub keypair: Keypair,
    pub credentials: CredentialStep,
    pub toolchain: ToolchainStep,
    pub artifacts: ArtifactStep,
    /// Stages completed, in order, ending with [`Stage::Done`]
    pub stages: Vec<Stage>,
    pub next_steps: Vec<String>,
}

impl RunReport {
    /// Whether this was a dry run that only planned its writes
    #[must_use]
    pub fn is_dry_run(&self) -> bool {
        matches!(self.artifacts, ArtifactStep::Planned(_))
    }

    /// One-line outcome shown to the operator
    #[must_use]
    pub fn headline(&self) -> &'static str {
        if self.is_dry_run() {
            "Dry run complete, nothing was written"
        } else {
            "Provisioning bundle ready"
        }
    }
}

/// Commands the operator runs after a successful run
#[must_use]
pub fn next_steps(output_dir: &Path, keypair: &Keypair) -> Vec<String> {
    vec![
        format!("cd {}", output_dir.display()),
        "terraform init".to_string(),
        "terraform plan -out tfplan".to_string(),
        "terraform apply tfplan".to_string(),
        format!(
            "ssh -i {} {}@$(terraform output -raw public_ip_address)",
            keypair.private_key_path().display(),
            crate::artifacts::ADMIN_USERNAME
        ),
    ]
}

/// Wires the stages together over injected capabilities.
pub struct Orchestrator<'a> {
    pub config_loader: ConfigLoader,
    pub project_dir: PathBuf,
    pub required_artifacts: &'a [RequiredArtifact],
    /// `None` resolves `~/.ssh/hamer_azure` when credentials are ensured
    pub keypair: Option<Keypair>,
    pub key_generator: &'a dyn KeyGenerator,
    pub prerequisite: &'a dyn Toolchain,
    pub tool: &'a dyn Toolchain,
    pub output_dir: PathBuf,
    pub options: RunOptions,
}

impl Orchestrator<'_> {
    /// The configured keypair, or the default location under the home directory
    pub fn keypair(&self) -> crate::error::Result<Keypair> {
        match &self.keypair {
            Some(keypair) => Ok(keypair.clone()),
            None => Keypair::default_location(),
        }
    }

    pub fn run(&self) -> std::result::Result<RunReport, StageFailure> {
        let verbose = self.options.verbose;
        let mut stages = Vec::with_capacity(6);
        let mut stage = Stage::LoadingConfig;

        // Runs `f` as `stage`, records it, and moves `stage` forward.
        macro_rules! step {
            ($f:expr) => {{
                verbose!(verbose, "→ {stage}");
                let value = ($f).map_err(|error| StageFailure { stage, error })?;
                stages.push(stage);
                stage = stage.next().unwrap_or(Stage::Done);
                value
            }};
        }

        let config = step!(self.config_loader.load());
        verbose!(
            verbose,
            "subscription {} / {} / {}",
            config.masked_subscription_id(),
            config.region,
            config.vm_size
        );

        step!(preconditions::validate(&self.project_dir, self.required_artifacts));

        let (keypair, credentials) = step!(self.keypair().and_then(|keypair| {
            let credentials = if self.options.dry_run {
                check_keypair(&keypair).map(CredentialStep::Planned)
            } else {
                ensure_keypair(&keypair, self.key_generator, verbose).map(CredentialStep::Ensured)
            }?;
            Ok((keypair, credentials))
        }));

        let toolchain = step!(if self.options.skip_toolchain {
            Ok::<_, ProvisionError>(ToolchainStep::Skipped)
        } else if self.options.dry_run {
            Ok(ToolchainStep::Probed(ToolchainState::probe(
                self.prerequisite,
                self.tool,
            )))
        } else {
            ensure_toolchain(self.prerequisite, self.tool, verbose).map(ToolchainStep::Ensured)
        });

        let artifacts = step!(self.generate(&config, &keypair, verbose));

        stages.push(stage);
        debug_assert_eq!(stage, Stage::Done);

        Ok(RunReport {
            next_steps: next_steps(&self.output_dir, &keypair),
            config,
            keypair,
            credentials,
            toolchain,
            artifacts,
            stages,
        })
    }

    fn generate(
        &self,
        config: &ProvisioningConfig,
        keypair: &Keypair,
        verbose: bool,
    ) -> crate::error::Result<ArtifactStep> {
        let generator = ArtifactGenerator::new(&self.output_dir)?;

        if !self.options.dry_run {
            return generator
                .generate(config, keypair, verbose)
                .map(ArtifactStep::Written);
        }

        let rendered = render_all(generator.renderer(), config, keypair)?;
        let planned = Template::ALL
            .into_iter()
            .map(|template| {
                let path = generator.path_of(template);
                let contents = rendered.document(template);
                let unchanged = std::fs::read(&path)
                    .map(|existing| existing == contents.as_bytes())
                    .unwrap_or(false);
                PlannedArtifact {
                    template,
                    sha256: sha256_hex(contents.as_bytes()),
                    path,
                    unchanged,
                }
            })
            .collect();
        Ok(ArtifactStep::Planned(planned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::KeyMaterial;
    use crate::preconditions::REQUIRED_ARTIFACTS;
    use crate::toolchain::fake::FakeTool;
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingGenerator {
        calls: Cell<u32>,
    }

    impl KeyGenerator for CountingGenerator {
        fn generate(&self, _comment: &str) -> crate::error::Result<KeyMaterial> {
            self.calls.set(self.calls.get() + 1);
            Ok(KeyMaterial::new(b"private".to_vec(), b"ssh-rsa AAAA test\n".to_vec()))
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        generator: CountingGenerator,
        brew: FakeTool,
        terraform: FakeTool,
    }

    impl Fixture {
        fn new(env: Option<&str>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            if let Some(env) = env {
                std::fs::write(dir.path().join(".env"), env).unwrap();
            }
            for artifact in REQUIRED_ARTIFACTS {
                let path = artifact.path_in(dir.path());
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, b"x").unwrap();
            }
            Self {
                dir,
                generator: CountingGenerator::default(),
                brew: FakeTool::new("brew", true),
                terraform: FakeTool::new("terraform", true),
            }
        }

        fn orchestrator(&self, options: RunOptions) -> Orchestrator<'_> {
            Orchestrator {
                config_loader: ConfigLoader::new(self.dir.path().join(".env")),
                project_dir: self.dir.path().to_path_buf(),
                required_artifacts: REQUIRED_ARTIFACTS,
                keypair: Some(Keypair::at(self.dir.path().join("ssh").join("hamer_azure"))),
                key_generator: &self.generator,
                prerequisite: &self.brew,
                tool: &self.terraform,
                output_dir: self.dir.path().join("terraform"),
                options,
            }
        }
    }

    #[test]
    fn stages_advance_in_order() {
        let mut stage = Stage::LoadingConfig;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(
            seen,
            vec![
                Stage::LoadingConfig,
                Stage::ValidatingPreconditions,
                Stage::EnsuringCredentials,
                Stage::EnsuringToolchain,
                Stage::GeneratingArtifacts,
                Stage::Done,
            ]
        );
    }

    #[test]
    fn full_run_visits_every_stage() {
        let fixture = Fixture::new(Some("AZURE_SUBSCRIPTION_ID=abc-123\n"));
        let report = fixture.orchestrator(RunOptions::default()).run().unwrap();

        assert_eq!(report.stages.len(), 6);
        assert_eq!(report.stages.last(), Some(&Stage::Done));
        assert_eq!(
            report.credentials,
            CredentialStep::Ensured(CredentialOutcome::Generated)
        );
        assert!(matches!(report.toolchain, ToolchainStep::Ensured(_)));
        assert!(matches!(report.artifacts, ArtifactStep::Written(ref set) if set.artifacts.len() == 3));
        assert!(!report.is_dry_run());
        assert_eq!(report.headline(), "Provisioning bundle ready");
        assert_eq!(report.next_steps[1], "terraform init");
        assert!(report.next_steps[4].contains("hamer_azure"));
    }

    #[test]
    fn missing_subscription_stops_before_any_mutation() {
        let fixture = Fixture::new(Some("AZURE_LOCATION=westus\n"));
        let failure = fixture.orchestrator(RunOptions::default()).run().unwrap_err();

        assert_eq!(failure.stage, Stage::LoadingConfig);
        assert_eq!(failure.kind(), ErrorKind::MissingRequiredField);
        assert_eq!(fixture.generator.calls.get(), 0);
        assert_eq!(fixture.terraform.upgrades.get(), 0);
        assert!(!fixture.dir.path().join("terraform").exists());
    }

    #[test]
    fn default_key_location_is_not_resolved_before_config() {
        let fixture = Fixture::new(Some("AZURE_LOCATION=westus\n"));
        let mut orchestrator = fixture.orchestrator(RunOptions::default());
        orchestrator.keypair = None;

        let failure = orchestrator.run().unwrap_err();

        assert_eq!(failure.stage, Stage::LoadingConfig);
        assert_eq!(failure.kind(), ErrorKind::MissingRequiredField);
        assert_eq!(fixture.generator.calls.get(), 0);
    }

    #[test]
    fn missing_artifact_stops_before_credentials() {
        let fixture = Fixture::new(Some("AZURE_SUBSCRIPTION_ID=abc-123\n"));
        let checkpoint = REQUIRED_ARTIFACTS[1].path_in(fixture.dir.path());
        std::fs::remove_file(&checkpoint).unwrap();

        let failure = fixture.orchestrator(RunOptions::default()).run().unwrap_err();

        assert_eq!(failure.stage, Stage::ValidatingPreconditions);
        assert!(matches!(failure.error, ProvisionError::MissingArtifact(ref path) if *path == checkpoint));
        assert_eq!(fixture.generator.calls.get(), 0);
        assert!(!fixture.dir.path().join("ssh").exists());
        assert!(!fixture.dir.path().join("terraform").exists());
    }

    #[test]
    fn prerequisite_failure_stops_before_generation() {
        let mut fixture = Fixture::new(Some("AZURE_SUBSCRIPTION_ID=abc-123\n"));
        fixture.brew = FakeTool::new("brew", false);
        fixture.brew.install_ok = false;

        let failure = fixture.orchestrator(RunOptions::default()).run().unwrap_err();

        assert_eq!(failure.stage, Stage::EnsuringToolchain);
        assert_eq!(failure.kind(), ErrorKind::PrerequisiteInstallFailed);
        assert!(!fixture.dir.path().join("terraform").exists());
    }

    #[test]
    fn skip_toolchain_leaves_tools_alone() {
        let fixture = Fixture::new(Some("AZURE_SUBSCRIPTION_ID=abc-123\n"));
        let options = RunOptions {
            skip_toolchain: true,
            ..RunOptions::default()
        };
        let report = fixture.orchestrator(options).run().unwrap();

        assert_eq!(report.toolchain, ToolchainStep::Skipped);
        assert_eq!(fixture.terraform.upgrades.get(), 0);
        assert_eq!(fixture.brew.installs.get(), 0);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let mut fixture = Fixture::new(Some("AZURE_SUBSCRIPTION_ID=abc-123\n"));
        fixture.terraform = FakeTool::new("terraform", false);
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };

        let report = fixture.orchestrator(options).run().unwrap();

        assert!(report.is_dry_run());
        assert_eq!(report.headline(), "Dry run complete, nothing was written");
        assert_eq!(report.credentials, CredentialStep::Planned(KeypairStatus::Absent));
        assert!(matches!(report.toolchain, ToolchainStep::Probed(ref state) if !state.tool.present));
        match report.artifacts {
            ArtifactStep::Planned(ref planned) => {
                assert_eq!(planned.len(), 3);
                assert!(planned.iter().all(|p| !p.unchanged));
            }
            ArtifactStep::Written(_) => panic!("dry run wrote artifacts"),
        }
        assert_eq!(fixture.generator.calls.get(), 0);
        assert_eq!(fixture.terraform.installs.get(), 0);
        assert!(!fixture.dir.path().join("ssh").exists());
        assert!(!fixture.dir.path().join("terraform").exists());
    }

    #[test]
    fn dry_run_after_real_run_reports_unchanged() {
        let fixture = Fixture::new(Some("AZURE_SUBSCRIPTION_ID=abc-123\n"));
        fixture.orchestrator(RunOptions::default()).run().unwrap();

        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let report = fixture.orchestrator(options).run().unwrap();

        assert_eq!(report.credentials, CredentialStep::Planned(KeypairStatus::Present));
        match report.artifacts {
            ArtifactStep::Planned(planned) => assert!(planned.iter().all(|p| p.unchanged)),
            ArtifactStep::Written(_) => panic!("dry run wrote artifacts"),
        }
    }
}
