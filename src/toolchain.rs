//! Package manager and Terraform CLI availability
//!
//! Every external tool sits behind the [`Toolchain`] trait. Presence is always
//! probed before acting, and tools are only ever moved toward "installed".

use crate::error::{ProvisionError, Result};
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;

/// Official Homebrew installer, run non-interactively
const HOMEBREW_INSTALL_SCRIPT: &str =
    "curl -fsSL https://raw.githubusercontent.com/Homebrew/install/HEAD/install.sh";

/// Places `brew` lands in when the installer did not put it on PATH
const HOMEBREW_PREFIXES: &[&str] = &[
    "/opt/homebrew/bin/brew",
    "/usr/local/bin/brew",
    "/home/linuxbrew/.linuxbrew/bin/brew",
];

/// A failed external command
#[derive(Debug, Error)]
#[error("`{command}` failed: {reason}")]
pub struct CommandFailure {
    pub command: String,
    pub reason: String,
}

/// An external CLI dependency that can be probed, installed and upgraded.
pub trait Toolchain {
    fn name(&self) -> &str;

    fn is_present(&self) -> bool;

    /// First line of the tool's version output, when it can be queried
    fn version(&self) -> Option<String>;

    fn install(&self) -> std::result::Result<(), CommandFailure>;

    fn upgrade(&self) -> std::result::Result<(), CommandFailure>;
}

fn run(program: &std::ffi::OsStr, args: &[&str]) -> std::result::Result<(), CommandFailure> {
    let command = format!("{} {}", program.to_string_lossy(), args.join(" "));
    let output = Command::new(program)
        .args(args)
        .env("NONINTERACTIVE", "1")
        .env("HOMEBREW_NO_ENV_HINTS", "1")
        .output()
        .map_err(|e| CommandFailure {
            command: command.clone(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CommandFailure {
            command,
            reason: format!("{}: {}", output.status, stderr.trim()),
        });
    }
    Ok(())
}

fn first_line(program: &std::ffi::OsStr, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
}

/// The Homebrew package manager
#[derive(Debug, Default, Clone, Copy)]
pub struct Homebrew;

impl Homebrew {
    /// Path to `brew`, from PATH or a standard install prefix
    #[must_use]
    pub fn locate(&self) -> Option<PathBuf> {
        if let Ok(path) = which::which("brew") {
            return Some(path);
        }
        HOMEBREW_PREFIXES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
    }

    fn brew(&self, args: &[&str]) -> std::result::Result<(), CommandFailure> {
        let brew = self.locate().ok_or_else(|| CommandFailure {
            command: format!("brew {}", args.join(" ")),
            reason: "brew not found in PATH or standard prefixes".to_string(),
        })?;
        run(brew.as_os_str(), args)
    }
}

impl Toolchain for Homebrew {
    fn name(&self) -> &str {
        "brew"
    }

    fn is_present(&self) -> bool {
        self.locate().is_some()
    }

    fn version(&self) -> Option<String> {
        first_line(self.locate()?.as_os_str(), &["--version"])
    }

    fn install(&self) -> std::result::Result<(), CommandFailure> {
        let script = format!("/bin/bash -c \"$({HOMEBREW_INSTALL_SCRIPT})\"");
        run(std::ffi::OsStr::new("/bin/bash"), &["-c", &script])
    }

    fn upgrade(&self) -> std::result::Result<(), CommandFailure> {
        self.brew(&["update"])
    }
}

/// A CLI installed as a Homebrew formula
#[derive(Debug, Clone, Copy)]
pub struct BrewFormula {
    pub binary: &'static str,
    pub tap: Option<&'static str>,
    pub formula: &'static str,
    pub version_args: &'static [&'static str],
    pub brew: Homebrew,
}

impl BrewFormula {
    /// `terraform` from HashiCorp's tap
    #[must_use]
    pub fn terraform() -> Self {
        Self {
            binary: "terraform",
            tap: Some("hashicorp/tap"),
            formula: "hashicorp/tap/terraform",
            version_args: &["version"],
            brew: Homebrew,
        }
    }

    /// Path to the binary, from PATH or next to `brew`
    #[must_use]
    pub fn locate(&self) -> Option<PathBuf> {
        if let Ok(path) = which::which(self.binary) {
            return Some(path);
        }
        self.brew
            .locate()
            .map(|brew| brew.with_file_name(self.binary))
            .filter(|path| path.is_file())
    }
}

impl Toolchain for BrewFormula {
    fn name(&self) -> &str {
        self.binary
    }

    fn is_present(&self) -> bool {
        self.locate().is_some()
    }

    fn version(&self) -> Option<String> {
        first_line(self.locate()?.as_os_str(), self.version_args)
    }

    fn install(&self) -> std::result::Result<(), CommandFailure> {
        if let Some(tap) = self.tap {
            self.brew.brew(&["tap", tap])?;
        }
        self.brew.brew(&["install", self.formula])
    }

    fn upgrade(&self) -> std::result::Result<(), CommandFailure> {
        self.brew.brew(&["upgrade", self.formula])
    }
}

/// Observed state of one tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolState {
    pub name: String,
    pub present: bool,
    pub version: Option<String>,
}

impl ToolState {
    #[must_use]
    pub fn probe(tool: &dyn Toolchain) -> Self {
        let present = tool.is_present();
        Self {
            name: tool.name().to_string(),
            present,
            version: if present { tool.version() } else { None },
        }
    }
}

/// Package manager plus the tool installed through it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainState {
    pub prerequisite: ToolState,
    pub tool: ToolState,
}

impl ToolchainState {
    #[must_use]
    pub fn probe(prerequisite: &dyn Toolchain, tool: &dyn Toolchain) -> Self {
        Self {
            prerequisite: ToolState::probe(prerequisite),
            tool: ToolState::probe(tool),
        }
    }
}

/// What happened to one tool during [`ensure_toolchain`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolAction {
    AlreadyPresent,
    Installed,
    Upgraded,
    /// Upgrade failed but the existing installation was kept
    UpgradeFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainReport {
    pub prerequisite: ToolAction,
    pub tool: ToolAction,
    pub state: ToolchainState,
}

/// Make sure `prerequisite` and then `tool` are installed.
///
/// A missing prerequisite that cannot be installed is fatal. A present tool is
/// upgraded on a best-effort basis: upgrade failures only produce a warning.
pub fn ensure_toolchain(
    prerequisite: &dyn Toolchain,
    tool: &dyn Toolchain,
    verbose: bool,
) -> Result<ToolchainReport> {
    let prerequisite_action = if prerequisite.is_present() {
        verbose!(verbose, "{} already installed", prerequisite.name());
        ToolAction::AlreadyPresent
    } else {
        println!("📦 Installing {}...", prerequisite.name());
        let failed = |reason: String| ProvisionError::PrerequisiteInstallFailed {
            tool: prerequisite.name().to_string(),
            reason,
        };
        prerequisite.install().map_err(|e| failed(e.to_string()))?;
        if !prerequisite.is_present() {
            return Err(failed("installer finished but the tool is still not found".to_string()));
        }
        success!("Installed {}", prerequisite.name());
        ToolAction::Installed
    };

    let tool_action = if tool.is_present() {
        verbose!(verbose, "{} present, checking for upgrades", tool.name());
        match tool.upgrade() {
            Ok(()) => {
                success!("{} is up to date", tool.name());
                ToolAction::Upgraded
            }
            Err(e) => {
                warn!("Could not upgrade {}, keeping existing installation", tool.name());
                verbose!(verbose, "{e}");
                ToolAction::UpgradeFailed(e.to_string())
            }
        }
    } else {
        println!("📦 Installing {}...", tool.name());
        let failed = |reason: String| ProvisionError::ToolInstallFailed {
            tool: tool.name().to_string(),
            reason,
        };
        tool.install().map_err(|e| failed(e.to_string()))?;
        if !tool.is_present() {
            return Err(failed("install finished but the binary is not on PATH".to_string()));
        }
        success!("Installed {}", tool.name());
        ToolAction::Installed
    };

    Ok(ToolchainReport {
        prerequisite: prerequisite_action,
        tool: tool_action,
        state: ToolchainState::probe(prerequisite, tool),
    })
}


#[cfg(test)]
mod tests {
    use super::fake::FakeTool;
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn installs_missing_prerequisite_then_tool() {
        let brew = FakeTool::new("brew", false);
        let terraform = FakeTool::new("terraform", false);

        let report = ensure_toolchain(&brew, &terraform, false).unwrap();

        assert_eq!(report.prerequisite, ToolAction::Installed);
        assert_eq!(report.tool, ToolAction::Installed);
        assert_eq!(brew.installs.get(), 1);
        assert_eq!(terraform.installs.get(), 1);
        assert_eq!(terraform.upgrades.get(), 0);
        assert!(report.state.tool.present);
        assert_eq!(report.state.tool.version.as_deref(), Some("terraform v1.0.0"));
    }

    #[test]
    fn present_tool_is_upgraded_not_reinstalled() {
        let brew = FakeTool::new("brew", true);
        let terraform = FakeTool::new("terraform", true);

        let report = ensure_toolchain(&brew, &terraform, false).unwrap();

        assert_eq!(report.prerequisite, ToolAction::AlreadyPresent);
        assert_eq!(report.tool, ToolAction::Upgraded);
        assert_eq!(brew.installs.get(), 0);
        assert_eq!(brew.upgrades.get(), 0);
        assert_eq!(terraform.installs.get(), 0);
        assert_eq!(terraform.upgrades.get(), 1);
    }

    #[test]
    fn upgrade_failure_is_not_fatal() {
        let brew = FakeTool::new("brew", true);
        let mut terraform = FakeTool::new("terraform", true);
        terraform.upgrade_ok = false;

        let report = ensure_toolchain(&brew, &terraform, false).unwrap();

        assert!(matches!(report.tool, ToolAction::UpgradeFailed(ref reason) if reason.contains("not installed via brew")));
        assert!(report.state.tool.present);
    }

    #[test]
    fn prerequisite_install_failure_is_fatal() {
        let mut brew = FakeTool::new("brew", false);
        brew.install_ok = false;
        let terraform = FakeTool::new("terraform", false);

        let err = ensure_toolchain(&brew, &terraform, false).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::PrerequisiteInstallFailed);
        assert!(err.to_string().contains("brew"));
        assert_eq!(terraform.installs.get(), 0);
    }

    #[test]
    fn prerequisite_still_missing_after_install_is_fatal() {
        let mut brew = FakeTool::new("brew", false);
        brew.install_makes_present = false;
        let terraform = FakeTool::new("terraform", true);

        let err = ensure_toolchain(&brew, &terraform, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrerequisiteInstallFailed);
        assert_eq!(terraform.upgrades.get(), 0);
    }

    #[test]
    fn tool_install_failure_is_fatal() {
        let brew = FakeTool::new("brew", true);
        let mut terraform = FakeTool::new("terraform", false);
        terraform.install_ok = false;

        let err = ensure_toolchain(&brew, &terraform, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ToolInstallFailed);
        assert!(err.to_string().contains("terraform"));
    }

    #[test]
    fn probe_skips_version_of_absent_tool() {
        let terraform = FakeTool::new("terraform", false);
        let state = ToolState::probe(&terraform);
        assert!(!state.present);
        assert_eq!(state.version, None);
    }
}
