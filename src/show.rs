//! Display the current provisioning state without changing anything

use crate::artifacts::{Template, sha256_hex};
use crate::config::ProvisioningConfig;
use crate::credentials::KeypairStatus;
use crate::error::ProvisionError;
use crate::orchestrator::Orchestrator;
use crate::preconditions;
use crate::toolchain::{ToolState, ToolchainState};
use std::io::Write;
use std::path::PathBuf;
use termcolor::{Buffer, BufferWriter, Color, ColorChoice, ColorSpec, WriteColor};

/// Snapshot of everything a run would look at
#[derive(Debug)]
pub struct StateSummary {
    pub config_source: PathBuf,
    pub config: std::result::Result<ProvisioningConfig, ProvisionError>,
    /// Name, full path and presence of each required artifact
    pub artifacts: Vec<(&'static str, PathBuf, bool)>,
    /// Private key path and its status, or why the path is unknown
    pub keypair: std::result::Result<(PathBuf, KeypairStatus), ProvisionError>,
    pub toolchain: ToolchainState,
    /// Generated documents on disk with their SHA-256, `None` when absent
    pub generated: Vec<(PathBuf, Option<String>)>,
}

#[must_use]
pub fn collect_state(orchestrator: &Orchestrator<'_>) -> StateSummary {
    let artifacts = preconditions::survey(&orchestrator.project_dir, orchestrator.required_artifacts)
        .into_iter()
        .map(|(artifact, present)| {
            (
                artifact.name,
                artifact.path_in(&orchestrator.project_dir),
                present,
            )
        })
        .collect();

    let generated = Template::ALL
        .into_iter()
        .map(|template| {
            let path = orchestrator.output_dir.join(template.file_name());
            let digest = std::fs::read(&path).ok().map(|bytes| sha256_hex(&bytes));
            (path, digest)
        })
        .collect();

    StateSummary {
        config_source: orchestrator.config_loader.path().to_path_buf(),
        config: orchestrator.config_loader.load(),
        artifacts,
        keypair: orchestrator
            .keypair()
            .map(|keypair| (keypair.private_key_path().to_path_buf(), keypair.status())),
        toolchain: ToolchainState::probe(orchestrator.prerequisite, orchestrator.tool),
        generated,
    }
}

fn mark(buffer: &mut Buffer, ok: bool, line: &str) {
    let (color, symbol) = if ok {
        (Color::Green, "✅")
    } else {
        (Color::Red, "❌")
    };
    let _ = buffer.set_color(ColorSpec::new().set_fg(Some(color)));
    let _ = write!(buffer, "{symbol} ");
    let _ = buffer.reset();
    let _ = writeln!(buffer, "{line}");
}

fn tool_line(state: &ToolState) -> String {
    match (state.present, &state.version) {
        (true, Some(version)) => format!("{}: {version}", state.name),
        (true, None) => format!("{}: installed", state.name),
        (false, _) => format!("{}: not installed", state.name),
    }
}

/// Print `summary` to stdout
pub fn print_state(summary: &StateSummary) {
    let bufwtr = BufferWriter::stdout(ColorChoice::Auto);
    let mut buffer = bufwtr.buffer();

    let _ = writeln!(&mut buffer, "📋 Current Provisioning State\n");

    match &summary.config {
        Ok(config) => {
            mark(
                &mut buffer,
                true,
                &format!("Config: {}", summary.config_source.display()),
            );
            let _ = writeln!(&mut buffer, "   subscription: {}", config.masked_subscription_id());
            let _ = writeln!(&mut buffer, "   region:       {}", config.region);
            let _ = writeln!(&mut buffer, "   vm size:      {}", config.vm_size);
        }
        Err(e) => {
            mark(&mut buffer, false, "Config: not usable");
            let _ = writeln!(&mut buffer, "   {e}");
        }
    }

    let _ = writeln!(&mut buffer, "\nRequired artifacts:");
    for (name, path, present) in &summary.artifacts {
        mark(&mut buffer, *present, &format!("{name}: {}", path.display()));
    }

    let _ = writeln!(&mut buffer, "\nSSH key:");
    match &summary.keypair {
        Ok((path, status)) => {
            let key = path.display();
            match status {
                KeypairStatus::Present => mark(&mut buffer, true, &key.to_string()),
                KeypairStatus::Absent => {
                    mark(&mut buffer, false, &format!("{key} (will be generated)"));
                }
                KeypairStatus::Incomplete => {
                    let _ = buffer.set_color(ColorSpec::new().set_fg(Some(Color::Yellow)));
                    let _ = writeln!(&mut buffer, "⚠️  {key} (public key missing)");
                    let _ = buffer.reset();
                }
            }
        }
        Err(e) => mark(&mut buffer, false, &e.to_string()),
    }

    let _ = writeln!(&mut buffer, "\nToolchain:");
    for state in [&summary.toolchain.prerequisite, &summary.toolchain.tool] {
        mark(&mut buffer, state.present, &tool_line(state));
    }

    let _ = writeln!(&mut buffer, "\nGenerated artifacts:");
    for (path, digest) in &summary.generated {
        match digest {
            Some(digest) => mark(&mut buffer, true, &format!("{}  sha256:{digest}", path.display())),
            None => mark(&mut buffer, false, &format!("{} (not generated)", path.display())),
        }
    }

    let _ = bufwtr.print(&buffer);
}
