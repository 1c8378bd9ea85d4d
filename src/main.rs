use anyhow::Result;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use termcolor::{BufferWriter, Color, ColorChoice, ColorSpec, WriteColor};

use hamer_provision::artifacts::DEFAULT_OUTPUT_DIR;
use hamer_provision::config::DEFAULT_ENV_FILE;
use hamer_provision::credentials::KeypairStatus;
use hamer_provision::orchestrator::{ArtifactStep, CredentialStep, ToolchainStep};
use hamer_provision::preconditions::REQUIRED_ARTIFACTS;
use hamer_provision::toolchain::ToolAction;
use hamer_provision::{
    BrewFormula, ConfigLoader, Homebrew, Keypair, Orchestrator, RunOptions, RunReport, SshKeygen,
    error, show,
};

// ============================================================================
// ERROR HANDLING STRATEGY
// ============================================================================
//
// CRITICAL I/O is propagated by the library and surfaces here as a
// StageFailure: we print it and exit non-zero.
//
// DECORATIVE I/O (colours, status lines) ignores errors with `let _ =` so a
// closed stdout or missing TTY never turns a successful run into a failure.
// ============================================================================

#[derive(Parser)]
#[command(name = "hamer-provision")]
#[command(version, about = "Prepare the Terraform bundle for the HaMeR inference VM")]
struct Cli {
    /// Config source with AZURE_SUBSCRIPTION_ID, AZURE_LOCATION, AZURE_VM_SIZE
    #[arg(long, default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Directory holding video_to_mesh.py and _DATA/
    #[arg(long, default_value = ".")]
    project_dir: PathBuf,

    /// Where main.tf, cloud-init.sh and terraform.tfvars are written
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output_dir: PathBuf,

    /// Private key path (defaults to ~/.ssh/hamer_azure)
    #[arg(long)]
    key_path: Option<PathBuf>,

    /// Do not install or upgrade brew / terraform
    #[arg(long)]
    skip_toolchain: bool,

    /// Show current state and exit
    #[arg(long, conflicts_with = "dry_run")]
    show: bool,

    /// Validate and render without generating keys, installing tools or writing files
    #[arg(long)]
    dry_run: bool,

    /// Verbose output
    #[arg(long, short = 'v')]
    verbose: bool,
}

/// Expand a leading `~`, refusing to guess when HOME is unset
fn expand_tilde(path: &std::path::Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::tilde(&raw).to_string();
    if raw.starts_with('~') && expanded.starts_with('~') {
        anyhow::bail!(
            "Could not expand ~ in {raw} (HOME environment variable not set).\n\
             Please use an absolute path instead."
        );
    }
    Ok(PathBuf::from(expanded))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The default location needs HOME; resolve it only once credentials are ensured.
    let keypair = cli
        .key_path
        .as_deref()
        .map(expand_tilde)
        .transpose()?
        .map(Keypair::at);

    let brew = Homebrew;
    let terraform = BrewFormula::terraform();

    let orchestrator = Orchestrator {
        config_loader: ConfigLoader::new(expand_tilde(&cli.env_file)?).with_process_env(true),
        project_dir: expand_tilde(&cli.project_dir)?,
        required_artifacts: REQUIRED_ARTIFACTS,
        keypair,
        key_generator: &SshKeygen,
        prerequisite: &brew,
        tool: &terraform,
        output_dir: expand_tilde(&cli.output_dir)?,
        options: RunOptions {
            verbose: cli.verbose,
            dry_run: cli.dry_run,
            skip_toolchain: cli.skip_toolchain,
        },
    };

    if cli.show {
        show::print_state(&show::collect_state(&orchestrator));
        return Ok(());
    }

    print_banner(cli.dry_run);

    match orchestrator.run() {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(failure) => {
            error!("Provisioning stopped while {}", failure.stage);
            let bufwtr = BufferWriter::stderr(ColorChoice::Auto);
            let mut buffer = bufwtr.buffer();
            let _ = writeln!(&mut buffer, "   [{:?}] {}", failure.kind(), failure.error);
            let _ = writeln!(&mut buffer, "   Fix the problem above and re-run; completed steps are skipped.");
            let _ = bufwtr.print(&buffer);
            std::process::exit(1);
        }
    }
}

fn print_banner(dry_run: bool) {
    let bufwtr = BufferWriter::stdout(ColorChoice::Auto);
    let mut buffer = bufwtr.buffer();
    let _ = writeln!(&mut buffer, "{}", "=".repeat(60));
    let _ = writeln!(&mut buffer, "🚀 HaMeR VM Provisioning{}", if dry_run { " (dry run)" } else { "" });
    let _ = writeln!(&mut buffer, "{}", "=".repeat(60));
    let _ = bufwtr.print(&buffer);
}

fn print_report(report: &RunReport) {
    let bufwtr = BufferWriter::stdout(ColorChoice::Auto);
    let mut buffer = bufwtr.buffer();

    match &report.credentials {
        CredentialStep::Planned(KeypairStatus::Absent) => {
            let _ = writeln!(&mut buffer, "\n🔑 Would generate SSH key");
        }
        CredentialStep::Planned(_) | CredentialStep::Ensured(_) => {}
    }

    match &report.toolchain {
        ToolchainStep::Skipped => {
            let _ = writeln!(&mut buffer, "\n🧰 Toolchain check skipped");
        }
        ToolchainStep::Probed(state) if !state.tool.present || !state.prerequisite.present => {
            let _ = writeln!(
                &mut buffer,
                "\n🧰 Would install: {}",
                [&state.prerequisite, &state.tool]
                    .iter()
                    .filter(|t| !t.present)
                    .map(|t| t.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        ToolchainStep::Ensured(toolchain) => {
            if let ToolAction::UpgradeFailed(_) = toolchain.tool {
                let _ = writeln!(&mut buffer, "\n🧰 Continuing with the installed {}", toolchain.state.tool.name);
            }
            if let Some(version) = &toolchain.state.tool.version {
                let _ = writeln!(&mut buffer, "\n🧰 {version}");
            }
        }
        ToolchainStep::Probed(_) => {}
    }

    let _ = writeln!(&mut buffer, "\n📄 Terraform artifacts:");
    match &report.artifacts {
        ArtifactStep::Written(set) => {
            for artifact in &set.artifacts {
                let _ = buffer.set_color(ColorSpec::new().set_fg(Some(Color::Green)));
                let _ = write!(&mut buffer, "✓ ");
                let _ = buffer.reset();
                let _ = writeln!(
                    &mut buffer,
                    "{}  sha256:{}",
                    artifact.path.display(),
                    &artifact.sha256[..12]
                );
            }
        }
        ArtifactStep::Planned(planned) => {
            for artifact in planned {
                let status = if artifact.unchanged { "unchanged" } else { "would write" };
                let _ = writeln!(&mut buffer, "   {} ({status})", artifact.path.display());
            }
        }
    }

    if report.is_dry_run() {
        let _ = writeln!(&mut buffer, "\n🔍 {}", report.headline());
    } else {
        let _ = buffer.set_color(ColorSpec::new().set_fg(Some(Color::Green)));
        let _ = writeln!(&mut buffer, "\n✅ {}", report.headline());
        let _ = buffer.reset();
    }
    let _ = writeln!(&mut buffer, "   SSH key: {}", report.keypair.private_key_path().display());
    let _ = writeln!(&mut buffer, "   Public key: {}", report.keypair.public_key_path().display());

    if report.is_dry_run() {
        let _ = writeln!(&mut buffer, "\n📦 Next steps after a real run:");
    } else {
        let _ = writeln!(&mut buffer, "\n📦 Next steps:");
    }
    for command in &report.next_steps {
        let _ = writeln!(&mut buffer, "   {command}");
    }
    let _ = bufwtr.print(&buffer);
}
