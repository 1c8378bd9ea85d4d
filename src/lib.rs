//! Idempotent provisioning for the HaMeR GPU inference VM
//!
//! Prepares local preconditions (config, model artifacts, SSH key, Terraform)
//! and writes a Terraform working directory describing one Azure VM and its
//! first-boot script. Applying it is left to `terraform` itself.
//!
//! # Error Handling Strategy
//!
//! **CRITICAL I/O** - errors propagated with `?`:
//!   • Key and artifact writes, permission changes
//!   • External commands: `ssh-keygen`, `brew`, `terraform`
//!
//! **DECORATIVE I/O** - errors ignored with `let _ =`:
//!   • Terminal colouring and status lines (see [`output`])

#[macro_use]
pub mod output;

pub mod artifacts;
pub mod config;
pub mod credentials;
pub mod error;
pub mod orchestrator;
pub mod preconditions;
pub mod show;
pub mod toolchain;

// Re-export common types
pub use config::{ConfigLoader, ProvisioningConfig};
pub use credentials::{Keypair, SshKeygen};
pub use error::{ErrorKind, ProvisionError};
pub use orchestrator::{Orchestrator, RunOptions, RunReport, Stage, StageFailure};
pub use toolchain::{BrewFormula, Homebrew, Toolchain};
