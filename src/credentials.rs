//! SSH keypair lifecycle for administrative access to the VM
//!
//! The keypair is created once and then left alone: regenerating it would lock
//! the operator out of any VM already provisioned with the old public key.

use crate::error::{ProvisionError, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// File name of the private key inside the credential directory
pub const DEFAULT_KEY_NAME: &str = "hamer_azure";

/// Comment embedded in the generated public key
pub const KEY_COMMENT: &str = "hamer-azure";

pub const RSA_KEY_BITS: u32 = 4096;

const SSH_KEYGEN_BINARY: &str = "ssh-keygen";

const SSH_KEYGEN_INSTALL_INSTRUCTIONS: &str = "\
ssh-keygen not found in PATH. Install OpenSSH:

macOS:          included with the system (check /usr/bin/ssh-keygen)
Ubuntu/Debian:  sudo apt-get install openssh-client
Fedora/RHEL:    sudo dnf install openssh-clients";

/// Private and public key paths of the administrative keypair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keypair {
    private_key_path: PathBuf,
    public_key_path: PathBuf,
}

/// Observed state of a [`Keypair`] on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeypairStatus {
    Present,
    Absent,
    /// Private key exists without its public half
    Incomplete,
}

impl Keypair {
    /// Keypair whose public half sits next to `private_key_path` with a `.pub` suffix
    #[must_use]
    pub fn at(private_key_path: impl Into<PathBuf>) -> Self {
        let private_key_path = private_key_path.into();
        let mut public = private_key_path.clone().into_os_string();
        public.push(".pub");
        Self {
            private_key_path,
            public_key_path: PathBuf::from(public),
        }
    }

    /// `~/.ssh/hamer_azure`
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            ProvisionError::KeyGenerationFailed(
                "Could not determine home directory (HOME not set).\n   \
                 Pass --key-path with an absolute path instead."
                    .to_string(),
            )
        })?;
        Ok(Self::at(home.join(".ssh").join(DEFAULT_KEY_NAME)))
    }

    #[must_use]
    pub fn private_key_path(&self) -> &Path {
        &self.private_key_path
    }

    #[must_use]
    pub fn public_key_path(&self) -> &Path {
        &self.public_key_path
    }

    #[must_use]
    pub fn status(&self) -> KeypairStatus {
        match (self.private_key_path.exists(), self.public_key_path.exists()) {
            (true, true) => KeypairStatus::Present,
            (true, false) => KeypairStatus::Incomplete,
            (false, _) => KeypairStatus::Absent,
        }
    }
}

/// Freshly generated key material, wiped from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    private_key: Vec<u8>,
    public_key: Vec<u8>,
}

impl KeyMaterial {
    #[must_use]
    pub fn new(private_key: Vec<u8>, public_key: Vec<u8>) -> Self {
        Self {
            private_key,
            public_key,
        }
    }
}

/// Source of new RSA keypairs.
pub trait KeyGenerator {
    fn generate(&self, comment: &str) -> Result<KeyMaterial>;
}

/// [`KeyGenerator`] backed by the local `ssh-keygen`.
///
/// Keys are produced in a private temporary directory and read back, so the
/// final paths are only ever written by [`ensure_keypair`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SshKeygen;

impl KeyGenerator for SshKeygen {
    fn generate(&self, comment: &str) -> Result<KeyMaterial> {
        let binary = which::which(SSH_KEYGEN_BINARY).map_err(|_| {
            ProvisionError::KeyGenerationFailed(SSH_KEYGEN_INSTALL_INSTRUCTIONS.to_string())
        })?;

        let workdir = tempfile::tempdir().map_err(|e| {
            ProvisionError::KeyGenerationFailed(format!("Failed to create temp directory: {e}"))
        })?;
        let key_path = workdir.path().join("id_rsa");

        let output = Command::new(&binary)
            .args(["-q", "-t", "rsa", "-b"])
            .arg(RSA_KEY_BITS.to_string())
            .args(["-N", "", "-C", comment, "-f"])
            .arg(&key_path)
            .output()
            .map_err(|e| {
                ProvisionError::KeyGenerationFailed(format!("Failed to execute ssh-keygen: {e}"))
            })?;

        if !output.status.success() {
            let stderr = std::str::from_utf8(&output.stderr).unwrap_or("(non-UTF-8 error message)");
            return Err(ProvisionError::KeyGenerationFailed(format!(
                "ssh-keygen exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                ProvisionError::KeyGenerationFailed(format!(
                    "ssh-keygen succeeded but {} could not be read: {e}",
                    path.display()
                ))
            })
        };
        let private_key = read(&key_path)?;
        let public_key = read(&key_path.with_extension("pub"))?;

        Ok(KeyMaterial::new(private_key, public_key))
    }
}

/// What [`ensure_keypair`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOutcome {
    AlreadyPresent,
    Generated,
}

/// Status of `keypair`, failing when the private key lost its public half.
///
/// Never writes anything, so it also backs dry runs.
pub fn check_keypair(keypair: &Keypair) -> Result<KeypairStatus> {
    let status = keypair.status();
    if status == KeypairStatus::Incomplete {
        return Err(ProvisionError::KeyGenerationFailed(format!(
            "Private key {} exists but its public key {} is missing.\n   \
             Restore it with: ssh-keygen -y -f {} > {}",
            keypair.private_key_path().display(),
            keypair.public_key_path().display(),
            keypair.private_key_path().display(),
            keypair.public_key_path().display()
        )));
    }
    Ok(status)
}

/// Make sure `keypair` exists on disk, generating it only when the private key is absent.
///
/// An existing private key is never touched. The public half is written first
/// so that a present private key always implies a present public key.
pub fn ensure_keypair(
    keypair: &Keypair,
    generator: &dyn KeyGenerator,
    verbose: bool,
) -> Result<CredentialOutcome> {
    if check_keypair(keypair)? == KeypairStatus::Present {
        success!(
            "SSH key already present: {}",
            keypair.private_key_path().display()
        );
        return Ok(CredentialOutcome::AlreadyPresent);
    }

    verbose!(
        verbose,
        "Generating {RSA_KEY_BITS}-bit RSA keypair at {}",
        keypair.private_key_path().display()
    );

    let material = generator.generate(KEY_COMMENT)?;

    if let Some(dir) = keypair.private_key_path().parent() {
        create_credential_dir(dir)?;
    }

    write_key_file(keypair.public_key_path(), &material.public_key, 0o644)?;
    write_key_file(keypair.private_key_path(), &material.private_key, 0o600)?;

    success!("Generated SSH key: {}", keypair.private_key_path().display());
    Ok(CredentialOutcome::Generated)
}

fn create_credential_dir(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }

    std::fs::create_dir_all(dir).map_err(|e| {
        ProvisionError::KeyGenerationFailed(format!(
            "Failed to create {}: {e}",
            dir.display()
        ))
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(|e| {
            ProvisionError::KeyGenerationFailed(format!(
                "Failed to restrict permissions on {}: {e}",
                dir.display()
            ))
        })?;
    }

    Ok(())
}

fn write_key_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let failed = |e: std::io::Error| {
        ProvisionError::KeyGenerationFailed(format!("Failed to write {}: {e}", path.display()))
    };

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }

    let mut file = options.open(path).map_err(failed)?;
    file.write_all(contents).map_err(failed)?;
    file.sync_all().map_err(failed)?;

    // The open mode is filtered by the umask; set it explicitly.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(failed)?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}
