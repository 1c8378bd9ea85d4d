//! Terraform module, bootstrap script and variable bindings for the VM
//!
//! Templates are compiled into the binary with `include_str!` and rendered with
//! Tera from typed parameter structs. Rendering is pure; only
//! [`ArtifactGenerator::generate`] touches the filesystem, and it renders all
//! three documents before writing any of them.

use crate::config::{DEFAULT_REGION, DEFAULT_VM_SIZE, ProvisioningConfig};
use crate::credentials::Keypair;
use crate::error::{ProvisionError, Result};
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tera::{Context, Tera};

/// Directory the Terraform working files are written to
pub const DEFAULT_OUTPUT_DIR: &str = "terraform";

pub const ADMIN_USERNAME: &str = "azureuser";
pub const RESOURCE_PREFIX: &str = "hamer";
pub const SSH_PORT: u16 = 22;

/// Compose file the VM fetches and starts on first boot
pub const WORKLOAD_COMPOSE_URL: &str =
    "https://raw.githubusercontent.com/hamer-mesh/hamer-service/main/docker-compose.yml";
pub const WORKLOAD_DIR: &str = "/opt/hamer";
const WORKLOAD_SERVICE: &str = "hamer-workload";

const VNET_CIDR: &str = "10.0.0.0/16";
const SUBNET_CIDR: &str = "10.0.1.0/24";
const OS_DISK_GB: u32 = 128;

/// Marketplace image the VM boots from
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VmImage {
    pub publisher: &'static str,
    pub offer: &'static str,
    pub sku: &'static str,
    pub version: &'static str,
}

pub const UBUNTU_2204: VmImage = VmImage {
    publisher: "Canonical",
    offer: "0001-com-ubuntu-server-jammy",
    sku: "22_04-lts-gen2",
    version: "latest",
};

/// One of the embedded templates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    InfraModule,
    Bootstrap,
    VariableBindings,
}

impl Template {
    pub const ALL: [Template; 3] = [Self::InfraModule, Self::Bootstrap, Self::VariableBindings];

    /// Name the template is registered under
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::InfraModule => "main.tf.j2",
            Self::Bootstrap => "cloud-init.sh.j2",
            Self::VariableBindings => "terraform.tfvars.j2",
        }
    }

    /// File name of the rendered document in the output directory
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::InfraModule => "main.tf",
            Self::Bootstrap => "cloud-init.sh",
            Self::VariableBindings => "terraform.tfvars",
        }
    }

    fn source(self) -> &'static str {
        match self {
            Self::InfraModule => include_str!("templates/main.tf.j2"),
            Self::Bootstrap => include_str!("templates/cloud-init.sh.j2"),
            Self::VariableBindings => include_str!("templates/terraform.tfvars.j2"),
        }
    }
}

/// Escape `value` for use inside an HCL quoted string
#[must_use]
pub fn hcl_escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            // `${` and `%{` start interpolation / directives
            '$' | '%' if chars.peek() == Some(&'{') => {
                escaped.push(c);
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

/// `value` as a complete HCL string literal, quotes included
#[must_use]
pub fn hcl_quote(value: &str) -> String {
    format!("\"{}\"", hcl_escape(value))
}

#[derive(Serialize)]
struct BootstrapParams {
    admin_username: &'static str,
    workload_dir: &'static str,
    compose_url: &'static str,
    service_name: &'static str,
}

#[derive(Serialize)]
struct InfraParams {
    prefix: &'static str,
    admin_username: &'static str,
    default_region: String,
    default_vm_size: String,
    vnet_cidr: &'static str,
    subnet_cidr: &'static str,
    ssh_port: u16,
    os_disk_gb: u32,
    image: VmImage,
    public_key_path: String,
    private_key_path: String,
    custom_data: String,
}

#[derive(Serialize)]
struct VariableParams {
    subscription_id: String,
    region: String,
    vm_size: String,
}

/// Tera instance holding every embedded template
pub struct TemplateRenderer {
    tera: Tera,
}

impl TemplateRenderer {
    pub fn from_embedded() -> Result<Self> {
        let mut tera = Tera::default();
        for template in Template::ALL {
            tera.add_raw_template(template.id(), template.source())
                .map_err(|e| ProvisionError::TemplateRender {
                    template: template.id(),
                    reason: e.to_string(),
                })?;
        }
        Ok(Self { tera })
    }

    /// Render `template` with the fields of `params` as variables
    pub fn render<P: Serialize>(&self, template: Template, params: &P) -> Result<String> {
        let failed = |e: tera::Error| ProvisionError::TemplateRender {
            template: template.id(),
            reason: error_chain(&e),
        };
        let context = Context::from_serialize(params).map_err(failed)?;
        self.tera.render(template.id(), &context).map_err(failed)
    }
}

// Tera hides the useful part of the message in the source chain.
fn error_chain(e: &tera::Error) -> String {
    let mut message = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// The three documents, rendered but not yet written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifacts {
    pub infra_module: String,
    pub bootstrap: String,
    pub variables: String,
}

impl RenderedArtifacts {
    #[must_use]
    pub fn document(&self, template: Template) -> &str {
        match template {
            Template::InfraModule => &self.infra_module,
            Template::Bootstrap => &self.bootstrap,
            Template::VariableBindings => &self.variables,
        }
    }
}

/// Render the bootstrap script on its own
pub fn render_bootstrap(renderer: &TemplateRenderer) -> Result<String> {
    renderer.render(
        Template::Bootstrap,
        &BootstrapParams {
            admin_username: ADMIN_USERNAME,
            workload_dir: WORKLOAD_DIR,
            compose_url: WORKLOAD_COMPOSE_URL,
            service_name: WORKLOAD_SERVICE,
        },
    )
}

/// Render all three documents from `config` and `keypair`.
///
/// Output depends only on the arguments and the embedded templates.
pub fn render_all(
    renderer: &TemplateRenderer,
    config: &ProvisioningConfig,
    keypair: &Keypair,
) -> Result<RenderedArtifacts> {
    let bootstrap = render_bootstrap(renderer)?;

    let infra_module = renderer.render(
        Template::InfraModule,
        &InfraParams {
            prefix: RESOURCE_PREFIX,
            admin_username: ADMIN_USERNAME,
            default_region: hcl_quote(DEFAULT_REGION),
            default_vm_size: hcl_quote(DEFAULT_VM_SIZE),
            vnet_cidr: VNET_CIDR,
            subnet_cidr: SUBNET_CIDR,
            ssh_port: SSH_PORT,
            os_disk_gb: OS_DISK_GB,
            image: UBUNTU_2204,
            public_key_path: hcl_quote(&keypair.public_key_path().to_string_lossy()),
            private_key_path: hcl_escape(&keypair.private_key_path().to_string_lossy()),
            custom_data: base64::engine::general_purpose::STANDARD.encode(bootstrap.as_bytes()),
        },
    )?;

    let variables = renderer.render(
        Template::VariableBindings,
        &VariableParams {
            subscription_id: hcl_quote(&config.subscription_id),
            region: hcl_quote(&config.region),
            vm_size: hcl_quote(&config.vm_size),
        },
    )?;

    Ok(RenderedArtifacts {
        infra_module,
        bootstrap,
        variables,
    })
}

/// A document written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedArtifact {
    pub template: Template,
    pub path: PathBuf,
    pub sha256: String,
}

/// Everything [`ArtifactGenerator::generate`] wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedArtifactSet {
    pub output_dir: PathBuf,
    pub artifacts: Vec<GeneratedArtifact>,
}

/// Hex SHA-256 of `bytes`
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Writes the rendered documents into one output directory
pub struct ArtifactGenerator {
    renderer: TemplateRenderer,
    output_dir: PathBuf,
}

impl ArtifactGenerator {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            renderer: TemplateRenderer::from_embedded()?,
            output_dir: output_dir.into(),
        })
    }

    #[must_use]
    pub fn renderer(&self) -> &TemplateRenderer {
        &self.renderer
    }

    /// Path `template` is written to
    #[must_use]
    pub fn path_of(&self, template: Template) -> PathBuf {
        self.output_dir.join(template.file_name())
    }

    /// Render, then overwrite all three documents.
    ///
    /// A write failure leaves earlier documents on disk; re-running is safe.
    pub fn generate(
        &self,
        config: &ProvisioningConfig,
        keypair: &Keypair,
        verbose: bool,
    ) -> Result<GeneratedArtifactSet> {
        let rendered = render_all(&self.renderer, config, keypair)?;

        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| ProvisionError::write_failed(&self.output_dir, e))?;

        let mut artifacts = Vec::with_capacity(Template::ALL.len());
        for template in Template::ALL {
            let path = self.path_of(template);
            let contents = rendered.document(template);
            std::fs::write(&path, contents).map_err(|e| ProvisionError::write_failed(&path, e))?;
            verbose!(verbose, "Wrote {} ({} bytes)", path.display(), contents.len());

            artifacts.push(GeneratedArtifact {
                template,
                sha256: sha256_hex(contents.as_bytes()),
                path,
            });
        }

        Ok(GeneratedArtifactSet {
            output_dir: self.output_dir.clone(),
            artifacts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn keypair() -> Keypair {
        Keypair::at("/home/op/.ssh/hamer_azure")
    }

    fn rendered(config: &ProvisioningConfig) -> RenderedArtifacts {
        let renderer = TemplateRenderer::from_embedded().unwrap();
        render_all(&renderer, config, &keypair()).unwrap()
    }

    #[test]
    fn hcl_escaping_covers_quotes_and_interpolation() {
        assert_eq!(hcl_quote("abc-123"), "\"abc-123\"");
        assert_eq!(hcl_escape(r#"a"b\c"#), r#"a\"b\\c"#);
        assert_eq!(hcl_escape("${x} %{y} $z"), "$${x} %%{y} $z");
        assert_eq!(hcl_escape("line\nbreak"), "line\\nbreak");
    }

    #[test]
    fn bindings_quote_every_value() {
        let artifacts = rendered(&ProvisioningConfig::new("abc-123"));
        assert!(artifacts.variables.contains("subscriptionId = \"abc-123\""));
        assert!(artifacts.variables.contains("region = \"eastus\""));
        assert!(artifacts.variables.contains("vmSize = \"Standard_NC4as_T4_v3\""));
    }

    #[test]
    fn bindings_escape_hostile_values() {
        let mut config = ProvisioningConfig::new("abc\"123");
        config.region = "${file(\"/etc/passwd\")}".to_string();
        let artifacts = rendered(&config);
        assert!(artifacts.variables.contains(r#"subscriptionId = "abc\"123""#));
        assert!(artifacts.variables.contains(r#"region = "$${file(\"/etc/passwd\")}""#));
    }

    #[test]
    fn infra_module_declares_every_resource() {
        let module = rendered(&ProvisioningConfig::new("abc-123")).infra_module;
        for resource in [
            "azurerm_resource_group",
            "azurerm_virtual_network",
            "azurerm_subnet",
            "azurerm_public_ip",
            "azurerm_network_security_group",
            "azurerm_network_interface",
            "azurerm_network_interface_security_group_association",
            "azurerm_linux_virtual_machine",
        ] {
            assert!(
                module.contains(&format!("resource \"{resource}\" \"main\"")),
                "missing {resource}"
            );
        }
        for variable in ["subscriptionId", "region", "vmSize"] {
            assert!(module.contains(&format!("variable \"{variable}\"")));
        }
        assert!(module.contains("subscription_id = var.subscriptionId"));
        assert!(module.contains("size                            = var.vmSize"));
        assert!(module.contains("allocation_method   = \"Static\""));
        assert!(module.contains("destination_port_range     = \"22\""));
        assert!(module.contains("offer     = \"0001-com-ubuntu-server-jammy\""));
    }

    #[test]
    fn infra_module_references_public_key_path() {
        let module = rendered(&ProvisioningConfig::new("abc-123")).infra_module;
        assert!(module.contains("public_key = file(\"/home/op/.ssh/hamer_azure.pub\")"));
        assert!(module.contains("ssh -i /home/op/.ssh/hamer_azure azureuser@"));
    }

    #[test]
    fn custom_data_is_the_encoded_bootstrap() {
        let artifacts = rendered(&ProvisioningConfig::new("abc-123"));
        let encoded = base64::engine::general_purpose::STANDARD.encode(&artifacts.bootstrap);
        assert!(artifacts
            .infra_module
            .contains(&format!("custom_data = \"{encoded}\"")));
    }

    #[test]
    fn bootstrap_is_fully_resolved() {
        let script = rendered(&ProvisioningConfig::new("abc-123")).bootstrap;
        assert!(script.starts_with("#!/bin/bash"));
        assert!(!script.contains("{{"));
        assert!(!script.contains("{%"));
        assert!(script.contains(WORKLOAD_COMPOSE_URL));
        assert!(script.contains("docker compose up -d"));
        assert!(script.contains("nvidia-container-toolkit"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let config = ProvisioningConfig::new("abc-123");
        assert_eq!(rendered(&config), rendered(&config));
    }

    #[test]
    fn generate_writes_three_files_and_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ArtifactGenerator::new(dir.path().join("terraform")).unwrap();
        let config = ProvisioningConfig::new("abc-123");

        let first = generator.generate(&config, &keypair(), false).unwrap();
        let bytes: Vec<Vec<u8>> = first
            .artifacts
            .iter()
            .map(|a| std::fs::read(&a.path).unwrap())
            .collect();
        let second = generator.generate(&config, &keypair(), false).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.artifacts.len(), 3);
        for (artifact, before) in second.artifacts.iter().zip(bytes) {
            assert_eq!(std::fs::read(&artifact.path).unwrap(), before);
            assert_eq!(artifact.sha256, sha256_hex(&before));
        }
        assert!(dir.path().join("terraform/main.tf").is_file());
        assert!(dir.path().join("terraform/cloud-init.sh").is_file());
        assert!(dir.path().join("terraform/terraform.tfvars").is_file());
    }

    #[test]
    fn unwritable_output_dir_is_an_artifact_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("terraform");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let generator = ArtifactGenerator::new(&blocker).unwrap();
        let err = generator
            .generate(&ProvisioningConfig::new("abc-123"), &keypair(), false)
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ArtifactWriteFailed);
        assert!(err.to_string().contains("terraform"));
    }
}
