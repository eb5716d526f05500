//! Built-in components and the redirect table for well-known plugin types.

use hcl2template::plugin::{
    Builder, ComponentKind, DataSource, PostProcessor, PrepareOutcome, Provisioner, Registry,
};
use hcl2template::schema::{ConfigSpec, Decodable, DecodedConfig, SchemaType};
use hcl::Value;

/// The registry the cli runs against: the handful of components that ship
/// in-process, plus redirects that map well-known component types to the
/// plugin that provides them.
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();

    registry.register_builder("null", Box::new(|| Box::new(NullBuilder)));
    registry.register_builder("file", Box::new(|| Box::new(FileBuilder)));
    registry.register_provisioner("shell-local", Box::new(|| Box::new(ShellLocalProvisioner)));
    registry.register_provisioner("breakpoint", Box::new(|| Box::new(BreakpointProvisioner)));
    registry.register_post_processor("manifest", Box::new(|| Box::new(ManifestPostProcessor)));
    registry.register_post_processor(
        "shell-local",
        Box::new(|| Box::new(ShellLocalPostProcessor)),
    );
    registry.register_datasource("env", Box::new(|| Box::new(EnvDataSource::default())));

    for (kind, types, plugin_source) in REDIRECTS {
        for type_name in *types {
            registry.register_redirect(*kind, *type_name, *plugin_source);
        }
    }

    registry
}

/// Component types that used to be in-process and now live in their own
/// plugin. Referencing one implies a requirement on that plugin.
const REDIRECTS: &[(ComponentKind, &[&str], &str)] = &[
    (
        ComponentKind::Builder,
        &["amazon-ebs", "amazon-chroot", "amazon-instance"],
        "github.com/hashicorp/amazon",
    ),
    (
        ComponentKind::Datasource,
        &["amazon-ami", "amazon-parameterstore", "amazon-secretsmanager"],
        "github.com/hashicorp/amazon",
    ),
    (
        ComponentKind::Builder,
        &["azure-arm", "azure-chroot", "azure-dtl"],
        "github.com/hashicorp/azure",
    ),
    (ComponentKind::Builder, &["docker"], "github.com/hashicorp/docker"),
    (
        ComponentKind::PostProcessor,
        &["docker-import", "docker-push", "docker-save", "docker-tag"],
        "github.com/hashicorp/docker",
    ),
    (
        ComponentKind::Provisioner,
        &["ansible", "ansible-local"],
        "github.com/hashicorp/ansible",
    ),
    (
        ComponentKind::Builder,
        &["googlecompute"],
        "github.com/hashicorp/googlecompute",
    ),
    (ComponentKind::Builder, &["qemu"], "github.com/hashicorp/qemu"),
    (
        ComponentKind::Builder,
        &["virtualbox-iso", "virtualbox-ovf", "virtualbox-vm"],
        "github.com/hashicorp/virtualbox",
    ),
    (
        ComponentKind::Builder,
        &["vmware-iso", "vmware-vmx"],
        "github.com/hashicorp/vmware",
    ),
    (ComponentKind::Builder, &["vagrant"], "github.com/hashicorp/vagrant"),
    (
        ComponentKind::PostProcessor,
        &["vagrant", "vagrant-cloud"],
        "github.com/hashicorp/vagrant",
    ),
];

/// Produces an empty artifact; used to run provisioners without a machine.
struct NullBuilder;

impl Decodable for NullBuilder {
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new()
            .optional("ssh_host", SchemaType::String)
            .optional("ssh_port", SchemaType::Number)
            .optional("ssh_username", SchemaType::String)
            .optional("ssh_password", SchemaType::String)
            .optional("packer_build_name", SchemaType::String)
            .optional("packer_builder_type", SchemaType::String)
    }
}

impl Builder for NullBuilder {
    fn prepare(&mut self, _config: &DecodedConfig) -> anyhow::Result<PrepareOutcome> {
        Ok(PrepareOutcome {
            generated_vars: vec!["ID".to_string()],
            warnings: vec![],
        })
    }
}

/// Writes a file and calls it an artifact.
struct FileBuilder;

impl Decodable for FileBuilder {
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new()
            .required("target", SchemaType::String)
            .optional("source", SchemaType::String)
            .optional("content", SchemaType::String)
            .optional("packer_build_name", SchemaType::String)
            .optional("packer_builder_type", SchemaType::String)
    }
}

impl Builder for FileBuilder {
    fn prepare(&mut self, config: &DecodedConfig) -> anyhow::Result<PrepareOutcome> {
        let mut warnings = vec![];
        if config.get("source").is_some() && config.get("content").is_some() {
            anyhow::bail!("source and content are mutually exclusive");
        }
        if config.get("source").is_none() && config.get("content").is_none() {
            warnings.push("Neither source nor content given; an empty file will be created".into());
        }
        Ok(PrepareOutcome {
            generated_vars: vec![],
            warnings,
        })
    }
}

/// Runs a command on the machine running the build.
struct ShellLocalProvisioner;

impl Decodable for ShellLocalProvisioner {
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new()
            .optional("command", SchemaType::String)
            .optional("inline", SchemaType::list(SchemaType::String))
            .optional("environment_vars", SchemaType::list(SchemaType::String))
    }
}

impl Provisioner for ShellLocalProvisioner {
    fn prepare(&mut self, config: &DecodedConfig) -> anyhow::Result<Vec<String>> {
        if config.get("command").is_none() && config.get("inline").is_none() {
            anyhow::bail!("either command or inline must be specified");
        }
        Ok(vec![])
    }
}

/// Pauses the build until the operator continues it.
struct BreakpointProvisioner;

impl Decodable for BreakpointProvisioner {
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new()
            .optional("note", SchemaType::String)
            .optional("disable", SchemaType::Bool)
    }
}

impl Provisioner for BreakpointProvisioner {
    fn prepare(&mut self, _config: &DecodedConfig) -> anyhow::Result<Vec<String>> {
        Ok(vec![])
    }
}

/// Writes a summary of the produced artifacts to a file.
struct ManifestPostProcessor;

impl Decodable for ManifestPostProcessor {
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new()
            .optional("output", SchemaType::String)
            .optional("strip_path", SchemaType::Bool)
            .optional("custom_data", SchemaType::map(SchemaType::String))
    }
}

impl PostProcessor for ManifestPostProcessor {
    fn configure(&mut self, _config: &DecodedConfig) -> anyhow::Result<Vec<String>> {
        Ok(vec![])
    }
}

struct ShellLocalPostProcessor;

impl Decodable for ShellLocalPostProcessor {
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new()
            .optional("command", SchemaType::String)
            .optional("inline", SchemaType::list(SchemaType::String))
            .optional("environment_vars", SchemaType::list(SchemaType::String))
    }
}

impl PostProcessor for ShellLocalPostProcessor {
    fn configure(&mut self, config: &DecodedConfig) -> anyhow::Result<Vec<String>> {
        if config.get("command").is_none() && config.get("inline").is_none() {
            anyhow::bail!("either command or inline must be specified");
        }
        Ok(vec![])
    }
}

/// Exposes an environment variable as `data.env.<name>.value`.
#[derive(Default)]
struct EnvDataSource {
    key: Option<String>,
}

impl Decodable for EnvDataSource {
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new().required("key", SchemaType::String)
    }
}

impl DataSource for EnvDataSource {
    fn configure(&mut self, config: &DecodedConfig) -> anyhow::Result<()> {
        match config.get("key") {
            Some(Value::String(key)) => {
                self.key = Some(key.clone());
                Ok(())
            }
            _ => anyhow::bail!("key must be a string"),
        }
    }

    fn execute(&self) -> anyhow::Result<Value> {
        let key = self.key.as_deref().ok_or_else(|| anyhow::anyhow!("not configured"))?;
        let value = std::env::var(key).unwrap_or_default();
        let mut out = hcl::Map::new();
        out.insert("value".to_string(), Value::String(value));
        Ok(Value::Object(out))
    }
}
