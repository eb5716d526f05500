//! End-to-end tests: template files on disk, through parse, initialize and
//! get_builds.

use hcl2template::config::{GetBuildsOptions, InitializeOptions};
use hcl2template::parser::{ParseOptions, Parser};
use hcl2template::plugin::{
    Builder, ComponentKind, DataSource, PostProcessor, PrepareOutcome, Provisioner, Registry,
};
use hcl2template::schema::{ConfigSpec, Decodable, DecodedConfig, SchemaType};
use hcl::Value;
use std::path::Path;

struct CloudBuilder;

impl Decodable for CloudBuilder {
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new()
            .required("region", SchemaType::String)
            .optional("instance_type", SchemaType::String)
            .optional("tags", SchemaType::map(SchemaType::String))
            .optional("packer_build_name", SchemaType::String)
            .optional("packer_builder_type", SchemaType::String)
    }
}

impl Builder for CloudBuilder {
    fn prepare(&mut self, config: &DecodedConfig) -> anyhow::Result<PrepareOutcome> {
        anyhow::ensure!(config.get("region").is_some(), "region is required");
        Ok(PrepareOutcome {
            generated_vars: vec!["ID".to_string(), "Host".to_string()],
            warnings: vec![],
        })
    }
}

struct EchoProvisioner;

impl Decodable for EchoProvisioner {
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new()
            .required("message", SchemaType::String)
            .optional("target_host", SchemaType::String)
    }
}

impl Provisioner for EchoProvisioner {
    fn prepare(&mut self, _config: &DecodedConfig) -> anyhow::Result<Vec<String>> {
        Ok(vec![])
    }
}

struct ArchivePostProcessor;

impl Decodable for ArchivePostProcessor {
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new().optional("output", SchemaType::String)
    }
}

impl PostProcessor for ArchivePostProcessor {
    fn configure(&mut self, _config: &DecodedConfig) -> anyhow::Result<Vec<String>> {
        Ok(vec![])
    }
}

/// Returns `{ id = "lookup-<filter>" }`, so dependent expressions are easy to
/// assert on.
#[derive(Default)]
struct LookupDataSource {
    filter: String,
}

impl Decodable for LookupDataSource {
    fn config_spec(&self) -> ConfigSpec {
        ConfigSpec::new().required("filter", SchemaType::String)
    }
}

impl DataSource for LookupDataSource {
    fn configure(&mut self, config: &DecodedConfig) -> anyhow::Result<()> {
        match config.get("filter") {
            Some(Value::String(filter)) => {
                self.filter = filter.clone();
                Ok(())
            }
            _ => anyhow::bail!("filter must be a string"),
        }
    }

    fn execute(&self) -> anyhow::Result<Value> {
        let mut out = hcl::Map::new();
        out.insert(
            "id".to_string(),
            Value::String(format!("lookup-{}", self.filter)),
        );
        Ok(Value::Object(out))
    }
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_builder("cloud", Box::new(|| Box::new(CloudBuilder)));
    registry.register_provisioner("echo", Box::new(|| Box::new(EchoProvisioner)));
    registry.register_post_processor("archive", Box::new(|| Box::new(ArchivePostProcessor)));
    registry.register_datasource("lookup", Box::new(|| Box::new(LookupDataSource::default())));
    registry.register_redirect(
        ComponentKind::Builder,
        "amazon-ebs",
        "github.com/hashicorp/amazon",
    );
    registry
}

fn parser() -> Parser {
    Parser::new(registry(), semver::Version::new(1, 10, 0))
}

fn write(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).unwrap();
}

#[test]
fn full_pipeline_resolves_builds() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "main.pkr.hcl",
        r#"
        variable "region" {
          type    = string
          default = "us-east-1"
        }

        locals {
          tag_value = "built-from-${var.region}"
        }

        source "cloud" "base" {
          region = var.region
          tags = {
            origin = local.tag_value
          }
        }

        build {
          name    = "nightly"
          sources = ["source.cloud.base"]

          provisioner "echo" {
            message     = "hello from ${source.type}.${source.name}"
            target_host = build.Host
          }

          post-processor "archive" {}
        }
        "#,
    );

    let parser = parser();
    let (mut config, diags) = parser.parse(dir.path(), &ParseOptions::default());
    assert!(!diags.has_errors(), "{diags}");

    let diags = config.initialize(&InitializeOptions::default(), parser.registry());
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(
        config.local_values.get("tag_value"),
        Some(&Value::String("built-from-us-east-1".into()))
    );

    let (builds, diags) = config.get_builds(&GetBuildsOptions::default(), parser.registry());
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(builds.len(), 1);

    let build = &builds[0];
    assert_eq!(build.name, "nightly.cloud.base");
    assert_eq!(build.builder_type, "cloud");
    assert_eq!(
        build.builder_config.get("packer_build_name"),
        Some(&Value::String("base".into()))
    );
    assert_eq!(
        build.builder_config.get("packer_builder_type"),
        Some(&Value::String("cloud".into()))
    );

    // the source namespace resolves during provisioner decode, and generated
    // values are placeholders until the build actually runs
    assert_eq!(build.provisioners.len(), 1);
    assert_eq!(
        build.provisioners[0].config.get("message"),
        Some(&Value::String("hello from cloud.base".into()))
    );
    assert_eq!(
        build.provisioners[0].config.get("target_host"),
        Some(&Value::String("<unknown>".into()))
    );

    assert_eq!(build.post_processors.len(), 1);
    assert_eq!(build.post_processors[0][0].ptype, "archive");
}

#[test]
fn duplicate_sources_across_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "one.pkr.hcl",
        "source \"cloud\" \"base\" {\n region = \"a\"\n}",
    );
    write(
        dir.path(),
        "two.pkr.hcl",
        "source \"cloud\" \"base\" {\n region = \"b\"\n}",
    );

    let (_, diags) = parser().parse(dir.path(), &ParseOptions::default());
    assert!(diags.has_errors());
    let rendered = diags.to_string();
    assert!(rendered.contains("Duplicate source block source.cloud.base"));
    assert!(rendered.contains("Previously declared at"));
    assert!(rendered.contains("one.pkr.hcl"));
}

#[test]
fn variable_precedence_auto_file_then_var_file_then_cli() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "main.pkr.hcl",
        "variable \"region\" {\n type    = string\n default = \"default\"\n}\n\nvariable \"zone\" {\n type = string\n default = \"z-default\"\n}\n\nvariable \"size\" {\n type = string\n default = \"s-default\"\n}",
    );
    write(dir.path(), "a.auto.pkrvars.hcl", "region = \"from-auto\"\nzone = \"from-auto\"\nsize = \"from-auto\"");
    write(dir.path(), "extra.pkrvars.hcl", "zone = \"from-file\"\nsize = \"from-file\"");

    let opts = ParseOptions {
        var_files: vec![dir.path().join("extra.pkrvars.hcl")],
        variables: vec![("size".to_string(), "from-cli".to_string())],
        warn_on_undeclared_var: false,
    };
    let (config, diags) = parser().parse(dir.path(), &opts);
    assert!(!diags.has_errors(), "{diags}");

    let values = config.input_variables.values();
    assert_eq!(values.get("region"), Some(&Value::String("from-auto".into())));
    assert_eq!(values.get("zone"), Some(&Value::String("from-file".into())));
    assert_eq!(values.get("size"), Some(&Value::String("from-cli".into())));
}

#[test]
fn unset_variable_fails_at_initialize() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "main.pkr.hcl", "variable \"region\" {\n type = string\n}");

    let parser = parser();
    let (mut config, diags) = parser.parse(dir.path(), &ParseOptions::default());
    assert!(!diags.has_errors(), "{diags}");

    let diags = config.initialize(&InitializeOptions::default(), parser.registry());
    assert!(diags.has_errors());
    assert!(diags.to_string().contains("Unset variable \"region\""));
}

#[test]
fn variable_validation_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "main.pkr.hcl",
        r#"
        variable "count" {
          type    = number
          default = 0

          validation {
            condition     = var.count > 0
            error_message = "Count must be positive."
          }
        }
        "#,
    );

    let parser = parser();
    let (mut config, diags) = parser.parse(dir.path(), &ParseOptions::default());
    assert!(!diags.has_errors(), "{diags}");

    let diags = config.initialize(&InitializeOptions::default(), parser.registry());
    assert!(diags.has_errors());
    assert!(diags.to_string().contains("Count must be positive."));
}

#[test]
fn datasources_evaluate_in_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "main.pkr.hcl",
        r#"
        data "lookup" "base" {
          filter = "alpha"
        }

        data "lookup" "derived" {
          filter = data.lookup.base.id
        }

        locals {
          resolved = data.lookup.derived.id
        }
        "#,
    );

    let parser = parser();
    let (mut config, diags) = parser.parse(dir.path(), &ParseOptions::default());
    assert!(!diags.has_errors(), "{diags}");

    // data sources resolve before locals, dependencies first, even though the
    // declaration order says otherwise
    let diags = config.initialize(&InitializeOptions::default(), parser.registry());
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(
        config.local_values.get("resolved"),
        Some(&Value::String("lookup-lookup-alpha".into()))
    );
}

#[test]
fn skipping_datasource_execution_substitutes_null() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "main.pkr.hcl",
        "data \"lookup\" \"base\" {\n filter = \"alpha\"\n}",
    );

    let parser = parser();
    let (mut config, diags) = parser.parse(dir.path(), &ParseOptions::default());
    assert!(!diags.has_errors(), "{diags}");

    let opts = InitializeOptions {
        skip_datasources_execution: true,
    };
    let diags = config.initialize(&opts, parser.registry());
    assert!(!diags.has_errors(), "{diags}");

    let ref_ = hcl2template::datasource::DatasourceRef::new("lookup", "base");
    assert_eq!(config.datasources.get(&ref_).unwrap().value, Some(Value::Null));
}

#[test]
fn implicit_plugin_requirements_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "main.pkr.hcl",
        r#"
        packer {
          required_plugins {
            happycloud = {
              source  = "github.com/happycorp/happycloud"
              version = ">= 2.1.0"
            }
          }
        }

        source "amazon-ebs" "ubuntu" {}
        "#,
    );

    let (config, diags) = parser().parse(dir.path(), &ParseOptions::default());
    assert!(!diags.has_errors(), "{diags}");

    let (requirements, diags) = config.plugin_requirements();
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(requirements.len(), 2);

    // sorted by plugin identifier
    assert_eq!(requirements[0].identifier.type_name, "amazon");
    assert!(!requirements[0].version_constraints.is_constrained());
    assert_eq!(requirements[1].accessor, "happycloud");
    assert_eq!(requirements[1].identifier.namespace, "happycorp");
    assert!(requirements[1].version_constraints.is_constrained());
}

#[test]
fn only_and_except_filter_builds() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "main.pkr.hcl",
        r#"
        source "cloud" "alpha" {
          region = "a"
        }

        source "cloud" "beta" {
          region = "b"
        }

        build {
          sources = ["source.cloud.alpha", "source.cloud.beta"]
        }
        "#,
    );

    let parser = parser();
    let (mut config, diags) = parser.parse(dir.path(), &ParseOptions::default());
    assert!(!diags.has_errors(), "{diags}");
    let diags = config.initialize(&InitializeOptions::default(), parser.registry());
    assert!(!diags.has_errors(), "{diags}");

    let opts = GetBuildsOptions {
        only: vec!["cloud.alpha".to_string()],
        except: vec![],
    };
    let (builds, diags) = config.get_builds(&opts, parser.registry());
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].name, "cloud.alpha");

    let opts = GetBuildsOptions {
        only: vec![],
        except: vec!["cloud.*".to_string()],
    };
    let (builds, _) = config.get_builds(&opts, parser.registry());
    assert!(builds.is_empty());

    // a pattern that matches nothing should warn
    let opts = GetBuildsOptions {
        only: vec!["cloud.alpha".to_string(), "nonexistent.*".to_string()],
        except: vec![],
    };
    let (builds, diags) = config.get_builds(&opts, parser.registry());
    assert_eq!(builds.len(), 1);
    assert!(diags
        .to_string()
        .contains("\"nonexistent.*\" did not match any build"));
}

#[test]
fn build_source_overrides_replace_source_attributes() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "main.pkr.hcl",
        r#"
        source "cloud" "base" {
          region        = "us-east-1"
          instance_type = "m5.large"
        }

        build {
          source "source.cloud.base" {
            name   = "override"
            region = "eu-west-1"
          }
        }
        "#,
    );

    let parser = parser();
    let (mut config, diags) = parser.parse(dir.path(), &ParseOptions::default());
    assert!(!diags.has_errors(), "{diags}");
    let diags = config.initialize(&InitializeOptions::default(), parser.registry());
    assert!(!diags.has_errors(), "{diags}");

    let (builds, diags) = config.get_builds(&GetBuildsOptions::default(), parser.registry());
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].name, "cloud.override");
    assert_eq!(
        builds[0].builder_config.get("region"),
        Some(&Value::String("eu-west-1".into()))
    );
    assert_eq!(
        builds[0].builder_config.get("instance_type"),
        Some(&Value::String("m5.large".into()))
    );
}

#[test]
fn json_templates_parse_like_hcl_ones() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "main.pkr.json",
        r#"{
          "variable": {"region": {"default": "us-east-1"}},
          "source": {"cloud": {"base": {"region": "us-east-1"}}},
          "build": {"sources": ["source.cloud.base"]}
        }"#,
    );
    write(dir.path(), "extra.auto.pkrvars.json", r#"{"region": "eu-central-1"}"#);

    let parser = parser();
    let (mut config, diags) = parser.parse(dir.path(), &ParseOptions::default());
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(
        config.input_variables.values().get("region"),
        Some(&Value::String("eu-central-1".into()))
    );

    let diags = config.initialize(&InitializeOptions::default(), parser.registry());
    assert!(!diags.has_errors(), "{diags}");

    let (builds, diags) = config.get_builds(&GetBuildsOptions::default(), parser.registry());
    assert!(!diags.has_errors(), "{diags}");
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].name, "cloud.base");
}

#[test]
fn every_broken_file_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "bad-one.pkr.hcl", "source \"cloud\" {");
    write(dir.path(), "bad-two.pkr.hcl", "build {");
    write(
        dir.path(),
        "good.pkr.hcl",
        "source \"cloud\" \"base\" {\n region = \"a\"\n}",
    );

    let (config, diags) = parser().parse(dir.path(), &ParseOptions::default());
    assert!(diags.has_errors());
    let rendered = diags.to_string();
    assert!(rendered.contains("bad-one.pkr.hcl"), "{rendered}");
    assert!(rendered.contains("bad-two.pkr.hcl"), "{rendered}");

    // the healthy file still parses
    assert_eq!(config.sources.len(), 1);
}

#[test]
fn repeated_resolution_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "main.pkr.hcl",
        r#"
        packer {
          required_plugins {
            happycloud = {
              source  = "github.com/happycorp/happycloud"
              version = ">= 1.0.0"
            }
          }
        }

        variable "region" {
          type    = string
          default = "us-east-1"
        }

        data "lookup" "base" {
          filter = var.region
        }

        locals {
          resolved = data.lookup.base.id
        }

        source "cloud" "base" {
          region = var.region
        }

        build {
          sources = ["source.cloud.base"]
        }
        "#,
    );

    let resolve = || {
        let parser = parser();
        let (mut config, diags) = parser.parse(dir.path(), &ParseOptions::default());
        assert!(!diags.has_errors(), "{diags}");
        let diags = config.initialize(&InitializeOptions::default(), parser.registry());
        assert!(!diags.has_errors(), "{diags}");
        let (builds, diags) = config.get_builds(&GetBuildsOptions::default(), parser.registry());
        assert!(!diags.has_errors(), "{diags}");

        let build_names: Vec<String> = builds.iter().map(|build| build.name.clone()).collect();
        (
            config.input_variables.values(),
            config.local_values.clone(),
            config.plugin_requirements().0,
            build_names,
        )
    };

    assert_eq!(resolve(), resolve());
}

#[test]
fn required_version_gates_the_template() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "main.pkr.hcl",
        "packer {\n required_version = \"~> 1.9\"\n}",
    );

    // 1.10 satisfies ~>1.9
    let (_, diags) = parser().parse(dir.path(), &ParseOptions::default());
    assert!(!diags.has_errors(), "{diags}");

    let old_parser = Parser::new(registry(), semver::Version::new(0, 9, 0));
    let (_, diags) = old_parser.parse(dir.path(), &ParseOptions::default());
    assert!(diags.has_errors());
    assert!(diags.to_string().contains("Unsupported core version"));
}
