mod cli;
mod registry;

use hcl2template::config::{GetBuildsOptions, InitializeOptions, PackerConfig};
use hcl2template::diagnostics::Diagnostics;
use hcl2template::parser::{ParseOptions, Parser};

fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("HCL2_LOG"))
        .with_writer(std::io::stderr)
        .init();

    for new_path in cli.directory.iter() {
        match new_path.canonicalize() {
            Err(e) => {
                eprintln!(
                    "Failed to resolve path for -C/--directory {}\n{}",
                    new_path.display(),
                    e
                );
                std::process::exit(1);
            }
            Ok(cwd) => {
                if let Err(err) = std::env::set_current_dir(&cwd) {
                    eprintln!("Failed to set work directory to {}\n{}", cwd.display(), err);
                    std::process::exit(1);
                }

                tracing::info!(directory=%cwd.display(), "Changed working directory");
            }
        }
    }

    let command_result = match cli.command {
        cli::Command::Validate(validate_cli) => validate(validate_cli),
        cli::Command::Inspect(inspect_cli) => inspect(inspect_cli),
        cli::Command::Fmt(fmt_cli) => fmt(fmt_cli),
    };

    match command_result {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            for error in e.chain() {
                eprintln!("{error}")
            }
            std::process::exit(1);
        }
    }
}

fn core_version() -> semver::Version {
    // the package version is always valid semver
    semver::Version::parse(env!("CARGO_PKG_VERSION")).unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}

fn report(diags: &Diagnostics) {
    for diag in diags.iter() {
        eprintln!("{diag}");
    }
}

fn resolve(
    input: &cli::InputArgs,
    skip_datasources: bool,
) -> anyhow::Result<(Parser, PackerConfig, Diagnostics)> {
    let parser = Parser::new(registry::default_registry(), core_version());
    let opts = ParseOptions {
        var_files: input.var_files.clone(),
        variables: input.vars.clone(),
        warn_on_undeclared_var: input.warn_undeclared_var,
    };

    let (mut config, mut diags) = parser.parse(&input.path, &opts);
    if diags.has_errors() {
        return Ok((parser, config, diags));
    }

    let init_opts = InitializeOptions {
        skip_datasources_execution: skip_datasources,
    };
    let registry = parser.registry();
    diags.extend(config.initialize(&init_opts, registry));
    Ok((parser, config, diags))
}

pub fn validate(cli: cli::ValidateCommand) -> anyhow::Result<i32> {
    let (parser, config, mut diags) = resolve(&cli.input, !cli.evaluate_datasources)?;

    if !diags.has_errors() {
        let opts = GetBuildsOptions {
            only: cli.only,
            except: cli.except,
        };
        let (_, build_diags) = config.get_builds(&opts, parser.registry());
        diags.extend(build_diags);
    }

    let (_, requirement_diags) = config.plugin_requirements();
    diags.extend(requirement_diags);

    report(&diags);
    if diags.has_errors() {
        return Ok(1);
    }

    println!("The configuration is valid.");
    Ok(0)
}

pub fn inspect(cli: cli::InspectCommand) -> anyhow::Result<i32> {
    let (_, config, diags) = resolve(&cli.input, true)?;
    report(&diags);
    if diags.has_errors() {
        return Ok(1);
    }

    let summary = summarize(&config)?;
    match cli.output.format {
        cli::OutputFormat::Yaml => serde_yaml::to_writer(std::io::stdout(), &summary)?,
        cli::OutputFormat::Json => serde_json::to_writer_pretty(std::io::stdout(), &summary)?,
    };

    Ok(0)
}

#[derive(serde::Serialize)]
struct InspectSummary {
    variables: serde_json::Map<String, serde_json::Value>,
    locals: Vec<String>,
    sources: Vec<String>,
    datasources: Vec<String>,
    builds: Vec<BuildSummary>,
    required_plugins: Vec<PluginSummary>,
}

#[derive(serde::Serialize)]
struct BuildSummary {
    provisioners: Vec<String>,
    post_processor_chains: usize,
}

#[derive(serde::Serialize)]
struct PluginSummary {
    accessor: String,
    source: String,
    version: String,
}

fn summarize(config: &PackerConfig) -> anyhow::Result<InspectSummary> {
    let mut variables = serde_json::Map::new();
    for variable in config.input_variables.iter() {
        let value = match variable.value() {
            Some(_) if variable.sensitive => serde_json::Value::String("<sensitive>".into()),
            Some(value) => serde_json::to_value(value)?,
            None => serde_json::Value::Null,
        };
        variables.insert(variable.name.clone(), value);
    }

    let (requirements, _) = config.plugin_requirements();

    Ok(InspectSummary {
        variables,
        locals: config.local_blocks.iter().map(|l| l.name.clone()).collect(),
        sources: config.sources.iter().map(|s| s.ref_().to_string()).collect(),
        datasources: config
            .datasources
            .iter()
            .map(|d| d.ref_().to_string())
            .collect(),
        builds: config
            .builds
            .iter()
            .map(|build| BuildSummary {
                provisioners: build
                    .provisioners
                    .iter()
                    .map(|p| p.display_name().to_string())
                    .collect(),
                post_processor_chains: build.post_processor_lists.len(),
            })
            .collect(),
        required_plugins: requirements
            .iter()
            .map(|requirement| PluginSummary {
                accessor: requirement.accessor.clone(),
                source: requirement.identifier.for_display(),
                version: requirement.version_constraints.to_string(),
            })
            .collect(),
    })
}

pub fn fmt(cli: cli::FmtCommand) -> anyhow::Result<i32> {
    let opts = hcl2template::format::FormatOptions {
        write: !cli.check,
        show_diff: cli.diff,
    };

    let (results, diags) = hcl2template::format::format(&cli.path, &opts);
    report(&diags);
    if diags.has_errors() {
        return Ok(1);
    }

    let mut changed = false;
    for result in results {
        if !result.changed {
            continue;
        }
        changed = true;
        println!("{}", result.path.display());
        if let Some(diff) = result.diff {
            print!("{diff}");
        }
    }

    if cli.check && changed {
        return Ok(3);
    }
    Ok(0)
}
