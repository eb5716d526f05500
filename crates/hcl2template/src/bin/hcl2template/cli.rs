//! hcl2template cli interface

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Change the work directory
    ///
    /// Can be specified multiple times. Note that all
    /// paths on the way to the final path must exist.
    #[clap(short = 'C', long = "directory", global(true))]
    pub directory: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that a template parses and resolves
    Validate(ValidateCommand),

    /// Print the resolved template structure
    Inspect(InspectCommand),

    /// Rewrite templates to the canonical format
    Fmt(FmtCommand),
}

#[derive(Parser, Debug)]
pub struct ValidateCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    /// Only keep builds whose name matches one of these glob patterns
    #[clap(long = "only")]
    pub only: Vec<String>,

    /// Drop builds (or post-processors) whose name matches one of these
    /// glob patterns
    #[clap(long = "except")]
    pub except: Vec<String>,

    /// Execute data sources instead of substituting null values
    #[clap(long = "evaluate-datasources")]
    pub evaluate_datasources: bool,
}

#[derive(Parser, Debug)]
pub struct InspectCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    #[clap(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser, Debug)]
pub struct FmtCommand {
    /// Template file or directory to format
    #[clap(default_value = ".")]
    pub path: PathBuf,

    /// Report files that would change without rewriting them
    ///
    /// Exits with status 3 when any file is not canonically formatted.
    #[clap(long = "check")]
    pub check: bool,

    /// Print a unified diff for every changed file
    #[clap(long = "diff")]
    pub diff: bool,
}

#[derive(Parser, Debug)]
pub struct InputArgs {
    /// Template file or directory of template files
    #[clap(default_value = ".")]
    pub path: PathBuf,

    /// Extra variable file, applied after the auto-loaded ones
    #[clap(long = "var-file")]
    pub var_files: Vec<PathBuf>,

    /// Variable assignment, `name=value`; highest precedence
    #[clap(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// Warn when a var file sets a variable no template declares
    #[clap(long = "warn-undeclared-var")]
    pub warn_undeclared_var: bool,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!(
            "expected `name=value`, got {raw:?}"
        )),
    }
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    #[arg(short = 'F', long = "output-format", default_value_t)]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Clone, Default, Debug)]
pub enum OutputFormat {
    Json,
    #[default]
    Yaml,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => f.write_str("json"),
            OutputFormat::Yaml => f.write_str("yaml"),
        }
    }
}
