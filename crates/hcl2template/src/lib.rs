//! # hcl2template - declarative template front end for image builds
//!
//! This crate parses build template directories written in HCL2 and resolves
//! them into an immutable configuration that a build engine can execute.
//!
//! ## HCL Terms
//!
//! Quick introduction to terms used to describe elements of HCL documents.
//!
//! In hcl terms...
//! - a file gets parsed as a `body`
//! - ...which is just a list of `structures`
//! - ...where there are two kinds:
//!   - `attribute`: a "key = value" pair
//!   - or `block`:
//!     - 1 `identifier`
//!     - followed by 0 or more `labels`
//!     - and a `body` enclosed in `{` and `}`
//!
//! A template is a set of such files, for example:
//! ```hcl
//! variable "region" {
//!   type    = string
//!   default = "us-east-1"
//! }
//!
//! source "amazon-ebs" "base" {
//!   region = var.region
//! }
//!
//! build {
//!   sources = ["source.amazon-ebs.base"]
//!
//!   provisioner "shell" {
//!     inline = ["echo hello"]
//!   }
//! }
//! ```
//!
//! ## Loading files
//!
//! A `.pkr.hcl` document is parsed as a `body` ([hcl_edit::structure::Body]).
//! [documents::TemplateFiles] stores all root attributes and blocks of all
//! loaded documents and tracks their original source path, so diagnostics can
//! point back at the file a block came from. It also assigns each root block
//! a stable index used to identify it throughout the pipeline.
//!
//! ## Parsing
//!
//! see [parser::Parser::parse]
//!
//! Parsing happens in strictly ordered phases: required plugin blocks, then
//! input variables, then data source and local declarations, then variable
//! overrides (environment, var-files, command line), then the remaining
//! `source`/`build`/`communicator` blocks. Each phase accumulates
//! [diagnostics::Diagnostics] instead of failing fast, so one invocation
//! reports as many independent problems as possible.
//!
//! ## Evaluation
//!
//! We use [hcl::eval] to evaluate expressions. [config::PackerConfig] builds
//! an [hcl::eval::Context] exposing `var`, `local`, `data`, `path` and
//! `packer` namespaces from the resolved variable maps. Locals and data
//! sources are evaluated in dependency order, not declaration order, and a
//! dependency cycle is a hard error.
//!
//! ## Plugin boundary
//!
//! Plugins self-describe their configuration as a [schema::ConfigSpec] data
//! structure; the parser never hard-codes a plugin's field layout. The
//! [plugin::Registry] value passed to [parser::Parser::new] answers "is this
//! component type known" and "start an instance of it"; everything else about
//! builders, provisioners, post-processors and data sources is opaque to this
//! crate.

pub mod addrs;
pub mod build;
pub mod config;
pub mod datasource;
pub mod diagnostics;
pub mod documents;
pub mod format;
pub mod parser;
pub mod plugin;
pub mod required_plugins;
pub mod schema;
pub mod source;
mod util;
pub mod variables;
mod visit;
