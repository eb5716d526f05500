//! Canonical template formatting
//!
//! Re-serializes a template through the HCL printer so spacing, indentation
//! and attribute alignment come out in one canonical shape. The result of
//! formatting an already-formatted file is the file itself.

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::documents::{AUTO_VAR_EXT, TEMPLATE_EXT};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct FormatOptions {
    /// Rewrite changed files in place instead of only reporting them.
    pub write: bool,
    /// Produce a unified diff for every changed file.
    pub show_diff: bool,
}

/// The outcome for a single file.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedFile {
    pub path: PathBuf,
    pub changed: bool,
    pub formatted: String,
    pub diff: Option<String>,
}

/// Formats one template text.
pub fn format_text(contents: &str) -> Result<String, hcl::Error> {
    let body: hcl::Body = hcl::parse(contents)?;
    hcl::format::to_string(&body)
}

/// Formats a template file or every formattable file in a directory.
///
/// Only `.pkr.hcl` and `.auto.pkrvars.hcl` files are touched; the JSON
/// variants have no canonical HCL shape.
pub fn format(path: &Path, opts: &FormatOptions) -> (Vec<FormattedFile>, Diagnostics) {
    let mut diags = Diagnostics::new();
    let mut results = vec![];

    let files = match collect_files(path) {
        Ok(files) => files,
        Err(err) => {
            diags.push(
                Diagnostic::error(format!("Failed to read {}", path.display()))
                    .with_detail(err.to_string()),
            );
            return (results, diags);
        }
    };
    if files.is_empty() {
        diags.push(Diagnostic::warning(format!(
            "No formattable files found in {}.",
            path.display()
        )));
        return (results, diags);
    }

    for file_path in files {
        match format_file(&file_path, opts) {
            Ok(result) => results.push(result),
            Err(diag) => diags.push(diag),
        }
    }

    (results, diags)
}

fn format_file(path: &Path, opts: &FormatOptions) -> Result<FormattedFile, Diagnostic> {
    let contents = std::fs::read_to_string(path).map_err(|err| {
        Diagnostic::error(format!("Failed to read {}", path.display()))
            .with_detail(err.to_string())
    })?;

    let formatted = format_text(&contents).map_err(|err| {
        Diagnostic::error(format!("Failed to parse {}", path.display()))
            .with_detail(err.to_string())
    })?;

    let changed = formatted != contents;
    if changed {
        tracing::info!(path = %path.display(), "file is not canonically formatted");
    }

    let diff = (changed && opts.show_diff).then(|| unified_diff(path, &contents, &formatted));

    if changed && opts.write {
        std::fs::write(path, &formatted).map_err(|err| {
            Diagnostic::error(format!("Failed to write {}", path.display()))
                .with_detail(err.to_string())
        })?;
    }

    Ok(FormattedFile {
        path: path.to_path_buf(),
        changed,
        formatted,
        diff,
    })
}

fn unified_diff(path: &Path, old: &str, new: &str) -> String {
    let display = path.display().to_string();
    similar::TextDiff::from_lines(old, new)
        .unified_diff()
        .header(&display, &display)
        .to_string()
}

fn collect_files(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut found = vec![];
    for dir_entry in std::fs::read_dir(path)? {
        let dir_entry = dir_entry?;
        if !dir_entry.file_type()?.is_file() {
            continue;
        }
        let name = dir_entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(TEMPLATE_EXT) || name.ends_with(AUTO_VAR_EXT) {
            found.push(dir_entry.path());
        }
    }
    found.sort();
    Ok(found)
}
