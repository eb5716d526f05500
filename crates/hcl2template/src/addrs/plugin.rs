//! Plugin source address parsing
//!
//! A plugin source string has up to three slash-separated, dot-free parts:
//! `name`, `namespace/name` or `hostname/namespace/name`. Omitted parts
//! default to [DEFAULT_PLUGIN_HOST] and [DEFAULT_PLUGIN_NAMESPACE].

pub const DEFAULT_PLUGIN_HOST: &str = "github.com";
pub const DEFAULT_PLUGIN_NAMESPACE: &str = "hashicorp";

const REDUNDANT_PREFIX: &str = "packer-";
const USER_ERROR_PREFIX: &str = "packer-plugin-";

const MAX_SOURCE_PARTS: usize = 16;

/// Fully qualified plugin identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Plugin {
    pub hostname: String,
    pub namespace: String,
    pub type_name: String,
}

impl Plugin {
    /// Components of the canonical source address, host first.
    ///
    /// This corresponds more or less to the filesystem hierarchy where the
    /// plugin is installed.
    pub fn parts(&self) -> [&str; 3] {
        [&self.hostname, &self.namespace, &self.type_name]
    }

    /// Shortened form that omits defaulted hostname and namespace.
    pub fn for_display(&self) -> String {
        if self.hostname != DEFAULT_PLUGIN_HOST {
            return self.to_string();
        }
        if self.namespace != DEFAULT_PLUGIN_NAMESPACE {
            return format!("{}/{}", self.namespace, self.type_name);
        }
        self.type_name.clone()
    }
}

impl std::fmt::Display for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.hostname, self.namespace, self.type_name)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PluginPartError {
    #[error("must have at least one character")]
    Empty,
    #[error("dots are not allowed")]
    DotsNotAllowed,
    #[error("cannot use multiple consecutive dashes")]
    ConsecutiveDashes,
    #[error("may not use leading or trailing dashes")]
    EdgeDash,
    #[error("must contain only letters, digits, and dashes")]
    InvalidCharacter,
}

/// Process a namespace or type string provided by an end-user, producing a
/// normalized version if possible or an error if the string contains invalid
/// characters.
///
/// A plugin part follows DNS-label-like rules: it is folded to lowercase and
/// may contain only letters, digits, and dashes, with dashes neither at the
/// start nor the end. These restrictions allow the names to appear in fussy
/// contexts such as directory names on case-insensitive filesystems or
/// repository names.
///
/// It's valid to pass the result of this function as the argument to a
/// subsequent call, in which case the result will be identical.
pub fn parse_plugin_part(given: &str) -> Result<String, PluginPartError> {
    if given.is_empty() {
        return Err(PluginPartError::Empty);
    }
    if given.contains('.') {
        return Err(PluginPartError::DotsNotAllowed);
    }
    // Consecutive dashes look confusing, or incorrect. Rejecting them also
    // rules out the punycode indicator prefix "xn--".
    if given.contains("--") {
        return Err(PluginPartError::ConsecutiveDashes);
    }
    if given.starts_with('-') || given.ends_with('-') {
        return Err(PluginPartError::EdgeDash);
    }
    if !given
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(PluginPartError::InvalidCharacter);
    }

    Ok(given.to_ascii_lowercase())
}

/// Compares a given string to the result of [parse_plugin_part].
pub fn is_plugin_part_normalized(given: &str) -> Result<bool, PluginPartError> {
    let normalized = parse_plugin_part(given)?;
    Ok(given == normalized)
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PluginSourceError {
    #[error("a source address must not start or end with a '/' character")]
    EdgeSlash,
    #[error("a source address must have at most {MAX_SOURCE_PARTS} components, this one has {0}")]
    TooManyParts(usize),
    #[error("invalid plugin part {part:?} in source: {reason}")]
    InvalidPart {
        part: String,
        reason: PluginPartError,
    },
    #[error(
        "plugin type has the {USER_ERROR_PREFIX:?} prefix, which isn't valid; \
         although that prefix is often used in the names of version control \
         repositories for plugins, source addresses should not include it. \
         Did you mean {suggestion:?}?"
    )]
    UserErrorPrefix { suggestion: String },
    #[error(
        "plugin type has the {REDUNDANT_PREFIX:?} prefix, which isn't valid; \
         if you are the author of this plugin, rename it to not include the \
         prefix. Ex: {suggestion:?}"
    )]
    RedundantPrefix { suggestion: String },
}

/// Parses a `source` attribute string into a [Plugin].
///
/// The following are valid source string formats:
///
///   name
///   namespace/name
///   hostname/namespace/name
pub fn parse_plugin_source_string(source: &str) -> Result<Plugin, PluginSourceError> {
    if source.starts_with('/') || source.ends_with('/') {
        return Err(PluginSourceError::EdgeSlash);
    }

    let segments: Vec<&str> = source.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() > MAX_SOURCE_PARTS {
        return Err(PluginSourceError::TooManyParts(segments.len()));
    }

    // The type is always the last part. Due to how plugin executables and
    // plugin git repositories are conventionally named, it's a common user
    // error to copy the repository name wholesale, so the redundant prefixes
    // get a corrective suggestion rather than a generic error.
    let given_type = segments.last().copied().unwrap_or("");
    if given_type.starts_with(REDUNDANT_PREFIX) {
        if given_type.starts_with(USER_ERROR_PREFIX) {
            let suggestion = given_type.replacen(USER_ERROR_PREFIX, "", 1);
            // Only suggest when the remainder would otherwise be valid, so we
            // don't advise something that would fail for another reason.
            if parse_plugin_part(&suggestion).is_ok() {
                return Err(PluginSourceError::UserErrorPrefix { suggestion });
            }
        }
        return Err(PluginSourceError::RedundantPrefix {
            suggestion: given_type.replacen(REDUNDANT_PREFIX, "", 1),
        });
    }

    let parse = |part: &str| {
        parse_plugin_part(part).map_err(|reason| PluginSourceError::InvalidPart {
            part: part.to_string(),
            reason,
        })
    };

    match segments.as_slice() {
        [type_name] => Ok(Plugin {
            hostname: DEFAULT_PLUGIN_HOST.to_string(),
            namespace: DEFAULT_PLUGIN_NAMESPACE.to_string(),
            type_name: parse(type_name)?,
        }),
        [namespace, type_name] => Ok(Plugin {
            hostname: DEFAULT_PLUGIN_HOST.to_string(),
            namespace: parse(namespace)?,
            type_name: parse(type_name)?,
        }),
        [hostname, middle @ .., type_name] => {
            // The hostname is not subject to plugin-part rules (it legally
            // contains dots) but every path component in between is.
            let mut namespace_parts = Vec::with_capacity(middle.len());
            for part in middle {
                namespace_parts.push(parse(part)?);
            }
            Ok(Plugin {
                hostname: hostname.to_ascii_lowercase(),
                namespace: namespace_parts.join("/"),
                type_name: parse(type_name)?,
            })
        }
        [] => Err(PluginSourceError::InvalidPart {
            part: String::new(),
            reason: PluginPartError::Empty,
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn short_sources_get_defaults() {
        let plugin = parse_plugin_source_string("amazon").unwrap();
        assert_eq!(plugin.to_string(), "github.com/hashicorp/amazon");
        assert_eq!(plugin.for_display(), "amazon");

        let plugin = parse_plugin_source_string("acme/happycloud").unwrap();
        assert_eq!(plugin.to_string(), "github.com/acme/happycloud");
        assert_eq!(plugin.for_display(), "acme/happycloud");

        let plugin = parse_plugin_source_string("example.org/acme/happycloud").unwrap();
        assert_eq!(plugin.to_string(), "example.org/acme/happycloud");
        assert_eq!(plugin.for_display(), "example.org/acme/happycloud");
    }

    #[test]
    fn display_round_trips() {
        for source in ["amazon", "acme/happycloud", "example.org/acme/happycloud"] {
            let plugin = parse_plugin_source_string(source).unwrap();
            let again = parse_plugin_source_string(&plugin.for_display()).unwrap();
            assert_eq!(plugin, again, "round trip failed for {source}");
        }
    }

    #[test]
    fn parts_are_validated() {
        assert_eq!(parse_plugin_part(""), Err(PluginPartError::Empty));
        assert_eq!(
            parse_plugin_part("a.b"),
            Err(PluginPartError::DotsNotAllowed)
        );
        assert_eq!(
            parse_plugin_part("a--b"),
            Err(PluginPartError::ConsecutiveDashes)
        );
        assert_eq!(parse_plugin_part("-ab"), Err(PluginPartError::EdgeDash));
        assert_eq!(parse_plugin_part("ab-"), Err(PluginPartError::EdgeDash));
        assert_eq!(
            parse_plugin_part("a_b"),
            Err(PluginPartError::InvalidCharacter)
        );
        assert_eq!(parse_plugin_part("AmAzOn").unwrap(), "amazon");
    }

    #[test]
    fn normalization_is_stable() {
        let normalized = parse_plugin_part("MiXeD-Case").unwrap();
        assert_eq!(parse_plugin_part(&normalized).unwrap(), normalized);
        assert!(is_plugin_part_normalized(&normalized).unwrap());
        assert!(!is_plugin_part_normalized("MiXeD-Case").unwrap());
    }

    #[test]
    fn repository_prefix_gets_a_suggestion() {
        match parse_plugin_source_string("packer-plugin-amazon") {
            Err(PluginSourceError::UserErrorPrefix { suggestion }) => {
                assert_eq!(suggestion, "amazon");
            }
            other => panic!("expected user error prefix, got {other:?}"),
        }

        match parse_plugin_source_string("packer-amazon") {
            Err(PluginSourceError::RedundantPrefix { suggestion }) => {
                assert_eq!(suggestion, "amazon");
            }
            other => panic!("expected redundant prefix, got {other:?}"),
        }
    }

    #[test]
    fn slashes_at_edges_are_rejected() {
        assert_eq!(
            parse_plugin_source_string("/amazon"),
            Err(PluginSourceError::EdgeSlash)
        );
        assert_eq!(
            parse_plugin_source_string("amazon/"),
            Err(PluginSourceError::EdgeSlash)
        );
    }
}
