//! Capability-based security model for plugins.
//!
//! Plugins must declare the hook types they implement and the host resources
//! they need in their manifest. The runtime only exposes declared hooks and
//! the host API only honours declared resources.

use crate::metadata::{IdentifierType, MetadataField};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A named extension point the host calls into plugins for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    /// Converts an unsupported source format into one the host understands.
    InputConverter,
    /// Extracts metadata from a file.
    FileParser,
    /// Produces an output format from a catalog record.
    OutputGenerator,
    /// Enriches catalog records from external sources.
    MetadataEnricher,
    /// Declares identifier kinds the plugin contributes. Declarative only.
    IdentifierTypes,
}

impl HookType {
    pub const ALL: [HookType; 5] = [
        HookType::InputConverter,
        HookType::FileParser,
        HookType::OutputGenerator,
        HookType::MetadataEnricher,
        HookType::IdentifierTypes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookType::InputConverter => "input_converter",
            HookType::FileParser => "file_parser",
            HookType::OutputGenerator => "output_generator",
            HookType::MetadataEnricher => "metadata_enricher",
            HookType::IdentifierTypes => "identifier_types",
        }
    }

    /// Hook types backed by plugin code. `identifier_types` is a pure
    /// declaration and is never called.
    pub fn is_callable(&self) -> bool {
        !matches!(self, HookType::IdentifierTypes)
    }

    /// Hook types with exactly one producer per operation. A failure of the
    /// selected plugin is the failure of the operation.
    pub fn is_single_producer(&self) -> bool {
        matches!(self, HookType::InputConverter | HookType::OutputGenerator)
    }

    /// Default per-call deadline.
    pub fn default_timeout(&self) -> Duration {
        match self {
            HookType::InputConverter | HookType::OutputGenerator => Duration::from_secs(5 * 60),
            HookType::FileParser | HookType::MetadataEnricher => Duration::from_secs(60),
            HookType::IdentifierTypes => Duration::ZERO,
        }
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input_converter" => Ok(HookType::InputConverter),
            "file_parser" => Ok(HookType::FileParser),
            "output_generator" => Ok(HookType::OutputGenerator),
            "metadata_enricher" => Ok(HookType::MetadataEnricher),
            "identifier_types" => Ok(HookType::IdentifierTypes),
            other => Err(format!("unknown hook type '{}'", other)),
        }
    }
}

/// Filesystem access level beyond the plugin's own directories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAccessLevel {
    /// Install directory and per-call temp directory only.
    #[default]
    None,
    /// Additionally read catalog-wide paths.
    Read,
    /// Additionally read and write catalog-wide paths.
    Readwrite,
}

impl FileAccessLevel {
    pub fn can_read_catalog(&self) -> bool {
        *self >= FileAccessLevel::Read
    }

    pub fn can_write_catalog(&self) -> bool {
        *self == FileAccessLevel::Readwrite
    }
}

impl FromStr for FileAccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(FileAccessLevel::None),
            "read" => Ok(FileAccessLevel::Read),
            "readwrite" => Ok(FileAccessLevel::Readwrite),
            other => Err(format!("unknown file access level '{}'", other)),
        }
    }
}

/// One allow-listed network destination: a host with an optional port.
///
/// Without a port the rule matches the implicit web ports 80 and 443.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainRule {
    pub host: String,
    pub port: Option<u16>,
}

impl DomainRule {
    /// Parse a manifest `domains` entry such as `api.example.com` or
    /// `api.example.com:8443`.
    pub fn parse(entry: &str) -> Result<Self, String> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err("empty domain entry".to_string());
        }
        if entry.contains("://") || entry.contains('/') || entry.contains('@') {
            return Err(format!("'{}' must be a bare host, not a URL", entry));
        }
        if entry.contains('*') || entry.chars().any(char::is_whitespace) {
            return Err(format!("'{}' contains unsupported characters", entry));
        }

        let (host, port) = split_host_port(entry)?;
        url::Host::parse(host).map_err(|e| format!("'{}' is not a valid host: {}", entry, e))?;

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// Check whether a URL's destination matches this rule.
    pub fn matches(&self, url: &url::Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        if !host.eq_ignore_ascii_case(&self.host) {
            return false;
        }

        match (self.port, url.port_or_known_default()) {
            (Some(expected), Some(actual)) => expected == actual,
            (None, Some(actual)) => actual == 80 || actual == 443,
            (_, None) => false,
        }
    }
}

impl fmt::Display for DomainRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

fn split_host_port(entry: &str) -> Result<(&str, Option<u16>), String> {
    // Bracketed IPv6 literal, optionally followed by a port.
    if entry.starts_with('[') {
        let end = entry
            .find(']')
            .ok_or_else(|| format!("'{}' has an unterminated IPv6 literal", entry))?;
        let host = &entry[..=end];
        return match &entry[end + 1..] {
            "" => Ok((host, None)),
            rest => match rest.strip_prefix(':') {
                Some(port) => Ok((host, Some(parse_port(entry, port)?))),
                None => Err(format!("'{}' has trailing characters", entry)),
            },
        };
    }

    match entry.rsplit_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(entry, port)?))),
        None => Ok((entry, None)),
    }
}

fn parse_port(entry: &str, port: &str) -> Result<u16, String> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| format!("'{}' has an invalid port", entry))
}

/// Declared input conversion: which source types are turned into which target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConverterCapability {
    pub source_types: BTreeSet<String>,
    pub target_type: String,
}

/// Declared file parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileParserCapability {
    pub file_types: BTreeSet<String>,
}

/// Declared output generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputGeneratorCapability {
    pub target_types: BTreeSet<String>,
}

/// Declared metadata enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEnricherCapability {
    /// Fields the enricher may write.
    pub fields: BTreeSet<MetadataField>,
    /// File types the enricher applies to; empty means any.
    pub file_types: BTreeSet<String>,
}

impl MetadataEnricherCapability {
    /// An enricher without declared fields loads but never runs.
    pub fn is_active(&self) -> bool {
        !self.fields.is_empty()
    }
}

/// The validated capability declarations of a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub input_converter: Option<InputConverterCapability>,
    pub file_parser: Option<FileParserCapability>,
    pub output_generator: Option<OutputGeneratorCapability>,
    pub metadata_enricher: Option<MetadataEnricherCapability>,
    pub identifier_types: BTreeSet<IdentifierType>,
    pub http_domains: Vec<DomainRule>,
    pub file_access: FileAccessLevel,
}

impl Capabilities {
    /// Whether the hook type was declared at all.
    pub fn declares(&self, hook: HookType) -> bool {
        match hook {
            HookType::InputConverter => self.input_converter.is_some(),
            HookType::FileParser => self.file_parser.is_some(),
            HookType::OutputGenerator => self.output_generator.is_some(),
            HookType::MetadataEnricher => self.metadata_enricher.is_some(),
            HookType::IdentifierTypes => !self.identifier_types.is_empty(),
        }
    }

    /// Declared hook types.
    pub fn hook_types(&self) -> BTreeSet<HookType> {
        HookType::ALL
            .into_iter()
            .filter(|hook| self.declares(*hook))
            .collect()
    }

    /// Whether a declared hook handles the given file type.
    pub fn handles_file_type(&self, hook: HookType, file_type: &str) -> bool {
        let file_type = normalize_file_type(file_type);
        match hook {
            HookType::InputConverter => self
                .input_converter
                .as_ref()
                .is_some_and(|c| c.source_types.contains(&file_type)),
            HookType::FileParser => self
                .file_parser
                .as_ref()
                .is_some_and(|c| c.file_types.contains(&file_type)),
            HookType::OutputGenerator => self
                .output_generator
                .as_ref()
                .is_some_and(|c| c.target_types.contains(&file_type)),
            HookType::MetadataEnricher => self
                .metadata_enricher
                .as_ref()
                .is_some_and(|c| c.file_types.is_empty() || c.file_types.contains(&file_type)),
            HookType::IdentifierTypes => false,
        }
    }

    /// Whether outbound requests to `url` are allow-listed.
    pub fn allows_url(&self, url: &url::Url) -> bool {
        self.http_domains.iter().any(|rule| rule.matches(url))
    }

    /// Describe every way `self` grants more than `previous`.
    pub fn widened_from(&self, previous: &Capabilities) -> Vec<String> {
        let mut widened = Vec::new();

        for hook in self.hook_types() {
            if !previous.declares(hook) {
                widened.push(format!("hook {}", hook));
            }
        }

        for rule in &self.http_domains {
            if !previous.http_domains.contains(rule) {
                widened.push(format!("http domain {}", rule));
            }
        }

        if self.file_access > previous.file_access {
            widened.push(format!(
                "file access {:?} -> {:?}",
                previous.file_access, self.file_access
            ));
        }

        widened
    }
}

/// Normalise a file type: lowercase, without a leading dot.
pub fn normalize_file_type(file_type: &str) -> String {
    file_type.trim().trim_start_matches('.').to_ascii_lowercase()
}
