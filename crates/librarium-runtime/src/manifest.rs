//! Plugin manifest parsing and validation.
//!
//! Each plugin ships a manifest describing its metadata and the capabilities
//! it requests. Manifests are TOML; JSON is accepted when the document starts
//! with `{`.
//!
//! Validation is the only place the manifest schema is checked. Hard problems
//! are [`ManifestError`]s and stop the load; advisory problems are returned
//! as [`LoadWarning`]s next to the validated manifest.

use crate::capability::{
    normalize_file_type, Capabilities, DomainRule, FileAccessLevel, FileParserCapability,
    HookType, InputConverterCapability, MetadataEnricherCapability, OutputGeneratorCapability,
};
use crate::error::{ManifestError, ManifestResult};
use crate::metadata::{IdentifierType, MetadataField};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Manifest versions understood by this host when none are configured.
pub const DEFAULT_SUPPORTED_VERSIONS: &[u32] = &[1];

/// Engine used when a manifest does not name one.
pub const DEFAULT_ENGINE: &str = "bytecode";

/// A validated plugin manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginManifest {
    pub manifest_version: u32,
    pub plugin: PluginMetadata,
    pub capabilities: Capabilities,
}

/// Plugin metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Identifier, unique within the scope the plugin is installed under.
    pub id: String,

    /// Human-readable name.
    pub name: String,

    /// Version string.
    pub version: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub authors: Vec<String>,

    #[serde(default)]
    pub homepage: Option<String>,

    /// Engine that executes the plugin code.
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Entry point override. Engines fall back to their own default.
    #[serde(default)]
    pub entry_point: Option<String>,
}

fn default_engine() -> String {
    DEFAULT_ENGINE.to_string()
}

impl PluginManifest {
    pub fn id(&self) -> &str {
        &self.plugin.id
    }

    pub fn version(&self) -> &str {
        &self.plugin.version
    }

    pub fn declares(&self, hook: HookType) -> bool {
        self.capabilities.declares(hook)
    }

    /// Fields the metadata enricher may write; empty when not declared.
    pub fn enricher_fields(&self) -> BTreeSet<MetadataField> {
        self.capabilities
            .metadata_enricher
            .as_ref()
            .map(|e| e.fields.clone())
            .unwrap_or_default()
    }
}

/// Advisory problems found while validating or loading a plugin.
///
/// The plugin still loads; the affected hook may be disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum LoadWarning {
    /// `metadata_enricher` was declared without fields; the hook is disabled.
    EnricherFieldsEmpty,
    /// A field was listed more than once.
    DuplicateField(MetadataField),
    /// `http_access` was declared with no domains; every request will be denied.
    HttpAccessWithoutDomains,
    /// A declared hook is not exported by the plugin code.
    DeclaredHookNotExported(HookType),
    /// An undeclared hook export was dropped (lenient export mode).
    UndeclaredExportDropped(String),
    /// An export name that is not a hook type was ignored.
    UnknownExport(String),
    /// Capabilities wider than the replaced version, confirmed by the user.
    CapabilityDiff(Vec<String>),
}

impl fmt::Display for LoadWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadWarning::EnricherFieldsEmpty => {
                write!(f, "metadata_enricher declares no fields; hook disabled")
            }
            LoadWarning::DuplicateField(field) => write!(f, "field '{}' listed twice", field),
            LoadWarning::HttpAccessWithoutDomains => {
                write!(f, "http_access declares no domains")
            }
            LoadWarning::DeclaredHookNotExported(hook) => {
                write!(f, "declared hook '{}' is not exported", hook)
            }
            LoadWarning::UndeclaredExportDropped(name) => {
                write!(f, "undeclared export '{}' dropped", name)
            }
            LoadWarning::UnknownExport(name) => write!(f, "unknown export '{}' ignored", name),
            LoadWarning::CapabilityDiff(widened) => {
                write!(f, "capabilities widened: {}", widened.join(", "))
            }
        }
    }
}

/// A manifest together with the warnings produced while validating it.
#[derive(Debug, Clone)]
pub struct ValidatedManifest {
    pub manifest: PluginManifest,
    pub warnings: Vec<LoadWarning>,
}

/// Validates manifests against the host's supported versions and the fixed
/// capability vocabulary.
#[derive(Debug, Clone)]
pub struct ManifestValidator {
    supported_versions: Vec<u32>,
}

impl Default for ManifestValidator {
    fn default() -> Self {
        Self::new(DEFAULT_SUPPORTED_VERSIONS.to_vec())
    }
}

impl ManifestValidator {
    pub fn new(supported_versions: Vec<u32>) -> Self {
        Self { supported_versions }
    }

    pub fn supported_versions(&self) -> &[u32] {
        &self.supported_versions
    }

    /// Parse and validate manifest bytes.
    pub fn validate(&self, bytes: &[u8]) -> ManifestResult<ValidatedManifest> {
        let raw = RawManifest::parse(bytes)?;

        if !self.supported_versions.contains(&raw.manifest_version) {
            return Err(ManifestError::UnsupportedVersion {
                found: raw.manifest_version,
                supported: self.supported_versions.clone(),
            });
        }

        validate_metadata(&raw.plugin)?;

        let mut warnings = Vec::new();
        let capabilities = raw.capabilities.into_capabilities(&mut warnings)?;

        Ok(ValidatedManifest {
            manifest: PluginManifest {
                manifest_version: raw.manifest_version,
                plugin: raw.plugin,
                capabilities,
            },
            warnings,
        })
    }
}

fn validate_metadata(plugin: &PluginMetadata) -> ManifestResult<()> {
    let required = [
        ("plugin.id", &plugin.id),
        ("plugin.name", &plugin.name),
        ("plugin.version", &plugin.version),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(ManifestError::Parse(format!("{} cannot be empty", name)));
        }
    }

    if plugin.id.contains(['/', '\\']) || plugin.id.starts_with('.') {
        return Err(ManifestError::Parse(format!(
            "plugin.id '{}' must not contain path separators",
            plugin.id
        )));
    }

    Ok(())
}

/// Manifest as written by plugin authors, before validation.
#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest_version: u32,
    plugin: PluginMetadata,
    #[serde(default)]
    capabilities: RawCapabilities,
}

impl RawManifest {
    fn parse(bytes: &[u8]) -> ManifestResult<Self> {
        let content = std::str::from_utf8(bytes)
            .map_err(|e| ManifestError::Parse(format!("manifest is not UTF-8: {}", e)))?;

        if content.trim_start().starts_with('{') {
            serde_json::from_str(content).map_err(|e| ManifestError::Parse(e.to_string()))
        } else {
            toml::from_str(content).map_err(|e| ManifestError::Parse(e.to_string()))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawCapabilities {
    input_converter: Option<RawInputConverter>,
    file_parser: Option<RawFileTypes>,
    output_generator: Option<RawTargetTypes>,
    metadata_enricher: Option<RawEnricher>,
    identifier_types: Option<RawIdentifierTypes>,
    http_access: Option<RawHttpAccess>,
    file_access: Option<RawFileAccess>,
}

#[derive(Debug, Deserialize)]
struct RawInputConverter {
    source_types: Vec<String>,
    target_type: String,
}

#[derive(Debug, Deserialize)]
struct RawFileTypes {
    file_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawTargetTypes {
    target_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawEnricher {
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    file_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawIdentifierTypes {
    types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawHttpAccess {
    #[serde(default)]
    domains: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawFileAccess {
    level: String,
}

impl RawCapabilities {
    fn into_capabilities(self, warnings: &mut Vec<LoadWarning>) -> ManifestResult<Capabilities> {
        let mut caps = Capabilities::default();

        if let Some(raw) = self.input_converter {
            let target_type = normalize_file_type(&raw.target_type);
            if target_type.is_empty() {
                return Err(ManifestError::invalid(
                    "input_converter",
                    "target_type cannot be empty",
                ));
            }
            caps.input_converter = Some(InputConverterCapability {
                source_types: file_types("input_converter", raw.source_types)?,
                target_type,
            });
        }

        if let Some(raw) = self.file_parser {
            caps.file_parser = Some(FileParserCapability {
                file_types: file_types("file_parser", raw.file_types)?,
            });
        }

        if let Some(raw) = self.output_generator {
            caps.output_generator = Some(OutputGeneratorCapability {
                target_types: file_types("output_generator", raw.target_types)?,
            });
        }

        if let Some(raw) = self.metadata_enricher {
            let mut fields = BTreeSet::new();
            for name in &raw.fields {
                let field: MetadataField = name
                    .parse()
                    .map_err(|e: String| ManifestError::invalid("metadata_enricher", e))?;
                if !fields.insert(field) {
                    warnings.push(LoadWarning::DuplicateField(field));
                }
            }
            if fields.is_empty() {
                warnings.push(LoadWarning::EnricherFieldsEmpty);
            }

            let file_types = raw
                .file_types
                .iter()
                .map(|t| normalize_file_type(t))
                .filter(|t| !t.is_empty())
                .collect();

            caps.metadata_enricher = Some(MetadataEnricherCapability { fields, file_types });
        }

        if let Some(raw) = self.identifier_types {
            for name in &raw.types {
                let kind: IdentifierType = name
                    .parse()
                    .map_err(|e: String| ManifestError::invalid("identifier_types", e))?;
                caps.identifier_types.insert(kind);
            }
        }

        if let Some(raw) = self.http_access {
            if raw.domains.is_empty() {
                warnings.push(LoadWarning::HttpAccessWithoutDomains);
            }
            for entry in &raw.domains {
                let rule = DomainRule::parse(entry)
                    .map_err(|e| ManifestError::invalid("http_access", e))?;
                if !caps.http_domains.contains(&rule) {
                    caps.http_domains.push(rule);
                }
            }
        }

        if let Some(raw) = self.file_access {
            caps.file_access = raw
                .level
                .parse::<FileAccessLevel>()
                .map_err(|e| ManifestError::invalid("file_access", e))?;
        }

        Ok(caps)
    }
}

fn file_types(capability: &str, raw: Vec<String>) -> ManifestResult<BTreeSet<String>> {
    let types: BTreeSet<String> = raw
        .iter()
        .map(|t| normalize_file_type(t))
        .filter(|t| !t.is_empty())
        .collect();

    if types.is_empty() {
        return Err(ManifestError::invalid(
            capability,
            "at least one file type is required",
        ));
    }

    Ok(types)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(content: &str) -> ManifestResult<ValidatedManifest> {
        ManifestValidator::default().validate(content.as_bytes())
    }

    #[test]
    fn test_parse_manifest() {
        let toml = r#"
manifest_version = 1

[plugin]
id = "openlibrary"
name = "Open Library"
version = "1.2.0"
description = "Enriches records from openlibrary.org"

[capabilities.metadata_enricher]
fields = ["title", "authors", "cover"]

[capabilities.identifier_types]
types = ["isbn13", "openlibrary"]

[capabilities.http_access]
domains = ["openlibrary.org", "covers.openlibrary.org:443"]

[capabilities.file_access]
level = "read"
"#;

        let validated = validate(toml).unwrap();
        assert!(validated.warnings.is_empty());

        let manifest = validated.manifest;
        assert_eq!(manifest.id(), "openlibrary");
        assert_eq!(manifest.plugin.engine, DEFAULT_ENGINE);
        assert!(manifest.declares(HookType::MetadataEnricher));
        assert!(manifest.declares(HookType::IdentifierTypes));
        assert!(!manifest.declares(HookType::FileParser));
        assert_eq!(manifest.enricher_fields().len(), 3);
        assert_eq!(manifest.capabilities.http_domains.len(), 2);
        assert_eq!(manifest.capabilities.file_access, FileAccessLevel::Read);
    }

    #[test]
    fn test_parse_json_manifest() {
        let json = r#"{
            "manifest_version": 1,
            "plugin": {"id": "cbr", "name": "CBR", "version": "0.1.0"},
            "capabilities": {
                "input_converter": {"source_types": [".CBR"], "target_type": "cbz"}
            }
        }"#;

        let manifest = validate(json).unwrap().manifest;
        let converter = manifest.capabilities.input_converter.unwrap();
        assert!(converter.source_types.contains("cbr"));
        assert_eq!(converter.target_type, "cbz");
    }

    #[test]
    fn test_malformed_manifest() {
        assert!(matches!(validate("not = [valid"), Err(ManifestError::Parse(_))));
        assert!(matches!(
            validate("manifest_version = 1\n[plugin]\nid = \"\"\nname = \"x\"\nversion = \"1\""),
            Err(ManifestError::Parse(_))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let toml = "manifest_version = 2\n[plugin]\nid = \"a\"\nname = \"A\"\nversion = \"1\"";
        match validate(toml) {
            Err(ManifestError::UnsupportedVersion { found, supported }) => {
                assert_eq!(found, 2);
                assert_eq!(supported, vec![1]);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let validator = ManifestValidator::new(vec![1, 2]);
        assert!(validator.validate(toml.as_bytes()).is_ok());
    }

    #[test]
    fn test_unknown_field_is_invalid_capability() {
        let toml = r#"
manifest_version = 1
[plugin]
id = "a"
name = "A"
version = "1"
[capabilities.metadata_enricher]
fields = ["title", "blurb"]
"#;
        assert!(matches!(
            validate(toml),
            Err(ManifestError::InvalidCapability { .. })
        ));
    }

    #[test]
    fn test_unknown_identifier_type_is_invalid_capability() {
        let toml = r#"
manifest_version = 1
[plugin]
id = "a"
name = "A"
version = "1"
[capabilities.identifier_types]
types = ["isbn13", "barcode"]
"#;
        assert!(matches!(
            validate(toml),
            Err(ManifestError::InvalidCapability { .. })
        ));
    }

    #[test]
    fn test_empty_enricher_fields_is_warning() {
        let toml = r#"
manifest_version = 1
[plugin]
id = "a"
name = "A"
version = "1"
[capabilities.metadata_enricher]
fields = []
[capabilities.file_parser]
file_types = ["epub"]
"#;
        let validated = validate(toml).unwrap();
        assert_eq!(validated.warnings, vec![LoadWarning::EnricherFieldsEmpty]);
        let enricher = validated.manifest.capabilities.metadata_enricher.unwrap();
        assert!(!enricher.is_active());
    }

    #[test]
    fn test_empty_file_types_rejected() {
        let toml = r#"
manifest_version = 1
[plugin]
id = "a"
name = "A"
version = "1"
[capabilities.file_parser]
file_types = []
"#;
        assert!(matches!(
            validate(toml),
            Err(ManifestError::InvalidCapability { .. })
        ));
    }

    #[test]
    fn test_bad_domain_rejected() {
        let toml = r#"
manifest_version = 1
[plugin]
id = "a"
name = "A"
version = "1"
[capabilities.http_access]
domains = ["https://example.com/api"]
"#;
        assert!(matches!(
            validate(toml),
            Err(ManifestError::InvalidCapability { .. })
        ));
    }

    #[test]
    fn test_duplicate_field_warning() {
        let toml = r#"
manifest_version = 1
[plugin]
id = "a"
name = "A"
version = "1"
[capabilities.metadata_enricher]
fields = ["title", "title"]
"#;
        let validated = validate(toml).unwrap();
        assert_eq!(
            validated.warnings,
            vec![LoadWarning::DuplicateField(MetadataField::Title)]
        );
    }
}
