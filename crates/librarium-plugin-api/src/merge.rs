//! Field filtering and metadata merging.
//!
//! Enricher output passes through two stages before it reaches the caller:
//!
//! 1. [`filter_enrichment`] strips keys the plugin did not declare (a
//!    contract violation, logged) and keys whose field is disabled for the
//!    scope (silently).
//! 2. [`MetadataMerger`] folds the filtered deltas together in execution
//!    order: scalars are first-non-empty-wins, lists accumulate as a union.
//!
//! Both stages work on logical fields: the attributes of `cover` and
//! `series` are kept, stripped and merged together.

use crate::config_store::ConfigStore;
use crate::error::HostResult;
use librarium_runtime::{BookMetadata, MetadataField, PluginKey, Scope};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Field enablement for one plugin in one scope. Fields without a setting
/// are enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveFields {
    settings: BTreeMap<MetadataField, bool>,
}

impl EffectiveFields {
    pub fn all_enabled() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: BTreeMap<MetadataField, bool>) -> Self {
        Self { settings }
    }

    pub fn is_enabled(&self, field: MetadataField) -> bool {
        self.settings.get(&field).copied().unwrap_or(true)
    }

    pub fn disabled(&self) -> BTreeSet<MetadataField> {
        self.settings
            .iter()
            .filter(|(_, enabled)| !**enabled)
            .map(|(field, _)| *field)
            .collect()
    }
}

/// Global field rows for `plugin`, overridden row by row by the scope's rows.
pub async fn effective_field_settings(
    config: &dyn ConfigStore,
    scope: Scope,
    plugin: &PluginKey,
) -> HostResult<EffectiveFields> {
    let mut settings = config.field_settings(Scope::Global, plugin).await?;
    if !scope.is_global() {
        settings.extend(config.field_settings(scope, plugin).await?);
    }
    Ok(EffectiveFields::from_settings(settings))
}

/// A key stripped from enricher output because the plugin may not write it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub key: String,
    pub reason: ViolationReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationReason {
    /// Not an attribute of any metadata field.
    UnknownKey,
    /// The field is not in the plugin's declared `fields`.
    Undeclared(MetadataField),
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.reason {
            ViolationReason::UnknownKey => write!(f, "unknown key '{}'", self.key),
            ViolationReason::Undeclared(field) => {
                write!(f, "'{}' belongs to undeclared field '{}'", self.key, field)
            }
        }
    }
}

/// Enricher output after filtering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilteredEnrichment {
    pub fields: Map<String, Value>,
    pub violations: Vec<FieldViolation>,
}

/// Filter one enricher's raw output against its declared and enabled fields.
pub fn filter_enrichment(
    plugin: &PluginKey,
    declared: &BTreeSet<MetadataField>,
    enabled: &EffectiveFields,
    raw: Map<String, Value>,
) -> FilteredEnrichment {
    let mut filtered = FilteredEnrichment::default();

    for (key, value) in raw {
        let Some(field) = MetadataField::for_attribute(&key) else {
            warn!(plugin = %plugin, key = %key, "Enricher returned unknown key; stripped");
            filtered.violations.push(FieldViolation {
                key,
                reason: ViolationReason::UnknownKey,
            });
            continue;
        };

        if !declared.contains(&field) {
            warn!(
                plugin = %plugin,
                key = %key,
                field = %field,
                "Enricher returned undeclared field; stripped"
            );
            filtered.violations.push(FieldViolation {
                key,
                reason: ViolationReason::Undeclared(field),
            });
            continue;
        }

        if !enabled.is_enabled(field) {
            continue;
        }

        filtered.fields.insert(key, value);
    }

    filtered
}

/// Whether a value counts as "not set" for merging.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Identity of a list item for de-duplication. Identifiers compare by
/// `(type, value)`; everything else by value.
fn item_identity(field: MetadataField, item: &Value) -> Value {
    match (field, item) {
        (MetadataField::Identifiers, Value::Object(map)) => Value::Array(vec![
            map.get("type").cloned().unwrap_or(Value::Null),
            map.get("value").cloned().unwrap_or(Value::Null),
        ]),
        _ => item.clone(),
    }
}

fn union_into(field: MetadataField, target: &mut Vec<Value>, items: &[Value]) {
    for item in items {
        if is_empty_value(item) {
            continue;
        }
        let identity = item_identity(field, item);
        if !target.iter().any(|existing| item_identity(field, existing) == identity) {
            target.push(item.clone());
        }
    }
}

/// Accumulates metadata contributions in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataMerger {
    merged: Map<String, Value>,
    contributors: BTreeMap<MetadataField, Vec<PluginKey>>,
}

impl MetadataMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any attribute of `field` holds a non-empty value.
    fn is_set(&self, field: MetadataField) -> bool {
        field
            .attributes()
            .iter()
            .any(|attr| self.merged.get(*attr).is_some_and(|v| !is_empty_value(v)))
    }

    /// Merge one contribution. Returns the fields it changed.
    pub fn merge(&mut self, plugin: &PluginKey, delta: &Map<String, Value>) -> Vec<MetadataField> {
        let mut changed = Vec::new();

        for field in MetadataField::ALL {
            let attributes = field.attributes();
            if !attributes
                .iter()
                .any(|attr| delta.get(*attr).is_some_and(|v| !is_empty_value(v)))
            {
                continue;
            }

            let applied = if field.is_list() {
                self.merge_list(field, delta)
            } else {
                self.merge_group(field, delta)
            };

            if applied {
                self.contributors.entry(field).or_default().push(plugin.clone());
                changed.push(field);
            }
        }

        for key in delta.keys() {
            if MetadataField::for_attribute(key).is_none() {
                debug!(plugin = %plugin, key = %key, "Ignoring unknown metadata key");
            }
        }

        changed
    }

    fn merge_list(&mut self, field: MetadataField, delta: &Map<String, Value>) -> bool {
        let mut applied = false;
        for attr in field.attributes() {
            let Some(Value::Array(items)) = delta.get(*attr) else {
                continue;
            };
            let slot = self
                .merged
                .entry(attr.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(existing) = slot {
                let before = existing.len();
                union_into(field, existing, items);
                applied |= existing.len() > before;
            }
        }
        applied
    }

    /// Scalars and logical groups: the first plugin to set any attribute
    /// owns the whole group.
    fn merge_group(&mut self, field: MetadataField, delta: &Map<String, Value>) -> bool {
        if self.is_set(field) {
            return false;
        }
        for attr in field.attributes() {
            match delta.get(*attr) {
                Some(value) if !is_empty_value(value) => {
                    self.merged.insert(attr.to_string(), value.clone());
                }
                _ => {}
            }
        }
        true
    }

    /// The merged contributions as a raw object.
    pub fn as_object(&self) -> &Map<String, Value> {
        &self.merged
    }

    /// Plugins that contributed to each field, in order.
    pub fn contributors(&self) -> &BTreeMap<MetadataField, Vec<PluginKey>> {
        &self.contributors
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    /// The merged contributions as typed metadata.
    pub fn metadata(&self) -> serde_json::Result<BookMetadata> {
        BookMetadata::from_object(self.merged.clone())
    }

    /// `base` with the merged contributions applied on top: groups set by
    /// a plugin replace the base group, lists are unioned after the base
    /// entries.
    pub fn view(&self, base: &BookMetadata) -> serde_json::Result<BookMetadata> {
        let mut object = base.to_object();

        for field in MetadataField::ALL {
            if field.is_list() {
                for attr in field.attributes() {
                    let Some(Value::Array(items)) = self.merged.get(*attr) else {
                        continue;
                    };
                    let slot = object
                        .entry(attr.to_string())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(existing) = slot {
                        union_into(field, existing, items);
                    }
                }
            } else if self.is_set(field) {
                for attr in field.attributes() {
                    match self.merged.get(*attr) {
                        Some(value) => object.insert(attr.to_string(), value.clone()),
                        None => object.remove(*attr),
                    };
                }
            }
        }

        BookMetadata::from_object(object)
    }
}
