//! Catalog metadata vocabulary shared by the host and plugins.
//!
//! Enrichers declare which [`MetadataField`]s they may write. A field is a
//! logical unit: `cover` covers the image bytes, mime type and chosen page,
//! `series` covers name and number. Filtering and merging always treat a
//! field's attributes together.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of logical metadata fields an enricher may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataField {
    Title,
    Subtitle,
    Description,
    Authors,
    Genres,
    Tags,
    Publisher,
    PublishedDate,
    Language,
    PageCount,
    Identifiers,
    Series,
    Cover,
    Rating,
}

impl MetadataField {
    /// All fields, in canonical order.
    pub const ALL: [MetadataField; 14] = [
        MetadataField::Title,
        MetadataField::Subtitle,
        MetadataField::Description,
        MetadataField::Authors,
        MetadataField::Genres,
        MetadataField::Tags,
        MetadataField::Publisher,
        MetadataField::PublishedDate,
        MetadataField::Language,
        MetadataField::PageCount,
        MetadataField::Identifiers,
        MetadataField::Series,
        MetadataField::Cover,
        MetadataField::Rating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataField::Title => "title",
            MetadataField::Subtitle => "subtitle",
            MetadataField::Description => "description",
            MetadataField::Authors => "authors",
            MetadataField::Genres => "genres",
            MetadataField::Tags => "tags",
            MetadataField::Publisher => "publisher",
            MetadataField::PublishedDate => "published_date",
            MetadataField::Language => "language",
            MetadataField::PageCount => "page_count",
            MetadataField::Identifiers => "identifiers",
            MetadataField::Series => "series",
            MetadataField::Cover => "cover",
            MetadataField::Rating => "rating",
        }
    }

    /// Wire keys governed by this field in a plugin's output.
    pub fn attributes(&self) -> &'static [&'static str] {
        match self {
            MetadataField::Series => &["series_name", "series_number"],
            MetadataField::Cover => &["cover_image", "cover_mime_type", "cover_page"],
            MetadataField::Title => &["title"],
            MetadataField::Subtitle => &["subtitle"],
            MetadataField::Description => &["description"],
            MetadataField::Authors => &["authors"],
            MetadataField::Genres => &["genres"],
            MetadataField::Tags => &["tags"],
            MetadataField::Publisher => &["publisher"],
            MetadataField::PublishedDate => &["published_date"],
            MetadataField::Language => &["language"],
            MetadataField::PageCount => &["page_count"],
            MetadataField::Identifiers => &["identifiers"],
            MetadataField::Rating => &["rating"],
        }
    }

    /// The logical field owning a wire key.
    pub fn for_attribute(key: &str) -> Option<MetadataField> {
        Self::ALL
            .into_iter()
            .find(|field| field.attributes().contains(&key))
    }

    /// List-valued fields accumulate across plugins instead of first-wins.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            MetadataField::Authors
                | MetadataField::Genres
                | MetadataField::Tags
                | MetadataField::Identifiers
        )
    }
}

impl fmt::Display for MetadataField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| format!("unknown metadata field '{}'", s))
    }
}

/// The fixed set of external identifier kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierType {
    Isbn10,
    Isbn13,
    Asin,
    Google,
    Openlibrary,
    Goodreads,
    Hardcover,
    Comicvine,
}

impl IdentifierType {
    pub const ALL: [IdentifierType; 8] = [
        IdentifierType::Isbn10,
        IdentifierType::Isbn13,
        IdentifierType::Asin,
        IdentifierType::Google,
        IdentifierType::Openlibrary,
        IdentifierType::Goodreads,
        IdentifierType::Hardcover,
        IdentifierType::Comicvine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierType::Isbn10 => "isbn10",
            IdentifierType::Isbn13 => "isbn13",
            IdentifierType::Asin => "asin",
            IdentifierType::Google => "google",
            IdentifierType::Openlibrary => "openlibrary",
            IdentifierType::Goodreads => "goodreads",
            IdentifierType::Hardcover => "hardcover",
            IdentifierType::Comicvine => "comicvine",
        }
    }
}

impl fmt::Display for IdentifierType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown identifier type '{}'", s))
    }
}

/// An external identifier attached to a catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: IdentifierType,
    pub value: String,
}

/// A catalog record's metadata as exchanged with plugins.
///
/// The serialized form uses the flat wire keys listed by
/// [`MetadataField::attributes`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub genres: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub identifiers: Vec<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_number: Option<f64>,
    /// Base64-encoded image bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
}

impl BookMetadata {
    /// Decode a metadata object, rejecting values of the wrong shape.
    pub fn from_object(object: serde_json::Map<String, serde_json::Value>) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::Value::Object(object))
    }

    pub fn to_object(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}
