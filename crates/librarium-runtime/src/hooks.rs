//! Typed inputs and outputs of the callable hook kinds.
//!
//! Plugins exchange JSON with the host; these types are the host-side view
//! of that contract. Output files are always relative to the call's temp
//! directory.

use crate::metadata::BookMetadata;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Input of an `input_converter` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertRequest {
    /// File to convert. Readable by the plugin for the duration of the call.
    pub source_path: PathBuf,
    /// Normalized file type of the source.
    pub source_type: String,
}

/// Output of an `input_converter` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertOutput {
    /// Converted file, relative to the call's temp directory.
    pub file: PathBuf,
}

/// Input of a `file_parser` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseRequest {
    pub path: PathBuf,
    pub file_type: String,
}

/// Input of an `output_generator` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub metadata: BookMetadata,
    pub target_type: String,
    /// Catalog file the output is generated from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
}

/// Output of an `output_generator` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOutput {
    /// Generated file, relative to the call's temp directory.
    pub file: PathBuf,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Input of a `metadata_enricher` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Metadata merged so far, including earlier enrichers in the chain.
    pub current: BookMetadata,
}
