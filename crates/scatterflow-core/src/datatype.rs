//! The opaque datatype tag and the typed field-value model.
//!
//! The engine never interprets a [`DataType`] beyond two structural rules:
//! a tag ending in `.params` marks a side-channel configuration input, and
//! the literal tag `fileinfo` marks a file-picker field. Everything else
//! is just a string two modules agree on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque datatype tag, e.g. `"refldata"`, `"refldata.params"`, `"fileinfo"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataType(pub String);

impl DataType {
    /// The reserved tag marking a file-picker field.
    pub const FILEINFO: &'static str = "fileinfo";

    pub fn new(tag: impl Into<String>) -> Self {
        DataType(tag.into())
    }

    /// True if this tag marks a side-channel configuration input.
    pub fn is_params(&self) -> bool {
        self.0.ends_with(".params")
    }

    /// True if this tag is the reserved file-picker datatype.
    pub fn is_fileinfo(&self) -> bool {
        self.0 == Self::FILEINFO
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataType {
    fn from(s: &str) -> Self {
        DataType(s.to_string())
    }
}

impl From<String> for DataType {
    fn from(s: String) -> Self {
        DataType(s)
    }
}

/// One entry of a [`FieldDef::typeattr`](crate::registry::FieldDef) payload.
///
/// Only a few `datatype` kinds carry extra metadata; the rest leave this `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TypeAttr {
    /// Valid choices for an `opt` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    /// Which axis a `range` field applies to (e.g. `"x"`, `"y"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<String>,
    /// The metadata key a `patch_metadata` field patches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// A single bound set of data files (the value of a `fileinfo` field).
///
/// `mtime` is part of the cache fingerprint: changing the underlying file
/// invalidates every downstream cache entry that depended on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// The file-store source name this path is resolved against.
    pub source: String,
    /// Path within that source.
    pub path: String,
    /// Last-modified time, in whatever integer unit the file-store reports
    /// (typically Unix epoch milliseconds). Part of the fingerprint.
    pub mtime: i64,
    /// Names of entries within the file (e.g. HDF5 group names) that are
    /// actually in use, if the format supports sub-selection.
    #[serde(default)]
    pub entries: Vec<String>,
}

/// The value of a single module field, tagged by the field's declared
/// `datatype`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    /// One of the `typeattr.choices` strings.
    Opt(String),
    FileInfo(Vec<FileInfo>),
    /// An index into some upstream collection (e.g. a spectrum number).
    Index(i64),
    /// A multiplicative or additive scale factor with optional error.
    Scale { factor: f64, error: Option<f64> },
    /// An inclusive numeric range along a named axis.
    Range { low: f64, high: f64 },
    /// A coordinate pair, e.g. a pixel or detector position.
    Coordinate { x: f64, y: f64 },
    /// A metadata patch: overwrite a single named key in upstream metadata.
    PatchMetadata { key: String, value: serde_json::Value },
}

impl FieldValue {
    /// True for [`FieldValue::FileInfo`] with at least one bound file.
    pub fn is_bound_fileinfo(&self) -> bool {
        matches!(self, FieldValue::FileInfo(files) if !files.is_empty())
    }
}
