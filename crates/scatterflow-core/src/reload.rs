//! Recover an embedded template from a previously-exported data file by
//! sniffing its magic bytes, then, for the formats whose header we
//! actually parse, decoding the `template_data` field out of it.
//!
//! `hdf5` and `png` are recognized by magic bytes but left opaque — this
//! crate has no binary HDF5/PNG chunk reader; a concrete library of
//! reduction modules (where such readers would live) is a separate concern.

use crate::error::{Error, Result};
use crate::registry::ModuleRegistry;
use crate::template::Template;
use std::ops::Range;

const HDF5_MAGIC: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1a, b'\n'];
const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];
const ORSO_MAGIC: &str = "# # ORSO reflectivity data file";
/// Both header-comment prefix variants are valid; see `DESIGN.md` for why
/// both are accepted.
const COLUMN_PREFIXES: [&str; 2] = ["#\"template_data\":", "# \"template_data\":"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Column,
    Hdf5,
    Png,
    Orso,
}

/// The result of [`sniff`]: which format matched, and the byte range its
/// magic/prefix occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sniffed {
    pub format: Format,
    pub matched: Range<usize>,
}

/// Identify a file's format from its leading bytes, without decoding it.
pub fn sniff(bytes: &[u8]) -> Option<Sniffed> {
    if bytes.starts_with(&HDF5_MAGIC) {
        return Some(Sniffed { format: Format::Hdf5, matched: 0..HDF5_MAGIC.len() });
    }
    if bytes.starts_with(&PNG_MAGIC) {
        return Some(Sniffed { format: Format::Png, matched: 0..PNG_MAGIC.len() });
    }
    if bytes.starts_with(ORSO_MAGIC.as_bytes()) {
        return Some(Sniffed { format: Format::Orso, matched: 0..ORSO_MAGIC.len() });
    }
    if bytes.first() == Some(&b'{') {
        return Some(Sniffed { format: Format::Json, matched: 0..1 });
    }
    for prefix in COLUMN_PREFIXES {
        if bytes.starts_with(prefix.as_bytes()) {
            return Some(Sniffed { format: Format::Column, matched: 0..prefix.len() });
        }
    }
    None
}

/// Recover the embedded template, if any. `Ok(None)` means the format was
/// recognized but either carries no `template_data` (column/orso) or is
/// opaque to this crate (hdf5/png). [`Error::UnsupportedFormat`] means the
/// magic bytes weren't recognized at all.
pub fn decode(bytes: &[u8], registry: &ModuleRegistry) -> Result<Option<Template>> {
    let sniffed = sniff(bytes).ok_or(Error::UnsupportedFormat)?;
    match sniffed.format {
        Format::Json => decode_json(bytes, registry).map(Some),
        Format::Column => decode_column(bytes, registry),
        Format::Orso => decode_orso(bytes, registry),
        Format::Hdf5 | Format::Png => Ok(None),
    }
}

fn template_value_to_template(value: serde_json::Value, registry: &ModuleRegistry) -> Result<Template> {
    let as_str = match value {
        serde_json::Value::String(s) => s,
        other => serde_json::to_string(&other).map_err(|e| Error::MalformedHeader(e.to_string()))?,
    };
    Template::import(&as_str, registry)
}

fn decode_json(bytes: &[u8], registry: &ModuleRegistry) -> Result<Template> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|e| Error::MalformedHeader(e.to_string()))?;
    let template_value = value.get("template_data").cloned().unwrap_or(value);
    template_value_to_template(template_value, registry)
}

fn decode_column(bytes: &[u8], registry: &ModuleRegistry) -> Result<Option<Template>> {
    let text = std::str::from_utf8(bytes).map_err(|e| Error::MalformedHeader(e.to_string()))?;
    for line in text.lines() {
        for prefix in COLUMN_PREFIXES {
            if let Some(rest) = line.strip_prefix(prefix) {
                return Template::import(rest.trim(), registry).map(Some);
            }
        }
    }
    Ok(None)
}

fn decode_orso(bytes: &[u8], registry: &ModuleRegistry) -> Result<Option<Template>> {
    let text = std::str::from_utf8(bytes).map_err(|e| Error::MalformedHeader(e.to_string()))?;
    let mut lines = text.lines();
    match lines.next() {
        Some(first) if first == ORSO_MAGIC => {}
        _ => return Err(Error::MalformedHeader("missing ORSO magic line".into())),
    }

    let mut yaml_lines = Vec::new();
    for line in lines {
        if let Some(rest) = line.strip_prefix("# ") {
            yaml_lines.push(rest);
        } else if let Some(rest) = line.strip_prefix('#') {
            yaml_lines.push(rest);
        } else {
            break;
        }
    }
    if yaml_lines.is_empty() {
        return Ok(None);
    }

    let yaml_text = yaml_lines.join("\n");
    let value: serde_json::Value = serde_yml::from_str(&yaml_text).map_err(|e| Error::MalformedHeader(e.to_string()))?;
    match value.get("template_data") {
        Some(template_value) => template_value_to_template(template_value.clone(), registry).map(Some),
        None => Ok(None),
    }
}
