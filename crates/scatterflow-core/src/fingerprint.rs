//! Cache fingerprints: a SHA-1 digest of the canonical serialization of
//! everything a terminal's value depends on.
//!
//! Determinism relies on `serde_json::Value`'s `Map` being `BTreeMap`-backed
//! (the crate does not enable the `preserve_order` feature), so converting
//! any serializable value to `Value` and back to a string always yields keys
//! in sorted order regardless of the source container's iteration order.

use crate::error::{Error, Result};
use crate::registry::ModuleRegistry;
use crate::template::{ModuleIndex, Template};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// What shape of value a `calc_terminal` request wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnType {
    /// Headers/metadata only, no bulk data.
    Metadata,
    /// A plot-ready reduced representation.
    Plottable,
    /// A file-exportable representation.
    Export,
    /// The full in-memory value, used internally for sub-evaluation.
    Full,
}

/// A SHA-1 digest, rendered as lowercase hex, identifying one cached value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The tuple of inputs a fingerprint is computed over, after `template` has
/// had every module's `version` field overwritten with the registry's
/// current version for that module id.
#[derive(Serialize)]
struct FingerprintKey<'a> {
    template: &'a Template,
    node: ModuleIndex,
    terminal: &'a str,
    return_type: ReturnType,
    export_type: Option<&'a str>,
    concatenate: Option<bool>,
}

/// Clone `template`, overwriting each module's `version` with the registry's
/// current version for its module id. Fails if any module id is no longer
/// registered at all (it may have been registered, then never re-registered
/// — that's a genuine inconsistency, not a stale-version tolerance case).
fn with_current_versions(template: &Template, registry: &ModuleRegistry) -> Result<Template> {
    let mut versioned = template.clone();
    for module in &mut versioned.modules {
        let version = registry
            .current_version(&module.module)
            .map_err(|e| Error::invalid_template(e.to_string()))?;
        module.version = Some(version.to_string());
    }
    Ok(versioned)
}

/// Canonicalize `value` by round-tripping it through `serde_json::Value`,
/// then serialize to a string. See module docs for why this is deterministic.
fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let as_value = serde_json::to_value(value)
        .map_err(|e| Error::invalid_template(format!("fingerprint serialization failed: {e}")))?;
    serde_json::to_string(&as_value)
        .map_err(|e| Error::invalid_template(format!("fingerprint serialization failed: {e}")))
}

/// Compute the fingerprint for a single `(node, terminal)` evaluation request.
///
/// This intentionally hashes the *entire* template (every module's current
/// version, every wire, every field) rather than only the ancestor
/// subgraph of `node` — two templates that differ only in an unrelated
/// downstream branch get different fingerprints for the same upstream
/// terminal. See `DESIGN.md` for why this (rather than ancestor-only
/// hashing) is the resolved behavior.
///
/// `concatenate` is part of the request tuple even though it carries no
/// other behavior in this crate: two requests differing only in whether
/// the caller wants multi-file output concatenated must not collide on
/// the same cache entry.
pub fn compute(
    template: &Template,
    registry: &ModuleRegistry,
    node: ModuleIndex,
    terminal: &str,
    return_type: ReturnType,
    export_type: Option<&str>,
    concatenate: Option<bool>,
) -> Result<Fingerprint> {
    let versioned = with_current_versions(template, registry)?;
    let key = FingerprintKey {
        template: &versioned,
        node,
        terminal,
        return_type,
        export_type,
        concatenate,
    };
    let canonical = canonical_json(&key)?;

    let mut hasher = Sha1::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    Ok(Fingerprint(to_hex(&digest)))
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}
