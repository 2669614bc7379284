//! Immutable-after-startup catalogue of [`ModuleDefinition`]s.
//!
//! Registration is append-only from the caller's perspective; internally,
//! redefining an existing id bumps its `version` and returns the previous
//! version string so the caller can evict cache entries fingerprinted
//! against it.

use crate::datatype::{DataType, TypeAttr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One input terminal declared by a [`ModuleDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDef {
    pub id: String,
    pub datatype: DataType,
    pub required: bool,
    pub multiple: bool,
}

/// One output terminal declared by a [`ModuleDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDef {
    pub id: String,
    pub datatype: DataType,
    pub multiple: bool,
}

/// The datatype kind of a configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Int,
    Float,
    Str,
    Bool,
    Opt,
    Fileinfo,
    Index,
    Scale,
    Range,
    Coordinate,
    PatchMetadata,
}

/// One configuration field declared by a [`ModuleDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub id: String,
    pub label: String,
    pub datatype: FieldKind,
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub typeattr: TypeAttr,
}

/// An immutable module definition: id, versioned signature, and an opaque
/// reference to the action function that computes its outputs.
///
/// The engine never interprets `action` — it only hands it to an
/// [`crate::action::ActionDispatcher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub id: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub inputs: Vec<InputDef>,
    pub outputs: Vec<OutputDef>,
    pub fields: Vec<FieldDef>,
}

impl ModuleDefinition {
    pub fn input(&self, id: &str) -> Option<&InputDef> {
        self.inputs.iter().find(|i| i.id == id)
    }

    pub fn output(&self, id: &str) -> Option<&OutputDef> {
        self.outputs.iter().find(|o| o.id == id)
    }

    pub fn field(&self, id: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Every field whose kind is `fileinfo` — these require a non-empty
    /// binding for the module to be considered satisfied.
    pub fn fileinfo_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.datatype == FieldKind::Fileinfo)
    }
}

/// Error returned by [`ModuleRegistry::get`] and friends.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown module id: {0}")]
    NotFound(String),
    /// Raised only by [`ModuleRegistry::insert_distinct`], which refuses to
    /// silently shadow an id the way [`ModuleRegistry::register`] does.
    #[error("module id already registered: {0}")]
    DuplicateId(String),
}

/// Append-only catalogue of module definitions, keyed by id.
///
/// Built once at startup and shared with the engine as `Arc<ModuleRegistry>`,
/// constructed once and passed explicitly into the engine rather than kept
/// as global mutable state.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    definitions: HashMap<String, ModuleDefinition>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from an iterator of definitions, in order.
    pub fn from_definitions(defs: impl IntoIterator<Item = ModuleDefinition>) -> Arc<Self> {
        let mut registry = Self::new();
        for def in defs {
            registry.register(def);
        }
        Arc::new(registry)
    }

    /// Register a definition. If `id` already existed, its `version` field
    /// is overwritten with the caller-supplied version string (no
    /// `"{prev}+1"` bumping is assumed) and the previous version string is
    /// returned so callers can evict stale fingerprints.
    pub fn register(&mut self, def: ModuleDefinition) -> Option<String> {
        self.definitions.insert(def.id.clone(), def).map(|old| old.version)
    }

    /// Like [`ModuleRegistry::register`], but fails if `id` is already present.
    pub fn insert_distinct(&mut self, def: ModuleDefinition) -> Result<(), RegistryError> {
        if self.definitions.contains_key(&def.id) {
            return Err(RegistryError::DuplicateId(def.id));
        }
        self.definitions.insert(def.id.clone(), def);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&ModuleDefinition, RegistryError> {
        self.definitions
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.definitions.contains_key(id)
    }

    /// Current version string for `id`, used when building the versioned
    /// template slice for fingerprinting.
    pub fn current_version(&self, id: &str) -> Result<&str, RegistryError> {
        self.get(id).map(|d| d.version.as_str())
    }

    pub fn list(&self) -> Vec<&ModuleDefinition> {
        let mut defs: Vec<_> = self.definitions.values().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
