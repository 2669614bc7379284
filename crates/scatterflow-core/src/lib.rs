//! Dataflow engine for neutron and X-ray scattering data reduction.
//!
//! A [`template::Template`] wires together instances of registered
//! [`registry::ModuleDefinition`]s into a DAG. [`engine::Engine`]
//! evaluates any terminal in that DAG, caching results by
//! [`fingerprint::Fingerprint`] and dispatching actual computation to an
//! external [`action::ActionDispatcher`]. [`satisfaction`] answers whether
//! a template *could* be evaluated given the files currently bound to it,
//! without running anything. [`lm`] fits reduced data to model curves.
//! [`reload`] recovers a template previously embedded in an exported file.

pub mod action;
pub mod cache;
pub mod config;
pub mod datatype;
pub mod engine;
pub mod error;
pub mod filestore;
pub mod fingerprint;
pub mod lm;
pub mod registry;
pub mod reload;
pub mod satisfaction;
pub mod service;
pub mod template;

pub use datatype::{DataType, FieldValue, FileInfo, TypeAttr};
pub use error::{Error, Result};
pub use fingerprint::{Fingerprint, ReturnType};
pub use registry::{FieldKind, ModuleDefinition, ModuleRegistry};
pub use template::{Module, ModuleIndex, Template, Wire};
