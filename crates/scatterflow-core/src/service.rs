//! The outward-facing API contract: instrument/datasource discovery, file
//! metadata, template evaluation, upload, and satisfaction lookup. A thin
//! async trait over [`crate::engine::Engine`], [`crate::satisfaction`], and
//! [`crate::filestore::FileStore`] — the concrete transport (HTTP, RPC,
//! CLI) is a separate concern.

use crate::cache::Value;
use crate::engine::{CacheStatus, CalcRequest, FingerprintQuery};
use crate::error::Result;
use crate::filestore::FileMetadata;
use crate::registry::ModuleDefinition;
use crate::satisfaction::SatisfactionReport;
use crate::template::Template;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One instrument's menu: which module definitions it exposes and which
/// canned templates it ships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDescriptor {
    pub id: String,
    pub name: String,
    pub modules: Vec<ModuleDefinition>,
    pub templates: Vec<NamedTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedTemplate {
    pub name: String,
    pub template: Template,
}

/// One file-store source available for browsing/uploading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceDescriptor {
    pub name: String,
    pub description: String,
}

/// A single file handed to [`ReductionService::upload_datafiles`].
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub path: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ReductionService: Send + Sync {
    async fn list_instruments(&self) -> Result<Vec<InstrumentDescriptor>>;

    async fn list_datasources(&self) -> Result<Vec<DataSourceDescriptor>>;

    async fn get_instrument(&self, id: &str) -> Result<Option<InstrumentDescriptor>>;

    async fn get_file_metadata(&self, source: &str, path: &str) -> Result<Option<FileMetadata>>;

    /// Evaluate one terminal, via [`crate::engine::Engine::calc_terminal`].
    async fn calc_terminal(&self, request: CalcRequest) -> Result<Value>;

    /// Evaluate several terminals; sequential across requests.
    async fn calc_batch(&self, requests: Vec<CalcRequest>) -> Vec<Result<Value>>;

    /// Store uploaded files under `source`, returning each file's assigned path.
    async fn upload_datafiles(&self, source: &str, files: Vec<UploadedFile>) -> Result<Vec<String>>;

    /// Structural satisfaction analysis for a template, via
    /// [`crate::satisfaction::analyze`], without evaluating anything. A
    /// whole-template readiness check — distinct from [`Self::find_calculated`],
    /// which answers a single fingerprint's cache status.
    async fn analyze_satisfaction(&self, template: &Template) -> Result<SatisfactionReport>;

    /// Whether a value is already cached for one fingerprint query, without
    /// dispatching anything to compute it.
    async fn find_calculated(&self, query: &FingerprintQuery) -> Result<CacheStatus>;
}
