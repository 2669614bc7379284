//! Shared test doubles for integration tests: an [`ActionDispatcher`] that
//! implements a handful of trivial reduction modules, and an in-memory
//! [`FileStore`].

use async_trait::async_trait;
use scatterflow_core::action::{ActionDispatcher, ActionError, ActionOutputs, ActionRequest};
use scatterflow_core::datatype::FieldValue;
use scatterflow_core::filestore::{DirEntry, FileMetadata, FileStore, FileStoreResult};
use scatterflow_core::lm::{fit, FitOptions, ParamInfo};
use scatterflow_core::registry::{FieldDef, FieldKind, InputDef, ModuleDefinition, ModuleRegistry, OutputDef};
use nalgebra::DVector;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Install a `fmt` subscriber for integration tests that want to observe
/// the engine's `#[instrument]` spans. Safe to call from every test in a
/// binary — `try_init` is a no-op past the first successful call.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn values_of(value: &serde_json::Value) -> Vec<f64> {
    value
        .get("values")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|x| x.as_f64()).collect())
        .unwrap_or_default()
}

fn csv_to_values(csv: &str) -> Vec<f64> {
    csv.split(',').filter_map(|s| s.trim().parse::<f64>().ok()).collect()
}

/// Implements `load`, `xy_load`, `scale`, `sum`, and `linear_fit` for
/// end-to-end engine scenarios. `load`/`xy_load` read their numbers
/// directly out of the bound `FileInfo`'s path rather than through a
/// [`FileStore`] — the dispatcher contract never receives file bytes, only
/// the bound path/source, so a real implementation would own its own
/// file-reading collaborator; this test double inlines the "file content"
/// into the path to stay self-contained.
#[derive(Default)]
pub struct TestDispatcher {
    dispatch_count: std::sync::atomic::AtomicUsize,
}

impl TestDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of `dispatch` calls observed so far, for asserting that
    /// the engine's cache actually avoided redundant recomputation.
    pub fn dispatch_count(&self) -> usize {
        self.dispatch_count.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionDispatcher for TestDispatcher {
    async fn dispatch(&self, request: ActionRequest) -> Result<ActionOutputs, ActionError> {
        self.dispatch_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let mut out = HashMap::new();
        match request.module_id.as_str() {
            "load" => {
                let files = match request.config.get("file") {
                    Some(FieldValue::FileInfo(files)) if !files.is_empty() => files,
                    _ => return Err(ActionError::new("load: no file bound")),
                };
                let values = csv_to_values(&files[0].path);
                out.insert("out".to_string(), serde_json::json!({"values": values}));
            }
            "xy_load" => {
                let files = match request.config.get("file") {
                    Some(FieldValue::FileInfo(files)) if !files.is_empty() => files,
                    _ => return Err(ActionError::new("xy_load: no file bound")),
                };
                let (xs, ys): (Vec<f64>, Vec<f64>) = files[0]
                    .path
                    .split(';')
                    .filter_map(|pair| {
                        let (x, y) = pair.split_once(',')?;
                        Some((x.trim().parse::<f64>().ok()?, y.trim().parse::<f64>().ok()?))
                    })
                    .unzip();
                out.insert("out".to_string(), serde_json::json!({"x": xs, "y": ys}));
            }
            "scale" => {
                let input = request
                    .inputs
                    .get("in")
                    .and_then(|v| v.first())
                    .ok_or_else(|| ActionError::new("scale: no input"))?;
                let factor = match request.config.get("factor") {
                    Some(FieldValue::Scale { factor, .. }) => *factor,
                    Some(FieldValue::Float(f)) => *f,
                    _ => 1.0,
                };
                let scaled: Vec<f64> = values_of(input).into_iter().map(|v| v * factor).collect();
                out.insert("out".to_string(), serde_json::json!({"values": scaled}));
            }
            "sum" => {
                // Totals every element across every wired-in array into one
                // scalar, wrapped in the same `values` envelope every other
                // module here uses.
                let inputs = request.inputs.get("in").cloned().unwrap_or_default();
                let total: f64 = inputs.iter().flat_map(values_of).sum();
                out.insert("out".to_string(), serde_json::json!({"values": [total]}));
            }
            "linear_fit" => {
                let input = request
                    .inputs
                    .get("in")
                    .and_then(|v| v.first())
                    .ok_or_else(|| ActionError::new("linear_fit: no input"))?;
                let xs: Vec<f64> = input
                    .get("x")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|x| x.as_f64()).collect())
                    .unwrap_or_default();
                let ys: Vec<f64> = input
                    .get("y")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|x| x.as_f64()).collect())
                    .unwrap_or_default();
                let residual_fn = move |p: &DVector<f64>, _request_jac: bool| {
                    (DVector::from_iterator(xs.len(), xs.iter().zip(&ys).map(|(x, y)| (p[0] * x + p[1]) - y)), None)
                };
                let params0 = DVector::from_vec(vec![0.0, 0.0]);
                let info = vec![ParamInfo::free(), ParamInfo::free()];
                let options = FitOptions {
                    ftol: 1e-12,
                    xtol: 1e-12,
                    gtol: 1e-12,
                    max_iter: 100,
                    factor: 100.0,
                    damp: 0.0,
                    epsfcn: 0.0,
                    diag: None,
                    autoderivative: true,
                };
                let result = fit(residual_fn, params0, &info, &options);
                out.insert(
                    "out".to_string(),
                    serde_json::json!({"a": result.params[0], "b": result.params[1], "status": result.status.0}),
                );
            }
            other => return Err(ActionError::new(format!("unknown test module: {other}"))),
        }
        Ok(out)
    }
}

/// A trivially simple in-memory [`FileStore`], keyed by `(source, path)`.
#[derive(Default)]
pub struct MemoryFileStore {
    files: parking_lot::RwLock<HashMap<(String, String), (i64, Vec<u8>)>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: &str, path: &str, mtime: i64, bytes: Vec<u8>) {
        self.files.write().insert((source.to_string(), path.to_string()), (mtime, bytes));
    }

    pub fn touch(&self, source: &str, path: &str, new_mtime: i64) {
        if let Some(entry) = self.files.write().get_mut(&(source.to_string(), path.to_string())) {
            entry.0 = new_mtime;
        }
    }

    pub fn remove(&self, source: &str, path: &str) {
        self.files.write().remove(&(source.to_string(), path.to_string()));
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn metadata(&self, source: &str, path: &str) -> FileStoreResult<FileMetadata> {
        Ok(self
            .files
            .read()
            .get(&(source.to_string(), path.to_string()))
            .map(|(mtime, bytes)| FileMetadata { mtime: *mtime, size: bytes.len() as u64 }))
    }

    async fn read(&self, source: &str, path: &str) -> FileStoreResult<Vec<u8>> {
        Ok(self.files.read().get(&(source.to_string(), path.to_string())).map(|(_, bytes)| bytes.clone()))
    }

    async fn list_dir(&self, _source: &str, _path: &str) -> FileStoreResult<Vec<DirEntry>> {
        Ok(vec![])
    }

    fn sources(&self) -> Vec<String> {
        let guard = self.files.read();
        let set: HashSet<String> = guard.keys().map(|(source, _)| source.clone()).collect();
        set.into_iter().collect()
    }
}

fn values_output(id: &str) -> OutputDef {
    OutputDef { id: id.to_string(), datatype: "values".into(), multiple: false }
}

fn values_input(id: &str, multiple: bool) -> InputDef {
    InputDef { id: id.to_string(), datatype: "values".into(), required: true, multiple }
}

/// A small registry covering every module [`TestDispatcher`] knows about:
/// `load` and `xy_load` (roots, bind a `file` field), `scale` and `sum`
/// (single-input transforms), and `linear_fit` (consumes `xy_load`'s shape).
pub fn registry() -> Arc<ModuleRegistry> {
    let mut reg = ModuleRegistry::new();
    reg.register(ModuleDefinition {
        id: "load".into(),
        version: "1".into(),
        name: "Load".into(),
        description: String::new(),
        inputs: vec![],
        outputs: vec![values_output("out")],
        fields: vec![FieldDef {
            id: "file".into(),
            label: "File".into(),
            datatype: FieldKind::Fileinfo,
            default: None,
            multiple: false,
            typeattr: Default::default(),
        }],
    });
    reg.register(ModuleDefinition {
        id: "xy_load".into(),
        version: "1".into(),
        name: "Load XY".into(),
        description: String::new(),
        inputs: vec![],
        outputs: vec![OutputDef { id: "out".into(), datatype: "xy".into(), multiple: false }],
        fields: vec![FieldDef {
            id: "file".into(),
            label: "File".into(),
            datatype: FieldKind::Fileinfo,
            default: None,
            multiple: false,
            typeattr: Default::default(),
        }],
    });
    reg.register(ModuleDefinition {
        id: "scale".into(),
        version: "1".into(),
        name: "Scale".into(),
        description: String::new(),
        inputs: vec![values_input("in", false)],
        outputs: vec![values_output("out")],
        fields: vec![FieldDef {
            id: "factor".into(),
            label: "Factor".into(),
            datatype: FieldKind::Scale,
            default: None,
            multiple: false,
            typeattr: Default::default(),
        }],
    });
    reg.register(ModuleDefinition {
        id: "sum".into(),
        version: "1".into(),
        name: "Sum".into(),
        description: String::new(),
        inputs: vec![values_input("in", true)],
        outputs: vec![values_output("out")],
        fields: vec![],
    });
    reg.register(ModuleDefinition {
        id: "linear_fit".into(),
        version: "1".into(),
        name: "Linear Fit".into(),
        description: String::new(),
        inputs: vec![InputDef { id: "in".into(), datatype: "xy".into(), required: true, multiple: false }],
        outputs: vec![OutputDef { id: "out".into(), datatype: "fit".into(), multiple: false }],
        fields: vec![],
    });
    Arc::new(reg)
}
