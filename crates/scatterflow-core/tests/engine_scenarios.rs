mod support;

use scatterflow_core::cache::{Cache, InMemoryCache};
use scatterflow_core::config::EngineConfig;
use scatterflow_core::datatype::{FieldValue, FileInfo};
use scatterflow_core::engine::{CalcRequest, CancelToken, Engine, FingerprintQuery};
use scatterflow_core::error::Error;
use scatterflow_core::fingerprint::ReturnType;
use scatterflow_core::template::{Module, ModuleIndex, Template, Wire};
use std::collections::HashMap;
use std::sync::Arc;
use support::{MemoryFileStore, TestDispatcher};

fn load_module(file_csv: &str) -> Module {
    let mut config = HashMap::new();
    config.insert(
        "file".to_string(),
        FieldValue::FileInfo(vec![FileInfo {
            source: "mem".to_string(),
            path: file_csv.to_string(),
            mtime: 1,
            entries: vec![],
        }]),
    );
    Module { module: "load".into(), title: None, x: 0.0, y: 0.0, config, version: None }
}

fn scale_module(factor: f64) -> Module {
    let mut config = HashMap::new();
    config.insert("factor".to_string(), FieldValue::Scale { factor, error: None });
    Module { module: "scale".into(), title: None, x: 1.0, y: 0.0, config, version: None }
}

fn chain_template() -> Template {
    Template {
        modules: vec![load_module("1,2,3"), scale_module(2.0)],
        wires: vec![Wire { source: (ModuleIndex(0), "out".into()), target: (ModuleIndex(1), "in".into()) }],
        config: Default::default(),
    }
}

fn new_engine(dispatcher: Arc<TestDispatcher>, filestore: Arc<MemoryFileStore>) -> Engine<TestDispatcher> {
    let registry = support::registry();
    let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
    let mut config = EngineConfig::default();
    config.mtime_revalidate = true;
    Engine::new(registry, cache, dispatcher, filestore, config)
}

fn sum_chain_template() -> Template {
    Template {
        modules: vec![load_module("1,2,3"), scale_module(2.0), Module {
            module: "sum".into(),
            title: None,
            x: 2.0,
            y: 0.0,
            config: HashMap::new(),
            version: None,
        }],
        wires: vec![
            Wire { source: (ModuleIndex(0), "out".into()), target: (ModuleIndex(1), "in".into()) },
            Wire { source: (ModuleIndex(1), "out".into()), target: (ModuleIndex(2), "in".into()) },
        ],
        config: Default::default(),
    }
}

#[tokio::test]
async fn three_node_chain_reduces_to_a_scaled_sum() {
    let dispatcher = Arc::new(TestDispatcher::new());
    let filestore = Arc::new(MemoryFileStore::new());
    filestore.insert("mem", "1,2,3", 1, b"1,2,3".to_vec());
    let engine = new_engine(dispatcher, filestore);

    let request = CalcRequest {
        template: sum_chain_template(),
        node: ModuleIndex(2),
        terminal: "out".to_string(),
        return_type: ReturnType::Full,
        export_type: None,
        concatenate: None,
    };
    let result = engine.calc_terminal(request, &CancelToken::new()).await.unwrap();
    assert_eq!(result, serde_json::json!({"values": [12.0]}));
}

#[tokio::test]
async fn linear_chain_evaluates_to_scaled_values() {
    support::init_tracing();
    let dispatcher = Arc::new(TestDispatcher::new());
    let filestore = Arc::new(MemoryFileStore::new());
    filestore.insert("mem", "1,2,3", 1, b"1,2,3".to_vec());
    let engine = new_engine(dispatcher, filestore);

    let request = CalcRequest {
        template: chain_template(),
        node: ModuleIndex(1),
        terminal: "out".to_string(),
        return_type: ReturnType::Full,
        export_type: None,
        concatenate: None,
    };
    let result = engine.calc_terminal(request, &CancelToken::new()).await.unwrap();
    assert_eq!(result, serde_json::json!({"values": [2.0, 4.0, 6.0]}));
}

#[tokio::test]
async fn find_calculated_reports_cache_status_without_evaluating() {
    let dispatcher = Arc::new(TestDispatcher::new());
    let filestore = Arc::new(MemoryFileStore::new());
    filestore.insert("mem", "1,2,3", 1, b"1,2,3".to_vec());
    let engine = new_engine(dispatcher.clone(), filestore);

    let query = FingerprintQuery {
        template: chain_template(),
        node: ModuleIndex(1),
        terminal: "out".to_string(),
        return_type: ReturnType::Full,
        export_type: None,
        concatenate: None,
    };

    let before = engine.find_calculated(&query).await.unwrap();
    assert!(!before.cached);
    assert_eq!(dispatcher.dispatch_count(), 0, "a status lookup must never dispatch");

    let request = CalcRequest {
        template: chain_template(),
        node: ModuleIndex(1),
        terminal: "out".to_string(),
        return_type: ReturnType::Full,
        export_type: None,
        concatenate: None,
    };
    engine.calc_terminal(request, &CancelToken::new()).await.unwrap();

    let after = engine.find_calculated(&query).await.unwrap();
    assert!(after.cached);
    assert_eq!(after.fingerprint, before.fingerprint, "the query is stable across calls");
}

#[tokio::test]
async fn repeated_request_reuses_cached_result() {
    let dispatcher = Arc::new(TestDispatcher::new());
    let filestore = Arc::new(MemoryFileStore::new());
    filestore.insert("mem", "1,2,3", 1, b"1,2,3".to_vec());
    let engine = new_engine(dispatcher.clone(), filestore);

    let request = || CalcRequest {
        template: chain_template(),
        node: ModuleIndex(1),
        terminal: "out".to_string(),
        return_type: ReturnType::Full,
        export_type: None,
        concatenate: None,
    };
    engine.calc_terminal(request(), &CancelToken::new()).await.unwrap();
    let first_dispatches = dispatcher.dispatch_count();
    engine.calc_terminal(request(), &CancelToken::new()).await.unwrap();

    assert_eq!(dispatcher.dispatch_count(), first_dispatches, "second request should hit the cache entirely");
}

#[tokio::test]
async fn stale_mtime_invalidates_the_cached_chain() {
    let dispatcher = Arc::new(TestDispatcher::new());
    let filestore = Arc::new(MemoryFileStore::new());
    filestore.insert("mem", "1,2,3", 1, b"1,2,3".to_vec());
    let engine = new_engine(dispatcher.clone(), filestore.clone());

    let request = || CalcRequest {
        template: chain_template(),
        node: ModuleIndex(1),
        terminal: "out".to_string(),
        return_type: ReturnType::Full,
        export_type: None,
        concatenate: None,
    };
    engine.calc_terminal(request(), &CancelToken::new()).await.unwrap();
    let first_dispatches = dispatcher.dispatch_count();

    filestore.touch("mem", "1,2,3", 2);
    let result = engine.calc_terminal(request(), &CancelToken::new()).await.unwrap();

    assert_eq!(result, serde_json::json!({"values": [2.0, 4.0, 6.0]}));
    assert!(dispatcher.dispatch_count() > first_dispatches, "mtime bump should force recomputation");
}

#[tokio::test]
async fn missing_file_surfaces_as_missing_file_error() {
    let dispatcher = Arc::new(TestDispatcher::new());
    let filestore = Arc::new(MemoryFileStore::new());
    // Deliberately never inserted into the store.
    let engine = new_engine(dispatcher, filestore);

    let request = CalcRequest {
        template: chain_template(),
        node: ModuleIndex(1),
        terminal: "out".to_string(),
        return_type: ReturnType::Full,
        export_type: None,
        concatenate: None,
    };
    let err = engine.calc_terminal(request, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::MissingFile { .. }));
}

#[tokio::test]
async fn cyclic_template_is_rejected_before_dispatch() {
    let dispatcher = Arc::new(TestDispatcher::new());
    let filestore = Arc::new(MemoryFileStore::new());
    let engine = new_engine(dispatcher.clone(), filestore);

    let mut template = chain_template();
    // Wire scale's output back into load's (nonexistent) input slot name,
    // forming a cycle through the two nodes.
    template.wires.push(Wire { source: (ModuleIndex(1), "out".into()), target: (ModuleIndex(0), "in".into()) });

    let request = CalcRequest {
        template,
        node: ModuleIndex(1),
        terminal: "out".to_string(),
        return_type: ReturnType::Full,
        export_type: None,
        concatenate: None,
    };
    let err = engine.calc_terminal(request, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::CyclicDependency { .. }));
    assert_eq!(dispatcher.dispatch_count(), 0, "a cyclic template must never reach dispatch");
}

#[tokio::test]
async fn linear_fit_chain_recovers_known_slope_and_intercept() {
    let dispatcher = Arc::new(TestDispatcher::new());
    let filestore = Arc::new(MemoryFileStore::new());
    let points: Vec<String> = (0..20).map(|i| format!("{},{}", i as f64, 3.0 * i as f64 + 5.0)).collect();
    let csv = points.join(";");
    filestore.insert("mem", &csv, 1, csv.clone().into_bytes());
    let engine = new_engine(dispatcher, filestore);

    let mut config = HashMap::new();
    config.insert(
        "file".to_string(),
        FieldValue::FileInfo(vec![FileInfo { source: "mem".into(), path: csv, mtime: 1, entries: vec![] }]),
    );
    let xy_load = Module { module: "xy_load".into(), title: None, x: 0.0, y: 0.0, config, version: None };
    let fit_node = Module { module: "linear_fit".into(), title: None, x: 1.0, y: 0.0, config: HashMap::new(), version: None };
    let template = Template {
        modules: vec![xy_load, fit_node],
        wires: vec![Wire { source: (ModuleIndex(0), "out".into()), target: (ModuleIndex(1), "in".into()) }],
        config: Default::default(),
    };

    let request = CalcRequest {
        template,
        node: ModuleIndex(1),
        terminal: "out".to_string(),
        return_type: ReturnType::Full,
        export_type: None,
        concatenate: None,
    };
    let result = engine.calc_terminal(request, &CancelToken::new()).await.unwrap();
    let a = result.get("a").and_then(|v| v.as_f64()).unwrap();
    let b = result.get("b").and_then(|v| v.as_f64()).unwrap();
    assert!((a - 3.0).abs() < 1e-6, "slope should converge near 3.0, got {a}");
    assert!((b - 5.0).abs() < 1e-6, "intercept should converge near 5.0, got {b}");
}
