//! The async `calc_terminal` procedure that turns a template request into
//! a cached, dispatched value.

use crate::action::{ActionDispatcher, ActionRequest};
use crate::cache::{SharedCache, Value};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::filestore::FileStore;
use crate::fingerprint::{self, Fingerprint, ReturnType};
use crate::registry::ModuleRegistry;
use crate::template::{ModuleIndex, Template};
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use futures::future::{try_join_all, BoxFuture};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::instrument;

/// Cooperative cancellation handle shared across one evaluation's
/// recursive sub-calls. The engine checks it at each suspension point
/// (before recursing into an ancestor, and before dispatching an action);
/// it never interrupts work already in flight.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One `calc_terminal` request.
#[derive(Debug, Clone)]
pub struct CalcRequest {
    pub template: Template,
    pub node: ModuleIndex,
    pub terminal: String,
    pub return_type: ReturnType,
    pub export_type: Option<String>,
    /// Whether multi-file output should be concatenated. Part of the
    /// fingerprint even though it has no other effect in this crate: two
    /// requests differing only here must not collide on the same cache
    /// entry.
    pub concatenate: Option<bool>,
}

/// A fingerprint-keyed cache status query. Same shape as [`CalcRequest`]
/// minus anything that only matters once a value is actually computed.
#[derive(Debug, Clone)]
pub struct FingerprintQuery {
    pub template: Template,
    pub node: ModuleIndex,
    pub terminal: String,
    pub return_type: ReturnType,
    pub export_type: Option<String>,
    pub concatenate: Option<bool>,
}

/// Whether a value is already cached for one [`FingerprintQuery`].
#[derive(Debug, Clone)]
pub struct CacheStatus {
    pub fingerprint: Fingerprint,
    pub cached: bool,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The evaluation engine. Generic over the action dispatcher so a caller
/// can swap in a test double without touching engine internals.
pub struct Engine<R: ActionDispatcher> {
    registry: Arc<ModuleRegistry>,
    cache: SharedCache,
    dispatcher: Arc<R>,
    filestore: Arc<dyn FileStore>,
    config: EngineConfig,
    /// Single-flight registry: one `Notify` per fingerprint currently being
    /// computed, so concurrent requests for the same terminal share one
    /// dispatch instead of racing.
    inflight: DashMap<Fingerprint, Arc<tokio::sync::Notify>>,
    /// Bounds how many ancestor sub-evaluations run concurrently within a
    /// single request.
    subeval_limiter: Arc<tokio::sync::Semaphore>,
}

impl<R: ActionDispatcher + 'static> Engine<R> {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        cache: SharedCache,
        dispatcher: Arc<R>,
        filestore: Arc<dyn FileStore>,
        config: EngineConfig,
    ) -> Self {
        let subeval_limiter = Arc::new(tokio::sync::Semaphore::new(config.max_parallel_subevaluations.max(1)));
        Self { registry, cache, dispatcher, filestore, config, inflight: DashMap::new(), subeval_limiter }
    }

    /// Evaluate one terminal, reusing cached results wherever the
    /// fingerprint matches. Retries once, after a forced mtime
    /// revalidation, if the first attempt fails with the one recoverable
    /// error kind.
    #[instrument(skip(self, request, cancel), fields(node = %request.node, terminal = %request.terminal))]
    pub async fn calc_terminal(&self, mut request: CalcRequest, cancel: &CancelToken) -> Result<Value> {
        if self.config.mtime_revalidate {
            self.revalidate_mtimes(&mut request.template).await?;
        }

        match self.calc_terminal_once(&request, cancel).await {
            Err(e) if e.is_recoverable() => {
                self.revalidate_mtimes(&mut request.template).await?;
                self.calc_terminal_once(&request, cancel).await
            }
            other => other,
        }
    }

    async fn calc_terminal_once(&self, request: &CalcRequest, cancel: &CancelToken) -> Result<Value> {
        // Validates acyclicity of the ancestor set up front; the result
        // itself is unused because compute_node_output recurses wire by
        // wire rather than walking this order explicitly.
        request.template.topo_order(Some(request.node))?;

        self.eval_node_output(
            &request.template,
            request.node,
            request.terminal.clone(),
            request.return_type,
            request.export_type.clone(),
            request.concatenate,
            cancel,
        )
        .await
    }

    /// Evaluate a batch of requests. Requests are processed sequentially;
    /// work *within* a single request's ancestor graph may still run in
    /// parallel.
    pub async fn calc_batch(&self, requests: Vec<CalcRequest>, cancel: &CancelToken) -> Vec<Result<Value>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            if cancel.is_cancelled() {
                results.push(Err(Error::Cancelled));
                continue;
            }
            results.push(self.calc_terminal(request, cancel).await);
        }
        results
    }

    /// Walk every bound `fileinfo` entry, compare against the file-store's
    /// current metadata, and overwrite stale mtimes in place. A file the
    /// store no longer has raises [`Error::MissingFile`] directly — the
    /// one error kind the engine itself retries.
    async fn revalidate_mtimes(&self, template: &mut Template) -> Result<()> {
        let bindings = template.all_fileinfo_bindings(&self.registry)?;
        for (node, field_id, file) in bindings {
            let meta = self
                .filestore
                .metadata(&file.source, &file.path)
                .await
                .map_err(|e| Error::IoError(e.to_string()))?
                .ok_or_else(|| Error::MissingFile { source_name: file.source.clone(), path: file.path.clone() })?;
            if meta.mtime != file.mtime {
                template.update_fileinfo_mtime(node, &field_id, &file.source, &file.path, meta.mtime);
            }
        }
        Ok(())
    }

    /// Resolve one `(node, terminal)` through the cache, computing it via
    /// [`Self::compute_node_output`] on a miss. Recursive through ancestor
    /// wires, so this must return a boxed future.
    fn eval_node_output<'a>(
        &'a self,
        template: &'a Template,
        node: ModuleIndex,
        terminal: String,
        return_type: ReturnType,
        export_type: Option<String>,
        concatenate: Option<bool>,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let fp = fingerprint::compute(
                template,
                &self.registry,
                node,
                &terminal,
                return_type,
                export_type.as_deref(),
                concatenate,
            )?;

            if let Some(value) = self.cache.get(&fp).await {
                return Ok(value);
            }

            // Become the leader for this fingerprint, or wait on whoever is.
            loop {
                match self.inflight.entry(fp.clone()) {
                    DashEntry::Occupied(entry) => {
                        let notify = entry.get().clone();
                        drop(entry);
                        notify.notified().await;
                        if let Some(value) = self.cache.get(&fp).await {
                            return Ok(value);
                        }
                        // Leader's attempt failed; loop around to try leading ourselves.
                        continue;
                    }
                    DashEntry::Vacant(entry) => {
                        entry.insert(Arc::new(tokio::sync::Notify::new()));
                        break;
                    }
                }
            }

            let result = self
                .compute_node_output(template, node, &terminal, return_type, export_type.as_deref(), concatenate, cancel)
                .await;

            if let Some((_, notify)) = self.inflight.remove(&fp) {
                notify.notify_waiters();
            }

            if let Ok(ref value) = result {
                self.cache.put(fp, value.clone(), now_ms()).await;
            }
            result
        })
    }

    /// Resolve a node's inputs (recursing into upstream wires), merge its
    /// effective configuration, and dispatch the action.
    async fn compute_node_output(
        &self,
        template: &Template,
        node: ModuleIndex,
        terminal: &str,
        return_type: ReturnType,
        export_type: Option<&str>,
        concatenate: Option<bool>,
        cancel: &CancelToken,
    ) -> Result<Value> {
        let module = template
            .modules
            .get(node.0)
            .ok_or_else(|| Error::invalid_template(format!("node {node} out of range")))?;
        let def = self.registry.get(&module.module).map_err(|e| Error::invalid_template(e.to_string()))?;

        let mut inputs: HashMap<String, Vec<Value>> = HashMap::new();
        for input in &def.inputs {
            let wires: Vec<_> = template.incoming_wires(node, &input.id).cloned().collect();
            if wires.is_empty() {
                if input.required {
                    return Err(Error::ModuleError {
                        node,
                        module_id: def.id.clone(),
                        message: format!("required input {:?} is unbound", input.id),
                    });
                }
                continue;
            }

            // Independent upstream wires evaluate concurrently within this
            // one request, bounded by max_parallel_subevaluations.
            let futures = wires.into_iter().map(|wire| {
                let (src_node, src_terminal) = wire.source;
                async move {
                    let _permit = self
                        .subeval_limiter
                        .acquire()
                        .await
                        .expect("semaphore is never closed");
                    self.eval_node_output(template, src_node, src_terminal, ReturnType::Full, None, None, cancel).await
                }
            });
            let values = try_join_all(futures).await?;
            inputs.insert(input.id.clone(), values);
        }

        let config = template.effective_config(node, &self.registry)?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let request = ActionRequest {
            module_id: def.id.clone(),
            inputs,
            config,
            return_type,
        };
        let outputs = self
            .dispatcher
            .dispatch(request)
            .await
            .map_err(|e| Error::ModuleError { node, module_id: def.id.clone(), message: e.0 })?;

        outputs.get(terminal).cloned().ok_or_else(|| Error::ModuleError {
            node,
            module_id: def.id.clone(),
            message: format!("action produced no output named {terminal:?}"),
        })
    }

    /// Report whether `query`'s fingerprint already has a cached value,
    /// without dispatching anything to compute it. Distinct from
    /// [`crate::satisfaction::analyze`]'s whole-template structural
    /// readiness check: this is a cache lookup keyed by one fingerprint.
    pub async fn find_calculated(&self, query: &FingerprintQuery) -> Result<CacheStatus> {
        let fp = fingerprint::compute(
            &query.template,
            &self.registry,
            query.node,
            &query.terminal,
            query.return_type,
            query.export_type.as_deref(),
            query.concatenate,
        )?;
        let cached = self.cache.get(&fp).await.is_some();
        Ok(CacheStatus { fingerprint: fp, cached })
    }

    /// Evict persistent/in-memory cache entries older than the configured
    /// max age, then trim down to the configured entry-count cap if one is
    /// set. Either knob can be disabled independently.
    pub async fn evict_stale_cache_entries(&self) -> usize {
        let mut evicted = 0;
        if let Some(max_age) = self.config.cache_max_age_secs {
            let cutoff = now_ms() - max_age * 1000;
            evicted += self.cache.evict_older_than(cutoff).await;
        }
        if let Some(max_entries) = self.config.cache_max_entries {
            evicted += self.cache.evict_lru_excess(max_entries).await;
        }
        evicted
    }
}
