//! The in-memory DAG of module instances and typed wires, plus
//! import/export/validate/topo_order.

use crate::datatype::FieldValue;
use crate::error::{Error, Result};
use crate::registry::{FieldKind, ModuleRegistry};
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

/// A node's identity within a template: its positional index into `modules[]`.
/// There is no separate node-id namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleIndex(pub usize);

impl From<usize> for ModuleIndex {
    fn from(i: usize) -> Self {
        ModuleIndex(i)
    }
}

impl std::fmt::Display for ModuleIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node in a [`Template`]: an instance of a registered [`crate::registry::ModuleDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Id of the [`crate::registry::ModuleDefinition`] this instance is of.
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    /// Per-node field configuration; the only mutable per-node state.
    #[serde(default)]
    pub config: HashMap<String, FieldValue>,
    /// The registry version this instance was authored against, if known.
    /// Parsing tolerates this being stale; the fingerprint always uses the
    /// *current* registry version instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A directed connection from one module's output terminal to another's input terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wire {
    pub source: (ModuleIndex, String),
    pub target: (ModuleIndex, String),
}

/// The user-authored DAG: modules, wires, and an optional per-node override
/// layer for file-input configuration (used when reloading from headers).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub modules: Vec<Module>,
    #[serde(default)]
    pub wires: Vec<Wire>,
    /// Override layer: `node index -> field id -> value`. Takes precedence
    /// over `module.config` for `fileinfo` fields only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<usize, HashMap<String, FieldValue>>,
}

impl Template {
    /// Parse a template from its JSON wire form, failing if any module id is
    /// unknown to `registry`. Stale `version` fields on individual modules
    /// are tolerated — see [`Module::version`].
    pub fn import(serialized: &str, registry: &ModuleRegistry) -> Result<Self> {
        let template: Template = serde_json::from_str(serialized)
            .map_err(|e| Error::invalid_template(format!("malformed JSON: {e}")))?;
        for (idx, module) in template.modules.iter().enumerate() {
            if !registry.contains(&module.module) {
                return Err(Error::invalid_template(format!(
                    "node {idx}: unknown module id {:?}",
                    module.module
                )));
            }
        }
        Ok(template)
    }

    /// Serialize back to the JSON wire form.
    pub fn export(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::invalid_template(format!("failed to serialize template: {e}")))
    }

    fn module_at(&self, idx: ModuleIndex) -> Option<&Module> {
        self.modules.get(idx.0)
    }

    /// Structural validation: every wire endpoint exists and is declared,
    /// datatypes are compatible, no duplicate singleton-input wires, and the
    /// graph is acyclic.
    pub fn validate(&self, registry: &ModuleRegistry) -> Result<()> {
        let n = self.modules.len();

        // Look up each node's definition once.
        let mut defs = Vec::with_capacity(n);
        for (idx, module) in self.modules.iter().enumerate() {
            let def = registry
                .get(&module.module)
                .map_err(|_| Error::invalid_template(format!("node {idx}: unknown module id {:?}", module.module)))?;
            defs.push(def);
        }

        let mut singleton_targets: HashSet<(ModuleIndex, String)> = HashSet::new();

        for (wire_idx, wire) in self.wires.iter().enumerate() {
            let (src_node, src_out) = &wire.source;
            let (dst_node, dst_in) = &wire.target;

            if src_node.0 >= n {
                return Err(Error::validation(
                    "dangling_source",
                    format!("wire {wire_idx}: source node {src_node} out of range"),
                ));
            }
            if dst_node.0 >= n {
                return Err(Error::validation(
                    "dangling_target",
                    format!("wire {wire_idx}: target node {dst_node} out of range"),
                ));
            }

            let src_def = defs[src_node.0];
            let dst_def = defs[dst_node.0];

            let src_output = src_def.output(src_out).ok_or_else(|| {
                Error::validation(
                    "unknown_output",
                    format!("wire {wire_idx}: {src_node}.{src_out} is not an output of {}", src_def.id),
                )
            })?;
            let dst_input = dst_def.input(dst_in).ok_or_else(|| {
                Error::validation(
                    "unknown_input",
                    format!("wire {wire_idx}: {dst_node}.{dst_in} is not an input of {}", dst_def.id),
                )
            })?;

            if src_output.datatype != dst_input.datatype {
                return Err(Error::validation(
                    "datatype_mismatch",
                    format!(
                        "wire {wire_idx}: {} != {}",
                        src_output.datatype, dst_input.datatype
                    ),
                ));
            }

            if !dst_input.multiple {
                let key = (*dst_node, dst_in.clone());
                if !singleton_targets.insert(key) {
                    return Err(Error::validation(
                        "duplicate_singleton_input",
                        format!("wire {wire_idx}: {dst_node}.{dst_in} accepts only one wire"),
                    ));
                }
            }
        }

        // Acyclic check reuses the same ordering algorithm as topo_order.
        self.topo_order(None)?;

        Ok(())
    }

    /// Kahn-style topological order. With `target` omitted, orders every
    /// node; with `target` given, orders only nodes reachable backwards
    /// from it (its ancestor set, inclusive). Ties break by ascending
    /// original index so fingerprints are deterministic.
    pub fn topo_order(&self, target: Option<ModuleIndex>) -> Result<Vec<ModuleIndex>> {
        let n = self.modules.len();
        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::with_capacity(n, self.wires.len());
        for i in 0..n {
            graph.add_node(i);
        }
        for wire in &self.wires {
            graph.add_edge(wire.source.0 .0, wire.target.0 .0, ());
        }

        let scope: HashSet<usize> = match target {
            None => (0..n).collect(),
            Some(t) => self.ancestors_inclusive(&graph, t.0),
        };

        // in_degree counts distinct predecessor nodes within scope only.
        let mut in_degree: HashMap<usize, usize> = HashMap::new();
        for &node in &scope {
            let count = graph
                .neighbors_directed(node, petgraph::Direction::Incoming)
                .filter(|p| scope.contains(p))
                .count();
            in_degree.insert(node, count);
        }

        // Min-heap (by node index, ascending) of currently-ready nodes, for
        // a stable, deterministic extraction order.
        let mut ready: BinaryHeap<std::cmp::Reverse<usize>> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&node, _)| std::cmp::Reverse(node))
            .collect();

        let mut order = Vec::with_capacity(scope.len());
        while let Some(std::cmp::Reverse(node)) = ready.pop() {
            order.push(ModuleIndex(node));
            for succ in graph.neighbors_directed(node, petgraph::Direction::Outgoing) {
                if !scope.contains(&succ) {
                    continue;
                }
                let deg = in_degree.get_mut(&succ).expect("scoped node has in_degree entry");
                *deg -= 1;
                if *deg == 0 {
                    ready.push(std::cmp::Reverse(succ));
                }
            }
        }

        if order.len() != scope.len() {
            let scheduled: HashSet<usize> = order.iter().map(|m| m.0).collect();
            let mut residual: Vec<ModuleIndex> = scope
                .into_iter()
                .filter(|n| !scheduled.contains(n))
                .map(ModuleIndex)
                .collect();
            residual.sort();
            return Err(Error::CyclicDependency { nodes: residual });
        }

        Ok(order)
    }

    /// All nodes that can reach `target` by following wires forward
    /// (i.e. `target`'s ancestors), including `target` itself.
    fn ancestors_inclusive(&self, graph: &DiGraphMap<usize, ()>, target: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack = vec![target];
        while let Some(node) = stack.pop() {
            if !seen.insert(node) {
                continue;
            }
            for pred in graph.neighbors_directed(node, petgraph::Direction::Incoming) {
                stack.push(pred);
            }
        }
        seen
    }

    /// Incoming wires into `(node, input_id)`, in wire-list order.
    pub fn incoming_wires<'a>(
        &'a self,
        node: ModuleIndex,
        input_id: &'a str,
    ) -> impl Iterator<Item = &'a Wire> + 'a {
        self.wires
            .iter()
            .filter(move |w| w.target.0 == node && w.target.1 == input_id)
    }

    /// Resolve the effective configuration for `node`: registry defaults,
    /// overlaid by the module's own `config`, overlaid by the template-level
    /// override layer restricted to `fileinfo` fields.
    pub fn effective_config(
        &self,
        node: ModuleIndex,
        registry: &ModuleRegistry,
    ) -> Result<HashMap<String, FieldValue>> {
        let module = self
            .module_at(node)
            .ok_or_else(|| Error::invalid_template(format!("node {node} out of range")))?;
        let def = registry.get(&module.module).map_err(|e| Error::invalid_template(e.to_string()))?;

        let mut resolved: HashMap<String, FieldValue> = HashMap::new();
        for field in &def.fields {
            if let Some(default) = &field.default {
                if let Ok(value) = serde_json::from_value::<FieldValue>(default.clone()) {
                    resolved.insert(field.id.clone(), value);
                }
            }
        }
        for (key, value) in &module.config {
            resolved.insert(key.clone(), value.clone());
        }
        if let Some(overrides) = self.config.get(&node.0) {
            for field in def.fileinfo_fields() {
                if let Some(value) = overrides.get(&field.id) {
                    resolved.insert(field.id.clone(), value.clone());
                }
            }
        }
        Ok(resolved)
    }

    /// Overwrite the `mtime` of every bound `FileInfo` entry matching
    /// `(source, path)` at `node`'s `field_id`, wherever it is actually
    /// stored — the per-module `config` map, the template-level override
    /// layer, or both.
    pub fn update_fileinfo_mtime(&mut self, node: ModuleIndex, field_id: &str, source: &str, path: &str, new_mtime: i64) {
        if let Some(module) = self.modules.get_mut(node.0) {
            if let Some(FieldValue::FileInfo(files)) = module.config.get_mut(field_id) {
                for file in files.iter_mut() {
                    if file.source == source && file.path == path {
                        file.mtime = new_mtime;
                    }
                }
            }
        }
        if let Some(overrides) = self.config.get_mut(&node.0) {
            if let Some(FieldValue::FileInfo(files)) = overrides.get_mut(field_id) {
                for file in files.iter_mut() {
                    if file.source == source && file.path == path {
                        file.mtime = new_mtime;
                    }
                }
            }
        }
    }

    /// Every `fileinfo` field value bound anywhere in the template, for
    /// mtime revalidation.
    pub fn all_fileinfo_bindings(
        &self,
        registry: &ModuleRegistry,
    ) -> Result<Vec<(ModuleIndex, String, crate::datatype::FileInfo)>> {
        let mut out = Vec::new();
        for (idx, _) in self.modules.iter().enumerate() {
            let node = ModuleIndex(idx);
            let config = self.effective_config(node, registry)?;
            for (field_id, value) in &config {
                if let FieldValue::FileInfo(files) = value {
                    for file in files {
                        out.push((node, field_id.clone(), file.clone()));
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::DataType;
    use crate::registry::{InputDef, ModuleDefinition, OutputDef};

    fn def(id: &str, inputs: Vec<(&str, &str, bool, bool)>, outputs: Vec<(&str, &str)>) -> ModuleDefinition {
        ModuleDefinition {
            id: id.to_string(),
            version: "1".into(),
            name: id.into(),
            description: String::new(),
            inputs: inputs
                .into_iter()
                .map(|(id, dt, required, multiple)| InputDef {
                    id: id.into(),
                    datatype: DataType::new(dt),
                    required,
                    multiple,
                })
                .collect(),
            outputs: outputs
                .into_iter()
                .map(|(id, dt)| OutputDef { id: id.into(), datatype: DataType::new(dt), multiple: false })
                .collect(),
            fields: vec![],
        }
    }

    fn linear_chain_registry() -> ModuleRegistry {
        let mut reg = ModuleRegistry::new();
        reg.register(def("load", vec![], vec![("out", "refldata")]));
        reg.register(def(
            "scale",
            vec![("in", "refldata", true, false)],
            vec![("out", "refldata")],
        ));
        reg.register(def(
            "sum",
            vec![("in", "refldata", true, true)],
            vec![("out", "refldata")],
        ));
        reg
    }

    fn module(id: &str) -> Module {
        Module { module: id.into(), title: None, x: 0.0, y: 0.0, config: HashMap::new(), version: None }
    }

    #[test]
    fn topo_order_orders_ancestors_first() {
        let reg = linear_chain_registry();
        let t = Template {
            modules: vec![module("load"), module("scale"), module("sum")],
            wires: vec![
                Wire { source: (ModuleIndex(0), "out".into()), target: (ModuleIndex(1), "in".into()) },
                Wire { source: (ModuleIndex(1), "out".into()), target: (ModuleIndex(2), "in".into()) },
            ],
            config: BTreeMap::new(),
        };
        let order = t.topo_order(None).unwrap();
        assert_eq!(order, vec![ModuleIndex(0), ModuleIndex(1), ModuleIndex(2)]);
        t.validate(&reg).unwrap();
    }

    #[test]
    fn topo_order_restricted_to_target_ancestors() {
        let reg = linear_chain_registry();
        let t = Template {
            modules: vec![module("load"), module("load"), module("sum")],
            wires: vec![
                Wire { source: (ModuleIndex(0), "out".into()), target: (ModuleIndex(2), "in".into()) },
                Wire { source: (ModuleIndex(1), "out".into()), target: (ModuleIndex(2), "in".into()) },
            ],
            config: BTreeMap::new(),
        };
        t.validate(&reg).unwrap();
        let order = t.topo_order(Some(ModuleIndex(0))).unwrap();
        assert_eq!(order, vec![ModuleIndex(0)]);
    }

    #[test]
    fn cyclic_template_is_rejected() {
        let reg = linear_chain_registry();
        let t = Template {
            modules: vec![module("scale"), module("scale"), module("scale")],
            wires: vec![
                Wire { source: (ModuleIndex(0), "out".into()), target: (ModuleIndex(1), "in".into()) },
                Wire { source: (ModuleIndex(1), "out".into()), target: (ModuleIndex(2), "in".into()) },
                Wire { source: (ModuleIndex(2), "out".into()), target: (ModuleIndex(0), "in".into()) },
            ],
            config: BTreeMap::new(),
        };
        let err = t.validate(&reg).unwrap_err();
        match err {
            Error::CyclicDependency { mut nodes } => {
                nodes.sort();
                assert_eq!(nodes, vec![ModuleIndex(0), ModuleIndex(1), ModuleIndex(2)]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_singleton_wire_is_rejected() {
        let reg = linear_chain_registry();
        let t = Template {
            modules: vec![module("load"), module("load"), module("scale")],
            wires: vec![
                Wire { source: (ModuleIndex(0), "out".into()), target: (ModuleIndex(2), "in".into()) },
                Wire { source: (ModuleIndex(1), "out".into()), target: (ModuleIndex(2), "in".into()) },
            ],
            config: BTreeMap::new(),
        };
        let err = t.validate(&reg).unwrap_err();
        assert!(matches!(err, Error::ValidationError { kind, .. } if kind == "duplicate_singleton_input"));
    }

    #[test]
    fn unknown_module_id_fails_import() {
        let reg = linear_chain_registry();
        let raw = r#"{"modules":[{"module":"no_such_module","x":0,"y":0}],"wires":[]}"#;
        let err = Template::import(raw, &reg).unwrap_err();
        assert!(matches!(err, Error::InvalidTemplate { .. }));
    }

    #[test]
    fn fingerprint_independent_of_json_key_order_and_whitespace() {
        let a = r#"{"wires":[],"modules":[{"module":"load","x":1,"y":2}]}"#;
        let b = r#"{ "modules" : [ { "module":"load" , "x":1,"y":2} ], "wires":[] }"#;
        let reg = linear_chain_registry();
        let ta = Template::import(a, &reg).unwrap();
        let tb = Template::import(b, &reg).unwrap();
        assert_eq!(ta.modules.len(), tb.modules.len());
        assert_eq!(ta.modules[0].module, tb.modules[0].module);
    }
}
