//! A pure structural analysis of which modules, wires, and terminals can
//! actually be evaluated given the files currently bound in a template.
//! Never dispatches an action and never touches the cache — it only
//! reasons about bindings and wiring.

use crate::error::Result;
use crate::registry::ModuleRegistry;
use crate::template::{ModuleIndex, Template};
use std::collections::HashMap;

/// Result of [`analyze`]: per-module, per-wire, and per-terminal
/// satisfaction flags for one template snapshot.
#[derive(Debug, Clone, Default)]
pub struct SatisfactionReport {
    pub modules: HashMap<ModuleIndex, bool>,
    /// Parallel to `template.wires` — `wires[i]` reports on the `i`-th wire.
    pub wires: Vec<bool>,
    pub terminals: HashMap<(ModuleIndex, String), bool>,
}

impl SatisfactionReport {
    pub fn is_module_satisfied(&self, node: ModuleIndex) -> bool {
        self.modules.get(&node).copied().unwrap_or(false)
    }

    pub fn is_terminal_satisfied(&self, node: ModuleIndex, output_id: &str) -> bool {
        self.terminals.get(&(node, output_id.to_string())).copied().unwrap_or(false)
    }
}

/// A module is satisfied iff every `fileinfo` field it declares is bound to
/// at least one file, and every required input has at least one incoming
/// wire, all of whose sources are themselves satisfied. A terminal is
/// satisfied iff its owning module is; a wire is satisfied iff its source
/// module is. This is a conjunction of positive facts — adding a file
/// binding or a wire can only flip `false` to `true`, never the reverse.
pub fn analyze(template: &Template, registry: &ModuleRegistry) -> Result<SatisfactionReport> {
    let order = template.topo_order(None)?;
    let mut module_satisfied: HashMap<ModuleIndex, bool> = HashMap::new();

    for node in &order {
        let module = &template.modules[node.0];
        let def = registry.get(&module.module).map_err(|e| crate::error::Error::invalid_template(e.to_string()))?;
        let config = template.effective_config(*node, registry)?;

        let fileinfo_ok = def
            .fileinfo_fields()
            .all(|field| config.get(&field.id).map(|v| v.is_bound_fileinfo()).unwrap_or(false));

        let inputs_ok = def.inputs.iter().all(|input| {
            let wires: Vec<_> = template.incoming_wires(*node, &input.id).collect();
            if wires.is_empty() {
                return !input.required;
            }
            wires
                .iter()
                .all(|wire| *module_satisfied.get(&wire.source.0).unwrap_or(&false))
        });

        module_satisfied.insert(*node, fileinfo_ok && inputs_ok);
    }

    let wires = template
        .wires
        .iter()
        .map(|wire| *module_satisfied.get(&wire.source.0).unwrap_or(&false))
        .collect();

    let mut terminals = HashMap::new();
    for (idx, module) in template.modules.iter().enumerate() {
        let node = ModuleIndex(idx);
        let def = registry.get(&module.module).map_err(|e| crate::error::Error::invalid_template(e.to_string()))?;
        let satisfied = *module_satisfied.get(&node).unwrap_or(&false);
        for output in &def.outputs {
            terminals.insert((node, output.id.clone()), satisfied);
        }
    }

    Ok(SatisfactionReport { modules: module_satisfied, wires, terminals })
}
