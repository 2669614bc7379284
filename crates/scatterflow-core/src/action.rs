//! The external collaborator that actually computes a module's outputs.
//! The engine resolves inputs, merges configuration, and hands both to
//! this trait — it never interprets a module's body itself; a concrete
//! library of reduction modules is a separate concern entirely.

use crate::cache::Value;
use crate::datatype::FieldValue;
use async_trait::async_trait;
use std::collections::HashMap;

pub use crate::fingerprint::ReturnType;

/// Everything an action needs to compute one node's outputs.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub module_id: String,
    /// Upstream values bound to each input id. A `Vec` even for
    /// single-valued inputs; only inputs declared `multiple` carry more
    /// than one entry.
    pub inputs: HashMap<String, Vec<Value>>,
    pub config: HashMap<String, FieldValue>,
    pub return_type: ReturnType,
}

/// Output values a dispatched action produced, keyed by output id.
pub type ActionOutputs = HashMap<String, Value>;

/// Raised by an action when it cannot compute its outputs. The engine
/// attaches node/module context to turn this into an
/// [`crate::error::Error::ModuleError`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ActionError(pub String);

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        ActionError(message.into())
    }
}

/// Computes a single module's outputs from its resolved inputs and
/// configuration. Implementations are the only place that knows what a
/// given `module_id` actually does; the engine treats it as opaque.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, request: ActionRequest) -> Result<ActionOutputs, ActionError>;
}
