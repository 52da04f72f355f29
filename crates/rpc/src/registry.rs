//! Registry of named RPC targets consumed by pipeline orchestrations.
//!
//! Registration is the validation point: every referenced schema and enum
//! must already exist in the codec registry and targets must be well
//! formed, so a pipeline that resolves a tool at runtime can dispatch
//! without re-checking anything. Lookup is a plain map access.

use std::collections::HashMap;
use std::sync::Arc;

use qp_codec::Registry as CodecRegistry;

/// Remote endpoint a tool dispatches to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpTarget {
    pub host: String,
    pub port: u16,
    pub service: String,
    pub method: String,
    pub options: HashMap<String, String>,
}

impl McpTarget {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        service: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            service: service.into(),
            method: method.into(),
            options: HashMap::new(),
        }
    }

    fn validate(&self, tool: &str) -> Result<(), ToolRegistryError> {
        if self.host.is_empty()
            || self.port == 0
            || self.service.is_empty()
            || self.method.is_empty()
        {
            return Err(ToolRegistryError::InvalidTarget(format!(
                "tool '{tool}' target must name host, port, service and method"
            )));
        }
        Ok(())
    }
}

/// Optional retrieval-augmentation binding attached to a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RagBinding {
    pub rag_target: McpTarget,
    pub enabled_param: String,
    pub request_schema: String,
    pub response_schema: String,
    pub context_output_field: String,
    pub target_context_field: String,
    pub topics_source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolHandler {
    pub mcp_target: McpTarget,
    pub input_schema: String,
    pub output_schema: String,
    pub param_map: HashMap<String, String>,
    pub output_map: HashMap<String, String>,
    pub rag: Option<RagBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolRegistryError {
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("tool '{tool}' references undefined schema '{schema}'")]
    UnknownSchema { tool: String, schema: String },

    #[error("{0}")]
    InvalidTarget(String),
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, validating its target and every schema reference
    /// against `codec`.
    pub fn register(
        &mut self,
        codec: &CodecRegistry,
        name: &str,
        handler: ToolHandler,
    ) -> Result<(), ToolRegistryError> {
        if name.is_empty() {
            return Err(ToolRegistryError::InvalidTarget(
                "tool name must not be empty".into(),
            ));
        }
        if self.tools.contains_key(name) {
            return Err(ToolRegistryError::DuplicateTool(name.to_string()));
        }

        handler.mcp_target.validate(name)?;
        let require_schema = |schema: &str| -> Result<(), ToolRegistryError> {
            if codec.contains_schema(schema) {
                Ok(())
            } else {
                Err(ToolRegistryError::UnknownSchema {
                    tool: name.to_string(),
                    schema: schema.to_string(),
                })
            }
        };
        require_schema(&handler.input_schema)?;
        require_schema(&handler.output_schema)?;

        if let Some(rag) = &handler.rag {
            rag.rag_target.validate(name)?;
            require_schema(&rag.request_schema)?;
            require_schema(&rag.response_schema)?;
            if rag.enabled_param.is_empty() {
                return Err(ToolRegistryError::InvalidTarget(format!(
                    "tool '{name}' rag binding must name its enable parameter"
                )));
            }
        }

        self.tools.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }
}
