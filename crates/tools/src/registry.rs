//! Tool registration and argument validation
//!
//! Handlers are registered once at session construction. Each handler may
//! declare a JSON Schema for its arguments; the schema is compiled at
//! registration time and enforced before every call.

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use voice_session_config::constants::tools::CALL_TIMEOUT_MS;
use voice_session_core::ToolDeclaration;

use crate::ToolError;

/// A locally executable tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Name the backend invokes this tool by
    fn name(&self) -> &str;

    /// Human-readable summary advertised in the session setup
    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema for the arguments. `None` skips validation.
    fn parameters(&self) -> Option<Value> {
        None
    }

    /// Execution budget for one call
    fn timeout(&self) -> Duration {
        Duration::from_millis(CALL_TIMEOUT_MS)
    }

    /// Execute the tool
    async fn call(&self, args: Value) -> Result<Value, ToolError>;
}

type FnToolFuture = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send>>;

/// Adapter turning an async closure into a [`ToolHandler`]
pub struct FnTool {
    name: String,
    description: String,
    parameters: Option<Value>,
    timeout: Duration,
    handler: Arc<dyn Fn(Value) -> FnToolFuture + Send + Sync>,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: None,
            timeout: Duration::from_millis(CALL_TIMEOUT_MS),
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ToolHandler for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Option<Value> {
        self.parameters.clone()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call(&self, args: Value) -> Result<Value, ToolError> {
        (self.handler)(args).await
    }
}

/// A handler plus its compiled argument schema
pub struct RegisteredTool {
    handler: Arc<dyn ToolHandler>,
    schema: Option<JSONSchema>,
}

impl RegisteredTool {
    pub fn name(&self) -> &str {
        self.handler.name()
    }

    pub fn timeout(&self) -> Duration {
        self.handler.timeout()
    }

    pub fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.handler.name().to_string(),
            description: self.handler.description().to_string(),
            parameters: self.handler.parameters(),
        }
    }

    /// Enforce the declared schema, if any
    pub fn validate_args(&self, args: &Value) -> Result<(), ToolError> {
        if let Some(schema) = &self.schema {
            if let Err(errors) = schema.validate(args) {
                let message = errors
                    .map(|err| err.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ToolError::InvalidArguments(message));
            }
        }
        Ok(())
    }

    pub async fn call(&self, args: Value) -> Result<Value, ToolError> {
        self.handler.call(args).await
    }
}

/// Tool registry
pub struct ToolRegistry {
    tools: HashMap<String, Arc<RegisteredTool>>,
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool, compiling its argument schema
    pub fn register<T: ToolHandler + 'static>(&mut self, tool: T) -> Result<(), ToolError> {
        self.register_boxed(Arc::new(tool))
    }

    /// Register a shared tool handler
    pub fn register_boxed(&mut self, tool: Arc<dyn ToolHandler>) -> Result<(), ToolError> {
        let name = tool.name().to_string();
        let schema = match tool.parameters() {
            Some(value) => Some(JSONSchema::compile(&value).map_err(|err| {
                ToolError::InvalidSchema {
                    name: name.clone(),
                    message: err.to_string(),
                }
            })?),
            None => None,
        };

        tracing::debug!(tool = %name, validated = schema.is_some(), "tool registered");
        self.tools.insert(
            name,
            Arc::new(RegisteredTool {
                handler: tool,
                schema,
            }),
        );
        Ok(())
    }

    /// Get tool by name
    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools.get(name).cloned()
    }

    /// Check if tool exists
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All tool names
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Declarations advertised to the backend, sorted by name
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut declarations: Vec<ToolDeclaration> =
            self.tools.values().map(|tool| tool.declaration()).collect();
        declarations.sort_by(|a, b| a.name.cmp(&b.name));
        declarations
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
