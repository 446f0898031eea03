//! Named async handlers the server can call.

pub mod builtin;
pub mod kubernetes;

use std::collections::HashMap;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::protocol::models::Tool;
use crate::{Error, Result};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

type ToolHandler = Box<dyn Fn(Value) -> BoxFuture<Result<Value>> + Send + Sync>;

/// Arguments for tools that take none.
#[derive(Debug, Clone, Copy, Default, serde::Deserialize, JsonSchema)]
pub struct NoArgs {}

#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

#[derive(Clone, Debug)]
pub struct ToolCall {
    pub name: String,
    pub call_id: String,
    pub arguments: Value,
}

/// Outcome of a dispatch. Failures are carried as data, never as `Err`.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub output: Value,
    pub error: Option<String>,
}

impl ToolResult {
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    fn failure(call_id: String, message: String) -> Self {
        Self {
            call_id,
            output: json!({ "error": message }),
            error: Some(message),
        }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    defs: Vec<ToolDefinition>,
    handlers: HashMap<String, ToolHandler>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry").field("defs", &self.defs).finish_non_exhaustive()
    }
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the clock, random-number and kubectl tools.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        kubernetes::register(&mut registry);
        registry
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Protocol descriptors advertised in `session.update`.
    #[must_use]
    pub fn definitions(&self) -> Vec<Tool> {
        self.defs
            .iter()
            .map(|def| Tool::Function {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            })
            .collect()
    }

    /// Register a typed tool. The parameter schema is derived from `TArgs`.
    pub fn tool<TArgs, TResp, F, Fut>(&mut self, name: &str, description: impl Into<String>, handler: F)
    where
        TArgs: DeserializeOwned + JsonSchema + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        let schema = schemars::schema_for!(TArgs);
        let mut parameters = serde_json::to_value(&schema).unwrap_or_else(|_| json!({ "type": "object" }));
        if let Some(obj) = parameters.as_object_mut() {
            obj.remove("$schema");
            obj.remove("title");
        }

        let user_handler = Arc::new(handler);
        let handler = move |value: Value| -> BoxFuture<Result<Value>> {
            let user_handler = Arc::clone(&user_handler);
            Box::pin(async move {
                let args: TArgs = serde_json::from_value(value)
                    .map_err(|e| Error::Tool(format!("invalid arguments: {e}")))?;
                let resp = user_handler(args).await?;
                serde_json::to_value(resp).map_err(|e| Error::Tool(e.to_string()))
            })
        };

        self.insert(name, Some(description.into()), parameters, Box::new(handler));
    }

    /// Register a tool that works on raw JSON with an explicit schema.
    pub fn raw_tool<F, Fut>(&mut self, name: &str, description: impl Into<String>, parameters: Value, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler = move |value: Value| -> BoxFuture<Result<Value>> { Box::pin(handler(value)) };
        self.insert(name, Some(description.into()), parameters, Box::new(handler));
    }

    fn insert(&mut self, name: &str, description: Option<String>, parameters: Value, handler: ToolHandler) {
        if self.handlers.contains_key(name) {
            tracing::warn!(tool = name, "Replacing previously registered tool");
            self.defs.retain(|def| def.name != name);
        }
        self.defs.push(ToolDefinition {
            name: name.to_string(),
            description,
            parameters,
        });
        self.handlers.insert(name.to_string(), handler);
    }

    /// Run the named handler. Unknown tools and handler failures become an
    /// `{"error": ...}` result.
    pub async fn dispatch(&self, call: ToolCall) -> ToolResult {
        let Some(handler) = self.handlers.get(&call.name) else {
            let message = format!("Function '{}' not found. Add it to the tool registry.", call.name);
            tracing::error!(tool = %call.name, call_id = %call.call_id, "{message}");
            return ToolResult::failure(call.call_id, message);
        };

        let arguments = call.arguments;
        let outcome = AssertUnwindSafe(async move { handler(arguments).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::Tool(format!("handler panicked: {}", panic_message(&*panic)))));

        match outcome {
            Ok(output) => {
                tracing::info!(tool = %call.name, call_id = %call.call_id, result = %output, "Tool call finished");
                ToolResult {
                    call_id: call.call_id,
                    output,
                    error: None,
                }
            }
            Err(err) => {
                let message = format!("Error executing function '{}': {err}", call.name);
                tracing::error!(tool = %call.name, call_id = %call.call_id, "{message}");
                ToolResult::failure(call.call_id, message)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct SumArgs {
        a: i32,
        b: i32,
    }

    #[derive(Debug, Serialize)]
    struct SumResp {
        sum: i32,
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.tool("sum", "Add two integers.", |args: SumArgs| async move {
            Ok(SumResp { sum: args.a + args.b })
        });
        registry.raw_tool("explode", "Always fails.", json!({"type": "object"}), |_| async {
            Err(Error::Tool("kaboom".to_string()))
        });
        registry
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            call_id: "call_1".to_string(),
            arguments,
        }
    }

    #[test]
    fn typed_schema_is_derived() {
        let defs = registry().definitions();
        assert_eq!(defs.len(), 2);
        let Tool::Function { name, parameters, .. } = &defs[0];
        assert_eq!(name, "sum");
        assert_eq!(parameters["type"], "object");
        assert!(parameters["properties"]["a"].is_object());
        assert!(parameters.get("$schema").is_none());
    }

    #[tokio::test]
    async fn dispatch_success() {
        let result = registry().dispatch(call("sum", json!({"a": 2, "b": 3}))).await;
        assert!(!result.is_error());
        assert_eq!(result.output, json!({"sum": 5}));
        assert_eq!(result.call_id, "call_1");
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_as_data() {
        let result = registry().dispatch(call("nope", json!({}))).await;
        assert!(result.is_error());
        let message = result.output["error"].as_str().unwrap();
        assert!(message.contains("'nope' not found"));
    }

    #[tokio::test]
    async fn handler_failure_is_wrapped() {
        let result = registry().dispatch(call("explode", json!({}))).await;
        assert_eq!(
            result.error.as_deref(),
            Some("Error executing function 'explode': Tool execution failed: kaboom")
        );
    }

    #[tokio::test]
    async fn bad_arguments_do_not_panic() {
        let result = registry().dispatch(call("sum", json!({"a": "two"}))).await;
        assert!(result.is_error());
    }

    #[tokio::test]
    async fn panicking_handler_becomes_an_error_result() {
        let mut registry = registry();
        registry.raw_tool("crash", "Panics.", json!({"type": "object"}), |_| async {
            if true {
                panic!("index out of range");
            }
            Ok::<_, Error>(json!({}))
        });

        let result = registry.dispatch(call("crash", json!({}))).await;
        assert_eq!(
            result.error.as_deref(),
            Some("Error executing function 'crash': Tool execution failed: handler panicked: index out of range")
        );
        assert_eq!(result.output["error"], result.error.as_deref().unwrap());

        let result = registry.dispatch(call("sum", json!({"a": 1, "b": 1}))).await;
        assert_eq!(result.output, json!({"sum": 2}));
    }

    #[test]
    fn reregistering_replaces_definition() {
        let mut registry = registry();
        registry.raw_tool("sum", "Replaced.", json!({"type": "object"}), |_| async { Ok(json!({})) });
        assert_eq!(registry.definitions().len(), 2);
        assert!(registry.contains("sum"));
    }
}
