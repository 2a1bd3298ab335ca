//! Tools callable by the reference agent

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::llm::ToolSpec;

/// A tool the agent can invoke
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// Definition advertised to the model
    fn spec(&self) -> ToolSpec;

    /// Execute the tool with the model-supplied arguments
    async fn call(&self, arguments: Value) -> Result<Value>;

    fn name(&self) -> String {
        self.spec().name
    }
}

/// Tool backed by a synchronous closure
pub struct FnTool<F> {
    spec: ToolSpec,
    func: F,
}

impl<F> FnTool<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>, func: F) -> Self {
        Self {
            spec: ToolSpec {
                name: name.into(),
                description: description.into(),
                parameters: serde_json::json!({"type": "object"}),
            },
            func,
        }
    }

    /// Set the JSON schema of the arguments
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.spec.parameters = parameters;
        self
    }
}

#[async_trait]
impl<F> AgentTool for FnTool<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn call(&self, arguments: Value) -> Result<Value> {
        (self.func)(arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SnapshotError;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_tool() {
        let tool = FnTool::new("double", "Doubles n", |args: Value| {
            let n = args["n"]
                .as_i64()
                .ok_or_else(|| SnapshotError::Tool("n must be an integer".to_string()))?;
            Ok(json!({"result": n * 2}))
        });

        assert_eq!(tool.name(), "double");
        assert_eq!(tool.call(json!({"n": 21})).await.unwrap(), json!({"result": 42}));
        assert!(tool.call(json!({})).await.is_err());
    }
}
