//! MCP server implementation using rmcp.
//!
//! Exposes the coordinator as a single `run_code` tool.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{error, info};

use crate::coordinator::Coordinator;
use crate::error::ExecuteError;
use crate::policy::{ALLOWED_BUILTINS, MAX_CODE_CHARS};

/// MCP server for restricted snippet execution.
#[derive(Clone)]
pub struct SandboxServer {
    coordinator: Arc<Coordinator>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the `run_code` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunCodeParams {
    /// The snippet to run.
    #[schemars(description = "The Python snippet to run (1 to 4000 characters)")]
    pub code: String,
}

#[tool_router]
impl SandboxServer {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            tool_router: Self::tool_router(),
        }
    }

    /// Run a snippet and return `{output, error, timed_out}` as JSON.
    #[tool(description = "Run a short Python snippet with a restricted set of builtins")]
    async fn run_code(
        &self,
        Parameters(params): Parameters<RunCodeParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(code_len = params.code.len(), "Running snippet");

        let result = self
            .coordinator
            .run(&params.code)
            .await
            .map_err(to_mcp_error)?;

        let body = serde_json::to_string(&result)
            .map_err(|e| McpError::internal_error(format!("Failed to encode result: {e}"), None))?;

        // Snippet errors and timeouts are results, not tool failures
        Ok(CallToolResult::success(vec![Content::text(body)]))
    }
}

fn to_mcp_error(err: ExecuteError) -> McpError {
    if err.is_client_error() {
        return McpError::invalid_params(err.to_string(), None);
    }
    error!(error = %err, "Execution failed");
    McpError::internal_error(err.to_string(), None)
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        let budget = self.coordinator.time_budget();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "kidslearn-sandbox".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Run short Python snippets for learners.\n\
                 \n\
                 Use the 'run_code' tool with:\n\
                 - code: up to {MAX_CODE_CHARS} characters\n\
                 \n\
                 Only these builtins exist: {}.\n\
                 Imports and names containing '__' are refused. Runs are \
                 stopped after {}ms.",
                ALLOWED_BUILTINS.join(", "),
                budget.as_millis()
            )),
        }
    }
}

/// Serve the sandbox server over stdio until the client disconnects.
pub async fn serve_stdio(coordinator: Arc<Coordinator>) -> anyhow::Result<()> {
    let server = SandboxServer::new(coordinator);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusyPolicy;
    use crate::pool::fake::{FakeSpawner, HANG};
    use crate::pool::{PoolConfig, WorkerPool};
    use std::time::Duration;

    fn server(busy_policy: BusyPolicy) -> SandboxServer {
        let config = PoolConfig {
            busy_policy,
            queue_timeout: Duration::from_millis(20),
            ..PoolConfig::default()
        };
        let pool = Arc::new(WorkerPool::new(Arc::new(FakeSpawner::default()), config));
        SandboxServer::new(Arc::new(Coordinator::new(pool, Duration::from_millis(50))))
    }

    fn body(result: &CallToolResult) -> serde_json::Value {
        let content = serde_json::to_value(&result.content[0]).unwrap();
        serde_json::from_str(content["text"].as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn run_code_returns_json_result() {
        let server = server(BusyPolicy::Queue);
        let params = Parameters(RunCodeParams {
            code: "hello".to_string(),
        });

        let result = server.run_code(params).await.unwrap();
        assert!(!result.is_error.unwrap_or(false));
        assert_eq!(
            body(&result),
            serde_json::json!({"output": "hello\n", "error": null, "timed_out": false})
        );
    }

    #[tokio::test]
    async fn timeout_is_a_successful_tool_call() {
        let server = server(BusyPolicy::Queue);
        let params = Parameters(RunCodeParams {
            code: HANG.to_string(),
        });

        let result = server.run_code(params).await.unwrap();
        assert!(!result.is_error.unwrap_or(false));
        assert_eq!(body(&result)["timed_out"], true);
    }

    #[tokio::test]
    async fn empty_code_is_invalid_params() {
        let server = server(BusyPolicy::Queue);
        let params = Parameters(RunCodeParams {
            code: String::new(),
        });

        let err = server.run_code(params).await.unwrap_err();
        assert_eq!(err.code, rmcp::model::ErrorCode::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn busy_pool_is_internal_error() {
        let server = server(BusyPolicy::Reject);
        let _held = server.coordinator.pool().claim().await.unwrap();
        let params = Parameters(RunCodeParams {
            code: "x".to_string(),
        });

        let err = server.run_code(params).await.unwrap_err();
        assert_eq!(err.code, rmcp::model::ErrorCode::INTERNAL_ERROR);
    }
}
