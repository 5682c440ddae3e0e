//! MCP stdio transport: bridges a [`GatewayToolRegistry`] onto
//! `rust-mcp-sdk`'s `ServerHandler` so the twelve gateway tools are reachable
//! by any MCP stdio client. Adapted from the teacher's `mcp.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use rust_mcp_sdk::{
    McpServer, StdioTransport, ToMcpServerHandler, TransportOptions,
    mcp_server::{McpServerOptions, ServerHandler, server_runtime},
    schema::{
        CallToolRequestParams, CallToolResult, Implementation, InitializeResult,
        LATEST_PROTOCOL_VERSION, ListToolsResult, PaginatedRequestParams, RpcError,
        ServerCapabilities, ServerCapabilitiesTools, TextContent, Tool as McpTool, ToolInputSchema,
    },
};
use tracing::info;

use rlm_core::error::{Result, RlmError};

use crate::tools::GatewayToolRegistry;

#[derive(Debug, Clone)]
pub struct StdioServerConfig {
    pub name: String,
    pub version: String,
    pub instructions: Option<String>,
}

impl Default for StdioServerConfig {
    fn default() -> Self {
        Self {
            name: "rlm-gateway".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instructions: None,
        }
    }
}

impl StdioServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

pub struct GatewayServerHandler {
    registry: Arc<GatewayToolRegistry>,
}

impl GatewayServerHandler {
    pub fn new(registry: Arc<GatewayToolRegistry>) -> Self {
        info!("initializing gateway MCP server handler");
        Self { registry }
    }
}

#[async_trait]
impl ServerHandler for GatewayServerHandler {
    async fn handle_list_tools_request(
        &self,
        _params: Option<PaginatedRequestParams>,
        _runtime: Arc<dyn McpServer>,
    ) -> std::result::Result<ListToolsResult, RpcError> {
        let tools: Vec<McpTool> = self
            .registry
            .tool_names()
            .into_iter()
            .filter_map(|name| self.registry.get(name))
            .map(|tool| {
                let input_schema: ToolInputSchema = serde_json::from_value(tool.parameters_schema())
                    .unwrap_or_else(|_| ToolInputSchema::new(vec![], None, None));
                McpTool {
                    name: tool.name().to_string(),
                    description: Some(tool.description().to_string()),
                    input_schema,
                    annotations: None,
                    execution: None,
                    icons: vec![],
                    meta: None,
                    output_schema: None,
                    title: None,
                }
            })
            .collect();

        Ok(ListToolsResult { tools, meta: None, next_cursor: None })
    }

    async fn handle_call_tool_request(
        &self,
        params: CallToolRequestParams,
        _runtime: Arc<dyn McpServer>,
    ) -> std::result::Result<CallToolResult, rust_mcp_sdk::schema::schema_utils::CallToolError> {
        let args = serde_json::Value::Object(params.arguments.unwrap_or_default());

        match self.registry.call(&params.name, args).await {
            Ok(result) => Ok(CallToolResult {
                content: vec![TextContent::new(
                    serde_json::to_string_pretty(&result).unwrap_or_default(),
                    None,
                    None,
                )
                .into()],
                is_error: None,
                meta: None,
                structured_content: None,
            }),
            Err(e) => Ok(CallToolResult {
                content: vec![TextContent::new(e.to_string(), None, None).into()],
                is_error: Some(true),
                meta: None,
                structured_content: None,
            }),
        }
    }
}

pub async fn run_stdio_server(registry: Arc<GatewayToolRegistry>, config: StdioServerConfig) -> Result<()> {
    info!("starting gateway MCP server: {}", config.name);

    let server_details = InitializeResult {
        server_info: Implementation {
            name: config.name.clone(),
            version: config.version.clone(),
            title: Some(format!("{} MCP Server", config.name)),
            description: Some("Retrieval-tool gateway exposed via MCP".to_string()),
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools { list_changed: None }),
            ..Default::default()
        },
        meta: None,
        instructions: config.instructions,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    };

    let transport = StdioTransport::new(TransportOptions::default())
        .map_err(|e| RlmError::Protocol(format!("failed to create transport: {e}")))?;

    let handler = GatewayServerHandler::new(registry).to_mcp_server_handler();

    let server = server_runtime::create_server(McpServerOptions {
        server_details,
        transport,
        handler,
        task_store: None,
        client_task_store: None,
    });

    info!("gateway MCP server starting on stdio transport");
    server.start().await.map_err(|e| RlmError::Protocol(format!("MCP server failed: {e}")))?;

    Ok(())
}
