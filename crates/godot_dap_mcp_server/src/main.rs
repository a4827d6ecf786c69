use std::{path::PathBuf, sync::Arc, time::Duration};

use godot_dap_core::{
    ops::{self, LaunchConfig, SceneLaunchMode, DEFAULT_THREAD_ID},
    DapConfig, DapError, Session, SessionState, StopOutcome,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, transport, ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

const DEFAULT_WAIT_FOR_STOP: Duration = Duration::from_secs(10);
const DEFAULT_MAX_FRAMES: u32 = 20;
const STATUS_OUTPUT_LINES: usize = 20;

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
struct GodotConnectParams {
    /// DAP server port (default: 6006)
    #[serde(default)]
    port: Option<u16>,
    /// Absolute path to the project root; enables res:// path resolution
    #[serde(default)]
    project: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
struct GodotDisconnectParams {
    #[serde(default)]
    terminate_debuggee: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GodotSetBreakpointParams {
    /// Absolute or res:// path to a GDScript file
    file: String,
    /// 1-indexed line number
    line: u32,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GodotClearBreakpointParams {
    file: String,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
struct GodotLaunchParams {
    /// Project root; falls back to the one given to godot_connect
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    no_debug: bool,
    #[serde(default)]
    profiling: bool,
    #[serde(default)]
    debug_collisions: bool,
    #[serde(default)]
    debug_paths: bool,
    #[serde(default)]
    debug_navigation: bool,
    #[serde(default)]
    additional_options: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GodotLaunchSceneParams {
    /// Scene to run, e.g. res://scenes/level_1.tscn
    scene: String,
    #[serde(flatten)]
    launch: GodotLaunchParams,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
struct GodotAttachParams {
    #[serde(default)]
    project: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
struct GodotThreadParams {
    /// Thread id (default: 1, Godot runs scripts on one thread)
    #[serde(default)]
    thread_id: Option<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
struct GodotWaitForStopParams {
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
struct GodotStackTraceParams {
    #[serde(default)]
    thread_id: Option<i64>,
    #[serde(default)]
    start_frame: Option<u32>,
    #[serde(default)]
    max_frames: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GodotScopesParams {
    frame_id: i64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GodotVariablesParams {
    variables_reference: i64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GodotEvaluateParams {
    expression: String,
    #[serde(default)]
    frame_id: Option<i64>,
    /// repl, watch or hover (default: repl)
    #[serde(default)]
    context: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct GodotSetVariableParams {
    variables_reference: i64,
    name: String,
    value: String,
}

#[derive(Clone)]
struct GodotDapMcpServer {
    tool_router: ToolRouter<Self>,
    config: DapConfig,
    /// Held only long enough to clone the handle out. Tools then run
    /// against the session concurrently.
    session: Arc<Mutex<Option<Arc<Session>>>>,
    /// Serializes godot_connect and godot_disconnect.
    lifecycle: Arc<Mutex<()>>,
}

fn to_mcp_error(err: DapError) -> McpError {
    let data = Some(json!({ "kind": err.kind() }));
    match &err {
        DapError::Ordering { .. } => McpError::invalid_request(err.to_string(), data),
        DapError::InvalidArgument { .. } => McpError::invalid_params(err.to_string(), data),
        _ => McpError::internal_error(err.to_string(), data),
    }
}

fn no_session_error(tool_name: &str) -> McpError {
    McpError::invalid_request(
        format!("{tool_name} requires a debug session. Call godot_connect first."),
        Some(json!({ "kind": "ordering_error" })),
    )
}

fn stop_outcome_json(outcome: &StopOutcome) -> Value {
    match outcome {
        StopOutcome::Stopped(body) => json!({
            "state": "paused",
            "reason": body.reason,
            "thread_id": body.thread_id,
            "description": body.description,
            "hit_breakpoint_ids": body.hit_breakpoint_ids,
        }),
        StopOutcome::Terminated { exit_code } => json!({
            "state": "terminated",
            "exit_code": exit_code,
        }),
    }
}

fn session_status(session: &Session) -> Value {
    let state = session.state();
    let run_state = session.run_state();
    let output = session.recent_output();
    let tail = &output[output.len().saturating_sub(STATUS_OUTPUT_LINES)..];
    json!({
        "state": state.to_string(),
        "run_state": run_state.to_string(),
        "address": session.config().address(),
        "project_root": session.project_root().map(|p| p.display().to_string()),
        "pending_start": session.pending_start_arguments(),
        "last_stop": session.last_stop(),
        "exit_code": session.exit_code(),
        "pending_requests": session.pending_requests(),
        "breakpoints": session.breakpoints(),
        "recent_output": tail,
    })
}

fn launch_config(
    session: &Session,
    params: GodotLaunchParams,
    scene: SceneLaunchMode,
) -> Result<LaunchConfig, McpError> {
    let project = params
        .project
        .map(PathBuf::from)
        .or_else(|| session.project_root())
        .ok_or_else(|| {
            to_mcp_error(DapError::invalid_argument(
                "project",
                "no project given and godot_connect was called without one",
            ))
        })?;

    let mut config = LaunchConfig::new(project, scene);
    config.no_debug = params.no_debug;
    config.profiling = params.profiling;
    config.debug_collisions = params.debug_collisions;
    config.debug_paths = params.debug_paths;
    config.debug_navigation = params.debug_navigation;
    config.additional_options = params.additional_options;
    Ok(config)
}

#[tool_router]
impl GodotDapMcpServer {
    fn new(config: DapConfig) -> Self {
        Self {
            tool_router: Self::tool_router(),
            config,
            session: Arc::new(Mutex::new(None)),
            lifecycle: Arc::new(Mutex::new(())),
        }
    }

    async fn current_session(&self, tool_name: &str) -> Result<Arc<Session>, McpError> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| no_session_error(tool_name))
    }

    async fn launch_with(
        &self,
        tool_name: &str,
        params: GodotLaunchParams,
        scene: SceneLaunchMode,
    ) -> Result<CallToolResult, McpError> {
        let session = self.current_session(tool_name).await?;

        let config = launch_config(&session, params, scene)?;
        ops::launch(&session, &config).await.map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": session.state().to_string(),
            "run_state": session.run_state().to_string(),
            "launch_args": config.to_launch_args(),
        })))
    }

    #[tool(description = "Check that the MCP server is alive")]
    async fn godot_ping(&self) -> Result<CallToolResult, McpError> {
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "server": "godot-dap-mcp-server",
            "version": env!("CARGO_PKG_VERSION"),
        })))
    }

    #[tool(description = "Connect to the Godot editor's DAP server and complete the handshake")]
    async fn godot_connect(
        &self,
        params: Parameters<GodotConnectParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(existing) = self.session.lock().await.as_ref() {
            let state = existing.state();
            if state != SessionState::Disconnected {
                return Err(to_mcp_error(DapError::ordering(
                    "connect",
                    state,
                    "disconnected (call godot_disconnect first)",
                )));
            }
        }

        let config = match params.port {
            Some(port) => self.config.with_port(port),
            None => self.config.clone(),
        };
        let session = Arc::new(Session::new(config));
        if let Some(project) = params.project {
            session.set_project_root(project);
        }

        // Visible to godot_status while the handshake runs.
        *self.session.lock().await = Some(session.clone());
        let capabilities = match session.connect_and_initialize().await {
            Ok(capabilities) => capabilities,
            Err(err) => {
                let mut slot = self.session.lock().await;
                if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &session)) {
                    *slot = None;
                }
                return Err(to_mcp_error(err));
            }
        };

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": session.state().to_string(),
            "address": session.config().address(),
            "project_root": session.project_root().map(|p| p.display().to_string()),
            "capabilities": capabilities,
        })))
    }

    #[tool(description = "Disconnect from the Godot DAP server")]
    async fn godot_disconnect(
        &self,
        params: Parameters<GodotDisconnectParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let _lifecycle = self.lifecycle.lock().await;
        let Some(session) = self.session.lock().await.take() else {
            return Ok(CallToolResult::structured(json!({
                "ok": true,
                "state": "disconnected",
                "note": "no active session",
            })));
        };

        session
            .disconnect(params.terminate_debuggee)
            .await
            .map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": session.state().to_string(),
        })))
    }

    #[tool(description = "Report session state, last stop and recent game output")]
    async fn godot_status(&self) -> Result<CallToolResult, McpError> {
        let session = self.session.lock().await.clone();
        let status = match session {
            Some(session) => session_status(&session),
            None => json!({ "state": SessionState::Disconnected.to_string() }),
        };
        Ok(CallToolResult::structured(status))
    }

    #[tool(description = "Set a breakpoint in a GDScript file (absolute or res:// path)")]
    async fn godot_set_breakpoint(
        &self,
        params: Parameters<GodotSetBreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.current_session("godot_set_breakpoint").await?;

        let breakpoints = ops::add_breakpoint(&session, &params.file, params.line)
            .await
            .map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "file": params.file,
            "breakpoints": breakpoints,
        })))
    }

    #[tool(description = "Clear every breakpoint in a GDScript file")]
    async fn godot_clear_breakpoint(
        &self,
        params: Parameters<GodotClearBreakpointParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.current_session("godot_clear_breakpoint").await?;

        ops::clear_breakpoints(&session, &params.file)
            .await
            .map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "file": params.file,
        })))
    }

    #[tool(description = "Launch the project's main scene")]
    async fn godot_launch_main_scene(
        &self,
        params: Parameters<GodotLaunchParams>,
    ) -> Result<CallToolResult, McpError> {
        self.launch_with("godot_launch_main_scene", params.0, SceneLaunchMode::Main)
            .await
    }

    #[tool(description = "Launch a specific scene")]
    async fn godot_launch_scene(
        &self,
        params: Parameters<GodotLaunchSceneParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        self.launch_with(
            "godot_launch_scene",
            params.launch,
            SceneLaunchMode::Custom(params.scene),
        )
        .await
    }

    #[tool(description = "Launch the scene currently open in the editor")]
    async fn godot_launch_current_scene(
        &self,
        params: Parameters<GodotLaunchParams>,
    ) -> Result<CallToolResult, McpError> {
        self.launch_with(
            "godot_launch_current_scene",
            params.0,
            SceneLaunchMode::Current,
        )
        .await
    }

    #[tool(description = "Attach to a game that is already running")]
    async fn godot_attach(
        &self,
        params: Parameters<GodotAttachParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.current_session("godot_attach").await?;

        let project = params.project.map(PathBuf::from);
        ops::attach(&session, project.as_deref())
            .await
            .map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "state": session.state().to_string(),
            "run_state": session.run_state().to_string(),
        })))
    }

    #[tool(description = "Resume execution of the paused game")]
    async fn godot_continue(
        &self,
        params: Parameters<GodotThreadParams>,
    ) -> Result<CallToolResult, McpError> {
        let thread_id = params.0.thread_id.unwrap_or(DEFAULT_THREAD_ID);
        let session = self.current_session("godot_continue").await?;

        ops::continue_execution(&session, thread_id)
            .await
            .map_err(to_mcp_error)?;

        // The run state only changes once the peer confirms with an event.
        Ok(CallToolResult::structured(json!({
            "ok": true,
            "thread_id": thread_id,
            "run_state": session.run_state().to_string(),
        })))
    }

    #[tool(description = "Step over the current line")]
    async fn godot_step_over(
        &self,
        params: Parameters<GodotThreadParams>,
    ) -> Result<CallToolResult, McpError> {
        let thread_id = params.0.thread_id.unwrap_or(DEFAULT_THREAD_ID);
        let session = self.current_session("godot_step_over").await?;

        ops::next(&session, thread_id).await.map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "thread_id": thread_id,
            "run_state": session.run_state().to_string(),
        })))
    }

    #[tool(description = "Step into the function called on the current line")]
    async fn godot_step_into(
        &self,
        params: Parameters<GodotThreadParams>,
    ) -> Result<CallToolResult, McpError> {
        let thread_id = params.0.thread_id.unwrap_or(DEFAULT_THREAD_ID);
        let session = self.current_session("godot_step_into").await?;

        ops::step_in(&session, thread_id).await.map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "thread_id": thread_id,
            "run_state": session.run_state().to_string(),
        })))
    }

    #[tool(description = "Step out of the current function")]
    async fn godot_step_out(
        &self,
        params: Parameters<GodotThreadParams>,
    ) -> Result<CallToolResult, McpError> {
        let thread_id = params.0.thread_id.unwrap_or(DEFAULT_THREAD_ID);
        let session = self.current_session("godot_step_out").await?;

        ops::step_out(&session, thread_id).await.map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "thread_id": thread_id,
            "run_state": session.run_state().to_string(),
        })))
    }

    #[tool(description = "Pause the running game")]
    async fn godot_pause(
        &self,
        params: Parameters<GodotThreadParams>,
    ) -> Result<CallToolResult, McpError> {
        let thread_id = params.0.thread_id.unwrap_or(DEFAULT_THREAD_ID);
        let session = self.current_session("godot_pause").await?;

        ops::pause(&session, thread_id).await.map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "thread_id": thread_id,
            "note": "pause requested; call godot_wait_for_stop to observe the stop",
        })))
    }

    #[tool(description = "Wait until the game stops (breakpoint, step, pause) or terminates")]
    async fn godot_wait_for_stop(
        &self,
        params: Parameters<GodotWaitForStopParams>,
    ) -> Result<CallToolResult, McpError> {
        let timeout = params
            .0
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WAIT_FOR_STOP);
        let session = self.current_session("godot_wait_for_stop").await?;

        let outcome = ops::wait_for_stop(&session, timeout)
            .await
            .map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(stop_outcome_json(&outcome)))
    }

    #[tool(description = "List threads of the debugged game")]
    async fn godot_get_threads(&self) -> Result<CallToolResult, McpError> {
        let session = self.current_session("godot_get_threads").await?;

        let threads = ops::threads(&session).await.map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "threads": threads,
        })))
    }

    #[tool(description = "Get the call stack of the paused game")]
    async fn godot_get_stack_trace(
        &self,
        params: Parameters<GodotStackTraceParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let thread_id = params.thread_id.unwrap_or(DEFAULT_THREAD_ID);
        let session = self.current_session("godot_get_stack_trace").await?;

        let body = ops::stack_trace(
            &session,
            thread_id,
            params.start_frame.unwrap_or(0),
            params.max_frames.unwrap_or(DEFAULT_MAX_FRAMES),
        )
        .await
        .map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "thread_id": thread_id,
            "stack_frames": body.stack_frames,
            "total_frames": body.total_frames,
        })))
    }

    #[tool(description = "Get variable scopes (Locals, Members, Globals) for a stack frame")]
    async fn godot_get_scopes(
        &self,
        params: Parameters<GodotScopesParams>,
    ) -> Result<CallToolResult, McpError> {
        let frame_id = params.0.frame_id;
        let session = self.current_session("godot_get_scopes").await?;

        let scopes = ops::scopes(&session, frame_id).await.map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "frame_id": frame_id,
            "scopes": scopes,
        })))
    }

    #[tool(description = "Get variables in a scope or expand a structured variable")]
    async fn godot_get_variables(
        &self,
        params: Parameters<GodotVariablesParams>,
    ) -> Result<CallToolResult, McpError> {
        let reference = params.0.variables_reference;
        let session = self.current_session("godot_get_variables").await?;

        let variables = ops::variables(&session, reference)
            .await
            .map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "variables_reference": reference,
            "variables": variables,
        })))
    }

    #[tool(description = "Evaluate a GDScript expression in a paused frame")]
    async fn godot_evaluate(
        &self,
        params: Parameters<GodotEvaluateParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let frame_id = params.frame_id.unwrap_or(0);
        let context = params.context.as_deref().unwrap_or("repl");
        let session = self.current_session("godot_evaluate").await?;

        let body = ops::evaluate(&session, &params.expression, frame_id, context)
            .await
            .map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "expression": params.expression,
            "result": body.result,
            "type": body.type_name,
            "variables_reference": body.variables_reference,
        })))
    }

    #[tool(description = "Set a variable's value in the paused game")]
    async fn godot_set_variable(
        &self,
        params: Parameters<GodotSetVariableParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let session = self.current_session("godot_set_variable").await?;

        let body = ops::set_variable(
            &session,
            params.variables_reference,
            &params.name,
            &params.value,
        )
        .await
        .map_err(to_mcp_error)?;

        Ok(CallToolResult::structured(json!({
            "ok": true,
            "name": params.name,
            "value": body.value,
            "type": body.type_name,
        })))
    }
}

#[tool_handler]
impl ServerHandler for GodotDapMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Godot DAP MCP Server: connect, set breakpoints, launch scenes and inspect a paused Godot game".into(),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the MCP stream; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = DapConfig::from_env();
    tracing::info!(
        "Starting Godot DAP MCP Server on stdio (default DAP target {})...",
        config.address()
    );

    let server = GodotDapMcpServer::new(config);
    server.serve(transport::stdio()).await?.waiting().await?;

    Ok(())
}
