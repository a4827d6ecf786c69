use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::{connection_lost_from, DapClient, PendingResponse};
use crate::codec::{Event, Response};
use crate::events::{EventSubscription, CONNECTION_LOST_EVENT};
use crate::timeout::with_deadline;
use crate::types::{
    to_arguments, Capabilities, DisconnectArguments, ExitedEventBody, InitializeArguments,
    OutputEventBody, StackTraceBody, StoppedEventBody, Variable,
};
use crate::{DapConfig, DapError, Result, Timeouts};

const RECENT_OUTPUT_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Initialized,
    Configured,
    Launched,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Initialized => "initialized",
            Self::Configured => "configured",
            Self::Launched => "launched",
        };
        f.write_str(name)
    }
}

/// Execution sub-state once launched. Only peer events move it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Paused,
    Terminated,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartKind {
    Launch,
    Attach,
}

impl StartKind {
    pub fn command(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Attach => "attach",
        }
    }
}

/// A start request the peer has stored but not executed yet.
#[derive(Debug)]
struct PendingStart {
    kind: StartKind,
    arguments: Value,
    response: PendingResponse,
}

/// How `wait_for_stop` ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Stopped(StoppedEventBody),
    Terminated { exit_code: Option<i64> },
}

/// Stack and variable snapshots taken while paused.
#[derive(Debug, Default)]
struct SnapshotCache {
    stack_traces: HashMap<(i64, u32, u32), StackTraceBody>,
    variables: HashMap<i64, Vec<Variable>>,
}

impl SnapshotCache {
    fn clear(&mut self) {
        self.stack_traces.clear();
        self.variables.clear();
    }
}

/// What an in-flight operation needs once it lets go of the state lock.
struct Operation {
    client: Arc<DapClient>,
    generation: u64,
    timeouts: Timeouts,
}

#[derive(Debug)]
struct SessionInner {
    config: DapConfig,
    client: Option<Arc<DapClient>>,
    event_task: Option<JoinHandle<()>>,
    /// Bumped on every connect and teardown. Completions and events that
    /// belong to an older connection are ignored.
    generation: u64,
    state: SessionState,
    run_state: RunState,
    capabilities: Option<Capabilities>,
    pending_start: Option<PendingStart>,
    last_stop: Option<StoppedEventBody>,
    /// Stop and termination events seen so far. Identifies one pause.
    stops: u64,
    last_outcome: Option<StopOutcome>,
    exit_code: Option<i64>,
    disconnect_reason: Option<String>,
    project_root: Option<PathBuf>,
    breakpoints: BTreeMap<String, Vec<u32>>,
    recent_output: VecDeque<String>,
    cache: SnapshotCache,
}

impl SessionInner {
    fn new(config: DapConfig) -> Self {
        Self {
            config,
            client: None,
            event_task: None,
            generation: 0,
            state: SessionState::Disconnected,
            run_state: RunState::NotStarted,
            capabilities: None,
            pending_start: None,
            last_stop: None,
            stops: 0,
            last_outcome: None,
            exit_code: None,
            disconnect_reason: None,
            project_root: None,
            breakpoints: BTreeMap::new(),
            recent_output: VecDeque::new(),
            cache: SnapshotCache::default(),
        }
    }

    fn require(&self, operation: &str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        let required = allowed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" or ");
        Err(DapError::ordering(operation, self.state, required))
    }

    fn operation(&self) -> Result<Operation> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| DapError::connection_lost("session has no connection"))?;
        Ok(Operation {
            client,
            generation: self.generation,
            timeouts: self.config.timeouts,
        })
    }

    fn lost_error(&self) -> DapError {
        DapError::connection_lost(
            self.disconnect_reason
                .clone()
                .unwrap_or_else(|| "session was reset".to_string()),
        )
    }

    /// Returns true if the client was found dead and the session torn down.
    fn drop_dead_client(&mut self) -> bool {
        match &self.client {
            Some(client) if !client.is_connected() => {
                self.teardown("connection to the debug adapter lost");
                true
            }
            _ => false,
        }
    }

    fn apply_event(&mut self, event: &Event) {
        match event.event.as_str() {
            "stopped" => {
                let body = event.body_as::<StoppedEventBody>().unwrap_or_else(|e| {
                    tracing::warn!("Malformed stopped event body: {e}");
                    StoppedEventBody {
                        reason: "unknown".to_string(),
                        description: None,
                        thread_id: None,
                        text: None,
                        all_threads_stopped: None,
                        hit_breakpoint_ids: Vec::new(),
                    }
                });
                tracing::info!("Program stopped: {}", body.reason);
                self.run_state = RunState::Paused;
                self.stops += 1;
                self.last_outcome = Some(StopOutcome::Stopped(body.clone()));
                self.last_stop = Some(body);
                self.cache.clear();
            }
            "continued" => {
                tracing::debug!("Program continued");
                self.run_state = RunState::Running;
                self.cache.clear();
            }
            "terminated" | "exited" => {
                if let Ok(body) = event.body_as::<ExitedEventBody>() {
                    tracing::info!("Program exited with code {}", body.exit_code);
                    self.exit_code = Some(body.exit_code);
                } else {
                    tracing::info!("Program terminated");
                }
                self.run_state = RunState::Terminated;
                self.stops += 1;
                self.last_outcome = Some(StopOutcome::Terminated {
                    exit_code: self.exit_code,
                });
                self.cache.clear();
            }
            "output" => {
                if let Ok(body) = event.body_as::<OutputEventBody>() {
                    if self.recent_output.len() == RECENT_OUTPUT_LIMIT {
                        self.recent_output.pop_front();
                    }
                    self.recent_output.push_back(body.output);
                }
            }
            CONNECTION_LOST_EVENT => {
                let reason = connection_lost_from(event).to_string();
                self.teardown(&reason);
            }
            other => tracing::trace!("Session ignoring '{other}' event"),
        }
    }

    fn stop_outcome(&self) -> Option<StopOutcome> {
        match self.run_state {
            RunState::Paused => self.last_stop.clone().map(StopOutcome::Stopped),
            RunState::Terminated => Some(StopOutcome::Terminated {
                exit_code: self.exit_code,
            }),
            RunState::NotStarted | RunState::Running => None,
        }
    }

    fn teardown(&mut self, reason: &str) {
        if self.state != SessionState::Disconnected {
            tracing::info!("Session disconnected: {reason}");
        }
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        self.client = None;
        self.generation += 1;
        self.pending_start = None;
        self.capabilities = None;
        self.state = SessionState::Disconnected;
        self.run_state = RunState::NotStarted;
        self.disconnect_reason = Some(reason.to_string());
        self.cache.clear();
    }
}

#[derive(Debug)]
struct SessionShared {
    inner: Mutex<SessionInner>,
    /// Revision counter, bumped after every state change.
    changes: watch::Sender<u64>,
}

impl SessionShared {
    /// Locks the state, first dropping a client whose connection died.
    /// Never held across an await.
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        let mut inner = self.lock_raw();
        if inner.drop_dead_client() {
            self.notify();
        }
        inner
    }

    fn lock_raw(&self) -> MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changes.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    fn begin(&self, operation: &str, allowed: &[SessionState]) -> Result<Operation> {
        let inner = self.lock();
        inner.require(operation, allowed)?;
        inner.operation()
    }

    /// Runs `f` if the session still belongs to `generation`.
    fn update<R>(&self, generation: u64, f: impl FnOnce(&mut SessionInner) -> R) -> Result<R> {
        let result = {
            let mut inner = self.lock_raw();
            if inner.generation != generation {
                return Err(inner.lost_error());
            }
            f(&mut inner)
        };
        self.notify();
        Ok(result)
    }

    /// Returns false once this connection's events are no longer wanted.
    fn apply_event(&self, generation: u64, event: &Event) -> bool {
        {
            let mut inner = self.lock_raw();
            if inner.generation != generation {
                return false;
            }
            inner.apply_event(event);
        }
        self.notify();
        event.event != CONNECTION_LOST_EVENT
    }

    fn teardown(&self, generation: Option<u64>, reason: &str) {
        {
            let mut inner = self.lock_raw();
            if generation.is_some_and(|g| g != inner.generation) {
                return;
            }
            inner.teardown(reason);
        }
        self.notify();
    }
}

/// Applies this connection's events to the session as they arrive.
fn spawn_event_task(
    shared: Weak<SessionShared>,
    generation: u64,
    mut events: EventSubscription,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            if !shared.apply_event(generation, &event) {
                break;
            }
        }
        tracing::debug!("Session event task for connection {generation} stopped");
    })
}

/// One debugging conversation with a Godot editor.
///
/// Command completions drive the early lifecycle (connect, initialize,
/// configurationDone). After that, execution state comes only from peer
/// events, applied by a background task as they arrive; a `continue` that
/// returns success does not mean running until the `continued` event says
/// so.
///
/// Every method takes `&self`. State lives behind a short-held lock that is
/// never kept across network I/O, so any number of commands, waits and
/// status reads can run at once. Connect, initialize, start and
/// configurationDone are serialized among themselves.
#[derive(Debug)]
pub struct Session {
    shared: Arc<SessionShared>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(config: DapConfig) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            shared: Arc::new(SessionShared {
                inner: Mutex::new(SessionInner::new(config)),
                changes,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> DapConfig {
        self.shared.lock().config.clone()
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn run_state(&self) -> RunState {
        self.shared.lock().run_state
    }

    pub fn is_paused(&self) -> bool {
        self.run_state() == RunState::Paused
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.shared.lock().capabilities.clone()
    }

    pub fn last_stop(&self) -> Option<StoppedEventBody> {
        self.shared.lock().last_stop.clone()
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.shared.lock().exit_code
    }

    pub fn project_root(&self) -> Option<PathBuf> {
        self.shared.lock().project_root.clone()
    }

    pub fn set_project_root(&self, root: impl Into<PathBuf>) {
        self.shared.lock().project_root = Some(root.into());
    }

    pub fn pending_start_arguments(&self) -> Option<Value> {
        self.shared
            .lock()
            .pending_start
            .as_ref()
            .map(|start| start.arguments.clone())
    }

    pub fn breakpoints(&self) -> BTreeMap<String, Vec<u32>> {
        self.shared.lock().breakpoints.clone()
    }

    pub fn recent_output(&self) -> Vec<String> {
        self.shared.lock().recent_output.iter().cloned().collect()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared
            .lock()
            .client
            .as_ref()
            .map_or(0, |client| client.pending_count())
    }

    // ---- lifecycle -------------------------------------------------------

    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let config = {
            let inner = self.shared.lock();
            inner.require("connect", &[SessionState::Disconnected])?;
            inner.config.clone()
        };

        let client = Arc::new(DapClient::connect(&config).await?);
        let events = client.subscribe_lossless();
        {
            let mut inner = self.shared.lock_raw();
            inner.generation += 1;
            let generation = inner.generation;
            inner.event_task = Some(spawn_event_task(
                Arc::downgrade(&self.shared),
                generation,
                events,
            ));
            inner.client = Some(client);
            inner.state = SessionState::Connected;
            inner.run_state = RunState::NotStarted;
            inner.exit_code = None;
            inner.last_stop = None;
            inner.last_outcome = None;
            inner.disconnect_reason = None;
        }
        self.shared.notify();
        tracing::info!("Session connected to {}", config.address());
        Ok(())
    }

    /// DAP handshake: `initialize`, then the `initialized` event.
    pub async fn initialize(&self) -> Result<Capabilities> {
        let _lifecycle = self.lifecycle.lock().await;
        let op = self.shared.begin("initialize", &[SessionState::Connected])?;

        let result: Result<Capabilities> = async {
            // Subscribe first; the event may beat the response.
            let mut initialized = op.client.subscribe();
            let args = to_arguments(&InitializeArguments::default())?;
            let response = op
                .client
                .send_and_wait_with("initialize", args, op.timeouts.command)
                .await?;
            let capabilities: Capabilities = response.body_as()?;
            DapClient::wait_for_event(&mut initialized, "initialized", op.timeouts.read).await?;
            Ok(capabilities)
        }
        .await;

        let capabilities = self.observe(op.generation, result)?;
        tracing::info!(
            "DAP handshake complete (configurationDone supported: {})",
            capabilities.supports_configuration_done_request
        );
        self.shared.update(op.generation, |inner| {
            inner.state = SessionState::Initialized;
            inner.capabilities = Some(capabilities.clone());
        })?;
        Ok(capabilities)
    }

    /// Convenience for `connect` followed by `initialize`.
    pub async fn connect_and_initialize(&self) -> Result<Capabilities> {
        self.connect().await?;
        self.initialize().await
    }

    /// First half of the two-phase start. The peer only stores `arguments`;
    /// nothing runs until `configuration_done`.
    pub async fn start(&self, kind: StartKind, arguments: Value) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let operation = kind.command();
        let op = {
            let inner = self.shared.lock();
            inner.require(operation, &[SessionState::Initialized])?;
            if let Some(pending) = &inner.pending_start {
                return Err(DapError::ordering(
                    operation,
                    format!("{} (with {} pending)", inner.state, pending.kind.command()),
                    "configurationDone first",
                ));
            }
            inner.operation()?
        };

        let sent = op.client.send_request(operation, arguments.clone()).await;
        let response = self.observe(op.generation, sent)?;

        self.shared.update(op.generation, |inner| {
            inner.pending_start = Some(PendingStart {
                kind,
                arguments,
                response,
            });
        })?;
        tracing::info!("Stored pending {operation}; waiting for configurationDone");
        Ok(())
    }

    pub async fn launch(&self, arguments: Value) -> Result<()> {
        self.start(StartKind::Launch, arguments).await
    }

    pub async fn attach(&self, arguments: Value) -> Result<()> {
        self.start(StartKind::Attach, arguments).await
    }

    /// Second half of the two-phase start. With a pending start, collects
    /// both responses in whatever order the peer sends them and moves to
    /// `Launched`. Without one, only marks the session `Configured`.
    ///
    /// The pending start stays in its slot until configurationDone itself
    /// succeeds, so a timed-out trigger can be retried and still blocks a
    /// second start.
    pub async fn configuration_done(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let op = self
            .shared
            .begin("configurationDone", &[SessionState::Initialized])?;
        let deadline = Instant::now() + op.timeouts.command;

        let sent = op.client.send_request("configurationDone", json!({})).await;
        let done = self.observe(op.generation, sent)?;
        let confirmed = done.wait(op.timeouts.command).await;
        self.observe(op.generation, confirmed)?;

        let Some(start) = self
            .shared
            .update(op.generation, |inner| inner.pending_start.take())?
        else {
            self.shared.update(op.generation, |inner| {
                inner.state = SessionState::Configured;
            })?;
            tracing::info!("Configuration done with no pending start");
            return Ok(());
        };

        // A start response that arrived first is already buffered.
        let kind = start.kind;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let started = start.response.wait(remaining).await;
        if let Err(err) = self.observe(op.generation, started) {
            let _ = self.shared.update(op.generation, |inner| {
                inner.state = SessionState::Configured;
            });
            return Err(err);
        }

        self.shared.update(op.generation, |inner| {
            inner.state = SessionState::Launched;
            if inner.run_state == RunState::NotStarted {
                inner.run_state = RunState::Running;
            }
        })?;
        tracing::info!("{} confirmed; session launched", kind.command());
        Ok(())
    }

    /// `start` and `configuration_done` back to back. Godot answers the
    /// start request only after it sees configurationDone.
    pub async fn start_with_configuration_done(&self, kind: StartKind, arguments: Value) -> Result<()> {
        self.start(kind, arguments).await?;
        self.configuration_done().await
    }

    pub async fn launch_with_configuration_done(&self, arguments: Value) -> Result<()> {
        self.start_with_configuration_done(StartKind::Launch, arguments)
            .await
    }

    pub async fn attach_with_configuration_done(&self, arguments: Value) -> Result<()> {
        self.start_with_configuration_done(StartKind::Attach, arguments)
            .await
    }

    /// Best-effort `disconnect` request, then close. Always ends
    /// `Disconnected`. Does not wait for other operations; whatever is in
    /// flight fails with `ConnectionLost`.
    pub async fn disconnect(&self, terminate_debuggee: bool) -> Result<()> {
        let (client, timeouts) = {
            let inner = self.shared.lock();
            (inner.client.clone(), inner.config.timeouts)
        };

        if let Some(client) = client {
            let arguments = to_arguments(&DisconnectArguments { terminate_debuggee })?;
            if let Err(err) = client
                .send_and_wait_with("disconnect", arguments, timeouts.command)
                .await
            {
                tracing::warn!("Disconnect request failed, closing anyway: {err}");
            }
            client.close().await;
        }
        self.shared.teardown(None, "disconnect requested");
        Ok(())
    }

    // ---- commands --------------------------------------------------------

    /// Sends `command` if the session is in one of `allowed`. Rejected calls
    /// never touch the network.
    pub async fn send_command(
        &self,
        command: &str,
        arguments: Value,
        allowed: &[SessionState],
    ) -> Result<Response> {
        let op = self.shared.begin(command, allowed)?;
        let result = op
            .client
            .send_and_wait_with(command, arguments, op.timeouts.command)
            .await;
        self.observe(op.generation, result)
    }

    /// Sends a command that only makes sense once the program is running.
    pub async fn request_launched(&self, command: &str, arguments: Value) -> Result<Response> {
        self.send_command(command, arguments, &[SessionState::Launched])
            .await
    }

    /// Resume-type commands (continue, next, stepIn, stepOut). Snapshots are
    /// dropped here; the run state waits for the peer's event.
    pub async fn resume(&self, command: &str, arguments: Value) -> Result<Response> {
        let response = self.request_launched(command, arguments).await?;
        self.invalidate_snapshots();
        Ok(response)
    }

    /// Waits for the program to stop or terminate. Returns immediately if it
    /// is already paused. Each call watches the session on its own, so
    /// several waiters and commands can run side by side.
    pub async fn wait_for_stop(&self, deadline: Duration) -> Result<StopOutcome> {
        let mut changes = self.shared.changes.subscribe();
        let (generation, stops_seen) = {
            let inner = self.shared.lock();
            inner.require("wait for stop", &[SessionState::Launched])?;
            if let Some(outcome) = inner.stop_outcome() {
                return Ok(outcome);
            }
            (inner.generation, inner.stops)
        };

        with_deadline(deadline, "stopped event", async {
            loop {
                if changes.changed().await.is_err() {
                    return Err(DapError::connection_lost("session dropped"));
                }
                let settled = {
                    let inner = self.shared.lock();
                    if inner.generation != generation {
                        Some(Err(inner.lost_error()))
                    } else if inner.stops != stops_seen {
                        inner.last_outcome.clone().map(Ok)
                    } else {
                        None
                    }
                };
                if let Some(result) = settled {
                    return result;
                }
            }
        })
        .await
    }

    // ---- snapshot cache --------------------------------------------------

    /// Identifies the current pause. Fetch it before requesting data that
    /// should be cached, and hand it back to `cache_*`.
    pub fn pause_epoch(&self) -> u64 {
        self.shared.lock().stops
    }

    pub fn cached_stack_trace(&self, thread_id: i64, start: u32, levels: u32) -> Option<StackTraceBody> {
        self.shared
            .lock()
            .cache
            .stack_traces
            .get(&(thread_id, start, levels))
            .cloned()
    }

    /// Kept only if the program is still in the pause `epoch` names.
    pub fn cache_stack_trace(
        &self,
        epoch: u64,
        thread_id: i64,
        start: u32,
        levels: u32,
        body: StackTraceBody,
    ) {
        let mut inner = self.shared.lock();
        if inner.run_state == RunState::Paused && inner.stops == epoch {
            inner.cache.stack_traces.insert((thread_id, start, levels), body);
        }
    }

    pub fn cached_variables(&self, reference: i64) -> Option<Vec<Variable>> {
        self.shared.lock().cache.variables.get(&reference).cloned()
    }

    pub fn cache_variables(&self, epoch: u64, reference: i64, variables: Vec<Variable>) {
        let mut inner = self.shared.lock();
        if inner.run_state == RunState::Paused && inner.stops == epoch {
            inner.cache.variables.insert(reference, variables);
        }
    }

    pub fn invalidate_snapshots(&self) {
        self.shared.lock().cache.clear();
    }

    pub(crate) fn record_breakpoints(&self, path: &str, lines: Vec<u32>) {
        let mut inner = self.shared.lock();
        if lines.is_empty() {
            inner.breakpoints.remove(path);
        } else {
            inner.breakpoints.insert(path.to_string(), lines);
        }
    }

    // ---- internals -------------------------------------------------------

    /// Tears the session down when `result` carries a fatal error.
    fn observe<T>(&self, generation: u64, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                self.shared.teardown(Some(generation), &err.to_string());
            }
        }
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.shared.lock_raw().event_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(SessionState::Disconnected.to_string(), "disconnected");
        assert_eq!(SessionState::Launched.to_string(), "launched");
        assert_eq!(RunState::Paused.to_string(), "paused");
        assert_eq!(StartKind::Attach.command(), "attach");
    }

    #[tokio::test]
    async fn test_commands_before_connect_are_ordering_errors() {
        let session = Session::new(DapConfig::default());

        let err = session
            .request_launched("threads", Value::Null)
            .await
            .expect_err("not connected");
        assert!(matches!(err, DapError::Ordering { .. }), "unexpected error: {err}");
        assert_eq!(
            err.to_string(),
            "Cannot threads: session is disconnected (requires launched)"
        );

        let err = session.initialize().await.expect_err("not connected");
        assert!(matches!(err, DapError::Ordering { .. }), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop() {
        let session = Session::new(DapConfig::default());
        session
            .disconnect(false)
            .await
            .expect("disconnect should succeed");
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_events_drive_run_state() {
        let mut inner = SessionInner::new(DapConfig::default());
        inner.state = SessionState::Launched;
        inner.run_state = RunState::Running;
        inner.cache.variables.insert(7, Vec::new());

        inner.apply_event(&Event::new(
            "stopped",
            json!({"reason": "breakpoint", "threadId": 1}),
        ));
        assert_eq!(inner.run_state, RunState::Paused);
        assert_eq!(inner.stops, 1);
        assert!(inner.cache.variables.is_empty());
        assert_eq!(
            inner.last_stop.as_ref().map(|s| s.reason.as_str()),
            Some("breakpoint")
        );

        inner.apply_event(&Event::new("continued", json!({"threadId": 1})));
        assert_eq!(inner.run_state, RunState::Running);
        assert_eq!(inner.stops, 1);

        inner.apply_event(&Event::new("exited", json!({"exitCode": 3})));
        assert_eq!(inner.run_state, RunState::Terminated);
        assert_eq!(
            inner.stop_outcome(),
            Some(StopOutcome::Terminated { exit_code: Some(3) })
        );
        assert_eq!(inner.last_outcome, inner.stop_outcome());
    }

    #[test]
    fn test_connection_lost_event_disconnects() {
        let mut inner = SessionInner::new(DapConfig::default());
        inner.state = SessionState::Launched;
        inner.run_state = RunState::Paused;
        inner.cache.variables.insert(1, Vec::new());
        let generation = inner.generation;

        inner.apply_event(&Event::new(
            CONNECTION_LOST_EVENT,
            json!({"reason": "peer closed the connection"}),
        ));
        assert_eq!(inner.state, SessionState::Disconnected);
        assert_eq!(inner.run_state, RunState::NotStarted);
        assert!(inner.cache.variables.is_empty());
        assert_ne!(inner.generation, generation);
        assert!(
            inner.lost_error().to_string().contains("peer closed the connection"),
            "unexpected error: {}",
            inner.lost_error()
        );
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let session = Session::new(DapConfig::default());
        let generation = session.shared.lock().generation;
        session.shared.teardown(None, "reset");

        let applied = session.shared.apply_event(
            generation,
            &Event::new("stopped", json!({"reason": "breakpoint"})),
        );
        assert!(!applied);
        assert!(session.last_stop().is_none());

        let err = session
            .shared
            .update(generation, |inner| inner.state = SessionState::Launched)
            .expect_err("stale generation");
        assert!(matches!(err, DapError::ConnectionLost(_)), "unexpected error: {err}");
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_variables_cached_only_within_one_pause() {
        let session = Session::new(DapConfig::default());
        let vars = vec![Variable {
            name: "health".into(),
            value: "100".into(),
            type_name: Some("int".into()),
            variables_reference: 0,
        }];

        session.shared.lock().run_state = RunState::Running;
        session.cache_variables(session.pause_epoch(), 3, vars.clone());
        assert!(session.cached_variables(3).is_none());

        // fetched during one pause, answered after the next stop
        let stale_epoch = session.pause_epoch();
        session.shared.lock().apply_event(&Event::new("stopped", json!({"reason": "step"})));
        session.cache_variables(stale_epoch, 3, vars.clone());
        assert!(session.cached_variables(3).is_none());

        session.cache_variables(session.pause_epoch(), 3, vars.clone());
        assert_eq!(session.cached_variables(3), Some(vars));
    }

    #[test]
    fn test_output_is_bounded() {
        let mut inner = SessionInner::new(DapConfig::default());
        for i in 0..(RECENT_OUTPUT_LIMIT + 5) {
            inner.apply_event(&Event::new(
                "output",
                json!({"category": "stdout", "output": format!("line {i}")}),
            ));
        }
        assert_eq!(inner.recent_output.len(), RECENT_OUTPUT_LIMIT);
        assert_eq!(inner.recent_output.front().map(String::as_str), Some("line 5"));
    }
}
