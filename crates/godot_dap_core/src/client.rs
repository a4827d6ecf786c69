use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::audit::{AuditLogger, Direction};
use crate::codec::{self, Event, Message, Request, Response};
use crate::connection::Connection;
use crate::correlator::{Correlator, ResponseWaiter};
use crate::events::{EventBus, EventSubscription, CONNECTION_LOST_EVENT};
use crate::pump::{self, PumpContext};
use crate::timeout::with_deadline;
use crate::{DapConfig, DapError, Result, Timeouts};

/// Multiplexing DAP client: one connection, one read pump, any number of
/// concurrent requests and event subscribers.
#[derive(Debug)]
pub struct DapClient {
    ctx: PumpContext,
    pump: JoinHandle<()>,
    timeouts: Timeouts,
}

/// A request that is on the wire and has a registered waiter.
#[derive(Debug)]
pub struct PendingResponse {
    waiter: ResponseWaiter,
}

impl PendingResponse {
    pub fn seq(&self) -> u64 {
        self.waiter.seq()
    }

    pub fn command(&self) -> &str {
        self.waiter.command()
    }

    /// Resolves to the response body, or `Remote` if the peer said no.
    pub async fn wait(self, deadline: Duration) -> Result<Response> {
        let command = self.waiter.command().to_string();
        let response = self.waiter.wait(deadline).await?;
        if !response.success {
            return Err(DapError::remote(command, response.error_message()));
        }
        Ok(response)
    }
}

impl DapClient {
    pub async fn connect(config: &DapConfig) -> Result<Self> {
        Self::connect_starting_at(config, 1).await
    }

    /// `connect`, with the first outbound request numbered `first_seq`.
    pub async fn connect_starting_at(config: &DapConfig, first_seq: u64) -> Result<Self> {
        let address = config.address();
        let connection = Connection::connect(&address, config.timeouts.connect).await?;

        let audit = match &config.audit_dir {
            Some(dir) => match AuditLogger::new(dir, config.port).await {
                Ok(logger) => Some(Arc::new(logger)),
                Err(e) => {
                    tracing::warn!("DAP audit log disabled: {e}");
                    None
                }
            },
            None => None,
        };

        Ok(Self::start(
            connection,
            Correlator::starting_at(first_seq),
            config.timeouts,
            audit,
        ))
    }

    pub(crate) fn start(
        connection: Connection,
        correlator: Correlator,
        timeouts: Timeouts,
        audit: Option<Arc<AuditLogger>>,
    ) -> Self {
        let ctx = PumpContext {
            connection: Arc::new(connection),
            correlator: Arc::new(correlator),
            bus: EventBus::default(),
            audit,
        };
        let pump = pump::spawn_read_pump(ctx.clone());
        Self {
            ctx,
            pump,
            timeouts,
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.connection.is_alive()
    }

    pub fn pending_count(&self) -> usize {
        self.ctx.correlator.pending_count()
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.ctx.bus.subscribe()
    }

    /// A subscription whose control events are never dropped.
    pub fn subscribe_lossless(&self) -> EventSubscription {
        self.ctx.bus.subscribe_lossless()
    }

    /// Writes the request and returns without waiting. The waiter is
    /// registered before the first byte goes out.
    pub async fn send_request(&self, command: &str, arguments: Value) -> Result<PendingResponse> {
        if !self.is_connected() {
            return Err(DapError::connection_lost("connection is closed"));
        }

        let seq = self.ctx.correlator.next_seq();
        let message = Message::Request(Request::new(seq, command, arguments));
        let frame = codec::encode(&message)?;

        if let Some(audit) = &self.ctx.audit {
            audit.log(Direction::Outbound, &message.to_value()?);
        }

        let waiter = self.ctx.correlator.register(seq, command);
        tracing::debug!("-> request seq={seq} command='{command}'");
        // On failure the waiter drops here and unregisters itself.
        self.ctx.connection.send(&frame).await?;

        Ok(PendingResponse { waiter })
    }

    pub async fn send_and_wait_with(
        &self,
        command: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<Response> {
        let pending = self.send_request(command, arguments).await?;
        pending.wait(deadline).await
    }

    /// `send_and_wait_with` using the configured command timeout.
    pub async fn send_and_wait(&self, command: &str, arguments: Value) -> Result<Response> {
        self.send_and_wait_with(command, arguments, self.timeouts.command)
            .await
    }

    pub async fn request<T: DeserializeOwned>(&self, command: &str, arguments: Value) -> Result<T> {
        self.send_and_wait(command, arguments).await?.body_as()
    }

    /// Waits on `subscription` for an event named `name`, discarding others.
    /// Subscribe before sending whatever triggers the event.
    pub async fn wait_for_event(
        subscription: &mut EventSubscription,
        name: &str,
        deadline: Duration,
    ) -> Result<Event> {
        with_deadline(deadline, &format!("'{name}' event"), async {
            while let Some(event) = subscription.recv().await {
                if event.event == name {
                    return Ok(event);
                }
                if event.event == CONNECTION_LOST_EVENT {
                    return Err(connection_lost_from(&event));
                }
                tracing::trace!("Skipping '{}' while waiting for '{name}'", event.event);
            }
            Err(DapError::connection_lost("event bus closed"))
        })
        .await
    }

    /// Closes the socket, stops the pump and resolves every pending request
    /// with `ConnectionLost`. Safe to call more than once.
    pub async fn close(&self) {
        if !self.ctx.connection.close().await {
            return;
        }
        self.pump.abort();

        let reason = "connection closed by client";
        let failed = self.ctx.correlator.fail_all(reason);
        if failed > 0 {
            tracing::debug!("Resolved {failed} pending request(s) on close");
        }
        self.ctx
            .bus
            .publish(Event::new(CONNECTION_LOST_EVENT, json!({ "reason": reason })));
    }
}

impl Drop for DapClient {
    fn drop(&mut self) {
        self.ctx.connection.mark_dead();
        self.pump.abort();
        self.ctx.correlator.fail_all("client dropped");
    }
}

pub(crate) fn connection_lost_from(event: &Event) -> DapError {
    let reason = event
        .body
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("connection lost");
    DapError::connection_lost(reason)
}
