use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;

use crate::audit::{AuditLogger, Direction};
use crate::codec::{self, Event, Message};
use crate::connection::Connection;
use crate::correlator::Correlator;
use crate::events::{EventBus, CONNECTION_LOST_EVENT};
use crate::DapError;

/// Everything the pump dispatches into.
#[derive(Debug, Clone)]
pub(crate) struct PumpContext {
    pub connection: Arc<Connection>,
    pub correlator: Arc<Correlator>,
    pub bus: EventBus,
    pub audit: Option<Arc<AuditLogger>>,
}

pub(crate) fn spawn_read_pump(ctx: PumpContext) -> JoinHandle<()> {
    tokio::spawn(read_pump(ctx))
}

async fn read_pump(ctx: PumpContext) {
    tracing::debug!("Read pump started for {}", ctx.connection.address());
    loop {
        let message = match ctx.connection.receive_frame().await {
            Ok(frame) => codec::decode(&frame),
            Err(err) => Err(err),
        };

        let message = match message {
            Ok(message) => message,
            Err(err) => {
                announce_connection_lost(&ctx, &err);
                return;
            }
        };

        if let Some(audit) = &ctx.audit {
            if let Ok(payload) = message.to_value() {
                audit.log(Direction::Inbound, &payload);
            }
        }

        dispatch(&ctx, message);
    }
}

fn dispatch(ctx: &PumpContext, message: Message) {
    match message {
        Message::Response(response) => {
            tracing::debug!(
                "<- response seq={} request_seq={} command='{}' success={}",
                response.seq,
                response.request_seq,
                response.command,
                response.success
            );
            ctx.correlator.resolve(response);
        }
        Message::Event(event) => {
            tracing::debug!("<- event '{}'", event.event);
            ctx.bus.publish(event);
        }
        Message::Request(request) => {
            tracing::warn!(
                "Ignoring reverse request '{}' (seq {}) from the debug adapter",
                request.command,
                request.seq
            );
        }
        Message::Unknown(value) => {
            tracing::warn!("Ignoring unrecognized DAP message: {value}");
        }
    }
}

/// Marks the connection dead and tells every waiter and subscriber. Runs at
/// most once per connection, whichever of the pump or `close()` gets there
/// first.
pub(crate) fn announce_connection_lost(ctx: &PumpContext, err: &DapError) {
    if !ctx.connection.mark_dead() {
        tracing::debug!("Read pump stopping after close: {err}");
        return;
    }
    tracing::error!("DAP connection to {} lost: {err}", ctx.connection.address());

    let reason = err.to_string();
    let failed = ctx.correlator.fail_all(&reason);
    if failed > 0 {
        tracing::warn!("Resolved {failed} pending request(s) with connection loss");
    }

    let body = json!({ "reason": reason, "kind": err.kind() });
    if let Some(audit) = &ctx.audit {
        audit.log(
            Direction::Inbound,
            &json!({ "type": "event", "event": CONNECTION_LOST_EVENT, "body": body }),
        );
    }
    ctx.bus.publish(Event::new(CONNECTION_LOST_EVENT, body));
}
