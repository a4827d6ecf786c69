use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "client->server",
            Self::Inbound => "server->client",
        }
    }
}

#[derive(Debug)]
enum AuditCommand {
    Line(Vec<u8>),
    Flush(oneshot::Sender<()>),
}

/// Appends one JSON line per DAP message crossing the wire.
///
/// `log` only queues the line; a writer task owns the file, so neither the
/// read pump nor a sender ever waits on disk.
#[derive(Debug)]
pub struct AuditLogger {
    path: PathBuf,
    tx: mpsc::UnboundedSender<AuditCommand>,
}

impl AuditLogger {
    pub async fn new(dir: &Path, port: u16) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let path = dir.join(format!("dap_session_{port}_{}.jsonl", timestamp_millis()));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        tracing::info!("DAP audit log at {}", path.display());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(file, path.clone(), rx));
        Ok(Self { path, tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Failures are logged, never propagated. The audit trail must not take
    /// the session down.
    pub fn log(&self, direction: Direction, payload: &Value) {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let envelope = json!({
            "ts_ms": timestamp_millis(),
            "direction": direction.as_str(),
            "kind": kind,
            "payload": payload,
        });

        let mut line = match serde_json::to_vec(&envelope) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to serialize audit line: {e}");
                return;
            }
        };
        line.push(b'\n');

        if self.tx.send(AuditCommand::Line(line)).is_err() {
            tracing::warn!("Audit writer for {} has stopped", self.path.display());
        }
    }

    /// Resolves once every line queued before this call is on disk.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn write_lines(
    mut file: tokio::fs::File,
    path: PathBuf,
    mut rx: mpsc::UnboundedReceiver<AuditCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            AuditCommand::Line(line) => {
                if let Err(e) = file.write_all(&line).await {
                    tracing::warn!("Failed to write audit line to {}: {e}", path.display());
                }
            }
            AuditCommand::Flush(done) => {
                if let Err(e) = file.flush().await {
                    tracing::warn!("Failed to flush audit log {}: {e}", path.display());
                }
                let _ = done.send(());
            }
        }
    }
    let _ = file.flush().await;
    tracing::debug!("Audit writer for {} stopped", path.display());
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
