use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::codec::Response;
use crate::{DapError, Result};

type PendingTable = Arc<Mutex<HashMap<u64, PendingRequest>>>;

#[derive(Debug)]
struct PendingRequest {
    command: String,
    tx: oneshot::Sender<Result<Response>>,
}

/// Sequence allocation plus the table of in-flight requests.
///
/// The table lock is a plain `std::sync::Mutex`: it is only held to insert
/// or remove one entry, never across an await, and `ResponseWaiter::drop`
/// needs to take it synchronously.
#[derive(Debug)]
pub struct Correlator {
    next_seq: AtomicU64,
    pending: PendingTable,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// First sequence number handed out will be `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next_seq: AtomicU64::new(first),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Registers a waiter for `seq`. Must happen before the request hits the
    /// wire, otherwise a fast peer could answer into an empty table.
    pub fn register(&self, seq: u64, command: &str) -> ResponseWaiter {
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(
            seq,
            PendingRequest {
                command: command.to_string(),
                tx,
            },
        );
        ResponseWaiter {
            seq,
            command: command.to_string(),
            rx,
            pending: Arc::downgrade(&self.pending),
        }
    }

    /// Routes by `request_seq`. The command name is only a sanity check:
    /// some peers answer with an empty or different command string.
    /// Returns false when nobody was waiting.
    pub fn resolve(&self, response: Response) -> bool {
        let entry = lock(&self.pending).remove(&response.request_seq);
        let Some(entry) = entry else {
            tracing::warn!(
                "Dropping response for unknown or already resolved seq {} (command '{}')",
                response.request_seq,
                response.command
            );
            return false;
        };

        if !response.command.is_empty() && response.command != entry.command {
            tracing::warn!(
                "Response for seq {} names command '{}' but request was '{}'",
                response.request_seq,
                response.command,
                entry.command
            );
        }

        if entry.tx.send(Ok(response)).is_err() {
            tracing::debug!("Waiter for '{}' went away before delivery", entry.command);
        }
        true
    }

    /// Resolves every waiter with `ConnectionLost`. Returns how many there were.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(u64, PendingRequest)> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (seq, entry) in drained {
            tracing::debug!("Failing pending seq {seq} ('{}'): {reason}", entry.command);
            let _ = entry.tx.send(Err(DapError::connection_lost(reason)));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

/// Caller side of one pending request. Dropping it unregisters the seq, so a
/// cancelled caller never leaves an orphan entry behind.
#[derive(Debug)]
pub struct ResponseWaiter {
    seq: u64,
    command: String,
    rx: oneshot::Receiver<Result<Response>>,
    pending: std::sync::Weak<Mutex<HashMap<u64, PendingRequest>>>,
}

impl ResponseWaiter {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Waits for the raw response. `success=false` is returned as-is; the
    /// client layer turns it into `DapError::Remote`.
    pub async fn wait(mut self, deadline: Duration) -> Result<Response> {
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DapError::connection_lost(format!(
                "waiter for '{}' (seq {}) was dropped",
                self.command, self.seq
            ))),
            Err(_) => {
                // Exactly one side removes the entry. If the pump already took
                // it, the response is sitting in the channel.
                if self.unregister() {
                    return Err(DapError::timeout(
                        format!("response to '{}' (seq {})", self.command, self.seq),
                        deadline,
                    ));
                }
                match self.rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(DapError::timeout(
                        format!("response to '{}' (seq {})", self.command, self.seq),
                        deadline,
                    )),
                }
            }
        }
    }

    fn unregister(&self) -> bool {
        match self.pending.upgrade() {
            Some(pending) => lock(&pending).remove(&self.seq).is_some(),
            None => false,
        }
    }
}

impl Drop for ResponseWaiter {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
